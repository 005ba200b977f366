use std::fs::OpenOptions;
use std::io::{Read, Write};

use log::{debug, warn};

use super::*;
use crate::cpu::Protection;
use crate::errors::ErrorKind;
use crate::loader::search::canonical_name;
use crate::loader::{ModuleHandle, Symbol};
use crate::runtime::host::{host_path, CriticalSection};
use crate::tracker::FileKind;

const ERROR_PROC_NOT_FOUND: u32 = 127;
const ERROR_MOD_NOT_FOUND: u32 = 126;
const ERROR_INVALID_ADDRESS: u32 = 487;

/// `GetProcessHeap()`; never a real host handle.
pub(crate) const PROCESS_HEAP: u32 = 0x0001_0000;
pub(crate) const MAIN_THREAD_ID: u32 = 0x0000_1000;
pub(crate) const PROCESS_ID: u32 = 0x0000_0400;

const HEAP_ZERO_MEMORY: u32 = 0x0000_0008;

const MEM_DECOMMIT: u32 = 0x4000;
const MEM_RELEASE: u32 = 0x8000;

const PAGE_NOACCESS: u32 = 0x01;
const PAGE_READONLY: u32 = 0x02;
const PAGE_READWRITE: u32 = 0x04;
const PAGE_EXECUTE: u32 = 0x10;
const PAGE_EXECUTE_READ: u32 = 0x20;
const PAGE_EXECUTE_READWRITE: u32 = 0x40;

const GENERIC_READ: u32 = 0x8000_0000;
const GENERIC_WRITE: u32 = 0x4000_0000;

const CREATE_NEW: u32 = 1;
const CREATE_ALWAYS: u32 = 2;
const OPEN_EXISTING: u32 = 3;
const OPEN_ALWAYS: u32 = 4;
const TRUNCATE_EXISTING: u32 = 5;

pub(crate) const INVALID_HANDLE_VALUE: u32 = 0xffff_ffff;

pub(super) fn library() -> EmuLibrary {
    EmuLibrary {
        name: "kernel32.dll",
        functions: vec![
            EmuFunction::stdcall("LoadLibraryA", 1, load_library_a).tracked(),
            EmuFunction::stdcall("LoadLibraryW", 1, load_library_w).tracked(),
            EmuFunction::stdcall("FreeLibrary", 1, free_library).tracked(),
            EmuFunction::stdcall("GetProcAddress", 2, get_proc_address),
            EmuFunction::stdcall("GetModuleHandleA", 1, get_module_handle_a),
            EmuFunction::stdcall("GetProcessHeap", 0, get_process_heap),
            EmuFunction::stdcall("HeapCreate", 3, heap_create).tracked(),
            EmuFunction::stdcall("HeapDestroy", 1, heap_destroy).tracked(),
            EmuFunction::stdcall("HeapAlloc", 3, heap_alloc).tracked(),
            EmuFunction::stdcall("HeapFree", 3, heap_free).tracked(),
            EmuFunction::stdcall("HeapReAlloc", 4, heap_realloc).tracked(),
            EmuFunction::stdcall("HeapSize", 3, heap_size),
            EmuFunction::stdcall("VirtualAlloc", 4, virtual_alloc).tracked(),
            EmuFunction::stdcall("VirtualFree", 3, virtual_free).tracked(),
            EmuFunction::stdcall("CreateFileA", 7, create_file_a).tracked(),
            EmuFunction::stdcall("CreateFileW", 7, create_file_w).tracked(),
            EmuFunction::stdcall("ReadFile", 5, read_file),
            EmuFunction::stdcall("WriteFile", 5, write_file),
            EmuFunction::stdcall("CloseHandle", 1, close_handle).tracked(),
            EmuFunction::stdcall("InitializeCriticalSection", 1, initialize_critical_section).tracked(),
            EmuFunction::stdcall("EnterCriticalSection", 1, enter_critical_section),
            EmuFunction::stdcall("LeaveCriticalSection", 1, leave_critical_section),
            EmuFunction::stdcall("DeleteCriticalSection", 1, delete_critical_section).tracked(),
            EmuFunction::stdcall("GetLastError", 0, get_last_error),
            EmuFunction::stdcall("SetLastError", 1, set_last_error),
            EmuFunction::stdcall("GetCurrentThreadId", 0, get_current_thread_id),
            EmuFunction::stdcall("GetCurrentProcessId", 0, get_current_process_id),
        ],
    }
}

/* 模块 */

fn load_library(m: &mut Machine, call: &ApiCall, name: &str) -> Result<u32> {
    // relative names are searched next to the calling module first
    let referencing = m
        .owner_of(call.caller)
        .and_then(|owner| m.registry.get(owner))
        .map(|module| module.path.clone());
    match m.load_module(name, referencing.as_deref()) {
        Ok(handle) => {
            let system = m.registry.get(handle).map_or(true, |module| module.is_system());
            if call.tracked && !system {
                m.tracker.track_library(call.caller, handle.0);
            }
            Ok(handle.0)
        }
        Err(e) => {
            warn!("[-] LoadLibrary({}) failed: {}", name, e);
            m.last_error = ERROR_MOD_NOT_FOUND;
            Ok(0)
        }
    }
}

fn load_library_a(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let name = m.cpu.read_cstring(call.arg(0), 260)?;
    load_library(m, call, &name)
}

fn load_library_w(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let name = m.cpu.read_wstring(call.arg(0), 260)?;
    load_library(m, call, &name)
}

fn free_library(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let handle = ModuleHandle(call.arg(0));
    m.tracker.untrack_library(call.caller, handle.0);
    if m.registry.get(handle).is_none() {
        m.last_error = ERROR_INVALID_HANDLE;
        return Ok(0);
    }
    for report in m.release_module(handle) {
        debug!("[*] FreeLibrary unloaded {} ({} leaks)", report.module, report.total_count());
    }
    Ok(1)
}

fn get_proc_address(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let handle = ModuleHandle(call.arg(0));
    let symbol = if call.arg(1) < 0x1_0000 {
        Symbol::Ordinal(call.arg(1) as u16)
    } else {
        Symbol::name(m.cpu.read_cstring(call.arg(1), 260)?)
    };
    let tracked = m.tracks_caller(call.caller);
    match m.find_export(handle, &symbol, tracked) {
        Some(addr) => Ok(addr),
        None => {
            debug!("[*] GetProcAddress({}, {}) not found", handle, symbol);
            m.last_error = ERROR_PROC_NOT_FOUND;
            Ok(0)
        }
    }
}

fn get_module_handle_a(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    if call.arg(0) == 0 {
        return Ok(m.owner_of(call.caller).map_or(0, |owner| owner.0));
    }
    let name = m.cpu.read_cstring(call.arg(0), 260)?;
    match m.registry.find(&canonical_name(&name)) {
        Some(handle) => Ok(handle.0),
        None => {
            m.last_error = ERROR_MOD_NOT_FOUND;
            Ok(0)
        }
    }
}

/* 堆 */

fn private_heap(heap: u32) -> Option<u32> {
    if heap == PROCESS_HEAP {
        None
    } else {
        Some(heap)
    }
}

fn get_process_heap(_m: &mut Machine, _call: &ApiCall) -> Result<u32> {
    Ok(PROCESS_HEAP)
}

fn heap_create(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let heap = m.host.create_heap();
    if call.tracked {
        m.tracker.track_heap_object(call.caller, heap);
    }
    Ok(heap)
}

fn heap_destroy(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let heap = call.arg(0);
    m.tracker.untrack_heap_object(call.caller, heap);
    if m.destroy_heap(heap) {
        Ok(1)
    } else {
        m.last_error = ERROR_INVALID_HANDLE;
        Ok(0)
    }
}

fn heap_alloc(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let zero = call.arg(1) & HEAP_ZERO_MEMORY != 0;
    super::heap_alloc(m, call, private_heap(call.arg(0)), call.arg(2), zero)
}

fn heap_free(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    Ok(super::heap_free(m, call, call.arg(2)) as u32)
}

fn heap_realloc(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let zero = call.arg(1) & HEAP_ZERO_MEMORY != 0;
    super::heap_realloc(m, call, private_heap(call.arg(0)), call.arg(2), call.arg(3), zero)
}

fn heap_size(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    Ok(super::heap_size(m, call.arg(2)).unwrap_or(u32::MAX))
}

/* 虚拟内存 */

fn page_protection(protect: u32) -> Option<Protection> {
    let prot = match protect & 0xff {
        PAGE_NOACCESS => Protection::empty(),
        PAGE_READONLY => Protection::READ,
        PAGE_READWRITE => Protection::READ | Protection::WRITE,
        PAGE_EXECUTE => Protection::EXEC,
        PAGE_EXECUTE_READ => Protection::READ | Protection::EXEC,
        PAGE_EXECUTE_READWRITE => Protection::ALL,
        _ => return None,
    };
    Some(prot)
}

fn virtual_alloc(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let (addr, size, protect) = (call.arg(0), call.arg(1), call.arg(3));
    let prot = match page_protection(protect) {
        Some(prot) => prot,
        None => {
            m.last_error = ERROR_INVALID_PARAMETER;
            return Ok(0);
        }
    };
    // committing a region reserved earlier
    if addr != 0 && m.vmem.size(addr & !0xfff).is_some() {
        return Ok(addr);
    }
    match m.alloc_virtual(addr, size, prot) {
        Ok(base) => {
            if call.tracked {
                let size = m.vmem.size(base).unwrap_or(size);
                m.tracker.track_virtual(call.caller, base, size);
            }
            Ok(base)
        }
        Err(e) => {
            debug!("[*] VirtualAlloc(0x{:08x}, 0x{:x}) failed: {}", addr, size, e);
            m.last_error = match e.kind() {
                ErrorKind::MapConflict(..) => ERROR_INVALID_ADDRESS,
                _ => ERROR_NOT_ENOUGH_MEMORY,
            };
            Ok(0)
        }
    }
}

fn virtual_free(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let (addr, kind) = (call.arg(0), call.arg(2));
    if kind & MEM_RELEASE != 0 {
        m.tracker.untrack_virtual(call.caller, addr);
        if m.free_virtual(addr) {
            return Ok(1);
        }
        m.last_error = ERROR_INVALID_ADDRESS;
        return Ok(0);
    }
    // pages stay mapped
    Ok((kind & MEM_DECOMMIT != 0) as u32)
}

/* 文件 */

fn create_file(m: &mut Machine, call: &ApiCall, name: &str) -> Result<u32> {
    let (access, disposition) = (call.arg(1), call.arg(4));
    let mut options = OpenOptions::new();
    options.read(access & GENERIC_READ != 0 || access & GENERIC_WRITE == 0);
    options.write(access & GENERIC_WRITE != 0);
    match disposition {
        CREATE_NEW => options.create_new(true),
        CREATE_ALWAYS => options.create(true).truncate(true),
        OPEN_EXISTING => &mut options,
        OPEN_ALWAYS => options.create(true),
        TRUNCATE_EXISTING => options.truncate(true),
        _ => {
            m.last_error = ERROR_INVALID_PARAMETER;
            return Ok(INVALID_HANDLE_VALUE);
        }
    };
    let path = host_path(name, m.config.file_root.as_deref());
    match options.open(&path) {
        Ok(file) => {
            let handle = m.host.open_file(file);
            if call.tracked {
                m.tracker.track_file(call.caller, handle, FileKind::Native);
            }
            Ok(handle)
        }
        Err(e) => {
            debug!("[*] CreateFile({}) failed: {}", path.display(), e);
            m.last_error = io_error_code(&e);
            Ok(INVALID_HANDLE_VALUE)
        }
    }
}

fn create_file_a(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let name = m.cpu.read_cstring(call.arg(0), 260)?;
    create_file(m, call, &name)
}

fn create_file_w(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let name = m.cpu.read_wstring(call.arg(0), 260)?;
    create_file(m, call, &name)
}

fn read_file(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let (handle, buffer, len, read) = (call.arg(0), call.arg(1), call.arg(2), call.arg(3));
    let file = match m.host.files.get_mut(&handle) {
        Some(file) => file,
        None => {
            m.last_error = ERROR_INVALID_HANDLE;
            return Ok(0);
        }
    };
    let mut data = Vec::with_capacity(len as usize);
    if let Err(e) = Read::take(file, len as u64).read_to_end(&mut data) {
        m.last_error = io_error_code(&e);
        return Ok(0);
    }
    m.cpu.write(buffer, &data)?;
    if read != 0 {
        m.cpu.write_u32(read, data.len() as u32)?;
    }
    Ok(1)
}

fn write_file(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let (handle, buffer, len, written) = (call.arg(0), call.arg(1), call.arg(2), call.arg(3));
    let data = m.cpu.read_vec(buffer, len as usize)?;
    let file = match m.host.files.get_mut(&handle) {
        Some(file) => file,
        None => {
            m.last_error = ERROR_INVALID_HANDLE;
            return Ok(0);
        }
    };
    if let Err(e) = file.write_all(&data) {
        m.last_error = io_error_code(&e);
        return Ok(0);
    }
    if written != 0 {
        m.cpu.write_u32(written, len)?;
    }
    Ok(1)
}

fn close_handle(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let handle = call.arg(0);
    m.tracker.untrack_file(call.caller, handle);
    if m.host.files.remove(&handle).is_some() {
        Ok(1)
    } else {
        m.last_error = ERROR_INVALID_HANDLE;
        Ok(0)
    }
}

/* 临界区: 只有一个 guest 线程, 记录所有者和递归次数即可 */

fn initialize_critical_section(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let section = call.arg(0);
    m.host.critical_sections.insert(section, CriticalSection::default());
    if call.tracked {
        m.tracker.track_critical_section(call.caller, section);
    }
    Ok(0)
}

/// Sections that were never initialised are ignored, as in `leave`.
fn enter_critical_section(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    if let Some(section) = m.host.critical_sections.get_mut(&call.arg(0)) {
        section.owner = MAIN_THREAD_ID;
        section.recursion += 1;
    }
    Ok(0)
}

fn leave_critical_section(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    if let Some(section) = m.host.critical_sections.get_mut(&call.arg(0)) {
        section.recursion = section.recursion.saturating_sub(1);
        if section.recursion == 0 {
            section.owner = 0;
        }
    }
    Ok(0)
}

fn delete_critical_section(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let section = call.arg(0);
    m.tracker.untrack_critical_section(call.caller, section);
    m.host.critical_sections.remove(&section);
    Ok(0)
}

/* 线程状态 */

fn get_last_error(m: &mut Machine, _call: &ApiCall) -> Result<u32> {
    Ok(m.last_error)
}

fn set_last_error(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    m.last_error = call.arg(0);
    Ok(0)
}

fn get_current_thread_id(_m: &mut Machine, _call: &ApiCall) -> Result<u32> {
    Ok(MAIN_THREAD_ID)
}

fn get_current_process_id(_m: &mut Machine, _call: &ApiCall) -> Result<u32> {
    Ok(PROCESS_ID)
}
