//! Emulated Win32 libraries.
//!
//! Each library is a static table of `(name, ordinal, convention, argument
//! count, handler, tracks)`. Entries with `tracks` set get a second thunk
//! whose handler calls record the acquired resource against the calling
//! module; modules loaded with tracking enabled are bound to that variant.

pub(crate) mod kernel32;
mod msvcrt;
mod ws2_32;

use std::cmp::min;

use log::warn;

use crate::errors::Result;
use crate::runtime::{ApiCall, Machine};

pub type Handler = fn(&mut Machine, &ApiCall) -> Result<u32>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallConv {
    /// callee pops the arguments
    Stdcall,
    Cdecl,
}

pub struct EmuFunction {
    pub name: &'static str,
    pub ordinal: Option<u16>,
    pub conv: CallConv,
    pub argc: u32,
    pub handler: Handler,
    /// has a tracked variant
    pub tracks: bool,
}

impl EmuFunction {
    pub fn stdcall(name: &'static str, argc: u32, handler: Handler) -> EmuFunction {
        EmuFunction { name, ordinal: None, conv: CallConv::Stdcall, argc, handler, tracks: false }
    }

    pub fn cdecl(name: &'static str, argc: u32, handler: Handler) -> EmuFunction {
        EmuFunction { name, ordinal: None, conv: CallConv::Cdecl, argc, handler, tracks: false }
    }

    pub fn tracked(self) -> EmuFunction {
        EmuFunction { tracks: true, ..self }
    }

    pub fn with_ordinal(self, ordinal: u16) -> EmuFunction {
        EmuFunction { ordinal: Some(ordinal), ..self }
    }
}

pub struct EmuLibrary {
    pub name: &'static str,
    pub functions: Vec<EmuFunction>,
}

lazy_static! {
    static ref LIBRARIES: Vec<EmuLibrary> = vec![kernel32::library(), msvcrt::library(), ws2_32::library()];
}

/// Emulated library registered under the canonical `name`.
pub fn library(name: &str) -> Option<&'static EmuLibrary> {
    LIBRARIES.iter().find(|l| l.name.eq_ignore_ascii_case(name))
}

pub(crate) const ERROR_FILE_NOT_FOUND: u32 = 2;
pub(crate) const ERROR_ACCESS_DENIED: u32 = 5;
pub(crate) const ERROR_INVALID_HANDLE: u32 = 6;
pub(crate) const ERROR_NOT_ENOUGH_MEMORY: u32 = 8;
pub(crate) const ERROR_FILE_EXISTS: u32 = 80;
pub(crate) const ERROR_INVALID_PARAMETER: u32 = 87;

pub(crate) fn io_error_code(e: &std::io::Error) -> u32 {
    match e.kind() {
        std::io::ErrorKind::NotFound => ERROR_FILE_NOT_FOUND,
        std::io::ErrorKind::PermissionDenied => ERROR_ACCESS_DENIED,
        std::io::ErrorKind::AlreadyExists => ERROR_FILE_EXISTS,
        _ => ERROR_INVALID_PARAMETER,
    }
}

/* 堆操作, kernel32 与 msvcrt 共用. heap 为 None 时是进程堆 */

pub(crate) fn heap_alloc(m: &mut Machine, call: &ApiCall, heap: Option<u32>, size: u32, zero: bool) -> Result<u32> {
    if let Some(heap) = heap {
        if !m.host.heaps.contains_key(&heap) {
            m.last_error = ERROR_INVALID_HANDLE;
            return Ok(0);
        }
    }
    let addr = match m.alloc(size) {
        Ok(addr) => addr,
        Err(e) => {
            warn!("[-] Allocation of 0x{:x} bytes failed: {}", size, e);
            m.last_error = ERROR_NOT_ENOUGH_MEMORY;
            return Ok(0);
        }
    };
    if zero {
        m.cpu.patch(addr, &vec![0; size as usize])?;
    }
    if let Some(private) = heap.and_then(|h| m.host.heaps.get_mut(&h)) {
        private.blocks.insert(addr);
    }
    if call.tracked {
        m.tracker.track_heap(call.caller, addr, size, heap);
    }
    Ok(addr)
}

pub(crate) fn heap_free(m: &mut Machine, call: &ApiCall, addr: u32) -> bool {
    if addr == 0 {
        return true;
    }
    m.tracker.untrack_heap(call.caller, addr);
    for private in m.host.heaps.values_mut() {
        private.blocks.remove(&addr);
    }
    m.free(addr)
}

/// Grows in place when the block is big enough, otherwise moves it.
pub(crate) fn heap_realloc(
    m: &mut Machine,
    call: &ApiCall,
    heap: Option<u32>,
    addr: u32,
    size: u32,
    zero: bool,
) -> Result<u32> {
    if addr == 0 {
        return heap_alloc(m, call, heap, size, zero);
    }
    let capacity = match m.heap.size(addr) {
        Some(capacity) => capacity,
        None => {
            m.last_error = ERROR_INVALID_HANDLE;
            return Ok(0);
        }
    };
    let new = if size <= capacity {
        addr
    } else {
        let new = match m.alloc(size) {
            Ok(new) => new,
            Err(_) => {
                m.last_error = ERROR_NOT_ENOUGH_MEMORY;
                return Ok(0);
            }
        };
        let bytes = m.cpu.snapshot(addr, min(capacity, size));
        m.cpu.patch(new, &bytes)?;
        if zero {
            m.cpu.patch(new + capacity, &vec![0; (size - capacity) as usize])?;
        }
        m.free(addr);
        for private in m.host.heaps.values_mut() {
            if private.blocks.remove(&addr) {
                private.blocks.insert(new);
            }
        }
        new
    };
    if call.tracked {
        m.tracker.track_realloc(call.caller, addr, new, size, heap);
    } else if new != addr {
        m.tracker.move_heap(call.caller, addr, new, size);
    }
    Ok(new)
}

/// Usable size of a heap block, `None` when `addr` is not live.
pub(crate) fn heap_size(m: &Machine, addr: u32) -> Option<u32> {
    m.heap.size(addr)
}
