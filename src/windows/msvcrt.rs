use std::io::{Read, Write};

use log::debug;

use super::*;
use crate::runtime::host::{descriptor_options, host_path, stream_options};
use crate::tracker::FileKind;

/// Guest bytes behind a `FILE *`; only its address matters.
const FILE_BLOCK: u32 = 0x20;
const EOF: u32 = 0xffff_ffff;

pub(super) fn library() -> EmuLibrary {
    EmuLibrary {
        name: "msvcrt.dll",
        functions: vec![
            EmuFunction::cdecl("malloc", 1, malloc).tracked(),
            EmuFunction::cdecl("calloc", 2, calloc).tracked(),
            EmuFunction::cdecl("realloc", 2, realloc).tracked(),
            EmuFunction::cdecl("free", 1, free).tracked(),
            EmuFunction::cdecl("_msize", 1, msize),
            EmuFunction::cdecl("fopen", 2, fopen).tracked(),
            EmuFunction::cdecl("fread", 4, fread),
            EmuFunction::cdecl("fwrite", 4, fwrite),
            EmuFunction::cdecl("fclose", 1, fclose).tracked(),
            EmuFunction::cdecl("_open", 3, open).tracked(),
            EmuFunction::cdecl("_read", 3, read),
            EmuFunction::cdecl("_write", 3, write),
            EmuFunction::cdecl("_close", 1, close).tracked(),
        ],
    }
}

fn malloc(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    heap_alloc(m, call, None, call.arg(0), false)
}

fn calloc(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    match call.arg(0).checked_mul(call.arg(1)) {
        Some(size) => heap_alloc(m, call, None, size, true),
        None => Ok(0),
    }
}

fn realloc(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let (addr, size) = (call.arg(0), call.arg(1));
    if addr != 0 && size == 0 {
        heap_free(m, call, addr);
        return Ok(0);
    }
    heap_realloc(m, call, None, addr, size, false)
}

fn free(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    heap_free(m, call, call.arg(0));
    Ok(0)
}

fn msize(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    Ok(heap_size(m, call.arg(0)).unwrap_or(u32::MAX))
}

/* FILE * 流 */

fn fopen(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let name = m.cpu.read_cstring(call.arg(0), 260)?;
    let mode = m.cpu.read_cstring(call.arg(1), 16)?;
    let options = match stream_options(&mode) {
        Some(options) => options,
        None => return Ok(0),
    };
    let path = host_path(&name, m.config.file_root.as_deref());
    let file = match options.open(&path) {
        Ok(file) => file,
        Err(e) => {
            debug!("[*] fopen({}, {}) failed: {}", path.display(), mode, e);
            m.last_error = io_error_code(&e);
            return Ok(0);
        }
    };
    let stream = m.alloc(FILE_BLOCK)?;
    m.host.streams.insert(stream, file);
    if call.tracked {
        m.tracker.track_file(call.caller, stream, FileKind::Stream);
    }
    Ok(stream)
}

fn fread(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let (buffer, size, count, stream) = (call.arg(0), call.arg(1), call.arg(2), call.arg(3));
    let total = match size.checked_mul(count) {
        Some(total) if size != 0 => total,
        _ => return Ok(0),
    };
    let file = match m.host.streams.get_mut(&stream) {
        Some(file) => file,
        None => return Ok(0),
    };
    let mut data = Vec::with_capacity(total as usize);
    if Read::take(file, total as u64).read_to_end(&mut data).is_err() {
        return Ok(0);
    }
    m.cpu.write(buffer, &data)?;
    Ok(data.len() as u32 / size)
}

fn fwrite(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let (buffer, size, count, stream) = (call.arg(0), call.arg(1), call.arg(2), call.arg(3));
    let total = match size.checked_mul(count) {
        Some(total) if size != 0 => total,
        _ => return Ok(0),
    };
    let data = m.cpu.read_vec(buffer, total as usize)?;
    let written = match m.host.streams.get_mut(&stream) {
        Some(file) => file.write_all(&data).is_ok(),
        None => false,
    };
    Ok(if written { count } else { 0 })
}

fn fclose(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let stream = call.arg(0);
    m.tracker.untrack_file(call.caller, stream);
    if m.close_stream(stream) {
        Ok(0)
    } else {
        Ok(EOF)
    }
}

/* 低级 I/O */

fn open(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let name = m.cpu.read_cstring(call.arg(0), 260)?;
    let path = host_path(&name, m.config.file_root.as_deref());
    match descriptor_options(call.arg(1)).open(&path) {
        Ok(file) => {
            let fd = m.host.open_descriptor(file);
            if call.tracked {
                m.tracker.track_file(call.caller, fd, FileKind::Descriptor);
            }
            Ok(fd)
        }
        Err(e) => {
            debug!("[*] _open({}) failed: {}", path.display(), e);
            Ok(EOF)
        }
    }
}

fn read(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let (fd, buffer, len) = (call.arg(0), call.arg(1), call.arg(2));
    let file = match m.host.descriptors.get_mut(&fd) {
        Some(file) => file,
        None => return Ok(EOF),
    };
    let mut data = vec![0; len as usize];
    let n = match file.read(&mut data) {
        Ok(n) => n,
        Err(_) => return Ok(EOF),
    };
    m.cpu.write(buffer, &data[..n])?;
    Ok(n as u32)
}

fn write(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let (fd, buffer, len) = (call.arg(0), call.arg(1), call.arg(2));
    let data = m.cpu.read_vec(buffer, len as usize)?;
    let written = match m.host.descriptors.get_mut(&fd) {
        Some(file) => file.write_all(&data).is_ok(),
        None => false,
    };
    Ok(if written { len } else { EOF })
}

fn close(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let fd = call.arg(0);
    m.tracker.untrack_file(call.caller, fd);
    if m.host.descriptors.remove(&fd).is_some() {
        Ok(0)
    } else {
        Ok(EOF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoaderConfig;

    #[test]
    fn malloc_of_the_whole_address_space_returns_null() {
        let mut m = Machine::new(LoaderConfig::new()).unwrap();
        let call = ApiCall { caller: 0, args: vec![0xffff_ffff], tracked: false };
        assert_eq!(malloc(&mut m, &call).unwrap(), 0);
        let call = ApiCall { caller: 0, args: vec![0x10], tracked: false };
        assert_ne!(malloc(&mut m, &call).unwrap(), 0);
    }
}
