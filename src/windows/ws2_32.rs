use byte_slice_cast::AsByteSlice;

use super::*;
use crate::runtime::host::Socket;

const WSAENOTSOCK: u32 = 10038;
const SOCKET_ERROR: u32 = 0xffff_ffff;
const INVALID_SOCKET: u32 = 0xffff_ffff;

/// Highest Winsock version offered, `MAKEWORD(2, 2)`.
const WINSOCK_VERSION: u16 = 0x0202;
const WSA_DESCRIPTION: &[u8] = b"WinSock 2.0\0";

pub(super) fn library() -> EmuLibrary {
    EmuLibrary {
        name: "ws2_32.dll",
        functions: vec![
            EmuFunction::stdcall("closesocket", 1, closesocket).with_ordinal(3).tracked(),
            EmuFunction::stdcall("socket", 3, socket).with_ordinal(23).tracked(),
            EmuFunction::stdcall("WSAStartup", 2, wsa_startup).with_ordinal(115),
            EmuFunction::stdcall("WSACleanup", 0, wsa_cleanup).with_ordinal(116),
        ],
    }
}

fn closesocket(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let socket = call.arg(0);
    m.tracker.untrack_socket(call.caller, socket);
    if m.host.sockets.remove(&socket).is_some() {
        Ok(0)
    } else {
        m.last_error = WSAENOTSOCK;
        Ok(SOCKET_ERROR)
    }
}

fn socket(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let socket = Socket { family: call.arg(0), kind: call.arg(1), protocol: call.arg(2) };
    if socket.family == 0 {
        return Ok(INVALID_SOCKET);
    }
    let handle = m.host.open_socket(socket);
    if call.tracked {
        m.tracker.track_socket(call.caller, handle);
    }
    Ok(handle)
}

/* WSADATA: wVersion, wHighVersion, szDescription[257] ... */
fn wsa_startup(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let requested = call.arg(0) as u16;
    let data = call.arg(1);
    if data != 0 {
        let versions = [requested.min(WINSOCK_VERSION), WINSOCK_VERSION];
        m.cpu.write(data, versions.as_byte_slice())?;
        m.cpu.write(data + 4, WSA_DESCRIPTION)?;
    }
    Ok(0)
}

fn wsa_cleanup(_m: &mut Machine, _call: &ApiCall) -> Result<u32> {
    Ok(0)
}
