//! Host-side objects behind the handles emulated APIs give out.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// First handle value given out; multiples of four like real kernel handles.
const FIRST_HANDLE: u32 = 0x100;
/// 0..2 are the standard streams.
const FIRST_DESCRIPTOR: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Socket {
    pub family: u32,
    pub kind: u32,
    pub protocol: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CriticalSection {
    pub owner: u32,
    pub recursion: u32,
}

#[derive(Debug, Default)]
pub struct PrivateHeap {
    pub blocks: BTreeSet<u32>,
}

/// Open host objects, for inspection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostCounts {
    pub files: usize,
    pub sockets: usize,
    pub critical_sections: usize,
    pub heaps: usize,
}

pub struct HostObjects {
    next_handle: u32,
    next_descriptor: u32,
    /// kernel32 file handles
    pub files: HashMap<u32, File>,
    /// CRT descriptors
    pub descriptors: HashMap<u32, File>,
    /// CRT streams, keyed by the guest `FILE` block
    pub streams: HashMap<u32, File>,
    pub sockets: HashMap<u32, Socket>,
    /// keyed by the guest `CRITICAL_SECTION` address
    pub critical_sections: HashMap<u32, CriticalSection>,
    pub heaps: HashMap<u32, PrivateHeap>,
}

impl Default for HostObjects {
    fn default() -> Self {
        HostObjects::new()
    }
}

impl HostObjects {
    pub fn new() -> HostObjects {
        HostObjects {
            next_handle: FIRST_HANDLE,
            next_descriptor: FIRST_DESCRIPTOR,
            files: HashMap::new(),
            descriptors: HashMap::new(),
            streams: HashMap::new(),
            sockets: HashMap::new(),
            critical_sections: HashMap::new(),
            heaps: HashMap::new(),
        }
    }

    pub fn new_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 4;
        handle
    }

    pub fn open_file(&mut self, file: File) -> u32 {
        let handle = self.new_handle();
        self.files.insert(handle, file);
        handle
    }

    pub fn open_descriptor(&mut self, file: File) -> u32 {
        let fd = self.next_descriptor;
        self.next_descriptor += 1;
        self.descriptors.insert(fd, file);
        fd
    }

    pub fn open_socket(&mut self, socket: Socket) -> u32 {
        let handle = self.new_handle();
        self.sockets.insert(handle, socket);
        handle
    }

    pub fn create_heap(&mut self) -> u32 {
        let handle = self.new_handle();
        self.heaps.insert(handle, PrivateHeap::default());
        handle
    }

    pub fn counts(&self) -> HostCounts {
        HostCounts {
            files: self.files.len() + self.descriptors.len() + self.streams.len(),
            sockets: self.sockets.len(),
            critical_sections: self.critical_sections.len(),
            heaps: self.heaps.len(),
        }
    }
}

/// Maps a guest path onto the host: `\` becomes `/`, a drive prefix is
/// dropped and relative paths are anchored at `root`.
pub fn host_path(guest: &str, root: Option<&Path>) -> PathBuf {
    let mut path = guest.replace('\\', "/");
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        path = path[2..].to_owned();
    }
    let relative = path.trim_start_matches('/');
    match root {
        Some(root) => root.join(relative),
        None if path.starts_with('/') => PathBuf::from(path),
        None => PathBuf::from(relative),
    }
}

/// `fopen` mode string to open options; `None` for an unknown mode.
pub fn stream_options(mode: &str) -> Option<OpenOptions> {
    let mut options = OpenOptions::new();
    let plus = mode.contains('+');
    match mode.chars().next()? {
        'r' => options.read(true).write(plus),
        'w' => options.write(true).create(true).truncate(true).read(plus),
        'a' => options.append(true).create(true).read(plus),
        _ => return None,
    };
    Some(options)
}

pub const O_WRONLY: u32 = 0x0001;
pub const O_RDWR: u32 = 0x0002;
pub const O_APPEND: u32 = 0x0008;
pub const O_CREAT: u32 = 0x0100;
pub const O_TRUNC: u32 = 0x0200;
pub const O_EXCL: u32 = 0x0400;

/// `_open` flags to open options.
pub fn descriptor_options(flags: u32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & 3 {
        O_WRONLY => options.write(true),
        O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    if flags & O_APPEND != 0 {
        options.append(true);
    }
    if flags & O_EXCL != 0 && flags & O_CREAT != 0 {
        options.create_new(true);
    } else if flags & O_CREAT != 0 {
        options.create(true);
    }
    if flags & O_TRUNC != 0 {
        options.truncate(true);
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_paths_land_under_the_root() {
        let root = Path::new("/srv/guest");
        assert_eq!(host_path("C:\\media\\clip.avi", Some(root)), PathBuf::from("/srv/guest/media/clip.avi"));
        assert_eq!(host_path("codecs\\x.ini", Some(root)), PathBuf::from("/srv/guest/codecs/x.ini"));
        assert_eq!(host_path("/tmp/a.bin", None), PathBuf::from("/tmp/a.bin"));
        assert_eq!(host_path("d:\\b.bin", None), PathBuf::from("/b.bin"));
    }

    #[test]
    fn handles_are_distinct() {
        let mut host = HostObjects::new();
        let a = host.open_socket(Socket { family: 2, kind: 1, protocol: 0 });
        let b = host.create_heap();
        assert_ne!(a, b);
        assert_eq!(a % 4, 0);
        assert_eq!(host.counts(), HostCounts { files: 0, sockets: 1, critical_sections: 0, heaps: 1 });
    }

    #[test]
    fn unknown_stream_mode() {
        assert!(stream_options("rb").is_some());
        assert!(stream_options("x").is_none());
        assert!(stream_options("").is_none());
    }
}
