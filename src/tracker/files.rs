use std::fmt;

use super::{Category, DllTracker};
use crate::loader::ModuleHandle;

/// How a tracked file was opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    /// kernel32 `HANDLE` from `CreateFile`.
    Native,
    /// Emulated C runtime descriptor from `_open`.
    Descriptor,
    /// Emulated C runtime `FILE*` from `fopen`.
    Stream,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            FileKind::Native => "file handle",
            FileKind::Descriptor => "file descriptor",
            FileKind::Stream => "file stream",
        })
    }
}

impl DllTracker {
    pub fn track_file(&mut self, caller: u32, handle: u32, kind: FileKind) -> Option<ModuleHandle> {
        self.track_with(caller, handle, kind, Category::File, |info| &mut info.files)
    }

    pub fn untrack_file(&mut self, caller: u32, handle: u32) -> Option<FileKind> {
        self.untrack_with(caller, handle, Category::File, |info| &mut info.files)
            .map(|(_, entry)| entry.meta)
    }
}
