use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use bitflags::bitflags;

use super::coff::DataDirectory;

/// Module handle as the guest sees it (the image base, like an `HMODULE`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleHandle(pub u32);

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Symbol {
    Name(String),
    Ordinal(u16),
}

impl Symbol {
    pub fn name<S: Into<String>>(name: S) -> Symbol {
        Symbol::Name(name.into())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Symbol::Name(name) => f.write_str(name),
            Symbol::Ordinal(ordinal) => write!(f, "ordinal_{}", ordinal),
        }
    }
}

bitflags! {
    pub struct ModuleFlags: u32 {
        const SYSTEM = 0b0001;
        const TRACK_RESOURCES = 0b0010;
        const SYMBOLS_LOADED = 0b0100;
        const ATTACHED = 0b1000;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportEntry {
    pub name: Option<String>,
    pub ordinal: Option<u16>,
    pub function: u32,
    pub tracked_function: Option<u32>,
}

impl ExportEntry {
    /// Address to bind for an importer with the given tracking setting.
    pub fn address(&self, tracked: bool) -> u32 {
        match self.tracked_function {
            Some(addr) if tracked => addr,
            _ => self.function,
        }
    }
}

/// Export list; later additions shadow earlier ones with the same name.
#[derive(Clone, Debug, Default)]
pub struct ExportTable {
    entries: Vec<ExportEntry>,
    by_ordinal: HashMap<u16, usize>,
}

impl ExportTable {
    pub fn new() -> ExportTable {
        ExportTable::default()
    }

    pub fn add(&mut self, entry: ExportEntry) {
        if let Some(ordinal) = entry.ordinal {
            self.by_ordinal.insert(ordinal, self.entries.len());
        }
        self.entries.push(entry);
    }

    pub fn find(&self, symbol: &Symbol) -> Option<&ExportEntry> {
        match symbol {
            Symbol::Name(name) => self.entries.iter().rev().find(|e| e.name.as_deref() == Some(name.as_str())),
            Symbol::Ordinal(ordinal) => self.by_ordinal.get(ordinal).map(|&i| &self.entries[i]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExportEntry> {
        self.entries.iter().rev()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnresolvedImport {
    pub dll: String,
    pub symbol: Symbol,
    pub stub: u32,
}

pub struct LoadedModule {
    pub name: String,
    pub path: PathBuf,
    pub handle: ModuleHandle,
    /// Inclusive `[min, max]` once mapped.
    pub range: Option<(u32, u32)>,
    pub entry_point: Option<u32>,
    pub exports: ExportTable,
    pub export_directory: Option<DataDirectory>,
    /// Modules this one holds a reference on through its imports.
    pub dependencies: Vec<ModuleHandle>,
    pub unresolved: Vec<UnresolvedImport>,
    /// Regions mapped for the image, released at unload.
    pub mappings: Vec<u32>,
    pub flags: ModuleFlags,
    pub refs: u32,
}

impl LoadedModule {
    pub fn new(name: &str, path: PathBuf, handle: ModuleHandle, flags: ModuleFlags) -> LoadedModule {
        LoadedModule {
            name: name.to_owned(),
            path,
            handle,
            range: None,
            entry_point: None,
            exports: ExportTable::new(),
            export_directory: None,
            dependencies: Vec::new(),
            unresolved: Vec::new(),
            mappings: Vec::new(),
            flags,
            refs: 1,
        }
    }

    #[inline]
    pub fn is_system(&self) -> bool {
        self.flags.contains(ModuleFlags::SYSTEM)
    }

    #[inline]
    pub fn tracks_resources(&self) -> bool {
        self.flags.contains(ModuleFlags::TRACK_RESOURCES)
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.range.map_or(false, |(min, max)| addr >= min && addr <= max)
    }
}
