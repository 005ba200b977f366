//! The loader runtime.
//!
//! [`Runtime`] is the one object a host creates. It owns a [`Machine`]
//! behind a single lock, so every load, unload, lookup, call and tracking
//! operation is serialised. The host must not unload a module while another
//! thread is still calling into it.

mod exec;
pub mod host;
mod machine;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::LoaderConfig;
use crate::cpu::Fault;
use crate::errors::{ErrorKind, Result};
use crate::loader::coff::ImageParser;
use crate::loader::{ExportEntry, ModuleHandle, Symbol, UnresolvedImport, X86Trampolines};
use crate::tracker::{LeakReport, ResourceCounts};

pub use self::exec::{ApiCall, ThunkTable};
pub use self::host::HostCounts;
pub use self::machine::Machine;

pub const STACK_BASE: u32 = 0x0010_0000;
pub const STACK_SIZE: u32 = 0x0010_0000;
pub const STACK_TOP: u32 = STACK_BASE + STACK_SIZE - 0x100;
pub const IMAGE_BASE: u32 = 0x1000_0000;
pub const IMAGE_END: u32 = 0x5000_0000;
pub const IMAGE_GRANULARITY: u32 = 0x1_0000;
pub const HEAP_BASE: u32 = 0x5000_0000;
pub const HEAP_END: u32 = 0x6000_0000;
pub const VMEM_BASE: u32 = 0x6000_0000;
pub const VMEM_END: u32 = 0x7f00_0000;
pub const THUNK_BASE: u32 = 0x7f00_0000;
pub const THUNK_SIZE: u32 = 0x1_0000;
pub const TEB_ADDRESS: u32 = 0x7ffd_e000;
pub const PEB_ADDRESS: u32 = 0x7ffd_f000;
pub const RETURN_SENTINEL: u32 = 0x7fff_0000;

/// Snapshot of a loaded module.
#[derive(Clone, Debug)]
pub struct ModuleInfo {
    pub name: String,
    pub path: PathBuf,
    pub handle: ModuleHandle,
    pub range: Option<(u32, u32)>,
    pub entry_point: Option<u32>,
    pub refs: u32,
    pub is_system: bool,
    pub tracks_resources: bool,
    pub exports: usize,
    pub dependencies: Vec<ModuleHandle>,
    pub unresolved: Vec<UnresolvedImport>,
}

pub struct Runtime {
    machine: Mutex<Machine>,
}

impl Runtime {
    /// Runtime reading modules from disk.
    pub fn new(config: LoaderConfig) -> Result<Runtime> {
        Ok(Runtime { machine: Mutex::new(Machine::new(config)?) })
    }

    pub fn with_parser(config: LoaderConfig, parser: Box<dyn ImageParser>) -> Result<Runtime> {
        let machine = Machine::with_parts(config, parser, Box::new(X86Trampolines))?;
        Ok(Runtime { machine: Mutex::new(machine) })
    }

    fn lock(&self) -> MutexGuard<'_, Machine> {
        // a panic inside a guest call never leaves the tables half-updated
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Finds or loads `name`, taking a reference on it.
    pub fn load(&self, name: &str) -> Result<ModuleHandle> {
        self.lock().load_module(name, None)
    }

    /// Like [`Runtime::load`], searching next to `referencing` first.
    pub fn load_from(&self, name: &str, referencing: &Path) -> Result<ModuleHandle> {
        self.lock().load_module(name, Some(referencing))
    }

    /// Drops a reference. Once the module is actually unloaded its leak
    /// report comes back first, followed by the reports of dependencies and
    /// tracked libraries unloaded with it; empty while references remain.
    pub fn release(&self, handle: ModuleHandle) -> Vec<LeakReport> {
        self.lock().release_module(handle)
    }

    /// Guest address of an export, tracked variant when the module tracks.
    pub fn resolve_export(&self, handle: ModuleHandle, symbol: &Symbol) -> Option<u32> {
        let machine = self.lock();
        let module = machine.registry.get(handle)?;
        module.exports.find(symbol).map(|e| e.address(module.tracks_resources()))
    }

    pub fn export_entry(&self, handle: ModuleHandle, symbol: &Symbol) -> Option<ExportEntry> {
        let machine = self.lock();
        machine.registry.get(handle)?.exports.find(symbol).cloned()
    }

    /// Adds (or shadows) an export of a loaded module.
    pub fn add_export(&self, handle: ModuleHandle, name: &str, function: u32) -> Result<()> {
        self.lock().add_export(handle, name, function)
    }

    pub fn call(&self, addr: u32, args: &[u32]) -> Result<u32> {
        self.lock().call(addr, args)
    }

    /// Calls an export by name.
    pub fn call_export(&self, handle: ModuleHandle, name: &str, args: &[u32]) -> Result<u32> {
        let addr = self
            .resolve_export(handle, &Symbol::name(name))
            .ok_or_else(|| ErrorKind::ModuleNotFound(format!("{}!{}", handle, name)))?;
        self.call(addr, args)
    }

    pub fn owner_of(&self, addr: u32) -> Option<ModuleHandle> {
        self.lock().owner_of(addr)
    }

    pub fn find(&self, name: &str) -> Option<ModuleHandle> {
        self.lock().registry.find(&crate::loader::search::canonical_name(name))
    }

    pub fn module(&self, handle: ModuleHandle) -> Option<ModuleInfo> {
        let machine = self.lock();
        let m = machine.registry.get(handle)?;
        Some(ModuleInfo {
            name: m.name.clone(),
            path: m.path.clone(),
            handle: m.handle,
            range: m.range,
            entry_point: m.entry_point,
            refs: m.refs,
            is_system: m.is_system(),
            tracks_resources: m.tracks_resources(),
            exports: m.exports.len(),
            dependencies: m.dependencies.clone(),
            unresolved: m.unresolved.clone(),
        })
    }

    pub fn modules(&self) -> Vec<ModuleHandle> {
        self.lock().registry.handles()
    }

    /// Resources currently recorded against `handle`.
    pub fn tracked(&self, handle: ModuleHandle) -> Option<ResourceCounts> {
        self.lock().tracker.info(handle).map(|info| info.counts())
    }

    pub fn host_counts(&self) -> HostCounts {
        self.lock().host.counts()
    }

    pub fn unresolved_calls(&self) -> Vec<(String, String)> {
        self.lock().unresolved_calls.clone()
    }

    pub fn read_memory(&self, addr: u32, size: usize) -> Result<Vec<u8>> {
        self.lock().cpu.read_vec(addr, size).map_err(|f: Fault| f.into())
    }

    pub fn read_u32(&self, addr: u32) -> Result<u32> {
        Ok(self.lock().cpu.read_u32(addr)?)
    }

    /// Writes guest memory, honouring page protection.
    pub fn write_memory(&self, addr: u32, bytes: &[u8]) -> Result<()> {
        Ok(self.lock().cpu.write(addr, bytes)?)
    }

    /// Unloads every module the host still holds, returning their reports.
    pub fn shutdown(self) -> Vec<LeakReport> {
        let mut machine = self.machine.into_inner().unwrap_or_else(PoisonError::into_inner);
        machine.unload_all()
    }
}
