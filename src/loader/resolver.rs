//! Import resolution: loaded modules first, then emulated libraries, then a
//! dummy trampoline for whatever is left.

use std::collections::HashMap;
use std::path::PathBuf;

use log::{debug, info, warn};

use super::coff::ImageLayout;
use super::module::{ExportEntry, ExportTable, LoadedModule, ModuleFlags, ModuleHandle, Symbol, UnresolvedImport};
use super::search::{canonical_name, file_name};
use crate::errors::{ErrorKind, Result};
use crate::runtime::Machine;
use crate::windows::EmuLibrary;

impl Machine {
    /// Binds every IAT slot of `handle`. Missing libraries and symbols never
    /// fail the load; they end up on dummy trampolines.
    pub(super) fn resolve_imports(&mut self, handle: ModuleHandle, layout: &ImageLayout) -> Result<()> {
        let tracked = self.registry.get(handle).map_or(false, |m| m.tracks_resources());

        let mut bound: HashMap<String, Option<ModuleHandle>> = HashMap::new();
        for dll in layout.libraries() {
            let canonical = canonical_name(dll);
            if bound.contains_key(&canonical) {
                continue;
            }
            let target = match self.load_module(dll, Some(layout.path.as_path())) {
                Ok(target) if target == handle => {
                    // self import, no reference cycle
                    self.registry.release(target);
                    Some(target)
                }
                Ok(target) => {
                    let system = self.registry.get(target).map_or(true, |m| m.is_system());
                    if !system {
                        if let Some(m) = self.registry.get_mut(handle) {
                            m.dependencies.push(target);
                        }
                    }
                    Some(target)
                }
                Err(e) => {
                    warn!("[-] Import library {} unavailable: {}", dll, e);
                    None
                }
            };
            bound.insert(canonical, target);
        }

        for import in &layout.imports {
            let target = bound.get(&canonical_name(&import.dll)).copied().flatten();
            let addr = match target.and_then(|t| self.find_export(t, &import.symbol, tracked)) {
                Some(addr) => addr,
                None => self.make_stub(handle, &import.dll, &import.symbol)?,
            };
            debug!("[*] {}!{} -> 0x{:08x}", import.dll, import.symbol, addr);
            self.cpu.patch(layout.at(handle.0, import.iat_rva)?, &addr.to_le_bytes())?;
        }
        Ok(())
    }

    pub(crate) fn find_export(&self, handle: ModuleHandle, symbol: &Symbol, tracked: bool) -> Option<u32> {
        self.registry.get(handle)?.exports.find(symbol).map(|e| e.address(tracked))
    }

    /* 生成哑函数: 调用时打印缺失的模块名和函数名, 返回 0 */
    fn make_stub(&mut self, handle: ModuleHandle, dll: &str, symbol: &Symbol) -> Result<u32> {
        let owner = file_name(dll);
        let name = symbol.to_string();
        let size = self.trampolines.size(owner, &name);
        let addr = self.alloc(size)?;
        let code = self.trampolines.generate(addr, owner, &name, self.reporter)?;
        self.cpu.patch(addr, &code)?;
        self.tracker.track_stub(handle, addr);

        let importer = match self.registry.get_mut(handle) {
            Some(m) => {
                m.unresolved.push(UnresolvedImport { dll: dll.to_owned(), symbol: symbol.clone(), stub: addr });
                m.name.clone()
            }
            None => String::new(),
        };
        warn!("[-] Unresolved {}!{} imported by {}, stub at 0x{:08x}", dll, name, importer, addr);
        Ok(addr)
    }

    /// Registers an emulated library as a system module. Each function gets
    /// a thunk, and a second one for the tracked variant where it has one.
    pub(super) fn register_library(&mut self, library: &'static EmuLibrary) -> Result<ModuleHandle> {
        if self.registry.is_full() {
            return Err(ErrorKind::RegistryFull(self.registry.capacity()).into());
        }
        let mut exports = ExportTable::new();
        let mut first = None;
        for function in &library.functions {
            let raw = self.thunks.add(function, false)?;
            let tracked = if function.tracks { Some(self.thunks.add(function, true)?) } else { None };
            first.get_or_insert(raw);
            exports.add(ExportEntry {
                name: Some(function.name.to_owned()),
                ordinal: function.ordinal,
                function: raw,
                tracked_function: tracked,
            });
        }
        // the first thunk doubles as the HMODULE
        let handle = ModuleHandle(first.ok_or_else(|| ErrorKind::ModuleNotFound(library.name.to_owned()))?);

        let mut module = LoadedModule::new(
            library.name,
            PathBuf::from(library.name),
            handle,
            ModuleFlags::SYSTEM | ModuleFlags::SYMBOLS_LOADED,
        );
        module.exports = exports;
        self.registry.insert(module)?;
        info!("[+] Loading {} (emulated) to {}", library.name, handle);
        Ok(handle)
    }
}
