//! Mapping PE images into the guest and taking them down again.

use std::cmp::max;
use std::path::Path;

use log::{debug, info, warn};
use scroll::Pread;

use super::coff::{self, ImageLayout, ImageSection, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE};
use super::module::{ExportEntry, LoadedModule, ModuleFlags, ModuleHandle, Symbol};
use super::search::{self, canonical_name, file_name};
use super::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};
use crate::cpu::Protection;
use crate::errors::{ErrorKind, Result};
use crate::heap::PAGE_SIZE;
use crate::runtime::{Machine, IMAGE_BASE, IMAGE_END};
use crate::tracker::LeakReport;
use crate::utils::{align, fault_boundary};
use crate::windows;

const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
const IMAGE_REL_BASED_HIGHLOW: u16 = 3;

/// Mapped size of a section, `None` when rounding overflows.
fn section_size(section: &ImageSection, alignment: u32) -> Option<u32> {
    align(max(section.virtual_size, section.data.len() as u32).max(1), alignment)
}

/* 节属性 -> 内存保护 */
fn get_protection(flag: u32) -> Protection {
    let mut protection = Protection::empty();
    if (flag & IMAGE_SCN_MEM_READ) != 0 {
        protection |= Protection::READ;
    }
    if (flag & IMAGE_SCN_MEM_WRITE) != 0 {
        protection |= Protection::WRITE;
    }
    if (flag & IMAGE_SCN_MEM_EXECUTE) != 0 {
        protection |= Protection::EXEC;
    }
    if protection.is_empty() {
        Protection::READ
    } else {
        protection
    }
}

struct Mapped {
    base: u32,
    range: (u32, u32),
    mappings: Vec<u32>,
}

impl Machine {
    /// Find-or-load: an already registered module gains a reference, an
    /// emulated library is registered, anything else is searched on disk.
    pub(crate) fn load_module(&mut self, name: &str, referencing: Option<&Path>) -> Result<ModuleHandle> {
        let canonical = canonical_name(name);
        if let Some(handle) = self.registry.find(&canonical) {
            self.registry.acquire(handle);
            return Ok(handle);
        }
        // an explicit directory always means a file on disk
        if file_name(name).len() == name.len() {
            if let Some(library) = windows::library(&canonical) {
                return self.register_library(library);
            }
        }
        if self.registry.is_full() {
            return Err(ErrorKind::RegistryFull(self.registry.capacity()).into());
        }
        for path in search::candidates(name, referencing, &self.config) {
            match self.parser.open(&path) {
                Ok(layout) => return self.load_image(&canonical, layout),
                Err(e) => match e.kind() {
                    ErrorKind::ModuleNotFound(_) => continue,
                    _ => {
                        warn!("[-] Unable to load {}: {}", path.display(), e);
                        return Err(e);
                    }
                },
            }
        }
        warn!("[-] Not found module {}", name);
        Err(ErrorKind::ModuleNotFound(name.to_owned()).into())
    }

    fn load_image(&mut self, name: &str, layout: ImageLayout) -> Result<ModuleHandle> {
        let mapped = self.load_memory(&layout)?;
        let handle = ModuleHandle(mapped.base);
        info!("[+] Loading {} to 0x{:08x}", name, mapped.base);

        let mut flags = ModuleFlags::empty();
        if self.config.track_resources {
            flags |= ModuleFlags::TRACK_RESOURCES;
        }
        let mut module = LoadedModule::new(name, layout.path.clone(), handle, flags);
        module.range = Some(mapped.range);
        module.mappings = mapped.mappings.clone();
        module.export_directory = layout.export_directory;
        for export in &layout.exports {
            module.exports.add(ExportEntry {
                name: export.name.clone(),
                ordinal: Some(export.ordinal),
                function: mapped.base + export.rva,
                tracked_function: None,
            });
        }
        if !module.exports.is_empty() {
            module.flags |= ModuleFlags::SYMBOLS_LOADED;
        }
        module.entry_point = if layout.entry_rva != 0 {
            Some(mapped.base + layout.entry_rva)
        } else {
            ["DllMain", "_DllMain@12"]
                .iter()
                .find_map(|main| module.exports.find(&Symbol::name(*main)))
                .map(|e| e.function)
        };

        if !self.tracker.register(handle, name, mapped.range) {
            warn!("[-] {} is not tracked", name);
        }
        if let Err(e) = self.registry.insert(module) {
            self.tracker.detach(handle);
            self.unmap_image(handle.0, &mapped.mappings);
            return Err(e);
        }

        // registered from here on, so failures go through the normal teardown
        let loaded = self.resolve_imports(handle, &layout).and_then(|_| self.attach(handle));
        if let Err(e) = loaded {
            let start = self.unloaded.len();
            self.teardown(handle);
            self.unloaded.truncate(start);
            return Err(e);
        }
        Ok(handle)
    }

    /* 将 pe 映射到内存 */
    fn load_memory(&mut self, layout: &ImageLayout) -> Result<Mapped> {
        let alignment = layout.section_alignment.max(1);
        let mut image_size = layout.size_of_image;
        for section in &layout.sections {
            let end = section_size(section, alignment)
                .and_then(|size| section.virtual_address.checked_add(size))
                .ok_or_else(|| layout.malformed(format!("section {} overflows the address space", section.name)))?;
            image_size = max(image_size, end);
        }
        let image_size = image_size.max(1);
        if image_size > IMAGE_END - IMAGE_BASE {
            return Err(layout.malformed(format!("image size 0x{:x} exceeds the image region", image_size)));
        }
        if layout.entry_rva >= image_size || layout.exports.iter().any(|e| e.rva >= image_size) {
            return Err(layout.malformed("entry point or export outside the image".to_owned()));
        }

        let base = if self.images.alloc_at(layout.image_base, image_size) {
            layout.image_base
        } else {
            self.images
                .alloc(image_size)
                .ok_or(ErrorKind::AddressSpaceExhausted(self.images.name(), image_size))?
                .addr
        };

        let mut mappings = Vec::new();
        if let Err(e) = self.map_sections(layout, base, alignment, image_size, &mut mappings) {
            self.unmap_image(base, &mappings);
            return Err(e);
        }

        if base != layout.image_base {
            match layout.relocations {
                Some(dir) => {
                    let fixed = layout.at(base, dir.rva).and_then(|at| {
                        let bytes = self.cpu.snapshot(at, dir.size);
                        self.fix_reloc_table(layout, &bytes, base)
                    });
                    if let Err(e) = fixed {
                        self.unmap_image(base, &mappings);
                        return Err(e);
                    }
                }
                None => warn!("[-] {} has no relocations, loading at 0x{:08x} anyway", layout.path.display(), base),
            }
        }
        Ok(Mapped { base, range: (base, base + (image_size - 1)), mappings })
    }

    fn map_sections(&mut self, layout: &ImageLayout, base: u32, alignment: u32, image_size: u32, mappings: &mut Vec<u32>) -> Result<()> {
        if alignment % PAGE_SIZE != 0 {
            // sub-page sections share pages, so the image is a single region
            let size = align(image_size, PAGE_SIZE).ok_or_else(|| layout.malformed("image too large".to_owned()))?;
            self.cpu.map(base, size, Protection::ALL)?;
            mappings.push(base);
            self.cpu.patch(base, &layout.headers[..(size as usize).min(layout.headers.len())])?;
            for section in layout.sections.iter().filter(|s| !s.data.is_empty()) {
                self.cpu.patch(layout.at(base, section.virtual_address)?, &section.data)?;
            }
            return Ok(());
        }

        let first_section = layout.sections.iter().map(|s| s.virtual_address).min().unwrap_or(image_size);
        let header_size =
            align(layout.headers.len().max(1) as u32, alignment).map_or(first_section, |size| size.min(first_section));
        if header_size > 0 {
            self.cpu.map(base, header_size, Protection::READ)?;
            mappings.push(base);
            let n = (header_size as usize).min(layout.headers.len());
            self.cpu.patch(base, &layout.headers[..n])?;
        }
        for section in &layout.sections {
            let start = layout.at(base, section.virtual_address)?;
            let size = section_size(section, alignment)
                .ok_or_else(|| layout.malformed(format!("section {} overflows the address space", section.name)))?;
            debug!("MAP {:x} ===> {:x} {} {:?}", start, size, section.name, get_protection(section.characteristics));
            self.cpu.map(start, size, get_protection(section.characteristics))?;
            mappings.push(start);
            if !section.data.is_empty() {
                self.cpu.patch(start, &section.data)?;
            }
        }
        Ok(())
    }

    fn unmap_image(&mut self, base: u32, mappings: &[u32]) {
        for region in mappings {
            self.cpu.unmap(*region);
        }
        self.images.free(base);
    }

    fn fix_reloc_table(&mut self, layout: &ImageLayout, bytes: &[u8], image_addr: u32) -> Result<()> {
        let delta = image_addr.wrapping_sub(layout.image_base);
        let mut col = 0;
        while col + 8 <= bytes.len() {
            let va = bytes.gread_with::<u32>(&mut col, scroll::LE)?;
            let size = bytes.gread_with::<u32>(&mut col, scroll::LE)?;
            if size < 8 {
                break;
            }
            let page = layout.at(image_addr, va)?;
            for _ in 0..(size - 8) / 2 {
                let block = bytes.gread_with::<u16>(&mut col, scroll::LE)?;
                let at = layout.at(page, (block & 0xfff) as u32)?;
                match block >> 12 {
                    IMAGE_REL_BASED_ABSOLUTE => {}
                    IMAGE_REL_BASED_HIGHLOW => {
                        let old: u32 = self.cpu.snapshot(at, 4).pread_with(0, scroll::LE)?;
                        self.cpu.patch(at, &old.wrapping_add(delta).to_le_bytes())?;
                    }
                    ty => debug!("[*] Skipping relocation type {} at 0x{:08x}", ty, at),
                }
            }
        }
        Ok(())
    }

    /// Runs the entry point with `DLL_PROCESS_ATTACH`, then rebuilds the
    /// export table if the module only produced it while initialising.
    fn attach(&mut self, handle: ModuleHandle) -> Result<()> {
        let (name, entry) = match self.registry.get(handle) {
            Some(m) => (m.name.clone(), m.entry_point),
            None => return Err(ErrorKind::InvalidHandle(handle.0).into()),
        };
        if let Some(entry) = entry {
            let attached = match fault_boundary(|| self.call(entry, &[handle.0, DLL_PROCESS_ATTACH, 0])) {
                Ok(0) => {
                    warn!("[-] DllMain of {} returned FALSE", name);
                    true
                }
                Ok(_) => true,
                // never initialised, so it gets no detach call either
                Err(fault) if self.config.is_fault_exempt(&name) => {
                    warn!("[-] DllMain of {} faulted ({}), exempt, continuing", name, fault);
                    false
                }
                Err(fault) => {
                    warn!("[-] DllMain of {} faulted: {}", name, fault);
                    return Err(ErrorKind::EntryPointFault(name, fault).into());
                }
            };
            if attached {
                if let Some(m) = self.registry.get_mut(handle) {
                    m.flags |= ModuleFlags::ATTACHED;
                }
            }
        }
        self.rebuild_exports(handle);
        Ok(())
    }

    fn rebuild_exports(&mut self, handle: ModuleHandle) {
        let (dir, range) = match self.registry.get(handle) {
            Some(m) if m.exports.is_empty() => match (m.export_directory, m.range) {
                (Some(dir), Some(range)) => (dir, range),
                _ => return,
            },
            _ => return,
        };
        let image = self.cpu.snapshot(range.0, range.1 - range.0 + 1);
        match coff::read_exports(&image, dir) {
            Ok(exports) => {
                if let Some(m) = self.registry.get_mut(handle) {
                    for export in exports.into_iter().filter(|e| (e.rva as usize) < image.len()) {
                        m.exports.add(ExportEntry {
                            name: export.name,
                            ordinal: Some(export.ordinal),
                            function: handle.0 + export.rva,
                            tracked_function: None,
                        });
                    }
                    if !m.exports.is_empty() {
                        m.flags |= ModuleFlags::SYMBOLS_LOADED;
                        info!("[+] {} exports rebuilt after attach ({})", m.name, m.exports.len());
                    }
                }
            }
            Err(e) => debug!("[*] {} has no readable export directory: {}", handle, e),
        }
    }

    /// Drops one reference and unloads at zero. The module's own report
    /// comes first, followed by those of the dependencies and tracked
    /// libraries that went with it.
    pub(crate) fn release_module(&mut self, handle: ModuleHandle) -> Vec<LeakReport> {
        let start = self.unloaded.len();
        self.release_into(handle);
        self.unloaded.split_off(start)
    }

    /// Like [`Machine::release_module`], leaving the reports in `unloaded`.
    pub(crate) fn release_into(&mut self, handle: ModuleHandle) -> bool {
        let module = match self.registry.get(handle) {
            Some(m) => m,
            None => return false,
        };
        // system modules stay; zero refs means an unload is already under way
        if module.is_system() || module.refs == 0 {
            return false;
        }
        if self.registry.release(handle) != Some(0) {
            return false;
        }
        self.teardown(handle);
        true
    }

    /// Detach, dependency release, resource drain, unmap, deregistration.
    fn teardown(&mut self, handle: ModuleHandle) {
        let (name, entry, dependencies) = match self.registry.get_mut(handle) {
            Some(m) => {
                m.refs = 0;
                let entry = m.entry_point.filter(|_| m.flags.contains(ModuleFlags::ATTACHED));
                (m.name.clone(), entry, std::mem::take(&mut m.dependencies))
            }
            None => return,
        };
        info!("[+] Unloading {}", name);
        let at = self.unloaded.len();
        if let Some(entry) = entry {
            if let Err(fault) = fault_boundary(|| self.call(entry, &[handle.0, DLL_PROCESS_DETACH, 0])) {
                warn!("[-] DllMain of {} faulted on detach: {}", name, fault);
            }
        }
        for dependency in dependencies {
            self.release_into(dependency);
        }
        let report = match self.tracker.detach(handle) {
            Some(mut info) => info.drain(self),
            None => LeakReport::new(&name),
        };
        if let Some(module) = self.registry.remove(handle) {
            self.unmap_image(handle.0, &module.mappings);
        }
        let at = at.min(self.unloaded.len());
        self.unloaded.insert(at, report);
    }

    pub(crate) fn add_export(&mut self, handle: ModuleHandle, name: &str, function: u32) -> Result<()> {
        let module = self.registry.get_mut(handle).ok_or(ErrorKind::InvalidHandle(handle.0))?;
        module.exports.add(ExportEntry { name: Some(name.to_owned()), ordinal: None, function, tracked_function: None });
        module.flags |= ModuleFlags::SYMBOLS_LOADED;
        Ok(())
    }

    /// Unloads every non-system module regardless of its reference count,
    /// dependents before the modules they import from.
    pub(crate) fn unload_all(&mut self) -> Vec<LeakReport> {
        let start = self.unloaded.len();
        loop {
            let live: Vec<ModuleHandle> =
                self.registry.iter().filter(|m| !m.is_system() && m.refs > 0).map(|m| m.handle).collect();
            let first = match live.first() {
                Some(&handle) => handle,
                None => break,
            };
            let root = live
                .iter()
                .copied()
                .find(|h| !self.registry.iter().any(|m| m.refs > 0 && m.dependencies.contains(h)))
                .unwrap_or(first);
            self.teardown(root);
        }
        self.unloaded.split_off(start)
    }
}
