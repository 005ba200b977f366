use std::collections::BTreeMap;

use bimap::BiMap;

use super::module::{LoadedModule, ModuleHandle};
use crate::errors::{ErrorKind, Result};

/// Fixed-capacity table of loaded modules, keyed both by canonical name and
/// by handle.
pub struct ModuleRegistry {
    capacity: usize,
    modules: BTreeMap<ModuleHandle, LoadedModule>,
    names: BiMap<String, ModuleHandle>, // 名称 <-> 句柄
}

impl ModuleRegistry {
    pub fn new(capacity: usize) -> ModuleRegistry {
        ModuleRegistry { capacity, modules: BTreeMap::new(), names: BiMap::new() }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.modules.len() >= self.capacity
    }

    /// Handle of the module registered under the canonical `name`.
    pub fn find(&self, name: &str) -> Option<ModuleHandle> {
        self.names.get_by_left(&name.to_owned()).copied()
    }

    pub fn name_of(&self, handle: ModuleHandle) -> Option<&str> {
        self.names.get_by_right(&handle).map(String::as_str)
    }

    pub fn get(&self, handle: ModuleHandle) -> Option<&LoadedModule> {
        self.modules.get(&handle)
    }

    pub fn get_mut(&mut self, handle: ModuleHandle) -> Option<&mut LoadedModule> {
        self.modules.get_mut(&handle)
    }

    pub fn insert(&mut self, module: LoadedModule) -> Result<()> {
        if self.is_full() {
            return Err(ErrorKind::RegistryFull(self.capacity).into());
        }
        if self.names.contains_left(&module.name) || self.modules.contains_key(&module.handle) {
            return Err(ErrorKind::MapConflict(module.handle.0, 0).into());
        }
        self.names.insert(module.name.clone(), module.handle);
        self.modules.insert(module.handle, module);
        Ok(())
    }

    pub fn remove(&mut self, handle: ModuleHandle) -> Option<LoadedModule> {
        self.names.remove_by_right(&handle);
        self.modules.remove(&handle)
    }

    /// Takes another reference; returns the new count.
    pub fn acquire(&mut self, handle: ModuleHandle) -> Option<u32> {
        self.modules.get_mut(&handle).map(|m| {
            m.refs += 1;
            m.refs
        })
    }

    /// Drops a reference; returns the remaining count.
    pub fn release(&mut self, handle: ModuleHandle) -> Option<u32> {
        self.modules.get_mut(&handle).map(|m| {
            m.refs = m.refs.saturating_sub(1);
            m.refs
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadedModule> {
        self.modules.values()
    }

    pub fn handles(&self) -> Vec<ModuleHandle> {
        self.modules.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::module::ModuleFlags;
    use std::path::PathBuf;

    fn module(name: &str, base: u32) -> LoadedModule {
        LoadedModule::new(name, PathBuf::from(name), ModuleHandle(base), ModuleFlags::empty())
    }

    #[test]
    fn find_by_name_and_handle() {
        let mut registry = ModuleRegistry::new(4);
        registry.insert(module("a.dll", 0x1000_0000)).unwrap();
        registry.insert(module("b.dll", 0x1001_0000)).unwrap();
        assert_eq!(registry.find("b.dll"), Some(ModuleHandle(0x1001_0000)));
        assert_eq!(registry.name_of(ModuleHandle(0x1000_0000)), Some("a.dll"));
        assert!(registry.find("c.dll").is_none());

        registry.remove(ModuleHandle(0x1000_0000)).unwrap();
        assert!(registry.find("a.dll").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut registry = ModuleRegistry::new(1);
        registry.insert(module("a.dll", 0x1000_0000)).unwrap();
        let err = registry.insert(module("b.dll", 0x1001_0000)).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::RegistryFull(1)));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ModuleRegistry::new(4);
        registry.insert(module("a.dll", 0x1000_0000)).unwrap();
        assert!(registry.insert(module("a.dll", 0x1002_0000)).is_err());
    }

    #[test]
    fn reference_counts() {
        let mut registry = ModuleRegistry::new(4);
        let h = ModuleHandle(0x1000_0000);
        registry.insert(module("a.dll", h.0)).unwrap();
        assert_eq!(registry.acquire(h), Some(2));
        assert_eq!(registry.release(h), Some(1));
        assert_eq!(registry.release(h), Some(0));
        assert_eq!(registry.release(h), Some(0));
        assert_eq!(registry.acquire(ModuleHandle(7)), None);
    }
}
