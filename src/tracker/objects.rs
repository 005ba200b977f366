//! Private heaps and libraries a module loaded on its own.

use log::debug;

use super::{Category, DllTracker};
use crate::loader::ModuleHandle;

impl DllTracker {
    pub fn track_heap_object(&mut self, caller: u32, heap: u32) -> Option<ModuleHandle> {
        self.track_with(caller, heap, (), Category::HeapObject, |info| &mut info.heap_objects)
    }

    /// Also forgets the blocks still recorded against the heap, wherever they
    /// are filed: destroying a heap frees them.
    pub fn untrack_heap_object(&mut self, caller: u32, heap: u32) -> bool {
        let found = self
            .untrack_with(caller, heap, Category::HeapObject, |info| &mut info.heap_objects)
            .is_some();
        for info in self.infos.values_mut() {
            info.heap.retain(|_, entry| entry.meta.heap != Some(heap));
        }
        found
    }

    /// `LoadLibrary` from inside a module; repeated loads stack up.
    pub fn track_library(&mut self, caller: u32, library: u32) -> Option<ModuleHandle> {
        let info = self.owner_info_mut(caller)?;
        match info.libraries.get_mut(library) {
            Some(entry) => entry.meta += 1,
            None => {
                info.libraries.track(library, caller, 1);
            }
        }
        Some(info.module)
    }

    /// `FreeLibrary`: drops one of the references the module holds.
    pub fn untrack_library(&mut self, caller: u32, library: u32) -> bool {
        let owner = self
            .owner_of(caller)
            .filter(|owner| self.infos.get(owner).map_or(false, |i| i.libraries.contains(library)))
            .or_else(|| {
                self.infos
                    .values()
                    .find(|i| i.libraries.contains(library))
                    .map(|i| i.module)
            });
        let info = match owner.and_then(|owner| self.infos.get_mut(&owner)) {
            Some(info) => info,
            None => {
                debug!("[*] Untracked library 0x{:08x} freed from 0x{:08x}", library, caller);
                return false;
            }
        };
        let remaining = match info.libraries.get_mut(library) {
            Some(entry) => {
                entry.meta -= 1;
                entry.meta
            }
            None => return false,
        };
        if remaining == 0 {
            info.libraries.untrack(library);
        }
        true
    }
}
