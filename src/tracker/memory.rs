//! Heap blocks and virtual memory.

use super::{Category, DllTracker};
use crate::loader::ModuleHandle;

/// A tracked heap block; `heap` is the private heap it came from, if any.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapBlock {
    pub size: u32,
    pub heap: Option<u32>,
}

impl DllTracker {
    /// Zero-sized blocks are tracked with size 0.
    pub fn track_heap(&mut self, caller: u32, addr: u32, size: u32, heap: Option<u32>) -> Option<ModuleHandle> {
        self.track_with(caller, addr, HeapBlock { size, heap }, Category::Heap, |info| &mut info.heap)
    }

    pub fn untrack_heap(&mut self, caller: u32, addr: u32) -> Option<HeapBlock> {
        self.untrack_with(caller, addr, Category::Heap, |info| &mut info.heap)
            .map(|(_, entry)| entry.meta)
    }

    /// A resize: an unmoved block only has its size updated and keeps its
    /// owner and call site, a moved one is untracked and tracked anew.
    pub fn track_realloc(&mut self, caller: u32, old: u32, new: u32, size: u32, heap: Option<u32>) -> Option<ModuleHandle> {
        if old == 0 {
            return self.track_heap(caller, new, size, heap);
        }
        let previous = self.untrack_with(caller, old, Category::Heap, |info| &mut info.heap);
        match previous {
            Some((owner, entry)) if old == new => {
                let info = self.infos.get_mut(&owner)?;
                info.heap.track(new, entry.site, HeapBlock { size, ..entry.meta });
                Some(owner)
            }
            _ => self.track_heap(caller, new, size, heap),
        }
    }

    /// An untracked caller moved a tracked block: the new address is filed
    /// under the old owner and call site.
    pub fn move_heap(&mut self, caller: u32, old: u32, new: u32, size: u32) -> Option<ModuleHandle> {
        let (owner, entry) = self.untrack_with(caller, old, Category::Heap, |info| &mut info.heap)?;
        let info = self.infos.get_mut(&owner)?;
        info.heap.track(new, entry.site, HeapBlock { size, ..entry.meta });
        Some(owner)
    }

    pub fn track_virtual(&mut self, caller: u32, addr: u32, size: u32) -> Option<ModuleHandle> {
        self.track_with(caller, addr, size, Category::VirtualMemory, |info| &mut info.virtual_memory)
    }

    pub fn untrack_virtual(&mut self, caller: u32, addr: u32) -> Option<u32> {
        self.untrack_with(caller, addr, Category::VirtualMemory, |info| &mut info.virtual_memory)
            .map(|(_, entry)| entry.meta)
    }
}
