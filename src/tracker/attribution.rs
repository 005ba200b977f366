//! Address attribution: which loaded module owns a code address.

use std::collections::BTreeMap;

use log::warn;

use crate::loader::ModuleHandle;

/// Sorted, non-overlapping `[min, max]` ranges of mapped module images.
#[derive(Default)]
pub struct AddressIndex {
    ranges: BTreeMap<u32, (u32, ModuleHandle)>, // min -> (max, 模块)
}

impl AddressIndex {
    pub fn new() -> AddressIndex {
        AddressIndex::default()
    }

    /// Adds an inclusive range; refuses one that overlaps a registered range.
    pub fn insert(&mut self, min: u32, max: u32, module: ModuleHandle) -> bool {
        if max < min || self.overlaps(min, max) {
            warn!("[-] Range 0x{:08x}-0x{:08x} of {} overlaps a loaded module", min, max, module);
            return false;
        }
        self.ranges.insert(min, (max, module));
        true
    }

    fn overlaps(&self, min: u32, max: u32) -> bool {
        if let Some((_, (prev_max, _))) = self.ranges.range(..=min).next_back() {
            if *prev_max >= min {
                return true;
            }
        }
        self.ranges.range(min..).next().map_or(false, |(next_min, _)| *next_min <= max)
    }

    pub fn remove(&mut self, module: ModuleHandle) {
        self.ranges.retain(|_, (_, m)| *m != module);
    }

    pub fn lookup(&self, addr: u32) -> Option<ModuleHandle> {
        self.ranges
            .range(..=addr)
            .next_back()
            .filter(|(_, (max, _))| addr <= *max)
            .map(|(_, (_, module))| *module)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_hits_inclusive_bounds() {
        let mut index = AddressIndex::new();
        let a = ModuleHandle(0x1000_0000);
        let b = ModuleHandle(0x1010_0000);
        assert!(index.insert(0x1000_0000, 0x1000_3fff, a));
        assert!(index.insert(0x1010_0000, 0x1010_ffff, b));

        assert_eq!(index.lookup(0x1000_0000), Some(a));
        assert_eq!(index.lookup(0x1000_3fff), Some(a));
        assert_eq!(index.lookup(0x1000_4000), None);
        assert_eq!(index.lookup(0x1010_8000), Some(b));
        assert_eq!(index.lookup(0x0fff_ffff), None);
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let mut index = AddressIndex::new();
        assert!(index.insert(0x2000, 0x2fff, ModuleHandle(0x2000)));
        assert!(!index.insert(0x2800, 0x37ff, ModuleHandle(0x2800)));
        assert!(!index.insert(0x1000, 0x2000, ModuleHandle(0x1000)));
        assert!(index.insert(0x3000, 0x3fff, ModuleHandle(0x3000)));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn removal_frees_the_range() {
        let mut index = AddressIndex::new();
        index.insert(0x2000, 0x2fff, ModuleHandle(0x2000));
        index.remove(ModuleHandle(0x2000));
        assert_eq!(index.lookup(0x2100), None);
        assert!(index.insert(0x2000, 0x2fff, ModuleHandle(0x2000)));
    }
}
