use std::collections::BTreeMap;

/// One outstanding resource: the call site that acquired it and whatever the
/// category needs to release it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry<M> {
    pub site: u32,
    pub meta: M,
}

/// Resource handle -> entry, for one category of one module.
#[derive(Clone, Debug)]
pub struct Ledger<M> {
    entries: BTreeMap<u32, Entry<M>>,
}

impl<M> Default for Ledger<M> {
    fn default() -> Self {
        Ledger { entries: BTreeMap::new() }
    }
}

impl<M> Ledger<M> {
    pub fn new() -> Ledger<M> {
        Ledger::default()
    }

    /// Records `handle`; a stale entry for the same handle is replaced and returned.
    pub fn track(&mut self, handle: u32, site: u32, meta: M) -> Option<Entry<M>> {
        self.entries.insert(handle, Entry { site, meta })
    }

    pub fn untrack(&mut self, handle: u32) -> Option<Entry<M>> {
        self.entries.remove(&handle)
    }

    pub fn get(&self, handle: u32) -> Option<&Entry<M>> {
        self.entries.get(&handle)
    }

    pub fn get_mut(&mut self, handle: u32) -> Option<&mut Entry<M>> {
        self.entries.get_mut(&handle)
    }

    pub fn contains(&self, handle: u32) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Entry<M>)> {
        self.entries.iter().map(|(handle, entry)| (*handle, entry))
    }

    /// Empties the ledger, handing back every entry in handle order.
    pub fn take_all(&mut self) -> Vec<(u32, Entry<M>)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }

    pub fn retain<F: FnMut(u32, &Entry<M>) -> bool>(&mut self, mut keep: F) {
        self.entries.retain(|handle, entry| keep(*handle, entry));
    }
}

impl Ledger<u32> {
    /// Whether `addr` falls inside a recorded `[handle, handle + size)` block.
    pub fn covers(&self, addr: u32) -> bool {
        self.entries
            .range(..=addr)
            .next_back()
            .map_or(false, |(base, entry)| (addr as u64) < *base as u64 + entry.meta.max(1) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_untrack_finds_nothing() {
        let mut ledger: Ledger<u32> = Ledger::new();
        ledger.track(0x5000_0000, 0x1000_1234, 16);
        assert_eq!(ledger.untrack(0x5000_0000), Some(Entry { site: 0x1000_1234, meta: 16 }));
        assert_eq!(ledger.untrack(0x5000_0000), None);
        assert!(ledger.is_empty());
    }

    #[test]
    fn covers_block_interior_only() {
        let mut ledger: Ledger<u32> = Ledger::new();
        ledger.track(0x6000_0000, 0, 0x2000);
        assert!(ledger.covers(0x6000_0000));
        assert!(ledger.covers(0x6000_1fff));
        assert!(!ledger.covers(0x6000_2000));
        assert!(!ledger.covers(0x5fff_ffff));
    }
}
