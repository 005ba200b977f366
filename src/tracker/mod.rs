//! Per-module resource ownership.
//!
//! Every non-system module gets a [`TrackInfo`] when it is mapped. Emulated
//! APIs file each acquired resource under the module that owns the calling
//! address (see [`attribution`]) and remove it again on release, falling
//! back to a scan of every module when a resource is released by a module
//! other than the one that acquired it. At unload the loader detaches the
//! module's record and drains it through a [`ResourceReleaser`].

pub mod attribution;
mod files;
pub mod ledger;
mod memory;
mod objects;
pub mod report;
mod sockets;
mod sync;

use std::collections::BTreeMap;
use std::fmt;

use log::{debug, warn};

use crate::errors::Result;
use crate::loader::ModuleHandle;
use crate::utils::fault_boundary;

pub use self::attribution::AddressIndex;
pub use self::files::FileKind;
pub use self::ledger::{Entry, Ledger};
pub use self::memory::HeapBlock;
pub use self::report::{Category, CategoryLeaks, LeakReport, SiteLeaks};

/// A resource handed to the releaser during a drain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    Library { module: ModuleHandle, refs: u32 },
    Socket(u32),
    File { handle: u32, kind: FileKind },
    CriticalSection(u32),
    HeapObject(u32),
    Heap { addr: u32, heap: Option<u32> },
    VirtualMemory(u32),
    Stub(u32),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Resource::Library { module, refs } => write!(f, "library {} ({} refs)", module, refs),
            Resource::Socket(s) => write!(f, "socket 0x{:x}", s),
            Resource::File { handle, kind } => write!(f, "{} 0x{:x}", kind, handle),
            Resource::CriticalSection(cs) => write!(f, "critical section 0x{:08x}", cs),
            Resource::HeapObject(h) => write!(f, "heap 0x{:08x}", h),
            Resource::Heap { addr, .. } => write!(f, "heap block 0x{:08x}", addr),
            Resource::VirtualMemory(addr) => write!(f, "virtual memory 0x{:08x}", addr),
            Resource::Stub(addr) => write!(f, "dummy stub 0x{:08x}", addr),
        }
    }
}

/// Performs the actual release of one resource during a drain.
pub trait ResourceReleaser {
    fn release(&mut self, resource: Resource) -> Result<()>;
}

/// Outstanding resources per category, for inspection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    pub libraries: usize,
    pub sockets: usize,
    pub files: usize,
    pub critical_sections: usize,
    pub heap_objects: usize,
    pub heap: usize,
    pub virtual_memory: usize,
    pub stubs: usize,
}

impl ResourceCounts {
    pub fn total(&self) -> usize {
        self.libraries
            + self.sockets
            + self.files
            + self.critical_sections
            + self.heap_objects
            + self.heap
            + self.virtual_memory
            + self.stubs
    }
}

pub struct TrackInfo {
    pub module: ModuleHandle,
    pub name: String,
    pub range: (u32, u32),
    pub libraries: Ledger<u32>, // 句柄 -> 引用次数
    pub sockets: Ledger<()>,
    pub files: Ledger<FileKind>,
    pub critical_sections: Ledger<()>,
    pub heap_objects: Ledger<()>,
    pub heap: Ledger<HeapBlock>,
    pub virtual_memory: Ledger<u32>,
    /// Dummy trampolines the loader generated for this module.
    pub stubs: Vec<u32>,
}

impl TrackInfo {
    pub fn new(module: ModuleHandle, name: &str, range: (u32, u32)) -> TrackInfo {
        TrackInfo {
            module,
            name: name.to_owned(),
            range,
            libraries: Ledger::new(),
            sockets: Ledger::new(),
            files: Ledger::new(),
            critical_sections: Ledger::new(),
            heap_objects: Ledger::new(),
            heap: Ledger::new(),
            virtual_memory: Ledger::new(),
            stubs: Vec::new(),
        }
    }

    pub fn counts(&self) -> ResourceCounts {
        ResourceCounts {
            libraries: self.libraries.len(),
            sockets: self.sockets.len(),
            files: self.files.len(),
            critical_sections: self.critical_sections.len(),
            heap_objects: self.heap_objects.len(),
            heap: self.heap.len(),
            virtual_memory: self.virtual_memory.len(),
            stubs: self.stubs.len(),
        }
    }

    /// Force-releases everything still recorded, in category order, and
    /// reports it. Every collection is empty afterwards, whatever the
    /// releaser does.
    pub fn drain(&mut self, releaser: &mut dyn ResourceReleaser) -> LeakReport {
        let mut report = LeakReport::new(&self.name);
        let mut pending: Vec<Resource> = Vec::new();

        for (handle, entry) in self.libraries.take_all() {
            report.record(Category::Library, entry.site, 0);
            pending.push(Resource::Library { module: ModuleHandle(handle), refs: entry.meta });
        }
        for (handle, entry) in self.sockets.take_all() {
            report.record(Category::Socket, entry.site, 0);
            pending.push(Resource::Socket(handle));
        }
        for (handle, entry) in self.files.take_all() {
            report.record(Category::File, entry.site, 0);
            pending.push(Resource::File { handle, kind: entry.meta });
        }
        for (handle, entry) in self.critical_sections.take_all() {
            report.record(Category::CriticalSection, entry.site, 0);
            pending.push(Resource::CriticalSection(handle));
        }
        let mut destroyed: Vec<u32> = Vec::new();
        for (handle, entry) in self.heap_objects.take_all() {
            report.record(Category::HeapObject, entry.site, 0);
            pending.push(Resource::HeapObject(handle));
            destroyed.push(handle);
        }
        for (addr, entry) in self.heap.take_all() {
            report.record(Category::Heap, entry.site, entry.meta.size as u64);
            // blocks of a destroyed private heap go with it
            if entry.meta.heap.map_or(false, |h| destroyed.contains(&h)) {
                continue;
            }
            pending.push(Resource::Heap { addr, heap: entry.meta.heap });
        }
        for (addr, entry) in self.virtual_memory.take_all() {
            report.record(Category::VirtualMemory, entry.site, entry.meta as u64);
            pending.push(Resource::VirtualMemory(addr));
        }
        for stub in self.stubs.drain(..) {
            report.stubs_freed += 1;
            pending.push(Resource::Stub(stub));
        }

        report.log();
        for resource in pending {
            if let Err(e) = fault_boundary(|| releaser.release(resource)) {
                warn!("[-] {}: releasing {} failed: {}", self.name, resource, e);
                report.failures += 1;
            }
        }
        report
    }
}

/// Tracking records of every loaded non-system module plus the range index
/// used to attribute call sites to them.
#[derive(Default)]
pub struct DllTracker {
    index: AddressIndex,
    infos: BTreeMap<ModuleHandle, TrackInfo>,
}

impl DllTracker {
    pub fn new() -> DllTracker {
        DllTracker::default()
    }

    /// Starts tracking a mapped module; `range` is inclusive.
    pub fn register(&mut self, module: ModuleHandle, name: &str, range: (u32, u32)) -> bool {
        if !self.index.insert(range.0, range.1, module) {
            return false;
        }
        self.infos.insert(module, TrackInfo::new(module, name, range));
        true
    }

    /// Stops tracking `module` and hands back its record for draining.
    pub fn detach(&mut self, module: ModuleHandle) -> Option<TrackInfo> {
        self.index.remove(module);
        self.infos.remove(&module)
    }

    pub fn info(&self, module: ModuleHandle) -> Option<&TrackInfo> {
        self.infos.get(&module)
    }

    pub fn is_tracked(&self, module: ModuleHandle) -> bool {
        self.infos.contains_key(&module)
    }

    /// Module owning `addr`: by image range first, then by the virtual
    /// memory each module allocated.
    pub fn owner_of(&self, addr: u32) -> Option<ModuleHandle> {
        self.index.lookup(addr).or_else(|| {
            self.infos
                .values()
                .find(|info| info.virtual_memory.covers(addr))
                .map(|info| info.module)
        })
    }

    fn owner_info_mut(&mut self, caller: u32) -> Option<&mut TrackInfo> {
        let owner = self.owner_of(caller)?;
        self.infos.get_mut(&owner)
    }

    /// Records a loader-generated stub against `module` itself.
    pub fn track_stub(&mut self, module: ModuleHandle, addr: u32) -> bool {
        match self.infos.get_mut(&module) {
            Some(info) => {
                info.stubs.push(addr);
                true
            }
            None => false,
        }
    }

    fn track_with<M, F>(&mut self, caller: u32, handle: u32, meta: M, category: Category, select: F) -> Option<ModuleHandle>
    where
        F: FnOnce(&mut TrackInfo) -> &mut Ledger<M>,
    {
        match self.owner_info_mut(caller) {
            Some(info) => {
                if select(&mut *info).track(handle, caller, meta).is_some() {
                    debug!("[*] {}: stale {} record 0x{:08x} replaced", info.name, category, handle);
                }
                Some(info.module)
            }
            None => {
                debug!("[*] {} 0x{:08x} acquired from 0x{:08x} outside any module", category, handle, caller);
                None
            }
        }
    }

    /// Removes `handle`, trying the caller's module first and then every
    /// module. A miss is not an error: the resource was never tracked.
    fn untrack_with<M, F>(&mut self, caller: u32, handle: u32, category: Category, select: F) -> Option<(ModuleHandle, Entry<M>)>
    where
        F: Fn(&mut TrackInfo) -> &mut Ledger<M>,
    {
        if let Some(info) = self.owner_info_mut(caller) {
            if let Some(entry) = select(&mut *info).untrack(handle) {
                return Some((info.module, entry));
            }
        }
        for info in self.infos.values_mut() {
            if let Some(entry) = select(&mut *info).untrack(handle) {
                debug!("[*] {} 0x{:08x} of {} released from 0x{:08x}", category, handle, info.name, caller);
                return Some((info.module, entry));
            }
        }
        debug!("[*] Untracked {} 0x{:08x} released from 0x{:08x}", category, handle, caller);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    const A: ModuleHandle = ModuleHandle(0x1000_0000);
    const B: ModuleHandle = ModuleHandle(0x1010_0000);
    const IN_A: u32 = 0x1000_1234;
    const IN_B: u32 = 0x1010_1234;

    fn tracker() -> DllTracker {
        let mut tracker = DllTracker::new();
        assert!(tracker.register(A, "a.dll", (0x1000_0000, 0x1000_ffff)));
        assert!(tracker.register(B, "b.dll", (0x1010_0000, 0x1010_ffff)));
        tracker
    }

    #[derive(Default)]
    struct Recorder {
        released: Vec<Resource>,
        fail_on: Vec<Resource>,
        panic_on: Vec<Resource>,
    }

    impl ResourceReleaser for Recorder {
        fn release(&mut self, resource: Resource) -> Result<()> {
            if self.panic_on.contains(&resource) {
                panic!("corrupted {}", resource);
            }
            if self.fail_on.contains(&resource) {
                return Err(ErrorKind::InvalidHandle(0).into());
            }
            self.released.push(resource);
            Ok(())
        }
    }

    #[test]
    fn resources_are_filed_under_the_calling_module() {
        let mut tracker = tracker();
        assert_eq!(tracker.track_heap(IN_A, 0x5000_0000, 10, None), Some(A));
        assert_eq!(tracker.track_socket(IN_B, 0x104), Some(B));
        assert_eq!(tracker.track_heap(0x7000_0000, 0x5000_0100, 10, None), None);
        assert_eq!(tracker.info(A).unwrap().counts().heap, 1);
        assert_eq!(tracker.info(B).unwrap().counts().sockets, 1);
    }

    #[test]
    fn virtual_allocations_extend_attribution() {
        let mut tracker = tracker();
        tracker.track_virtual(IN_A, 0x6000_0000, 0x3000);
        assert_eq!(tracker.owner_of(0x6000_2000), Some(A));
        assert_eq!(tracker.owner_of(0x6000_3000), None);
        // code running from that region allocates on behalf of A
        assert_eq!(tracker.track_heap(0x6000_0010, 0x5000_0000, 8, None), Some(A));
    }

    #[test]
    fn cross_module_release_falls_back_to_a_scan() {
        let mut tracker = tracker();
        tracker.track_heap(IN_A, 0x5000_0000, 32, None);
        let block = tracker.untrack_heap(IN_B, 0x5000_0000).unwrap();
        assert_eq!(block.size, 32);
        assert_eq!(tracker.info(A).unwrap().counts().heap, 0);
    }

    #[test]
    fn double_release_is_a_no_op() {
        let mut tracker = tracker();
        tracker.track_file(IN_A, 0x100, FileKind::Native);
        assert_eq!(tracker.untrack_file(IN_A, 0x100), Some(FileKind::Native));
        assert_eq!(tracker.untrack_file(IN_A, 0x100), None);
        assert_eq!(tracker.untrack_file(IN_B, 0x100), None);
    }

    #[test]
    fn drain_empties_every_collection_despite_failures() {
        let mut tracker = tracker();
        tracker.track_library(IN_A, 0x1020_0000);
        tracker.track_library(IN_A, 0x1020_0000);
        tracker.track_socket(IN_A, 0x104);
        tracker.track_file(IN_A, 0x108, FileKind::Stream);
        tracker.track_critical_section(IN_A, 0x5000_0400);
        tracker.track_heap_object(IN_A, 0x10c);
        tracker.track_heap(IN_A, 0x5000_0000, 10, None);
        tracker.track_heap(IN_A, 0x5000_0100, 20, Some(0x10c));
        tracker.track_virtual(IN_A, 0x6000_0000, 0x1000);
        tracker.track_stub(A, 0x5000_0800);
        assert_eq!(tracker.info(A).unwrap().counts().total(), 9);

        let mut releaser = Recorder {
            fail_on: vec![Resource::Socket(0x104)],
            panic_on: vec![Resource::Heap { addr: 0x5000_0000, heap: None }],
            ..Recorder::default()
        };
        let mut info = tracker.detach(A).unwrap();
        let report = info.drain(&mut releaser);

        assert_eq!(info.counts().total(), 0);
        assert_eq!(report.failures, 2);
        assert_eq!(report.stubs_freed, 1);
        assert_eq!(report.category(Category::Heap).bytes, 30);
        assert_eq!(report.category(Category::VirtualMemory).bytes, 0x1000);
        assert_eq!(
            releaser.released,
            vec![
                Resource::Library { module: ModuleHandle(0x1020_0000), refs: 2 },
                Resource::File { handle: 0x108, kind: FileKind::Stream },
                Resource::CriticalSection(0x5000_0400),
                Resource::HeapObject(0x10c),
                Resource::VirtualMemory(0x6000_0000),
                Resource::Stub(0x5000_0800),
            ]
        );
        assert!(tracker.owner_of(IN_A).is_none());
    }

    #[test]
    fn leaks_group_by_call_site() {
        let mut tracker = tracker();
        tracker.track_heap(0x1000_1010, 0x5000_0000, 10, None);
        tracker.track_heap(0x1000_1010, 0x5000_0010, 20, None);
        tracker.track_heap(0x1000_1020, 0x5000_0030, 30, None);
        tracker.track_heap(0x1000_1030, 0x5000_0050, 40, None);

        let mut info = tracker.detach(A).unwrap();
        let report = info.drain(&mut Recorder::default());
        let heap = report.category(Category::Heap);
        assert_eq!(heap.bytes, 100);
        assert_eq!(heap.sites.len(), 3);
    }
}
