use log::{debug, warn};
use scroll::{Pwrite, LE};

use super::exec::{ThunkTable, UNRESOLVED_REPORTER};
use super::host::HostObjects;
use super::*;
use crate::config::LoaderConfig;
use crate::cpu::{Cpu, Protection, Reg};
use crate::errors::{ErrorKind, Result};
use crate::heap::{Heap, PAGE_SIZE};
use crate::loader::coff::{GoblinParser, ImageParser};
use crate::loader::{ModuleHandle, ModuleRegistry, TrampolineFactory, X86Trampolines};
use crate::tracker::{DllTracker, FileKind, LeakReport, Resource, ResourceReleaser};
use crate::utils::align;
use crate::windows::kernel32::{MAIN_THREAD_ID, PROCESS_HEAP, PROCESS_ID};

/// Everything one loader instance owns: the guest CPU and address space,
/// the module registry, the resource tracker and the host objects behind
/// emulated handles.
pub struct Machine {
    pub(crate) cpu: Cpu,
    pub(crate) config: LoaderConfig,
    pub(crate) registry: ModuleRegistry,
    pub(crate) tracker: DllTracker,
    pub(crate) heap: Heap,
    pub(crate) vmem: Heap,
    pub(crate) images: Heap,
    pub(crate) host: HostObjects,
    pub(crate) thunks: ThunkTable,
    pub(crate) parser: Box<dyn ImageParser>,
    pub(crate) trampolines: Box<dyn TrampolineFactory>,
    /// Thunk the dummy trampolines report to.
    pub(crate) reporter: u32,
    /// `(module, symbol)` for every call that reached a dummy trampoline.
    pub(crate) unresolved_calls: Vec<(String, String)>,
    pub(crate) last_error: u32,
    pub(crate) depth: u32,
    /// Reports of modules unloaded by the operation under way.
    pub(crate) unloaded: Vec<LeakReport>,
}

impl Machine {
    pub fn new(config: LoaderConfig) -> Result<Machine> {
        Machine::with_parts(config, Box::new(GoblinParser), Box::new(X86Trampolines))
    }

    pub fn with_parts(
        config: LoaderConfig,
        parser: Box<dyn ImageParser>,
        trampolines: Box<dyn TrampolineFactory>,
    ) -> Result<Machine> {
        let mut cpu = Cpu::new(RETURN_SENTINEL, (THUNK_BASE, THUNK_BASE + THUNK_SIZE - 1))?;
        // 堆栈
        cpu.map(STACK_BASE, STACK_SIZE, Protection::READ | Protection::WRITE)?;
        cpu.set_reg(Reg::Esp, STACK_TOP);
        cpu.set_reg(Reg::Ebp, STACK_TOP);
        // the code hook takes over before a thunk executes; hlt if it ever does
        cpu.map(THUNK_BASE, THUNK_SIZE, Protection::READ | Protection::EXEC)?;
        cpu.patch(THUNK_BASE, &vec![0xf4; THUNK_SIZE as usize])?;
        init_thread_block(&mut cpu)?;

        let mut thunks = ThunkTable::new();
        let reporter = thunks.add(&UNRESOLVED_REPORTER, false)?;

        Ok(Machine {
            cpu,
            registry: ModuleRegistry::new(config.max_modules),
            tracker: DllTracker::new(),
            heap: Heap::new("heap", HEAP_BASE, HEAP_END, 0x10),
            vmem: Heap::new("virtual memory", VMEM_BASE, VMEM_END, PAGE_SIZE),
            images: Heap::new("image", IMAGE_BASE, IMAGE_END, IMAGE_GRANULARITY),
            host: HostObjects::new(),
            thunks,
            parser,
            trampolines,
            reporter,
            unresolved_calls: Vec::new(),
            last_error: 0,
            depth: 0,
            unloaded: Vec::new(),
            config,
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Guest heap block; the arena maps more pages as it grows.
    pub fn alloc(&mut self, size: u32) -> Result<u32> {
        let allocation = self
            .heap
            .alloc(size)
            .ok_or(ErrorKind::AddressSpaceExhausted(self.heap.name(), size))?;
        if let Some((addr, len)) = allocation.grow {
            self.cpu.map(addr, len, Protection::ALL)?;
        }
        Ok(allocation.addr)
    }

    pub fn free(&mut self, addr: u32) -> bool {
        self.heap.free(addr)
    }

    /// Reserves and maps page-granular virtual memory, at `addr` when given.
    pub fn alloc_virtual(&mut self, addr: u32, size: u32, prot: Protection) -> Result<u32> {
        let size = align(size.max(1), PAGE_SIZE)
            .ok_or(ErrorKind::AddressSpaceExhausted(self.vmem.name(), size))?;
        let base = if addr != 0 {
            let base = addr & !(PAGE_SIZE - 1);
            if !self.vmem.alloc_at(base, size) {
                return Err(ErrorKind::MapConflict(base, size).into());
            }
            base
        } else {
            self.vmem
                .alloc(size)
                .ok_or(ErrorKind::AddressSpaceExhausted(self.vmem.name(), size))?
                .addr
        };
        if let Err(e) = self.cpu.map(base, size, prot) {
            self.vmem.free(base);
            return Err(e);
        }
        Ok(base)
    }

    pub fn free_virtual(&mut self, addr: u32) -> bool {
        if !self.vmem.free(addr) {
            return false;
        }
        self.cpu.unmap(addr);
        true
    }

    #[inline]
    pub fn owner_of(&self, addr: u32) -> Option<ModuleHandle> {
        self.tracker.owner_of(addr)
    }

    /// Whether code at `addr` belongs to a module bound to tracked APIs.
    pub fn tracks_caller(&self, addr: u32) -> bool {
        self.owner_of(addr)
            .and_then(|owner| self.registry.get(owner))
            .map_or(false, |m| m.tracks_resources())
    }

    pub(crate) fn destroy_heap(&mut self, heap: u32) -> bool {
        match self.host.heaps.remove(&heap) {
            Some(private) => {
                for block in private.blocks {
                    self.heap.free(block);
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn close_stream(&mut self, stream: u32) -> bool {
        if self.host.streams.remove(&stream).is_none() {
            return false;
        }
        self.heap.free(stream);
        true
    }
}

/* TEB/PEB, 供 fs:[0x18] 之类的访问 */
fn init_thread_block(cpu: &mut Cpu) -> Result<()> {
    let mut teb = vec![0u8; PAGE_SIZE as usize];
    teb.pwrite_with(0xffff_ffffu32, 0x00, LE)?; // no SEH frame
    teb.pwrite_with(STACK_BASE + STACK_SIZE, 0x04, LE)?;
    teb.pwrite_with(STACK_BASE, 0x08, LE)?;
    teb.pwrite_with(TEB_ADDRESS, 0x18, LE)?;
    teb.pwrite_with(PROCESS_ID, 0x20, LE)?;
    teb.pwrite_with(MAIN_THREAD_ID, 0x24, LE)?;
    teb.pwrite_with(PEB_ADDRESS, 0x30, LE)?;
    let mut peb = vec![0u8; PAGE_SIZE as usize];
    peb.pwrite_with(PROCESS_HEAP, 0x18, LE)?;

    cpu.map(TEB_ADDRESS, PAGE_SIZE, Protection::READ | Protection::WRITE)?;
    cpu.patch(TEB_ADDRESS, &teb)?;
    cpu.map(PEB_ADDRESS, PAGE_SIZE, Protection::READ | Protection::WRITE)?;
    cpu.patch(PEB_ADDRESS, &peb)?;
    if let Err(e) = cpu.load_fs(TEB_ADDRESS) {
        warn!("[-] FS segment unavailable, fs: reads will fault: {}", e);
    }
    Ok(())
}

fn invalid(handle: u32) -> crate::errors::Error {
    ErrorKind::InvalidHandle(handle).into()
}

impl ResourceReleaser for Machine {
    fn release(&mut self, resource: Resource) -> Result<()> {
        debug!("[*] Releasing {}", resource);
        match resource {
            Resource::Library { module, refs } => {
                for _ in 0..refs {
                    if self.registry.get(module).is_none() {
                        return Err(invalid(module.0));
                    }
                    self.release_into(module);
                }
            }
            Resource::Socket(socket) => {
                self.host.sockets.remove(&socket).ok_or_else(|| invalid(socket))?;
            }
            Resource::File { handle, kind } => {
                let closed = match kind {
                    FileKind::Native => self.host.files.remove(&handle).is_some(),
                    FileKind::Descriptor => self.host.descriptors.remove(&handle).is_some(),
                    FileKind::Stream => self.close_stream(handle),
                };
                if !closed {
                    return Err(invalid(handle));
                }
            }
            Resource::CriticalSection(section) => {
                self.host.critical_sections.remove(&section).ok_or_else(|| invalid(section))?;
            }
            Resource::HeapObject(heap) => {
                if !self.destroy_heap(heap) {
                    return Err(invalid(heap));
                }
            }
            Resource::Heap { addr, heap } => {
                if let Some(private) = heap.and_then(|h| self.host.heaps.get_mut(&h)) {
                    private.blocks.remove(&addr);
                }
                if !self.heap.free(addr) {
                    return Err(invalid(addr));
                }
            }
            Resource::VirtualMemory(addr) => {
                if !self.free_virtual(addr) {
                    return Err(invalid(addr));
                }
            }
            Resource::Stub(addr) => {
                if !self.heap.free(addr) {
                    return Err(invalid(addr));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_blocks_are_mapped_and_writable() {
        let mut m = Machine::new(LoaderConfig::new()).unwrap();
        let a = m.alloc(10).unwrap();
        let b = m.alloc(0x3000).unwrap();
        assert!(a >= HEAP_BASE && b > a);
        m.cpu.write_u32(b + 0x2ffc, 1).unwrap();
        assert!(m.free(a));
        assert!(!m.free(a));
    }

    #[test]
    fn virtual_memory_honours_protection() {
        let mut m = Machine::new(LoaderConfig::new()).unwrap();
        let ro = m.alloc_virtual(0, 0x10, Protection::READ).unwrap();
        assert_eq!(ro % PAGE_SIZE, 0);
        assert!(m.cpu.write_u32(ro, 1).is_err());
        assert!(m.free_virtual(ro));
        assert!(!m.cpu.is_mapped(ro));
        assert!(!m.free_virtual(ro));
    }

    #[test]
    fn oversized_requests_are_refused() {
        let mut m = Machine::new(LoaderConfig::new()).unwrap();
        let err = m.alloc(0xffff_ffff).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AddressSpaceExhausted("heap", _)));
        let err = m.alloc_virtual(0, 0xffff_ffff, Protection::READ).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AddressSpaceExhausted("virtual memory", _)));
        assert!(m.alloc_virtual(VMEM_BASE, 0xffff_f000, Protection::READ).is_err());
        // still usable afterwards
        assert_eq!(m.alloc_virtual(0, 0x10, Protection::READ).unwrap(), VMEM_BASE);
    }

    #[test]
    fn thread_block_is_reachable_through_fs() {
        let mut m = Machine::new(LoaderConfig::new()).unwrap();
        // mov eax, fs:[0x30]; ret
        let f = m.alloc(8).unwrap();
        m.cpu.patch(f, &[0x64, 0xa1, 0x30, 0x00, 0x00, 0x00, 0xc3]).unwrap();
        assert_eq!(m.call(f, &[]).unwrap(), PEB_ADDRESS);
        assert_eq!(m.cpu.read_u32(PEB_ADDRESS + 0x18).unwrap(), PROCESS_HEAP);
        assert_eq!(m.cpu.read_u32(TEB_ADDRESS + 0x18).unwrap(), TEB_ADDRESS);
    }

    #[test]
    fn releasing_unknown_handles_fails_without_side_effects() {
        let mut m = Machine::new(LoaderConfig::new()).unwrap();
        assert!(m.release(Resource::Socket(0x104)).is_err());
        assert!(m.release(Resource::Heap { addr: HEAP_BASE, heap: None }).is_err());
        let block = m.alloc(16).unwrap();
        m.release(Resource::Heap { addr: block, heap: None }).unwrap();
        assert!(m.release(Resource::Heap { addr: block, heap: None }).is_err());
    }
}
