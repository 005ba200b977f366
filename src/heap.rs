use std::collections::BTreeMap;

use crate::utils::align;

/*
 * 简单的区间分配器: 管理一段 guest 地址空间 (堆 / 虚拟内存 / 模块映像)
 */
pub struct Heap {
    name: &'static str,
    start_address: u32,
    end_address: u32,
    granularity: u32,
    current_alloc: u32,                 // 已映射的末尾
    current_use: u32,                   // 已分配的末尾
    chunks: BTreeMap<u32, (u32, bool)>, // 地址 <-> (大小, 使用?)
}

pub const PAGE_SIZE: u32 = 0x1000;

/// Result of an allocation: the block address, plus the range the caller
/// must map when the arena had to grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub addr: u32,
    pub grow: Option<(u32, u32)>,
}

impl Heap {
    pub fn new(name: &'static str, start: u32, end: u32, granularity: u32) -> Heap {
        Heap {
            name,
            start_address: start,
            end_address: end,
            granularity,
            current_alloc: start,
            current_use: start,
            chunks: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start_address && addr < self.end_address
    }

    #[inline]
    fn get_first_match(&self, size: u32) -> Option<(u32, u32)> {
        self.chunks
            .iter()
            .filter(|&(_, &(v, in_use))| v >= size && !in_use)
            .min_by_key(|&(_, &(v, _))| v)
            .map(|(addr, &(v, _))| (*addr, v))
    }

    /// Zero-sized requests still get a distinct block; `None` once the
    /// rounded request no longer fits.
    pub fn alloc(&mut self, size: u32) -> Option<Allocation> {
        let size = align(size.max(1), self.granularity)?;
        // 复用大小最合适的空闲块
        if let Some((addr, chunk_size)) = self.get_first_match(size) {
            self.split(addr, chunk_size, addr, size);
            return Some(Allocation { addr, grow: None });
        }
        let addr = self.current_use;
        let end = addr.checked_add(size).filter(|end| *end <= self.end_address)?;
        let grow = if end > self.current_alloc {
            let from = self.current_alloc;
            Some((from, align(end - from, PAGE_SIZE)?))
        } else {
            None
        };
        self.chunks.insert(addr, (size, true));
        self.current_use = end;
        if let Some((from, real_size)) = grow {
            self.current_alloc = from + real_size;
        }
        Some(Allocation { addr, grow })
    }

    /// Claims `[addr, addr + size)` if no live block intersects it.
    /// Used to honour a module's preferred base address.
    pub fn alloc_at(&mut self, addr: u32, size: u32) -> bool {
        let size = match align(size.max(1), self.granularity) {
            Some(size) => size,
            None => return false,
        };
        let end = addr as u64 + size as u64;
        if addr < self.start_address || end > self.end_address as u64 || addr % self.granularity != 0 {
            return false;
        }
        if addr < self.current_use {
            // below the watermark only a free chunk covering the whole range will do
            let found = self.chunks.range(..=addr).next_back().map(|(a, c)| (*a, *c));
            return match found {
                Some((chunk_addr, (chunk_size, false)))
                    if chunk_addr as u64 + chunk_size as u64 >= end =>
                {
                    self.split(chunk_addr, chunk_size, addr, size);
                    true
                }
                _ => false,
            };
        }
        // the gap between the watermark and `addr` becomes a free chunk
        if addr > self.current_use {
            self.chunks.insert(self.current_use, (addr - self.current_use, false));
        }
        self.chunks.insert(addr, (size, true));
        self.current_use = end as u32;
        self.current_alloc = self.current_alloc.max(self.current_use);
        true
    }

    // 地址大小
    pub fn size(&self, addr: u32) -> Option<u32> {
        match self.chunks.get(&addr) {
            Some(&(size, true)) => Some(size),
            _ => None,
        }
    }

    /// Releases a live block; `false` for unknown or already freed addresses.
    pub fn free(&mut self, addr: u32) -> bool {
        let mut size = match self.chunks.get(&addr) {
            Some(&(size, true)) => size,
            _ => return false,
        };
        // 合并后面的空闲块
        let next = addr + size;
        if let Some(&(next_size, false)) = self.chunks.get(&next) {
            self.chunks.remove(&next);
            size += next_size;
        }
        // 合并前面的空闲块
        let prev = self.chunks.range(..addr).next_back().map(|(a, c)| (*a, *c));
        match prev {
            Some((prev_addr, (prev_size, false))) if prev_addr + prev_size == addr => {
                self.chunks.remove(&addr);
                self.chunks.insert(prev_addr, (prev_size + size, false));
            }
            _ => {
                self.chunks.insert(addr, (size, false));
            }
        }
        true
    }

    /* 在空闲块 chunk 中切出 [addr, addr + size) */
    fn split(&mut self, chunk_addr: u32, chunk_size: u32, addr: u32, size: u32) {
        if addr > chunk_addr {
            self.chunks.insert(chunk_addr, (addr - chunk_addr, false));
        }
        self.chunks.insert(addr, (size, true));
        let chunk_end = chunk_addr + chunk_size;
        let end = addr + size;
        if chunk_end > end {
            self.chunks.insert(end, (chunk_end - end, false));
        }
    }

    pub fn live_blocks(&self) -> usize {
        self.chunks.values().filter(|(_, in_use)| *in_use).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_in_pages_and_reuses_free_chunks() {
        let mut heap = Heap::new("heap", 0x5000_0000, 0x5010_0000, 16);
        let a = heap.alloc(10).unwrap();
        assert_eq!(a, Allocation { addr: 0x5000_0000, grow: Some((0x5000_0000, PAGE_SIZE)) });
        let b = heap.alloc(20).unwrap();
        assert_eq!(b, Allocation { addr: 0x5000_0010, grow: None });
        assert!(heap.free(a.addr));
        assert!(!heap.free(a.addr));
        let c = heap.alloc(4).unwrap();
        assert_eq!(c.addr, a.addr);
        assert_eq!(heap.size(b.addr), Some(32));
    }

    #[test]
    fn zero_sized_blocks_are_distinct() {
        let mut heap = Heap::new("heap", 0x1000, 0x2000, 4);
        let a = heap.alloc(0).unwrap().addr;
        let b = heap.alloc(0).unwrap().addr;
        assert_ne!(a, b);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut heap = Heap::new("vm", 0x1000, 0x3000, PAGE_SIZE);
        assert!(heap.alloc(0x1000).is_some());
        assert!(heap.alloc(0x1000).is_some());
        assert!(heap.alloc(1).is_none());
    }

    #[test]
    fn oversized_requests_fail_cleanly() {
        let mut heap = Heap::new("heap", 0x5000_0000, 0x6000_0000, 16);
        assert_eq!(heap.alloc(0xffff_ffff), None);
        assert_eq!(heap.alloc(0xffff_fff1), None);
        assert!(!heap.alloc_at(0x5000_0000, 0xffff_ffff));
        // nothing was claimed on the way
        assert_eq!(heap.live_blocks(), 0);
        assert_eq!(heap.alloc(10).unwrap().addr, 0x5000_0000);
    }

    #[test]
    fn preferred_address_claims() {
        let mut images = Heap::new("image", 0x1000_0000, 0x2000_0000, PAGE_SIZE);
        assert!(images.alloc_at(0x1010_0000, 0x3000));
        assert!(!images.alloc_at(0x1010_0000, 0x1000));
        // the gap below the claim is handed out first
        assert_eq!(images.alloc(0x2000).unwrap().addr, 0x1000_0000);
        assert!(images.free(0x1010_0000));
        assert!(images.alloc_at(0x1010_0000, 0x2000));
    }
}
