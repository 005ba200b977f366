use std::cmp::{max, min};
use std::collections::BTreeMap;

use bitflags::bitflags;
use unicorn_engine::unicorn_const::Permission;
use widestring::U16String;

use super::{Access, Cpu, Fault};
use crate::errors::{ErrorKind, Result};
use crate::heap::PAGE_SIZE;

bitflags! {
    pub struct Protection: u32 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXEC = 0b100;
        const ALL = 0b111;
    }
}

impl From<Protection> for Permission {
    fn from(prot: Protection) -> Permission {
        let mut perms = Permission::NONE;
        if prot.contains(Protection::READ) {
            perms |= Permission::READ;
        }
        if prot.contains(Protection::WRITE) {
            perms |= Permission::WRITE;
        }
        if prot.contains(Protection::EXEC) {
            perms |= Permission::EXEC;
        }
        perms
    }
}

impl Access {
    fn required(self) -> Protection {
        match self {
            Access::Read => Protection::READ,
            Access::Write => Protection::WRITE,
            Access::Fetch => Protection::EXEC,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(super) struct Region {
    size: u32,
    prot: Protection,
}

/// What is mapped where. The bytes live in the emulator; this map answers
/// unmap sizes and the protection checks of host-side accesses, which the
/// emulator itself does not apply.
pub(super) type Regions = BTreeMap<u32, Region>;

#[inline]
fn end(base: u32, region: &Region) -> u64 {
    base as u64 + region.size as u64
}

impl Cpu {
    /// Maps a page-aligned, zero-filled range.
    pub fn map(&mut self, addr: u32, size: u32, prot: Protection) -> Result<()> {
        let aligned = addr % PAGE_SIZE == 0 && size % PAGE_SIZE == 0;
        if size == 0 || !aligned || addr as u64 + size as u64 > 1 << 32 || self.overlaps(addr, size) {
            return Err(ErrorKind::MapConflict(addr, size).into());
        }
        self.uc.mem_map(addr as u64, size as usize, prot.into())?;
        self.regions.insert(addr, Region { size, prot });
        Ok(())
    }

    /// Drops the region that starts exactly at `addr`.
    pub fn unmap(&mut self, addr: u32) -> bool {
        match self.regions.remove(&addr) {
            Some(region) => self.uc.mem_unmap(addr as u64, region.size as usize).is_ok(),
            None => false,
        }
    }

    pub fn is_mapped(&self, addr: u32) -> bool {
        self.region(addr).is_some()
    }

    fn overlaps(&self, addr: u32, size: u32) -> bool {
        let stop = addr as u64 + size as u64;
        if let Some((base, region)) = self.regions.range(..=addr).next_back() {
            if end(*base, region) > addr as u64 {
                return true;
            }
        }
        self.regions.range(addr..).next().map_or(false, |(base, _)| (*base as u64) < stop)
    }

    fn region(&self, addr: u32) -> Option<(u32, &Region)> {
        self.regions
            .range(..=addr)
            .next_back()
            .filter(|(base, region)| (addr as u64) < end(**base, region))
            .map(|(base, region)| (*base, region))
    }

    /// Every byte of `[addr, addr + len)` mapped, and with `enforce` set,
    /// every region allowing `access`.
    fn check(&self, addr: u32, len: usize, access: Access, enforce: bool) -> std::result::Result<(), Fault> {
        let stop = addr as u64 + len as u64;
        let mut cur = addr as u64;
        while cur < stop {
            let at = cur as u32;
            if cur > u32::MAX as u64 {
                return Err(Fault::Unmapped { addr: at, access });
            }
            let (base, region) = self.region(at).ok_or(Fault::Unmapped { addr: at, access })?;
            if enforce && !region.prot.contains(access.required()) {
                return Err(Fault::Protection { addr: at, access });
            }
            cur = end(base, region);
        }
        Ok(())
    }

    /// Checked read; `access` decides which protection bit is required.
    pub fn read(&self, addr: u32, buf: &mut [u8], access: Access) -> std::result::Result<(), Fault> {
        self.check(addr, buf.len(), access, true)?;
        self.uc.mem_read(addr as u64, buf).map_err(|_| Fault::Unmapped { addr, access })
    }

    pub fn write(&mut self, addr: u32, bytes: &[u8]) -> std::result::Result<(), Fault> {
        self.store(addr, bytes, true)
    }

    /// Loader-side write that ignores page protection (IAT fixups, relocations).
    pub fn patch(&mut self, addr: u32, bytes: &[u8]) -> std::result::Result<(), Fault> {
        self.store(addr, bytes, false)
    }

    fn store(&mut self, addr: u32, bytes: &[u8], checked: bool) -> std::result::Result<(), Fault> {
        let access = Access::Write;
        self.check(addr, bytes.len(), access, checked)?;
        self.uc.mem_write(addr as u64, bytes).map_err(|_| Fault::Unmapped { addr, access })
    }

    pub fn read_u8(&self, addr: u32, access: Access) -> std::result::Result<u8, Fault> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf, access)?;
        Ok(buf[0])
    }

    pub fn read_u32(&self, addr: u32) -> std::result::Result<u32, Fault> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf, Access::Read)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> std::result::Result<(), Fault> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn read_vec(&self, addr: u32, size: usize) -> std::result::Result<Vec<u8>, Fault> {
        let mut buf = vec![0u8; size];
        self.read(addr, &mut buf, Access::Read)?;
        Ok(buf)
    }

    /* 读取以 0 结尾的字符串 */
    pub fn read_cstring(&self, addr: u32, max: usize) -> std::result::Result<String, Fault> {
        let mut bytes = Vec::new();
        for i in 0..max as u32 {
            let b = self.read_u8(addr.wrapping_add(i), Access::Read)?;
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn read_wstring(&self, addr: u32, max: usize) -> std::result::Result<String, Fault> {
        let mut units: Vec<u16> = Vec::new();
        let mut buf = [0u8; 2];
        for i in 0..max as u32 {
            self.read(addr.wrapping_add(i * 2), &mut buf, Access::Read)?;
            let unit = u16::from_le_bytes(buf);
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        Ok(U16String::from_vec(units).to_string_lossy())
    }

    /// Copy of `[addr, addr + size)` where unmapped bytes read as zero.
    pub fn snapshot(&self, addr: u32, size: u32) -> Vec<u8> {
        let mut out = vec![0u8; size as usize];
        let stop = addr as u64 + size as u64;
        let first = self.region(addr).map_or(addr, |(base, _)| base);
        for (base, region) in self.regions.range(first..) {
            let from = max(*base as u64, addr as u64);
            let to = min(end(*base, region), stop);
            if from >= stop {
                break;
            }
            if from >= to {
                continue;
            }
            let at = (from - addr as u64) as usize;
            let len = (to - from) as usize;
            if self.uc.mem_read(from, &mut out[at..at + len]).is_err() {
                out[at..at + len].iter_mut().for_each(|b| *b = 0);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu() -> Cpu {
        Cpu::new(0x7fff_0000, (0x7f00_0000, 0x7f00_ffff)).unwrap()
    }

    #[test]
    fn rejects_overlapping_and_unaligned_maps() {
        let mut cpu = cpu();
        cpu.map(0x1000, 0x2000, Protection::READ).unwrap();
        assert!(cpu.map(0x2000, 0x1000, Protection::READ).is_err());
        assert!(cpu.map(0x0000, 0x2000, Protection::READ).is_err());
        assert!(cpu.map(0x3800, 0x1000, Protection::READ).is_err());
        cpu.map(0x3000, 0x1000, Protection::READ).unwrap();
        assert!(cpu.unmap(0x1000));
        assert!(!cpu.unmap(0x1000));
        cpu.map(0x1000, 0x1000, Protection::READ).unwrap();
    }

    #[test]
    fn reads_span_adjacent_regions() {
        let mut cpu = cpu();
        cpu.map(0x1000, 0x1000, Protection::ALL).unwrap();
        cpu.map(0x2000, 0x1000, Protection::ALL).unwrap();
        cpu.write_u32(0x1ffe, 0xdeadbeef).unwrap();
        assert_eq!(cpu.read_u32(0x1ffe).unwrap(), 0xdeadbeef);
    }

    #[test]
    fn enforces_protection() {
        let mut cpu = cpu();
        cpu.map(0x1000, 0x1000, Protection::READ).unwrap();
        assert_eq!(
            cpu.write_u32(0x1000, 1),
            Err(Fault::Protection { addr: 0x1000, access: Access::Write })
        );
        cpu.patch(0x1000, &7u32.to_le_bytes()).unwrap();
        assert_eq!(cpu.read_u32(0x1000).unwrap(), 7);
        assert_eq!(
            cpu.read_u8(0x1000, Access::Fetch),
            Err(Fault::Protection { addr: 0x1000, access: Access::Fetch })
        );
        assert_eq!(cpu.read_u32(0x5000), Err(Fault::Unmapped { addr: 0x5000, access: Access::Read }));
        // the tail runs off the mapping
        assert_eq!(cpu.read_u32(0x1ffe), Err(Fault::Unmapped { addr: 0x2000, access: Access::Read }));
    }

    #[test]
    fn reads_strings() {
        let mut cpu = cpu();
        cpu.map(0x1000, 0x1000, Protection::ALL).unwrap();
        cpu.write(0x1000, b"codec.dll\0junk").unwrap();
        assert_eq!(cpu.read_cstring(0x1000, 260).unwrap(), "codec.dll");
        let wide: Vec<u8> = "a.ax\0".encode_utf16().flat_map(|u| u.to_le_bytes().to_vec()).collect();
        cpu.write(0x1100, &wide).unwrap();
        assert_eq!(cpu.read_wstring(0x1100, 260).unwrap(), "a.ax");
    }

    #[test]
    fn snapshot_zero_fills_holes() {
        let mut cpu = cpu();
        cpu.map(0x2000, 0x1000, Protection::READ).unwrap();
        cpu.patch(0x2000, &[1, 2, 3, 4]).unwrap();
        let bytes = cpu.snapshot(0x1ffe, 6);
        assert_eq!(bytes, vec![0, 0, 1, 2, 3, 4]);
        assert_eq!(cpu.snapshot(0x9000, 2), vec![0, 0]);
    }
}
