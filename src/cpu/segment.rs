use byte_slice_cast::AsByteSlice;
use scroll::{Pwrite, LE};
use unicorn_engine::RegisterX86;

use super::{Cpu, Protection};
use crate::errors::Result;
use crate::heap::PAGE_SIZE;

const GDT_ADDRESS: u32 = 0xc000_0000;
const GDT_ENTRIES: usize = 31;
const FS_INDEX: usize = 16;
/// Index 16, GDT, RPL 3.
const FS_SELECTOR: u64 = (FS_INDEX as u64) << 3 | 3;

// access byte: present, dpl, s, type
const CODE_RING3: u8 = 0xfb;
const DATA_RING3: u8 = 0xf3;
const DATA_RING0: u8 = 0x93;
// flags nibble
const FLAG_DB: u64 = 0b0100;
const FLAG_G: u64 = 0b1000;

/* 段描述符 */
fn descriptor(base: u32, limit: u32, access: u8) -> u64 {
    let (limit, granularity) = if limit > 0xfffff { (limit >> 12, FLAG_G) } else { (limit, 0) };
    let (base, limit) = (base as u64, limit as u64);
    (limit & 0xffff)
        | (base & 0xff_ffff) << 16
        | (access as u64) << 40
        | (limit >> 16 & 0xf) << 48
        | (FLAG_DB | granularity) << 52
        | (base >> 24) << 56
}

impl Cpu {
    /// Installs a flat GDT whose FS segment starts at `fs_base` and loads FS,
    /// so `fs:[0x18]` style TEB reads resolve.
    pub fn load_fs(&mut self, fs_base: u32) -> Result<()> {
        let mut gdt = [0u64; GDT_ENTRIES];
        gdt[14] = descriptor(0, 0xffff_f000, CODE_RING3);
        gdt[15] = descriptor(0, 0xffff_f000, DATA_RING3);
        gdt[FS_INDEX] = descriptor(fs_base, 0xfff, DATA_RING3);
        gdt[17] = descriptor(0, 0xffff_f000, DATA_RING0);

        self.map(GDT_ADDRESS, PAGE_SIZE, Protection::READ | Protection::WRITE)?;
        self.patch(GDT_ADDRESS, gdt[..].as_byte_slice())?;

        // uc_x86_mmr: selector, base, limit, flags
        let mut gdtr = [0u8; 24];
        gdtr.pwrite_with(GDT_ADDRESS as u64, 8, LE)?;
        gdtr.pwrite_with((GDT_ENTRIES * 8 - 1) as u32, 16, LE)?;
        self.uc.reg_write_long(RegisterX86::GDTR, &gdtr)?;
        self.uc.reg_write(RegisterX86::FS, FS_SELECTOR)?;
        Ok(())
    }
}
