//! Dummy trampolines for imports nothing could satisfy.
//!
//! A stub is one contiguous block: code that reports `(module, symbol)` to
//! a fixed reporter function and returns zero, followed by the two names it
//! reports. The code refers to the names by absolute address, patched in
//! when the block's final address is known.

use scroll::Pwrite;

use crate::errors::Result;

pub trait TrampolineFactory: Send {
    /// Bytes needed for the stub of `(owner, symbol)`.
    fn size(&self, owner: &str, symbol: &str) -> u32;

    /// Stub bytes for placement at `base`; `reporter` receives
    /// `(owner_name_ptr, symbol_name_ptr)`.
    fn generate(&self, base: u32, owner: &str, symbol: &str, reporter: u32) -> Result<Vec<u8>>;
}

/// 32-bit x86 stub; a plain `ret` leaves argument cleanup to the caller.
pub struct X86Trampolines;

const X86_STUB: [u8; 23] = [
    0x68, 0, 0, 0, 0, // push symbol
    0x68, 0, 0, 0, 0, // push module
    0xb8, 0, 0, 0, 0, // mov eax, reporter
    0xff, 0xd0, // call eax
    0x83, 0xc4, 0x08, // add esp, 8
    0x31, 0xc0, // xor eax, eax
    0xc3, // ret
];
const SYMBOL_PTR: usize = 1;
const MODULE_PTR: usize = 6;
const REPORTER_PTR: usize = 11;

impl TrampolineFactory for X86Trampolines {
    fn size(&self, owner: &str, symbol: &str) -> u32 {
        (X86_STUB.len() + owner.len() + 1 + symbol.len() + 1) as u32
    }

    fn generate(&self, base: u32, owner: &str, symbol: &str, reporter: u32) -> Result<Vec<u8>> {
        let mut block = Vec::with_capacity(self.size(owner, symbol) as usize);
        block.extend_from_slice(&X86_STUB);
        let module_at = base + block.len() as u32;
        block.extend_from_slice(owner.as_bytes());
        block.push(0);
        let symbol_at = base + block.len() as u32;
        block.extend_from_slice(symbol.as_bytes());
        block.push(0);

        block.pwrite_with(symbol_at, SYMBOL_PTR, scroll::LE)?;
        block.pwrite_with(module_at, MODULE_PTR, scroll::LE)?;
        block.pwrite_with(reporter, REPORTER_PTR, scroll::LE)?;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{Cpu, Protection, Reg, Stop};

    #[test]
    fn stub_reports_names_and_returns_zero() {
        let base = 0x2000;
        let reporter = 0x3000;
        let block = X86Trampolines.generate(base, "codec.dll", "FooBar123", reporter).unwrap();
        assert_eq!(block.len() as u32, X86Trampolines.size("codec.dll", "FooBar123"));

        let sentinel = 0x7fff_0000;
        let mut cpu = Cpu::new(sentinel, (0x3000, 0x3fff)).unwrap();
        cpu.map(0x2000, 0x1000, Protection::ALL).unwrap();
        cpu.patch(base, &block).unwrap();
        cpu.map(0x3000, 0x1000, Protection::READ | Protection::EXEC).unwrap();
        cpu.map(0x8000, 0x1000, Protection::READ | Protection::WRITE).unwrap();
        cpu.set_reg(Reg::Esp, 0x8800);
        cpu.push(sentinel).unwrap();

        assert_eq!(cpu.run(base), Ok(Stop::Trap(reporter)));
        let module_ptr = cpu.stack(1).unwrap();
        let symbol_ptr = cpu.stack(2).unwrap();
        assert_eq!(cpu.read_cstring(module_ptr, 64).unwrap(), "codec.dll");
        assert_eq!(cpu.read_cstring(symbol_ptr, 64).unwrap(), "FooBar123");

        // the reporter is cdecl: return with eax set, arguments left in place
        let ret = cpu.pop().unwrap();
        cpu.set_reg(Reg::Eax, 0x55);
        assert_eq!(cpu.run(ret), Ok(Stop::Returned));
        assert_eq!(cpu.reg(Reg::Eax), 0);
        assert_eq!(cpu.reg(Reg::Esp), 0x8800);
    }
}
