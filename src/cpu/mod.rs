//! 32-bit x86 guest, run by unicorn.
//!
//! Module code never runs on the host CPU. [`Cpu`] owns the emulator, a map
//! of the guest regions and the hooks that hand control back to the host.
//! Reaching a trap address (an emulated API thunk) or the return sentinel
//! ends a run with a [`Stop`]. Running out of instruction budget, an invalid
//! access and an unhandled interrupt end it with a [`Fault`], so the caller
//! can recover at the call boundary.

mod exec;
pub mod memory;
mod segment;

use std::fmt;

use unicorn_engine::unicorn_const::{Arch, Mode};
use unicorn_engine::{RegisterX86, Unicorn};

use self::exec::Guest;
use crate::errors::Result;
use crate::heap::PAGE_SIZE;

pub use self::exec::Stop;
pub use self::memory::Protection;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Fetch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Unmapped { addr: u32, access: Access },
    Protection { addr: u32, access: Access },
    InvalidOpcode { eip: u32 },
    Breakpoint { eip: u32 },
    Interrupt { eip: u32, number: u32 },
    Halt { eip: u32 },
    BudgetExhausted { steps: u64 },
    /// Any other emulator error, by `uc_err` code.
    Engine { eip: u32, code: u32 },
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Fault::Unmapped { addr, access } => write!(f, "{:?} of unmapped address 0x{:08x}", access, addr),
            Fault::Protection { addr, access } => write!(f, "{:?} violates protection at 0x{:08x}", access, addr),
            Fault::InvalidOpcode { eip } => write!(f, "invalid instruction at 0x{:08x}", eip),
            Fault::Breakpoint { eip } => write!(f, "breakpoint at 0x{:08x}", eip),
            Fault::Interrupt { eip, number } => write!(f, "unhandled interrupt {} at 0x{:08x}", number, eip),
            Fault::Halt { eip } => write!(f, "hlt at 0x{:08x}", eip),
            Fault::BudgetExhausted { steps } => write!(f, "instruction budget exhausted after {} steps", steps),
            Fault::Engine { eip, code } => write!(f, "emulator error {} at 0x{:08x}", code, eip),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reg {
    Eax = 0,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
}

const GPR: [RegisterX86; 8] = [
    RegisterX86::EAX,
    RegisterX86::ECX,
    RegisterX86::EDX,
    RegisterX86::EBX,
    RegisterX86::ESP,
    RegisterX86::EBP,
    RegisterX86::ESI,
    RegisterX86::EDI,
];

/// Register file saved around host-to-guest calls.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    pub gpr: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
}

pub struct Cpu {
    uc: Unicorn<'static, Guest>,
    regions: memory::Regions,
}

// The engine handle is an `Rc` whose only other clones sit in the hook
// table owned by the same engine, so the whole set moves between threads
// together and `Cpu` is never shared without the runtime lock.
unsafe impl Send for Cpu {}

impl Cpu {
    /// A guest with nothing but the sentinel page mapped. Runs end when
    /// they reach `sentinel` or any address in the inclusive `traps` range.
    pub fn new(sentinel: u32, traps: (u32, u32)) -> Result<Cpu> {
        let uc = Unicorn::new_with_data(Arch::X86, Mode::MODE_32, Guest::new(sentinel, traps))?;
        let mut cpu = Cpu { uc, regions: memory::Regions::default() };
        cpu.install_hooks()?;
        // 返回哨兵, hook 在执行前接管; hlt 兜底
        let page = sentinel & !(PAGE_SIZE - 1);
        cpu.map(page, PAGE_SIZE, Protection::READ | Protection::EXEC)?;
        cpu.patch(page, &vec![0xf4; PAGE_SIZE as usize])?;
        Ok(cpu)
    }

    #[inline]
    pub fn reg(&self, reg: Reg) -> u32 {
        self.uc.reg_read(GPR[reg as usize]).unwrap_or(0) as u32
    }

    #[inline]
    pub fn set_reg(&mut self, reg: Reg, value: u32) {
        // general purpose registers always accept a write
        let _ = self.uc.reg_write(GPR[reg as usize], value as u64);
    }

    #[inline]
    pub fn eip(&self) -> u32 {
        self.uc.reg_read(RegisterX86::EIP).unwrap_or(0) as u32
    }

    #[inline]
    pub fn set_eip(&mut self, eip: u32) {
        let _ = self.uc.reg_write(RegisterX86::EIP, eip as u64);
    }

    pub fn registers(&self) -> Registers {
        let mut regs = Registers {
            gpr: [0; 8],
            eip: self.eip(),
            eflags: self.uc.reg_read(RegisterX86::EFLAGS).unwrap_or(0) as u32,
        };
        for (value, reg) in regs.gpr.iter_mut().zip(GPR.iter()) {
            *value = self.uc.reg_read(*reg).unwrap_or(0) as u32;
        }
        regs
    }

    pub fn set_registers(&mut self, regs: &Registers) {
        for (value, reg) in regs.gpr.iter().zip(GPR.iter()) {
            let _ = self.uc.reg_write(*reg, *value as u64);
        }
        let _ = self.uc.reg_write(RegisterX86::EFLAGS, regs.eflags as u64);
        self.set_eip(regs.eip);
    }

    pub fn push(&mut self, value: u32) -> std::result::Result<(), Fault> {
        let esp = self.reg(Reg::Esp).wrapping_sub(4);
        self.write_u32(esp, value)?;
        self.set_reg(Reg::Esp, esp);
        Ok(())
    }

    pub fn pop(&mut self) -> std::result::Result<u32, Fault> {
        let esp = self.reg(Reg::Esp);
        let value = self.read_u32(esp)?;
        self.set_reg(Reg::Esp, esp.wrapping_add(4));
        Ok(value)
    }

    /// `n`-th 32-bit stack slot above `esp`.
    pub fn stack(&self, n: u32) -> std::result::Result<u32, Fault> {
        self.read_u32(self.reg(Reg::Esp).wrapping_add(n * 4))
    }
}
