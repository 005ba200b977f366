use unicorn_engine::unicorn_const::{uc_error, HookType, MemType};
use unicorn_engine::{RegisterX86, Unicorn};

use super::{Access, Cpu, Fault};
use crate::errors::Result;

/// Why a run handed control back to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stop {
    /// `ret` landed on the sentinel.
    Returned,
    /// Execution reached a trap address.
    Trap(u32),
}

/// Engine user data, shared with the hooks.
pub struct Guest {
    sentinel: u32,
    traps: (u32, u32),
    executed: u64,
    budget: u64,
    stop: Option<std::result::Result<Stop, Fault>>,
}

impl Guest {
    pub(super) fn new(sentinel: u32, traps: (u32, u32)) -> Guest {
        Guest { sentinel, traps, executed: 0, budget: u64::MAX, stop: None }
    }
}

fn halt(uc: &mut Unicorn<Guest>, stop: std::result::Result<Stop, Fault>) {
    uc.get_data_mut().stop = Some(stop);
    let _ = uc.emu_stop();
}

fn eip_of(uc: &Unicorn<Guest>) -> u32 {
    uc.reg_read(RegisterX86::EIP).unwrap_or(0) as u32
}

impl Cpu {
    pub(super) fn install_hooks(&mut self) -> Result<()> {
        // begin > end covers the whole address space
        self.uc.add_code_hook(1, 0, |uc, addr, _size| {
            let addr = addr as u32;
            let guest = uc.get_data_mut();
            let stop = if addr == guest.sentinel {
                Ok(Stop::Returned)
            } else if addr >= guest.traps.0 && addr <= guest.traps.1 {
                Ok(Stop::Trap(addr))
            } else if guest.executed >= guest.budget {
                Err(Fault::BudgetExhausted { steps: guest.executed })
            } else {
                guest.executed += 1;
                return;
            };
            halt(uc, stop);
        })?;

        self.uc.add_mem_hook(HookType::MEM_INVALID, 1, 0, |uc, kind, addr, _size, _value| {
            let addr = addr as u32;
            let fault = match kind {
                MemType::READ_UNMAPPED => Fault::Unmapped { addr, access: Access::Read },
                MemType::WRITE_UNMAPPED => Fault::Unmapped { addr, access: Access::Write },
                MemType::FETCH_UNMAPPED => Fault::Unmapped { addr, access: Access::Fetch },
                MemType::READ_PROT => Fault::Protection { addr, access: Access::Read },
                MemType::WRITE_PROT => Fault::Protection { addr, access: Access::Write },
                _ => Fault::Protection { addr, access: Access::Fetch },
            };
            halt(uc, Err(fault));
            false
        })?;

        self.uc.add_intr_hook(|uc, number| {
            let eip = eip_of(uc);
            let fault = match number {
                3 => Fault::Breakpoint { eip },
                6 => Fault::InvalidOpcode { eip },
                _ => Fault::Interrupt { eip, number },
            };
            halt(uc, Err(fault));
        })?;
        Ok(())
    }

    /// Caps the instructions every following run may execute, counted
    /// across runs until the next call.
    pub fn set_budget(&mut self, steps: u64) {
        let guest = self.uc.get_data_mut();
        guest.budget = steps;
        guest.executed = 0;
    }

    /// Runs from `begin` until a [`Stop`] or a fault.
    pub fn run(&mut self, begin: u32) -> std::result::Result<Stop, Fault> {
        let sentinel = self.uc.get_data().sentinel;
        self.uc.get_data_mut().stop = None;
        let result = self.uc.emu_start(begin as u64, sentinel as u64, 0, 0);
        if let Some(stop) = self.uc.get_data_mut().stop.take() {
            return stop;
        }
        let eip = self.eip();
        match result {
            Ok(()) if eip == sentinel => Ok(Stop::Returned),
            Ok(()) => Err(Fault::Halt { eip }),
            Err(uc_error::INSN_INVALID) => Err(Fault::InvalidOpcode { eip }),
            Err(e) => Err(Fault::Engine { eip, code: e as u32 }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Protection, Reg};
    use super::*;

    const CODE: u32 = 0x1000;
    const STACK: u32 = 0x8000;
    const SENTINEL: u32 = 0x7fff_0000;

    fn cpu_with(code: &[u8]) -> Cpu {
        let mut cpu = Cpu::new(SENTINEL, (0x3000, 0x3fff)).unwrap();
        cpu.map(CODE, 0x1000, Protection::READ | Protection::EXEC).unwrap();
        cpu.patch(CODE, code).unwrap();
        cpu.map(STACK, 0x1000, Protection::READ | Protection::WRITE).unwrap();
        cpu.set_reg(Reg::Esp, STACK + 0x800);
        cpu
    }

    fn call(cpu: &mut Cpu, arg: u32) -> std::result::Result<Stop, Fault> {
        cpu.push(arg).unwrap();
        cpu.push(SENTINEL).unwrap();
        cpu.run(CODE)
    }

    #[test]
    fn runs_compiled_code_to_the_sentinel() {
        // movzx eax, byte [esp+4]; shl eax, 4; imul eax, eax, 3; ret
        let code = [0x0f, 0xb6, 0x44, 0x24, 0x04, 0xc1, 0xe0, 0x04, 0x6b, 0xc0, 0x03, 0xc3];
        let mut cpu = cpu_with(&code);
        assert_eq!(call(&mut cpu, 0x1ff), Ok(Stop::Returned));
        assert_eq!(cpu.reg(Reg::Eax), 0x2fd0);
        assert_eq!(cpu.reg(Reg::Esp), STACK + 0x800 - 4);
    }

    #[test]
    fn trap_hands_back_with_the_stack_intact() {
        // push 7; call dword [0x1100]; ret
        let code = [0x6a, 0x07, 0xff, 0x15, 0x00, 0x11, 0x00, 0x00, 0xc3];
        let mut cpu = cpu_with(&code);
        cpu.patch(0x1100, &0x3010u32.to_le_bytes()).unwrap();
        assert_eq!(call(&mut cpu, 0), Ok(Stop::Trap(0x3010)));
        assert_eq!(cpu.stack(0).unwrap(), CODE + 8);
        assert_eq!(cpu.stack(1).unwrap(), 7);

        // the host finishes the stdcall
        let ret = cpu.pop().unwrap();
        cpu.pop().unwrap();
        cpu.set_reg(Reg::Eax, 0x55);
        assert_eq!(cpu.run(ret), Ok(Stop::Returned));
        assert_eq!(cpu.reg(Reg::Eax), 0x55);
    }

    #[test]
    fn faults_are_values() {
        // mov eax, [0x1234]
        let mut cpu = cpu_with(&[0xa1, 0x34, 0x12, 0x00, 0x00, 0xc3]);
        assert_eq!(call(&mut cpu, 0), Err(Fault::Unmapped { addr: 0x1234, access: Access::Read }));

        // mov [0x1100], eax
        let mut cpu = cpu_with(&[0xa3, 0x00, 0x11, 0x00, 0x00, 0xc3]);
        assert_eq!(call(&mut cpu, 0), Err(Fault::Protection { addr: 0x1100, access: Access::Write }));

        let mut cpu = cpu_with(&[0xcc]);
        assert!(matches!(call(&mut cpu, 0), Err(Fault::Breakpoint { .. })));

        let mut cpu = cpu_with(&[0x0f, 0x0b]);
        assert!(matches!(call(&mut cpu, 0), Err(Fault::InvalidOpcode { .. })));
    }

    #[test]
    fn budget_stops_a_spinning_loop() {
        // jmp $
        let mut cpu = cpu_with(&[0xeb, 0xfe]);
        cpu.set_budget(1_000);
        assert_eq!(call(&mut cpu, 0), Err(Fault::BudgetExhausted { steps: 1_000 }));

        let mut cpu = cpu_with(&[0xc3]);
        cpu.set_budget(1);
        assert_eq!(call(&mut cpu, 0), Ok(Stop::Returned));
    }
}
