//! Running guest code: host-to-guest calls and API thunk dispatch.

use log::{trace, warn};

use super::{Machine, RETURN_SENTINEL, THUNK_BASE, THUNK_SIZE};
use crate::cpu::{Access, Fault, Reg, Stop};
use crate::errors::{ErrorKind, Result};
use crate::windows::{CallConv, EmuFunction};

const THUNK_SLOT: u32 = 16;

/// Arguments of one emulated API invocation.
pub struct ApiCall {
    /// Return address of the call, used for attribution.
    pub caller: u32,
    pub args: Vec<u32>,
    /// Whether the caller was bound to the tracked variant.
    pub tracked: bool,
}

impl ApiCall {
    #[inline]
    pub fn arg(&self, n: usize) -> u32 {
        self.args.get(n).copied().unwrap_or(0)
    }
}

/// Guest addresses standing in for emulated functions, one slot each.
#[derive(Default)]
pub struct ThunkTable {
    slots: Vec<(&'static EmuFunction, bool)>,
}

impl ThunkTable {
    pub fn new() -> ThunkTable {
        ThunkTable::default()
    }

    pub fn add(&mut self, function: &'static EmuFunction, tracked: bool) -> Result<u32> {
        let addr = THUNK_BASE + self.slots.len() as u32 * THUNK_SLOT;
        if addr >= THUNK_BASE + THUNK_SIZE {
            return Err(ErrorKind::AddressSpaceExhausted("thunk", THUNK_SLOT).into());
        }
        self.slots.push((function, tracked));
        Ok(addr)
    }

    #[inline]
    pub fn contains(&self, addr: u32) -> bool {
        addr >= THUNK_BASE && addr < THUNK_BASE + THUNK_SIZE
    }

    pub fn get(&self, addr: u32) -> Option<(&'static EmuFunction, bool)> {
        if !self.contains(addr) || (addr - THUNK_BASE) % THUNK_SLOT != 0 {
            return None;
        }
        self.slots.get(((addr - THUNK_BASE) / THUNK_SLOT) as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Target of every dummy trampoline: `(module_name, symbol_name)`, cdecl.
pub(crate) static UNRESOLVED_REPORTER: EmuFunction = EmuFunction {
    name: "__unresolved_import",
    ordinal: None,
    conv: CallConv::Cdecl,
    argc: 2,
    handler: report_unresolved,
    tracks: false,
};

fn report_unresolved(m: &mut Machine, call: &ApiCall) -> Result<u32> {
    let module = m.cpu.read_cstring(call.arg(0), 260)?;
    let symbol = m.cpu.read_cstring(call.arg(1), 260)?;
    warn!("[-] Call to unresolved {}!{} from 0x{:08x}", module, symbol, call.caller);
    m.unresolved_calls.push((module, symbol));
    Ok(0)
}

impl Machine {
    /// Calls guest code at `addr` with stdcall/cdecl-compatible arguments and
    /// returns `EAX`. Every other register is restored, so calls nest.
    pub fn call(&mut self, addr: u32, args: &[u32]) -> Result<u32> {
        let saved = self.cpu.registers();
        if self.depth == 0 {
            self.cpu.set_budget(self.config.instruction_budget);
        }
        self.depth += 1;
        let outcome = self.run_until_return(addr, args);
        self.depth -= 1;
        let eax = self.cpu.reg(Reg::Eax);
        self.cpu.set_registers(&saved);
        outcome?;
        self.cpu.set_reg(Reg::Eax, eax);
        Ok(eax)
    }

    /// Each thunk ends a run; the handler executes on the host and the next
    /// run resumes at the caller.
    fn run_until_return(&mut self, addr: u32, args: &[u32]) -> Result<()> {
        for arg in args.iter().rev() {
            self.cpu.push(*arg)?;
        }
        self.cpu.push(RETURN_SENTINEL)?;
        let mut eip = addr;
        while eip != RETURN_SENTINEL {
            match self.cpu.run(eip)? {
                Stop::Returned => break,
                Stop::Trap(thunk) => eip = self.dispatch(thunk)?,
            }
        }
        Ok(())
    }

    /* 执行模拟 API: 读参数, 调用处理函数, 按调用约定清栈后返回 */
    fn dispatch(&mut self, eip: u32) -> Result<u32> {
        let (function, tracked) = match self.thunks.get(eip) {
            Some(slot) => slot,
            None => return Err(Fault::Unmapped { addr: eip, access: Access::Fetch }.into()),
        };
        let caller = self.cpu.stack(0)?;
        let mut args = Vec::with_capacity(function.argc as usize);
        for n in 1..=function.argc {
            args.push(self.cpu.stack(n)?);
        }
        trace!(">>> {}({:x?}) from 0x{:08x}", function.name, args, caller);

        let call = ApiCall { caller, args, tracked };
        let ret = (function.handler)(self, &call)?;

        let popped = match function.conv {
            CallConv::Stdcall => 4 + function.argc * 4,
            CallConv::Cdecl => 4,
        };
        let esp = self.cpu.reg(Reg::Esp).wrapping_add(popped);
        self.cpu.set_reg(Reg::Esp, esp);
        self.cpu.set_reg(Reg::Eax, ret);
        self.cpu.set_eip(caller);
        Ok(caller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoaderConfig;

    fn machine() -> Machine {
        Machine::new(LoaderConfig::new().with_instruction_budget(1_000)).unwrap()
    }

    fn code(m: &mut Machine, bytes: &[u8]) -> u32 {
        let addr = m.alloc(bytes.len() as u32).unwrap();
        m.cpu.patch(addr, bytes).unwrap();
        addr
    }

    #[test]
    fn call_returns_eax_and_restores_registers() {
        let mut m = machine();
        // mov eax, [esp+4]; add eax, [esp+8]; mov ebx, 7; ret
        let f = code(&mut m, &[0x8b, 0x44, 0x24, 0x04, 0x03, 0x44, 0x24, 0x08, 0xbb, 7, 0, 0, 0, 0xc3]);
        let esp = m.cpu.reg(Reg::Esp);
        let ebx = m.cpu.reg(Reg::Ebx);
        assert_eq!(m.call(f, &[40, 2]).unwrap(), 42);
        assert_eq!(m.cpu.reg(Reg::Esp), esp);
        assert_eq!(m.cpu.reg(Reg::Ebx), ebx);
    }

    #[test]
    fn runaway_code_exhausts_the_budget() {
        let mut m = machine();
        // jmp $
        let f = code(&mut m, &[0xeb, 0xfe]);
        let err = m.call(f, &[]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Cpu(Fault::BudgetExhausted { steps: 1_000 })));
        // the stack is back where it was
        assert_eq!(m.cpu.reg(Reg::Esp), super::super::STACK_TOP);
    }

    #[test]
    fn reporter_thunk_records_the_pair() {
        let mut m = machine();
        let names = code(&mut m, b"a.dll\0Missing\0");
        let reporter = m.reporter;
        assert_eq!(m.call(reporter, &[names, names + 6]).unwrap(), 0);
        assert_eq!(m.unresolved_calls, vec![("a.dll".to_owned(), "Missing".to_owned())]);
    }

    #[test]
    fn thunk_slots_are_sixteen_bytes_apart() {
        let mut table = ThunkTable::new();
        let a = table.add(&UNRESOLVED_REPORTER, false).unwrap();
        let b = table.add(&UNRESOLVED_REPORTER, true).unwrap();
        assert_eq!(b - a, 16);
        assert_eq!(table.get(b).map(|(_, tracked)| tracked), Some(true));
        assert!(table.get(a + 4).is_none());
    }
}
