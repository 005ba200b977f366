use unicorn_engine::unicorn_const::uc_error;

use crate::cpu::Fault;

error_chain! {
    foreign_links {
        Io(::std::io::Error);
        BinErr(goblin::error::Error);
        Scroll(scroll::Error);
    }

    errors {
        ParseFailure(path: String, reason: String) {
            description("malformed or unreadable module")
            display("unable to parse '{}': {}", path, reason)
        }
        ModuleNotFound(name: String) {
            description("module not found")
            display("module '{}' not found", name)
        }
        RegistryFull(capacity: usize) {
            description("module registry is full")
            display("module registry is full ({} modules)", capacity)
        }
        EntryPointFault(module: String, fault: String) {
            description("module entry point faulted")
            display("entry point of '{}' faulted: {}", module, fault)
        }
        Cpu(fault: Fault) {
            description("guest fault")
            display("guest fault: {}", fault)
        }
        Engine(reason: String) {
            description("emulator error")
            display("emulator error: {}", reason)
        }
        MapConflict(addr: u32, size: u32) {
            description("address range already mapped")
            display("range 0x{:08x}+0x{:x} overlaps an existing mapping", addr, size)
        }
        AddressSpaceExhausted(what: &'static str, size: u32) {
            description("guest address space exhausted")
            display("no room for 0x{:x} bytes in the {} region", size, what)
        }
        InvalidHandle(handle: u32) {
            description("invalid handle")
            display("invalid handle 0x{:08x}", handle)
        }
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Error {
        ErrorKind::Cpu(fault).into()
    }
}

impl From<uc_error> for Error {
    fn from(e: uc_error) -> Error {
        ErrorKind::Engine(format!("{:?}", e)).into()
    }
}
