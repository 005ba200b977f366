//! Module loading: mapping, import resolution, entry points and teardown.

pub mod coff;
mod module;
mod pe;
mod registry;
mod resolver;
pub mod search;
pub mod trampoline;

pub use self::coff::{GoblinParser, ImageLayout, ImageParser};
pub use self::module::{ExportEntry, ExportTable, LoadedModule, ModuleFlags, ModuleHandle, Symbol, UnresolvedImport};
pub use self::registry::ModuleRegistry;
pub use self::trampoline::{TrampolineFactory, X86Trampolines};

pub const DLL_PROCESS_DETACH: u32 = 0;
pub const DLL_PROCESS_ATTACH: u32 = 1;
