//! Loads legacy 32-bit Windows plugin DLLs into an emulated x86 guest,
//! binds their imports to loaded modules, emulated Win32 libraries or
//! logging dummy trampolines, and tracks every resource each module
//! acquires so it can be reclaimed and reported when the module unloads.

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate error_chain;

pub mod config;
pub mod cpu;
pub mod errors;
pub mod heap;
pub mod loader;
pub mod runtime;
pub mod tracker;
pub mod utils;
pub mod windows;

pub use crate::config::LoaderConfig;
pub use crate::errors::{Error, ErrorKind, Result};
pub use crate::loader::{ModuleHandle, Symbol};
pub use crate::runtime::{ModuleInfo, Runtime};
pub use crate::tracker::{Category, LeakReport};
