//! Loader configuration.
//!
//! Built in code with the `with_*` methods; the CLI fills it from its
//! arguments.

use std::path::PathBuf;

pub const DEFAULT_MAX_MODULES: usize = 64;
pub const DEFAULT_INSTRUCTION_BUDGET: u64 = 50_000_000;

#[derive(Clone, Debug)]
pub struct LoaderConfig {
    /// Directories tried after the referencing module's own directory.
    pub search_paths: Vec<PathBuf>,
    /// Host directory that guest-relative and drive-letter paths resolve against.
    pub file_root: Option<PathBuf>,
    /// Capacity of the module registry.
    pub max_modules: usize,
    /// Modules allowed to finish loading even though their entry point faulted.
    pub entry_fault_exemptions: Vec<String>,
    /// Whether newly loaded modules bind the tracked API variants.
    pub track_resources: bool,
    /// Instructions a single host-to-guest call may execute.
    pub instruction_budget: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            search_paths: Vec::new(),
            file_root: None,
            max_modules: DEFAULT_MAX_MODULES,
            entry_fault_exemptions: Vec::new(),
            track_resources: true,
            instruction_budget: DEFAULT_INSTRUCTION_BUDGET,
        }
    }
}

impl LoaderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.search_paths.push(path.into());
        self
    }

    pub fn with_file_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.file_root = Some(root.into());
        self
    }

    pub fn with_max_modules(mut self, max: usize) -> Self {
        self.max_modules = max;
        self
    }

    pub fn with_entry_fault_exemption<S: Into<String>>(mut self, module: S) -> Self {
        self.entry_fault_exemptions.push(module.into());
        self
    }

    pub fn with_tracking(mut self, enabled: bool) -> Self {
        self.track_resources = enabled;
        self
    }

    pub fn with_instruction_budget(mut self, budget: u64) -> Self {
        self.instruction_budget = budget;
        self
    }

    pub fn is_fault_exempt(&self, module: &str) -> bool {
        self.entry_fault_exemptions.iter().any(|m| m.eq_ignore_ascii_case(module))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exemptions_ignore_case() {
        let config = LoaderConfig::new().with_entry_fault_exemption("Buggy.AX");
        assert!(config.is_fault_exempt("buggy.ax"));
        assert!(!config.is_fault_exempt("other.dll"));
    }
}
