use super::{Category, DllTracker};
use crate::loader::ModuleHandle;

impl DllTracker {
    /// Critical sections are keyed by the guest address of the structure.
    pub fn track_critical_section(&mut self, caller: u32, section: u32) -> Option<ModuleHandle> {
        self.track_with(caller, section, (), Category::CriticalSection, |info| &mut info.critical_sections)
    }

    pub fn untrack_critical_section(&mut self, caller: u32, section: u32) -> bool {
        self.untrack_with(caller, section, Category::CriticalSection, |info| &mut info.critical_sections)
            .is_some()
    }
}
