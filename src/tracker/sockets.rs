use super::{Category, DllTracker};
use crate::loader::ModuleHandle;

impl DllTracker {
    pub fn track_socket(&mut self, caller: u32, socket: u32) -> Option<ModuleHandle> {
        self.track_with(caller, socket, (), Category::Socket, |info| &mut info.sockets)
    }

    pub fn untrack_socket(&mut self, caller: u32, socket: u32) -> bool {
        self.untrack_with(caller, socket, Category::Socket, |info| &mut info.sockets).is_some()
    }
}
