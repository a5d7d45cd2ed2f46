//! Host-side view of a running script VM instance.
//!
//! The VM is owned by the host; this crate never creates or destroys one.
//! Hosts implement [`ScriptVm`] as a cheap view over their live VM state
//! (registers, memory image, native and public tables) and hand it to the
//! [`crate::coordinator::Coordinator`] behind an `Rc`.

use std::fmt;
use std::rc::Rc;

use crate::error::RuntimeError;
use crate::memory::{Cell, MemoryImage, Registers, UCell};

/// Opaque identity of a VM instance, typically its address in the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmHandle(pub usize);

impl fmt::Display for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Index into the native-function table.
pub type NativeIndex = Cell;
/// Index into the public entrypoint table, or one of the reserved values.
pub type EntryIndex = i32;

/// Reserved entrypoint index for the script's `main` function.
pub const ENTRY_MAIN: EntryIndex = -1;

/// One slot of the native-function table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeEntry {
    pub name: String,
    /// Host address bound to the native; `0` while unresolved.
    pub address: usize,
}

impl NativeEntry {
    pub fn is_resolved(&self) -> bool {
        self.address != 0
    }
}

/// One public function exported by the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub name: String,
    /// Code address of the function.
    pub address: UCell,
}

/// Callback the VM uses to invoke native functions.
pub type NativeDispatch = Rc<dyn Fn(NativeIndex, &[Cell]) -> Result<Cell, RuntimeError>>;

/// Live view of a VM instance.
pub trait ScriptVm {
    fn handle(&self) -> VmHandle;

    fn registers(&self) -> Registers;

    fn memory(&self) -> MemoryImage<'_>;

    fn natives(&self) -> Vec<NativeEntry>;

    fn entry_points(&self) -> Vec<EntryPoint>;

    /// Whether the image header carries the debug-info marker.
    fn has_debug_info(&self) -> bool {
        false
    }

    /// Code address of `main`, if the script has one.
    fn main_entry(&self) -> Option<UCell> {
        None
    }

    /// Dispatch callback installed before diagnostics attached.
    fn native_dispatch(&self) -> Option<NativeDispatch>;

    fn native(&self, index: NativeIndex) -> Option<NativeEntry> {
        let index = usize::try_from(index).ok()?;
        self.natives().into_iter().nth(index)
    }

    /// Code address of an entrypoint, resolving [`ENTRY_MAIN`].
    fn entry_address(&self, index: EntryIndex) -> Option<UCell> {
        if index == ENTRY_MAIN {
            return self.main_entry();
        }
        let index = usize::try_from(index).ok()?;
        self.entry_points()
            .into_iter()
            .nth(index)
            .map(|entry| entry.address)
    }
}
