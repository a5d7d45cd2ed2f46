//! Cross-boundary call tracking.
//!
//! Every crossing of the script/native boundary pushes a [`CallRecord`]; the
//! record is popped when the call returns.  The stack is shared by all VM
//! instances so that a fault in script B, reached through a native called by
//! script A, is still attributed in the order it actually happened.

use std::cell::RefCell;

use crate::instance::{EntryIndex, NativeIndex, VmHandle};
use crate::memory::Cell;

/// One in-flight call across the script/native boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRecord {
    /// Script code invoked a host-implemented native.
    Native {
        instance: VmHandle,
        index: NativeIndex,
    },
    /// Host code invoked a script entrypoint. `ip` and `fp` are the VM
    /// registers at the moment of the call, i.e. where the enclosing script
    /// segment (if any) resumes.
    Entrypoint {
        instance: VmHandle,
        index: EntryIndex,
        ip: Cell,
        fp: Cell,
    },
}

impl CallRecord {
    pub fn instance(&self) -> VmHandle {
        match self {
            CallRecord::Native { instance, .. } | CallRecord::Entrypoint { instance, .. } => {
                *instance
            }
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, CallRecord::Native { .. })
    }
}

/// Chronological stack of open calls.
#[derive(Debug, Default)]
pub struct CallStack {
    records: RefCell<Vec<CallRecord>>,
}

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter_native(&self, instance: VmHandle, index: NativeIndex) -> CallGuard<'_> {
        self.push(CallRecord::Native { instance, index })
    }

    pub fn enter_entrypoint(
        &self,
        instance: VmHandle,
        index: EntryIndex,
        ip: Cell,
        fp: Cell,
    ) -> CallGuard<'_> {
        self.push(CallRecord::Entrypoint {
            instance,
            index,
            ip,
            fp,
        })
    }

    /// Push `record`; the returned guard pops it when dropped.
    pub fn push(&self, record: CallRecord) -> CallGuard<'_> {
        let mut records = self.records.borrow_mut();
        records.push(record);
        tracing::trace!(depth = records.len(), ?record, "call entered");
        CallGuard {
            stack: self,
            depth: records.len(),
            record,
        }
    }

    /// Innermost open call.
    pub fn top(&self) -> Option<CallRecord> {
        self.records.borrow().last().copied()
    }

    /// Copy of all open calls, oldest first.
    pub fn snapshot(&self) -> Vec<CallRecord> {
        self.records.borrow().clone()
    }

    pub fn depth(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }
}

/// Scope guard for one pushed record.
#[must_use = "dropping the guard pops the call record immediately"]
#[derive(Debug)]
pub struct CallGuard<'a> {
    stack: &'a CallStack,
    depth: usize,
    record: CallRecord,
}

impl CallGuard<'_> {
    pub fn record(&self) -> CallRecord {
        self.record
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let mut records = self.stack.records.borrow_mut();
        if records.len() != self.depth {
            tracing::warn!(
                depth = records.len(),
                expected = self.depth,
                "call records popped out of order"
            );
        }
        // Records above this one belong to leaked guards.
        records.truncate(self.depth - 1);
        tracing::trace!(depth = records.len(), record = ?self.record, "call returned");
    }
}
