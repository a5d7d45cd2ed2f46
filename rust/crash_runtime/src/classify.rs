//! Per-error diagnostics for script runtime errors.

use crate::error::RuntimeError;
use crate::instance::{EntryIndex, ScriptVm};
use crate::memory::{UCell, CELL_SIZE};

/// Outcome of handling one runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Not a real fault (debugger detach request); nothing was reported.
    Suppressed,
    /// The same fault was already reported while unwinding.
    AlreadyReported,
    /// Reported; control returns to the host.
    Continue,
    /// Reported; the fatal policy asked for termination.
    Abort,
}

/// Whether `error` is the benign failure of a debugger detach request.
pub fn is_detach_request(error: RuntimeError, index: EntryIndex, sentinel: Option<EntryIndex>) -> bool {
    error == RuntimeError::Index && sentinel == Some(index)
}

/// Header line for a reported runtime error.
pub fn headline(error: RuntimeError) -> String {
    format!("Run time error {}: \"{}\"", error.code(), error)
}

/// Extra lines describing the VM state relevant to `error`.
pub fn error_details(error: RuntimeError, vm: &dyn ScriptVm) -> Vec<String> {
    let registers = vm.registers();
    match error {
        RuntimeError::Bounds => {
            let index = registers.pri;
            if index < 0 {
                return vec![format!(" Accessing element at negative index {index}")];
            }
            // The bound is the operand following the faulting opcode.
            let bound = registers
                .cip
                .checked_add(CELL_SIZE)
                .and_then(|address| vm.memory().code_cell(address));
            match bound {
                Some(bound) => vec![format!(
                    " Accessing element at index {index} past array upper bound {bound}"
                )],
                None => vec![format!(" Accessing element at index {index} past array upper bound")],
            }
        }
        RuntimeError::NotFound => vm
            .natives()
            .into_iter()
            .filter(|native| !native.is_resolved())
            .map(|native| format!(" {}", native.name))
            .collect(),
        RuntimeError::StackError => vec![format!(
            " Stack pointer (STK) is 0x{:X}, heap pointer (HEA) is 0x{:X}",
            registers.stk as UCell, registers.hea as UCell
        )],
        RuntimeError::StackLow => vec![format!(
            " Stack pointer (STK) is 0x{:X}, stack top (STP) is 0x{:X}",
            registers.stk as UCell, registers.stp as UCell
        )],
        RuntimeError::HeapLow => vec![format!(
            " Heap pointer (HEA) is 0x{:X}, heap bottom (HLW) is 0x{:X}",
            registers.hea as UCell, registers.hlw as UCell
        )],
        RuntimeError::InvalidInstruction => match vm.memory().code_cell(registers.cip) {
            Some(opcode) => vec![format!(
                " Unknown opcode 0x{:x} at address 0x{:08X}",
                opcode as UCell, registers.cip as UCell
            )],
            None => vec![format!(
                " Instruction address 0x{:08X} is outside the code segment",
                registers.cip as UCell
            )],
        },
        _ => Vec::new(),
    }
}
