//! Runtime error codes reported by the script VM.
//!
//! The VM signals failures with small integer codes.  Each code gets its own
//! variant so the classifier can attach targeted diagnostics; codes the
//! catalogue does not know are preserved in [`RuntimeError::Unknown`].

use thiserror::Error;

/// Numeric status returned by the VM's execution primitive.
pub type ExecCode = i32;

/// Status code meaning "no error".
pub const EXEC_SUCCESS: ExecCode = 0;

/// Failure raised by the VM while executing script code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum RuntimeError {
    #[error("Forced exit")]
    Exit,
    #[error("Assertion failed")]
    Assert,
    #[error("Stack/heap collision (insufficient stack size)")]
    StackError,
    #[error("Array index out of bounds")]
    Bounds,
    #[error("Invalid memory access")]
    MemoryAccess,
    #[error("Invalid instruction")]
    InvalidInstruction,
    #[error("Stack underflow")]
    StackLow,
    #[error("Heap underflow")]
    HeapLow,
    #[error("No (valid) native function callback")]
    Callback,
    #[error("Native function failed")]
    Native,
    #[error("Divide by zero")]
    Divide,
    #[error("(sleep mode)")]
    Sleep,
    #[error("Invalid state")]
    InvalidState,
    #[error("Out of memory")]
    Memory,
    #[error("Invalid/unsupported P-code file format")]
    Format,
    #[error("File is for a newer version of the AMX")]
    Version,
    #[error("File or function is not found")]
    NotFound,
    #[error("Invalid index parameter (bad entry point)")]
    Index,
    #[error("Debugger cannot run")]
    Debug,
    #[error("AMX not initialized (or doubly initialized)")]
    Init,
    #[error("Unable to set user data field (table full)")]
    UserData,
    #[error("Cannot initialize the JIT")]
    InitJit,
    #[error("Parameter error")]
    Params,
    #[error("Domain error, expression result does not fit in range")]
    Domain,
    #[error("General error (unknown or unspecific error)")]
    General,
    #[error("Unknown error")]
    Unknown(ExecCode),
}

impl RuntimeError {
    /// Map a raw status code to an error. `0` is success and yields `None`.
    pub fn from_code(code: ExecCode) -> Option<Self> {
        let error = match code {
            EXEC_SUCCESS => return None,
            1 => RuntimeError::Exit,
            2 => RuntimeError::Assert,
            3 => RuntimeError::StackError,
            4 => RuntimeError::Bounds,
            5 => RuntimeError::MemoryAccess,
            6 => RuntimeError::InvalidInstruction,
            7 => RuntimeError::StackLow,
            8 => RuntimeError::HeapLow,
            9 => RuntimeError::Callback,
            10 => RuntimeError::Native,
            11 => RuntimeError::Divide,
            12 => RuntimeError::Sleep,
            13 => RuntimeError::InvalidState,
            16 => RuntimeError::Memory,
            17 => RuntimeError::Format,
            18 => RuntimeError::Version,
            19 => RuntimeError::NotFound,
            20 => RuntimeError::Index,
            21 => RuntimeError::Debug,
            22 => RuntimeError::Init,
            23 => RuntimeError::UserData,
            24 => RuntimeError::InitJit,
            25 => RuntimeError::Params,
            26 => RuntimeError::Domain,
            27 => RuntimeError::General,
            other => RuntimeError::Unknown(other),
        };
        Some(error)
    }

    pub fn code(self) -> ExecCode {
        match self {
            RuntimeError::Exit => 1,
            RuntimeError::Assert => 2,
            RuntimeError::StackError => 3,
            RuntimeError::Bounds => 4,
            RuntimeError::MemoryAccess => 5,
            RuntimeError::InvalidInstruction => 6,
            RuntimeError::StackLow => 7,
            RuntimeError::HeapLow => 8,
            RuntimeError::Callback => 9,
            RuntimeError::Native => 10,
            RuntimeError::Divide => 11,
            RuntimeError::Sleep => 12,
            RuntimeError::InvalidState => 13,
            RuntimeError::Memory => 16,
            RuntimeError::Format => 17,
            RuntimeError::Version => 18,
            RuntimeError::NotFound => 19,
            RuntimeError::Index => 20,
            RuntimeError::Debug => 21,
            RuntimeError::Init => 22,
            RuntimeError::UserData => 23,
            RuntimeError::InitJit => 24,
            RuntimeError::Params => 25,
            RuntimeError::Domain => 26,
            RuntimeError::General => 27,
            RuntimeError::Unknown(code) => code,
        }
    }

    /// Whether a script backtrace is worth printing for this error.
    ///
    /// Resolution and initialisation failures happen before any script frame
    /// exists, so the walk would only show noise.
    pub fn wants_backtrace(self) -> bool {
        !matches!(
            self,
            RuntimeError::NotFound
                | RuntimeError::Index
                | RuntimeError::Callback
                | RuntimeError::Init
        )
    }
}

/// Convert a raw status into a `Result`, as returned by the call wrappers.
pub fn check_code(code: ExecCode) -> Result<(), RuntimeError> {
    match RuntimeError::from_code(code) {
        None => Ok(()),
        Some(error) => Err(error),
    }
}
