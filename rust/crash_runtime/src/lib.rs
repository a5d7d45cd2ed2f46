//! Crash and runtime-error diagnostics for an embedded script VM.

pub mod backtrace;
pub mod callstack;
pub mod classify;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod frames;
pub mod heap;
pub mod instance;
pub mod memory;
pub mod native;
pub mod registry;
pub mod report;
pub mod symbols;

pub use classify::Disposition;
pub use config::DiagnosticConfig;
pub use coordinator::{Coordinator, Services};
pub use error::RuntimeError;
pub use instance::{ScriptVm, VmHandle};
