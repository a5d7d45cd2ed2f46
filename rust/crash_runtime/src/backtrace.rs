//! Backtrace stitching and printing.
//!
//! A script backtrace interleaves segments of script frames with the native
//! calls that separate them.  Starting at the innermost open call of the
//! faulting instance, each entrypoint record closes one script segment (and
//! tells where the enclosing one resumes) and each native record contributes
//! one native frame.  Tracing stops at the first record that belongs to a
//! different instance.

use std::fmt;

use crate::callstack::CallRecord;
use crate::frames::{FrameWalker, VmFrame};
use crate::native::{FaultContext, ModuleResolver, NativeUnwinder};
use crate::registry::{file_name, InstanceState};
use crate::report::Reporter;

/// One line of a script backtrace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BacktraceEntry {
    Native {
        name: String,
        address: usize,
        module: Option<String>,
    },
    Script {
        frame: VmFrame,
        /// Script file name, shown when frames carry no symbols.
        origin: Option<String>,
    },
}

impl fmt::Display for BacktraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BacktraceEntry::Native {
                name,
                address,
                module,
            } => {
                write!(f, "native {name} () [{address:08x}]")?;
                if let Some(module) = module {
                    write!(f, " from {module}")?;
                }
                Ok(())
            }
            BacktraceEntry::Script { frame, origin } => {
                write!(f, "{frame}")?;
                if let Some(origin) = origin {
                    write!(f, " from {origin}")?;
                }
                Ok(())
            }
        }
    }
}

/// Reconstruct the backtrace of `state`'s instance from the open call
/// records (`records` oldest first, as returned by `CallStack::snapshot`).
pub fn stitch(
    state: &InstanceState,
    records: &[CallRecord],
    modules: &dyn ModuleResolver,
) -> Vec<BacktraceEntry> {
    let Some(innermost) = records.last() else {
        return Vec::new();
    };
    let instance = innermost.instance();
    let vm = state.vm();
    let registers = vm.registers();
    let memory = vm.memory();
    let stack = registers.stack_region();
    let symbols = state.symbols();
    let origin = (symbols.is_none() && !state.script_name().is_empty())
        .then(|| state.script_name().to_owned());

    let mut ip = registers.cip;
    let mut fp = registers.frm;
    let mut entries = Vec::new();

    for record in records.iter().rev() {
        if record.instance() != instance {
            break;
        }
        match *record {
            CallRecord::Native { index, .. } => {
                let Some(native) = vm.native(index) else {
                    continue;
                };
                if !native.is_resolved() {
                    continue;
                }
                let module = modules
                    .module_containing(native.address)
                    .as_deref()
                    .and_then(file_name)
                    .filter(|name| !name.is_empty());
                entries.push(BacktraceEntry::Native {
                    name: native.name,
                    address: native.address,
                    module,
                });
            }
            CallRecord::Entrypoint {
                index,
                ip: resume_ip,
                fp: resume_fp,
                ..
            } => {
                let entry = vm.entry_address(index);
                let mut frames: Vec<VmFrame> = FrameWalker::new(memory, stack, ip, fp)
                    .bounded_by(resume_fp)
                    .with_symbols(symbols)
                    .collect();
                match frames.last_mut() {
                    None => frames.push(VmFrame::at_entry(fp, entry, symbols)),
                    Some(outermost) if symbols.is_none() && outermost.entry_address.is_none() => {
                        outermost.entry_address = entry
                    }
                    Some(_) => {}
                }
                entries.extend(frames.into_iter().map(|frame| BacktraceEntry::Script {
                    frame,
                    origin: origin.clone(),
                }));
                ip = resume_ip;
                fp = resume_fp;
            }
        }
    }
    entries
}

pub fn print_script_backtrace(reporter: &Reporter, entries: &[BacktraceEntry]) {
    if entries.is_empty() {
        return;
    }
    reporter.line("Script backtrace:");
    for (level, entry) in entries.iter().enumerate() {
        reporter.line(format!("#{level} {entry}"));
    }
}

pub fn print_system_backtrace(
    reporter: &Reporter,
    unwinder: &dyn NativeUnwinder,
    context: Option<&FaultContext>,
) {
    reporter.line("System backtrace:");
    for (level, frame) in unwinder.unwind(context).enumerate() {
        reporter.line(format!("#{level} {frame}"));
    }
}
