//! Diagnostic output and process-level side effects.
//!
//! Every line the engine produces goes through a [`Reporter`], which adds the
//! configured marker before handing the text to a [`LogSink`].  Spawning the
//! on-error command and terminating the process are routed through
//! [`ProcessControl`] so embedders (and tests) decide what they mean.

use std::cell::RefCell;
use std::process::{Command, Stdio};
use std::rc::Rc;

/// Exit status used when the fatal policy terminates the process.
pub const EXIT_FAILURE: i32 = 1;

/// Destination of diagnostic lines.
pub trait LogSink {
    fn write(&self, line: &str);
}

/// Forwards lines to `tracing` at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, line: &str) {
        tracing::error!(target: "crashscope", "{line}");
    }
}

/// Shared in-memory sink. Clones append to the same buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferSink {
    lines: Rc<RefCell<Vec<String>>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }

    /// Whether any captured line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.borrow().iter().any(|line| line.contains(needle))
    }

    pub fn clear(&self) {
        self.lines.borrow_mut().clear();
    }
}

impl LogSink for BufferSink {
    fn write(&self, line: &str) {
        self.lines.borrow_mut().push(line.to_owned());
    }
}

/// Prefixes and emits diagnostic lines.
#[derive(Clone)]
pub struct Reporter {
    sink: Rc<dyn LogSink>,
    prefix: String,
}

impl Reporter {
    pub fn new(sink: Rc<dyn LogSink>, prefix: impl Into<String>) -> Self {
        Self {
            sink,
            prefix: prefix.into(),
        }
    }

    pub fn line(&self, text: impl AsRef<str>) {
        let mut line = String::with_capacity(self.prefix.len() + text.as_ref().len());
        line.push_str(&self.prefix);
        line.push_str(text.as_ref());
        self.sink.write(&line);
    }
}

/// Side effects the error policy may trigger.
pub trait ProcessControl {
    /// Start `command` through the platform shell without waiting for it.
    fn run_detached(&self, command: &str);

    /// End the process with `status`. Test doubles may return instead.
    fn terminate(&self, status: i32);
}

/// Real process control: platform shell and `std::process::exit`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcess;

impl ProcessControl for SystemProcess {
    fn run_detached(&self, command: &str) {
        let spawned = shell(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(child) => tracing::debug!(pid = child.id(), command, "spawned on-error command"),
            Err(error) => tracing::warn!(%error, command, "failed to spawn on-error command"),
        }
    }

    fn terminate(&self, status: i32) {
        std::process::exit(status);
    }
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut shell = Command::new("cmd");
    shell.arg("/C").arg(command);
    shell
}

#[cfg(not(windows))]
fn shell(command: &str) -> Command {
    let mut shell = Command::new("sh");
    shell.arg("-c").arg(command);
    shell
}
