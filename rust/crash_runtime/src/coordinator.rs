//! Execution coordinator: the single owner of diagnostic state.
//!
//! Hosts route every script/native boundary crossing through the wrappers
//! below and forward lifecycle and fault notifications.  All methods take
//! `&self` so a native called from script code can re-enter the coordinator
//! to run another entrypoint; interior state lives in `Cell`/`RefCell`,
//! which keeps the coordinator on the thread that created it.

use std::cell::{Cell as Flag, RefCell};
use std::rc::Rc;

use crate::backtrace::{self, BacktraceEntry};
use crate::callstack::CallStack;
use crate::classify::{self, Disposition};
use crate::config::DiagnosticConfig;
use crate::error::RuntimeError;
use crate::heap::HeapBounds;
use crate::instance::{EntryIndex, NativeIndex, ScriptVm, VmHandle};
use crate::memory::{Cell, UCell};
use crate::native::{
    DlAddrResolver, FaultContext, ModuleResolver, NativeUnwinder, SystemUnwinder,
};
use crate::registry::{file_name, InstanceRegistry, InstanceState, ScriptLocator};
use crate::report::{
    LogSink, ProcessControl, Reporter, SystemProcess, TracingSink, EXIT_FAILURE,
};
use crate::symbols::{SidecarSymbolLoader, SymbolLoader};

/// External collaborators used by the coordinator.
#[derive(Clone)]
pub struct Services {
    pub log: Rc<dyn LogSink>,
    pub symbols: Rc<dyn SymbolLoader>,
    pub modules: Rc<dyn ModuleResolver>,
    pub unwinder: Rc<dyn NativeUnwinder>,
    pub process: Rc<dyn ProcessControl>,
}

impl Services {
    /// Platform defaults: `tracing` output, sidecar symbol files, `dladdr`,
    /// the system unwinder and real process control.
    pub fn system() -> Self {
        let modules: Rc<dyn ModuleResolver> = Rc::new(DlAddrResolver);
        Self {
            log: Rc::new(TracingSink),
            symbols: Rc::new(SidecarSymbolLoader::new()),
            unwinder: Rc::new(SystemUnwinder::new(Rc::clone(&modules))),
            modules,
            process: Rc::new(SystemProcess),
        }
    }
}

impl Default for Services {
    fn default() -> Self {
        Self::system()
    }
}

pub struct Coordinator {
    config: DiagnosticConfig,
    calls: CallStack,
    registry: RefCell<InstanceRegistry>,
    reporter: Reporter,
    modules: Rc<dyn ModuleResolver>,
    unwinder: Rc<dyn NativeUnwinder>,
    process: Rc<dyn ProcessControl>,
    error_caught: Flag<bool>,
}

impl Coordinator {
    pub fn new(config: DiagnosticConfig) -> Self {
        Self::with_services(config, Services::system())
    }

    pub fn with_services(config: DiagnosticConfig, services: Services) -> Self {
        let locator = ScriptLocator::from_config(&config);
        Self {
            registry: RefCell::new(InstanceRegistry::new(locator, services.symbols)),
            reporter: Reporter::new(services.log, config.log_prefix.clone()),
            calls: CallStack::new(),
            modules: services.modules,
            unwinder: services.unwinder,
            process: services.process,
            error_caught: Flag::new(false),
            config,
        }
    }

    pub fn config(&self) -> &DiagnosticConfig {
        &self.config
    }

    pub fn call_stack(&self) -> &CallStack {
        &self.calls
    }

    pub fn instance(&self, handle: VmHandle) -> Option<Rc<InstanceState>> {
        self.registry.borrow().get(handle)
    }

    pub fn tracked_instances(&self) -> usize {
        self.registry.borrow().len()
    }

    /// Start tracking `vm`. Wrappers do this implicitly on first use.
    pub fn on_instance_created(&self, vm: &Rc<dyn ScriptVm>) -> Rc<InstanceState> {
        self.registry.borrow_mut().get_or_insert(vm)
    }

    pub fn on_instance_destroyed(&self, handle: VmHandle) {
        if self.registry.borrow_mut().remove(handle).is_some() {
            tracing::debug!(%handle, "script instance released");
        }
    }

    /// Invoke native `index` for script code through the instance's original
    /// dispatch callback, keeping a native record open for the duration.
    pub fn dispatch_native(
        &self,
        vm: &Rc<dyn ScriptVm>,
        index: NativeIndex,
        params: &[Cell],
    ) -> Result<Cell, RuntimeError> {
        let state = self.on_instance_created(vm);
        let _call = self.calls.enter_native(vm.handle(), index);
        let result = match state.original_dispatch() {
            Some(dispatch) => (**dispatch)(index, params),
            None => Err(RuntimeError::Callback),
        };
        if result.is_ok() {
            // The native absorbed any failure reported beneath it.
            self.error_caught.set(false);
        }
        result
    }

    /// Run entrypoint `index` of `vm` through `exec`, classifying a failure
    /// unless it was already reported further in.
    ///
    /// A reported failure keeps the latch set while it propagates outward,
    /// so every enclosing wrapper passes it through silently.
    pub fn exec_entrypoint<F>(
        &self,
        vm: &Rc<dyn ScriptVm>,
        index: EntryIndex,
        exec: F,
    ) -> Result<Cell, RuntimeError>
    where
        F: FnOnce() -> Result<Cell, RuntimeError>,
    {
        self.on_instance_created(vm);
        let registers = vm.registers();
        let call = self
            .calls
            .enter_entrypoint(vm.handle(), index, registers.cip, registers.frm);

        let result = exec();
        match result {
            Err(error) if !self.error_caught.get() => {
                self.classify(vm.as_ref(), index, error);
            }
            Err(_) => tracing::trace!(index, "failure already reported further in"),
            Ok(_) => self.error_caught.set(false),
        }

        drop(call);
        if self.calls.is_empty() {
            self.error_caught.set(false);
        }
        result
    }

    /// Error hook for VMs that report failures themselves.
    pub fn on_runtime_error(
        &self,
        vm: &Rc<dyn ScriptVm>,
        index: EntryIndex,
        error: RuntimeError,
    ) -> Disposition {
        self.on_instance_created(vm);
        if self.error_caught.get() {
            return Disposition::AlreadyReported;
        }
        self.classify(vm.as_ref(), index, error)
    }

    /// Validate a heap release requested by native code at `caller`, then
    /// perform it with `release` whatever the outcome.
    pub fn release_heap<R>(
        &self,
        vm: &Rc<dyn ScriptVm>,
        address: Cell,
        caller: usize,
        release: impl FnOnce() -> R,
    ) -> R {
        self.on_instance_created(vm);
        let bounds = HeapBounds::live(&vm.registers());
        if !bounds.contains(address) {
            self.report_bad_release(address, caller);
        }
        release()
    }

    pub fn on_system_exception(&self, context: Option<&FaultContext>) {
        match self.implicated_instance() {
            Some(name) => {
                self.reporter
                    .line(format!("Host crashed while executing {name}"));
                self.print_script_backtrace();
            }
            None => self.reporter.line("Host crashed due to an unknown error"),
        }
        self.print_system_backtrace(context);
    }

    pub fn on_system_interrupt(&self, context: Option<&FaultContext>) {
        match self.implicated_instance() {
            Some(name) => {
                self.reporter.line(format!(
                    "Host received interrupt signal while executing {name}"
                ));
                self.print_script_backtrace();
            }
            None => self.reporter.line("Host received interrupt signal"),
        }
        self.print_system_backtrace(context);
    }

    /// Stitched backtrace of the instance owning the innermost open call.
    pub fn script_backtrace(&self) -> Vec<BacktraceEntry> {
        let records = self.calls.snapshot();
        let Some(innermost) = records.last() else {
            return Vec::new();
        };
        match self.instance(innermost.instance()) {
            Some(state) => backtrace::stitch(&state, &records, self.modules.as_ref()),
            None => Vec::new(),
        }
    }

    pub fn print_script_backtrace(&self) {
        backtrace::print_script_backtrace(&self.reporter, &self.script_backtrace());
    }

    pub fn print_system_backtrace(&self, context: Option<&FaultContext>) {
        backtrace::print_system_backtrace(&self.reporter, self.unwinder.as_ref(), context);
    }

    fn classify(&self, vm: &dyn ScriptVm, index: EntryIndex, error: RuntimeError) -> Disposition {
        self.error_caught.set(true);

        if classify::is_detach_request(error, index, self.config.detach_sentinel_index) {
            tracing::debug!(index, "ignoring debugger detach request");
            return Disposition::Suppressed;
        }

        self.reporter.line(classify::headline(error));
        for line in classify::error_details(error, vm) {
            self.reporter.line(line);
        }
        if error.wants_backtrace() {
            self.print_script_backtrace();
        }
        if !self.config.run_on_error.is_empty() {
            self.process.run_detached(&self.config.run_on_error);
        }
        self.die_or_continue()
    }

    fn die_or_continue(&self) -> Disposition {
        if self.config.die_on_error {
            self.reporter.line("Aborting...");
            self.process.terminate(EXIT_FAILURE);
            return Disposition::Abort;
        }
        Disposition::Continue
    }

    fn report_bad_release(&self, address: Cell, caller: usize) {
        let module = self
            .modules
            .module_containing(caller)
            .as_deref()
            .and_then(file_name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "<unknown>".to_string());
        self.reporter.line("Bad heap release detected:");
        self.reporter.line(format!(
            " {module} [{caller:08x}] is releasing memory at {:08x} which is out of heap",
            address as UCell
        ));
        self.print_system_backtrace(None);
    }

    /// Script name of the instance owning the innermost open call.
    fn implicated_instance(&self) -> Option<String> {
        let record = self.calls.top()?;
        let name = self
            .instance(record.instance())
            .map(|state| state.script_name().to_owned())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "<unknown>".to_string());
        Some(name)
    }
}
