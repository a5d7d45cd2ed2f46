//! Per-instance diagnostic state.
//!
//! The first time the coordinator sees a VM handle it resolves the script
//! file the instance was loaded from, loads its symbols when the image
//! carries debug info, and keeps the instance's original native-dispatch
//! callback for pass-through.  None of these steps can fail the lookup: a
//! missing file or symbol table only makes backtraces less detailed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::config::DiagnosticConfig;
use crate::instance::{NativeDispatch, ScriptVm, VmHandle};
use crate::symbols::{SymbolLoader, SymbolTable};

/// Diagnostic state of one VM instance.
pub struct InstanceState {
    vm: Rc<dyn ScriptVm>,
    script_path: Option<PathBuf>,
    script_name: String,
    symbols: Option<Box<dyn SymbolTable>>,
    original_dispatch: Option<NativeDispatch>,
}

impl InstanceState {
    pub fn handle(&self) -> VmHandle {
        self.vm.handle()
    }

    pub fn vm(&self) -> &Rc<dyn ScriptVm> {
        &self.vm
    }

    pub fn script_path(&self) -> Option<&Path> {
        self.script_path.as_deref()
    }

    /// File name of the script; empty when it could not be located.
    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    pub fn symbols(&self) -> Option<&dyn SymbolTable> {
        self.symbols.as_deref()
    }

    pub fn original_dispatch(&self) -> Option<&NativeDispatch> {
        self.original_dispatch.as_ref()
    }
}

/// Finds the file a running script was loaded from.
#[derive(Debug, Clone)]
pub struct ScriptLocator {
    search_paths: Vec<PathBuf>,
    extension: String,
}

impl ScriptLocator {
    pub const DEFAULT_EXTENSION: &'static str = "amx";

    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            extension: Self::DEFAULT_EXTENSION.to_string(),
        }
    }

    pub fn from_config(config: &DiagnosticConfig) -> Self {
        Self::new(config.script_search_paths())
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// First script file, in search-path order, whose code segment matches
    /// the running image byte for byte.
    pub fn locate(&self, vm: &dyn ScriptVm) -> Option<PathBuf> {
        let memory = vm.memory();
        let code = memory.code_segment();
        if code.is_empty() {
            return None;
        }
        let start = memory.header().code_offset;
        self.search_paths
            .iter()
            .flat_map(|dir| self.candidates(dir))
            .find(|path| {
                fs::read(path)
                    .map(|bytes| bytes.get(start..start + code.len()) == Some(code))
                    .unwrap_or(false)
            })
    }

    fn candidates(&self, dir: &Path) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.extension))
            })
            .collect();
        files.sort();
        files
    }
}

/// Handle → state map, populated on first use.
pub struct InstanceRegistry {
    instances: HashMap<VmHandle, Rc<InstanceState>>,
    locator: ScriptLocator,
    loader: Rc<dyn SymbolLoader>,
}

impl InstanceRegistry {
    pub fn new(locator: ScriptLocator, loader: Rc<dyn SymbolLoader>) -> Self {
        Self {
            instances: HashMap::new(),
            locator,
            loader,
        }
    }

    pub fn get_or_insert(&mut self, vm: &Rc<dyn ScriptVm>) -> Rc<InstanceState> {
        let handle = vm.handle();
        if let Some(state) = self.instances.get(&handle) {
            return Rc::clone(state);
        }
        let state = Rc::new(self.build(vm));
        self.instances.insert(handle, Rc::clone(&state));
        state
    }

    pub fn get(&self, handle: VmHandle) -> Option<Rc<InstanceState>> {
        self.instances.get(&handle).cloned()
    }

    pub fn contains(&self, handle: VmHandle) -> bool {
        self.instances.contains_key(&handle)
    }

    /// Forget an instance. Unknown handles are ignored.
    pub fn remove(&mut self, handle: VmHandle) -> Option<Rc<InstanceState>> {
        self.instances.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn build(&self, vm: &Rc<dyn ScriptVm>) -> InstanceState {
        let script_path = self.locator.locate(vm.as_ref());
        let script_name = script_path
            .as_deref()
            .and_then(file_name)
            .unwrap_or_default();

        let symbols = match &script_path {
            Some(path) if self.loader.is_debug_info_present(vm.as_ref()) => {
                match self.loader.load(path) {
                    Ok(table) => Some(table),
                    Err(error) => {
                        tracing::warn!(%error, script = %path.display(), "symbols unavailable");
                        None
                    }
                }
            }
            _ => None,
        };

        tracing::debug!(
            handle = %vm.handle(),
            script = ?script_path,
            symbols = symbols.is_some(),
            "tracking script instance"
        );

        InstanceState {
            vm: Rc::clone(vm),
            script_path,
            script_name,
            symbols,
            original_dispatch: vm.native_dispatch(),
        }
    }
}

/// Final path component as a display string.
pub fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
}
