//! C-compatible bridge between a host process and the crashscope coordinator.
//!
//! Trap handlers and VM teardown hooks are usually written in C, so the
//! notifications they deliver are exposed as `extern "C"` functions.  Each
//! thread owns at most one coordinator; Rust hosts install it with
//! [`install`] (or through [`crashscope_init`] with a JSON configuration) and
//! reach it again with [`with_coordinator`] to route script calls.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::ptr;
use std::rc::Rc;

use crashscope_runtime::config::{ConfigError, DiagnosticConfig};
use crashscope_runtime::native::FaultContext;
use crashscope_runtime::{Coordinator, VmHandle};
use libc::{c_char, c_int};
use serde::Serialize;
use thiserror::Error;

/// Status returned by functions that can fail.
pub const CRASHSCOPE_OK: c_int = 0;
pub const CRASHSCOPE_ERROR: c_int = -1;

thread_local! {
    static COORDINATOR: RefCell<Option<Rc<Coordinator>>> = const { RefCell::new(None) };
    static LAST_ERROR: RefCell<Option<ErrorPayload>> = const { RefCell::new(None) };
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("ffi payload was not valid UTF-8")]
    InvalidUtf8,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("a coordinator is already installed on this thread")]
    AlreadyInstalled,
}

impl BridgeError {
    fn kind(&self) -> &'static str {
        match self {
            BridgeError::InvalidUtf8 => "invalid_utf8",
            BridgeError::Config(_) => "config_error",
            BridgeError::AlreadyInstalled => "already_installed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ErrorPayload {
    kind: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse<'a> {
    ok: bool,
    error: &'a ErrorPayload,
}

/// Make `coordinator` the current thread's coordinator.
pub fn install(coordinator: Coordinator) -> Result<Rc<Coordinator>, BridgeError> {
    COORDINATOR.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Err(BridgeError::AlreadyInstalled);
        }
        let coordinator = Rc::new(coordinator);
        *slot = Some(Rc::clone(&coordinator));
        Ok(coordinator)
    })
}

/// Remove and return the current thread's coordinator.
pub fn uninstall() -> Option<Rc<Coordinator>> {
    COORDINATOR.with(|slot| slot.borrow_mut().take())
}

/// Run `f` with the current thread's coordinator, if one is installed.
///
/// The thread-local slot is not borrowed while `f` runs, so `f` may re-enter
/// the bridge (a native calling back into script code, a fault hook firing).
pub fn with_coordinator<R>(f: impl FnOnce(&Coordinator) -> R) -> Option<R> {
    let coordinator = COORDINATOR.with(|slot| slot.borrow().clone())?;
    Some(f(&coordinator))
}

/// Create and install a coordinator with the system services.
///
/// # Safety
///
/// `config_json` must be null (use defaults) or a valid NUL-terminated
/// string.
#[no_mangle]
pub unsafe extern "C" fn crashscope_init(config_json: *const c_char) -> c_int {
    let result = read_config(config_json).and_then(|config| install(Coordinator::new(config)));
    match result {
        Ok(_) => {
            tracing::debug!("crashscope coordinator installed");
            CRASHSCOPE_OK
        }
        Err(error) => {
            record_error(&error);
            CRASHSCOPE_ERROR
        }
    }
}

/// Drop the current thread's coordinator. Returns `1` if one was installed.
#[no_mangle]
pub extern "C" fn crashscope_shutdown() -> c_int {
    c_int::from(uninstall().is_some())
}

/// Forget the diagnostic state of a VM instance that is being destroyed.
#[no_mangle]
pub extern "C" fn crashscope_instance_destroyed(handle: usize) {
    with_coordinator(|coordinator| coordinator.on_instance_destroyed(VmHandle(handle)));
}

/// Report a native exception.
///
/// # Safety
///
/// `context` must be null or point to a valid [`FaultContext`].
#[no_mangle]
pub unsafe extern "C" fn crashscope_system_exception(context: *const FaultContext) {
    let context = context.as_ref();
    with_coordinator(|coordinator| coordinator.on_system_exception(context));
}

/// Report an interrupt signal.
///
/// # Safety
///
/// `context` must be null or point to a valid [`FaultContext`].
#[no_mangle]
pub unsafe extern "C" fn crashscope_system_interrupt(context: *const FaultContext) {
    let context = context.as_ref();
    with_coordinator(|coordinator| coordinator.on_system_interrupt(context));
}

/// JSON description of the last bridge error on this thread, or null.
///
/// # Safety
///
/// The returned pointer must be released with [`crashscope_free`].
#[no_mangle]
pub unsafe extern "C" fn crashscope_last_error() -> *mut c_char {
    LAST_ERROR.with(|slot| match slot.borrow().as_ref() {
        Some(payload) => to_c_string(&ErrorResponse {
            ok: false,
            error: payload,
        }),
        None => ptr::null_mut(),
    })
}

/// # Safety
///
/// `ptr` must originate from [`crashscope_last_error`].
#[no_mangle]
pub unsafe extern "C" fn crashscope_free(ptr: *mut c_char) {
    if !ptr.is_null() {
        let _ = CString::from_raw(ptr);
    }
}

unsafe fn read_config(config_json: *const c_char) -> Result<DiagnosticConfig, BridgeError> {
    if config_json.is_null() {
        return Ok(DiagnosticConfig::default());
    }
    let raw = CStr::from_ptr(config_json)
        .to_str()
        .map_err(|_| BridgeError::InvalidUtf8)?;
    Ok(DiagnosticConfig::from_json(raw)?)
}

fn record_error(error: &BridgeError) {
    tracing::warn!(%error, "crashscope bridge call failed");
    let payload = ErrorPayload {
        kind: error.kind().to_string(),
        message: error.to_string(),
    };
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(payload));
}

fn to_c_string<T: Serialize>(value: &T) -> *mut c_char {
    match serde_json::to_string(value) {
        Ok(serialised) => CString::new(serialised).map_or(ptr::null_mut(), CString::into_raw),
        Err(_) => ptr::null_mut(),
    }
}
