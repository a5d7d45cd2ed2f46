//! Native (host process) stack unwinding and module lookup.
//!
//! The mechanism is platform dependent; the rest of the crate only sees
//! [`NativeUnwinder::unwind`], a once-only sequence of return addresses paired
//! with the module that contains them, innermost frame first.

use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// Upper bound on frames captured from the host stack.
pub const MAX_NATIVE_FRAMES: usize = 64;

/// Register state delivered with a fault notification.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultContext {
    pub instruction_pointer: usize,
    pub frame_pointer: usize,
}

/// One frame of the host stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeFrame {
    pub return_address: usize,
    /// Module containing the address. Empty for addresses in anonymous
    /// memory, such as code generated by the VM.
    pub module: Option<PathBuf>,
}

impl fmt::Display for NativeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.return_address)?;
        if let Some(module) = &self.module {
            write!(f, " from {}", module.display())?;
        }
        Ok(())
    }
}

/// Host backtrace, consumed by iteration.
#[derive(Debug)]
pub struct NativeBacktrace {
    frames: std::vec::IntoIter<NativeFrame>,
}

impl NativeBacktrace {
    pub fn new(frames: Vec<NativeFrame>) -> Self {
        Self {
            frames: frames.into_iter(),
        }
    }
}

impl Iterator for NativeBacktrace {
    type Item = NativeFrame;

    fn next(&mut self) -> Option<NativeFrame> {
        self.frames.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.frames.size_hint()
    }
}

/// Maps an address to the file of the loaded module containing it.
pub trait ModuleResolver {
    fn module_containing(&self, address: usize) -> Option<PathBuf>;
}

/// Resolves modules through the dynamic loader (`dladdr`).
#[derive(Debug, Clone, Copy, Default)]
pub struct DlAddrResolver;

impl ModuleResolver for DlAddrResolver {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn module_containing(&self, address: usize) -> Option<PathBuf> {
        use std::ffi::{CStr, OsStr};
        use std::os::unix::ffi::OsStrExt;

        if address == 0 {
            return None;
        }
        // SAFETY: an all-zero `Dl_info` is a valid value (null pointers).
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        // SAFETY: dladdr only reads loader bookkeeping and fills `info`.
        let found = unsafe { libc::dladdr(address as *const libc::c_void, &mut info) };
        if found == 0 || info.dli_fname.is_null() {
            return None;
        }
        // SAFETY: dli_fname points to a NUL-terminated string owned by the loader.
        let name = unsafe { CStr::from_ptr(info.dli_fname) };
        let path = PathBuf::from(OsStr::from_bytes(name.to_bytes()));
        (!path.as_os_str().is_empty()).then_some(path)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn module_containing(&self, _address: usize) -> Option<PathBuf> {
        None
    }
}

/// Source of raw return addresses.
pub trait AddressCapture {
    fn capture(&self, context: Option<&FaultContext>) -> Vec<usize>;
}

/// Captures the live stack with `backtrace(3)`, or walks the frame-pointer
/// chain of a fault context.
#[derive(Debug, Clone, Copy)]
pub struct SystemCapture {
    max_frames: usize,
}

impl SystemCapture {
    pub fn new(max_frames: usize) -> Self {
        Self { max_frames }
    }

    fn walk_context(&self, context: &FaultContext) -> Vec<usize> {
        let word = std::mem::size_of::<usize>();
        let mut addresses = vec![context.instruction_pointer];
        let mut frame = context.frame_pointer;
        while addresses.len() < self.max_frames && frame != 0 && frame % word == 0 {
            let Some(next) = read_word(frame) else { break };
            let Some(ret) = frame.checked_add(word).and_then(read_word) else {
                break;
            };
            if ret == 0 {
                break;
            }
            addresses.push(ret);
            if next <= frame {
                break;
            }
            frame = next;
        }
        addresses
    }
}

impl Default for SystemCapture {
    fn default() -> Self {
        Self::new(MAX_NATIVE_FRAMES)
    }
}

impl AddressCapture for SystemCapture {
    fn capture(&self, context: Option<&FaultContext>) -> Vec<usize> {
        match context {
            Some(context) => self.walk_context(context),
            None => capture_current(self.max_frames),
        }
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
extern "C" {
    fn backtrace(buffer: *mut *mut libc::c_void, size: libc::c_int) -> libc::c_int;
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn capture_current(max_frames: usize) -> Vec<usize> {
    let mut buffer: Vec<*mut libc::c_void> = vec![std::ptr::null_mut(); max_frames + 1];
    let size = libc::c_int::try_from(buffer.len()).unwrap_or(libc::c_int::MAX);
    // SAFETY: `buffer` holds `size` writable slots.
    let count = unsafe { backtrace(buffer.as_mut_ptr(), size) };
    let count = usize::try_from(count).unwrap_or(0).min(buffer.len());
    // Slot 0 is this function.
    buffer[..count]
        .iter()
        .skip(1)
        .map(|address| *address as usize)
        .collect()
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn capture_current(_max_frames: usize) -> Vec<usize> {
    Vec::new()
}

/// Read one word of our own address space without faulting on bad
/// addresses: the kernel reports them as a short read.
#[cfg(target_os = "linux")]
fn read_word(address: usize) -> Option<usize> {
    let mut word: usize = 0;
    let size = std::mem::size_of::<usize>();
    let local = libc::iovec {
        iov_base: (&mut word as *mut usize).cast(),
        iov_len: size,
    };
    let remote = libc::iovec {
        iov_base: address as *mut libc::c_void,
        iov_len: size,
    };
    // SAFETY: the local iovec covers `word`; the remote side is validated by
    // the kernel, which fails the call instead of touching unmapped memory.
    let read = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    (usize::try_from(read).ok() == Some(size)).then_some(word)
}

#[cfg(not(target_os = "linux"))]
fn read_word(_address: usize) -> Option<usize> {
    None
}

/// Produces host backtraces.
pub trait NativeUnwinder {
    fn unwind(&self, context: Option<&FaultContext>) -> NativeBacktrace;
}

/// Address capture combined with module resolution.
pub struct SystemUnwinder {
    capture: Box<dyn AddressCapture>,
    resolver: Rc<dyn ModuleResolver>,
}

impl SystemUnwinder {
    pub fn new(resolver: Rc<dyn ModuleResolver>) -> Self {
        Self::with_capture(Box::new(SystemCapture::default()), resolver)
    }

    pub fn with_capture(capture: Box<dyn AddressCapture>, resolver: Rc<dyn ModuleResolver>) -> Self {
        Self { capture, resolver }
    }
}

impl NativeUnwinder for SystemUnwinder {
    fn unwind(&self, context: Option<&FaultContext>) -> NativeBacktrace {
        let frames = self
            .capture
            .capture(context)
            .into_iter()
            .map(|return_address| NativeFrame {
                return_address,
                module: self.resolver.module_containing(return_address),
            })
            .collect();
        NativeBacktrace::new(frames)
    }
}
