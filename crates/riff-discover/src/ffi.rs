//! Shared helpers for calling into vendor runtime libraries

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::hardware::Backend;
use libloading::Library;
use std::error::Error;
use std::ffi::{CStr, c_char};
use std::path::Path;

/// Open a shared library.
///
/// # Safety
/// Loading a library runs its initializers; callers only pass paths produced
/// by the library search for a known vendor runtime.
pub(crate) unsafe fn open_library(backend: Backend, path: &Path) -> DiscoveryResult<Library> {
    unsafe { Library::new(path) }.map_err(|e| DiscoveryError::LibraryLoad {
        backend,
        path: path.to_path_buf(),
        reason: error_chain(&e),
    })
}

/// Render an error with every `source()` below it.
///
/// On Windows libloading keeps the OS error (and its code) only in the
/// source, so the top-level message alone cannot be classified.
pub(crate) fn error_chain(err: &(dyn Error + 'static)) -> String {
    let mut reason = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !reason.contains(&text) {
            reason.push_str(": ");
            reason.push_str(&text);
        }
        source = cause.source();
    }
    reason
}

/// Resolve `name` in `library` and copy out the function pointer.
///
/// # Safety
/// `T` must match the C signature of the symbol. The returned pointer is only
/// valid while `library` stays loaded.
pub(crate) unsafe fn symbol<T: Copy>(
    library: &Library,
    backend: Backend,
    path: &Path,
    name: &[u8],
) -> DiscoveryResult<T> {
    unsafe { library.get::<T>(name) }
        .map(|sym| *sym)
        .map_err(|e| DiscoveryError::LibraryLoad {
            backend,
            path: path.to_path_buf(),
            reason: format!(
                "missing symbol {}: {}",
                String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name)),
                error_chain(&e)
            ),
        })
}

/// Copy a NUL-terminated name out of a fixed-size C buffer
pub(crate) fn buffer_to_string(buf: &[c_char]) -> String {
    let bytes: Vec<u8> = buf.iter().map(|&c| c as u8).collect();
    match CStr::from_bytes_until_nul(&bytes) {
        Ok(s) => s.to_string_lossy().trim().to_string(),
        Err(_) => String::from_utf8_lossy(&bytes).trim().to_string(),
    }
}

/// Format 16 raw UUID bytes the way vendor tools print device ids,
/// e.g. `GPU-5e0f3c5a-1a2b-...`.
pub(crate) fn format_uuid(prefix: &str, bytes: &[u8; 16]) -> String {
    let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{prefix}{}-{}-{}-{}-{}",
        hex[0..4].concat(),
        hex[4..6].concat(),
        hex[6..8].concat(),
        hex[8..10].concat(),
        hex[10..16].concat()
    )
}
