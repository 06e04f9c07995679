//! Engine bindings over the `riff_engine` shared library
//!
//! The library exports a small C ABI:
//!
//! ```c
//! const char *riff_engine_system_info(void);
//! void *riff_engine_load(const riff_load_params *, char *err, size_t err_len);
//! void  riff_engine_free(void *model);
//! int   riff_engine_complete(void *model, const riff_slot *, const char *prompt,
//!                            int32_t n_predict, const riff_sampling *,
//!                            riff_piece_cb cb, void *user, riff_stats *out,
//!                            char *err, size_t err_len);
//! size_t riff_engine_embedding_size(void *model);
//! int   riff_engine_embed(void *model, const riff_slot *, const char *content,
//!                         float *out, size_t out_len, char *err, size_t err_len);
//! ```
//!
//! Status codes are `0` success, `1` request error, anything else fatal.

use crate::engine::{
    CompletionStats, Generation, InferenceEngine, LoadParams, LoadedModel, SlotAssignment,
    StopReason, TokenFlow,
};
use crate::error::{EngineError, RunnerError};
use libloading::Library;
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

const STATUS_OK: c_int = 0;
const STATUS_REQUEST_ERROR: c_int = 1;

const FLOW_CONTINUE: c_int = 0;
const FLOW_STOP: c_int = 1;

const STOP_EOS: i32 = 0;
const STOP_LIMIT: i32 = 1;

const ERR_LEN: usize = 1024;

/// Platform file name of the engine library, e.g. `libriff_engine.so`
pub fn engine_library_filename() -> std::ffi::OsString {
    libloading::library_filename("riff_engine")
}

#[repr(C)]
struct RawLoadParams {
    model_path: *const c_char,
    lora_paths: *const *const c_char,
    n_lora: usize,
    n_parallel: u32,
    n_batch: u32,
    n_ctx: u32,
    /// NULL keeps the engine default
    kv_cache_type: *const c_char,
}

#[repr(C)]
struct RawSlot {
    slot: i32,
    reuse_prefix: usize,
    /// -1 when no copy is requested
    copy_from: i32,
    copy_prefix: usize,
}

#[repr(C)]
struct RawSampling {
    temperature: f32,
    top_k: i32,
    top_p: f32,
    min_p: f32,
    repeat_penalty: f32,
    repeat_last_n: i32,
    seed: u32,
    has_seed: u8,
}

#[repr(C)]
#[derive(Default)]
struct RawStats {
    evaluated: usize,
    predicted: usize,
    stop_reason: i32,
}

type PieceCallback = unsafe extern "C" fn(*const c_char, usize, *mut c_void) -> c_int;

#[derive(Clone, Copy)]
struct EngineApi {
    system_info: unsafe extern "C" fn() -> *const c_char,
    load: unsafe extern "C" fn(*const RawLoadParams, *mut c_char, usize) -> *mut c_void,
    free: unsafe extern "C" fn(*mut c_void),
    complete: unsafe extern "C" fn(
        *mut c_void,
        *const RawSlot,
        *const c_char,
        i32,
        *const RawSampling,
        PieceCallback,
        *mut c_void,
        *mut RawStats,
        *mut c_char,
        usize,
    ) -> c_int,
    embedding_size: unsafe extern "C" fn(*mut c_void) -> usize,
    embed: unsafe extern "C" fn(
        *mut c_void,
        *const RawSlot,
        *const c_char,
        *mut f32,
        usize,
        *mut c_char,
        usize,
    ) -> c_int,
}

impl EngineApi {
    unsafe fn load(library: &Library, path: &Path) -> Result<Self, RunnerError> {
        unsafe fn sym<T: Copy>(library: &Library, path: &Path, name: &[u8]) -> Result<T, RunnerError> {
            unsafe { library.get::<T>(name) }.map(|s| *s).map_err(|e| {
                RunnerError::Load(format!(
                    "{}: missing symbol {}: {e}",
                    path.display(),
                    String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name))
                ))
            })
        }
        unsafe {
            Ok(Self {
                system_info: sym(library, path, b"riff_engine_system_info\0")?,
                load: sym(library, path, b"riff_engine_load\0")?,
                free: sym(library, path, b"riff_engine_free\0")?,
                complete: sym(library, path, b"riff_engine_complete\0")?,
                embedding_size: sym(library, path, b"riff_engine_embedding_size\0")?,
                embed: sym(library, path, b"riff_engine_embed\0")?,
            })
        }
    }
}

/// Engine backed by a dynamically loaded `riff_engine` library
pub struct NativeEngine {
    api: EngineApi,
    path: PathBuf,
    library: Arc<Library>,
}

impl std::fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeEngine").field("path", &self.path).finish_non_exhaustive()
    }
}

impl NativeEngine {
    pub fn open(path: &Path) -> Result<Self, RunnerError> {
        // SAFETY: loading runs the library's initializers; the path comes from
        // the operator or the runner directory chosen by placement.
        let library = unsafe { Library::new(path) }
            .map_err(|e| RunnerError::Load(format!("{}: {e}", path.display())))?;
        let api = unsafe { EngineApi::load(&library, path)? };
        tracing::debug!(path = %path.display(), "Loaded engine library");
        Ok(Self {
            api,
            path: path.to_path_buf(),
            library: Arc::new(library),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn c_string(what: &str, value: &str) -> Result<CString, EngineError> {
    CString::new(value).map_err(|_| EngineError::Request(format!("{what} contains a NUL byte")))
}

fn c_path(path: &Path) -> Result<CString, EngineError> {
    let s = path
        .to_str()
        .ok_or_else(|| EngineError::Fatal(format!("path is not valid UTF-8: {}", path.display())))?;
    CString::new(s).map_err(|_| EngineError::Fatal(format!("path contains a NUL byte: {s}")))
}

fn error_text(buf: &[c_char]) -> String {
    let bytes: Vec<u8> = buf.iter().map(|&c| c as u8).collect();
    match CStr::from_bytes_until_nul(&bytes) {
        Ok(s) if !s.is_empty() => s.to_string_lossy().into_owned(),
        _ => "engine reported an error without a message".to_string(),
    }
}

fn status_error(status: c_int, buf: &[c_char]) -> EngineError {
    if status == STATUS_REQUEST_ERROR {
        EngineError::Request(error_text(buf))
    } else {
        EngineError::Fatal(error_text(buf))
    }
}

impl InferenceEngine for NativeEngine {
    fn system_info(&self) -> String {
        // SAFETY: returns a static NUL-terminated string or NULL.
        let ptr = unsafe { (self.api.system_info)() };
        if ptr.is_null() {
            return String::new();
        }
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    fn load(&self, params: &LoadParams) -> Result<Arc<dyn LoadedModel>, EngineError> {
        let model_path = c_path(&params.model_path)?;
        let loras = params
            .lora_paths
            .iter()
            .map(|p| c_path(p))
            .collect::<Result<Vec<_>, _>>()?;
        let lora_ptrs: Vec<*const c_char> = loras.iter().map(|c| c.as_ptr()).collect();
        let kv_type = params
            .kv_cache_type
            .map(|t| c_string("kv cache type", t.as_str()))
            .transpose()?;

        let raw = RawLoadParams {
            model_path: model_path.as_ptr(),
            lora_paths: if lora_ptrs.is_empty() { std::ptr::null() } else { lora_ptrs.as_ptr() },
            n_lora: lora_ptrs.len(),
            n_parallel: params.parallelism as u32,
            n_batch: params.batch_size as u32,
            n_ctx: params.context_size as u32,
            kv_cache_type: kv_type.as_ref().map_or(std::ptr::null(), |c| c.as_ptr()),
        };

        let mut err = [0 as c_char; ERR_LEN];
        // SAFETY: every pointer in `raw` borrows a CString or Vec that outlives the call.
        let handle = unsafe { (self.api.load)(&raw, err.as_mut_ptr(), err.len()) };
        let handle = NonNull::new(handle).ok_or_else(|| EngineError::Fatal(error_text(&err)))?;

        Ok(Arc::new(NativeModel {
            api: self.api,
            handle,
            _library: Arc::clone(&self.library),
        }))
    }
}

/// A model handle owned by the engine library
pub struct NativeModel {
    api: EngineApi,
    handle: NonNull<c_void>,
    _library: Arc<Library>,
}

// SAFETY: the engine ABI allows concurrent calls on one model as long as
// each call uses a different slot, which the input cache guarantees.
unsafe impl Send for NativeModel {}
unsafe impl Sync for NativeModel {}

impl Drop for NativeModel {
    fn drop(&mut self) {
        // SAFETY: the handle came from riff_engine_load and is freed once.
        unsafe { (self.api.free)(self.handle.as_ptr()) };
    }
}

fn raw_slot(slot: &SlotAssignment) -> RawSlot {
    RawSlot {
        slot: slot.slot as i32,
        reuse_prefix: slot.reuse_prefix,
        copy_from: slot.copy_from.map_or(-1, |c| c.slot as i32),
        copy_prefix: slot.copy_from.map_or(0, |c| c.prefix),
    }
}

/// Reassembles UTF-8 split across pieces before handing text to the sink
struct PieceSink<'a> {
    sink: &'a mut dyn FnMut(&str) -> TokenFlow,
    carry: Vec<u8>,
    stopped: bool,
}

impl PieceSink<'_> {
    fn feed(&mut self, bytes: &[u8]) -> TokenFlow {
        self.carry.extend_from_slice(bytes);
        let valid = match std::str::from_utf8(&self.carry) {
            Ok(_) => self.carry.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            // Invalid bytes, not just a truncated sequence: replace them.
            Err(_) => {
                let text = String::from_utf8_lossy(&self.carry).into_owned();
                self.carry.clear();
                return self.emit(&text);
            }
        };
        if valid == 0 {
            return TokenFlow::Continue;
        }
        let rest = self.carry.split_off(valid);
        let head = std::mem::replace(&mut self.carry, rest);
        // `head` was validated above.
        let text = String::from_utf8_lossy(&head).into_owned();
        self.emit(&text)
    }

    fn emit(&mut self, text: &str) -> TokenFlow {
        let flow = (self.sink)(text);
        if flow == TokenFlow::Stop {
            self.stopped = true;
        }
        flow
    }
}

unsafe extern "C" fn on_piece(piece: *const c_char, len: usize, user: *mut c_void) -> c_int {
    if user.is_null() {
        return FLOW_STOP;
    }
    // SAFETY: `user` is the `PieceSink` passed to riff_engine_complete,
    // which only invokes the callback during that call.
    let state = unsafe { &mut *(user as *mut PieceSink<'_>) };
    let bytes = if piece.is_null() || len == 0 {
        &[][..]
    } else {
        unsafe { std::slice::from_raw_parts(piece as *const u8, len) }
    };
    // Unwinding across the C boundary is undefined; a panicking sink stops generation.
    match catch_unwind(AssertUnwindSafe(|| state.feed(bytes))) {
        Ok(TokenFlow::Continue) => FLOW_CONTINUE,
        _ => FLOW_STOP,
    }
}

impl LoadedModel for NativeModel {
    fn complete(
        &self,
        slot: &SlotAssignment,
        generation: &Generation<'_>,
        sink: &mut dyn FnMut(&str) -> TokenFlow,
    ) -> Result<CompletionStats, EngineError> {
        let prompt = c_string("prompt", generation.prompt)?;
        let s = generation.sampling;
        let sampling = RawSampling {
            temperature: s.temperature,
            top_k: s.top_k,
            top_p: s.top_p,
            min_p: s.min_p,
            repeat_penalty: s.repeat_penalty,
            repeat_last_n: s.repeat_last_n,
            seed: s.seed.unwrap_or(0),
            has_seed: u8::from(s.seed.is_some()),
        };
        let raw_slot = raw_slot(slot);
        let mut state = PieceSink {
            sink,
            carry: Vec::new(),
            stopped: false,
        };
        let mut stats = RawStats::default();
        let mut err = [0 as c_char; ERR_LEN];

        // SAFETY: all pointers reference locals that outlive the call; the
        // callback's user pointer is only used while it runs.
        let status = unsafe {
            (self.api.complete)(
                self.handle.as_ptr(),
                &raw_slot,
                prompt.as_ptr(),
                generation.n_predict,
                &sampling,
                on_piece,
                &mut state as *mut PieceSink<'_> as *mut c_void,
                &mut stats,
                err.as_mut_ptr(),
                err.len(),
            )
        };
        if status != STATUS_OK {
            return Err(status_error(status, &err));
        }

        if !state.carry.is_empty() && !state.stopped {
            let tail = String::from_utf8_lossy(&state.carry).into_owned();
            state.carry.clear();
            state.emit(&tail);
        }

        let stop_reason = if state.stopped {
            StopReason::Stop
        } else {
            match stats.stop_reason {
                STOP_EOS => StopReason::Eos,
                STOP_LIMIT => StopReason::Limit,
                _ => StopReason::Limit,
            }
        };
        Ok(CompletionStats {
            tokens_evaluated: stats.evaluated,
            tokens_predicted: stats.predicted,
            stop_reason,
        })
    }

    fn embed(&self, slot: &SlotAssignment, content: &str) -> Result<Vec<f32>, EngineError> {
        let content = c_string("content", content)?;
        // SAFETY: the handle is live for as long as `self`.
        let size = unsafe { (self.api.embedding_size)(self.handle.as_ptr()) };
        if size == 0 {
            return Err(EngineError::Request("model does not produce embeddings".into()));
        }
        let mut out = vec![0f32; size];
        let raw_slot = raw_slot(slot);
        let mut err = [0 as c_char; ERR_LEN];
        let status = unsafe {
            (self.api.embed)(
                self.handle.as_ptr(),
                &raw_slot,
                content.as_ptr(),
                out.as_mut_ptr(),
                out.len(),
                err.as_mut_ptr(),
                err.len(),
            )
        };
        if status != STATUS_OK {
            return Err(status_error(status, &err));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SlotCopy;

    fn collect(pieces: &[&[u8]]) -> (Vec<String>, bool) {
        let mut out = Vec::new();
        let mut sink = |s: &str| {
            out.push(s.to_string());
            TokenFlow::Continue
        };
        let mut state = PieceSink {
            sink: &mut sink,
            carry: Vec::new(),
            stopped: false,
        };
        for p in pieces {
            state.feed(p);
        }
        let leftover = !state.carry.is_empty();
        (out, leftover)
    }

    #[test]
    fn test_split_utf8_is_reassembled() {
        let snowman = "☃".as_bytes();
        let (out, leftover) = collect(&[b"a", &snowman[..1], &snowman[1..], b"b"]);
        assert_eq!(out.concat(), "a☃b");
        assert!(!leftover);
    }

    #[test]
    fn test_invalid_bytes_replaced() {
        let (out, _) = collect(&[b"ok", &[0xff, b'x']]);
        assert_eq!(out.concat(), "ok\u{fffd}x");
    }

    #[test]
    fn test_callback_stop_and_null_user() {
        let mut sink = |_: &str| TokenFlow::Stop;
        let mut state = PieceSink {
            sink: &mut sink,
            carry: Vec::new(),
            stopped: false,
        };
        let piece = b"hi";
        let flow = unsafe {
            on_piece(
                piece.as_ptr() as *const c_char,
                piece.len(),
                &mut state as *mut PieceSink<'_> as *mut c_void,
            )
        };
        assert_eq!(flow, FLOW_STOP);
        assert!(state.stopped);
        assert_eq!(unsafe { on_piece(std::ptr::null(), 0, std::ptr::null_mut()) }, FLOW_STOP);
    }

    #[test]
    fn test_raw_slot_copy() {
        let slot = SlotAssignment {
            slot: 2,
            reuse_prefix: 10,
            copy_from: Some(SlotCopy { slot: 0, prefix: 10 }),
        };
        let raw = raw_slot(&slot);
        assert_eq!((raw.slot, raw.copy_from, raw.copy_prefix), (2, 0, 10));
        let plain = raw_slot(&SlotAssignment { slot: 1, reuse_prefix: 0, copy_from: None });
        assert_eq!(plain.copy_from, -1);
    }

    #[test]
    fn test_status_error_mapping() {
        let mut buf = [0 as c_char; 8];
        for (i, b) in b"oops".iter().enumerate() {
            buf[i] = *b as c_char;
        }
        assert_eq!(status_error(1, &buf), EngineError::Request("oops".into()));
        assert_eq!(status_error(2, &buf), EngineError::Fatal("oops".into()));
    }

    #[test]
    fn test_missing_engine_library() {
        let err = NativeEngine::open(Path::new("/nonexistent/libriff_engine.so")).expect_err("missing");
        assert!(matches!(err, RunnerError::Load(_)));
    }
}
