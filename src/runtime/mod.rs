//! Execution context: the work queue, the backend, and the code cache.
//!
//! A [`Runtime`] is built once and passed to `compile`/`realize`.
//! [`Runtime::global`] is the process-wide instance configured from the
//! environment; it shares [`WorkQueue::global`] with native code calling
//! `prism_do_par_for`.
//!
//! Faults raised while compiled code runs (out-of-bounds reads, a missing
//! output buffer) go through [`runtime_error`]: the handler installed with
//! [`set_error_handler`] if any, otherwise the message is logged and the
//! process exits with status 1.

pub mod buffer;
pub mod queue;

use std::collections::HashMap;
use std::ffi::{c_char, CStr};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use tracing::{debug, error};

use crate::codegen::host::HostBackend;
use crate::codegen::{Backend, CompileRequest, CompiledModule};
use crate::config::RuntimeConfig;
use crate::error::CompileError;

use queue::WorkQueue;

pub type ErrorHandler = fn(&str);

static ERROR_HANDLER: RwLock<Option<ErrorHandler>> = RwLock::new(None);

/// Replace the handler for runtime faults; `None` restores the default.
pub fn set_error_handler(handler: Option<ErrorHandler>) {
    *ERROR_HANDLER.write().unwrap_or_else(PoisonError::into_inner) = handler;
}

/// Report a fault from running code.
pub fn runtime_error(message: &str) {
    let handler = *ERROR_HANDLER.read().unwrap_or_else(PoisonError::into_inner);
    match handler {
        Some(handler) => handler(message),
        None => {
            error!(message, "runtime error");
            std::process::exit(1);
        }
    }
}

/// C entry point of [`runtime_error`].
///
/// # Safety
/// `message` must be a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn prism_error(message: *const c_char) {
    let message = CStr::from_ptr(message).to_string_lossy();
    runtime_error(&message);
}

/// Compiled modules shared by identical requests, keyed by the BLAKE3
/// digest of the request text.
#[derive(Default)]
pub struct CodeCache {
    modules: Mutex<HashMap<blake3::Hash, Arc<dyn CompiledModule>>>,
}

impl CodeCache {
    pub fn key(request: &CompileRequest) -> blake3::Hash {
        blake3::hash(request.to_string().as_bytes())
    }

    pub fn get_or_compile(
        &self,
        request: &CompileRequest,
        compile: impl FnOnce(&CompileRequest) -> Result<Box<dyn CompiledModule>, CompileError>,
    ) -> Result<Arc<dyn CompiledModule>, CompileError> {
        let key = Self::key(request);
        if let Some(module) = self.lock().get(&key) {
            debug!(pipeline = %request.name, key = %key.to_hex(), "code cache hit");
            return Ok(Arc::clone(module));
        }
        let module: Arc<dyn CompiledModule> = Arc::from(compile(request)?);
        let module = Arc::clone(self.lock().entry(key).or_insert(module));
        Ok(module)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<blake3::Hash, Arc<dyn CompiledModule>>> {
        self.modules.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Runtime {
    config: RuntimeConfig,
    backend: Arc<dyn Backend>,
    queue: WorkQueue,
    cache: CodeCache,
}

impl Runtime {
    /// A runtime with its own work queue and the host backend.
    pub fn new(config: RuntimeConfig) -> Self {
        let queue = WorkQueue::new(config.threads);
        let backend = Arc::new(HostBackend::new(queue.clone()));
        Runtime {
            config,
            backend,
            queue,
            cache: CodeCache::default(),
        }
    }

    /// A runtime compiling through `backend`.
    pub fn with_backend(config: RuntimeConfig, backend: Arc<dyn Backend>) -> Self {
        let queue = WorkQueue::new(config.threads);
        Runtime {
            config,
            backend,
            queue,
            cache: CodeCache::default(),
        }
    }

    /// The process-wide runtime, configured from the environment.
    pub fn global() -> &'static Runtime {
        static GLOBAL: OnceLock<Runtime> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let config = RuntimeConfig::from_env();
            let queue = WorkQueue::global().clone();
            let backend = Arc::new(HostBackend::new(queue.clone()));
            Runtime {
                config,
                backend,
                queue,
                cache: CodeCache::default(),
            }
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }
}
