//! The contract between the pipeline front end and a code generator.
//!
//! A [`Backend`] receives a [`CompileRequest`] (the target, its argument
//! list in calling order, the replayed schedule, and every definition the
//! target reaches) and returns a [`CompiledModule`] whose entrypoint takes a
//! single pointer to an array of raw argument pointers.
//!
//! Two implementations ship with the crate:
//! - `host::HostBackend` executes the loop nest in process
//! - `aot` links an emitted object into a shared library and loads it

pub mod aot;
pub mod host;

use std::collections::BTreeMap;
use std::ffi::c_void;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::CompileError;
use crate::ir::func::{Definition, Func};
use crate::ir::types::Type;
use crate::runtime::buffer::BufferHook;
use crate::schedule::ScheduleState;

/// Symbol of the hook that copies device results back to the host.
pub const COPY_TO_HOST: &str = "__copy_to_host";
/// Symbol of the hook that releases a buffer's device allocation.
pub const FREE_BUFFER: &str = "__free_buffer";
/// Suffix of the exported entrypoint of an ahead-of-time module.
pub const WRAPPER_SUFFIX: &str = "_c_wrapper";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArgKind {
    /// The output buffer; always first.
    Result,
    ImageParam,
    Image,
    Param,
}

/// One entry of the entrypoint's argument array.
///
/// Buffers are passed as `*mut RawBuffer`; scalar parameters as a pointer
/// to their value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgDescriptor {
    pub name: String,
    pub kind: ArgKind,
    pub ty: Type,
    /// Dimensions of a buffer argument; zero for scalars.
    pub dims: usize,
}

impl fmt::Display for ArgDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ArgKind::Result => "result",
            ArgKind::ImageParam => "image_param",
            ArgKind::Image => "image",
            ArgKind::Param => "param",
        };
        match self.kind {
            ArgKind::Param => write!(f, "{} {}: {}", kind, self.name, self.ty),
            _ => write!(f, "{} {}: {}[{}]", kind, self.name, self.ty, self.dims),
        }
    }
}

/// Definitions reachable from a compilation target, the target included.
#[derive(Clone, Debug, Default)]
pub struct Env {
    defs: BTreeMap<Func, Definition>,
}

impl Env {
    pub fn insert(&mut self, f: Func, def: Definition) {
        self.defs.insert(f, def);
    }

    pub fn get(&self, f: Func) -> Option<&Definition> {
        self.defs.get(&f)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Func, &Definition)> {
        self.defs.iter().map(|(&f, def)| (f, def))
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

/// Everything a backend needs to compile one function.
#[derive(Clone, Debug)]
pub struct CompileRequest {
    pub name: String,
    pub target: Func,
    pub args: Vec<ArgDescriptor>,
    pub schedule: ScheduleState,
    pub env: Env,
    /// Pipeline text of the definitions in `env`.
    pub listing: String,
}

impl CompileRequest {
    pub fn definition(&self, f: Func) -> Result<&Definition, CompileError> {
        self.env.get(f).ok_or_else(|| CompileError::Backend {
            backend: "request".to_string(),
            message: format!("function #{} is missing from the environment", f.index()),
        })
    }
}

/// The text the code cache hashes: identical text means identical code.
impl fmt::Display for CompileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {}", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            writeln!(f, "arg {} {}", i, arg)?;
        }
        f.write_str(&self.listing)?;
        for (name, sched) in &self.schedule.funcs {
            writeln!(f, "schedule {}: {:?}", name, sched)?;
        }
        Ok(())
    }
}

/// A compiled entrypoint: `fn(args: *const *mut c_void)`.
#[derive(Clone)]
pub struct Entrypoint(Arc<dyn Fn(*const *mut c_void) + Send + Sync>);

impl Entrypoint {
    pub fn native(f: unsafe extern "C" fn(*const *mut c_void)) -> Self {
        // SAFETY: callers of `call` uphold the argument contract.
        Entrypoint(Arc::new(move |args| unsafe { f(args) }))
    }

    pub fn from_fn(f: impl Fn(*const *mut c_void) + Send + Sync + 'static) -> Self {
        Entrypoint(Arc::new(f))
    }

    /// # Safety
    /// `args` must point to one valid pointer per argument of the request
    /// the entrypoint was compiled for, in contract order.
    pub unsafe fn call(&self, args: *const *mut c_void) {
        (self.0)(args)
    }
}

impl fmt::Debug for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Entrypoint")
    }
}

/// The result of compiling one request.
pub trait CompiledModule: Send + Sync {
    fn entrypoint(&self) -> Entrypoint;

    /// Resolve an optional buffer hook by its fixed symbol name.
    fn symbol(&self, _name: &str) -> Option<BufferHook> {
        None
    }
}

/// A code generator.
pub trait Backend: Send + Sync {
    /// Short name used in errors and logs (e.g. "host").
    fn name(&self) -> &str;

    fn compile(&self, request: &CompileRequest) -> Result<Box<dyn CompiledModule>, CompileError>;

    /// Write a native object for `request` to `path`.
    fn emit_object(&self, request: &CompileRequest, path: &Path) -> Result<(), CompileError> {
        let _ = (request, path);
        Err(CompileError::Unsupported(format!(
            "backend '{}' cannot emit native objects",
            self.name()
        )))
    }
}
