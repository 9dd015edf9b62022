//! Ahead-of-time path: emit an object, link it into a shared library with
//! an external linker, and load the library's entrypoint.

use std::ffi::c_void;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use libloading::Library;
use tracing::{debug, info};

use crate::codegen::{
    Backend, CompileRequest, CompiledModule, Entrypoint, COPY_TO_HOST, FREE_BUFFER, WRAPPER_SUFFIX,
};
use crate::config::AotConfig;
use crate::error::CompileError;
use crate::runtime::buffer::BufferHook;

type NativeEntry = unsafe extern "C" fn(*const *mut c_void);

/// Compile `request` through `backend`'s object emitter, link and load it.
pub fn build(
    backend: &dyn Backend,
    request: &CompileRequest,
    aot: &AotConfig,
) -> Result<Box<dyn CompiledModule>, CompileError> {
    std::fs::create_dir_all(&aot.work_dir)?;
    let object = aot.work_dir.join(format!("{}.o", request.name));
    let library = aot.work_dir.join(format!("{}.so", request.name));

    backend.emit_object(request, &object)?;
    debug!(object = %object.display(), "emitted object");
    link(&aot.linker, &object, &library)?;
    let module = SharedModule::load(&library, &request.name)?;
    info!(library = %library.display(), "loaded ahead-of-time module");
    Ok(Box::new(module))
}

/// Run `linker -shared -o <library> <object>`.
pub fn link(linker: &str, object: &Path, library: &Path) -> Result<(), CompileError> {
    let output = Command::new(linker)
        .arg("-shared")
        .arg("-o")
        .arg(library)
        .arg(object)
        .output()
        .map_err(|e| CompileError::Tool {
            tool: linker.to_string(),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(CompileError::Tool {
            tool: linker.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// A loaded shared library exporting `<name>_c_wrapper`.
pub struct SharedModule {
    library: Arc<Library>,
    entry: NativeEntry,
    copy_to_host: Option<BufferHook>,
    free_buffer: Option<BufferHook>,
}

impl SharedModule {
    pub fn load(path: &Path, name: &str) -> Result<Self, CompileError> {
        // SAFETY: loading runs the library's initializers; the library was
        // produced from our own object.
        let library = unsafe { Library::new(path) }.map_err(|e| CompileError::Load {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let wrapper = format!("{}{}", name, WRAPPER_SUFFIX);
        // SAFETY: the symbol types match the entrypoint and hook ABIs.
        let entry = unsafe { library.get::<NativeEntry>(wrapper.as_bytes()) }
            .map(|sym| *sym)
            .map_err(|_| CompileError::MissingSymbol(wrapper.clone()))?;
        let hook = |symbol: &str| unsafe { library.get::<BufferHook>(symbol.as_bytes()) }.ok().map(|sym| *sym);
        let copy_to_host = hook(COPY_TO_HOST);
        let free_buffer = hook(FREE_BUFFER);
        Ok(SharedModule {
            library: Arc::new(library),
            entry,
            copy_to_host,
            free_buffer,
        })
    }
}

impl CompiledModule for SharedModule {
    fn entrypoint(&self) -> Entrypoint {
        let library = Arc::clone(&self.library);
        let entry = self.entry;
        Entrypoint::from_fn(move |args| {
            let _loaded = &library;
            // SAFETY: forwarded from `Entrypoint::call`.
            unsafe { entry(args) }
        })
    }

    fn symbol(&self, name: &str) -> Option<BufferHook> {
        match name {
            COPY_TO_HOST => self.copy_to_host,
            FREE_BUFFER => self.free_buffer,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::host::HostBackend;
    use crate::ir::{Pipeline, Var};
    use crate::runtime::queue::WorkQueue;

    #[test]
    fn test_host_cannot_emit_objects() {
        let mut p = Pipeline::new();
        let f = p.func("f");
        let x = Var::new("x");
        p.define(f, [&x], &x + 1).unwrap();
        let request = p.lower(f).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let aot = AotConfig {
            work_dir: dir.path().to_path_buf(),
            linker: "cc".to_string(),
        };
        let backend = HostBackend::new(WorkQueue::new(1));
        let err = build(&backend, &request, &aot).err().unwrap();
        assert!(matches!(err, CompileError::Unsupported(_)));
    }

    #[test]
    fn test_missing_linker() {
        let dir = tempfile::tempdir().unwrap();
        let err = link(
            "prism-no-such-linker",
            &dir.path().join("f.o"),
            &dir.path().join("f.so"),
        )
        .unwrap_err();
        match err {
            CompileError::Tool { tool, .. } => assert_eq!(tool, "prism-no-such-linker"),
            other => panic!("expected a tool error, got {:?}", other),
        }
    }

    #[test]
    fn test_load_missing_library() {
        let dir = tempfile::tempdir().unwrap();
        let err = SharedModule::load(&dir.path().join("absent.so"), "absent").err().unwrap();
        assert!(matches!(err, CompileError::Load { .. }));
    }
}
