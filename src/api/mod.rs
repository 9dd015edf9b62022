//! Compiling and running pipelines.
//!
//! `compile` lowers a target function into a [`CompileRequest`], hands it to
//! the runtime's backend (or the ahead-of-time path) and caches the result
//! on the handle until the pipeline next changes. `realize` marshals the
//! output buffer, bound images and parameter values into the entrypoint's
//! argument array and runs it.

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::codegen::{aot, ArgDescriptor, ArgKind, CompileRequest, CompiledModule, Entrypoint, Env};
use crate::codegen::{COPY_TO_HOST, FREE_BUFFER};
use crate::config::ExecutionMode;
use crate::error::{CompileError, RealizeError, Result};
use crate::ir::func::{Func, Pipeline};
use crate::ir::types::Type;
use crate::runtime::buffer::{Buffer, BufferHook};
use crate::runtime::Runtime;
use crate::schedule::replay;


/// A compiled function: its module, entrypoint and argument contract.
#[derive(Clone)]
pub struct Compiled {
    module: Arc<dyn CompiledModule>,
    entry: Entrypoint,
    args: Vec<ArgDescriptor>,
    copy_to_host: Option<BufferHook>,
    free_buffer: Option<BufferHook>,
}

impl Compiled {
    fn new(module: Arc<dyn CompiledModule>, args: Vec<ArgDescriptor>) -> Self {
        Compiled {
            entry: module.entrypoint(),
            copy_to_host: module.symbol(COPY_TO_HOST),
            free_buffer: module.symbol(FREE_BUFFER),
            module,
            args,
        }
    }

    pub fn args(&self) -> &[ArgDescriptor] {
        &self.args
    }

    pub fn entrypoint(&self) -> &Entrypoint {
        &self.entry
    }

    pub fn module(&self) -> &Arc<dyn CompiledModule> {
        &self.module
    }

    #[cfg(test)]
    pub(crate) fn placeholder() -> Self {
        struct Nothing;
        impl CompiledModule for Nothing {
            fn entrypoint(&self) -> Entrypoint {
                Entrypoint::from_fn(|_| {})
            }
        }
        Compiled::new(Arc::new(Nothing), Vec::new())
    }
}

impl std::fmt::Debug for Compiled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiled").field("args", &self.args).finish()
    }
}

impl Pipeline {
    fn output_type(&self, f: Func) -> Result<Type> {
        let ty = self
            .definition(f)
            .ty
            .ok_or_else(|| CompileError::Unsupported(format!("'{}' has no definition", self.name(f))))?;
        Ok(ty)
    }

    /// The entrypoint's argument list for `f`: the result buffer, then bound
    /// image parameters, captured images and scalar parameters, each group
    /// in first-reference order.
    pub fn infer_arguments(&self, f: Func) -> Result<Vec<ArgDescriptor>> {
        let ty = self.output_type(f)?;
        let inputs = self.inputs(f);
        let mut args = Vec::with_capacity(
            1 + inputs.image_params.len() + inputs.images.len() + inputs.params.len(),
        );
        args.push(ArgDescriptor {
            name: self.name(f).to_string(),
            kind: ArgKind::Result,
            ty,
            dims: self.definition(f).arity(),
        });
        args.extend(inputs.image_params.iter().map(|p| ArgDescriptor {
            name: p.name().to_string(),
            kind: ArgKind::ImageParam,
            ty: p.ty(),
            dims: p.dimensions(),
        }));
        args.extend(inputs.images.iter().map(|i| ArgDescriptor {
            name: i.name().to_string(),
            kind: ArgKind::Image,
            ty: i.buffer().ty(),
            dims: i.buffer().dimensions(),
        }));
        args.extend(inputs.params.iter().map(|p| ArgDescriptor {
            name: p.name().to_string(),
            kind: ArgKind::Param,
            ty: p.ty(),
            dims: 0,
        }));

        let mut names: Vec<&str> = Vec::with_capacity(args.len());
        let clash = inputs.conflicts.first().cloned().or_else(|| {
            args[1..]
                .iter()
                .find(|a| {
                    let seen = names.contains(&a.name.as_str());
                    names.push(&a.name);
                    seen
                })
                .map(|a| a.name.clone())
        });
        if let Some(name) = clash {
            return Err(CompileError::DuplicateInput(name).into());
        }
        Ok(args)
    }

    /// Replay the schedule of `f` and everything it reaches and package the
    /// result for a backend.
    pub fn lower(&self, f: Func) -> Result<CompileRequest> {
        let args = self.infer_arguments(f)?;
        let schedule = replay(self, f)?;

        let mut funcs = vec![f];
        funcs.extend(self.reachable(f));
        let mut env = Env::default();
        for &g in &funcs {
            let def = self.definition(g);
            if let Some(handle) = def.update_handle {
                env.insert(handle, self.definition(handle).clone());
            }
            env.insert(g, def.clone());
        }
        let listing = self.listing_of(funcs.iter().copied()).text;
        debug!(func = self.name(f), funcs = env.len(), args = args.len(), "lowered");
        Ok(CompileRequest {
            name: self.name(f).to_string(),
            target: f,
            args,
            schedule,
            env,
            listing,
        })
    }

    /// Compile `f`, reusing the handle's entrypoint if nothing changed since
    /// the last compilation. On error the handle stays uncompiled.
    pub fn compile(&mut self, rt: &Runtime, f: Func) -> Result<Compiled> {
        if let Some(compiled) = self.compiled.get(&f) {
            return Ok(compiled.clone());
        }
        let request = self.lower(f)?;
        let module: Arc<dyn CompiledModule> = match &rt.config().mode {
            ExecutionMode::AheadOfTime(aot) => Arc::from(aot::build(rt.backend(), &request, aot)?),
            ExecutionMode::InProcess => rt
                .cache()
                .get_or_compile(&request, |r| rt.backend().compile(r))?,
        };
        let compiled = Compiled::new(module, request.args);
        if rt.config().offload.is_some() && compiled.copy_to_host.is_none() {
            return Err(CompileError::MissingSymbol(COPY_TO_HOST.to_string()).into());
        }
        info!(
            func = self.name(f),
            backend = rt.backend().name(),
            args = compiled.args.len(),
            "compiled"
        );
        self.compiled.insert(f, compiled.clone());
        Ok(compiled)
    }

    pub fn is_compiled(&self, f: Func) -> bool {
        self.compiled.contains_key(&f)
    }

    /// Compute `f` over `[0, extents[i])` in every dimension.
    pub fn realize(&mut self, rt: &Runtime, f: Func, extents: &[i32]) -> Result<Buffer> {
        let ty = self.output_type(f)?;
        let mut out = Buffer::new(ty, extents).map_err(RealizeError::from)?;
        self.realize_into(rt, f, &mut out)?;
        Ok(out)
    }

    /// Compute `f` over the region `out` covers, writing into it.
    pub fn realize_into(&mut self, rt: &Runtime, f: Func, out: &mut Buffer) -> Result<()> {
        let ty = self.output_type(f)?;
        let name = self.name(f).to_string();
        let arity = self.definition(f).arity();
        if out.dimensions() != arity {
            return Err(RealizeError::DimensionMismatch {
                name,
                expected: arity,
                found: out.dimensions(),
            }
            .into());
        }
        if out.ty() != ty {
            return Err(RealizeError::TypeMismatch {
                name,
                expected: ty,
                found: out.ty(),
            }
            .into());
        }

        let compiled = self.compile(rt, f)?;
        let inputs = self.inputs(f);
        let mut held: Vec<Arc<Buffer>> = Vec::with_capacity(inputs.image_params.len() + inputs.images.len());
        for p in &inputs.image_params {
            let buffer = p
                .bound()
                .ok_or_else(|| RealizeError::UnboundImage(p.name().to_string()))?;
            if buffer.dimensions() != p.dimensions() {
                return Err(RealizeError::DimensionMismatch {
                    name: p.name().to_string(),
                    expected: p.dimensions(),
                    found: buffer.dimensions(),
                }
                .into());
            }
            if buffer.ty() != p.ty() {
                return Err(RealizeError::TypeMismatch {
                    name: p.name().to_string(),
                    expected: p.ty(),
                    found: buffer.ty(),
                }
                .into());
            }
            held.push(buffer);
        }
        held.extend(inputs.images.iter().map(|i| Arc::clone(i.buffer())));
        let values: Vec<[u8; 8]> = inputs.params.iter().map(|p| p.raw_bits().to_le_bytes()).collect();

        let mut args: Vec<*mut c_void> = Vec::with_capacity(compiled.args.len());
        args.push(out.raw() as *mut c_void);
        args.extend(held.iter().map(|b| b.raw() as *mut c_void));
        args.extend(values.iter().map(|v| v.as_ptr() as *mut c_void));
        debug_assert_eq!(args.len(), compiled.args.len());

        debug!(func = %name, extents = ?out.extents(), "realizing");
        // SAFETY: `args` follows the order of `compiled.args`; the buffers
        // and parameter values outlive the call.
        unsafe { compiled.entry.call(args.as_ptr()) };

        match (rt.config().offload, compiled.copy_to_host) {
            (Some(target), Some(copy)) => {
                out.attach_hooks(copy, compiled.free_buffer);
                out.mark_device_written();
                debug!(func = %name, ?target, "result left on device");
            }
            _ => out.mark_host_written(),
        }
        Ok(())
    }

    /// Emit a native object for `f` as `<dir>/<module_name>.o`.
    pub fn compile_to_file(
        &self,
        rt: &Runtime,
        f: Func,
        module_name: &str,
        dir: &Path,
    ) -> Result<PathBuf> {
        let mut request = self.lower(f)?;
        request.name = module_name.to_string();
        std::fs::create_dir_all(dir).map_err(CompileError::from)?;
        let path = dir.join(format!("{}.o", module_name));
        rt.backend().emit_object(&request, &path)?;
        info!(func = self.name(f), path = %path.display(), "wrote object");
        Ok(path)
    }
}
