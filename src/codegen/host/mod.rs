//! In-process backend: runs the lowered pipeline as an interpreted loop
//! nest.
//!
//! The target's loops follow its replayed schedule. Splits become nested
//! loops with a guard for uneven extents, transposes reorder them, and
//! parallel loops go through the work queue. Vectorized and unrolled loops
//! run serially. Producers are evaluated on demand and cached according to
//! their storage level: recomputed when inline, memoized for the whole run
//! when stored at root, and memoized per iteration of the named loop when
//! chunked.
//!
//! Update clauses are supported in two shapes: clauses that write
//! `f(pure vars)` (each point accumulates over the reduction domain on its
//! own) and clauses whose coordinates depend only on the reduction domain
//! (realized once into a sparse map, e.g. histograms).

mod eval;
mod lower;
mod nest;

use std::sync::Arc;

use tracing::debug;

use crate::codegen::{Backend, CompileRequest, CompiledModule, Entrypoint};
use crate::error::CompileError;
use crate::runtime::queue::WorkQueue;

use lower::Program;

pub struct HostBackend {
    queue: WorkQueue,
}

impl HostBackend {
    pub fn new(queue: WorkQueue) -> Self {
        HostBackend { queue }
    }
}

impl Backend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn compile(&self, request: &CompileRequest) -> Result<Box<dyn CompiledModule>, CompileError> {
        let program = lower::lower(request)?;
        debug!(
            pipeline = %request.name,
            funcs = program.funcs.len(),
            loops = program.nest.loops.len(),
            "compiled for host"
        );
        Ok(Box::new(HostModule {
            program: Arc::new(program),
            queue: self.queue.clone(),
        }))
    }
}

struct HostModule {
    program: Arc<Program>,
    queue: WorkQueue,
}

impl CompiledModule for HostModule {
    fn entrypoint(&self) -> Entrypoint {
        let program = Arc::clone(&self.program);
        let queue = self.queue.clone();
        // SAFETY: `Entrypoint::call` requires the caller to pass the
        // argument array the program was lowered for.
        Entrypoint::from_fn(move |args| unsafe { eval::execute(&program, &queue, args) })
    }
}
