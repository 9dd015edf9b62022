//! Scheduling directives.
//!
//! Every function carries an append-only list of [`Directive`]s. The
//! convenience forms (`tile`, `vectorize_by`, `cuda_tile`, ...) are expanded
//! into primitive directives at the moment they are recorded, so the stored
//! list is always primitive. Nothing is interpreted until compilation, when
//! [`replay`] applies the lists of every function reachable from the target
//! to a fresh [`ScheduleState`].

pub mod archive;
pub mod replay;

use std::fmt;

use tracing::trace;

use crate::ir::expr::Var;
use crate::ir::func::{Func, Pipeline};

pub use replay::{replay, Dim, FuncSchedule, LoopKind, ScheduleState, SplitRecord, StoreLevel};

/// One primitive scheduling instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Replace `old` with `outer * factor + inner`, `inner` innermost.
    Split {
        old: Var,
        outer: Var,
        inner: Var,
        factor: i32,
    },
    Vectorize(Var),
    Unroll(Var),
    /// Move `outer` to just outside `inner`.
    Transpose {
        outer: Var,
        inner: Var,
    },
    /// Compute at each iteration of the caller's `var` loop.
    Chunk(Var),
    Root,
    Parallel(Var),
    Random(u64),
    /// Constrain `var` to `[min, min + extent)`.
    Bound {
        var: Var,
        min: i32,
        extent: i32,
    },
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Directive::Split {
                old,
                outer,
                inner,
                factor,
            } => write!(f, "split({}, {}, {}, {})", old, outer, inner, factor),
            Directive::Vectorize(v) => write!(f, "vectorize({})", v),
            Directive::Unroll(v) => write!(f, "unroll({})", v),
            Directive::Transpose { outer, inner } => write!(f, "transpose({}, {})", outer, inner),
            Directive::Chunk(v) => write!(f, "chunk({})", v),
            Directive::Root => write!(f, "root()"),
            Directive::Parallel(v) => write!(f, "parallel({})", v),
            Directive::Random(seed) => write!(f, "random({})", seed),
            Directive::Bound { var, min, extent } => write!(f, "bound({}, {}, {})", var, min, extent),
        }
    }
}

pub const BLOCK_X: &str = "blockidx";
pub const BLOCK_Y: &str = "blockidy";
pub const THREAD_X: &str = "threadidx";
pub const THREAD_Y: &str = "threadidy";

/// Records directives on one function. Obtained from [`Pipeline::schedule`].
pub struct ScheduleBuilder<'p> {
    pipeline: &'p mut Pipeline,
    func: Func,
}

impl Pipeline {
    pub fn schedule(&mut self, f: Func) -> ScheduleBuilder<'_> {
        ScheduleBuilder {
            pipeline: self,
            func: f,
        }
    }
}

impl ScheduleBuilder<'_> {
    fn push(&mut self, directive: Directive) -> &mut Self {
        trace!(func = self.pipeline.name(self.func), %directive, "schedule");
        self.pipeline
            .definition_mut(self.func)
            .directives
            .push(directive);
        self.pipeline.invalidate();
        self
    }

    pub fn directives(&self) -> &[Directive] {
        &self.pipeline.definition(self.func).directives
    }

    pub fn split(&mut self, old: &Var, outer: &Var, inner: &Var, factor: i32) -> &mut Self {
        self.push(Directive::Split {
            old: old.clone(),
            outer: outer.clone(),
            inner: inner.clone(),
            factor,
        })
    }

    pub fn vectorize(&mut self, v: &Var) -> &mut Self {
        self.push(Directive::Vectorize(v.clone()))
    }

    /// Split `v` by `factor` and vectorize the new inner dimension. A
    /// factor of one records nothing.
    pub fn vectorize_by(&mut self, v: &Var, factor: i32) -> &mut Self {
        if factor == 1 {
            return self;
        }
        let inner = self.pipeline.fresh_var(v.name());
        self.split(v, v, &inner, factor).vectorize(&inner)
    }

    pub fn unroll(&mut self, v: &Var) -> &mut Self {
        self.push(Directive::Unroll(v.clone()))
    }

    /// Split `v` by `factor` and unroll the new inner dimension. A factor of
    /// one records nothing.
    pub fn unroll_by(&mut self, v: &Var, factor: i32) -> &mut Self {
        if factor == 1 {
            return self;
        }
        let inner = self.pipeline.fresh_var(v.name());
        self.split(v, v, &inner, factor).unroll(&inner)
    }

    pub fn transpose(&mut self, outer: &Var, inner: &Var) -> &mut Self {
        self.push(Directive::Transpose {
            outer: outer.clone(),
            inner: inner.clone(),
        })
    }

    pub fn tile(&mut self, x: &Var, y: &Var, xi: &Var, yi: &Var, fx: i32, fy: i32) -> &mut Self {
        self.split(x, x, xi, fx).split(y, y, yi, fy).transpose(x, yi)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn tile_with_outer(
        &mut self,
        x: &Var,
        y: &Var,
        xo: &Var,
        yo: &Var,
        xi: &Var,
        yi: &Var,
        fx: i32,
        fy: i32,
    ) -> &mut Self {
        self.split(x, xo, xi, fx).split(y, yo, yi, fy).transpose(xo, yi)
    }

    /// Give dimension `old` the name `new`.
    pub fn rename(&mut self, old: &Var, new: &Var) -> &mut Self {
        let dummy = self.pipeline.fresh_var(old.name());
        self.split(old, new, &dummy, 1)
    }

    pub fn root(&mut self) -> &mut Self {
        self.push(Directive::Root)
    }

    pub fn chunk(&mut self, caller_var: &Var) -> &mut Self {
        self.push(Directive::Chunk(caller_var.clone()))
    }

    pub fn parallel(&mut self, v: &Var) -> &mut Self {
        self.push(Directive::Parallel(v.clone()))
    }

    pub fn random(&mut self, seed: u64) -> &mut Self {
        self.push(Directive::Random(seed))
    }

    /// Map `b` onto GPU blocks and `t` onto threads.
    pub fn cuda(&mut self, b: &Var, t: &Var) -> &mut Self {
        let (bx, tx) = (Var::new(BLOCK_X), Var::new(THREAD_X));
        self.rename(b, &bx)
            .rename(t, &tx)
            .parallel(&bx)
            .parallel(&tx)
    }

    pub fn cuda_2d(&mut self, bx: &Var, by: &Var, tx: &Var, ty: &Var) -> &mut Self {
        let (bidx, bidy) = (Var::new(BLOCK_X), Var::new(BLOCK_Y));
        let (tidx, tidy) = (Var::new(THREAD_X), Var::new(THREAD_Y));
        self.rename(bx, &bidx)
            .rename(tx, &tidx)
            .rename(by, &bidy)
            .rename(ty, &tidy)
            .parallel(&bidx)
            .parallel(&bidy)
            .parallel(&tidx)
            .parallel(&tidy)
    }

    pub fn cuda_tile(&mut self, x: &Var, factor: i32) -> &mut Self {
        let (bx, tx) = (Var::new(BLOCK_X), Var::new(THREAD_X));
        self.split(x, &bx, &tx, factor).parallel(&bx).parallel(&tx)
    }

    pub fn cuda_tile_2d(&mut self, x: &Var, y: &Var, fx: i32, fy: i32) -> &mut Self {
        let (bidx, bidy) = (Var::new(BLOCK_X), Var::new(BLOCK_Y));
        let (tidx, tidy) = (Var::new(THREAD_X), Var::new(THREAD_Y));
        self.tile_with_outer(x, y, &bidx, &bidy, &tidx, &tidy, fx, fy)
            .parallel(&bidx)
            .parallel(&tidx)
            .parallel(&bidy)
            .parallel(&tidy)
    }
}

#[cfg(test)]
mod tests;
