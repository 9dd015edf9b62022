//! Applying directive lists to a mutable schedule state.

use std::collections::BTreeMap;

use petgraph::Direction;
use tracing::{debug, trace};

use crate::error::{ScheduleError, ScheduleErrorKind};
use crate::ir::expr::{Expr, Var};
use crate::ir::func::{Definition, Func, Pipeline};
use crate::schedule::Directive;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoopKind {
    Serial,
    Parallel,
    Vectorized,
    Unrolled,
}

/// One loop of a function's nest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dim {
    pub var: Var,
    pub kind: LoopKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitRecord {
    pub old: Var,
    pub outer: Var,
    pub inner: Var,
    pub factor: i32,
}

/// Where a function's values are stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreLevel {
    /// Recomputed at every use.
    Inline,
    /// Computed once per realization of the pipeline.
    Root,
    /// Computed per iteration of the named consumer loop.
    Chunk(Var),
}

/// The schedule of one function after replay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FuncSchedule {
    /// Loops, innermost first.
    pub dims: Vec<Dim>,
    /// Splits in the order they were applied.
    pub splits: Vec<SplitRecord>,
    pub bounds: Vec<(Var, i32, i32)>,
    pub store: StoreLevel,
    pub seeds: Vec<u64>,
}

impl FuncSchedule {
    pub fn new<'a>(vars: impl IntoIterator<Item = &'a Var>) -> Self {
        FuncSchedule {
            dims: vars
                .into_iter()
                .map(|v| Dim {
                    var: v.clone(),
                    kind: LoopKind::Serial,
                })
                .collect(),
            splits: Vec::new(),
            bounds: Vec::new(),
            store: StoreLevel::Inline,
            seeds: Vec::new(),
        }
    }

    pub fn position(&self, v: &Var) -> Option<usize> {
        self.dims.iter().position(|d| d.var == *v)
    }

    pub fn bound(&self, v: &Var) -> Option<(i32, i32)> {
        self.bounds
            .iter()
            .rev()
            .find(|(b, _, _)| b == v)
            .map(|&(_, min, extent)| (min, extent))
    }

    pub fn kind(&self, v: &Var) -> Option<LoopKind> {
        self.position(v).map(|i| self.dims[i].kind)
    }

    /// Apply one primitive directive.
    pub fn apply(&mut self, directive: &Directive) -> Result<(), ScheduleErrorKind> {
        match directive {
            Directive::Split {
                old,
                outer,
                inner,
                factor,
            } => {
                if *factor <= 0 {
                    return Err(ScheduleErrorKind::BadFactor(*factor));
                }
                let at = self.require(old)?;
                for new in [outer, inner] {
                    if new != old && self.position(new).is_some() {
                        return Err(ScheduleErrorKind::DuplicateVar(new.name().to_string()));
                    }
                }
                if outer == inner {
                    return Err(ScheduleErrorKind::DuplicateVar(inner.name().to_string()));
                }
                self.dims[at] = Dim {
                    var: inner.clone(),
                    kind: LoopKind::Serial,
                };
                self.dims.insert(
                    at + 1,
                    Dim {
                        var: outer.clone(),
                        kind: LoopKind::Serial,
                    },
                );
                self.splits.push(SplitRecord {
                    old: old.clone(),
                    outer: outer.clone(),
                    inner: inner.clone(),
                    factor: *factor,
                });
            }
            Directive::Vectorize(v) => self.set_kind(v, LoopKind::Vectorized)?,
            Directive::Unroll(v) => self.set_kind(v, LoopKind::Unrolled)?,
            Directive::Parallel(v) => self.set_kind(v, LoopKind::Parallel)?,
            Directive::Transpose { outer, inner } => {
                if outer == inner {
                    return Err(ScheduleErrorKind::BadTranspose {
                        outer: outer.name().to_string(),
                        inner: inner.name().to_string(),
                    });
                }
                let from = self.require(outer)?;
                self.require(inner)?;
                let dim = self.dims.remove(from);
                let to = self.require(inner)? + 1;
                self.dims.insert(to, dim);
            }
            Directive::Chunk(v) => self.store = StoreLevel::Chunk(v.clone()),
            Directive::Root => self.store = StoreLevel::Root,
            Directive::Bound { var, min, extent } => {
                if *extent <= 0 {
                    return Err(ScheduleErrorKind::BadFactor(*extent));
                }
                self.require(var)?;
                self.bounds.push((var.clone(), *min, *extent));
            }
            Directive::Random(seed) => self.randomize(*seed),
        }
        Ok(())
    }

    fn require(&self, v: &Var) -> Result<usize, ScheduleErrorKind> {
        self.position(v)
            .ok_or_else(|| ScheduleErrorKind::UnknownVar(v.name().to_string()))
    }

    fn set_kind(&mut self, v: &Var, kind: LoopKind) -> Result<(), ScheduleErrorKind> {
        let at = self.require(v)?;
        self.dims[at].kind = kind;
        Ok(())
    }

    /// A seeded tweak that never changes the computed values: nothing,
    /// storing at root, or splitting the innermost loop.
    fn randomize(&mut self, seed: u64) {
        self.seeds.push(seed);
        let mut rng = Xorshift64::new(seed);
        match rng.next() % 3 {
            0 => {}
            1 => self.store = StoreLevel::Root,
            _ => {
                let Some(innermost) = self.dims.first().map(|d| d.var.clone()) else {
                    return;
                };
                let factor = 2 + (rng.next() % 7) as i32;
                let inner = Var::new(&format!("{}.r{}", innermost, self.seeds.len()));
                if self.position(&inner).is_some() {
                    return;
                }
                let split = Directive::Split {
                    old: innermost.clone(),
                    outer: innermost,
                    inner,
                    factor,
                };
                // Cannot fail: the old dim exists and the new name is free.
                let _ = self.apply(&split);
            }
        }
    }
}

/// Xorshift64 PRNG driving `random(seed)` directives.
pub(crate) struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            state: seed | 1, // ensure non-zero
        }
    }

    pub(crate) fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

/// Replayed schedules of every function taking part in one compilation,
/// keyed by function name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScheduleState {
    pub funcs: BTreeMap<String, FuncSchedule>,
}

impl ScheduleState {
    pub fn get(&self, name: &str) -> Option<&FuncSchedule> {
        self.funcs.get(name)
    }
}

/// Directives synthesized for tuple-valued functions: each tuple dimension
/// is pulled outside every var nested in it, bounded to the tuple length
/// and unrolled.
pub fn tuple_fixups(def: &Definition) -> Vec<Directive> {
    let mut out = Vec::new();
    for (i, &len) in def.shape.iter().enumerate() {
        let Some(t) = def.args.len().checked_sub(1 + i).map(|j| &def.args[j]) else {
            continue;
        };
        let Some(at) = def.args.iter().position(|v| v == t) else {
            continue;
        };
        for nested in def.args[..at].iter().rev() {
            out.push(Directive::Transpose {
                outer: nested.clone(),
                inner: t.clone(),
            });
        }
        out.push(Directive::Bound {
            var: t.clone(),
            min: 0,
            extent: len as i32,
        });
        out.push(Directive::Unroll(t.clone()));
    }
    out
}

fn initial_schedule(pipeline: &Pipeline, f: Func) -> FuncSchedule {
    let def = pipeline.definition(f);
    match def.owner {
        None => FuncSchedule::new(&def.args),
        Some(owner) => {
            // Update loops: reduction dims innermost, then the owner's pure
            // vars that the clauses index by directly.
            let owner = pipeline.definition(owner);
            let mut vars: Vec<Var> = Vec::new();
            for clause in &owner.updates {
                if let Some(rdom) = &clause.rdom {
                    for dim in rdom.dims() {
                        if !vars.contains(&dim.var) {
                            vars.push(dim.var.clone());
                        }
                    }
                }
            }
            for clause in &owner.updates {
                for arg in &clause.args {
                    if let Expr::Var(v) = arg {
                        if !vars.contains(v) {
                            vars.push(v.clone());
                        }
                    }
                }
            }
            FuncSchedule::new(&vars)
        }
    }
}

fn apply_list(
    state: &mut FuncSchedule,
    name: &str,
    directives: &[Directive],
) -> Result<(), ScheduleError> {
    for (index, directive) in directives.iter().enumerate() {
        trace!(func = name, index, %directive, "replay");
        state.apply(directive).map_err(|kind| ScheduleError {
            func: name.to_string(),
            index,
            directive: directive.to_string(),
            kind,
        })?;
    }
    Ok(())
}

fn replay_func(pipeline: &Pipeline, state: &mut ScheduleState, f: Func, root: bool) -> Result<(), ScheduleError> {
    let def = pipeline.definition(f);
    let mut sched = initial_schedule(pipeline, f);
    if root {
        sched.store = StoreLevel::Root;
    }
    // The target's implicit root counts as a directive of its own.
    if !def.shape.is_empty() && (root || !def.directives.is_empty()) {
        apply_list(&mut sched, &def.name, &tuple_fixups(def))?;
    }
    apply_list(&mut sched, &def.name, &def.directives)?;
    state.funcs.insert(def.name.clone(), sched);

    if let Some(handle) = def.update_handle {
        let update = pipeline.definition(handle);
        let mut sched = initial_schedule(pipeline, handle);
        apply_list(&mut sched, &update.name, &update.directives)?;
        state.funcs.insert(update.name.clone(), sched);
    }
    Ok(())
}

/// Replay the schedules relevant to compiling `target`: the target first
/// (forced to root), then every function reachable from it, each once.
pub fn replay(pipeline: &Pipeline, target: Func) -> Result<ScheduleState, ScheduleError> {
    let mut state = ScheduleState::default();
    replay_func(pipeline, &mut state, target, true)?;
    for f in pipeline.reachable(target) {
        replay_func(pipeline, &mut state, f, false)?;
    }
    check_chunks(pipeline, &state, target)?;
    debug!(
        target = pipeline.name(target),
        funcs = state.funcs.len(),
        "replayed schedule"
    );
    Ok(state)
}

/// Every `chunk(v)` must name a loop of some function that calls the
/// chunked one, either its pure nest or its update loops.
fn check_chunks(pipeline: &Pipeline, state: &ScheduleState, target: Func) -> Result<(), ScheduleError> {
    let graph = pipeline.call_graph(target);
    for f in graph.nodes() {
        let def = pipeline.definition(f);
        let Some(StoreLevel::Chunk(v)) = state.get(&def.name).map(|s| &s.store) else {
            continue;
        };
        let found = graph
            .neighbors_directed(f, Direction::Incoming)
            .flat_map(|caller| {
                let caller = pipeline.definition(caller);
                std::iter::once(caller.name.as_str()).chain(
                    caller
                        .update_handle
                        .map(|u| pipeline.definition(u).name.as_str()),
                )
            })
            .filter_map(|name| state.get(name))
            .any(|s| s.position(v).is_some());
        if found {
            continue;
        }
        let index = def
            .directives
            .iter()
            .rposition(|d| matches!(d, Directive::Chunk(_)))
            .unwrap_or(0);
        return Err(ScheduleError {
            func: def.name.clone(),
            index,
            directive: def
                .directives
                .get(index)
                .map(ToString::to_string)
                .unwrap_or_default(),
            kind: ScheduleErrorKind::UnknownChunkLoop(v.name().to_string()),
        });
    }
    Ok(())
}
