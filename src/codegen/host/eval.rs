//! Executing a lowered program against marshalled arguments.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Mutex, OnceLock, PoisonError};

use tracing::trace;

use crate::codegen::host::lower::{ClauseCode, FuncCode, Node, Program, Reduction};
use crate::codegen::ArgKind;
use crate::ir::expr::{BinOp, MathFn};
use crate::ir::types::{Scalar, Type};
use crate::runtime::buffer::{Buffer, RawBuffer};
use crate::runtime::queue::WorkQueue;
use crate::runtime::runtime_error;
use crate::schedule::{LoopKind, StoreLevel};

type Points = HashMap<Vec<i32>, Scalar>;

/// Per-thread state: values of functions stored per loop iteration.
#[derive(Default)]
struct Frame {
    chunks: HashMap<usize, Points>,
}

/// How self-references inside an update clause resolve.
#[derive(Clone, Copy)]
enum Acc<'a> {
    None,
    /// The running value of a pointwise reduction.
    Point(Scalar),
    /// The partially built map of a sparse reduction.
    Map(usize, &'a Points),
}

struct Run<'p> {
    program: &'p Program,
    queue: &'p WorkQueue,
    output: *mut RawBuffer,
    images: Vec<*const RawBuffer>,
    params: Vec<Scalar>,
    roots: Vec<Mutex<Points>>,
    sparse: Vec<OnceLock<Points>>,
}

// Buffers behind the raw pointers outlive the run; distinct iterations
// write distinct output elements.
unsafe impl Sync for Run<'_> {}

/// Run `program` with the argument array of the entrypoint contract.
///
/// # Safety
/// `args` must hold one valid pointer per entry of `program.args`: a
/// `*mut RawBuffer` for buffers, a pointer to the value for scalars.
pub(crate) unsafe fn execute(program: &Program, queue: &WorkQueue, args: *const *mut c_void) {
    let mut output = std::ptr::null_mut();
    let mut images = Vec::with_capacity(program.images.len());
    let mut params = Vec::with_capacity(program.params.len());
    for (i, arg) in program.args.iter().enumerate() {
        let ptr = *args.add(i);
        match arg.kind {
            ArgKind::Result => output = ptr as *mut RawBuffer,
            ArgKind::ImageParam | ArgKind::Image => images.push(ptr as *const RawBuffer),
            ArgKind::Param => {
                let bytes = std::slice::from_raw_parts(ptr as *const u8, arg.ty.bytes());
                params.push(Scalar::load(arg.ty, bytes));
            }
        }
    }
    if output.is_null() {
        runtime_error(&format!("{}: no output buffer", program.name));
        return;
    }

    let run = Run {
        program,
        queue,
        output,
        images,
        params,
        roots: program.funcs.iter().map(|_| Mutex::default()).collect(),
        sparse: program.funcs.iter().map(|_| OnceLock::new()).collect(),
    };
    let ranges = program.nest.ranges(&*output);
    trace!(pipeline = %program.name, ?ranges, "executing");
    let mut vals = vec![0; program.nest.slots];
    run.nest(&mut Frame::default(), &ranges, program.nest.loops.len(), &mut vals);
}

impl Run<'_> {
    fn nest(&self, frame: &mut Frame, ranges: &[(i32, i32)], level: usize, vals: &mut Vec<i32>) {
        if level == 0 {
            self.emit(frame, ranges, vals);
            return;
        }
        let l = &self.program.nest.loops[level - 1];
        let (min, extent) = ranges[l.slot];
        let chunked = self.program.chunk_at.get(&l.var);
        match l.kind {
            LoopKind::Parallel => {
                let base = vals.clone();
                self.queue.par_for(min, extent, &|i| {
                    let mut vals = base.clone();
                    vals[l.slot] = i;
                    self.nest(&mut Frame::default(), ranges, level - 1, &mut vals);
                });
            }
            LoopKind::Serial | LoopKind::Vectorized | LoopKind::Unrolled => {
                for i in min..min + extent {
                    if let Some(funcs) = chunked {
                        for f in funcs {
                            frame.chunks.remove(f);
                        }
                    }
                    vals[l.slot] = i;
                    self.nest(frame, ranges, level - 1, vals);
                }
            }
        }
    }

    fn emit(&self, frame: &mut Frame, ranges: &[(i32, i32)], vals: &mut [i32]) {
        let nest = &self.program.nest;
        if !nest.reconstruct(ranges, vals) {
            return;
        }
        let coords = &vals[..nest.args];
        // SAFETY: the output descriptor is valid for the whole run.
        let out = unsafe { &*self.output };
        let Some(index) = element_index(out, coords) else {
            return;
        };
        let target = &self.program.funcs[self.program.target];
        let value = self.compute(frame, self.program.target, coords);
        // SAFETY: `index` is in range and each point is emitted once.
        unsafe { Buffer::store_raw(self.output, target.ty, index, value) };
    }

    /// The value of function `f` at `coords`, honoring its storage level.
    fn value(&self, frame: &mut Frame, f: usize, coords: &[i32]) -> Scalar {
        match &self.program.funcs[f].store {
            StoreLevel::Inline => self.compute(frame, f, coords),
            StoreLevel::Root => {
                let memo = &self.roots[f];
                if let Some(v) = memo.lock().unwrap_or_else(PoisonError::into_inner).get(coords) {
                    return *v;
                }
                let v = self.compute(frame, f, coords);
                memo.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(coords.to_vec(), v);
                v
            }
            StoreLevel::Chunk(_) => {
                if let Some(v) = frame.chunks.get(&f).and_then(|c| c.get(coords)) {
                    return *v;
                }
                let v = self.compute(frame, f, coords);
                frame.chunks.entry(f).or_default().insert(coords.to_vec(), v);
                v
            }
        }
    }

    fn compute(&self, frame: &mut Frame, f: usize, coords: &[i32]) -> Scalar {
        let func = &self.program.funcs[f];
        match &func.reduction {
            Reduction::None => self.pure(frame, func, coords),
            Reduction::Pointwise(clauses) => {
                let mut acc = self.pure(frame, func, coords);
                let mut vars = coords.to_vec();
                for clause in clauses {
                    self.for_each_rdom(frame, clause, &mut vars, &mut |run: &Self, frame: &mut Frame, vars: &[i32]| {
                        acc = run.eval(frame, &clause.body, vars, Acc::Point(acc)).cast(func.ty);
                    });
                }
                acc
            }
            Reduction::Sparse(_) => {
                let points = self.sparse[f].get_or_init(|| self.realize_sparse(f));
                match points.get(coords) {
                    Some(v) => *v,
                    None => self.pure(frame, func, coords),
                }
            }
        }
    }

    fn pure(&self, frame: &mut Frame, func: &FuncCode, coords: &[i32]) -> Scalar {
        self.eval(frame, &func.body, coords, Acc::None).cast(func.ty)
    }

    fn realize_sparse(&self, f: usize) -> Points {
        let func = &self.program.funcs[f];
        let Reduction::Sparse(clauses) = &func.reduction else {
            return Points::new();
        };
        let mut frame = Frame::default();
        let mut points = Points::new();
        for clause in clauses {
            let mut vars = vec![0; func.arity];
            self.for_each_rdom(&mut frame, clause, &mut vars, &mut |run: &Self, frame: &mut Frame, vars: &[i32]| {
                let coords: Vec<i32> = clause
                    .args
                    .iter()
                    .map(|a| run.eval(frame, a, vars, Acc::Map(f, &points)).as_i64() as i32)
                    .collect();
                let v = run.eval(frame, &clause.body, vars, Acc::Map(f, &points)).cast(func.ty);
                points.insert(coords, v);
            });
        }
        trace!(func = %func.name, points = points.len(), "realized sparse reduction");
        points
    }

    /// Call `body` once per point of the clause's reduction domain, first
    /// dimension innermost. `vars` holds the pure coordinates on entry.
    fn for_each_rdom(
        &self,
        frame: &mut Frame,
        clause: &ClauseCode,
        vars: &mut Vec<i32>,
        body: &mut dyn FnMut(&Self, &mut Frame, &[i32]),
    ) {
        let pure = vars.len();
        let bounds: Vec<(i32, i32)> = clause
            .rdom
            .iter()
            .map(|(min, extent)| {
                let m = self.eval(frame, min, vars, Acc::None).as_i64() as i32;
                let e = self.eval(frame, extent, vars, Acc::None).as_i64() as i32;
                (m, e)
            })
            .collect();
        if bounds.iter().any(|&(_, e)| e <= 0) {
            return;
        }
        vars.extend(bounds.iter().map(|&(m, _)| m));
        'points: loop {
            body(self, frame, vars);
            for (d, &(m, e)) in bounds.iter().enumerate() {
                let slot = pure + d;
                vars[slot] += 1;
                if vars[slot] < m + e {
                    continue 'points;
                }
                vars[slot] = m;
            }
            break;
        }
        vars.truncate(pure);
    }

    fn eval(&self, frame: &mut Frame, node: &Node, vars: &[i32], acc: Acc<'_>) -> Scalar {
        match node {
            Node::Const(v) => *v,
            Node::Var(i) => Scalar::Int(vars.get(*i).copied().unwrap_or(0) as i64),
            Node::Param(i) => self.params[*i],
            Node::Cast(ty, inner) => self.eval(frame, inner, vars, acc).cast(*ty),
            Node::Binary(op, ty, a, b) => {
                let a = self.eval(frame, a, vars, acc);
                let b = self.eval(frame, b, vars, acc);
                binary(*op, *ty, a, b)
            }
            Node::Select(c, t, f) => {
                if self.eval(frame, c, vars, acc).is_true() {
                    self.eval(frame, t, vars, acc)
                } else {
                    self.eval(frame, f, vars, acc)
                }
            }
            Node::Math(fun, ty, args) => {
                let args: Vec<Scalar> = args.iter().map(|a| self.eval(frame, a, vars, acc)).collect();
                math(*fun, *ty, &args)
            }
            Node::Accumulator => match acc {
                Acc::Point(v) => v,
                _ => Scalar::Int(0),
            },
            Node::Call(g, args) => {
                let coords: Vec<i32> = args
                    .iter()
                    .map(|a| self.eval(frame, a, vars, acc).as_i64() as i32)
                    .collect();
                match acc {
                    Acc::Map(owner, points) if owner == *g => match points.get(&coords) {
                        Some(v) => *v,
                        None => self.pure(frame, &self.program.funcs[*g], &coords),
                    },
                    _ => self.value(frame, *g, &coords),
                }
            }
            Node::Load(i, args) => {
                let coords: Vec<i32> = args
                    .iter()
                    .map(|a| self.eval(frame, a, vars, acc).as_i64() as i32)
                    .collect();
                self.load(*i, &coords)
            }
        }
    }

    fn load(&self, image: usize, coords: &[i32]) -> Scalar {
        let slot = &self.program.images[image];
        let raw = self.images[image];
        // SAFETY: image descriptors stay valid for the whole run.
        let desc = unsafe { &*raw };
        match element_index(desc, coords) {
            // SAFETY: the index was bounds-checked against the descriptor.
            Some(index) => unsafe { Buffer::load_raw(raw, slot.ty, index) },
            None => {
                runtime_error(&format!(
                    "{}: read of '{}' at {:?} is out of bounds",
                    self.program.name, slot.name, coords
                ));
                Scalar::zero(slot.ty)
            }
        }
    }
}

/// Flat element index of `coords` in `desc`, or `None` outside it.
fn element_index(desc: &RawBuffer, coords: &[i32]) -> Option<usize> {
    let mut index = 0usize;
    for (i, &c) in coords.iter().enumerate() {
        let local = c.checked_sub(desc.min[i])?;
        if local < 0 || local >= desc.extent[i] {
            return None;
        }
        index += local as usize * desc.stride[i] as usize;
    }
    Some(index)
}

/// Apply `op` to operands already coerced to `ty`.
pub(crate) fn binary(op: BinOp, ty: Type, a: Scalar, b: Scalar) -> Scalar {
    if op.is_comparison() {
        return Scalar::UInt(compare(op, a, b) as u64);
    }
    match (op, a, b) {
        (BinOp::And, ..) => Scalar::UInt((a.is_true() && b.is_true()) as u64),
        (BinOp::Or, ..) => Scalar::UInt((a.is_true() || b.is_true()) as u64),
        (_, Scalar::Int(x), Scalar::Int(y)) => Scalar::Int(int_op(op, x, y)).cast(ty),
        (_, Scalar::UInt(x), Scalar::UInt(y)) => Scalar::UInt(uint_op(op, x, y)).cast(ty),
        _ => Scalar::Float(float_op(op, a.as_f64(), b.as_f64())).cast(ty),
    }
}

/// Apply a math routine at the precision of `ty`.
pub(crate) fn math(fun: MathFn, ty: Type, args: &[Scalar]) -> Scalar {
    let arg = |i: usize| args.get(i).map_or(0.0, |a| a.as_f64());
    let value = if ty == Type::Float(64) {
        let x = arg(0);
        match fun {
            MathFn::Sqrt => x.sqrt(),
            MathFn::Sin => x.sin(),
            MathFn::Cos => x.cos(),
            MathFn::Exp => x.exp(),
            MathFn::Log => x.ln(),
            MathFn::Pow => x.powf(arg(1)),
            MathFn::Floor => x.floor(),
            MathFn::Ceil => x.ceil(),
            MathFn::Round => x.round(),
        }
    } else {
        let x = arg(0) as f32;
        let y = match fun {
            MathFn::Sqrt => x.sqrt(),
            MathFn::Sin => x.sin(),
            MathFn::Cos => x.cos(),
            MathFn::Exp => x.exp(),
            MathFn::Log => x.ln(),
            MathFn::Pow => x.powf(arg(1) as f32),
            MathFn::Floor => x.floor(),
            MathFn::Ceil => x.ceil(),
            MathFn::Round => x.round(),
        };
        y as f64
    };
    Scalar::Float(value).cast(ty)
}

fn compare(op: BinOp, a: Scalar, b: Scalar) -> bool {
    let ord = match (a, b) {
        (Scalar::Int(x), Scalar::Int(y)) => Some(x.cmp(&y)),
        (Scalar::UInt(x), Scalar::UInt(y)) => Some(x.cmp(&y)),
        _ => a.as_f64().partial_cmp(&b.as_f64()),
    };
    let Some(ord) = ord else {
        return op == BinOp::Ne;
    };
    match op {
        BinOp::Eq => ord.is_eq(),
        BinOp::Ne => ord.is_ne(),
        BinOp::Lt => ord.is_lt(),
        BinOp::Le => ord.is_le(),
        BinOp::Gt => ord.is_gt(),
        _ => ord.is_ge(),
    }
}

/// Integer arithmetic: wrapping, flooring division, non-negative modulo,
/// and zero for division by zero.
fn int_op(op: BinOp, x: i64, y: i64) -> i64 {
    match op {
        BinOp::Add => x.wrapping_add(y),
        BinOp::Sub => x.wrapping_sub(y),
        BinOp::Mul => x.wrapping_mul(y),
        BinOp::Div if y == 0 => 0,
        BinOp::Div => {
            let q = x.wrapping_div(y);
            if x.wrapping_rem(y) != 0 && ((x < 0) != (y < 0)) {
                q - 1
            } else {
                q
            }
        }
        BinOp::Mod if y == 0 => 0,
        BinOp::Mod => x.wrapping_rem_euclid(y),
        BinOp::Min => x.min(y),
        BinOp::Max => x.max(y),
        _ => 0,
    }
}

fn uint_op(op: BinOp, x: u64, y: u64) -> u64 {
    match op {
        BinOp::Add => x.wrapping_add(y),
        BinOp::Sub => x.wrapping_sub(y),
        BinOp::Mul => x.wrapping_mul(y),
        BinOp::Div | BinOp::Mod if y == 0 => 0,
        BinOp::Div => x / y,
        BinOp::Mod => x % y,
        BinOp::Min => x.min(y),
        BinOp::Max => x.max(y),
        _ => 0,
    }
}

fn float_op(op: BinOp, x: f64, y: f64) -> f64 {
    match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => x / y,
        BinOp::Mod => x - y * (x / y).floor(),
        BinOp::Min => x.min(y),
        BinOp::Max => x.max(y),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i(v: i64) -> Scalar {
        Scalar::Int(v)
    }

    #[test]
    fn test_integer_division_floors() {
        let t = Type::i32();
        assert_eq!(binary(BinOp::Div, t, i(7), i(2)), i(3));
        assert_eq!(binary(BinOp::Div, t, i(-7), i(2)), i(-4));
        assert_eq!(binary(BinOp::Mod, t, i(-7), i(2)), i(1));
        assert_eq!(binary(BinOp::Div, t, i(5), i(0)), i(0));
    }

    #[test]
    fn test_wrapping_to_width() {
        let t = Type::UInt(8);
        let r = binary(BinOp::Add, t, Scalar::UInt(200), Scalar::UInt(100));
        assert_eq!(r, Scalar::UInt(44));
        let r = binary(BinOp::Mul, Type::Int(16), i(300), i(300));
        assert_eq!(r, i(90000i64 as i16 as i64));
    }

    #[test]
    fn test_f32_arithmetic_rounds() {
        let t = Type::f32();
        let (a, b) = (0.1f32 as f64, 0.2f32 as f64);
        let r = binary(BinOp::Add, t, Scalar::Float(a), Scalar::Float(b));
        assert_eq!(r, Scalar::Float((0.1f32 + 0.2f32) as f64));
    }

    #[test]
    fn test_comparisons() {
        let t = Type::i32();
        assert_eq!(binary(BinOp::Lt, t, i(1), i(2)), Scalar::UInt(1));
        assert_eq!(binary(BinOp::Ge, t, i(1), i(2)), Scalar::UInt(0));
        let nan = Scalar::Float(f64::NAN);
        assert_eq!(binary(BinOp::Eq, Type::f32(), nan, nan), Scalar::UInt(0));
        assert_eq!(binary(BinOp::Ne, Type::f32(), nan, nan), Scalar::UInt(1));
    }

    #[test]
    fn test_math_precision() {
        let f32t = Type::f32();
        assert_eq!(math(MathFn::Sqrt, f32t, &[Scalar::Float(2.0)]), Scalar::Float(2f32.sqrt() as f64));
        assert_eq!(math(MathFn::Sqrt, Type::Float(64), &[Scalar::Float(2.0)]), Scalar::Float(2f64.sqrt()));
        assert_eq!(
            math(MathFn::Pow, f32t, &[Scalar::Float(2.0), Scalar::Float(10.0)]),
            Scalar::Float(1024.0)
        );
        assert_eq!(math(MathFn::Round, f32t, &[Scalar::Float(-2.5)]), Scalar::Float(-3.0));
        assert_eq!(math(MathFn::Floor, f32t, &[Scalar::Float(-0.5)]), Scalar::Float(-1.0));
        assert_eq!(math(MathFn::Ceil, f32t, &[Scalar::Float(0.25)]), Scalar::Float(1.0));
        let Scalar::Float(nan) = math(MathFn::Log, f32t, &[Scalar::Float(-1.0)]) else {
            panic!("log should stay a float");
        };
        assert!(nan.is_nan());
    }

    #[test]
    fn test_element_index() {
        let buf = Buffer::new(Type::i32(), &[4, 3]).unwrap();
        let desc = unsafe { &*buf.raw() };
        assert_eq!(element_index(desc, &[1, 2]), Some(9));
        assert_eq!(element_index(desc, &[4, 0]), None);
        assert_eq!(element_index(desc, &[0, -1]), None);
    }
}
