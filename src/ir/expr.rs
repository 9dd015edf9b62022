//! Expression trees and the leaves they are built from.
//!
//! An `Expr` is a plain value: it refers to functions only through `Func`
//! ids, so it can be built before the callee is defined and inspected
//! without access to the definition arena. Everything that needs the arena
//! (types of calls, implicit-argument counts) lives in `ir::analyze`.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Rem, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::ir::func::Func;
use crate::ir::types::{Element, Scalar, Type};
use crate::runtime::buffer::Buffer;

// ─── Leaves ───────────────────────────────────────────────────────

/// A named coordinate dimension. Two vars are the same var iff their names
/// are equal.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Var(Arc<str>);

impl Var {
    pub fn new(name: &str) -> Self {
        Var(Arc::from(name))
    }

    /// The `i`-th implicit var appended to a definition's argument list.
    pub fn implicit(i: usize) -> Self {
        Var::new(&format!("iv{}", i))
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn is_implicit(&self) -> bool {
        self.0
            .strip_prefix("iv")
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Var({})", self.0)
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One dimension of a reduction domain.
#[derive(Clone, Debug, PartialEq)]
pub struct RDim {
    pub var: Var,
    pub min: Expr,
    pub extent: Expr,
}

/// A reduction domain: the extra iteration dimensions a scatter definition
/// walks. Identity is the domain's name.
#[derive(Clone, Debug)]
pub struct RDom {
    name: Arc<str>,
    dims: Arc<[RDim]>,
}

const RDIM_SUFFIXES: [&str; 4] = ["x", "y", "z", "w"];

impl RDom {
    /// Build a domain from `(min, extent)` pairs, outermost last.
    pub fn new<M: Into<Expr>, E: Into<Expr>>(name: &str, bounds: Vec<(M, E)>) -> Self {
        let dims: Vec<RDim> = bounds
            .into_iter()
            .enumerate()
            .map(|(i, (min, extent))| {
                let suffix = RDIM_SUFFIXES
                    .get(i)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("d{}", i));
                RDim {
                    var: Var::new(&format!("{}.{}", name, suffix)),
                    min: min.into(),
                    extent: extent.into(),
                }
            })
            .collect();
        RDom {
            name: Arc::from(name),
            dims: dims.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimensions(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[RDim] {
        &self.dims
    }

    pub fn dim(&self, index: usize) -> RVar {
        assert!(index < self.dims.len(), "{} has no dimension {}", self.name, index);
        RVar {
            rdom: self.clone(),
            index,
        }
    }

    pub fn x(&self) -> RVar {
        self.dim(0)
    }

    pub fn y(&self) -> RVar {
        self.dim(1)
    }

    pub fn z(&self) -> RVar {
        self.dim(2)
    }
}

impl PartialEq for RDom {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

/// A single dimension of a reduction domain used as an expression.
#[derive(Clone, Debug, PartialEq)]
pub struct RVar {
    pub rdom: RDom,
    pub index: usize,
}

impl RVar {
    pub fn var(&self) -> &Var {
        &self.rdom.dims[self.index].var
    }
}

/// A scalar pipeline parameter, passed by value at every `realize`.
#[derive(Clone)]
pub struct Param {
    name: Arc<str>,
    ty: Type,
    bits: Arc<AtomicU64>,
}

impl Param {
    pub fn new(name: &str, ty: Type) -> Self {
        Param {
            name: Arc::from(name),
            ty,
            bits: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> Type {
        self.ty
    }

    /// Set the value used by subsequent realizations, converting to the
    /// parameter's type.
    pub fn set<T: Element>(&self, value: T) {
        let mut raw = [0u8; 8];
        let bytes = bytemuck::bytes_of(&value);
        raw[..bytes.len()].copy_from_slice(bytes);
        let scalar = Scalar::load(T::TYPE, &raw).cast(self.ty);
        let mut stored = [0u8; 8];
        scalar.store(self.ty, &mut stored);
        self.bits.store(u64::from_le_bytes(stored), Ordering::Release);
    }

    pub fn value(&self) -> Scalar {
        Scalar::load(self.ty, &self.raw_bits().to_le_bytes())
    }

    /// The value's little-endian element bytes, widened to 64 bits.
    pub fn raw_bits(&self) -> u64 {
        self.bits.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same parameter, not merely one
    /// with the same name.
    pub fn same_as(&self, other: &Param) -> bool {
        Arc::ptr_eq(&self.bits, &other.bits)
    }
}

impl PartialEq for Param {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Param({}: {})", self.name, self.ty)
    }
}

/// An image parameter: a buffer bound by the caller before realizing.
#[derive(Clone)]
pub struct ImageParam {
    name: Arc<str>,
    ty: Type,
    dims: usize,
    bound: Arc<Mutex<Option<Arc<Buffer>>>>,
}

impl ImageParam {
    pub fn new(name: &str, ty: Type, dims: usize) -> Self {
        ImageParam {
            name: Arc::from(name),
            ty,
            dims,
            bound: Arc::new(Mutex::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> Type {
        self.ty
    }

    pub fn dimensions(&self) -> usize {
        self.dims
    }

    pub fn bind(&self, buffer: Arc<Buffer>) {
        if let Ok(mut slot) = self.bound.lock() {
            *slot = Some(buffer);
        }
    }

    pub fn same_as(&self, other: &ImageParam) -> bool {
        Arc::ptr_eq(&self.bound, &other.bound)
    }

    pub fn bound(&self) -> Option<Arc<Buffer>> {
        self.bound.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn at<I, E>(&self, args: I) -> Expr
    where
        I: IntoIterator<Item = E>,
        E: Into<Expr>,
    {
        Expr::Load(
            ImageRef::Param(self.clone()),
            args.into_iter().map(Into::into).collect(),
        )
    }
}

impl PartialEq for ImageParam {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Debug for ImageParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageParam({}: {}x{})", self.name, self.ty, self.dims)
    }
}

/// A concrete buffer captured into the pipeline by value.
#[derive(Clone)]
pub struct Image {
    name: Arc<str>,
    buffer: Arc<Buffer>,
}

impl Image {
    pub fn new(name: &str, buffer: Buffer) -> Self {
        Image {
            name: Arc::from(name),
            buffer: Arc::new(buffer),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn same_as(&self, other: &Image) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    pub fn at<I, E>(&self, args: I) -> Expr
    where
        I: IntoIterator<Item = E>,
        E: Into<Expr>,
    {
        Expr::Load(
            ImageRef::Captured(self.clone()),
            args.into_iter().map(Into::into).collect(),
        )
    }
}

impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Image({})", self.name)
    }
}

/// The image an `Expr::Load` reads from.
#[derive(Clone, Debug, PartialEq)]
pub enum ImageRef {
    Param(ImageParam),
    Captured(Image),
}

impl ImageRef {
    pub fn name(&self) -> &str {
        match self {
            ImageRef::Param(p) => p.name(),
            ImageRef::Captured(i) => i.name(),
        }
    }

    pub fn ty(&self) -> Type {
        match self {
            ImageRef::Param(p) => p.ty(),
            ImageRef::Captured(i) => i.buffer().ty(),
        }
    }

    pub fn dimensions(&self) -> usize {
        match self {
            ImageRef::Param(p) => p.dimensions(),
            ImageRef::Captured(i) => i.buffer().dimensions(),
        }
    }
}

// ─── Expressions ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Min => "min",
            BinOp::Max => "max",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

/// Floating-point math routines. Operands are coerced to a float type
/// (`f32` unless one of them is already `f64`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MathFn {
    Sqrt,
    Sin,
    Cos,
    Exp,
    Log,
    Pow,
    Floor,
    Ceil,
    Round,
}

impl MathFn {
    pub fn name(self) -> &'static str {
        match self {
            MathFn::Sqrt => "sqrt",
            MathFn::Sin => "sin",
            MathFn::Cos => "cos",
            MathFn::Exp => "exp",
            MathFn::Log => "log",
            MathFn::Pow => "pow",
            MathFn::Floor => "floor",
            MathFn::Ceil => "ceil",
            MathFn::Round => "round",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            MathFn::Pow => 2,
            _ => 1,
        }
    }
}

/// A typed scalar expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Const(Type, Scalar),
    Var(Var),
    RVar(RVar),
    Param(Param),
    Cast(Type, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Select(Box<Expr>, Box<Expr>, Box<Expr>),
    Math(MathFn, Vec<Expr>),
    /// Call to another function (or to the function being updated).
    Call(Func, Vec<Expr>),
    Load(ImageRef, Vec<Expr>),
    /// A tuple-valued expression, indexed by one extra implicit dimension.
    Tuple(Vec<Expr>),
    /// A value repeated over `n` extra implicit dimensions.
    Broadcast(Box<Expr>, usize),
}

impl Expr {
    pub fn int(v: i32) -> Self {
        Expr::Const(Type::i32(), Scalar::Int(v as i64))
    }

    pub fn float(v: f32) -> Self {
        Expr::Const(Type::f32(), Scalar::Float(v as f64))
    }

    pub fn constant(ty: Type, value: Scalar) -> Self {
        Expr::Const(ty, value.cast(ty))
    }

    pub fn cast(ty: Type, e: impl Into<Expr>) -> Self {
        Expr::Cast(ty, Box::new(e.into()))
    }

    pub fn select(cond: impl Into<Expr>, then: impl Into<Expr>, otherwise: impl Into<Expr>) -> Self {
        Expr::Select(
            Box::new(cond.into()),
            Box::new(then.into()),
            Box::new(otherwise.into()),
        )
    }

    pub fn tuple<I, E>(elems: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Expr>,
    {
        Expr::Tuple(elems.into_iter().map(Into::into).collect())
    }

    pub fn broadcast(value: impl Into<Expr>, dims: usize) -> Self {
        Expr::Broadcast(Box::new(value.into()), dims)
    }

    fn binary(op: BinOp, a: impl Into<Expr>, b: impl Into<Expr>) -> Self {
        Expr::Binary(op, Box::new(a.into()), Box::new(b.into()))
    }

    /// The largest value of `ty`.
    pub fn max_value(ty: Type) -> Self {
        Expr::Const(ty, Scalar::max_of(ty))
    }

    /// The smallest value of `ty`; for floats, the most negative finite one.
    pub fn min_value(ty: Type) -> Self {
        Expr::Const(ty, Scalar::min_of(ty))
    }

    fn math(fun: MathFn, args: Vec<Expr>) -> Self {
        Expr::Math(fun, args)
    }

    pub fn sqrt(self) -> Self {
        Expr::math(MathFn::Sqrt, vec![self])
    }

    pub fn sin(self) -> Self {
        Expr::math(MathFn::Sin, vec![self])
    }

    pub fn cos(self) -> Self {
        Expr::math(MathFn::Cos, vec![self])
    }

    pub fn exp(self) -> Self {
        Expr::math(MathFn::Exp, vec![self])
    }

    pub fn log(self) -> Self {
        Expr::math(MathFn::Log, vec![self])
    }

    pub fn pow(self, exponent: impl Into<Expr>) -> Self {
        Expr::math(MathFn::Pow, vec![self, exponent.into()])
    }

    pub fn floor(self) -> Self {
        Expr::math(MathFn::Floor, vec![self])
    }

    pub fn ceil(self) -> Self {
        Expr::math(MathFn::Ceil, vec![self])
    }

    pub fn round(self) -> Self {
        Expr::math(MathFn::Round, vec![self])
    }

    pub fn min(self, other: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::Min, self, other)
    }

    pub fn max(self, other: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::Max, self, other)
    }

    pub fn lt(self, other: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::Lt, self, other)
    }

    pub fn le(self, other: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::Le, self, other)
    }

    pub fn gt(self, other: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::Gt, self, other)
    }

    pub fn ge(self, other: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::Ge, self, other)
    }

    pub fn equals(self, other: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::Eq, self, other)
    }

    pub fn not_equals(self, other: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::Ne, self, other)
    }

    pub fn and(self, other: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::And, self, other)
    }

    pub fn or(self, other: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::Or, self, other)
    }

    pub fn as_var(&self) -> Option<&Var> {
        match self {
            Expr::Var(v) => Some(v),
            _ => None,
        }
    }

    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Const(..) | Expr::Var(_) | Expr::RVar(_) | Expr::Param(_) => Vec::new(),
            Expr::Cast(_, e) | Expr::Broadcast(e, _) => vec![e],
            Expr::Binary(_, a, b) => vec![a, b],
            Expr::Select(c, t, e) => vec![c, t, e],
            Expr::Call(_, args) | Expr::Load(_, args) | Expr::Tuple(args) | Expr::Math(_, args) => {
                args.iter().collect()
            }
        }
    }

    /// Pre-order walk. Reduction bounds of an `RVar` are visited the first
    /// time its domain is reached.
    pub fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        for child in self.children() {
            child.visit(f);
        }
    }

    /// Functions called anywhere in the tree, in first-reference order.
    pub fn funcs(&self) -> Vec<Func> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let Expr::Call(f, _) = e {
                if !out.contains(f) {
                    out.push(*f);
                }
            }
        });
        out
    }

    /// The reduction domains referenced by the tree, in first-reference order.
    pub fn rdoms(&self) -> Vec<RDom> {
        let mut out: Vec<RDom> = Vec::new();
        self.visit(&mut |e| {
            if let Expr::RVar(rv) = e {
                if !out.contains(&rv.rdom) {
                    out.push(rv.rdom.clone());
                }
            }
        });
        out
    }

    /// Plain vars referenced by the tree, in first-reference order.
    pub fn free_vars(&self) -> Vec<Var> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let Expr::Var(v) = e {
                if !out.contains(v) {
                    out.push(v.clone());
                }
            }
        });
        out
    }
}

// ─── Conversions ──────────────────────────────────────────────────

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::int(v)
    }
}

impl From<u8> for Expr {
    fn from(v: u8) -> Self {
        Expr::Const(Type::UInt(8), Scalar::UInt(v as u64))
    }
}

impl From<u32> for Expr {
    fn from(v: u32) -> Self {
        Expr::Const(Type::UInt(32), Scalar::UInt(v as u64))
    }
}

impl From<f32> for Expr {
    fn from(v: f32) -> Self {
        Expr::float(v)
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::Const(Type::Float(64), Scalar::Float(v))
    }
}

impl From<Var> for Expr {
    fn from(v: Var) -> Self {
        Expr::Var(v)
    }
}

impl From<&Var> for Expr {
    fn from(v: &Var) -> Self {
        Expr::Var(v.clone())
    }
}

impl From<RVar> for Expr {
    fn from(v: RVar) -> Self {
        Expr::RVar(v)
    }
}

impl From<&RVar> for Expr {
    fn from(v: &RVar) -> Self {
        Expr::RVar(v.clone())
    }
}

impl From<Param> for Expr {
    fn from(p: Param) -> Self {
        Expr::Param(p)
    }
}

impl From<&Param> for Expr {
    fn from(p: &Param) -> Self {
        Expr::Param(p.clone())
    }
}

impl From<&Expr> for Expr {
    fn from(e: &Expr) -> Self {
        e.clone()
    }
}

// ─── Operators ────────────────────────────────────────────────────

macro_rules! arith_ops {
    ($($lhs:ty),*) => {
        $(
            impl<T: Into<Expr>> Add<T> for $lhs {
                type Output = Expr;
                fn add(self, rhs: T) -> Expr {
                    Expr::binary(BinOp::Add, self, rhs)
                }
            }
            impl<T: Into<Expr>> Sub<T> for $lhs {
                type Output = Expr;
                fn sub(self, rhs: T) -> Expr {
                    Expr::binary(BinOp::Sub, self, rhs)
                }
            }
            impl<T: Into<Expr>> Mul<T> for $lhs {
                type Output = Expr;
                fn mul(self, rhs: T) -> Expr {
                    Expr::binary(BinOp::Mul, self, rhs)
                }
            }
            impl<T: Into<Expr>> Div<T> for $lhs {
                type Output = Expr;
                fn div(self, rhs: T) -> Expr {
                    Expr::binary(BinOp::Div, self, rhs)
                }
            }
            impl<T: Into<Expr>> Rem<T> for $lhs {
                type Output = Expr;
                fn rem(self, rhs: T) -> Expr {
                    Expr::binary(BinOp::Mod, self, rhs)
                }
            }
        )*
    };
}

arith_ops!(Expr, &Expr, Var, &Var, RVar, &RVar, Param, &Param);

macro_rules! scalar_lhs_ops {
    ($($lhs:ty),*) => {
        $(
            impl Add<Expr> for $lhs {
                type Output = Expr;
                fn add(self, rhs: Expr) -> Expr {
                    Expr::binary(BinOp::Add, self, rhs)
                }
            }
            impl Sub<Expr> for $lhs {
                type Output = Expr;
                fn sub(self, rhs: Expr) -> Expr {
                    Expr::binary(BinOp::Sub, self, rhs)
                }
            }
            impl Mul<Expr> for $lhs {
                type Output = Expr;
                fn mul(self, rhs: Expr) -> Expr {
                    Expr::binary(BinOp::Mul, self, rhs)
                }
            }
        )*
    };
}

scalar_lhs_ops!(i32, f32);

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::binary(BinOp::Sub, 0, self)
    }
}

impl Neg for &Var {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::binary(BinOp::Sub, 0, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_identity_is_name() {
        assert_eq!(Var::new("x"), Var::new("x"));
        assert_ne!(Var::new("x"), Var::new("y"));
    }

    #[test]
    fn test_implicit_vars() {
        assert!(Var::implicit(0).is_implicit());
        assert!(Var::implicit(12).is_implicit());
        assert!(!Var::new("ivy").is_implicit());
        assert!(!Var::new("iv").is_implicit());
    }

    #[test]
    fn test_rdom_dim_names() {
        let r = RDom::new("r", vec![(0, 10), (0, 4)]);
        assert_eq!(r.dimensions(), 2);
        assert_eq!(r.x().var().name(), "r.x");
        assert_eq!(r.y().var().name(), "r.y");
    }

    #[test]
    fn test_free_vars_first_reference_order() {
        let x = Var::new("x");
        let y = Var::new("y");
        let e = &y + &x * 2 + &y;
        assert_eq!(e.free_vars(), vec![y, x]);
    }

    #[test]
    fn test_rdoms_collected() {
        let r = RDom::new("r", vec![(0, 10)]);
        let e = r.x() * 2 + 1;
        assert_eq!(e.rdoms().len(), 1);
        assert!(Expr::int(3).rdoms().is_empty());
    }

    #[test]
    fn test_param_set_converts() {
        let p = Param::new("gain", Type::f32());
        p.set(3i32);
        assert_eq!(p.value(), Scalar::Float(3.0));
        let q = Param::new("n", Type::UInt(8));
        q.set(260i32);
        assert_eq!(q.value(), Scalar::UInt(4));
    }
}
