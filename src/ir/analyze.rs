//! Arena-aware expression analysis: types, implicit-argument counts, tuple
//! shapes, define-time normalization, and the function call graph.

use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;

use crate::error::DefinitionError;
use crate::ir::expr::{BinOp, Expr, Image, ImageParam, ImageRef, Param, Var};
use crate::ir::func::{Func, Pipeline};
use crate::ir::types::{Scalar, Type};

/// What normalization learned about an expression.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Info {
    pub ty: Type,
    /// Number of trailing implicit dimensions the expression ranges over.
    pub implicit: usize,
    /// Tuple length, if the expression is tuple-valued.
    pub tuple: Option<usize>,
}

impl Info {
    fn scalar(ty: Type) -> Self {
        Info {
            ty,
            implicit: 0,
            tuple: None,
        }
    }
}

/// The definition an expression is being normalized for.
#[derive(Clone, Copy, Debug)]
pub struct Scope {
    pub func: Func,
    /// Update clauses may call the function they update.
    pub allow_self: bool,
}

impl Scope {
    pub fn pure(func: Func) -> Self {
        Scope {
            func,
            allow_self: false,
        }
    }

    pub fn update(func: Func) -> Self {
        Scope {
            func,
            allow_self: true,
        }
    }

    /// Cast `e` (currently of type `from`) to `ty`, folding constants.
    pub fn cast_to(ty: Type, e: Expr, from: Type) -> Expr {
        if ty == from {
            return e;
        }
        match e {
            Expr::Const(_, v) => Expr::Const(ty, v.cast(ty)),
            other => Expr::Cast(ty, Box::new(other)),
        }
    }
}

/// Inputs a function reads, each group in first-reference order.
#[derive(Clone, Debug, Default)]
pub struct Inputs {
    pub image_params: Vec<ImageParam>,
    pub images: Vec<Image>,
    pub params: Vec<Param>,
    /// Names shared by distinct inputs, in the order they were found.
    pub conflicts: Vec<String>,
}

impl Inputs {
    fn conflict(&mut self, name: &str) {
        if !self.conflicts.iter().any(|c| c == name) {
            self.conflicts.push(name.to_string());
        }
    }
}

impl Pipeline {
    fn merge_implicit(&self, scope: &Scope, a: usize, b: usize) -> Result<usize, DefinitionError> {
        match (a, b) {
            (0, n) | (n, 0) => Ok(n),
            (a, b) if a == b => Ok(a),
            (left, right) => Err(DefinitionError::ImplicitMismatch {
                func: self.name(scope.func).to_string(),
                left,
                right,
            }),
        }
    }

    fn merge_tuple(
        &self,
        scope: &Scope,
        a: Option<usize>,
        b: Option<usize>,
    ) -> Result<Option<usize>, DefinitionError> {
        match (a, b) {
            (Some(left), Some(right)) if left != right => Err(DefinitionError::TupleShapeMismatch {
                func: self.name(scope.func).to_string(),
                left,
                right,
            }),
            (Some(n), _) | (_, Some(n)) => Ok(Some(n)),
            (None, None) => Ok(None),
        }
    }

    /// Normalize arguments of a call or image load: cast to `i32`, then
    /// fill the trailing positions with implicit vars.
    fn normalize_args(
        &self,
        scope: &Scope,
        callee: &str,
        args: &[Expr],
        arity: usize,
    ) -> Result<(Vec<Expr>, usize), DefinitionError> {
        if args.len() > arity {
            return Err(DefinitionError::ArityMismatch {
                func: callee.to_string(),
                expected: arity,
                found: args.len(),
            });
        }
        let mut out = Vec::with_capacity(arity);
        let mut implicit = 0;
        for arg in args {
            let (arg, info) = self.normalize(scope, arg)?;
            implicit = self.merge_implicit(scope, implicit, info.implicit)?;
            out.push(Scope::cast_to(Type::i32(), arg, info.ty));
        }
        let missing = arity - args.len();
        out.extend((0..missing).map(|i| Expr::Var(Var::implicit(i))));
        let implicit = self.merge_implicit(scope, implicit, missing)?;
        Ok((out, implicit))
    }

    /// Normalize an expression for storage in a definition and report its
    /// type, implicit-argument count and tuple shape.
    ///
    /// Tuples are lowered to a `select` chain over their implicit var, so
    /// later stages only ever see scalar expressions.
    pub fn normalize(&self, scope: &Scope, e: &Expr) -> Result<(Expr, Info), DefinitionError> {
        match e {
            Expr::Const(ty, v) => Ok((Expr::Const(*ty, v.cast(*ty)), Info::scalar(*ty))),
            Expr::Var(_) | Expr::RVar(_) => Ok((e.clone(), Info::scalar(Type::i32()))),
            Expr::Param(p) => Ok((e.clone(), Info::scalar(p.ty()))),
            Expr::Cast(ty, inner) => {
                let (inner, info) = self.normalize(scope, inner)?;
                Ok((Scope::cast_to(*ty, inner, info.ty), Info { ty: *ty, ..info }))
            }
            Expr::Binary(op, a, b) => {
                let (a, ia) = self.normalize(scope, a)?;
                let (b, ib) = self.normalize(scope, b)?;
                let implicit = self.merge_implicit(scope, ia.implicit, ib.implicit)?;
                let tuple = self.merge_tuple(scope, ia.tuple, ib.tuple)?;
                let operand = match op {
                    BinOp::And | BinOp::Or => Type::BOOL,
                    _ => ia.ty.unify(ib.ty),
                };
                let ty = if op.is_comparison() { Type::BOOL } else { operand };
                let e = Expr::Binary(
                    *op,
                    Box::new(Scope::cast_to(operand, a, ia.ty)),
                    Box::new(Scope::cast_to(operand, b, ib.ty)),
                );
                Ok((e, Info { ty, implicit, tuple }))
            }
            Expr::Select(c, t, f) => {
                let (c, ic) = self.normalize(scope, c)?;
                let (t, it) = self.normalize(scope, t)?;
                let (f, iff) = self.normalize(scope, f)?;
                let implicit = self.merge_implicit(scope, ic.implicit, it.implicit)?;
                let implicit = self.merge_implicit(scope, implicit, iff.implicit)?;
                let tuple = self.merge_tuple(scope, ic.tuple, it.tuple)?;
                let tuple = self.merge_tuple(scope, tuple, iff.tuple)?;
                let ty = it.ty.unify(iff.ty);
                let e = Expr::select(
                    Scope::cast_to(Type::BOOL, c, ic.ty),
                    Scope::cast_to(ty, t, it.ty),
                    Scope::cast_to(ty, f, iff.ty),
                );
                Ok((e, Info { ty, implicit, tuple }))
            }
            Expr::Math(fun, args) => {
                if args.len() != fun.arity() {
                    return Err(DefinitionError::ArityMismatch {
                        func: fun.name().to_string(),
                        expected: fun.arity(),
                        found: args.len(),
                    });
                }
                let mut normalized = Vec::with_capacity(args.len());
                let (mut implicit, mut tuple) = (0, None);
                let mut ty = Type::f32();
                for arg in args {
                    let (arg, info) = self.normalize(scope, arg)?;
                    implicit = self.merge_implicit(scope, implicit, info.implicit)?;
                    tuple = self.merge_tuple(scope, tuple, info.tuple)?;
                    if info.ty == Type::Float(64) {
                        ty = info.ty;
                    }
                    normalized.push((arg, info.ty));
                }
                let args = normalized
                    .into_iter()
                    .map(|(e, from)| Scope::cast_to(ty, e, from))
                    .collect();
                Ok((Expr::Math(*fun, args), Info { ty, implicit, tuple }))
            }
            Expr::Call(g, args) => {
                let def = self.definition(*g);
                if *g == scope.func && !scope.allow_self {
                    return Err(DefinitionError::SelfReference {
                        func: def.name.clone(),
                    });
                }
                let ty = match def.ty {
                    Some(ty) if def.is_defined() => ty,
                    _ => {
                        return Err(DefinitionError::CallToUndefined {
                            func: self.name(scope.func).to_string(),
                            callee: def.name.clone(),
                        })
                    }
                };
                let (args_n, implicit) = self.normalize_args(scope, &def.name, args, def.arity())?;
                // A call that leaves the tuple dimension open is tuple-valued.
                let tuple = match def.shape.first() {
                    Some(&n) if args.len() < def.arity() => Some(n),
                    _ => None,
                };
                Ok((
                    Expr::Call(*g, args_n),
                    Info { ty, implicit, tuple },
                ))
            }
            Expr::Load(image, args) => {
                let (args_n, implicit) =
                    self.normalize_args(scope, image.name(), args, image.dimensions())?;
                Ok((
                    Expr::Load(image.clone(), args_n),
                    Info {
                        ty: image.ty(),
                        implicit,
                        tuple: None,
                    },
                ))
            }
            Expr::Tuple(elems) => {
                let len = elems.len();
                let mut normalized = Vec::with_capacity(len);
                let mut implicit = 0;
                let mut ty: Option<Type> = None;
                for elem in elems {
                    let (elem, info) = self.normalize(scope, elem)?;
                    if info.tuple.is_some() {
                        return Err(DefinitionError::NestedTuple {
                            func: self.name(scope.func).to_string(),
                        });
                    }
                    implicit = self.merge_implicit(scope, implicit, info.implicit)?;
                    ty = Some(ty.map_or(info.ty, |t| t.unify(info.ty)));
                    normalized.push((elem, info.ty));
                }
                let ty = ty.unwrap_or(Type::i32());
                let index = Expr::Var(Var::implicit(implicit));
                let mut elems = normalized
                    .into_iter()
                    .map(|(e, from)| Scope::cast_to(ty, e, from))
                    .enumerate()
                    .rev();
                let lowered = match elems.next() {
                    Some((_, last)) => elems.fold(last, |rest, (i, e)| {
                        Expr::select(index.clone().equals(i as i32), e, rest)
                    }),
                    None => Expr::Const(ty, Scalar::zero(ty)),
                };
                Ok((
                    lowered,
                    Info {
                        ty,
                        implicit: implicit + 1,
                        tuple: Some(len),
                    },
                ))
            }
            Expr::Broadcast(inner, n) => {
                let (inner, info) = self.normalize(scope, inner)?;
                Ok((
                    Expr::Broadcast(Box::new(inner), *n),
                    Info {
                        implicit: info.implicit + n,
                        ..info
                    },
                ))
            }
        }
    }

    /// Functions `f`'s definitions call, in first-reference order, `f`
    /// itself excluded.
    pub fn callees(&self, f: Func) -> Vec<Func> {
        let def = self.definition(f);
        let mut out = Vec::new();
        let mut note = |e: &Expr| {
            for g in e.funcs() {
                if g != f && !out.contains(&g) {
                    out.push(g);
                }
            }
        };
        if let Some(body) = &def.body {
            note(body);
        }
        for clause in &def.updates {
            clause.args.iter().for_each(&mut note);
            if let Some(rdom) = &clause.rdom {
                for dim in rdom.dims() {
                    note(&dim.min);
                    note(&dim.extent);
                }
            }
            note(&clause.body);
        }
        out
    }

    /// The call graph restricted to functions reachable from `target`.
    pub fn call_graph(&self, target: Func) -> DiGraphMap<Func, ()> {
        let mut graph = DiGraphMap::new();
        graph.add_node(target);
        let mut pending = vec![target];
        while let Some(f) = pending.pop() {
            for g in self.callees(f) {
                if !graph.contains_node(g) {
                    pending.push(g);
                }
                graph.add_edge(f, g, ());
            }
        }
        graph
    }

    /// Every function reachable from `target` (excluded), each once, in
    /// depth-first order.
    pub fn reachable(&self, target: Func) -> Vec<Func> {
        let graph = self.call_graph(target);
        let mut dfs = Dfs::new(&graph, target);
        let mut out = Vec::new();
        while let Some(f) = dfs.next(&graph) {
            if f != target {
                out.push(f);
            }
        }
        out
    }

    /// Image parameters, captured images and scalar parameters `target`
    /// reads, in first-reference order of a depth-first walk over its
    /// definitions that descends into callees on first reference.
    pub fn inputs(&self, target: Func) -> Inputs {
        let mut inputs = Inputs::default();
        let mut visited = vec![target];
        self.collect_inputs(target, &mut inputs, &mut visited);
        inputs
    }

    fn collect_inputs(&self, f: Func, inputs: &mut Inputs, visited: &mut Vec<Func>) {
        let def = self.definition(f);
        let mut exprs: Vec<&Expr> = Vec::new();
        if let Some(body) = &def.body {
            exprs.push(body);
        }
        for clause in &def.updates {
            exprs.extend(clause.args.iter());
            if let Some(rdom) = &clause.rdom {
                for dim in rdom.dims() {
                    exprs.push(&dim.min);
                    exprs.push(&dim.extent);
                }
            }
            exprs.push(&clause.body);
        }
        for e in exprs {
            self.collect_expr_inputs(e, inputs, visited);
        }
    }

    fn collect_expr_inputs(&self, e: &Expr, inputs: &mut Inputs, visited: &mut Vec<Func>) {
        match e {
            Expr::Param(p) => match inputs.params.iter().find(|q| *q == p) {
                Some(q) if !q.same_as(p) => inputs.conflict(p.name()),
                Some(_) => {}
                None => inputs.params.push(p.clone()),
            },
            Expr::Load(ImageRef::Param(p), _) => match inputs.image_params.iter().find(|q| *q == p) {
                Some(q) if !q.same_as(p) => inputs.conflict(p.name()),
                Some(_) => {}
                None => inputs.image_params.push(p.clone()),
            },
            Expr::Load(ImageRef::Captured(i), _) => match inputs.images.iter().find(|j| *j == i) {
                Some(j) if !j.same_as(i) => inputs.conflict(i.name()),
                Some(_) => {}
                None => inputs.images.push(i.clone()),
            },
            Expr::RVar(rv) => {
                for dim in rv.rdom.dims() {
                    self.collect_expr_inputs(&dim.min, inputs, visited);
                    self.collect_expr_inputs(&dim.extent, inputs, visited);
                }
            }
            _ => {}
        }
        for child in e.children() {
            self.collect_expr_inputs(child, inputs, visited);
        }
        if let Expr::Call(g, _) = e {
            if !visited.contains(g) {
                visited.push(*g);
                self.collect_inputs(*g, inputs, visited);
            }
        }
    }
}
