//! The definition arena and the function-definition algebra.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::api::Compiled;
use crate::error::DefinitionError;
use crate::ir::analyze::Scope;
use crate::ir::expr::{BinOp, Expr, RDom, Var};
use crate::ir::types::{Scalar, Type};
use crate::schedule::Directive;

/// Handle to a function in a [`Pipeline`]. Copies alias the same
/// definition; equality is identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Func(pub(crate) u32);

impl Func {
    /// Reference this function at the given coordinates.
    pub fn at<I, E>(self, args: I) -> Expr
    where
        I: IntoIterator<Item = E>,
        E: Into<Expr>,
    {
        Expr::Call(self, args.into_iter().map(Into::into).collect())
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One accumulating clause: `f(args) = body`, iterated over `rvars`.
#[derive(Clone, Debug)]
pub struct UpdateClause {
    pub args: Vec<Expr>,
    /// Reduction dimensions, last declared first.
    pub rvars: Vec<Var>,
    pub rdom: Option<RDom>,
    pub body: Expr,
}

#[derive(Clone, Debug)]
pub struct Definition {
    pub name: String,
    pub ty: Option<Type>,
    /// Pure arguments, implicit vars included.
    pub args: Vec<Var>,
    pub body: Option<Expr>,
    /// Tuple shape; empty for scalar-valued functions.
    pub shape: Vec<usize>,
    pub updates: Vec<UpdateClause>,
    pub update_handle: Option<Func>,
    /// Set on update handles: the function whose clauses they schedule.
    pub owner: Option<Func>,
    pub directives: Vec<Directive>,
}

impl Definition {
    fn new(name: String) -> Self {
        Definition {
            name,
            ty: None,
            args: Vec::new(),
            body: None,
            shape: Vec::new(),
            updates: Vec::new(),
            update_handle: None,
            owner: None,
            directives: Vec::new(),
        }
    }

    pub fn is_defined(&self) -> bool {
        self.body.is_some()
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }

    pub fn implicit_count(&self) -> usize {
        self.args.iter().filter(|v| v.is_implicit()).count()
    }
}

/// Unique-name source for anonymous functions, update handles, reduction
/// domains and the fresh vars schedule expansion introduces.
#[derive(Clone, Debug, Default)]
pub struct NameGen {
    funcs: usize,
    updates: usize,
    rdoms: usize,
    vars: usize,
}

impl NameGen {
    fn next(counter: &mut usize) -> usize {
        let n = *counter;
        *counter += 1;
        n
    }
}

/// The arena every function of a pipeline lives in.
#[derive(Default)]
pub struct Pipeline {
    defs: Vec<Definition>,
    by_name: HashMap<String, Func>,
    names: NameGen,
    pub(crate) compiled: HashMap<Func, Compiled>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the function called `name`, creating it on first reference.
    pub fn func(&mut self, name: &str) -> Func {
        if let Some(&f) = self.by_name.get(name) {
            return f;
        }
        let f = Func(self.defs.len() as u32);
        self.defs.push(Definition::new(name.to_string()));
        self.by_name.insert(name.to_string(), f);
        trace!(func = name, "created function");
        f
    }

    /// Create a function with a fresh unique name.
    pub fn anon(&mut self) -> Func {
        loop {
            let name = format!("f{}", NameGen::next(&mut self.names.funcs));
            if !self.by_name.contains_key(&name) {
                return self.func(&name);
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Func> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, f: Func) -> &str {
        &self.defs[f.index()].name
    }

    pub fn definition(&self, f: Func) -> &Definition {
        &self.defs[f.index()]
    }

    pub(crate) fn definition_mut(&mut self, f: Func) -> &mut Definition {
        &mut self.defs[f.index()]
    }

    pub fn funcs(&self) -> impl Iterator<Item = Func> + '_ {
        (0..self.defs.len() as u32).map(Func)
    }

    /// A reduction domain with a fresh name.
    pub fn rdom<M: Into<Expr>, E: Into<Expr>>(&mut self, bounds: Vec<(M, E)>) -> RDom {
        let name = format!("r{}", NameGen::next(&mut self.names.rdoms));
        RDom::new(&name, bounds)
    }

    pub(crate) fn fresh_var(&mut self, base: &str) -> Var {
        Var::new(&format!("{}_{}", base, NameGen::next(&mut self.names.vars)))
    }

    /// Drop every compiled entrypoint. Called on any definition or
    /// schedule change.
    pub(crate) fn invalidate(&mut self) {
        if !self.compiled.is_empty() {
            debug!(count = self.compiled.len(), "invalidating compiled functions");
            self.compiled.clear();
        }
    }

    /// `f(args) = body`.
    ///
    /// If every argument is a distinct plain var and the body uses no
    /// reduction domain, this is the pure definition of `f` (replacing any
    /// earlier one). Otherwise it appends an update clause to `f`.
    pub fn define<I, A>(&mut self, f: Func, args: I, body: impl Into<Expr>) -> Result<(), DefinitionError>
    where
        I: IntoIterator<Item = A>,
        A: Into<Expr>,
    {
        let args: Vec<Expr> = args.into_iter().map(Into::into).collect();
        let body = body.into();
        let rdom = self.single_rdom(f, &args, &body)?;
        let vars: Option<Vec<Var>> = args.iter().map(|a| a.as_var().cloned()).collect();
        match vars {
            Some(vars) if rdom.as_ref().map_or(true, |r| r.dimensions() == 0) => {
                self.define_gather(f, vars, body)
            }
            _ => self.define_scatter(f, args, body, rdom),
        }
    }

    /// The handle that schedules `f`'s update clauses.
    pub fn update(&self, f: Func) -> Result<Func, DefinitionError> {
        self.definition(f)
            .update_handle
            .ok_or_else(|| DefinitionError::NoUpdate {
                func: self.name(f).to_string(),
            })
    }

    /// `f(args) += e`.
    pub fn add_assign<I, A>(&mut self, f: Func, args: I, e: impl Into<Expr>) -> Result<(), DefinitionError>
    where
        I: IntoIterator<Item = A>,
        A: Into<Expr>,
    {
        self.accumulate(f, args.into_iter().map(Into::into).collect(), e.into(), BinOp::Add)
    }

    /// `f(args) *= e`.
    pub fn mul_assign<I, A>(&mut self, f: Func, args: I, e: impl Into<Expr>) -> Result<(), DefinitionError>
    where
        I: IntoIterator<Item = A>,
        A: Into<Expr>,
    {
        self.accumulate(f, args.into_iter().map(Into::into).collect(), e.into(), BinOp::Mul)
    }

    fn accumulate(&mut self, f: Func, args: Vec<Expr>, e: Expr, op: BinOp) -> Result<(), DefinitionError> {
        if !self.definition(f).is_defined() {
            let (_, info) = self.normalize(&Scope::pure(f), &e)?;
            let identity = if op == BinOp::Mul {
                Scalar::one(info.ty)
            } else {
                Scalar::zero(info.ty)
            };
            let init = match info.implicit {
                0 => Expr::Const(info.ty, identity),
                n => Expr::broadcast(Expr::Const(info.ty, identity), n),
            };
            let mut vars: Vec<Var> = Vec::with_capacity(args.len());
            for arg in &args {
                match arg.as_var() {
                    Some(v) if !vars.contains(v) => vars.push(v.clone()),
                    _ => {
                        let v = self.fresh_var("");
                        vars.push(v);
                    }
                }
            }
            self.define_gather(f, vars, init)?;
            self.definition_mut(f).shape = info.tuple.into_iter().collect();
        }
        let body = Expr::Binary(op, Box::new(Expr::Call(f, args.clone())), Box::new(e));
        let rdom = self.single_rdom(f, &args, &body)?;
        self.define_scatter(f, args, body, rdom)
    }

    fn define_gather(&mut self, f: Func, vars: Vec<Var>, body: Expr) -> Result<(), DefinitionError> {
        let name = self.name(f).to_string();
        if !self.definition(f).updates.is_empty() {
            return Err(DefinitionError::RedefinedAfterUpdate { func: name });
        }
        for (i, v) in vars.iter().enumerate() {
            if vars[..i].contains(v) {
                return Err(DefinitionError::DuplicateVar {
                    func: name,
                    var: v.name().to_string(),
                });
            }
        }
        let (body, info) = self.normalize(&Scope::pure(f), &body)?;
        if !info.ty.is_storable() {
            return Err(DefinitionError::UnstorableType { func: name, ty: info.ty });
        }

        let mut args = vars;
        args.extend((0..info.implicit).map(Var::implicit));
        debug!(func = %name, args = args.len(), ty = %info.ty, "pure definition");

        let def = self.definition_mut(f);
        def.ty = Some(info.ty);
        def.args = args;
        def.body = Some(body);
        def.shape = info.tuple.into_iter().collect();
        self.invalidate();
        Ok(())
    }

    fn define_scatter(
        &mut self,
        f: Func,
        args: Vec<Expr>,
        body: Expr,
        rdom: Option<RDom>,
    ) -> Result<(), DefinitionError> {
        let name = self.name(f).to_string();
        let (arity, ty) = match (self.definition(f).is_defined(), self.definition(f).ty) {
            (true, Some(ty)) => (self.definition(f).arity(), ty),
            _ => return Err(DefinitionError::ScatterWithoutGather { func: name }),
        };

        let scope = Scope::update(f);
        let (body, info) = self.normalize(&scope, &body)?;
        let mut update_args = Vec::with_capacity(arity);
        for arg in &args {
            let (arg, arg_info) = self.normalize(&scope, arg)?;
            update_args.push(Scope::cast_to(Type::i32(), arg, arg_info.ty));
        }
        update_args.extend((0..info.implicit).map(|i| Expr::Var(Var::implicit(i))));
        if update_args.len() != arity {
            return Err(DefinitionError::ArityMismatch {
                func: name,
                expected: arity,
                found: update_args.len(),
            });
        }

        let rvars = rdom
            .as_ref()
            .map(|r| r.dims().iter().rev().map(|d| d.var.clone()).collect())
            .unwrap_or_default();
        let clause = UpdateClause {
            args: update_args,
            rvars,
            rdom,
            body: Scope::cast_to(ty, body, info.ty),
        };

        if self.definition(f).update_handle.is_none() {
            let handle = loop {
                let candidate = format!("p{}", NameGen::next(&mut self.names.updates));
                if !self.by_name.contains_key(&candidate) {
                    break self.func(&candidate);
                }
            };
            self.definition_mut(handle).owner = Some(f);
            self.definition_mut(f).update_handle = Some(handle);
        }
        let def = self.definition_mut(f);
        def.updates.push(clause);
        debug!(func = %name, clause = def.updates.len() - 1, "update definition");
        self.invalidate();
        Ok(())
    }

    /// The one reduction domain a definition may use.
    fn single_rdom(&self, f: Func, args: &[Expr], body: &Expr) -> Result<Option<RDom>, DefinitionError> {
        let mut found: Option<RDom> = None;
        for e in args.iter().chain(std::iter::once(body)) {
            for r in e.rdoms() {
                match &found {
                    Some(first) if *first != r => {
                        return Err(DefinitionError::MultipleRDoms {
                            func: self.name(f).to_string(),
                            first: first.name().to_string(),
                            second: r.name().to_string(),
                        });
                    }
                    Some(_) => {}
                    None => found = Some(r),
                }
            }
        }
        Ok(found)
    }
}
