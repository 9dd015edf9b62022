//! Lowering a compile request into typed evaluation trees.
//!
//! Vars become slot indices into a binding array, calls and image loads
//! become indices into the program's function and input tables, and every
//! binary node records the type its operands were coerced to.

use std::collections::HashMap;

use tracing::trace;

use crate::codegen::host::nest::Nest;
use crate::codegen::{ArgKind, ArgDescriptor, CompileRequest};
use crate::error::CompileError;
use crate::ir::expr::{BinOp, Expr, MathFn, RDom, Var};
use crate::ir::func::{Definition, Func, UpdateClause};
use crate::ir::types::{Scalar, Type};
use crate::schedule::StoreLevel;

#[derive(Clone, Debug)]
pub(crate) enum Node {
    Const(Scalar),
    /// Index into the binding array.
    Var(usize),
    /// Index into the program's scalar parameters.
    Param(usize),
    Cast(Type, Box<Node>),
    /// Operator, operand type, operands.
    Binary(BinOp, Type, Box<Node>, Box<Node>),
    Select(Box<Node>, Box<Node>, Box<Node>),
    /// Routine, operand and result type, operands.
    Math(MathFn, Type, Vec<Node>),
    /// Index into the program's functions.
    Call(usize, Vec<Node>),
    /// The running value of the point being accumulated.
    Accumulator,
    /// Index into the program's images.
    Load(usize, Vec<Node>),
}

#[derive(Clone, Debug)]
pub(crate) struct ClauseCode {
    /// Coordinates written; only evaluated for sparse reductions.
    pub args: Vec<Node>,
    /// `(min, extent)` per reduction dimension, in declaration order.
    pub rdom: Vec<(Node, Node)>,
    pub body: Node,
}

#[derive(Clone, Debug)]
pub(crate) enum Reduction {
    None,
    /// Every clause writes `f(pure vars)`: each point accumulates on its own.
    Pointwise(Vec<ClauseCode>),
    /// Clauses write computed coordinates: the function is realized once
    /// into a sparse map over the points the clauses touch.
    Sparse(Vec<ClauseCode>),
}

#[derive(Clone, Debug)]
pub(crate) struct FuncCode {
    pub name: String,
    pub ty: Type,
    pub arity: usize,
    pub body: Node,
    pub reduction: Reduction,
    pub store: StoreLevel,
}

#[derive(Clone, Debug)]
pub(crate) struct InputSlot {
    pub name: String,
    pub ty: Type,
    pub dims: usize,
}

/// A compile request in executable form.
#[derive(Clone, Debug)]
pub(crate) struct Program {
    pub name: String,
    pub funcs: Vec<FuncCode>,
    pub target: usize,
    pub args: Vec<ArgDescriptor>,
    pub images: Vec<InputSlot>,
    pub params: Vec<InputSlot>,
    pub nest: Nest,
    /// Functions stored per iteration of the named target loop.
    pub chunk_at: HashMap<Var, Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SelfCalls {
    Forbidden,
    Accumulator,
    Call,
}

struct Lowerer<'r> {
    request: &'r CompileRequest,
    index: HashMap<Func, usize>,
    images: Vec<InputSlot>,
    params: Vec<InputSlot>,
}

fn unsupported(func: &str, what: &str) -> CompileError {
    CompileError::Unsupported(format!("{} in '{}'", what, func))
}

impl<'r> Lowerer<'r> {
    fn backend_error(&self, message: String) -> CompileError {
        CompileError::Backend {
            backend: "host".to_string(),
            message,
        }
    }

    fn expr(
        &self,
        e: &Expr,
        vars: &[Var],
        owner: (usize, &str),
        self_calls: SelfCalls,
    ) -> Result<(Node, Type), CompileError> {
        let lower = |e: &Expr| self.expr(e, vars, owner, self_calls);
        let slot = |v: &Var| {
            vars.iter()
                .position(|known| known == v)
                .map(Node::Var)
                .ok_or_else(|| self.backend_error(format!("free variable '{}' in '{}'", v, owner.1)))
        };
        Ok(match e {
            Expr::Const(ty, v) => (Node::Const(*v), *ty),
            Expr::Var(v) => (slot(v)?, Type::i32()),
            Expr::RVar(rv) => (slot(rv.var())?, Type::i32()),
            Expr::Param(p) => {
                let at = self
                    .params
                    .iter()
                    .position(|slot| slot.name == p.name())
                    .ok_or_else(|| self.backend_error(format!("parameter '{}' is not an argument", p.name())))?;
                (Node::Param(at), p.ty())
            }
            Expr::Cast(ty, inner) => {
                let (inner, _) = lower(inner)?;
                (Node::Cast(*ty, Box::new(inner)), *ty)
            }
            Expr::Binary(op, a, b) => {
                let (a, ta) = lower(a)?;
                let (b, _) = lower(b)?;
                let ty = if op.is_comparison() || matches!(op, BinOp::And | BinOp::Or) {
                    Type::BOOL
                } else {
                    ta
                };
                (Node::Binary(*op, ta, Box::new(a), Box::new(b)), ty)
            }
            Expr::Select(c, t, f) => {
                let (c, _) = lower(c)?;
                let (t, ty) = lower(t)?;
                let (f, _) = lower(f)?;
                (Node::Select(Box::new(c), Box::new(t), Box::new(f)), ty)
            }
            Expr::Math(fun, args) => {
                let mut ty = Type::f32();
                let mut nodes = Vec::with_capacity(args.len());
                for arg in args {
                    let (node, t) = lower(arg)?;
                    ty = t;
                    nodes.push(node);
                }
                (Node::Math(*fun, ty, nodes), ty)
            }
            Expr::Call(g, args) => {
                let at = *self
                    .index
                    .get(g)
                    .ok_or_else(|| self.backend_error(format!("call to unknown function #{}", g.index())))?;
                let ty = self.request.definition(*g)?.ty.unwrap_or(Type::i32());
                if at == owner.0 {
                    match self_calls {
                        SelfCalls::Forbidden => return Err(unsupported(owner.1, "recursive definition")),
                        SelfCalls::Accumulator => return Ok((Node::Accumulator, ty)),
                        SelfCalls::Call => {}
                    }
                }
                let args = args.iter().map(|a| lower(a).map(|(n, _)| n)).collect::<Result<_, _>>()?;
                (Node::Call(at, args), ty)
            }
            Expr::Load(image, args) => {
                let at = self
                    .images
                    .iter()
                    .position(|slot| slot.name == image.name())
                    .ok_or_else(|| self.backend_error(format!("image '{}' is not an argument", image.name())))?;
                let args = args.iter().map(|a| lower(a).map(|(n, _)| n)).collect::<Result<_, _>>()?;
                (Node::Load(at, args), image.ty())
            }
            Expr::Broadcast(inner, _) => lower(inner)?,
            Expr::Tuple(_) => return Err(unsupported(owner.1, "unlowered tuple")),
        })
    }

    fn clause(
        &self,
        def: &Definition,
        clause: &UpdateClause,
        owner: (usize, &str),
        self_calls: SelfCalls,
    ) -> Result<ClauseCode, CompileError> {
        let mut vars = def.args.clone();
        let dims = clause.rdom.as_ref().map(RDom::dims).unwrap_or_default();
        vars.extend(dims.iter().map(|d| d.var.clone()));
        let lower = |e: &Expr| self.expr(e, &vars, owner, self_calls).map(|(n, _)| n);
        Ok(ClauseCode {
            args: clause.args.iter().map(&lower).collect::<Result<_, _>>()?,
            rdom: dims
                .iter()
                .map(|d| Ok((lower(&d.min)?, lower(&d.extent)?)))
                .collect::<Result<_, CompileError>>()?,
            body: lower(&clause.body)?,
        })
    }

    fn reduction(&self, f: Func, def: &Definition, at: usize) -> Result<Reduction, CompileError> {
        if def.updates.is_empty() {
            return Ok(Reduction::None);
        }
        let owner = (at, def.name.as_str());
        let pure_args: Vec<Expr> = def.args.iter().cloned().map(Expr::Var).collect();

        let pointwise = def.updates.iter().all(|clause| {
            let mut self_args_match = true;
            clause.body.visit(&mut |e| {
                if let Expr::Call(g, args) = e {
                    if *g == f && *args != pure_args {
                        self_args_match = false;
                    }
                }
            });
            clause.args == pure_args && self_args_match
        });
        if pointwise {
            let clauses = def
                .updates
                .iter()
                .map(|c| self.clause(def, c, owner, SelfCalls::Accumulator))
                .collect::<Result<_, _>>()?;
            return Ok(Reduction::Pointwise(clauses));
        }

        let sparse = def.updates.iter().all(|clause| {
            let mut exprs: Vec<&Expr> = clause.args.iter().collect();
            exprs.push(&clause.body);
            exprs
                .iter()
                .all(|e| e.free_vars().iter().all(|v| !def.args.contains(v)))
        });
        if sparse {
            let clauses = def
                .updates
                .iter()
                .map(|c| self.clause(def, c, owner, SelfCalls::Call))
                .collect::<Result<_, _>>()?;
            return Ok(Reduction::Sparse(clauses));
        }
        Err(unsupported(
            &def.name,
            "update writing coordinates that mix pure and reduction variables",
        ))
    }
}

/// Lower every definition of `request` and the target's loop nest.
pub(crate) fn lower(request: &CompileRequest) -> Result<Program, CompileError> {
    let funcs: Vec<(Func, &Definition)> = request
        .env
        .iter()
        .filter(|(_, def)| def.owner.is_none())
        .collect();
    let index: HashMap<Func, usize> = funcs.iter().enumerate().map(|(i, (f, _))| (*f, i)).collect();

    let input = |kinds: &[ArgKind]| -> Vec<InputSlot> {
        request
            .args
            .iter()
            .filter(|a| kinds.contains(&a.kind))
            .map(|a| InputSlot {
                name: a.name.clone(),
                ty: a.ty,
                dims: a.dims,
            })
            .collect()
    };
    let lowerer = Lowerer {
        request,
        index,
        images: input(&[ArgKind::ImageParam, ArgKind::Image]),
        params: input(&[ArgKind::Param]),
    };

    let mut code = Vec::with_capacity(funcs.len());
    let mut chunk_at: HashMap<Var, Vec<usize>> = HashMap::new();
    for (at, (f, def)) in funcs.iter().enumerate() {
        let (Some(body), Some(ty)) = (&def.body, def.ty) else {
            return Err(lowerer.backend_error(format!("'{}' has no definition", def.name)));
        };
        let (body, _) = lowerer.expr(body, &def.args, (at, def.name.as_str()), SelfCalls::Forbidden)?;
        let store = request
            .schedule
            .get(&def.name)
            .map(|s| s.store.clone())
            .unwrap_or(StoreLevel::Inline);
        if let StoreLevel::Chunk(v) = &store {
            chunk_at.entry(v.clone()).or_default().push(at);
        }
        trace!(func = %def.name, ?store, "lowered");
        code.push(FuncCode {
            name: def.name.clone(),
            ty,
            arity: def.arity(),
            body,
            reduction: lowerer.reduction(*f, def, at)?,
            store,
        });
    }

    let target = *lowerer
        .index
        .get(&request.target)
        .ok_or_else(|| lowerer.backend_error(format!("target '{}' is missing", request.name)))?;
    let target_def = request.definition(request.target)?;
    let sched = request
        .schedule
        .get(&target_def.name)
        .ok_or_else(|| lowerer.backend_error(format!("no schedule for '{}'", target_def.name)))?;
    let nest = Nest::build(&target_def.args, sched)?;

    Ok(Program {
        name: request.name.clone(),
        funcs: code,
        target,
        args: request.args.clone(),
        images: lowerer.images,
        params: lowerer.params,
        nest,
        chunk_at,
    })
}
