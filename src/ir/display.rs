//! Human-readable pipeline text.

use std::fmt;

use crate::diagnostic::{Listing, Site};
use crate::ir::expr::{BinOp, Expr};
use crate::ir::func::{Func, Pipeline};
use crate::ir::types::{Scalar, Type};

/// An expression paired with the arena its calls resolve in.
pub struct ExprDisplay<'a> {
    pipeline: &'a Pipeline,
    expr: &'a Expr,
}

impl<'a> fmt::Display for ExprDisplay<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |e: &'a Expr| ExprDisplay::new(self.pipeline, e);
        match self.expr {
            Expr::Const(ty, v) => fmt_const(f, *ty, *v),
            Expr::Var(v) => write!(f, "{}", v),
            Expr::RVar(rv) => write!(f, "{}", rv.var()),
            Expr::Param(p) => f.write_str(p.name()),
            Expr::Cast(ty, e) => write!(f, "cast<{}>({})", ty, show(e)),
            Expr::Binary(op @ (BinOp::Min | BinOp::Max), a, b) => {
                write!(f, "{}({}, {})", op.symbol(), show(a), show(b))
            }
            Expr::Binary(op, a, b) => write!(f, "({} {} {})", show(a), op.symbol(), show(b)),
            Expr::Select(c, t, e) => write!(f, "select({}, {}, {})", show(c), show(t), show(e)),
            Expr::Math(fun, args) => {
                f.write_str(fun.name())?;
                fmt_args(f, self.pipeline, args)
            }
            Expr::Call(g, args) => {
                f.write_str(self.pipeline.name(*g))?;
                fmt_args(f, self.pipeline, args)
            }
            Expr::Load(image, args) => {
                f.write_str(image.name())?;
                fmt_args(f, self.pipeline, args)
            }
            Expr::Tuple(elems) => fmt_args(f, self.pipeline, elems),
            Expr::Broadcast(e, n) => write!(f, "broadcast({}, {})", show(e), n),
        }
    }
}

impl<'a> ExprDisplay<'a> {
    fn new(pipeline: &'a Pipeline, expr: &'a Expr) -> Self {
        ExprDisplay { pipeline, expr }
    }
}

fn fmt_const(f: &mut fmt::Formatter<'_>, ty: Type, v: Scalar) -> fmt::Result {
    match ty {
        Type::Int(32) | Type::Float(32) => write!(f, "{}", v),
        Type::UInt(1) => write!(f, "{}", v.is_true()),
        other => write!(f, "({}){}", other, v),
    }
}

fn fmt_args(f: &mut fmt::Formatter<'_>, pipeline: &Pipeline, args: &[Expr]) -> fmt::Result {
    f.write_str("(")?;
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", ExprDisplay::new(pipeline, arg))?;
    }
    f.write_str(")")
}

impl Pipeline {
    pub fn display<'a>(&'a self, e: &'a Expr) -> ExprDisplay<'a> {
        ExprDisplay::new(self, e)
    }

    /// The whole pipeline as text, one definition, update clause or
    /// directive per line.
    pub fn listing(&self) -> Listing {
        self.listing_of(self.funcs())
    }

    /// Listing restricted to `funcs`, in the order given.
    pub fn listing_of(&self, funcs: impl IntoIterator<Item = Func>) -> Listing {
        let mut listing = Listing::default();
        for f in funcs {
            let def = self.definition(f);
            if def.owner.is_some() {
                continue;
            }
            let header = match (&def.body, def.ty) {
                (Some(body), Some(ty)) => {
                    let args: Vec<&str> = def.args.iter().map(|v| v.name()).collect();
                    format!("{}({}): {} = {}", def.name, args.join(", "), ty, self.display(body))
                }
                _ if def.directives.is_empty() => continue,
                _ => format!("{}: undefined", def.name),
            };
            listing.push_line(Some(Site::func(&def.name)), &header);

            for (i, clause) in def.updates.iter().enumerate() {
                let mut line = format!("  update [{}] {}", i, def.name);
                line.push_str(&self.display(&Expr::Tuple(clause.args.clone())).to_string());
                line.push_str(&format!(" = {}", self.display(&clause.body)));
                if let Some(rdom) = &clause.rdom {
                    for dim in rdom.dims() {
                        line.push_str(&format!(
                            " for {} in [{}, +{})",
                            dim.var,
                            self.display(&dim.min),
                            self.display(&dim.extent)
                        ));
                    }
                }
                listing.push_line(Some(Site::clause(&def.name, i)), &line);
            }

            self.list_directives(&mut listing, f, "");
            if let Some(handle) = def.update_handle {
                self.list_directives(&mut listing, handle, self.name(handle));
            }
        }
        listing
    }

    fn list_directives(&self, listing: &mut Listing, f: Func, label: &str) {
        let def = self.definition(f);
        for (i, d) in def.directives.iter().enumerate() {
            let line = if label.is_empty() {
                format!("  [{}] {}", i, d)
            } else {
                format!("  {} [{}] {}", label, i, d)
            };
            listing.push_line(Some(Site::directive(&def.name, i)), &line);
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.listing().text)
    }
}
