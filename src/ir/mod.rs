//! The definition model: functions over integer coordinate domains.
//!
//! A [`Pipeline`] owns every function. [`Func`] is a copyable id into it.
//! A function has exactly one pure ("gather") definition, where each output
//! point is computed independently from its coordinates, and optionally a
//! chain of update ("scatter") clauses that write to computed coordinates,
//! usually while iterating a reduction domain.
//!
//! ```text
//! p.define(blur, [&x], (input.at([&x - 1]) + input.at([&x + 1])) / 2)   gather
//! p.add_assign(hist, [input.at([r.x()])], 1)                            scatter
//! ```
//!
//! Expressions may range over more dimensions than the caller names. Those
//! trailing *implicit* dimensions become extra arguments `iv0, iv1, ...` of
//! the function being defined. Tuples contribute one implicit dimension of
//! their own.

pub mod analyze;
pub mod display;
pub mod expr;
pub mod func;
pub mod types;

pub use expr::{BinOp, Expr, Image, MathFn, ImageParam, ImageRef, Param, RDim, RDom, RVar, Var};
pub use func::{Definition, Func, Pipeline, UpdateClause};
pub use types::{Element, Scalar, Type};

#[cfg(test)]
mod tests;
