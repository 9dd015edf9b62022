//! prism: an embedded compiler for scheduled image-processing pipelines.
//!
//! Functions are defined over integer coordinates in a [`Pipeline`], given
//! scheduling directives through [`Pipeline::schedule`], and compiled and
//! run with [`Pipeline::realize`] against a [`Runtime`].
//!
//! ```no_run
//! use prism::{Pipeline, Runtime, Var};
//!
//! let mut p = Pipeline::new();
//! let (x, xi) = (Var::new("x"), Var::new("xi"));
//! let f = p.func("f");
//! p.define(f, [&x], &x * 2).unwrap();
//! p.schedule(f).split(&x, &x, &xi, 8).vectorize(&xi);
//! let out = p.realize(Runtime::global(), f, &[64]).unwrap();
//! assert_eq!(out.get::<i32>(&[3]).unwrap(), 6);
//! ```

pub mod api;
pub mod codegen;
pub mod config;
pub mod diagnostic;
pub mod error;
pub mod ir;
pub mod runtime;
pub mod schedule;
pub mod tune;

pub use api::Compiled;
pub use config::{AotConfig, ExecutionMode, OffloadTarget, RuntimeConfig};
pub use diagnostic::Diagnostic;
pub use error::{CompileError, DefinitionError, Error, RealizeError, Result, ScheduleError};
pub use ir::{Element, Expr, Func, Image, ImageParam, Param, Pipeline, RDom, RVar, Scalar, Type, Var};
pub use runtime::buffer::Buffer;
pub use runtime::queue::WorkQueue;
pub use runtime::Runtime;
pub use schedule::archive::ScheduleArchive;
pub use tune::{autotune, TuneArgs};
