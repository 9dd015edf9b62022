//! Error taxonomy.
//!
//! Each phase has its own error enum:
//!
//! - [`DefinitionError`]: building functions (`define`, `add_assign`, ...)
//! - [`ScheduleError`]: replaying directives at compile time
//! - [`CompileError`]: talking to the backend, linking, loading
//! - [`RealizeError`]: marshalling arguments and buffers for a run
//!
//! All four, plus schedule archive errors, fold into [`Error`], which can be
//! turned into a [`Diagnostic`] that points at the offending function, update
//! clause, or directive in the pipeline listing.
//!
//! Queue overflow from `par_for` and an expired tuning watchdog are not
//! errors in this sense: they terminate the process.

use thiserror::Error;

use crate::diagnostic::{Diagnostic, Site};
use crate::ir::types::Type;
use crate::runtime::buffer::BufferError;
use crate::schedule::archive::ArchiveError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while defining functions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DefinitionError {
    #[error("conflicting implicit argument counts in '{func}': {left} vs {right}")]
    ImplicitMismatch {
        func: String,
        left: usize,
        right: usize,
    },

    #[error("'{func}' has no update definition")]
    NoUpdate { func: String },

    #[error("'{func}' is referenced with {found} arguments but takes {expected}")]
    ArityMismatch {
        func: String,
        expected: usize,
        found: usize,
    },

    #[error("update of '{func}' requires a pure definition first")]
    ScatterWithoutGather { func: String },

    #[error("variable '{var}' appears more than once in the arguments of '{func}'")]
    DuplicateVar { func: String, var: String },

    #[error("definition of '{func}' uses two reduction domains: '{first}' and '{second}'")]
    MultipleRDoms {
        func: String,
        first: String,
        second: String,
    },

    #[error("'{func}' calls '{callee}', which has no definition")]
    CallToUndefined { func: String, callee: String },

    #[error("pure definition of '{func}' refers to itself")]
    SelfReference { func: String },

    #[error("nested tuple in the definition of '{func}'")]
    NestedTuple { func: String },

    #[error("tuple shapes [{left}] and [{right}] do not match in '{func}'")]
    TupleShapeMismatch {
        func: String,
        left: usize,
        right: usize,
    },

    #[error("'{func}' cannot be redefined after it has been updated")]
    RedefinedAfterUpdate { func: String },

    #[error("'{func}' has non-storable element type {ty}")]
    UnstorableType { func: String, ty: Type },
}

impl DefinitionError {
    pub fn func(&self) -> &str {
        match self {
            DefinitionError::ImplicitMismatch { func, .. }
            | DefinitionError::NoUpdate { func }
            | DefinitionError::ArityMismatch { func, .. }
            | DefinitionError::ScatterWithoutGather { func }
            | DefinitionError::DuplicateVar { func, .. }
            | DefinitionError::MultipleRDoms { func, .. }
            | DefinitionError::CallToUndefined { func, .. }
            | DefinitionError::SelfReference { func }
            | DefinitionError::NestedTuple { func }
            | DefinitionError::TupleShapeMismatch { func, .. }
            | DefinitionError::RedefinedAfterUpdate { func }
            | DefinitionError::UnstorableType { func, .. } => func,
        }
    }
}

/// Errors raised while replaying a schedule.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("directive {index} of '{func}' ({directive}): {kind}")]
pub struct ScheduleError {
    pub func: String,
    pub index: usize,
    pub directive: String,
    pub kind: ScheduleErrorKind,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScheduleErrorKind {
    #[error("unknown dimension '{0}'")]
    UnknownVar(String),
    #[error("dimension '{0}' already exists")]
    DuplicateVar(String),
    #[error("factor must be positive, got {0}")]
    BadFactor(i32),
    #[error("'{outer}' cannot be placed outside '{inner}'")]
    BadTranspose { outer: String, inner: String },
    #[error("no caller has a loop named '{0}'")]
    UnknownChunkLoop(String),
}

/// Errors raised while compiling a pipeline.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("backend '{backend}' failed: {message}")]
    Backend { backend: String, message: String },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("compiled module has no symbol '{0}'")]
    MissingSymbol(String),

    #[error("two different inputs are both named '{0}'")]
    DuplicateInput(String),

    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    #[error("cannot load '{path}': {message}")]
    Load { path: String, message: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while preparing the arguments of a compiled pipeline.
#[derive(Debug, Error)]
pub enum RealizeError {
    #[error("image parameter '{0}' is not bound to a buffer")]
    UnboundImage(String),

    #[error("'{name}' has {expected} dimensions but the buffer has {found}")]
    DimensionMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("'{name}' has type {expected} but the buffer holds {found}")]
    TypeMismatch {
        name: String,
        expected: Type,
        found: Type,
    },

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Any recoverable error surfaced by the public API.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Realize(#[from] RealizeError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl Error {
    /// Structured form of this error, pointing at the part of the pipeline
    /// listing it concerns.
    pub fn to_diagnostic(&self) -> Diagnostic {
        match self {
            Error::Definition(e) => {
                let d = Diagnostic::error(e.to_string()).at(Site::func(e.func()));
                match e {
                    DefinitionError::ScatterWithoutGather { .. } => {
                        d.with_help("give the function a pure definition first".to_string())
                    }
                    DefinitionError::RedefinedAfterUpdate { .. } => {
                        d.with_note("update clauses refer to the existing pure definition".to_string())
                    }
                    _ => d,
                }
            }
            Error::Schedule(e) => Diagnostic::error(e.kind.to_string())
                .at(Site::directive(&e.func, e.index))
                .with_note(format!("while applying {}", e.directive)),
            Error::Compile(e) => Diagnostic::error(e.to_string()),
            Error::Realize(e) => Diagnostic::error(e.to_string()),
            Error::Archive(e) => Diagnostic::error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_error_message() {
        let e = ScheduleError {
            func: "blur".to_string(),
            index: 2,
            directive: "vectorize(q)".to_string(),
            kind: ScheduleErrorKind::UnknownVar("q".to_string()),
        };
        assert_eq!(
            e.to_string(),
            "directive 2 of 'blur' (vectorize(q)): unknown dimension 'q'"
        );
    }

    #[test]
    fn test_diagnostic_points_at_directive() {
        let e = Error::from(ScheduleError {
            func: "blur".to_string(),
            index: 1,
            directive: "split(x, x, xi, 0)".to_string(),
            kind: ScheduleErrorKind::BadFactor(0),
        });
        let d = e.to_diagnostic();
        assert_eq!(d.message, "factor must be positive, got 0");
        assert_eq!(d.site, Some(Site::directive("blur", 1)));
        assert_eq!(d.notes.len(), 1);
    }

    #[test]
    fn test_definition_error_func() {
        let e = DefinitionError::NoUpdate {
            func: "hist".to_string(),
        };
        assert_eq!(e.func(), "hist");
        assert_eq!(e.to_string(), "'hist' has no update definition");
    }
}
