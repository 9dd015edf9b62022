//! Saving and restoring the directive lists of a pipeline.
//!
//! Archives are keyed by function name, so they can be applied to a freshly
//! built copy of the same pipeline (for instance to keep the winning
//! schedule of a tuning run).

use std::path::Path;

use rkyv::rancor;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::ir::expr::Var;
use crate::ir::func::Pipeline;
use crate::schedule::Directive;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("cannot encode schedule archive: {0}")]
    Encode(String),
    #[error("cannot decode schedule archive: {0}")]
    Decode(String),
    #[error("archive names function '{0}', which the pipeline does not have")]
    UnknownFunc(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum StoredDirective {
    Split {
        old: String,
        outer: String,
        inner: String,
        factor: i32,
    },
    Vectorize(String),
    Unroll(String),
    Transpose { outer: String, inner: String },
    Chunk(String),
    Root,
    Parallel(String),
    Random(u64),
    Bound { var: String, min: i32, extent: i32 },
}

impl From<&Directive> for StoredDirective {
    fn from(d: &Directive) -> Self {
        let s = |v: &Var| v.name().to_string();
        match d {
            Directive::Split {
                old,
                outer,
                inner,
                factor,
            } => StoredDirective::Split {
                old: s(old),
                outer: s(outer),
                inner: s(inner),
                factor: *factor,
            },
            Directive::Vectorize(v) => StoredDirective::Vectorize(s(v)),
            Directive::Unroll(v) => StoredDirective::Unroll(s(v)),
            Directive::Transpose { outer, inner } => StoredDirective::Transpose {
                outer: s(outer),
                inner: s(inner),
            },
            Directive::Chunk(v) => StoredDirective::Chunk(s(v)),
            Directive::Root => StoredDirective::Root,
            Directive::Parallel(v) => StoredDirective::Parallel(s(v)),
            Directive::Random(seed) => StoredDirective::Random(*seed),
            Directive::Bound { var, min, extent } => StoredDirective::Bound {
                var: s(var),
                min: *min,
                extent: *extent,
            },
        }
    }
}

impl From<&StoredDirective> for Directive {
    fn from(d: &StoredDirective) -> Self {
        let v = |name: &String| Var::new(name);
        match d {
            StoredDirective::Split {
                old,
                outer,
                inner,
                factor,
            } => Directive::Split {
                old: v(old),
                outer: v(outer),
                inner: v(inner),
                factor: *factor,
            },
            StoredDirective::Vectorize(name) => Directive::Vectorize(v(name)),
            StoredDirective::Unroll(name) => Directive::Unroll(v(name)),
            StoredDirective::Transpose { outer, inner } => Directive::Transpose {
                outer: v(outer),
                inner: v(inner),
            },
            StoredDirective::Chunk(name) => Directive::Chunk(v(name)),
            StoredDirective::Root => Directive::Root,
            StoredDirective::Parallel(name) => Directive::Parallel(v(name)),
            StoredDirective::Random(seed) => Directive::Random(*seed),
            StoredDirective::Bound { var, min, extent } => Directive::Bound {
                var: v(var),
                min: *min,
                extent: *extent,
            },
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FuncDirectives {
    pub name: String,
    pub directives: Vec<StoredDirective>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ScheduleArchive {
    pub funcs: Vec<FuncDirectives>,
}

impl ScheduleArchive {
    /// Snapshot every non-empty directive list of `pipeline`.
    pub fn capture(pipeline: &Pipeline) -> Self {
        let funcs = pipeline
            .funcs()
            .map(|f| pipeline.definition(f))
            .filter(|def| !def.directives.is_empty())
            .map(|def| FuncDirectives {
                name: def.name.clone(),
                directives: def.directives.iter().map(StoredDirective::from).collect(),
            })
            .collect();
        ScheduleArchive { funcs }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ArchiveError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|bytes| bytes.to_vec())
            .map_err(|e| ArchiveError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ArchiveError> {
        let mut aligned: AlignedVec = AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<ScheduleArchive, rancor::Error>(&aligned)
            .map_err(|e| ArchiveError::Decode(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), ArchiveError> {
        std::fs::write(path, self.to_bytes()?)?;
        info!(path = %path.display(), funcs = self.funcs.len(), "saved schedule");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ArchiveError> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    /// Replace the directive lists of the named functions. Every name must
    /// already exist in `pipeline`; nothing is changed otherwise.
    pub fn apply(&self, pipeline: &mut Pipeline) -> Result<(), ArchiveError> {
        let mut targets = Vec::with_capacity(self.funcs.len());
        for entry in &self.funcs {
            let f = pipeline
                .lookup(&entry.name)
                .ok_or_else(|| ArchiveError::UnknownFunc(entry.name.clone()))?;
            targets.push((f, entry));
        }
        for (f, entry) in targets {
            pipeline.definition_mut(f).directives =
                entry.directives.iter().map(Directive::from).collect();
        }
        pipeline.invalidate();
        Ok(())
    }
}
