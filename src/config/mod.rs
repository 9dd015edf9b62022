//! Runtime configuration.
//!
//! A [`RuntimeConfig`] can be built in code, read from the environment
//! (`PRISM_NUM_THREADS`, `PRISM_TARGET`, `PRISM_AOT`, `PRISM_AOT_DIR`) or
//! loaded from a `prism.toml`:
//!
//! ```toml
//! [runtime]
//! threads = 8
//! target = "ptx"
//!
//! [aot]
//! enabled = true
//! dir = "build/aot"
//! linker = "cc"
//! ```

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::diagnostic::Diagnostic;
use crate::runtime::queue::N_MAX_THREADS;

pub const DEFAULT_THREADS: usize = 8;

/// Device the compiled pipeline's output is computed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OffloadTarget {
    Ptx,
}

impl OffloadTarget {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ptx" | "cuda" => Some(OffloadTarget::Ptx),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AotConfig {
    /// Where objects and shared libraries are written.
    pub work_dir: PathBuf,
    /// Program invoked to link objects into shared libraries.
    pub linker: String,
}

impl Default for AotConfig {
    fn default() -> Self {
        AotConfig {
            work_dir: std::env::temp_dir().join("prism"),
            linker: "cc".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// The backend's module is called directly.
    #[default]
    InProcess,
    /// Emit an object, link it and load the shared library.
    AheadOfTime(AotConfig),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Threads serving parallel loops, the calling thread included.
    pub threads: usize,
    pub offload: Option<OffloadTarget>,
    pub mode: ExecutionMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            threads: DEFAULT_THREADS,
            offload: None,
            mode: ExecutionMode::InProcess,
        }
    }
}

fn clamp_threads(n: usize) -> usize {
    n.clamp(1, N_MAX_THREADS)
}

fn truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "yes" | "on")
}

impl RuntimeConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = clamp_threads(threads);
        self
    }

    pub fn with_offload(mut self, target: OffloadTarget) -> Self {
        self.offload = Some(target);
        self
    }

    pub fn ahead_of_time(mut self, aot: AotConfig) -> Self {
        self.mode = ExecutionMode::AheadOfTime(aot);
        self
    }

    /// Defaults overridden by the `PRISM_*` environment variables.
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = RuntimeConfig::default();
        if let Some(value) = var("PRISM_NUM_THREADS") {
            match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.threads = clamp_threads(n),
                _ => warn!(value = %value, "ignoring invalid PRISM_NUM_THREADS"),
            }
        }
        if let Some(value) = var("PRISM_TARGET") {
            match value.trim() {
                "" | "host" => {}
                name => match OffloadTarget::parse(name) {
                    Some(target) => config.offload = Some(target),
                    None => warn!(value = %value, "ignoring unknown PRISM_TARGET"),
                },
            }
        }
        if var("PRISM_AOT").is_some_and(|v| truthy(&v)) {
            let mut aot = AotConfig::default();
            if let Some(dir) = var("PRISM_AOT_DIR") {
                aot.work_dir = PathBuf::from(dir);
            }
            config.mode = ExecutionMode::AheadOfTime(aot);
        }
        config
    }

    /// Load configuration from a `prism.toml` file.
    pub fn load(toml_path: &Path) -> Result<RuntimeConfig, Diagnostic> {
        let content = std::fs::read_to_string(toml_path).map_err(|e| {
            Diagnostic::error(format!("cannot read '{}': {}", toml_path.display(), e))
        })?;
        let root_dir = toml_path.parent().unwrap_or(Path::new("."));
        Self::parse(&content, root_dir)
    }

    /// Parse `prism.toml` content; relative paths resolve against
    /// `root_dir`.
    pub fn parse(content: &str, root_dir: &Path) -> Result<RuntimeConfig, Diagnostic> {
        let mut config = RuntimeConfig::default();
        let mut aot_enabled = false;
        let mut aot = AotConfig::default();
        let mut current_section = String::new();

        for (n, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with('#') || trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                current_section = trimmed[1..trimmed.len() - 1].trim().to_string();
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(Diagnostic::error(format!(
                    "line {}: expected 'key = value'",
                    n + 1
                )));
            };
            let key = key.trim().trim_matches('"');
            let value = value.trim().trim_matches('"');

            match (current_section.as_str(), key) {
                ("runtime", "threads") => {
                    let threads = value.parse::<usize>().ok().filter(|&t| t > 0).ok_or_else(|| {
                        Diagnostic::error(format!("line {}: invalid thread count '{}'", n + 1, value))
                            .with_help(format!("use a number between 1 and {}", N_MAX_THREADS))
                    })?;
                    if threads > N_MAX_THREADS {
                        warn!(threads, max = N_MAX_THREADS, "clamping thread count");
                    }
                    config.threads = clamp_threads(threads);
                }
                ("runtime", "target") => {
                    config.offload = match value {
                        "host" => None,
                        name => Some(OffloadTarget::parse(name).ok_or_else(|| {
                            Diagnostic::error(format!("line {}: unknown target '{}'", n + 1, value))
                                .with_help("supported targets: host, ptx".to_string())
                        })?),
                    };
                }
                ("aot", "enabled") => aot_enabled = truthy(value),
                ("aot", "dir") => aot.work_dir = root_dir.join(value),
                ("aot", "linker") => aot.linker = value.to_string(),
                (section, key) => {
                    warn!(section, key, "ignoring unknown prism.toml key");
                }
            }
        }

        if aot_enabled {
            config.mode = ExecutionMode::AheadOfTime(aot);
        }
        Ok(config)
    }
}
