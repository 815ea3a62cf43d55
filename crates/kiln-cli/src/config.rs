//! `Kiln.toml` loading and validation.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use kiln_bundle::BundleDescriptor;
use kiln_tasks::builtin::CopyRule;
use kiln_types::{KilnError, Result};
use kiln_watch::compile_globs;

pub const DEFAULT_CONFIG_FILE: &str = "Kiln.toml";

fn default_output_root() -> PathBuf {
    PathBuf::from("build")
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_grace_ms() -> u64 {
    2000
}

fn default_start_attempts() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KilnConfig {
    /// Project root. Relative paths are resolved against the config file's directory.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Output root, relative to the project root.
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default, rename = "bundle")]
    pub bundles: Vec<BundleDescriptor>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskConfig>,
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageConfig>,
    #[serde(default, rename = "watch")]
    pub watches: Vec<WatchConfig>,
    #[serde(default)]
    pub server: Option<ServerConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum TaskConfig {
    /// Remove the output root.
    Clean,
    /// Create directories under the output root.
    Mkdir { dirs: Vec<PathBuf> },
    /// Copy files matching root-relative globs into output-relative directories.
    Copy { rules: Vec<CopyRuleConfig> },
    Shell {
        command: String,
        /// Relative to the project root.
        #[serde(default)]
        cwd: Option<PathBuf>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Build every `[[bundle]]`.
    Bundles,
    /// Start the `[server]` under supervision.
    Serve,
    /// Start watching for changes.
    Watch,
}

impl TaskConfig {
    /// Serve and watch tasks start long-lived processes rather than build.
    pub fn is_long_running(&self) -> bool {
        matches!(self, TaskConfig::Serve | TaskConfig::Watch)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyRuleConfig {
    pub from: String,
    pub to: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub tasks: Vec<String>,
    #[serde(default)]
    pub requires_success: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    pub globs: Vec<String>,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub command: String,
    /// Relative to the project root.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Root-relative globs; a rebuilt artifact or changed file matching one restarts the server.
    #[serde(default)]
    pub restart_on: Vec<String>,
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_start_attempts")]
    pub start_attempts: usize,
}

impl KilnConfig {
    /// Read, parse, and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            KilnError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let base = path.parent().unwrap_or(Path::new(""));
        Self::parse(&text, base)
    }

    /// Parse and validate config text. A relative `root` is resolved against
    /// `base`, and a relative result against the working directory.
    pub fn parse(text: &str, base: &Path) -> Result<Self> {
        let mut config: KilnConfig =
            toml::from_str(text).map_err(|e| KilnError::Config(e.to_string()))?;
        let root = match config.root.take() {
            Some(root) if root.is_absolute() => root,
            Some(root) => base.join(root),
            None => base.to_path_buf(),
        };
        config.root = Some(absolute(root)?);
        config.validate()?;
        Ok(config)
    }

    pub fn project_root(&self) -> &Path {
        self.root.as_deref().unwrap_or(Path::new("."))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.project_root().join(&self.output_root)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Whether a stage contains a serve or watch task.
    pub fn stage_is_long_running(&self, stage: &StageConfig) -> bool {
        stage
            .tasks
            .iter()
            .any(|name| self.tasks.get(name).is_some_and(TaskConfig::is_long_running))
    }

    fn validate(&self) -> Result<()> {
        let mut outputs = HashSet::new();
        for bundle in &self.bundles {
            bundle.validate()?;
            if !outputs.insert(bundle.output.as_str()) {
                return Err(KilnError::Config(format!(
                    "duplicate bundle output '{}'",
                    bundle.output
                )));
            }
        }

        if self.stages.is_empty() {
            return Err(KilnError::Config("no [[stage]] declared".into()));
        }
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.tasks.is_empty() {
                return Err(KilnError::Config(format!("stage {} has no tasks", index)));
            }
            for name in &stage.tasks {
                if !self.tasks.contains_key(name) {
                    return Err(KilnError::Config(format!(
                        "stage {} names unknown task '{}'",
                        index, name
                    )));
                }
            }
        }

        for (name, task) in &self.tasks {
            match task {
                TaskConfig::Copy { rules } => {
                    for rule in rules {
                        CopyRule::new(&rule.from, &rule.to).map_err(config_error)?;
                    }
                }
                TaskConfig::Serve if self.server.is_none() => {
                    return Err(KilnError::Config(format!(
                        "task '{}' is a serve task but no [server] is configured",
                        name
                    )));
                }
                _ => {}
            }
        }

        for watch in &self.watches {
            compile_globs(&watch.globs).map_err(config_error)?;
            for target in &watch.targets {
                if !self.tasks.contains_key(target) && !outputs.contains(target.as_str()) {
                    return Err(KilnError::Config(format!(
                        "watch target '{}' is neither a task nor a bundle output",
                        target
                    )));
                }
            }
        }

        if let Some(server) = &self.server {
            compile_globs(&server.restart_on).map_err(config_error)?;
            if server.command.trim().is_empty() {
                return Err(KilnError::Config("server command is empty".into()));
            }
        }
        Ok(())
    }
}

fn absolute(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = std::env::current_dir()
        .map_err(|e| KilnError::Config(format!("cannot resolve project root: {}", e)))?;
    if path.as_os_str().is_empty() {
        Ok(cwd)
    } else {
        Ok(cwd.join(path))
    }
}

fn config_error(e: KilnError) -> KilnError {
    match e {
        KilnError::Config(_) => e,
        other => KilnError::Config(other.to_string()),
    }
}
