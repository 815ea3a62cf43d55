//! Static description of one bundle output.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use kiln_types::{KilnError, Result};

/// One step of a bundle's per-module transform chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformConfig {
    /// Export template files as a string module.
    Template {
        #[serde(default = "default_template_extensions")]
        extensions: Vec<String>,
    },
    /// Export `.json` files as their parsed value.
    Json,
    /// Pipe module source through an external program (stdin to stdout).
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_script_extensions")]
        extensions: Vec<String>,
    },
}

fn default_template_extensions() -> Vec<String> {
    vec!["hbs".to_string()]
}

fn default_script_extensions() -> Vec<String> {
    vec!["js".to_string()]
}

fn default_debug() -> bool {
    true
}

/// Immutable configuration of a single bundle pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleDescriptor {
    /// Output path relative to the output root, e.g. `js/main.js`. Unique per registry.
    pub output: String,
    /// Entry modules, relative to the project root, executed in order.
    pub entries: Vec<PathBuf>,
    #[serde(default)]
    pub transforms: Vec<TransformConfig>,
    /// Emit a sibling sourcemap.
    #[serde(default = "default_debug")]
    pub debug: bool,
}

impl BundleDescriptor {
    pub fn new(output: impl Into<String>, entries: Vec<PathBuf>) -> Self {
        Self {
            output: output.into(),
            entries,
            transforms: Vec::new(),
            debug: true,
        }
    }

    pub fn with_transform(mut self, transform: TransformConfig) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Output file name, i.e. the last segment of `output`.
    pub fn file_name(&self) -> &str {
        self.output.rsplit('/').next().unwrap_or(&self.output)
    }

    /// Reject descriptors that cannot produce a well-formed artifact path.
    pub fn validate(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(KilnError::Config(format!(
                "bundle '{}' has no entry sources",
                self.output
            )));
        }
        let path = Path::new(&self.output);
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if self.output.is_empty() || escapes || self.output.ends_with('/') {
            return Err(KilnError::Config(format!(
                "bundle output '{}' must be a relative file path",
                self.output
            )));
        }
        Ok(())
    }
}
