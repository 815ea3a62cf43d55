//! Per-module source transforms applied before a module joins the bundle.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use kiln_types::{KilnError, Result};

use crate::descriptor::TransformConfig;

#[async_trait]
pub trait ModuleTransform: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this transform handles the given module file.
    fn applies_to(&self, path: &Path) -> bool;

    async fn transform(&self, path: &Path, source: String) -> Result<String>;
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|x| x.trim_start_matches('.') == ext))
        .unwrap_or(false)
}

fn transform_error(path: &Path, message: impl Into<String>) -> KilnError {
    KilnError::Transform {
        file: path.display().to_string(),
        message: message.into(),
    }
}

/// Build the transform chain described by a bundle's configuration, in order.
pub fn build_chain(configs: &[TransformConfig]) -> Vec<Box<dyn ModuleTransform>> {
    configs
        .iter()
        .map(|config| -> Box<dyn ModuleTransform> {
            match config {
                TransformConfig::Template { extensions } => {
                    Box::new(TemplateTransform::new(extensions.clone()))
                }
                TransformConfig::Json => Box::new(JsonTransform),
                TransformConfig::Command {
                    program,
                    args,
                    extensions,
                } => Box::new(CommandTransform::new(
                    program.clone(),
                    args.clone(),
                    extensions.clone(),
                )),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// TemplateTransform
// ---------------------------------------------------------------------------

/// Exports the raw template text as the module's value. Template compilation
/// happens at runtime in the page.
pub struct TemplateTransform {
    extensions: Vec<String>,
}

impl TemplateTransform {
    pub fn new(extensions: Vec<String>) -> Self {
        Self { extensions }
    }
}

#[async_trait]
impl ModuleTransform for TemplateTransform {
    fn name(&self) -> &str {
        "template"
    }

    fn applies_to(&self, path: &Path) -> bool {
        has_extension(path, &self.extensions)
    }

    async fn transform(&self, _path: &Path, source: String) -> Result<String> {
        Ok(format!("module.exports = {};\n", serde_json::to_string(&source)?))
    }
}

// ---------------------------------------------------------------------------
// JsonTransform
// ---------------------------------------------------------------------------

pub struct JsonTransform;

#[async_trait]
impl ModuleTransform for JsonTransform {
    fn name(&self) -> &str {
        "json"
    }

    fn applies_to(&self, path: &Path) -> bool {
        has_extension(path, &["json".to_string()])
    }

    async fn transform(&self, path: &Path, source: String) -> Result<String> {
        let value: serde_json::Value =
            serde_json::from_str(&source).map_err(|e| transform_error(path, e.to_string()))?;
        Ok(format!("module.exports = {};\n", value))
    }
}

// ---------------------------------------------------------------------------
// CommandTransform
// ---------------------------------------------------------------------------

/// Runs an external program with the module source on stdin and takes its
/// stdout as the transformed source. A non-zero exit is a transform failure.
pub struct CommandTransform {
    program: String,
    args: Vec<String>,
    extensions: Vec<String>,
}

impl CommandTransform {
    pub fn new(program: String, args: Vec<String>, extensions: Vec<String>) -> Self {
        Self {
            program,
            args,
            extensions,
        }
    }
}

#[async_trait]
impl ModuleTransform for CommandTransform {
    fn name(&self) -> &str {
        &self.program
    }

    fn applies_to(&self, path: &Path) -> bool {
        has_extension(path, &self.extensions)
    }

    async fn transform(&self, path: &Path, source: String) -> Result<String> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| transform_error(path, format!("failed to run {}: {}", self.program, e)))?;

        // Feed stdin from a separate task so a chatty child can't fill its
        // stdout pipe while we are still writing.
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                let _ = stdin.write_all(source.as_bytes()).await;
            });
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(transform_error(
                path,
                format!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            ));
        }
        String::from_utf8(output.stdout)
            .map_err(|_| {
                transform_error(path, format!("{} produced non-UTF-8 output", self.program))
            })
    }
}
