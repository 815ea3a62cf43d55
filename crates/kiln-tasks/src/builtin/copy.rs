use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use globset::{GlobBuilder, GlobMatcher};

use kiln_types::{KilnError, Result};

use crate::task::TaskAction;

/// Copy every file matching `glob` into `dest`, keeping its path relative to
/// the glob's literal prefix (`public/imgs/**/*` keeps paths below `public/imgs`).
#[derive(Debug, Clone)]
pub struct CopyRule {
    pattern: String,
    matcher: GlobMatcher,
    base: PathBuf,
    dest: PathBuf,
}

impl CopyRule {
    pub fn new(glob: &str, dest: impl Into<PathBuf>) -> Result<Self> {
        let matcher = GlobBuilder::new(glob)
            .literal_separator(true)
            .build()
            .map_err(|e| KilnError::InvalidGlob {
                pattern: glob.to_string(),
                message: e.to_string(),
            })?
            .compile_matcher();
        Ok(Self {
            pattern: glob.to_string(),
            matcher,
            base: literal_prefix(glob),
            dest: dest.into(),
        })
    }
}

/// Leading path components that contain no glob metacharacters.
fn literal_prefix(glob: &str) -> PathBuf {
    Path::new(glob)
        .components()
        .take_while(|c| match c {
            Component::Normal(s) => !s.to_string_lossy().contains(['*', '?', '[', '{']),
            _ => true,
        })
        .collect()
}

pub struct CopyTask {
    root: PathBuf,
    rules: Vec<CopyRule>,
}

impl CopyTask {
    /// Globs are matched against paths relative to `root`; `dest` paths are
    /// taken as given.
    pub fn new(root: impl Into<PathBuf>, rules: Vec<CopyRule>) -> Self {
        Self {
            root: root.into(),
            rules,
        }
    }

    async fn copy_rule(&self, rule: &CopyRule) -> Result<usize> {
        let mut copied = 0;
        let mut pending = vec![self.root.join(&rule.base)];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                if !rule.matcher.is_match(relative) {
                    continue;
                }
                let below_base = relative.strip_prefix(&rule.base).unwrap_or(relative);
                let target = rule.dest.join(below_base);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(&path, &target).await?;
                copied += 1;
            }
        }
        Ok(copied)
    }
}

#[async_trait]
impl TaskAction for CopyTask {
    async fn run(&self) -> Result<()> {
        for rule in &self.rules {
            let copied = self.copy_rule(rule).await?;
            tracing::debug!(
                glob = %rule.pattern,
                dest = %rule.dest.display(),
                copied,
                "Copied files"
            );
        }
        Ok(())
    }
}
