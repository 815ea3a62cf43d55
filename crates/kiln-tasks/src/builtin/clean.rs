use std::path::PathBuf;

use async_trait::async_trait;

use kiln_types::Result;

use crate::task::TaskAction;

/// Removes a directory tree. A missing directory is not an error.
pub struct CleanTask {
    path: PathBuf,
}

impl CleanTask {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TaskAction for CleanTask {
    async fn run(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Creates directories, including missing parents.
pub struct MkdirTask {
    dirs: Vec<PathBuf>,
}

impl MkdirTask {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }
}

#[async_trait]
impl TaskAction for MkdirTask {
    async fn run(&self) -> Result<()> {
        for dir in &self.dirs {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clean_removes_tree_and_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        std::fs::create_dir_all(build.join("js")).unwrap();
        std::fs::write(build.join("js/main.js"), "x").unwrap();

        let clean = CleanTask::new(&build);
        clean.run().await.unwrap();
        assert!(!build.exists());
        clean.run().await.unwrap();
    }

    #[tokio::test]
    async fn mkdir_creates_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        MkdirTask::new(vec![build.join("public/css"), build.join("server")])
            .run()
            .await
            .unwrap();
        assert!(build.join("public/css").is_dir());
        assert!(build.join("server").is_dir());
    }
}
