use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use kiln_supervisor::terminate;
use kiln_types::{KilnError, Result};

use crate::task::TaskAction;

const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Runs a command line with `bash -c`. A non-zero exit fails the task with
/// the tail of the command's stderr.
pub struct ShellTask {
    name: String,
    command: String,
    cwd: PathBuf,
    timeout: Option<Duration>,
    grace: Duration,
}

impl ShellTask {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        cwd: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cwd: cwd.into(),
            timeout: None,
            grace: DEFAULT_GRACE,
        }
    }

    /// Terminate the command (SIGTERM, then SIGKILL after `grace`) if it runs
    /// longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration, grace: Duration) -> Self {
        self.timeout = Some(timeout);
        self.grace = grace;
        self
    }

    fn failed(&self, message: impl Into<String>) -> KilnError {
        KilnError::TaskFailed {
            task: self.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl TaskAction for ShellTask {
    async fn run(&self) -> Result<()> {
        let mut cmd = tokio::process::Command::new("bash");
        cmd.args(["-c", &self.command])
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| KilnError::Process {
            command: self.command.clone(),
            message: e.to_string(),
        })?;

        // Drain stderr concurrently so a chatty command cannot block on a full pipe.
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf).await;
                buf
            })
        });

        let status = match self.timeout {
            None => child.wait().await?,
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    let (_, forced) = terminate(&mut child, self.grace).await?;
                    tracing::warn!(task = %self.name, forced, "Command timed out");
                    return Err(self.failed(format!("timed out after {}ms", limit.as_millis())));
                }
            },
        };

        let stderr = match stderr {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };
        let stderr = String::from_utf8_lossy(&stderr);

        if status.success() {
            if !stderr.trim().is_empty() {
                tracing::debug!(
                    task = %self.name,
                    stderr = %stderr.trim(),
                    "Command wrote to stderr"
                );
            }
            Ok(())
        } else {
            let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            Err(self.failed(format!(
                "`{}` exited with {}: {}",
                self.command,
                status,
                tail.join("\n")
            )))
        }
    }
}
