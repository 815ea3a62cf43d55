//! Graceful child termination with forced-kill escalation.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;

/// Stop `child` and wait for it to exit.
///
/// On Unix the child's process group receives SIGTERM; if it has not exited
/// after `grace`, the group receives SIGKILL. Children must have been spawned
/// with `process_group(0)` for the group signals to reach grandchildren.
/// Returns `true` in the second element when the kill had to be forced.
pub async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<(ExitStatus, bool)> {
    if let Some(status) = child.try_wait()? {
        return Ok((status, false));
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
        tokio::select! {
            status = child.wait() => return Ok((status?, false)),
            _ = tokio::time::sleep(grace) => {}
        }
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }

    #[cfg(not(unix))]
    let _ = grace;

    child.start_kill()?;
    let status = child.wait().await?;
    Ok((status, true))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spawn(script: &str) -> Child {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", script]).process_group(0);
        cmd.spawn().unwrap()
    }

    #[tokio::test]
    async fn sigterm_is_enough_for_a_cooperative_child() {
        let mut child = spawn("sleep 30");
        let (status, forced) = terminate(&mut child, Duration::from_secs(5)).await.unwrap();
        assert!(!forced);
        assert!(!status.success());
    }

    #[tokio::test]
    async fn ignoring_sigterm_escalates_to_kill() {
        let mut child = spawn("trap '' TERM; sleep 30");
        let started = std::time::Instant::now();
        let (_, forced) = terminate(&mut child, Duration::from_millis(200)).await.unwrap();
        assert!(forced);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn already_exited_child_is_reported_as_is() {
        let mut child = spawn("exit 3");
        child.wait().await.unwrap();
        let (status, forced) = terminate(&mut child, Duration::from_millis(10)).await.unwrap();
        assert!(!forced);
        assert_eq!(status.code(), Some(3));
    }
}
