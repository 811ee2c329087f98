//! Terminate-then-kill escalation for child processes.
//!
//! Targets are spawned as process-group leaders so that wrapper scripts and
//! their children are signalled together.

use std::time::Duration;

use tokio::process::Child;
use tracing::debug;

use super::StopTier;

/// Upper bound on waiting for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Send SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Returns the tier that ended the process, or an error if the child could
/// not be reaped even after the kill.
pub async fn terminate_then_kill(child: &mut Child, grace: Duration) -> std::io::Result<StopTier> {
    if child.try_wait()?.is_some() {
        return Ok(StopTier::AlreadyExited);
    }
    let pid = child.id();

    if let Some(pid) = pid {
        if send(pid, libc::SIGTERM) {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => {
                    debug!(pid, status = ?status.ok(), "child exited after SIGTERM");
                    return Ok(StopTier::Graceful);
                }
                Err(_) => debug!(pid, grace_ms = grace.as_millis() as u64, "grace window expired"),
            }
        }
    }

    match pid {
        Some(pid) if send(pid, libc::SIGKILL) => {}
        _ => child.start_kill()?,
    }
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(_)) => Ok(StopTier::Forced),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "child not reaped after SIGKILL",
        )),
    }
}

/// Signal the process group led by `pid`, falling back to the process alone.
fn send(pid: u32, signal: libc::c_int) -> bool {
    let pid = pid as libc::pid_t;
    // SAFETY: `pid` belongs to a child we have not reaped yet, so neither it
    // nor a group it leads can have been recycled for unrelated processes.
    unsafe { libc::kill(-pid, signal) == 0 || libc::kill(pid, signal) == 0 }
}
