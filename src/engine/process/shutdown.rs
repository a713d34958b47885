//! Graceful-then-forced termination of agent processes.

use std::time::Duration;

use tokio::process::Child;

/// How long a signalled process may take to exit before it is killed.
pub const GRACE_PERIOD: Duration = Duration::from_secs(3);

/// How a process ended up stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// It had already exited.
    AlreadyExited,
    /// It exited within the grace period after the interrupt.
    Graceful,
    /// It had to be killed.
    Killed,
}

/// Interrupt `child`, wait up to `grace`, then kill it. Always reaps.
pub async fn terminate(child: &mut Child, grace: Duration) -> Termination {
    if let Ok(Some(_)) = child.try_wait() {
        return Termination::AlreadyExited;
    }

    interrupt(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {
            tracing::debug!(pid = ?child.id(), "agent exited after interrupt");
            Termination::Graceful
        }
        Err(_) => {
            tracing::warn!(pid = ?child.id(), grace_ms = grace.as_millis() as u64, "agent ignored interrupt, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "kill failed");
            }
            Termination::Killed
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    let Some(pid) = child.id() else { return };
    let Ok(pid) = libc::pid_t::try_from(pid) else { return };
    // SAFETY: pid belongs to a child we have not reaped yet.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        tracing::debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    let _ = child.start_kill();
}
