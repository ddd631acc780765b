//! Exit classification and signal handling for agent processes.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tracing::warn;

/// How an agent process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exit code 0.
    Clean,
    /// Ended by `terminate` or `stop`; never counted as a crash.
    Terminated { exit_code: Option<i32> },
    /// Non-zero exit, death by signal, or a failed wait.
    Crashed {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
}

impl ExitOutcome {
    pub fn classify(status: io::Result<ExitStatus>, terminated: bool) -> Self {
        match status {
            Ok(status) if terminated => Self::Terminated {
                exit_code: status.code(),
            },
            Ok(status) if status.success() => Self::Clean,
            Ok(status) => Self::Crashed {
                exit_code: status.code(),
                signal: exit_signal(&status),
            },
            Err(e) => {
                warn!(error = %e, "Failed to wait for agent process");
                if terminated {
                    Self::Terminated { exit_code: None }
                } else {
                    Self::Crashed {
                        exit_code: None,
                        signal: None,
                    }
                }
            }
        }
    }

    pub const fn is_crash(self) -> bool {
        matches!(self, Self::Crashed { .. })
    }

    pub const fn exit_code(self) -> Option<i32> {
        match self {
            Self::Clean => Some(0),
            Self::Terminated { exit_code } | Self::Crashed { exit_code, .. } => exit_code,
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
const fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Ask a process to exit with SIGTERM.
#[cfg(unix)]
pub fn send_sigterm(pid: u32) {
    #[allow(unsafe_code, clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        warn!(pid, error = %err, "Failed to send SIGTERM");
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        send_sigterm(pid);
    }
    #[cfg(not(unix))]
    child.start_kill()?;

    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status;
    }
    warn!(grace_secs = grace.as_secs(), "Grace period expired, sending SIGKILL");
    child.kill().await?;
    child.wait().await
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[cfg(unix)]
    async fn run(script: &str) -> ExitStatus {
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .status()
            .await
            .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn classifies_exit_codes() {
        assert_eq!(ExitOutcome::classify(Ok(run("exit 0").await), false), ExitOutcome::Clean);
        let crashed = ExitOutcome::classify(Ok(run("exit 3").await), false);
        assert_eq!(
            crashed,
            ExitOutcome::Crashed {
                exit_code: Some(3),
                signal: None
            }
        );
        assert!(crashed.is_crash());
        assert_eq!(
            ExitOutcome::classify(Ok(run("exit 3").await), true),
            ExitOutcome::Terminated { exit_code: Some(3) }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signal_death_is_a_crash() {
        let status = run("kill -9 $$").await;
        assert_eq!(
            ExitOutcome::classify(Ok(status), false),
            ExitOutcome::Crashed {
                exit_code: None,
                signal: Some(9)
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_escalates_to_kill() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 30")
            .spawn()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = terminate(&mut child, Duration::from_millis(200)).await.unwrap();
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_stops_cooperative_process() {
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let status = terminate(&mut child, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            ExitOutcome::classify(Ok(status), false),
            ExitOutcome::Crashed {
                exit_code: None,
                signal: Some(libc::SIGTERM)
            }
        );
    }
}
