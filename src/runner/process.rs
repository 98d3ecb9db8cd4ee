//! Child process execution with timeout and group termination.
//!
//! Every command runs in its own process group so that a timed-out test is
//! taken down together with anything it spawned:
//!
//! ```text
//! wait(timeout) ──ok──► exited
//!      │
//!   timeout
//!      ▼
//! SIGTERM group ─► wait(grace) ──ok──► killed (timed out)
//!                       │
//!                    timeout
//!                       ▼
//!               SIGKILL group ─► wait(grace) ──ok──► killed (timed out)
//!                                     │
//!                                  timeout
//!                                     ▼
//!                             RunError::Unkillable
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::{RunError, RunResult};

/// A fully resolved command line.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Working directory of the child.
    pub dir: PathBuf,
    /// Variables set on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(argv: Vec<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            argv,
            dir: dir.into(),
            env: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The command line as a shell would spell it.
    pub fn display(&self) -> String {
        shell_words::join(&self.argv)
    }
}

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessOutcome {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs `invocation` to completion, terminating it on timeout.
///
/// `grace` is how long the child gets after each termination signal.
pub async fn run(invocation: &Invocation, grace: Duration) -> RunResult<ProcessOutcome> {
    let Some((program, args)) = invocation.argv.split_first() else {
        return Err(RunError::Spawn {
            command: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        });
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&invocation.dir)
        .envs(&invocation.env)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    tracing::info!("Running: {} (in {})", invocation.display(), invocation.dir.display());

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
        command: invocation.display(),
        source,
    })?;

    let waited = match invocation.timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
        None => Some(child.wait().await),
    };

    let (status, timed_out) = match waited {
        Some(status) => (status?, false),
        None => {
            tracing::error!(
                "Timed out after {}s: {}",
                invocation.timeout.unwrap_or_default().as_secs(),
                invocation.display()
            );
            (terminate(&mut child, grace, invocation).await?, true)
        }
    };
    let elapsed = start.elapsed();

    let outcome = ProcessOutcome {
        exit_code: status.code(),
        signal: exit_signal(&status),
        timed_out,
        elapsed,
    };
    tracing::info!(
        "Exited with {:?} after {:.2}s",
        outcome.exit_code,
        elapsed.as_secs_f64()
    );
    Ok(outcome)
}

/// What termination needs from a running child.
#[async_trait]
pub(crate) trait Reap: Send {
    fn pid(&self) -> Option<u32>;

    /// Sends `signal` to the child's whole process group.
    fn signal_group(&mut self, pid: u32, signal: Signal);

    async fn wait(&mut self) -> std::io::Result<ExitStatus>;
}

#[async_trait]
impl Reap for Child {
    fn pid(&self) -> Option<u32> {
        self.id()
    }

    fn signal_group(&mut self, pid: u32, signal: Signal) {
        signal_group(self, pid, signal);
    }

    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        Child::wait(self).await
    }
}

/// Takes a timed-out child down: SIGTERM, then SIGKILL, each followed by
/// `grace` to exit.
pub(crate) async fn terminate<C: Reap + ?Sized>(
    child: &mut C,
    grace: Duration,
    invocation: &Invocation,
) -> RunResult<ExitStatus> {
    let Some(pid) = child.pid() else {
        return Ok(child.wait().await?);
    };

    child.signal_group(pid, Signal::Term);
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return Ok(status?);
    }

    tracing::warn!("Process group {} ignored SIGTERM, sending SIGKILL", pid);
    child.signal_group(pid, Signal::Kill);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            tracing::error!("Process group {} survived SIGKILL", pid);
            Err(RunError::Unkillable {
                pid,
                command: invocation.display(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(_child: &mut Child, pid: u32, signal: Signal) {
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: killpg has no memory effects; a stale group id only yields ESRCH.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, signo) };
    if rc != 0 {
        tracing::debug!(
            "killpg({}, {}) failed: {}",
            pid,
            signo,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pid: u32, _signal: Signal) {
    if let Err(e) = child.start_kill() {
        tracing::debug!("kill failed: {}", e);
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
