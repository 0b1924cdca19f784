use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::bytes::Bytes;

use crate::error::ProxyError;
use crate::support::command_spec::CommandSpec;

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How a relayed process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExitOutcome {
    Exited { code: i32 },
    Signaled { signal: i32 },
    TimedOut,
    Shutdown,
    RelayFailed { message: String },
}

impl ExitOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Exited { code: 0 } => "exited_ok",
            Self::Exited { .. } => "exited_error",
            Self::Signaled { .. } => "signaled",
            Self::TimedOut => "timed_out",
            Self::Shutdown => "shutdown",
            Self::RelayFailed { .. } => "relay_failed",
        }
    }

    /// Process exit code a local caller should mirror.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited { code } => *code,
            Self::Signaled { signal } => 128 + signal,
            Self::TimedOut | Self::Shutdown | Self::RelayFailed { .. } => 1,
        }
    }
}

/// Trailer record closing every stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitReport {
    #[serde(flatten)]
    pub outcome: ExitOutcome,
    pub duration_ms: u64,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
}

/// Result of a single pipe read. End of stream is only ever `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadChunk {
    Data(Bytes),
    Closed,
}

pub async fn read_chunk<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<ReadChunk>
where
    R: AsyncRead + Unpin,
{
    let n = reader.read(buf).await?;
    if n == 0 {
        Ok(ReadChunk::Closed)
    } else {
        Ok(ReadChunk::Data(Bytes::copy_from_slice(&buf[..n])))
    }
}

/// A launched child with its pipes. Stdin is bound to the null device.
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    started: Instant,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// SIGTERM to the whole process group, SIGKILL once `grace` has passed.
    ///
    /// The group is signalled even when the leader has already exited, since
    /// background children it started still hold the group id.
    pub async fn terminate(&mut self, grace: Duration) -> std::io::Result<ExitStatus> {
        let deadline = tokio::time::Instant::now() + grace;
        self.signal_group(false);
        let status = match tokio::time::timeout_at(deadline, self.child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                tracing::warn!(pid = ?self.pid, "Child ignored SIGTERM, sending SIGKILL");
                self.signal_group(true);
                return self.child.wait().await;
            }
        };

        while self.group_alive() {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(pid = ?self.pid, "Process group outlived its leader, sending SIGKILL");
                self.signal_group(true);
                break;
            }
            tokio::time::sleep(GROUP_POLL_INTERVAL).await;
        }
        Ok(status)
    }

    #[cfg(unix)]
    fn group_alive(&self) -> bool {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        self.pid
            .is_some_and(|pid| killpg(Pid::from_raw(pid as i32), None).is_ok())
    }

    #[cfg(not(unix))]
    fn group_alive(&self) -> bool {
        false
    }

    #[cfg(unix)]
    fn signal_group(&mut self, force: bool) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return;
        };
        let signal = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        if let Err(err) = killpg(Pid::from_raw(pid as i32), signal) {
            tracing::debug!(pid, "killpg({signal:?}) failed: {err}");
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _force: bool) {
        let _ = self.child.start_kill();
    }
}

/// Spawns `spec` directly, without a shell, in a fresh process group.
pub fn launch(spec: &CommandSpec) -> Result<ProcessHandle, ProxyError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .env_clear()
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = spec.cwd.as_deref() {
        cmd.current_dir(cwd);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| ProxyError::LaunchFailed {
        program: spec.program.clone(),
        source,
    })?;
    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    Ok(ProcessHandle {
        child,
        pid,
        started: Instant::now(),
        stdout,
        stderr,
    })
}

pub fn outcome_from_status(status: ExitStatus) -> ExitOutcome {
    if let Some(code) = status.code() {
        return ExitOutcome::Exited { code };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitOutcome::Signaled { signal };
        }
    }
    ExitOutcome::RelayFailed {
        message: format!("unrecognized exit status: {status}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        let mut spec = CommandSpec::new("/bin/sh").arg("-c").arg(script);
        if let Ok(path) = std::env::var("PATH") {
            spec.env.insert("PATH".to_string(), path);
        }
        spec
    }

    async fn drain(handle: &mut ProcessHandle) -> Vec<u8> {
        let mut stdout = handle.stdout.take().expect("stdout piped");
        let mut buf = [0u8; 16];
        let mut collected = Vec::new();
        loop {
            match read_chunk(&mut stdout, &mut buf).await.expect("read") {
                ReadChunk::Data(bytes) => collected.extend_from_slice(&bytes),
                ReadChunk::Closed => break,
            }
        }
        collected
    }

    #[tokio::test]
    async fn zero_bytes_are_data_not_end_of_stream() {
        let mut handle = launch(&sh(r"printf '0\000x0\000'")).expect("launch");
        let out = drain(&mut handle).await;
        assert_eq!(out, b"0\x00x0\x00");
        let status = handle.wait().await.expect("wait");
        assert_eq!(outcome_from_status(status), ExitOutcome::Exited { code: 0 });
    }

    #[tokio::test]
    async fn missing_executable_is_launch_failure() {
        let err = launch(&CommandSpec::new("/nonexistent/cmdstream-tool"))
            .err()
            .expect("launch should fail");
        match err {
            ProxyError::LaunchFailed { program, source } => {
                assert_eq!(program, "/nonexistent/cmdstream-tool");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn environment_is_cleared_except_configured_values() {
        let mut spec = sh("printf '%s|%s' \"$CMDSTREAM_TEST\" \"$HOME\"");
        spec.env
            .insert("CMDSTREAM_TEST".to_string(), "configured".to_string());
        let mut handle = launch(&spec).expect("launch");
        assert_eq!(drain(&mut handle).await, b"configured|");
        handle.wait().await.expect("wait");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signal_death_is_reported_distinctly() {
        let mut handle = launch(&sh("kill -9 $$")).expect("launch");
        let status = handle.wait().await.expect("wait");
        assert_eq!(
            outcome_from_status(status),
            ExitOutcome::Signaled { signal: 9 }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_escalates_to_sigkill() {
        let mut handle = launch(&sh("trap '' TERM; echo ready; while :; do sleep 1; done"))
            .expect("launch");
        let mut stdout = handle.stdout.take().expect("stdout");
        let mut buf = [0u8; 16];
        let first = read_chunk(&mut stdout, &mut buf).await.expect("read");
        assert_eq!(first, ReadChunk::Data(Bytes::from_static(b"ready\n")));

        let status = handle
            .terminate(Duration::from_millis(200))
            .await
            .expect("terminate");
        assert_eq!(
            outcome_from_status(status),
            ExitOutcome::Signaled { signal: 9 }
        );
    }

    #[test]
    fn exit_report_serializes_flat_status() {
        let report = ExitReport {
            outcome: ExitOutcome::Signaled { signal: 15 },
            duration_ms: 5,
            stdout_bytes: 0,
            stderr_bytes: 2,
        };
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["status"], "signaled");
        assert_eq!(json["signal"], 15);
        let back: ExitReport = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, report);
        assert_eq!(back.outcome.exit_code(), 143);
    }
}
