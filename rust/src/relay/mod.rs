pub mod frame;
pub mod process;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::process::{ChildStderr, ChildStdout};
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

use crate::config::DisconnectPolicy;
use crate::error::ProxyError;
use crate::metrics::ServerMetrics;
use crate::support::command_spec::CommandSpec;

use self::frame::{Frame, StreamHeader};
use self::process::{
    launch, outcome_from_status, read_chunk, ExitOutcome, ExitReport, ProcessHandle, ReadChunk,
};

const CHUNK_SIZE: usize = 8 * 1024;
const FRAME_BUFFER: usize = 32;
const TRAILER_SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    pub max_runtime: Duration,
    pub kill_grace: Duration,
    pub disconnect_policy: DisconnectPolicy,
}

/// Per-request identity and the shared handles a relay reports to.
#[derive(Clone)]
pub struct RelayContext {
    pub request_id: String,
    pub endpoint: &'static str,
    pub metrics: Arc<ServerMetrics>,
    pub shutdown: CancellationToken,
    pub options: RelayOptions,
}

/// Why the relay stopped before the child finished on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    ClientGone,
    TimedOut,
    Shutdown,
}

enum Event {
    Stdout(std::io::Result<ReadChunk>),
    Stderr(std::io::Result<ReadChunk>),
    Stop(Stop),
}

#[derive(Default)]
struct Counters {
    stdout_bytes: u64,
    stderr_bytes: u64,
}

/// Launches `spec` and returns the receiving side of its frame stream.
///
/// The header frame is already queued when this returns, so the response
/// starts emitting before the child produces any output. A launch failure is
/// returned before any frame exists.
pub fn start(spec: &CommandSpec, ctx: RelayContext) -> Result<mpsc::Receiver<Frame>, ProxyError> {
    let process = match launch(spec) {
        Ok(process) => process,
        Err(err) => {
            ctx.metrics.record_error(&err);
            tracing::error!(
                request_id = %ctx.request_id,
                endpoint = ctx.endpoint,
                "{err}"
            );
            return Err(err);
        }
    };
    ctx.metrics.record_launch();

    let header = StreamHeader {
        request_id: ctx.request_id.clone(),
        endpoint: ctx.endpoint.to_string(),
        argv: spec.argv(),
        command_line: spec.command_line(),
        pid: process.pid(),
    };
    tracing::info!(
        request_id = %ctx.request_id,
        endpoint = ctx.endpoint,
        pid = ?process.pid(),
        "Launched {}",
        header.command_line
    );

    let (tx, rx) = mpsc::channel(FRAME_BUFFER);
    if tx.try_send(Frame::Header(header)).is_err() {
        tracing::warn!(request_id = %ctx.request_id, "Header frame could not be queued");
    }
    tokio::spawn(relay(process, tx, ctx));
    Ok(rx)
}

async fn relay(mut process: ProcessHandle, tx: mpsc::Sender<Frame>, ctx: RelayContext) {
    let deadline = tokio::time::sleep(ctx.options.max_runtime);
    tokio::pin!(deadline);

    let mut stdout = process.stdout.take();
    let mut stderr = process.stderr.take();
    let mut out_buf = vec![0u8; CHUNK_SIZE];
    let mut err_buf = vec![0u8; CHUNK_SIZE];
    let mut counters = Counters::default();

    let stop = loop {
        if stdout.is_none() && stderr.is_none() {
            break None;
        }
        let event = tokio::select! {
            chunk = read_optional(stdout.as_mut(), &mut out_buf) => Event::Stdout(chunk),
            chunk = read_optional(stderr.as_mut(), &mut err_buf) => Event::Stderr(chunk),
            _ = tx.closed() => Event::Stop(Stop::ClientGone),
            _ = &mut deadline => Event::Stop(Stop::TimedOut),
            _ = ctx.shutdown.cancelled() => Event::Stop(Stop::Shutdown),
        };

        let frame = match event {
            Event::Stdout(Ok(ReadChunk::Data(bytes))) => {
                counters.stdout_bytes += bytes.len() as u64;
                Frame::Stdout(bytes)
            }
            Event::Stderr(Ok(ReadChunk::Data(bytes))) => {
                counters.stderr_bytes += bytes.len() as u64;
                Frame::Stderr(bytes)
            }
            Event::Stdout(Ok(ReadChunk::Closed)) => {
                stdout = None;
                continue;
            }
            Event::Stderr(Ok(ReadChunk::Closed)) => {
                stderr = None;
                continue;
            }
            Event::Stdout(Err(err)) => {
                tracing::warn!(request_id = %ctx.request_id, "stdout read failed: {err}");
                stdout = None;
                continue;
            }
            Event::Stderr(Err(err)) => {
                tracing::warn!(request_id = %ctx.request_id, "stderr read failed: {err}");
                stderr = None;
                continue;
            }
            Event::Stop(stop) => break Some(stop),
        };

        if let Err(stop) = send_frame(&tx, frame, &mut deadline, &ctx.shutdown).await {
            break Some(stop);
        }
    };

    let stop = match stop {
        Some(stop) => stop,
        None => match wait_for_exit(&mut process, &tx, &mut deadline, &ctx.shutdown).await {
            Ok(outcome) => {
                finish(&tx, &ctx, &process, outcome, &counters).await;
                return;
            }
            Err(stop) => stop,
        },
    };

    match stop {
        Stop::ClientGone => {
            let err = ProxyError::StreamingInterrupted;
            ctx.metrics.record_error(&err);
            tracing::warn!(
                request_id = %ctx.request_id,
                endpoint = ctx.endpoint,
                pid = ?process.pid(),
                policy = ctx.options.disconnect_policy.as_str(),
                "{err}"
            );
            match ctx.options.disconnect_policy {
                DisconnectPolicy::Terminate => {
                    drop(stdout);
                    drop(stderr);
                    let outcome = terminate(&mut process, &ctx).await;
                    ctx.metrics.record_exit(&outcome).await;
                }
                DisconnectPolicy::Detach => {
                    tokio::spawn(detach(process, stdout, stderr, ctx));
                }
            }
        }
        Stop::TimedOut | Stop::Shutdown => {
            drop(stdout);
            drop(stderr);
            tracing::warn!(
                request_id = %ctx.request_id,
                endpoint = ctx.endpoint,
                pid = ?process.pid(),
                "Stopping child: {}",
                if stop == Stop::TimedOut {
                    "runtime ceiling reached"
                } else {
                    "server shutting down"
                }
            );
            terminate(&mut process, &ctx).await;
            let outcome = if stop == Stop::TimedOut {
                ExitOutcome::TimedOut
            } else {
                ExitOutcome::Shutdown
            };
            finish(&tx, &ctx, &process, outcome, &counters).await;
        }
    }
}

async fn read_optional<R>(reader: Option<&mut R>, buf: &mut [u8]) -> std::io::Result<ReadChunk>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => read_chunk(reader, buf).await,
        None => std::future::pending().await,
    }
}

async fn send_frame(
    tx: &mpsc::Sender<Frame>,
    frame: Frame,
    deadline: &mut Pin<&mut Sleep>,
    shutdown: &CancellationToken,
) -> Result<(), Stop> {
    tokio::select! {
        sent = tx.send(frame) => sent.map_err(|_| Stop::ClientGone),
        _ = deadline.as_mut() => Err(Stop::TimedOut),
        _ = shutdown.cancelled() => Err(Stop::Shutdown),
    }
}

// Both pipes are closed here, but the child may still be running.
async fn wait_for_exit(
    process: &mut ProcessHandle,
    tx: &mpsc::Sender<Frame>,
    deadline: &mut Pin<&mut Sleep>,
    shutdown: &CancellationToken,
) -> Result<ExitOutcome, Stop> {
    tokio::select! {
        status = process.wait() => Ok(match status {
            Ok(status) => outcome_from_status(status),
            Err(err) => ExitOutcome::RelayFailed {
                message: format!("failed to wait for child: {err}"),
            },
        }),
        _ = tx.closed() => Err(Stop::ClientGone),
        _ = deadline.as_mut() => Err(Stop::TimedOut),
        _ = shutdown.cancelled() => Err(Stop::Shutdown),
    }
}

async fn terminate(process: &mut ProcessHandle, ctx: &RelayContext) -> ExitOutcome {
    match process.terminate(ctx.options.kill_grace).await {
        Ok(status) => {
            let outcome = outcome_from_status(status);
            tracing::info!(
                request_id = %ctx.request_id,
                pid = ?process.pid(),
                outcome = outcome.label(),
                "Child terminated"
            );
            outcome
        }
        Err(err) => {
            tracing::error!(
                request_id = %ctx.request_id,
                pid = ?process.pid(),
                "Failed to terminate child: {err}"
            );
            ExitOutcome::RelayFailed {
                message: err.to_string(),
            }
        }
    }
}

async fn finish(
    tx: &mpsc::Sender<Frame>,
    ctx: &RelayContext,
    process: &ProcessHandle,
    outcome: ExitOutcome,
    counters: &Counters,
) {
    if let ExitOutcome::Signaled { signal } = outcome {
        tracing::warn!(
            request_id = %ctx.request_id,
            endpoint = ctx.endpoint,
            "{}",
            ProxyError::ChildSignaled { signal }
        );
    }
    tracing::info!(
        request_id = %ctx.request_id,
        endpoint = ctx.endpoint,
        pid = ?process.pid(),
        outcome = outcome.label(),
        exit_code = outcome.exit_code(),
        stdout_bytes = counters.stdout_bytes,
        stderr_bytes = counters.stderr_bytes,
        "Relay finished"
    );
    ctx.metrics.record_exit(&outcome).await;

    let report = ExitReport {
        outcome,
        duration_ms: process.elapsed().as_millis() as u64,
        stdout_bytes: counters.stdout_bytes,
        stderr_bytes: counters.stderr_bytes,
    };
    if tx
        .send_timeout(Frame::Trailer(report), TRAILER_SEND_TIMEOUT)
        .await
        .is_err()
    {
        let err = ProxyError::StreamingInterrupted;
        ctx.metrics.record_error(&err);
        tracing::warn!(request_id = %ctx.request_id, "{err} before the exit record");
    }
}

// Keeps draining the pipes so the child never blocks on a full buffer.
async fn detach(
    mut process: ProcessHandle,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    ctx: RelayContext,
) {
    let drain_stdout = async {
        if let Some(mut stdout) = stdout {
            let _ = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await;
        }
    };
    let drain_stderr = async {
        if let Some(mut stderr) = stderr {
            let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
        }
    };

    let remaining = ctx.options.max_runtime.saturating_sub(process.elapsed());
    let run = async {
        tokio::join!(drain_stdout, drain_stderr);
        process.wait().await
    };
    let outcome = tokio::select! {
        status = run => match status {
            Ok(status) => outcome_from_status(status),
            Err(err) => ExitOutcome::RelayFailed { message: err.to_string() },
        },
        _ = tokio::time::sleep(remaining) => ExitOutcome::TimedOut,
        _ = ctx.shutdown.cancelled() => ExitOutcome::Shutdown,
    };
    if matches!(outcome, ExitOutcome::TimedOut | ExitOutcome::Shutdown) {
        terminate(&mut process, &ctx).await;
    }
    tracing::info!(
        request_id = %ctx.request_id,
        endpoint = ctx.endpoint,
        pid = ?process.pid(),
        outcome = outcome.label(),
        "Detached child finished"
    );
    ctx.metrics.record_exit(&outcome).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn options(max_runtime: Duration, policy: DisconnectPolicy) -> RelayOptions {
        RelayOptions {
            max_runtime,
            kill_grace: Duration::from_millis(500),
            disconnect_policy: policy,
        }
    }

    fn context(options: RelayOptions) -> (RelayContext, Arc<ServerMetrics>, CancellationToken) {
        let metrics = Arc::new(ServerMetrics::default());
        let shutdown = CancellationToken::new();
        let ctx = RelayContext {
            request_id: "req-test".to_string(),
            endpoint: "test",
            metrics: metrics.clone(),
            shutdown: shutdown.clone(),
            options,
        };
        (ctx, metrics, shutdown)
    }

    fn sh(script: &str) -> CommandSpec {
        let mut spec = CommandSpec::new("/bin/sh").arg("-c").arg(script);
        if let Ok(path) = std::env::var("PATH") {
            spec.env.insert("PATH".to_string(), path);
        }
        spec
    }

    struct Collected {
        header: StreamHeader,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        order: Vec<&'static str>,
        trailer: ExitReport,
    }

    async fn collect(mut rx: mpsc::Receiver<Frame>) -> Collected {
        let mut header = None;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut order = Vec::new();
        let mut trailer = None;
        while let Some(frame) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("relay stalled")
        {
            match frame {
                Frame::Header(h) => {
                    assert!(header.is_none(), "duplicate header");
                    header = Some(h);
                }
                Frame::Stdout(bytes) => {
                    order.push("stdout");
                    stdout.extend_from_slice(&bytes);
                }
                Frame::Stderr(bytes) => {
                    order.push("stderr");
                    stderr.extend_from_slice(&bytes);
                }
                Frame::Trailer(report) => {
                    assert!(trailer.is_none(), "duplicate trailer");
                    trailer = Some(report);
                }
            }
        }
        Collected {
            header: header.expect("header frame"),
            stdout,
            stderr,
            order,
            trailer: trailer.expect("trailer frame"),
        }
    }

    // An orphaned child stays a zombie until init reaps it; that counts as gone.
    fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                .is_some_and(|state| state != "Z" && state != "X"),
            Err(_) => false,
        }
    }

    async fn wait_until_gone(pid: u32, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while is_running(pid) {
            assert!(
                Instant::now() < deadline,
                "process {pid} still running after {timeout:?}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn ok_output_and_zero_exit() {
        let (ctx, metrics, _) = context(options(Duration::from_secs(10), DisconnectPolicy::Terminate));
        let spec = CommandSpec::new("/usr/bin/printf").arg("OK\\n");
        let rx = start(&spec, ctx).expect("start");
        let collected = collect(rx).await;

        assert_eq!(collected.header.argv, vec!["/usr/bin/printf", "OK\\n"]);
        assert_eq!(collected.stdout, b"OK\n");
        assert!(collected.stderr.is_empty());
        assert_eq!(collected.trailer.outcome, ExitOutcome::Exited { code: 0 });
        assert_eq!(collected.trailer.stdout_bytes, 3);
        assert_eq!(metrics.launches(), 1);
    }

    #[tokio::test]
    async fn zero_bytes_do_not_end_the_relay() {
        let (ctx, _, _) = context(options(Duration::from_secs(10), DisconnectPolicy::Terminate));
        let rx = start(&sh(r"printf '0\000'; sleep 0.1; printf '0\000tail'"), ctx).expect("start");
        let collected = collect(rx).await;
        assert_eq!(collected.stdout, b"0\x000\x00tail");
        assert_eq!(collected.trailer.outcome, ExitOutcome::Exited { code: 0 });
    }

    #[tokio::test]
    async fn stderr_is_relayed_as_its_own_frames() {
        let (ctx, _, _) = context(options(Duration::from_secs(10), DisconnectPolicy::Terminate));
        let script = "echo out1; sleep 0.1; echo err1 >&2; sleep 0.1; echo out2; exit 3";
        let collected = collect(start(&sh(script), ctx).expect("start")).await;
        assert_eq!(collected.stdout, b"out1\nout2\n");
        assert_eq!(collected.stderr, b"err1\n");
        assert_eq!(collected.order, vec!["stdout", "stderr", "stdout"]);
        assert_eq!(collected.trailer.outcome, ExitOutcome::Exited { code: 3 });
    }

    #[tokio::test]
    async fn launch_failure_produces_no_stream() {
        let (ctx, metrics, _) = context(options(Duration::from_secs(10), DisconnectPolicy::Terminate));
        let err = start(&CommandSpec::new("/nonexistent/do_bamcheck.sh"), ctx)
            .expect_err("launch should fail");
        assert!(matches!(err, ProxyError::LaunchFailed { .. }));
        assert_eq!(metrics.launches(), 0);
        assert_eq!(metrics.snapshot().await.launch_failed_total, 1);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn disconnect_terminates_the_child() {
        let (ctx, metrics, _) = context(options(Duration::from_secs(60), DisconnectPolicy::Terminate));
        let mut rx = start(&sh("echo started; exec sleep 30"), ctx).expect("start");
        let Some(Frame::Header(header)) = rx.recv().await else {
            panic!("expected header frame first");
        };
        let pid = header.pid.expect("pid");
        let Some(Frame::Stdout(first)) = rx.recv().await else {
            panic!("expected stdout frame");
        };
        assert_eq!(&first[..], b"started\n");

        drop(rx);
        wait_until_gone(pid, Duration::from_secs(5)).await;
        assert_eq!(metrics.snapshot().await.streaming_interrupted_total, 1);
    }

    fn background_pid(stdout: &[u8]) -> u32 {
        std::str::from_utf8(stdout)
            .expect("utf8 pid")
            .trim()
            .parse()
            .expect("numeric pid")
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn disconnect_terminates_background_children() {
        let (ctx, metrics, _) = context(options(Duration::from_secs(60), DisconnectPolicy::Terminate));
        let mut rx = start(&sh("sleep 30 & echo $!"), ctx).expect("start");
        assert!(matches!(rx.recv().await, Some(Frame::Header(_))));
        let Some(Frame::Stdout(line)) = rx.recv().await else {
            panic!("expected stdout frame");
        };
        let sleeper = background_pid(&line);

        drop(rx);
        wait_until_gone(sleeper, Duration::from_secs(5)).await;
        assert_eq!(metrics.snapshot().await.streaming_interrupted_total, 1);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn runtime_ceiling_stops_background_children() {
        let (ctx, _, _) = context(options(Duration::from_millis(300), DisconnectPolicy::Terminate));
        let collected = collect(start(&sh("sleep 30 & echo $!"), ctx).expect("start")).await;
        assert_eq!(collected.trailer.outcome, ExitOutcome::TimedOut);
        wait_until_gone(background_pid(&collected.stdout), Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn detached_child_runs_to_completion() {
        let (ctx, metrics, _) = context(options(Duration::from_secs(60), DisconnectPolicy::Detach));
        let mut rx = start(&sh("sleep 0.3; echo done"), ctx).expect("start");
        assert!(matches!(rx.recv().await, Some(Frame::Header(_))));
        drop(rx);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = metrics.snapshot().await;
            if snapshot.exits.get("exited_ok") == Some(&1) {
                assert_eq!(snapshot.streaming_interrupted_total, 1);
                break;
            }
            assert!(Instant::now() < deadline, "detached child never finished");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn runtime_ceiling_stops_the_child() {
        let (ctx, _, _) = context(options(Duration::from_millis(300), DisconnectPolicy::Terminate));
        let started = Instant::now();
        let collected = collect(start(&sh("echo begin; exec sleep 30"), ctx).expect("start")).await;
        assert_eq!(collected.stdout, b"begin\n");
        assert_eq!(collected.trailer.outcome, ExitOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn shutdown_stops_the_child_with_a_trailer() {
        let (ctx, _, shutdown) = context(options(Duration::from_secs(60), DisconnectPolicy::Terminate));
        let rx = start(&sh("exec sleep 30"), ctx).expect("start");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            shutdown.cancel();
        });
        let collected = collect(rx).await;
        assert_eq!(collected.trailer.outcome, ExitOutcome::Shutdown);
    }
}
