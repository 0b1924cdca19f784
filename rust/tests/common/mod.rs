#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};

pub const FRAME_CONTENT_TYPE: &str = "application/vnd.cmdstream.frames";

pub fn find_free_port() -> u16 {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .expect("failed to bind local test port")
        .local_addr()
        .expect("failed to read local address")
        .port()
}

/// A running `cmdstream serve` bound to a free loopback port.
pub struct TestServer {
    pub child: Child,
    pub base_url: String,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub async fn metrics(&self) -> serde_json::Value {
        reqwest::Client::new()
            .get(self.url("/v1/metrics"))
            .send()
            .await
            .expect("metrics request")
            .json()
            .await
            .expect("metrics json")
    }

    pub async fn stop(mut self) {
        stop_child(&mut self.child).await;
    }
}

pub async fn start_server(work_dir: &Path, extra_args: &[&str]) -> TestServer {
    let port = find_free_port();
    let port_arg = port.to_string();
    let staging = work_dir.join("staging");
    let staging_arg = staging.to_string_lossy().into_owned();

    let mut args = vec![
        "serve",
        "--port",
        port_arg.as_str(),
        "--logLevel",
        "none",
        "--healthEndpoint",
        "/healthz",
        "--stagingDir",
        staging_arg.as_str(),
    ];
    args.extend_from_slice(extra_args);

    let child = spawn_cmdstream(&args, &work_dir.join("cmdstream.ndjson"));
    let base_url = format!("http://127.0.0.1:{port}");
    wait_for_http_status(
        &format!("{base_url}/healthz"),
        reqwest::StatusCode::OK,
        Duration::from_secs(10),
    )
    .await;
    TestServer { child, base_url }
}

pub fn spawn_cmdstream(args: &[&str], log_path: &Path) -> Child {
    let mut cmd = Command::new(cmdstream_exe_path());
    cmd.args(args)
        .env_remove("PORT")
        .env_remove("RUST_LOG")
        .env("CMDSTREAM_LOG_PATH", log_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    cmd.spawn().expect("failed to spawn cmdstream")
}

pub fn cmdstream_exe_path() -> PathBuf {
    if let Ok(exe) = std::env::var("CARGO_BIN_EXE_cmdstream") {
        return PathBuf::from(exe);
    }

    let current = std::env::current_exe().expect("failed to read current test binary path");
    let target_dir = current
        .parent()
        .and_then(|path| path.parent())
        .expect("failed to derive target/debug directory from test binary path");
    let fallback = target_dir.join(format!("cmdstream{}", std::env::consts::EXE_SUFFIX));
    assert!(
        fallback.exists(),
        "cmdstream binary not found at {}",
        fallback.display()
    );
    fallback
}

/// Writes an executable `/bin/sh` script and returns its path as a string.
pub fn write_script(dir: &Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod script");
    path.to_string_lossy().into_owned()
}

pub async fn stop_child(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(_)) => {}
        Ok(None) | Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

pub async fn wait_for_http_status(url: &str, expected: reqwest::StatusCode, timeout: Duration) {
    let client = reqwest::Client::new();
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(response) = client.get(url).send().await {
            if response.status() == expected {
                return;
            }
        }

        assert!(
            Instant::now() < deadline,
            "timed out waiting for {url} to return status {expected}"
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub async fn wait_for_condition<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }

        assert!(Instant::now() < deadline, "timed out waiting for condition");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Header(serde_json::Value),
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Trailer(serde_json::Value),
}

/// Splits `buf` into complete frames, leaving any partial frame in place.
pub fn drain_frames(buf: &mut Vec<u8>) -> Vec<WireFrame> {
    let mut frames = Vec::new();
    while buf.len() >= 5 {
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if buf.len() < 5 + len {
            break;
        }
        let tag = buf[0];
        let payload: Vec<u8> = buf[5..5 + len].to_vec();
        buf.drain(..5 + len);
        frames.push(match tag {
            0x01 => WireFrame::Header(serde_json::from_slice(&payload).expect("header json")),
            0x02 => WireFrame::Stdout(payload),
            0x03 => WireFrame::Stderr(payload),
            0x04 => WireFrame::Trailer(serde_json::from_slice(&payload).expect("trailer json")),
            other => panic!("unknown frame tag 0x{other:02x}"),
        });
    }
    frames
}

/// A fully decoded stream.
#[derive(Debug)]
pub struct Transcript {
    pub header: serde_json::Value,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub trailer: serde_json::Value,
}

pub fn decode_transcript(body: &[u8]) -> Transcript {
    let mut buf = body.to_vec();
    let frames = drain_frames(&mut buf);
    assert!(buf.is_empty(), "stream ended inside a frame");

    let mut header = None;
    let mut trailer = None;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    for (index, frame) in frames.iter().enumerate() {
        match frame {
            WireFrame::Header(value) => {
                assert_eq!(index, 0, "header must be the first frame");
                header = Some(value.clone());
            }
            WireFrame::Stdout(bytes) => stdout.extend_from_slice(bytes),
            WireFrame::Stderr(bytes) => stderr.extend_from_slice(bytes),
            WireFrame::Trailer(value) => {
                assert_eq!(index, frames.len() - 1, "trailer must be the last frame");
                trailer = Some(value.clone());
            }
        }
    }
    Transcript {
        header: header.expect("missing header frame"),
        stdout,
        stderr,
        trailer: trailer.expect("missing trailer frame"),
    }
}
