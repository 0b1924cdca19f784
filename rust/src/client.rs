use std::io;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::FramedRead;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::config::InvokeConfig;
use crate::relay::frame::{self, Frame, FrameCodec};

/// Posts the form described by `config` and mirrors the streamed output.
///
/// Returns the exit code the local process should use. `Err` covers every
/// failure that happens before a stream starts.
pub async fn run(config: InvokeConfig) -> Result<i32, String> {
    let url = url::Url::parse(&config.url).map_err(|err| format!("Invalid URL {}: {err}", config.url))?;
    let client = reqwest::Client::new();
    let mut request = client.post(url.clone());
    if let Some(token) = config.token.as_deref() {
        request = request.bearer_auth(token);
    }
    request = if config.files.is_empty() {
        request.form(&config.fields)
    } else {
        request.multipart(build_multipart(&config).await?)
    };

    tracing::debug!(url = %url, fields = config.fields.len(), files = config.files.len(), "Posting form");
    let response = request
        .send()
        .await
        .map_err(|err| format!("Request to {url} failed: {err}"))?;

    let status = response.status();
    let is_stream = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with(frame::CONTENT_TYPE));
    if !status.is_success() || !is_stream {
        let body = response.text().await.unwrap_or_default();
        return Err(describe_rejection(status, &body));
    }

    let reader = StreamReader::new(response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other)));
    relay_stream(reader, tokio::io::stdout(), tokio::io::stderr(), config.quiet).await
}

async fn build_multipart(config: &InvokeConfig) -> Result<reqwest::multipart::Form, String> {
    let mut form = reqwest::multipart::Form::new();
    for (name, value) in &config.fields {
        form = form.text(name.clone(), value.clone());
    }
    for (name, path) in &config.files {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|err| format!("Failed to open {}: {err}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        let part = reqwest::multipart::Part::stream(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .file_name(file_name);
        form = form.part(name.clone(), part);
    }
    Ok(form)
}

fn describe_rejection(status: reqwest::StatusCode, body: &str) -> String {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let error = parsed.as_ref().and_then(|value| value.get("error"));
    match error {
        Some(error) => {
            let kind = error.get("kind").and_then(|v| v.as_str()).unwrap_or("error");
            let message = error.get("message").and_then(|v| v.as_str()).unwrap_or("");
            format!("{status}: {kind}: {message}")
        }
        None if body.trim().is_empty() => format!("{status}"),
        None => format!("{status}: {}", body.trim()),
    }
}

/// Decodes frames from `reader`, copying output chunks as they arrive.
pub async fn relay_stream<R, O, E>(reader: R, mut out: O, mut err: E, quiet: bool) -> Result<i32, String>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut frames = FramedRead::new(reader, FrameCodec);
    let mut exit_code = None;
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(decode_err) => {
                report(&mut err, &format!("[cmdstream] Stream broken: {decode_err}\n")).await;
                return Ok(1);
            }
        };
        match frame {
            Frame::Header(header) => {
                if !quiet {
                    report(&mut err, &format!("[cmdstream] $ {}\n", header.command_line)).await;
                }
                tracing::debug!(request_id = %header.request_id, pid = ?header.pid, "Stream started");
            }
            Frame::Stdout(bytes) => {
                if let Err(write_err) = write_chunk(&mut out, &bytes).await {
                    tracing::debug!("{write_err}");
                    return Ok(1);
                }
            }
            Frame::Stderr(bytes) => {
                if let Err(write_err) = write_chunk(&mut err, &bytes).await {
                    tracing::debug!("{write_err}");
                    return Ok(1);
                }
            }
            Frame::Trailer(report_record) => {
                if !quiet {
                    report(
                        &mut err,
                        &format!(
                            "[cmdstream] {} after {} ms\n",
                            report_record.outcome.label(),
                            report_record.duration_ms
                        ),
                    )
                    .await;
                }
                exit_code = Some(report_record.outcome.exit_code());
            }
        }
    }

    match exit_code {
        Some(code) => Ok(code),
        None => {
            report(&mut err, "[cmdstream] Stream ended without an exit record\n").await;
            Ok(1)
        }
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<(), String> {
    writer
        .write_all(bytes)
        .await
        .map_err(|err| format!("Failed to write output: {err}"))?;
    writer
        .flush()
        .await
        .map_err(|err| format!("Failed to flush output: {err}"))
}

async fn report<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) {
    let _ = write_chunk(writer, line.as_bytes()).await;
}
