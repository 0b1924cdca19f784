use std::fmt;
use std::path::{Path, PathBuf};

use futures::{Stream, StreamExt};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::bytes::Bytes;
use uuid::Uuid;

use crate::error::ProxyError;

const MAX_PREFIX_LEN: usize = 64;
const UPLOAD_EXTENSION: &str = "bed";

/// Directory where uploads wait for the batch job that consumes them.
///
/// Staged files are left in place after the request completes; the
/// submitted job reads them long after the HTTP exchange is over.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Streams `chunks` into a fresh `<prefix>-<uuid>.bed` file.
    ///
    /// `field` names the form part in the error returned for an empty upload.
    pub async fn stage<S, E>(
        &self,
        field: &'static str,
        original_name: Option<&str>,
        chunks: S,
    ) -> Result<PathBuf, ProxyError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display,
    {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|err| {
            ProxyError::UploadFailed(format!("cannot create {}: {err}", self.dir.display()))
        })?;

        let (path, mut file) = self.create_unique(original_name).await?;
        match write_chunks(&mut file, chunks).await {
            Ok(0) => {
                discard(&path).await;
                Err(ProxyError::invalid(field, "upload is empty"))
            }
            Ok(written) => {
                tracing::debug!(path = %path.display(), bytes = written, "Upload staged");
                Ok(path)
            }
            Err(err) => {
                discard(&path).await;
                Err(err)
            }
        }
    }

    async fn create_unique(&self, original_name: Option<&str>) -> Result<(PathBuf, File), ProxyError> {
        let prefix = staged_prefix(original_name);
        let path = self
            .dir
            .join(format!("{prefix}-{}.{UPLOAD_EXTENSION}", Uuid::new_v4()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|err| {
                ProxyError::UploadFailed(format!("cannot create {}: {err}", path.display()))
            })?;
        Ok((path, file))
    }
}

async fn write_chunks<S, E>(file: &mut File, chunks: S) -> Result<u64, ProxyError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: fmt::Display,
{
    tokio::pin!(chunks);
    let mut written = 0u64;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|err| ProxyError::UploadFailed(format!("read failed: {err}")))?;
        file.write_all(&chunk)
            .await
            .map_err(|err| ProxyError::UploadFailed(format!("write failed: {err}")))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .map_err(|err| ProxyError::UploadFailed(format!("flush failed: {err}")))?;
    Ok(written)
}

async fn discard(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        tracing::warn!(path = %path.display(), "Failed to remove staged upload: {err}");
    }
}

/// Filesystem-safe stem of the client's file name, `upload` when nothing is left.
fn staged_prefix(original_name: Option<&str>) -> String {
    let name = original_name
        .and_then(|name| name.rsplit(['/', '\\']).next())
        .unwrap_or_default();
    let stem = name.strip_suffix(".bed").unwrap_or(name);
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_PREFIX_LEN)
        .collect();
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}
