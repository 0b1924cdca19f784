use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

const MAX_LOG_FILE_BYTES: u64 = 20 * 1024 * 1024;

/// One NDJSON line. Events emitted while serving a request carry its id and
/// endpoint at the top level so `logs tail` can filter without digging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredLogRecord {
    pub ts: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

pub struct LogFileLayer {
    writer: Arc<Mutex<BufWriter<File>>>,
    mode: String,
}

pub fn default_log_path() -> PathBuf {
    if let Some(path) = std::env::var_os("CMDSTREAM_LOG_PATH") {
        return PathBuf::from(path);
    }
    if let Some(home) = user_home_dir() {
        return home
            .join(".cmdstream")
            .join("logs")
            .join("cmdstream.ndjson");
    }
    PathBuf::from(".cmdstream/logs/cmdstream.ndjson")
}

fn user_home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

pub fn ensure_log_file(path: &Path) -> Result<(), String> {
    let _ = prepare_log_file(path)?;
    Ok(())
}

pub fn build_log_file_layer(mode: &str) -> Result<LogFileLayer, String> {
    build_log_file_layer_at(&default_log_path(), mode)
}

pub fn build_log_file_layer_at(path: &Path, mode: &str) -> Result<LogFileLayer, String> {
    let file = prepare_log_file(path)?;
    Ok(LogFileLayer {
        writer: Arc::new(Mutex::new(BufWriter::new(file))),
        mode: mode.to_string(),
    })
}

pub fn parse_record(line: &str) -> Option<StoredLogRecord> {
    serde_json::from_str::<StoredLogRecord>(line).ok()
}

fn prepare_log_file(path: &Path) -> Result<File, String> {
    let parent = path
        .parent()
        .ok_or_else(|| format!("Invalid log file path: {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .map_err(|err| format!("Failed to create {}: {err}", parent.display()))?;

    if let Ok(meta) = std::fs::metadata(path) {
        if meta.len() > MAX_LOG_FILE_BYTES {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .map_err(|err| format!("Failed to truncate {}: {err}", path.display()))?;
        }
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| format!("Failed to open {}: {err}", path.display()))
}

#[derive(Default)]
struct RequestEventVisitor {
    message: Option<String>,
    request_id: Option<String>,
    endpoint: Option<String>,
    fields: BTreeMap<String, String>,
}

impl RequestEventVisitor {
    fn put(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            "request_id" => self.request_id = Some(value),
            "endpoint" => self.endpoint = Some(value),
            name => {
                self.fields.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for RequestEventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.to_string());
    }

    // `%value` fields and the formatted message arrive here.
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, format!("{value:?}"));
    }
}

impl<S> Layer<S> for LogFileLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = RequestEventVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        let record = StoredLogRecord {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level: metadata.level().as_str().to_ascii_lowercase(),
            target: metadata.target().to_string(),
            message: visitor.message.unwrap_or_default(),
            mode: self.mode.clone(),
            request_id: visitor.request_id,
            endpoint: visitor.endpoint,
            fields: visitor.fields,
        };

        let Ok(line) = serde_json::to_string(&record) else {
            return;
        };

        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        if writeln!(&mut *writer, "{line}").is_ok() {
            let _ = writer.flush();
        }
    }
}
