use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::http::StatusCode;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::ProxyError;
use crate::relay::process::ExitOutcome;

#[derive(Debug, Default)]
pub struct ServerMetrics {
    requests_total: AtomicU64,
    invalid_argument_total: AtomicU64,
    launch_failed_total: AtomicU64,
    upload_failed_total: AtomicU64,
    launches_total: AtomicU64,
    streaming_interrupted_total: AtomicU64,
    exits: Mutex<BTreeMap<String, u64>>,
    route_requests: Mutex<BTreeMap<String, u64>>,
    status_counts: Mutex<BTreeMap<u16, u64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub invalid_argument_total: u64,
    pub launch_failed_total: u64,
    pub upload_failed_total: u64,
    pub launches_total: u64,
    pub streaming_interrupted_total: u64,
    pub exits: BTreeMap<String, u64>,
    pub route_requests: BTreeMap<String, u64>,
    pub status_counts: BTreeMap<String, u64>,
}

impl ServerMetrics {
    pub async fn record_request(&self, route: &str, status: StatusCode) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let mut routes = self.route_requests.lock().await;
        *routes.entry(route.to_string()).or_insert(0) += 1;
        drop(routes);

        let mut statuses = self.status_counts.lock().await;
        *statuses.entry(status.as_u16()).or_insert(0) += 1;
    }

    pub fn record_error(&self, err: &ProxyError) {
        let counter = match err {
            ProxyError::InvalidArgument { .. } => &self.invalid_argument_total,
            ProxyError::LaunchFailed { .. } => &self.launch_failed_total,
            ProxyError::UploadFailed(_) => &self.upload_failed_total,
            ProxyError::StreamingInterrupted => &self.streaming_interrupted_total,
            ProxyError::ChildSignaled { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_launch(&self) {
        self.launches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn launches(&self) -> u64 {
        self.launches_total.load(Ordering::Relaxed)
    }

    pub async fn record_exit(&self, outcome: &ExitOutcome) {
        let mut exits = self.exits.lock().await;
        *exits.entry(outcome.label().to_string()).or_insert(0) += 1;
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let exits = self.exits.lock().await.clone();
        let route_requests = self.route_requests.lock().await.clone();
        let status_counts = self.status_counts.lock().await.clone();

        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            invalid_argument_total: self.invalid_argument_total.load(Ordering::Relaxed),
            launch_failed_total: self.launch_failed_total.load(Ordering::Relaxed),
            upload_failed_total: self.upload_failed_total.load(Ordering::Relaxed),
            launches_total: self.launches_total.load(Ordering::Relaxed),
            streaming_interrupted_total: self.streaming_interrupted_total.load(Ordering::Relaxed),
            exits,
            route_requests,
            status_counts: status_counts
                .into_iter()
                .map(|(status, count)| (status.to_string(), count))
                .collect(),
        }
    }
}

pub fn render_prometheus(snapshot: &MetricsSnapshot) -> String {
    let mut lines = Vec::new();
    let counters = [
        (
            "cmdstream_requests_total",
            "Total HTTP requests.",
            snapshot.requests_total,
        ),
        (
            "cmdstream_invalid_argument_total",
            "Requests rejected by argument validation.",
            snapshot.invalid_argument_total,
        ),
        (
            "cmdstream_launch_failed_total",
            "Child processes that failed to start.",
            snapshot.launch_failed_total,
        ),
        (
            "cmdstream_upload_failed_total",
            "Uploads that could not be staged.",
            snapshot.upload_failed_total,
        ),
        (
            "cmdstream_launches_total",
            "Child processes started.",
            snapshot.launches_total,
        ),
        (
            "cmdstream_streaming_interrupted_total",
            "Streams abandoned by the client.",
            snapshot.streaming_interrupted_total,
        ),
    ];
    for (name, help, value) in counters {
        lines.push(format!("# HELP {name} {help}"));
        lines.push(format!("# TYPE {name} counter"));
        lines.push(format!("{name} {value}"));
    }

    lines.push("# HELP cmdstream_exits_total Finished relays by outcome.".to_string());
    lines.push("# TYPE cmdstream_exits_total counter".to_string());
    for (outcome, count) in &snapshot.exits {
        lines.push(format!(
            "cmdstream_exits_total{{outcome=\"{}\"}} {}",
            prometheus_escape(outcome),
            count
        ));
    }

    lines.push("# HELP cmdstream_route_requests_total Requests per route.".to_string());
    lines.push("# TYPE cmdstream_route_requests_total counter".to_string());
    for (route, count) in &snapshot.route_requests {
        lines.push(format!(
            "cmdstream_route_requests_total{{route=\"{}\"}} {}",
            prometheus_escape(route),
            count
        ));
    }

    lines.push("# HELP cmdstream_status_total Requests by HTTP status.".to_string());
    lines.push("# TYPE cmdstream_status_total counter".to_string());
    for (status, count) in &snapshot.status_counts {
        lines.push(format!(
            "cmdstream_status_total{{status=\"{}\"}} {}",
            prometheus_escape(status),
            count
        ));
    }

    lines.join("\n") + "\n"
}

fn prometheus_escape(input: &str) -> String {
    input.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_tracks_routes_statuses_and_outcomes() {
        let metrics = ServerMetrics::default();
        metrics
            .record_request("/v1/bamcheck", StatusCode::OK)
            .await;
        metrics
            .record_request("/v1/bamcheck", StatusCode::BAD_REQUEST)
            .await;
        metrics.record_error(&ProxyError::invalid("filename", "bad"));
        metrics.record_launch();
        metrics
            .record_exit(&ExitOutcome::Exited { code: 0 })
            .await;
        metrics
            .record_exit(&ExitOutcome::Signaled { signal: 9 })
            .await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.invalid_argument_total, 1);
        assert_eq!(snapshot.launches_total, 1);
        assert_eq!(snapshot.route_requests["/v1/bamcheck"], 2);
        assert_eq!(snapshot.status_counts["400"], 1);
        assert_eq!(snapshot.exits["exited_ok"], 1);
        assert_eq!(snapshot.exits["signaled"], 1);
    }

    #[tokio::test]
    async fn prometheus_render_includes_counters_and_labels() {
        let metrics = ServerMetrics::default();
        metrics.record_launch();
        metrics.record_error(&ProxyError::StreamingInterrupted);
        metrics.record_exit(&ExitOutcome::TimedOut).await;
        metrics
            .record_request("/v1/panel-data", StatusCode::OK)
            .await;

        let rendered = render_prometheus(&metrics.snapshot().await);
        assert!(rendered.contains("cmdstream_launches_total 1"));
        assert!(rendered.contains("cmdstream_streaming_interrupted_total 1"));
        assert!(rendered.contains("outcome=\"timed_out\""));
        assert!(rendered.contains("route=\"/v1/panel-data\""));
    }
}
