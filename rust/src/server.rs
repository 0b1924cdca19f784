use std::sync::Arc;

use axum::body::Body;
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::FormRejection;
use axum::extract::{DefaultBodyLimit, MatchedPath, Multipart, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use futures::StreamExt;
use regex::Regex;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

use crate::config::{CorsConfig, ServeConfig};
use crate::endpoints::bamcheck::{self, BamcheckRequest};
use crate::endpoints::coverage_matrix::{self, CoverageMatrixRequest};
use crate::endpoints::panel_data::{self, PanelDataRequest};
use crate::endpoints::prepare;
use crate::error::ProxyError;
use crate::metrics::{render_prometheus, ServerMetrics};
use crate::relay::{self, frame, RelayContext, RelayOptions};
use crate::staging::StagingArea;
use crate::support::command_spec::CommandSpec;
use crate::support::signals::shutdown_signal;
use crate::validate::FieldMap;

pub const PANEL_DATA_PATH: &str = "/v1/panel-data";
pub const BAMCHECK_PATH: &str = "/v1/bamcheck";
pub const COVERAGE_MATRIX_PATH: &str = "/v1/coverage-matrix";
// Metrics label for requests that matched no route.
const UNMATCHED_ROUTE: &str = "unmatched";

#[derive(Clone)]
pub struct AppState {
    config: Arc<ServeConfig>,
    metrics: Arc<ServerMetrics>,
    staging: StagingArea,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: ServeConfig, shutdown: CancellationToken) -> Self {
        Self {
            staging: StagingArea::new(config.staging_dir.clone()),
            config: Arc::new(config),
            metrics: Arc::new(ServerMetrics::default()),
            shutdown,
        }
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    fn reject(&self, endpoint: &'static str, err: ProxyError) -> ProxyError {
        self.metrics.record_error(&err);
        tracing::warn!(endpoint, "{err}");
        err
    }

    fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            max_runtime: self.config.max_runtime,
            kill_grace: self.config.kill_grace,
            disconnect_policy: self.config.disconnect_policy,
        }
    }

    /// Launches `spec` and turns its frame channel into a streaming body.
    fn stream(&self, endpoint: &'static str, spec: CommandSpec) -> Result<Response, ProxyError> {
        let request_id = Uuid::new_v4().to_string();
        let ctx = RelayContext {
            request_id: request_id.clone(),
            endpoint,
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.clone(),
            options: self.relay_options(),
        };
        let rx = relay::start(&spec, ctx)?;
        let body = Body::from_stream(ReceiverStream::new(rx).map(|frame| frame.to_bytes()));

        let mut response = body.into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(frame::CONTENT_TYPE),
        );
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        );
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("identity"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert("x-request-id", value);
        }
        Ok(response)
    }
}

pub async fn run(config: ServeConfig) -> Result<(), String> {
    tracing::info!("Starting...");
    tracing::info!("  - host: {}", config.host);
    tracing::info!("  - port: {}", config.port);
    tracing::info!("  - panelDataScript: {}", config.scripts.panel_data);
    tracing::info!("  - bamcheckScript: {}", config.scripts.bamcheck);
    tracing::info!("  - coverageMatrixScript: {}", config.scripts.coverage_matrix);
    tracing::info!("  - sbatch: {}", config.scheduler.program);
    tracing::info!("  - stagingDir: {}", config.staging_dir.display());
    tracing::info!("  - maxRuntimeSecs: {}", config.max_runtime.as_secs());
    tracing::info!("  - disconnectPolicy: {}", config.disconnect_policy.as_str());
    tracing::info!(
        "  - auth: {}",
        if config.auth_token.is_some() {
            "bearer token"
        } else {
            "disabled"
        }
    );
    if !config.health_endpoints.is_empty() {
        tracing::info!("  - healthEndpoints: {:?}", config.health_endpoints);
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| format!("Failed to bind {addr}: {err}"))?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| format!("Failed to read listener address: {err}"))?;

    let shutdown = CancellationToken::new();
    let app = build_app(AppState::new(config, shutdown.clone()));

    tracing::info!("Listening on http://{local_addr}");
    axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .map_err(|err| format!("Server error: {err}"))
}

pub fn build_app(state: AppState) -> Router {
    let mut router = Router::new()
        .route(PANEL_DATA_PATH, post(handle_panel_data))
        .route(BAMCHECK_PATH, post(handle_bamcheck))
        .route(COVERAGE_MATRIX_PATH, post(handle_coverage_matrix))
        .route("/v1/metrics", get(metrics_json))
        .route("/v1/metrics.prom", get(metrics_prometheus));
    for path in &state.config.health_endpoints {
        router = router.route(path, get(health));
    }

    let mut router = router
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            authorize_and_record_request,
        ))
        .with_state(state.clone());
    if let Some(cors) = cors_layer(&state.config.cors) {
        router = router.layer(cors);
    }
    router
}

async fn authorize_and_record_request(
    State(state): State<AppState>,
    req: axum::http::Request<Body>,
    next: Next,
) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());

    let protected = req.uri().path().starts_with("/v1/");
    let response = match state.config.auth_token.as_deref() {
        Some(expected) if protected && !matches_bearer_token(req.headers(), expected) => {
            json_error(StatusCode::UNAUTHORIZED, "missing or invalid bearer token")
        }
        _ => next.run(req).await,
    };

    state
        .metrics
        .record_request(&route, response.status())
        .await;
    response
}

fn matches_bearer_token(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .is_some_and(|actual| actual.trim() == expected)
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": {
                "kind": "unauthorized",
                "message": message,
            }
        })),
    )
        .into_response()
}

fn cors_layer(cors: &CorsConfig) -> Option<CorsLayer> {
    let origin = match cors {
        CorsConfig::Disabled => return None,
        CorsConfig::AllowAll => AllowOrigin::from(Any),
        CorsConfig::AllowList { raw } => {
            let mut exact = Vec::new();
            let mut patterns = Vec::new();
            for entry in raw {
                if let Some(pattern) = entry.strip_prefix('/').and_then(|e| e.strip_suffix('/')) {
                    match Regex::new(pattern) {
                        Ok(regex) => patterns.push(regex),
                        Err(err) => tracing::warn!("Ignoring invalid CORS pattern {entry}: {err}"),
                    }
                } else {
                    match HeaderValue::from_str(entry) {
                        Ok(value) => exact.push(value),
                        Err(err) => tracing::warn!("Ignoring invalid CORS origin {entry}: {err}"),
                    }
                }
            }
            AllowOrigin::predicate(move |origin: &HeaderValue, _parts| {
                exact.contains(origin)
                    || origin
                        .to_str()
                        .is_ok_and(|origin| patterns.iter().any(|p| p.is_match(origin)))
            })
        }
    };
    Some(
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(Any),
    )
}

fn form_fields(
    state: &AppState,
    endpoint: &'static str,
    form: Result<Form<FieldMap>, FormRejection>,
) -> Result<FieldMap, ProxyError> {
    form.map(|Form(fields)| fields)
        .map_err(|rejection| state.reject(endpoint, ProxyError::invalid("body", rejection.body_text())))
}

async fn handle_panel_data(
    State(state): State<AppState>,
    form: Result<Form<FieldMap>, FormRejection>,
) -> Result<Response, ProxyError> {
    let fields = form_fields(&state, panel_data::NAME, form)?;
    let request = PanelDataRequest::from_fields(&fields)
        .map_err(|err| state.reject(panel_data::NAME, err))?;
    let spec = prepare(request.command(&state.config.scripts), &state.config);
    state.stream(panel_data::NAME, spec)
}

async fn handle_bamcheck(
    State(state): State<AppState>,
    form: Result<Form<FieldMap>, FormRejection>,
) -> Result<Response, ProxyError> {
    let fields = form_fields(&state, bamcheck::NAME, form)?;
    let request =
        BamcheckRequest::from_fields(&fields).map_err(|err| state.reject(bamcheck::NAME, err))?;
    let spec = prepare(request.command(&state.config.scripts), &state.config);
    state.stream(bamcheck::NAME, spec)
}

async fn handle_coverage_matrix(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ProxyError> {
    const NAME: &str = coverage_matrix::NAME;

    let mut multipart = multipart
        .map_err(|rejection| state.reject(NAME, ProxyError::invalid("body", rejection.body_text())))?;
    let mut fields = FieldMap::new();
    let mut staged = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                discard_staged(staged.as_deref()).await;
                return Err(state.reject(NAME, ProxyError::invalid("body", err.body_text())));
            }
        };
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if name == coverage_matrix::UPLOAD_FIELD {
            if staged.is_some() {
                discard_staged(staged.as_deref()).await;
                return Err(state.reject(
                    NAME,
                    ProxyError::invalid(coverage_matrix::UPLOAD_FIELD, "sent more than once"),
                ));
            }
            let original_name = field.file_name().map(str::to_string);
            let path = state
                .staging
                .stage(coverage_matrix::UPLOAD_FIELD, original_name.as_deref(), field)
                .await
                .map_err(|err| state.reject(NAME, err))?;
            staged = Some(path);
        } else {
            match field.text().await {
                Ok(value) => {
                    fields.insert(name, value);
                }
                Err(err) => {
                    discard_staged(staged.as_deref()).await;
                    return Err(state.reject(NAME, ProxyError::invalid("body", err.body_text())));
                }
            }
        }
    }

    let request = match CoverageMatrixRequest::from_fields(&fields) {
        Ok(request) => request,
        Err(err) => {
            discard_staged(staged.as_deref()).await;
            return Err(state.reject(NAME, err));
        }
    };
    let Some(bed) = staged else {
        return Err(state.reject(
            NAME,
            ProxyError::invalid(coverage_matrix::UPLOAD_FIELD, "is required"),
        ));
    };
    tracing::info!(endpoint = NAME, path = %bed.display(), "Staged upload");

    let spec = match request.command(
        &state.config.scheduler,
        &state.config.scripts,
        &bed,
        chrono::Local::now(),
    ) {
        Ok(spec) => spec,
        Err(err) => {
            discard_staged(Some(bed.as_path())).await;
            return Err(state.reject(NAME, err));
        }
    };
    match state.stream(NAME, prepare(spec, &state.config)) {
        Ok(response) => Ok(response),
        Err(rejection) => {
            discard_staged(Some(bed.as_path())).await;
            Err(rejection)
        }
    }
}

async fn discard_staged(path: Option<&std::path::Path>) {
    if let Some(path) = path {
        let _ = tokio::fs::remove_file(path).await;
    }
}

async fn health() -> impl IntoResponse {
    "ok"
}

async fn metrics_json(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot().await)
}

async fn metrics_prometheus(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot().await;
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        render_prometheus(&snapshot),
    )
}
