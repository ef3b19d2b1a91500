use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use changelog_core::{
    CacheConfig, ChangelogDocument, ChangelogError, ContentCache, DocumentPatch, Envelope,
    NewDocument, SaveFileRequest,
};
use changelog_store_sqlite::SchemaStatus;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

mod api;

use api::ChangelogApi;

#[derive(Debug, Clone)]
struct ServiceState {
    api: ChangelogApi,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct FailureEnvelope {
    success: bool,
    message: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    data: Option<serde_json::Value>,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct PathQuery {
    path: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    cache_entries: usize,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    schema: SchemaStatus,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_found_total: AtomicU64,
    conflict_total: AtomicU64,
    store_error_total: AtomicU64,
    internal_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    not_found_total: u64,
    conflict_total: u64,
    store_error_total: u64,
    internal_error_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "changelog-service")]
#[command(about = "HTTP service for storefront changelog documents")]
struct Args {
    #[arg(long, env = "CHANGELOG_DB", default_value = "./changelog.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "CHANGELOG_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "CHANGELOG_OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    operation_timeout_ms: u64,
    #[arg(long, env = "CHANGELOG_CACHE_TTL_SECS", default_value_t = 300)]
    cache_ttl_secs: u64,
    #[arg(long, env = "CHANGELOG_CACHE_CAPACITY", default_value_t = 256)]
    cache_capacity: usize,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = FailureEnvelope {
            success: false,
            message: self.message,
            code: self.code,
            data: self.data,
            details: self.details,
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into(), data: None, details }
    }

    /// Well-formed JSON that does not fit the payload type (a missing
    /// required field, a wrong type) is a validation error. Anything else the
    /// extractor rejects is `invalid_json`. Both are 400.
    fn invalid_json(&self, rejection: &JsonRejection) -> ServiceFailure {
        let code = match rejection {
            JsonRejection::JsonDataError(_) => "validation_error",
            _ => "invalid_json",
        };
        self.telemetry.record_failure(code, false);
        Self::failure(
            StatusCode::BAD_REQUEST,
            code,
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_query(&self, rejection: &QueryRejection) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        Self::failure(
            StatusCode::BAD_REQUEST,
            "validation_error",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn classify_error(err: &ChangelogError) -> ServiceFailure {
        let status = match err {
            ChangelogError::NotFound(_) => StatusCode::NOT_FOUND,
            ChangelogError::Conflict(_) => StatusCode::CONFLICT,
            ChangelogError::Validation(_) => StatusCode::BAD_REQUEST,
            ChangelogError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::failure(status, err.code(), format!("operation failed: {err}"), None)
    }

    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(ChangelogApi) -> Result<T, ChangelogError> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure("timeout", true);
                warn!(operation = operation_label, "changelog operation timed out");
                Self::failure(
                    StatusCode::GATEWAY_TIMEOUT,
                    "timeout",
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_error(&err);
                if matches!(err, ChangelogError::Store(_)) {
                    warn!(operation = operation_label, error = %err, "changelog store failure");
                }
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "invalid_json" => &self.invalid_json_total,
            "validation_error" => &self.validation_error_total,
            "not_found" => &self.not_found_total,
            "conflict" => &self.conflict_total,
            "store_error" => &self.store_error_total,
            "internal_error" => &self.internal_error_total,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            conflict_total: self.conflict_total.load(Ordering::Relaxed),
            store_error_total: self.store_error_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
        }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/changelog", get(list_documents).post(create_document))
        .route("/changelog/bypath", get(document_by_path))
        .route("/changelog/save-file", post(save_file))
        .route(
            "/changelog/:id",
            get(document_by_id).put(update_document).delete(delete_document),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let cache = Arc::new(ContentCache::new(CacheConfig {
        ttl: Duration::from_secs(args.cache_ttl_secs),
        capacity: args.cache_capacity,
    }));
    let api = ChangelogApi::new(args.db.clone(), cache);
    let schema = api.migrate()?;
    info!(
        db = %args.db.display(),
        schema_version = schema.current_version,
        "changelog schema ready"
    );

    let state = ServiceState {
        api,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!("changelog service listening on {}", args.bind);

    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;
    info!("changelog service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("received terminate signal, shutting down");
            }
            Err(err) => {
                warn!(error = %err, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn health(State(state): State<ServiceState>) -> Json<Envelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(Envelope::ok(HealthResponse {
        status: "ok",
        timeout_ms,
        cache_entries: state.api.cache_len(),
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<Envelope<ReadinessResponse>>, ServiceFailure> {
    let schema = state.run_blocking("schema_status", |api| api.schema_status()).await?;
    if schema.is_current() {
        return Ok(Json(Envelope::ok(ReadinessResponse { status: "ready", schema })));
    }

    state.telemetry.record_failure("store_error", false);
    Err(ServiceState::failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "store_error",
        "database schema is not ready",
        Some(json!({
            "current_version": schema.current_version,
            "target_version": schema.target_version,
        })),
    ))
}

async fn list_documents(
    State(state): State<ServiceState>,
) -> Result<Json<Envelope<Vec<ChangelogDocument>>>, ServiceFailure> {
    let documents = state.run_blocking("list", |api| api.list()).await?;
    Ok(Json(Envelope::ok(documents)))
}

async fn document_by_id(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<ChangelogDocument>>, ServiceFailure> {
    let document = state.run_blocking("get_by_id", move |api| api.get_by_id(&id)).await?;
    Ok(Json(Envelope::ok(document)))
}

async fn document_by_path(
    State(state): State<ServiceState>,
    query: Result<Query<PathQuery>, QueryRejection>,
) -> Result<Json<Envelope<ChangelogDocument>>, ServiceFailure> {
    let Query(query) = query.map_err(|rejection| state.invalid_query(&rejection))?;
    let document =
        state.run_blocking("get_by_path", move |api| api.get_by_path(&query.path)).await?;
    Ok(Json(Envelope::ok(document)))
}

async fn create_document(
    State(state): State<ServiceState>,
    payload: Result<Json<NewDocument>, JsonRejection>,
) -> Result<(StatusCode, Json<Envelope<ChangelogDocument>>), ServiceFailure> {
    let Json(input) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let document = state.run_blocking("create", move |api| api.create(input)).await?;
    Ok((
        StatusCode::CREATED,
        Json(Envelope::ok_with_message(document, "changelog document created")),
    ))
}

async fn update_document(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    payload: Result<Json<DocumentPatch>, JsonRejection>,
) -> Result<Json<Envelope<ChangelogDocument>>, ServiceFailure> {
    let Json(patch) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let document = state.run_blocking("update", move |api| api.update(&id, &patch)).await?;
    Ok(Json(Envelope::ok_with_message(document, "changelog document updated")))
}

async fn delete_document(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<bool>>, ServiceFailure> {
    let lookup_id = id.clone();
    let removed = state.run_blocking("delete", move |api| api.delete(&id)).await?;
    if !removed {
        state.telemetry.record_failure("not_found", false);
        let mut failure = ServiceState::failure(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("changelog document {lookup_id} not found"),
            None,
        );
        failure.data = Some(json!(false));
        return Err(failure);
    }
    Ok(Json(Envelope::ok_with_message(true, "changelog document deleted")))
}

async fn save_file(
    State(state): State<ServiceState>,
    payload: Result<Json<SaveFileRequest>, JsonRejection>,
) -> Result<Json<Envelope<ChangelogDocument>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json(&rejection))?;
    let document = state.run_blocking("save_file", move |api| api.save_file(&request)).await?;
    Ok(Json(Envelope::ok_with_message(document, "file saved")))
}
