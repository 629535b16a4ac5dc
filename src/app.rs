use crate::auth::Authenticator;
use crate::error::{AppError, AppResult};
use crate::store::{KeyStore, SqliteKeyStore};
use crate::upstream::UpstreamForwarder;
use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub const USAGE_REPORT_PATH: &str = "/admin/usage";
const BOOTSTRAP_ADMIN_NAME: &str = "admin";

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub authenticator: Authenticator,
    pub key_store: Arc<dyn KeyStore>,
    pub forwarder: UpstreamForwarder,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub upstream_url: String,
    pub database_dsn: String,
    pub metrics_path: String,
    pub max_body_bytes: usize,
    pub connect_timeout_ms: u64,
    pub bootstrap_admin_key: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            upstream_url: "http://localhost:8000".to_string(),
            database_dsn: "sqlite://./data/meterproxy.db".to_string(),
            metrics_path: "/admin/metrics".to_string(),
            max_body_bytes: 32 * 1024 * 1024,
            connect_timeout_ms: 10_000,
            bootstrap_admin_key: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let listen = env_var("METERPROXY_LISTEN").unwrap_or(defaults.listen);
        let upstream_url = env_var("METERPROXY_UPSTREAM_URL").unwrap_or(defaults.upstream_url);
        let metrics_path = env_var("METERPROXY_METRICS_PATH").unwrap_or(defaults.metrics_path);
        let database_dsn = env_var("METERPROXY_DATABASE_DSN")
            .or_else(|| env_var("DATABASE_URL"))
            .unwrap_or(defaults.database_dsn);
        let max_body_bytes = env_var("METERPROXY_MAX_BODY_BYTES")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.max_body_bytes);
        let connect_timeout_ms = env_var("METERPROXY_CONNECT_TIMEOUT_MS")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.connect_timeout_ms);
        let bootstrap_admin_key = env_var("METERPROXY_BOOTSTRAP_ADMIN_KEY");
        Self {
            listen,
            upstream_url,
            database_dsn,
            metrics_path,
            max_body_bytes,
            connect_timeout_ms,
            bootstrap_admin_key,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

/// Opens the SQLite key store named by `runtime.database_dsn` and wires
/// the rest of the state around it.
pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let store = SqliteKeyStore::connect(&runtime.database_dsn)
        .await
        .map_err(|err| AppError::startup("database_init_failed", err.to_string()))?;
    ensure_bootstrap_admin(&store, runtime.bootstrap_admin_key.as_deref()).await?;
    build_state(runtime, Arc::new(store))
}

/// Assembles state over an arbitrary key store.
pub fn build_state(runtime: RuntimeConfig, key_store: Arc<dyn KeyStore>) -> AppResult<AppState> {
    let forwarder = UpstreamForwarder::new(
        &runtime.upstream_url,
        Duration::from_millis(runtime.connect_timeout_ms),
    )
    .map_err(|err| AppError::startup("upstream_init_failed", err.to_string()))?;
    let metrics = init_metrics()?;
    tracing::info!(upstream = %forwarder.base_url(), "upstream configured");

    Ok(AppState {
        runtime: Arc::new(runtime),
        authenticator: Authenticator::new(key_store.clone()),
        key_store,
        forwarder,
        metrics,
    })
}

async fn ensure_bootstrap_admin(store: &SqliteKeyStore, key: Option<&str>) -> AppResult<()> {
    let Some(key) = key else {
        return Ok(());
    };
    let count = store
        .caller_count()
        .await
        .map_err(|err| AppError::startup("bootstrap_admin_failed", err.to_string()))?;
    if count > 0 {
        return Ok(());
    }
    let caller = store
        .add_caller(BOOTSTRAP_ADMIN_NAME, key, true)
        .await
        .map_err(|err| AppError::startup("bootstrap_admin_failed", err.to_string()))?;
    tracing::info!(caller_id = caller.id, "bootstrap admin caller created");
    Ok(())
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::startup("metrics_init_failed", err.to_string()));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::startup("metrics_init_failed", "metrics recorder not available")
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route(USAGE_REPORT_PATH, get(crate::handlers::usage_report))
        .route(&metrics_path, get(crate::handlers::metrics))
        .fallback(crate::handlers::proxy)
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
}

/// Any origin, method and header, with credentials. Wildcards cannot be
/// combined with credentials, so the request's own values are echoed back.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}
