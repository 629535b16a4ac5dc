use crate::app::AppState;
use crate::auth::{AuthError, AuthOutcome};
use crate::classify::{is_api_path, is_completion_endpoint, is_streaming_request};
use crate::error::{AppError, AppResult};
use crate::upstream::{ForwardRequest, UpstreamResponse};
use crate::usage::{UsageRecord, UsageReport, extract_total_tokens};
use axum::Json;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use http_body_util::LengthLimitError;
use std::time::Instant;

pub const PROCESS_TIME_HEADER: &str = "x-process-time";

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

/// Aggregated usage per caller. A credential is mandatory here.
pub async fn usage_report(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<UsageReport>> {
    let caller = state
        .authenticator
        .require(headers.get(AUTHORIZATION))
        .await
        .map_err(|err| reject(err, "/admin/usage"))?;
    tracing::debug!(caller_id = caller.id, "usage report requested");
    let report = state.key_store.usage_report().await.map_err(|err| {
        AppError::internal("usage_report_failed", err.to_string())
    })?;
    Ok(Json(report))
}

/// Catch-all reverse proxy route.
pub async fn proxy(State(state): State<AppState>, req: Request) -> Response {
    let started_at = Instant::now();
    let mut response = match proxy_pipeline(&state, req).await {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    };
    let elapsed = format!("{:.6}", started_at.elapsed().as_secs_f64());
    if let Ok(value) = HeaderValue::from_str(&elapsed) {
        response.headers_mut().insert(PROCESS_TIME_HEADER, value);
    }
    response
}

async fn proxy_pipeline(state: &AppState, req: Request) -> AppResult<Response> {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let metered = is_api_path(&path);

    let auth = state
        .authenticator
        .authenticate(parts.headers.get(AUTHORIZATION))
        .await
        .map_err(|err| reject(err, &path))?;
    let caller_id = auth.caller_id();

    let body = axum::body::to_bytes(body, state.runtime.max_body_bytes)
        .await
        .map_err(body_read_error)?;

    if metered {
        record_usage(state, UsageRecord::request(caller_id, path.as_str())).await;
    }

    let streaming = is_streaming_request(&parts.method, &path, &body);
    metrics::counter!(
        "meterproxy_requests_total",
        "route" => if metered { "api" } else { "passthrough" },
        "streaming" => if streaming { "true" } else { "false" }
    )
    .increment(1);
    tracing::debug!(
        method = %parts.method,
        path = %path,
        caller_id = ?caller_id,
        streaming,
        "forwarding request"
    );

    let forward = ForwardRequest::new(
        parts.method,
        path.as_str(),
        parts.uri.query(),
        &parts.headers,
        body,
    );
    let upstream = state
        .forwarder
        .forward(forward, streaming)
        .await
        .map_err(|err| {
            metrics::counter!("meterproxy_upstream_failures_total").increment(1);
            tracing::warn!(path = %path, error = %err, "upstream unreachable");
            AppError::from(err)
        })?;

    if metered && !streaming && is_completion_endpoint(&path) {
        account_tokens(state, &auth, &path, &upstream).await;
    }

    tracing::debug!(path = %path, status = upstream.status.as_u16(), streaming, "upstream responded");
    Ok(upstream.into_response())
}

fn body_read_error(err: axum::Error) -> AppError {
    let inner = err.into_inner();
    if inner.downcast_ref::<LengthLimitError>().is_some() {
        AppError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "request_body_too_large",
            inner.to_string(),
        )
    } else {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "request_body_unreadable",
            inner.to_string(),
        )
    }
}

fn reject(err: AuthError, path: &str) -> AppError {
    if let AuthError::Rejected(rejection) = &err {
        metrics::counter!("meterproxy_auth_rejections_total", "reason" => rejection.code())
            .increment(1);
        tracing::info!(path = %path, reason = rejection.reason(), "credential rejected");
    } else {
        tracing::error!(path = %path, error = %err, "credential lookup failed");
    }
    AppError::from(err)
}

/// Best-effort token accounting on the buffered body. The body is only
/// borrowed; what the caller receives is never touched.
async fn account_tokens(
    state: &AppState,
    auth: &AuthOutcome,
    path: &str,
    upstream: &UpstreamResponse,
) {
    let Some(caller) = auth.caller() else {
        return;
    };
    let Some(body) = upstream.buffered_body() else {
        return;
    };
    match extract_total_tokens(body) {
        Ok(Some(tokens)) => {
            metrics::counter!("meterproxy_tokens_total").increment(tokens);
            record_usage(state, UsageRecord::tokens(caller.id, path, tokens)).await;
        }
        Ok(None) => {
            tracing::debug!(path = %path, caller_id = caller.id, "no token usage in response");
        }
        Err(err) => {
            tracing::warn!(
                path = %path,
                caller_id = caller.id,
                error = %err,
                "failed to parse completion response for token usage"
            );
        }
    }
}

async fn record_usage(state: &AppState, record: UsageRecord) {
    let endpoint = record.endpoint.clone();
    let kind = record.kind;
    if let Err(err) = state.key_store.record_usage(record).await {
        tracing::warn!(
            endpoint = %endpoint,
            kind = kind.as_str(),
            error = %err,
            "failed to record usage"
        );
    }
}
