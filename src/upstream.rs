use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONNECTION, HOST, TE, TRANSFER_ENCODING, UPGRADE};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::TryStreamExt;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid upstream base url {url:?}: {message}")]
    InvalidBaseUrl { url: String, message: String },
    #[error("error forwarding request: {0}")]
    Unreachable(#[from] reqwest::Error),
}

impl From<UpstreamError> for AppError {
    fn from(err: UpstreamError) -> Self {
        AppError::new(StatusCode::BAD_GATEWAY, "upstream_unreachable", err.to_string())
            .with_type("server_error")
    }
}

/// Response headers that describe the upstream hop rather than the payload.
/// The server re-frames the body, so these are never copied back.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    [CONNECTION, TRANSFER_ENCODING, TE, UPGRADE].contains(name)
}

/// Everything the upstream needs to replay a caller's request.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardRequest {
    pub fn new(
        method: Method,
        path: impl Into<String>,
        query: Option<&str>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            query: query.filter(|q| !q.is_empty()).map(str::to_string),
            headers: forward_headers(headers),
            body,
        }
    }
}

/// Copies caller headers minus `Host` and `Authorization`. The upstream never
/// sees the caller's credential.
pub fn forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if *name == HOST || *name == AUTHORIZATION {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

pub enum UpstreamBody {
    /// Open upstream stream, relayed chunk by chunk.
    Streaming(reqwest::Response),
    /// Whole upstream body, exactly as received.
    Buffered(Bytes),
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn buffered_body(&self) -> Option<&Bytes> {
        match &self.body {
            UpstreamBody::Buffered(bytes) => Some(bytes),
            UpstreamBody::Streaming(_) => None,
        }
    }

    pub fn into_response(self) -> Response {
        let body = match self.body {
            UpstreamBody::Buffered(bytes) => Body::from(bytes),
            UpstreamBody::Streaming(resp) => {
                let stream = resp.bytes_stream().inspect_err(|err| {
                    tracing::warn!(error = %err, "upstream stream aborted");
                });
                Body::from_stream(stream)
            }
        };
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        for (name, value) in self.headers.iter() {
            if is_hop_by_hop(name) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        response
    }
}

#[derive(Clone)]
pub struct UpstreamForwarder {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamForwarder {
    /// Builds a forwarder for `base_url`. Only the connect phase is bounded;
    /// streamed completions may stay open for as long as the backend needs.
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self, UpstreamError> {
        reqwest::Url::parse(base_url).map_err(|err| UpstreamError::InvalidBaseUrl {
            url: base_url.to_string(),
            message: err.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.base_url, path, q),
            _ => format!("{}{}", self.base_url, path),
        }
    }

    /// Sends `req` upstream. HTTP error statuses are returned as ordinary
    /// responses; only transport failures become errors. The upstream
    /// connection is released when the returned body (or stream) is dropped.
    pub async fn forward(
        &self,
        req: ForwardRequest,
        streaming: bool,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let url = self.upstream_url(&req.path, req.query.as_deref());
        let mut builder = self.client.request(req.method, url).headers(req.headers);
        if !req.body.is_empty() {
            builder = builder.body(req.body);
        }
        let resp = builder.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();

        let body = if streaming {
            UpstreamBody::Streaming(resp)
        } else {
            UpstreamBody::Buffered(resp.bytes().await?)
        };
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}
