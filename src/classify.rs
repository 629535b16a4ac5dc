use axum::http::Method;
use serde_json::Value;

/// Completion-family endpoints: the only ones that can stream and the only
/// ones whose responses are metered for tokens.
pub const COMPLETION_ENDPOINTS: [&str; 2] = ["/v1/completions", "/v1/chat/completions"];

/// Prefix of the metered API surface. Other paths are forwarded unmetered.
pub const API_PREFIX: &str = "/v1";

pub fn is_completion_endpoint(path: &str) -> bool {
    COMPLETION_ENDPOINTS.contains(&path)
}

pub fn is_api_path(path: &str) -> bool {
    path == API_PREFIX
        || path
            .strip_prefix(API_PREFIX)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Decides whether the caller asked for a streamed completion.
///
/// Anything that is not a POST to a completion endpoint with a JSON body
/// carrying a truthy `stream` field is handled buffered.
pub fn is_streaming_request(method: &Method, path: &str, body: &[u8]) -> bool {
    if *method != Method::POST || !is_completion_endpoint(path) {
        return false;
    }
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return false;
    };
    value.get("stream").is_some_and(is_truthy)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAT: &str = "/v1/chat/completions";

    #[test]
    fn stream_true_is_streaming() {
        assert!(is_streaming_request(
            &Method::POST,
            CHAT,
            br#"{"model":"m","stream":true,"messages":[]}"#
        ));
        assert!(is_streaming_request(
            &Method::POST,
            "/v1/completions",
            br#"{"stream":1}"#
        ));
    }

    #[test]
    fn stream_false_or_absent_is_buffered() {
        assert!(!is_streaming_request(&Method::POST, CHAT, br#"{"stream":false}"#));
        assert!(!is_streaming_request(&Method::POST, CHAT, br#"{"stream":null}"#));
        assert!(!is_streaming_request(&Method::POST, CHAT, br#"{"stream":0}"#));
        assert!(!is_streaming_request(&Method::POST, CHAT, br#"{"model":"m"}"#));
        assert!(!is_streaming_request(&Method::POST, CHAT, br#"[true]"#));
    }

    #[test]
    fn unparsable_body_falls_back_to_buffered() {
        assert!(!is_streaming_request(&Method::POST, CHAT, b"{\"stream\": tru"));
        assert!(!is_streaming_request(&Method::POST, CHAT, b""));
    }

    #[test]
    fn only_post_to_completion_endpoints_can_stream() {
        let body = br#"{"stream":true}"#;
        assert!(!is_streaming_request(&Method::GET, CHAT, body));
        assert!(!is_streaming_request(&Method::PUT, CHAT, body));
        assert!(!is_streaming_request(&Method::POST, "/v1/embeddings", body));
        assert!(!is_streaming_request(&Method::POST, "/v1/chat/completions/", body));
    }

    #[test]
    fn api_prefix_matches_whole_segments() {
        assert!(is_api_path("/v1"));
        assert!(is_api_path("/v1/models"));
        assert!(!is_api_path("/v10/models"));
        assert!(!is_api_path("/health"));
        assert!(!is_api_path("/"));
    }
}
