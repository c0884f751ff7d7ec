//! Request ID middleware for request tracing

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderName},
    middleware::Next,
    response::Response,
};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: Option<String>;
}

/// Assigns a UUID request id when the client sent none, and echoes it back
pub fn request_id_layer() -> (SetRequestIdLayer<MakeRequestUuid>, PropagateRequestIdLayer) {
    let header_name = HeaderName::from_static(X_REQUEST_ID);

    (
        SetRequestIdLayer::new(header_name.clone(), MakeRequestUuid),
        PropagateRequestIdLayer::new(header_name),
    )
}

fn header_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Makes the request id visible to error responses built inside the handler.
/// Must sit inside `SetRequestIdLayer`.
pub async fn scope_request_id(request: Request, next: Next) -> Response {
    let id = header_request_id(request.headers());
    REQUEST_ID.scope(id, next.run(request)).await
}

/// Request id of the request being handled, if any
pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|id| id.clone()).ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_request_id_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(header_request_id(&headers), None);
        headers.insert(X_REQUEST_ID, "abc-123".parse().unwrap());
        assert_eq!(header_request_id(&headers).as_deref(), Some("abc-123"));
    }

    #[tokio::test]
    async fn request_id_is_scoped_to_the_request() {
        assert_eq!(current_request_id(), None);
        let seen = REQUEST_ID
            .scope(Some("req-1".to_string()), async { current_request_id() })
            .await;
        assert_eq!(seen.as_deref(), Some("req-1"));
    }
}
