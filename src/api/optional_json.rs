//! JSON body that may be left out entirely

use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;

use crate::error::ApiError;

/// An empty body yields `T::default()`. A body that is present must be
/// valid JSON for `T`, otherwise the request fails with 400.
pub struct OptionalJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for OptionalJson<T>
where
    T: DeserializeOwned + Default,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(OptionalJson(T::default()));
        }

        let Json(value) =
            Json::<T>::from_bytes(&bytes).map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
        Ok(OptionalJson(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::extraction::{ExtractRequest, ExtractionMode};
    use axum::{body::Body, http::StatusCode};

    async fn extract(body: &'static str) -> Result<ExtractRequest, ApiError> {
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        OptionalJson::<ExtractRequest>::from_request(request, &())
            .await
            .map(|OptionalJson(req)| req)
    }

    #[tokio::test]
    async fn missing_body_uses_defaults() {
        let req = extract("").await.unwrap();
        assert_eq!(req.mode, ExtractionMode::Standard);
        assert!(req.bid_package_id.is_none());

        assert!(extract(" \n").await.is_ok());
    }

    #[tokio::test]
    async fn present_body_is_parsed() {
        let req = extract(r#"{"mode":"comprehensive"}"#).await.unwrap();
        assert_eq!(req.mode, ExtractionMode::Comprehensive);
    }

    #[tokio::test]
    async fn malformed_body_is_rejected() {
        let err = extract(r#"{"mode":"comprehensiv"}"#).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = extract("{not json").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
