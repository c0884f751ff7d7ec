//! Vision-language model client.
//!
//! [`VisionModel`] is the seam the extraction pipeline talks to;
//! [`AnthropicVision`] implements it over the Anthropic Messages API with
//! retries on transient failures.

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff, ExponentialBackoffBuilder};
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::error::ApiError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A document plus the instruction to apply to it
#[derive(Debug, Clone)]
pub struct VisionRequest<'a> {
    pub bytes: &'a [u8],
    pub media_type: &'a str,
    pub prompt: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Text answer of the model
#[derive(Debug, Clone, Default)]
pub struct VisionReply {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("vision API unavailable: {0}")]
    Unavailable(String),

    #[error("vision API rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid vision API response: {0}")]
    InvalidResponse(String),
}

impl From<VisionError> for ApiError {
    fn from(err: VisionError) -> Self {
        match &err {
            // Oversized or unreadable documents are the caller's problem
            VisionError::Rejected { status, message } if *status == 400 || *status == 413 => {
                ApiError::bad_request(format!("The vision model rejected the document: {}", message))
            }
            _ => ApiError::upstream(err.to_string()),
        }
    }
}

#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Model identifier, used in cache keys
    fn model_name(&self) -> &str;

    async fn analyze(&self, request: VisionRequest<'_>) -> Result<VisionReply, VisionError>;

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Anthropic Messages API
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: [ContentPart<'a>; 2],
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Image { source: Source<'a> },
    Document { source: Source<'a> },
    Text { text: &'a str },
}

#[derive(Serialize)]
struct Source<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: &'a str,
    data: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Statuses worth retrying: rate limits, server errors and overload
pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504 | 529)
}

/// Build the two content blocks for a document and prompt
fn content_parts<'a>(request: &VisionRequest<'a>) -> [ContentPart<'a>; 2] {
    let source = Source {
        kind: "base64",
        media_type: request.media_type,
        data: base64::engine::general_purpose::STANDARD.encode(request.bytes),
    };
    let document = if request.media_type == "application/pdf" {
        ContentPart::Document { source }
    } else {
        ContentPart::Image { source }
    };
    [document, ContentPart::Text { text: request.prompt }]
}

/// Concatenated text blocks of a reply
fn reply_text(response: MessagesResponse) -> Result<VisionReply, VisionError> {
    let text: String = response
        .content
        .into_iter()
        .filter_map(|block| match block {
            ResponseBlock::Text { text } => Some(text),
            ResponseBlock::Other => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    if text.trim().is_empty() {
        return Err(VisionError::InvalidResponse(
            "response contained no text content".to_string(),
        ));
    }

    if response.stop_reason.as_deref() == Some("max_tokens") {
        warn!("Vision response truncated at max_tokens");
    }

    Ok(VisionReply {
        text,
        usage: response
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            })
            .unwrap_or_default(),
    })
}

/// Client for the Anthropic Messages API.
#[derive(Clone)]
pub struct AnthropicVision {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    max_retries: u32,
}

impl AnthropicVision {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        max_tokens: u32,
        timeout_seconds: u64,
        max_retries: u32,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        tracing::info!(base_url = base_url, model = model, "Vision client initialized");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens,
            max_retries,
        })
    }

    fn backoff_policy(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_interval(Duration::from_secs(10))
            .with_max_elapsed_time(Some(Duration::from_secs(120)))
            .build()
    }

    /// One HTTP round trip, classified into transient and permanent failures
    async fn send_once(
        &self,
        body: &MessagesRequest<'_>,
        attempt: u32,
    ) -> Result<VisionReply, backoff::Error<VisionError>> {
        let url = format!("{}/v1/messages", self.base_url);
        let can_retry = attempt <= self.max_retries;

        let transient = |err: VisionError| {
            if can_retry {
                warn!(attempt, error = %err, "Vision call failed, retrying");
                backoff::Error::transient(err)
            } else {
                backoff::Error::permanent(err)
            }
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| transient(VisionError::Unavailable(e.to_string())))?;

        let status = response.status();
        if status.is_success() {
            let parsed: MessagesResponse = response
                .json()
                .await
                .map_err(|e| backoff::Error::permanent(VisionError::InvalidResponse(e.to_string())))?;
            return reply_text(parsed).map_err(backoff::Error::permanent);
        }

        let message = response
            .json::<ErrorEnvelope>()
            .await
            .map(|e| e.error.message)
            .unwrap_or_else(|_| format!("HTTP {}", status));

        let err = VisionError::Rejected {
            status: status.as_u16(),
            message,
        };

        if is_transient_status(status) {
            Err(transient(err))
        } else {
            Err(backoff::Error::permanent(err))
        }
    }
}

#[async_trait]
impl VisionModel for AnthropicVision {
    fn model_name(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, request), fields(model = %self.model, media_type = request.media_type, bytes = request.bytes.len()))]
    async fn analyze(&self, request: VisionRequest<'_>) -> Result<VisionReply, VisionError> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: [Message {
                role: "user",
                content: content_parts(&request),
            }],
        };

        let body = &body;
        let mut attempt = 0u32;
        let reply = retry(self.backoff_policy(), move || {
            attempt += 1;
            let current = attempt;
            async move { self.send_once(body, current).await }
        })
        .await?;

        debug!(
            input_tokens = reply.usage.input_tokens,
            output_tokens = reply.usage.output_tokens,
            "Vision call completed"
        );

        Ok(reply)
    }

    async fn health_check(&self) -> Result<()> {
        let url = format!("{}/v1/models?limit=1", self.base_url);

        self.client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .context("Vision API health check failed")?
            .error_for_status()
            .context("Vision API unhealthy")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn images_and_pdfs_use_different_blocks() {
        let image = VisionRequest {
            bytes: b"img",
            media_type: "image/png",
            prompt: "describe",
        };
        let value = serde_json::to_value(content_parts(&image)).unwrap();
        assert_eq!(value[0]["type"], "image");
        assert_eq!(value[0]["source"]["type"], "base64");
        assert_eq!(value[0]["source"]["media_type"], "image/png");
        assert_eq!(value[0]["source"]["data"], "aW1n");
        assert_eq!(value[1]["type"], "text");
        assert_eq!(value[1]["text"], "describe");

        let pdf = VisionRequest {
            media_type: "application/pdf",
            ..image
        };
        let value = serde_json::to_value(content_parts(&pdf)).unwrap();
        assert_eq!(value[0]["type"], "document");
    }

    #[test]
    fn reply_joins_text_blocks_and_skips_others() {
        let response: MessagesResponse = serde_json::from_str(
            r#"{"content": [{"type": "text", "text": "part one"},
                            {"type": "tool_use", "id": "x", "name": "y", "input": {}},
                            {"type": "text", "text": "part two"}],
                "usage": {"input_tokens": 10, "output_tokens": 5},
                "stop_reason": "end_turn"}"#,
        )
        .unwrap();
        let reply = reply_text(response).unwrap();
        assert_eq!(reply.text, "part one\npart two");
        assert_eq!(reply.usage.output_tokens, 5);
    }

    #[test]
    fn empty_reply_is_invalid() {
        let response: MessagesResponse = serde_json::from_str(r#"{"content": []}"#).unwrap();
        assert!(matches!(
            reply_text(response),
            Err(VisionError::InvalidResponse(_))
        ));
    }

    #[test]
    fn transient_statuses() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::from_u16(529).unwrap()));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
        assert!(!is_transient_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn rejected_documents_map_to_bad_request() {
        let err: ApiError = VisionError::Rejected {
            status: 400,
            message: "image too large".to_string(),
        }
        .into();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);

        let err: ApiError = VisionError::Unavailable("timeout".to_string()).into();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);
    }
}
