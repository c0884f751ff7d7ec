//! Extraction routes
//!
//! Runs the vision pipeline over uploaded diagrams, either inline or as a
//! background job the client polls. Results are cached per document content
//! and mode, so re-running an identical file does not call the model again.

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use super::bid_forms::persist_extraction;
use super::bid_packages::fetch_package;
use super::diagrams::{
    fetch_diagram, read_extraction_upload, set_diagram_status, DiagramRow, DIAGRAM_COLUMNS,
};
use crate::api::{Created, DataResponse, OptionalJson};
use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::bid_forms::BidFormDetailResponse;
use crate::domain::diagrams::DiagramStatus;
use crate::domain::extraction::{
    CategorizationResult, CategorizeResponse, ExtractBidQuery, ExtractRequest, ExtractionMode,
    ExtractionResult,
};
use crate::error::ApiError;
use crate::services::cache::keys;
use crate::services::extraction::ProgressFn;
use crate::services::storage::content_hash;

/// Cached extraction. `mode` is the mode that actually ran, which differs
/// from the requested one when comprehensive mode fell back.
#[derive(Debug, Serialize, Deserialize)]
struct CachedExtraction {
    mode: ExtractionMode,
    result: ExtractionResult,
}

fn ignore_progress(_: u8, _: &str) {}

/// Extraction result for a document, from cache or from the model
async fn extract_document(
    state: &AppState,
    bytes: &[u8],
    hash: &str,
    media_type: &str,
    mode: ExtractionMode,
    progress: ProgressFn<'_>,
) -> Result<CachedExtraction, ApiError> {
    let cache_key = keys::extraction(state.extraction.model_name(), hash, mode);

    if let Some(cached) = state.cache.get::<CachedExtraction>(&cache_key).await {
        tracing::debug!(content_hash = %hash, mode = mode.as_str(), "Extraction served from cache");
        progress(100, "Loaded cached extraction");
        return Ok(cached);
    }

    let outcome = state
        .extraction
        .extract(bytes, media_type, mode, progress)
        .await?;

    tracing::info!(
        content_hash = %hash,
        requested_mode = mode.as_str(),
        mode = outcome.mode.as_str(),
        passes = outcome.passes,
        input_tokens = outcome.usage.input_tokens,
        output_tokens = outcome.usage.output_tokens,
        "Vision extraction completed"
    );

    let extraction = CachedExtraction {
        mode: outcome.mode,
        result: outcome.result,
    };
    state.cache.put(&cache_key, &extraction).await;
    Ok(extraction)
}

async fn extract_and_store(
    state: &AppState,
    diagram: &DiagramRow,
    req: &ExtractRequest,
    requested_by: Uuid,
    progress: ProgressFn<'_>,
) -> Result<BidFormDetailResponse, ApiError> {
    let bytes = state.store.read(&diagram.stored_path).await?;
    let extraction = extract_document(
        state,
        &bytes,
        &diagram.content_hash,
        &diagram.mime_type,
        req.mode,
        progress,
    )
    .await?;

    progress(95, "Saving line items");
    persist_extraction(
        state,
        diagram,
        req.bid_package_id,
        &extraction.result,
        extraction.mode,
        requested_by,
    )
    .await
}

/// Extract a stored diagram and persist the result as a bid form. The
/// diagram is `processing` meanwhile and ends `processed` or `failed`.
async fn run_diagram_extraction(
    state: &AppState,
    diagram: &DiagramRow,
    req: &ExtractRequest,
    requested_by: Uuid,
    progress: ProgressFn<'_>,
) -> Result<BidFormDetailResponse, ApiError> {
    set_diagram_status(state, diagram.id, DiagramStatus::Processing).await?;

    let outcome = extract_and_store(state, diagram, req, requested_by, progress).await;

    let status = if outcome.is_ok() {
        DiagramStatus::Processed
    } else {
        DiagramStatus::Failed
    };
    if let Err(e) = set_diagram_status(state, diagram.id, status).await {
        tracing::warn!(diagram_id = %diagram.id, error = %e, "Failed to update diagram status");
    }

    outcome
}

/// Load the diagram and check the target package belongs to its project
async fn prepare_extraction(
    state: &AppState,
    diagram_id: Uuid,
    req: &ExtractRequest,
) -> Result<DiagramRow, ApiError> {
    let diagram = fetch_diagram(state, diagram_id).await?;

    if let Some(package_id) = req.bid_package_id {
        let package = fetch_package(state, package_id).await?;
        if package.project_id != diagram.project_id {
            return Err(ApiError::bad_request(
                "Bid package belongs to a different project than the diagram",
            ));
        }
    }

    Ok(diagram)
}

/// POST /api/extract-bid
///
/// Stateless extraction of an uploaded file; nothing is stored.
pub async fn extract_bid(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ExtractBidQuery>,
    auth: RequireAuth,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let upload = read_extraction_upload(&mut multipart, state.settings.max_upload_bytes).await?;
    let mode = query
        .mode
        .as_deref()
        .map(ExtractionMode::parse)
        .unwrap_or_default();
    let hash = content_hash(&upload.bytes);

    tracing::info!(
        user_id = %auth.user_id,
        filename = %upload.filename,
        size = upload.bytes.len(),
        mode = mode.as_str(),
        "Stateless extraction requested"
    );

    let extraction = extract_document(
        &state,
        &upload.bytes,
        &hash,
        upload.media_type,
        mode,
        &ignore_progress,
    )
    .await?;

    Ok(Json(extraction.result))
}

/// POST /api/diagrams/:diagram_id/extract
pub async fn extract_diagram(
    State(state): State<Arc<AppState>>,
    Path(diagram_id): Path<Uuid>,
    auth: RequireAuth,
    OptionalJson(req): OptionalJson<ExtractRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_editor()?;

    let diagram = prepare_extraction(&state, diagram_id, &req).await?;
    let form = run_diagram_extraction(&state, &diagram, &req, auth.user_id, &ignore_progress).await?;

    Ok(Created(form))
}

/// POST /api/diagrams/:diagram_id/extract/async
///
/// Queues the extraction and returns 202 with the job to poll.
pub async fn extract_diagram_async(
    State(state): State<Arc<AppState>>,
    Path(diagram_id): Path<Uuid>,
    auth: RequireAuth,
    OptionalJson(req): OptionalJson<ExtractRequest>,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_editor()?;

    let diagram = prepare_extraction(&state, diagram_id, &req).await?;
    let job = state
        .jobs
        .create(diagram.id, diagram.project_id, auth.user_id, req.mode);
    let job_id = job.id;
    let requested_by = auth.user_id;

    tracing::info!(%job_id, %diagram_id, mode = req.mode.as_str(), "Extraction job queued");

    let task_state = state.clone();
    let span = tracing::info_span!("extraction_job", %job_id, %diagram_id);
    tokio::spawn(
        async move {
            let jobs = task_state.jobs.clone();
            jobs.start(job_id);

            let report = |percent: u8, stage: &str| jobs.progress(job_id, percent, stage);
            match run_diagram_extraction(&task_state, &diagram, &req, requested_by, &report).await {
                Ok(form) => {
                    jobs.complete(job_id, form.form.id, form.line_items.len());
                    tracing::info!(bid_form_id = %form.form.id, "Extraction job completed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Extraction job failed");
                    jobs.fail(job_id, e.public_message());
                }
            }
        }
        .instrument(span),
    );

    Ok((StatusCode::ACCEPTED, DataResponse::new(job)))
}

/// GET /api/extraction/jobs/:job_id
///
/// Visible to whoever queued it and to managers.
pub async fn get_extraction_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .jobs
        .get(job_id)
        .filter(|job| job.requested_by == auth.user_id || auth.role.can_manage_packages())
        .ok_or_else(|| ApiError::not_found("Extraction job not found"))?;

    Ok(DataResponse::new(job))
}

/// POST /api/diagrams/:diagram_id/categorize
pub async fn categorize_diagram(
    State(state): State<Arc<AppState>>,
    Path(diagram_id): Path<Uuid>,
    auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_editor()?;
    let diagram = fetch_diagram(&state, diagram_id).await?;

    let cache_key = keys::categorization(state.extraction.model_name(), &diagram.content_hash);
    let categorization = match state.cache.get::<CategorizationResult>(&cache_key).await {
        Some(cached) => cached,
        None => {
            let bytes = state.store.read(&diagram.stored_path).await?;
            let result = state
                .extraction
                .categorize(&bytes, &diagram.mime_type)
                .await?;
            state.cache.put(&cache_key, &result).await;
            result
        }
    };

    let row = sqlx::query_as::<_, DiagramRow>(&format!(
        r#"
        UPDATE diagrams SET
            category = $2,
            category_confidence = $3,
            category_summary = $4,
            updated_at = NOW()
        WHERE id = $1 AND deleted_at IS NULL
        RETURNING {}
        "#,
        DIAGRAM_COLUMNS
    ))
    .bind(diagram_id)
    .bind(categorization.category.as_str())
    .bind(categorization.confidence)
    .bind(&categorization.summary)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("Diagram not found"))?;

    tracing::info!(
        %diagram_id,
        category = categorization.category.as_str(),
        confidence = categorization.confidence,
        "Diagram categorized"
    );

    Ok(DataResponse::new(CategorizeResponse {
        diagram: row.into(),
        categorization,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::extraction::{Confidence, ExtractedLineItem};

    #[test]
    fn cached_extraction_keeps_the_mode_that_ran() {
        let cached = CachedExtraction {
            mode: ExtractionMode::Standard,
            result: ExtractionResult {
                project_name: Some("Warehouse".into()),
                line_items: vec![ExtractedLineItem {
                    description: "Slab on grade".into(),
                    quantity: Some(1200.0),
                    unit: Some("SF".into()),
                    ..Default::default()
                }],
                extraction_confidence: Confidence::High,
                raw_text: None,
            },
        };

        let json = serde_json::to_string(&cached).unwrap();
        let back: CachedExtraction = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mode, ExtractionMode::Standard);
        assert_eq!(back.result, cached.result);
    }
}
