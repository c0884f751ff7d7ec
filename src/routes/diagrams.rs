//! Diagram routes
//!
//! Multipart upload with per-project content deduplication, listing,
//! download and soft delete.

use axum::{
    extract::{multipart::MultipartError, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::projects::ensure_project_exists;
use crate::api::{DataResponse, MessageResponse, Paginated, PaginationParams};
use crate::app::AppState;
use crate::auth::RequireAuth;
use crate::domain::diagrams::{
    media_type_for_filename, resolve_upload_media_type, DiagramCategory, DiagramQuery, DiagramResponse, DiagramStatus,
    DiagramUploadResponse,
};
use crate::error::ApiError;
use crate::services::storage::{content_hash, FileStore};

pub(super) const DIAGRAM_COLUMNS: &str = "id, project_id, uploaded_by, original_name, description, stored_path, \
                               mime_type, file_size, content_hash, category, category_confidence, \
                               category_summary, status, created_at, updated_at";

/// Database row for diagram
#[derive(Debug, Clone, sqlx::FromRow)]
pub(super) struct DiagramRow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub uploaded_by: Uuid,
    pub original_name: String,
    pub description: Option<String>,
    pub stored_path: String,
    pub mime_type: String,
    pub file_size: i64,
    pub content_hash: String,
    pub category: Option<String>,
    pub category_confidence: Option<f64>,
    pub category_summary: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DiagramRow> for DiagramResponse {
    fn from(row: DiagramRow) -> Self {
        Self {
            id: row.id,
            project_id: row.project_id,
            uploaded_by: row.uploaded_by,
            original_name: row.original_name,
            description: row.description,
            mime_type: row.mime_type,
            file_size: row.file_size,
            content_hash: row.content_hash,
            category: row.category.as_deref().map(DiagramCategory::parse_lenient),
            category_confidence: row.category_confidence,
            category_summary: row.category_summary,
            status: DiagramStatus::parse(&row.status),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// A file received through multipart
#[derive(Debug)]
pub(super) struct Upload {
    pub filename: String,
    pub media_type: &'static str,
    pub bytes: Vec<u8>,
    pub description: Option<String>,
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge("Upload exceeds the maximum allowed size".to_string())
    } else {
        ApiError::bad_request(format!("Invalid multipart body: {}", err.body_text()))
    }
}

struct RawUpload {
    filename: String,
    declared: Option<String>,
    bytes: Vec<u8>,
    description: Option<String>,
}

impl RawUpload {
    fn into_upload(self, media_type: &'static str) -> Upload {
        Upload {
            filename: if self.filename.is_empty() {
                "upload".to_string()
            } else {
                self.filename
            },
            media_type,
            bytes: self.bytes,
            description: self.description,
        }
    }
}

/// Read the `file` part (and optional `description`) of a multipart body.
/// Files over `max_bytes` are rejected while streaming.
async fn read_raw_upload(multipart: &mut Multipart, max_bytes: usize) -> Result<RawUpload, ApiError> {
    let mut file: Option<(String, Option<String>, Vec<u8>)> = None;
    let mut description = None;

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let declared = field.content_type().map(str::to_string);

                let mut bytes = Vec::new();
                while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                    if bytes.len() + chunk.len() > max_bytes {
                        return Err(ApiError::PayloadTooLarge(format!(
                            "File exceeds the maximum upload size of {} bytes",
                            max_bytes
                        )));
                    }
                    bytes.extend_from_slice(&chunk);
                }
                file = Some((filename, declared, bytes));
            }
            Some("description") => {
                let text = field.text().await.map_err(multipart_error)?;
                let text = text.trim();
                if !text.is_empty() {
                    description = Some(text.to_string());
                }
            }
            _ => {}
        }
    }

    let (filename, declared, bytes) =
        file.ok_or_else(|| ApiError::bad_request("Missing 'file' field"))?;

    if bytes.is_empty() {
        return Err(ApiError::bad_request("Uploaded file is empty"));
    }

    Ok(RawUpload {
        filename,
        declared,
        bytes,
        description,
    })
}

/// Diagram upload; only the accepted image and PDF types get through
pub(super) async fn read_upload(multipart: &mut Multipart, max_bytes: usize) -> Result<Upload, ApiError> {
    let raw = read_raw_upload(multipart, max_bytes).await?;
    let media_type = resolve_upload_media_type(&raw.filename, raw.declared.as_deref()).ok_or_else(|| {
        ApiError::bad_request("Unsupported file type; upload a PNG, JPEG, WEBP, GIF or PDF")
    })?;
    Ok(raw.into_upload(media_type))
}

/// Upload for stateless extraction. Files of unknown type go to the model as JPEG.
pub(super) async fn read_extraction_upload(
    multipart: &mut Multipart,
    max_bytes: usize,
) -> Result<Upload, ApiError> {
    let raw = read_raw_upload(multipart, max_bytes).await?;
    let media_type = resolve_upload_media_type(&raw.filename, raw.declared.as_deref())
        .unwrap_or_else(|| media_type_for_filename(&raw.filename));
    Ok(raw.into_upload(media_type))
}

/// Live diagram by id
pub(super) async fn fetch_diagram(state: &AppState, diagram_id: Uuid) -> Result<DiagramRow, ApiError> {
    sqlx::query_as::<_, DiagramRow>(&format!(
        "SELECT {} FROM diagrams WHERE id = $1 AND deleted_at IS NULL",
        DIAGRAM_COLUMNS
    ))
    .bind(diagram_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("Diagram not found"))
}

pub(super) async fn set_diagram_status(
    state: &AppState,
    diagram_id: Uuid,
    status: DiagramStatus,
) -> Result<(), ApiError> {
    sqlx::query("UPDATE diagrams SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(diagram_id)
        .bind(status.as_str())
        .execute(&state.db)
        .await?;
    Ok(())
}

async fn find_by_hash(
    state: &AppState,
    project_id: Uuid,
    hash: &str,
) -> Result<Option<DiagramRow>, ApiError> {
    Ok(sqlx::query_as::<_, DiagramRow>(&format!(
        "SELECT {} FROM diagrams WHERE project_id = $1 AND content_hash = $2 AND deleted_at IS NULL",
        DIAGRAM_COLUMNS
    ))
    .bind(project_id)
    .bind(hash)
    .fetch_optional(&state.db)
    .await?)
}

fn duplicate_response(row: DiagramRow) -> (StatusCode, DataResponse<DiagramUploadResponse>) {
    (
        StatusCode::OK,
        DataResponse::new(DiagramUploadResponse {
            diagram: row.into(),
            duplicate: true,
        }),
    )
}

/// POST /api/projects/:project_id/diagrams
///
/// Identical bytes already uploaded to the project return the existing
/// diagram with `duplicate: true` and 200; new files return 201.
pub async fn upload_diagram(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    auth: RequireAuth,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_editor()?;
    ensure_project_exists(&state, project_id).await?;

    let upload = read_upload(&mut multipart, state.settings.max_upload_bytes).await?;
    let hash = content_hash(&upload.bytes);

    if let Some(existing) = find_by_hash(&state, project_id, &hash).await? {
        tracing::info!(%project_id, diagram_id = %existing.id, "Duplicate upload");
        return Ok(duplicate_response(existing));
    }

    let stored_path = FileStore::relative_path(project_id, &hash, upload.media_type);
    state.store.save(&stored_path, &upload.bytes).await?;

    let inserted = sqlx::query_as::<_, DiagramRow>(&format!(
        r#"
        INSERT INTO diagrams (project_id, uploaded_by, original_name, description, stored_path,
                              mime_type, file_size, content_hash)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {}
        "#,
        DIAGRAM_COLUMNS
    ))
    .bind(project_id)
    .bind(auth.user_id)
    .bind(&upload.filename)
    .bind(&upload.description)
    .bind(&stored_path)
    .bind(upload.media_type)
    .bind(upload.bytes.len() as i64)
    .bind(&hash)
    .fetch_one(&state.db)
    .await;

    let row = match inserted {
        Ok(row) => row,
        // A concurrent upload of the same bytes won the insert
        Err(sqlx::Error::Database(e)) if e.constraint() == Some("diagrams_project_hash_key") => {
            let existing = find_by_hash(&state, project_id, &hash)
                .await?
                .ok_or_else(|| ApiError::conflict("Diagram upload conflicted, retry the request"))?;
            return Ok(duplicate_response(existing));
        }
        Err(e) => return Err(e.into()),
    };

    tracing::info!(
        %project_id,
        diagram_id = %row.id,
        media_type = upload.media_type,
        bytes = row.file_size,
        "Diagram uploaded"
    );

    Ok((
        StatusCode::CREATED,
        DataResponse::new(DiagramUploadResponse {
            diagram: row.into(),
            duplicate: false,
        }),
    ))
}

/// GET /api/projects/:project_id/diagrams
pub async fn list_diagrams(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<Uuid>,
    Query(query): Query<DiagramQuery>,
    Query(pagination): Query<PaginationParams>,
    _auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    ensure_project_exists(&state, project_id).await?;

    let category = query.category.map(|c| c.as_str());
    let status = query.status.map(|s| s.as_str());

    let filter = r#"
        WHERE project_id = $1 AND deleted_at IS NULL
          AND ($2::text IS NULL OR category = $2)
          AND ($3::text IS NULL OR status = $3)
    "#;

    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM diagrams {}", filter))
        .bind(project_id)
        .bind(category)
        .bind(status)
        .fetch_one(&state.db)
        .await?;

    let rows = sqlx::query_as::<_, DiagramRow>(&format!(
        "SELECT {} FROM diagrams {} ORDER BY created_at DESC LIMIT $4 OFFSET $5",
        DIAGRAM_COLUMNS, filter
    ))
    .bind(project_id)
    .bind(category)
    .bind(status)
    .bind(pagination.limit())
    .bind(pagination.offset())
    .fetch_all(&state.db)
    .await?;

    let data: Vec<DiagramResponse> = rows.into_iter().map(Into::into).collect();
    Ok(Paginated::new(data, &pagination, total))
}

/// GET /api/diagrams/:diagram_id
pub async fn get_diagram(
    State(state): State<Arc<AppState>>,
    Path(diagram_id): Path<Uuid>,
    _auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    let diagram: DiagramResponse = fetch_diagram(&state, diagram_id).await?.into();
    Ok(DataResponse::new(diagram))
}

/// Filename safe to put inside a quoted Content-Disposition value
fn disposition_filename(name: &str) -> String {
    name.chars()
        .map(|c| if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' { c } else { '_' })
        .collect()
}

/// GET /api/diagrams/:diagram_id/file
pub async fn download_diagram(
    State(state): State<Arc<AppState>>,
    Path(diagram_id): Path<Uuid>,
    _auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    let row = fetch_diagram(&state, diagram_id).await?;
    let bytes = state.store.read(&row.stored_path).await.map_err(|e| {
        tracing::error!(%diagram_id, error = %e, "Stored diagram file is missing");
        ApiError::not_found("Diagram file not found")
    })?;

    let disposition = format!("inline; filename=\"{}\"", disposition_filename(&row.original_name));

    Ok((
        [
            (header::CONTENT_TYPE, row.mime_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

/// DELETE /api/diagrams/:diagram_id
pub async fn delete_diagram(
    State(state): State<Arc<AppState>>,
    Path(diagram_id): Path<Uuid>,
    auth: RequireAuth,
) -> Result<impl IntoResponse, ApiError> {
    auth.require_editor()?;

    let stored_path: String = sqlx::query_scalar(
        r#"
        UPDATE diagrams SET deleted_at = NOW(), updated_at = NOW()
        WHERE id = $1 AND deleted_at IS NULL
        RETURNING stored_path
        "#,
    )
    .bind(diagram_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("Diagram not found"))?;

    state.store.remove_quietly(&stored_path).await;

    tracing::info!(%diagram_id, user_id = %auth.user_id, "Diagram deleted");

    Ok(MessageResponse::with_code("Diagram deleted", "DIAGRAM_DELETED"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, extract::FromRequest, http::Request};

    const BOUNDARY: &str = "plan-boundary";

    async fn multipart(filename: &str, content_type: &str, bytes: &[u8]) -> Multipart {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: {content_type}\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(
            format!(
                "\r\n--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"description\"\r\n\r\n\
                 Level 2 framing \r\n--{BOUNDARY}--\r\n"
            )
            .as_bytes(),
        );

        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();
        Multipart::from_request(request, &()).await.unwrap()
    }

    #[tokio::test]
    async fn diagram_uploads_reject_unknown_types() {
        let mut parts = multipart("scan.tiff", "application/octet-stream", b"II*\0").await;
        let err = read_upload(&mut parts, 1024).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn extraction_uploads_treat_unknown_types_as_jpeg() {
        let mut parts = multipart("scan.tiff", "application/octet-stream", b"II*\0").await;
        let upload = read_extraction_upload(&mut parts, 1024).await.unwrap();
        assert_eq!(upload.media_type, "image/jpeg");
        assert_eq!(upload.filename, "scan.tiff");
        assert_eq!(upload.description.as_deref(), Some("Level 2 framing"));

        let mut parts = multipart("sheet.pdf", "application/pdf", b"%PDF-1.7").await;
        let upload = read_extraction_upload(&mut parts, 1024).await.unwrap();
        assert_eq!(upload.media_type, "application/pdf");
    }

    #[tokio::test]
    async fn oversized_uploads_are_rejected() {
        let mut parts = multipart("plan.png", "image/png", &[0u8; 64]).await;
        let err = read_upload(&mut parts, 16).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn disposition_filenames_are_sanitized() {
        assert_eq!(disposition_filename("plan A.pdf"), "plan A.pdf");
        assert_eq!(disposition_filename("a\"b\\c\n.png"), "a_b_c_.png");
        assert_eq!(disposition_filename("ünïcode.jpg"), "_n_code.jpg");
    }
}
