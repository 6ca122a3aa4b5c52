use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::Json;
use bytes::Bytes;
use futures::stream;
use multer::{parse_boundary, Multipart};
use tracing::{debug, instrument};

use reconcile_common::decision::ReconcileMode;

use super::AppState;
use crate::api::{ApiError, UploadResponse};
use crate::spreadsheet::{Workbook, XLSX_CONTENT_TYPE};

const FILE_FIELD: &str = "file";

/// Reconcile the first sheet of an uploaded workbook: matched rows update, the rest insert.
#[instrument(skip_all)]
pub async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UploadResponse>, ApiError> {
    let data = read_file_field(&headers, body).await?;
    let rows = Workbook::open(data)?.first_sheet()?;
    debug!(rows = rows.len(), "parsed upload");

    let report = state.reconciler.reconcile(rows).await?;

    Ok(Json(UploadResponse {
        message: "Data uploaded successfully!",
        report,
    }))
}

/// Reconcile every sheet of an uploaded workbook without ever inserting.
#[instrument(skip_all)]
pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<UploadResponse>, ApiError> {
    let data = read_file_field(&headers, body).await?;
    let rows = Workbook::open(data)?.all_sheets()?;

    let report = state
        .reconciler
        .reconcile_with_mode(rows, ReconcileMode::UpdateOnly)
        .await?;

    Ok(Json(UploadResponse {
        message: "Records updated successfully!",
        report,
    }))
}

/// Pull the `file` part out of a multipart body. Only xlsx workbooks are accepted.
async fn read_file_field(headers: &HeaderMap, body: Bytes) -> Result<Bytes, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("multipart/form-data") {
        return Err(ApiError::Multipart(
            "Content-Type must be multipart/form-data".to_owned(),
        ));
    }
    let boundary = parse_boundary(content_type)?;

    let body_stream = stream::once(async move { Ok::<Bytes, std::io::Error>(body) });
    let mut multipart = Multipart::new(body_stream, boundary);

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let is_xlsx = field
            .content_type()
            .is_some_and(|mime| mime.essence_str() == XLSX_CONTENT_TYPE);
        if !is_xlsx {
            return Err(ApiError::InvalidFileFormat);
        }

        return Ok(field.bytes().await?);
    }

    Err(ApiError::MissingFile)
}
