use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use reconcile_common::record::StoredEntity;
use reconcile_common::store::{DocumentStore, EntityFilter};

use super::AppState;
use crate::api::ApiError;
use crate::export::{write_workbook, EXPORT_FILENAME};
use crate::spreadsheet::XLSX_CONTENT_TYPE;

/// Every stored entity as an xlsx attachment.
#[instrument(skip_all)]
pub async fn export(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let entities = state.reconciler.store().find_all().await?;
    debug!(entities = entities.len(), "exporting");

    let workbook = write_workbook(&entities)?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, XLSX_CONTENT_TYPE.to_owned()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{EXPORT_FILENAME}\""),
            ),
        ],
        workbook,
    ))
}

/// Entities equal to the given field values on every field.
#[instrument(skip_all)]
pub async fn filter_records(
    State(state): State<AppState>,
    payload: Result<Json<Map<String, Value>>, JsonRejection>,
) -> Result<Json<Vec<StoredEntity>>, ApiError> {
    let Json(fields) = payload.map_err(|e| ApiError::InvalidFilter(e.body_text()))?;

    let filter = EntityFilter::from_fields(&fields);
    let entities = state.reconciler.store().find_by_fields(&filter).await?;
    if entities.is_empty() {
        return Err(ApiError::NoRecordsFound);
    }

    Ok(Json(entities))
}
