use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use reconcile_common::committer::CommitReport;
use reconcile_common::error::ReconcileError;
use reconcile_common::store::StoreError;

use crate::export::ExportError;
use crate::spreadsheet::SpreadsheetError;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: &'static str,
    #[serde(flatten)]
    pub report: CommitReport,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid file format. Please upload an Excel file.")]
    InvalidFileFormat,
    #[error("No file uploaded.")]
    MissingFile,
    #[error("failed to read upload: {0}")]
    Multipart(String),
    #[error("{0}")]
    Spreadsheet(#[from] SpreadsheetError),
    #[error("No data found in the Excel file.")]
    EmptyBatch,
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("No records found matching the filters.")]
    NoRecordsFound,

    #[error("store unavailable, please retry")]
    StoreUnavailable(StoreError),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("{0}")]
    Export(#[from] ExportError),
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::EmptyBatch => ApiError::EmptyBatch,
            ReconcileError::StoreUnavailable(err) => ApiError::StoreUnavailable(err),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        if err.is_unavailable() {
            ApiError::StoreUnavailable(err)
        } else {
            ApiError::Store(err)
        }
    }
}

impl From<multer::Error> for ApiError {
    fn from(err: multer::Error) -> Self {
        ApiError::Multipart(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidFileFormat
            | ApiError::MissingFile
            | ApiError::Multipart(_)
            | ApiError::Spreadsheet(_)
            | ApiError::EmptyBatch
            | ApiError::InvalidFilter(_) => StatusCode::BAD_REQUEST,

            ApiError::NoRecordsFound => StatusCode::NOT_FOUND,

            ApiError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,

            ApiError::Store(_) | ApiError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            match &self {
                ApiError::StoreUnavailable(cause) | ApiError::Store(cause) => {
                    error!(error = %cause, "request failed")
                }
                other => error!(error = %other, "request failed"),
            }
        }

        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}
