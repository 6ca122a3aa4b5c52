use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("batch holds no rows")]
    EmptyBatch,

    /// The store could not be reached, nothing was written for this batch.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        ReconcileError::StoreUnavailable(err)
    }
}
