pub const ROWS_RECONCILED: &str = "reconcile_rows_total";
pub const BATCH_SIZE: &str = "reconcile_batch_size";
pub const BATCH_DURATION: &str = "reconcile_batch_duration_ms";
pub const BATCH_REJECTED: &str = "reconcile_batch_rejected_total";
pub const MATCH_CANDIDATES: &str = "reconcile_match_candidates";
pub const LOCK_WAIT_DURATION: &str = "reconcile_identity_lock_wait_ms";
pub const BULK_WRITE_OPS: &str = "reconcile_bulk_write_ops_total";
pub const STORE_QUERY_DURATION: &str = "reconcile_store_query_duration_ms";
