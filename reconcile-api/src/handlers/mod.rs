use std::sync::Arc;

use reconcile_common::reconciler::Reconciler;

pub mod records;
pub mod upload;

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(reconciler: Reconciler) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
        }
    }
}
