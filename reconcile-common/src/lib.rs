pub mod committer;
pub mod decision;
pub mod error;
pub mod locks;
pub mod matcher;
pub mod metrics;
pub mod metrics_consts;
pub mod normalize;
pub mod reconciler;
pub mod record;
pub mod store;
