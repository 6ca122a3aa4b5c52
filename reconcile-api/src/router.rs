use std::convert::Infallible;
use std::future::ready;

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use reconcile_common::store::DocumentStore;

use crate::api::ApiError;
use crate::handlers::{records, upload, AppState};
use crate::prometheus::{setup_metrics_recorder, track_metrics};

async fn index() -> &'static str {
    "reconcile api"
}

async fn readiness(State(state): State<AppState>) -> Result<&'static str, ApiError> {
    state
        .reconciler
        .store()
        .ping()
        .await
        .map_err(ApiError::StoreUnavailable)?;
    Ok("ready")
}

pub fn router(
    state: AppState,
    max_body_size: usize,
    concurrency_limit: usize,
    metrics: bool,
) -> Router {
    // Browsers upload straight from other origins, with credentials.
    let cors = CorsLayer::new()
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request());

    let upload = post(upload::upload)
        .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
        .layer(DefaultBodyLimit::max(max_body_size));
    let update = post(upload::update)
        .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
        .layer(DefaultBodyLimit::max(max_body_size));

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(index))
        .route("/upload", upload.clone())
        .route("/upload/", upload)
        .route("/update", update.clone())
        .route("/update/", update)
        .route("/export", get(records::export))
        .route("/export/", get(records::export))
        .route("/filter-records", post(records::filter_records))
        .route("/filter-records/", post(records::filter_records))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // The recorder is global, tests build many routers and leave it off.
    if metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
