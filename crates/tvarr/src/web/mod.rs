//! HTTP surface owned by the core: the stream endpoints. The CRUD API,
//! static assets and UI live elsewhere and are not part of this crate.

pub mod streams;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

pub use streams::StreamState;

pub fn stream_router(state: Arc<StreamState>) -> Router {
    // Browser-based HLS/DASH players fetch manifests cross-origin.
    Router::new()
        .route("/proxy/{channel_id}", get(streams::stream_channel))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
