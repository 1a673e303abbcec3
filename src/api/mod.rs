//! HTTP read/control surface, rooted at `/api/v1`.

pub mod error;
pub mod routes;

pub use error::ApiError;

use std::sync::Arc;

use axum::routing::{get, patch, post};
use axum::Router;
use parking_lot::RwLock;

use crate::aggregator::BarGenerator;
use crate::digest::DigestService;
use crate::models::Config;
use crate::providers::{SearchProvider, UpstreamRateLimit};
use crate::registry::TopicRegistry;
use crate::store::{BarStore, TickStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Arc<TopicRegistry>,
    pub tick_store: Arc<TickStore>,
    pub bar_store: Arc<BarStore>,
    pub generator: Arc<BarGenerator>,
    pub digest_service: Arc<DigestService>,
    pub search: Arc<dyn SearchProvider>,
    /// Last-observed upstream search limit headers, when a live client is
    /// wired up.
    pub upstream_limit: Option<Arc<RwLock<UpstreamRateLimit>>>,
}

pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/topics", get(routes::list_topics).post(routes::create_topic))
        .route(
            "/topics/:id",
            get(routes::get_topic).delete(routes::delete_topic),
        )
        .route("/topics/:id/pause", post(routes::pause_topic))
        .route("/topics/:id/resume", post(routes::resume_topic))
        .route("/topics/:id/resolution", patch(routes::update_resolution))
        .route("/topics/:id/bars", get(routes::get_bars))
        .route("/topics/:id/bars/latest", get(routes::get_latest_bar))
        .route("/topics/:id/poll", post(routes::trigger_poll))
        .route("/topics/:id/digest", post(routes::create_digest))
        .route("/resolutions", get(routes::list_resolutions))
        .route("/health", get(routes::health));

    Router::new()
        .route("/", get(routes::root))
        .nest("/api/v1", v1)
        .with_state(state)
}
