use std::future::ready;
use std::sync::Arc;

use axum::{
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;

use crate::audit::AuditRecorder;
use crate::cache::FlagCache;
use crate::handlers;
use crate::prometheus::{setup_metrics_recorder, track_metrics};
use crate::store::FlagStore;

#[derive(Clone)]
pub struct State {
    pub store: Arc<dyn FlagStore + Send + Sync>,
    pub cache: FlagCache,
    pub audit: Arc<dyn AuditRecorder + Send + Sync>,
}

pub fn router<S, A>(store: S, cache: FlagCache, audit: A, metrics: bool) -> Router
where
    S: FlagStore + Send + Sync + 'static,
    A: AuditRecorder + Send + Sync + 'static,
{
    let state = State {
        store: Arc::new(store),
        cache,
        audit: Arc::new(audit),
    };

    let router = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route(
            "/flags",
            get(handlers::list_flags).post(handlers::create_flag),
        )
        .route(
            "/flags/:key",
            get(handlers::get_flag)
                .put(handlers::update_flag)
                .delete(handlers::delete_flag),
        )
        .route("/evaluate/:key", get(handlers::evaluate))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when the router is built repeatedly
    // (during tests etc) does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
