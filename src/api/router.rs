use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::auth::require_auth;
use super::handlers;
use crate::AppState;

pub fn create_router(state: AppState) -> Router {
    // Public routes: no authentication required
    let public = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics::render));

    // Protected API routes: require Bearer token when API_TOKEN is set
    let protected = Router::new()
        // Subscriptions
        .route("/api/subscriptions", post(handlers::subscriptions::create))
        .route("/api/subscriptions/:id", delete(handlers::subscriptions::deactivate))
        .route("/api/subscriptions/:id/config", put(handlers::subscriptions::upsert_config))
        .route("/api/users/:user_id/subscriptions", get(handlers::subscriptions::list_for_user))
        // Limit orders
        .route("/api/limit-orders", post(handlers::limit_orders::create))
        .route("/api/limit-orders/:id", get(handlers::limit_orders::detail))
        .route("/api/limit-orders/:id/cancel", post(handlers::limit_orders::cancel))
        // Executions
        .route("/api/executions", get(handlers::executions::list))
        .route("/api/executions/:fingerprint", get(handlers::executions::detail))
        // Feeds
        .route("/api/feeds/gaps", get(handlers::feeds::gaps))
        // Control
        .route("/api/control/stop", post(handlers::control::stop))
        .route("/api/control/resume", post(handlers::control::resume))
        .route("/api/control/status", get(handlers::control::status))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    public
        .merge(protected)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
