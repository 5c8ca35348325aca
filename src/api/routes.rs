//! API Routes
//!
//! Configures the Axum router with all group cache endpoints.

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    add_shard_handler, event_handler, groups_for_user_handler, health_handler,
    rebuild_handler, remove_cache_handler, stats_handler, subscriptions_handler,
    users_in_group_handler, AppState,
};

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `GET /health` - Health check endpoint
/// - `GET /stats` - Ingest counters and per-cache state
/// - `GET /groups-for-user?dn=&nested=` - Groups of a user
/// - `GET /users-in-group?dn=&nested=` - Users of a group
/// - `POST /events` - Apply one directory change event
/// - `POST /admin/caches/:name/rebuild` - Rebuild a cache from a snapshot
/// - `POST /admin/caches/:name/shards` - Add a shard class to a cache
/// - `DELETE /admin/caches/:name` - Remove a cache
/// - `GET /admin/subscriptions` - Filters the change feed must deliver
///
/// # Middleware
/// - CORS: Allows any origin (configurable for production)
/// - Tracing: Logs all requests for debugging
pub fn create_router(state: AppState) -> Router {
    // Configure CORS middleware
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let admin = Router::new()
        .route("/caches/:name", delete(remove_cache_handler))
        .route("/caches/:name/rebuild", post(rebuild_handler))
        .route("/caches/:name/shards", post(add_shard_handler))
        .route("/subscriptions", get(subscriptions_handler));

    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/groups-for-user", get(groups_for_user_handler))
        .route("/users-in-group", get(users_in_group_handler))
        .route("/events", post(event_handler))
        .nest("/admin", admin)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
