//! API Module
//!
//! HTTP handlers and routing for the group cache REST API.
//!
//! # Endpoints
//! - `GET /health`, `GET /stats`
//! - `GET /groups-for-user`, `GET /users-in-group` - membership lookups
//! - `POST /events` - change notifications
//! - `/admin/...` - rebuild, shard and cache administration

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
