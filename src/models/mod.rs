//! Request and Response models for the group cache API
//!
//! This module defines the DTOs (Data Transfer Objects) used for
//! serializing/deserializing HTTP request and response bodies.

pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use requests::{AddShardRequest, ChangeEventRequest, EntryPayload, MembershipQuery, RebuildRequest};
pub use responses::{
    CacheStatus, ErrorResponse, EventResponse, HealthResponse, IndexStatus, MembershipResponse,
    RemoveResponse, ShardResponse, StatsResponse,
};
