//! Background Tasks Module
//!
//! Contains the tasks that run for the lifetime of the service.
//!
//! # Tasks
//! - Writer: the single task allowed to mutate caches
//! - Index flush: persists the membership index at configured intervals

mod flush;
mod writer;

pub use flush::spawn_flush_task;
pub use writer::{spawn_writer, Job, WriterHandle};
