//! Ingest Statistics Module
//!
//! Counters for processed change events, exposed on the stats endpoint.

use chrono::{DateTime, Utc};
use serde::Serialize;

// == Ingest Stats ==
/// Tracks change-ingestion activity since startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    /// Events committed successfully
    pub events_processed: u64,
    /// Events rejected; the caller must replay them
    pub events_failed: u64,
    /// Cache keys written across all events, deletes included
    pub keys_written: u64,
    /// Cache keys removed across all events
    pub keys_deleted: u64,
    /// Events whose propagation could not use the membership index
    pub full_recomputes: u64,
    /// Completed rebuilds
    pub rebuilds: u64,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl IngestStats {
    // == Constructor ==
    /// Creates a new IngestStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Failure Rate ==
    /// Returns failed / (processed + failed), or 0.0 before the first event.
    pub fn failure_rate(&self) -> f64 {
        let total = self.events_processed + self.events_failed;
        if total == 0 {
            0.0
        } else {
            self.events_failed as f64 / total as f64
        }
    }

    // == Record Event ==
    /// Counts one committed event.
    ///
    /// # Arguments
    /// * `keys_written` - Number of cache keys the event changed
    /// * `keys_deleted` - How many of those were removed
    /// * `full_recompute` - Whether propagation fell back to a full pass
    pub fn record_event(&mut self, keys_written: usize, keys_deleted: usize, full_recompute: bool) {
        self.events_processed += 1;
        self.keys_written += keys_written as u64;
        self.keys_deleted += keys_deleted as u64;
        if full_recompute {
            self.full_recomputes += 1;
        }
        self.last_event_at = Some(Utc::now());
    }

    // == Record Failure ==
    pub fn record_failure(&mut self) {
        self.events_failed += 1;
    }

    // == Record Rebuild ==
    pub fn record_rebuild(&mut self) {
        self.rebuilds += 1;
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = IngestStats::new();
        assert_eq!(stats.events_processed, 0);
        assert_eq!(stats.events_failed, 0);
        assert!(stats.last_event_at.is_none());
    }

    #[test]
    fn test_failure_rate_no_events() {
        assert_eq!(IngestStats::new().failure_rate(), 0.0);
    }

    #[test]
    fn test_failure_rate_mixed() {
        let mut stats = IngestStats::new();
        stats.record_event(3, 0, false);
        stats.record_failure();
        assert_eq!(stats.failure_rate(), 0.5);
    }

    #[test]
    fn test_record_event_accumulates() {
        let mut stats = IngestStats::new();
        stats.record_event(2, 0, false);
        stats.record_event(5, 1, true);
        assert_eq!(stats.events_processed, 2);
        assert_eq!(stats.keys_written, 7);
        assert_eq!(stats.keys_deleted, 1);
        assert_eq!(stats.full_recomputes, 1);
        assert!(stats.last_event_at.is_some());
    }

    #[test]
    fn test_record_rebuild() {
        let mut stats = IngestStats::new();
        stats.record_rebuild();
        assert_eq!(stats.rebuilds, 1);
    }
}
