//! Database view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

/// Per-agent queue counters shown by `livesync status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub agent_id: i64,
    pub agent_name: String,
    pub pending: i64,
    pub processed: i64,
}
