use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Start from the next record appended after the reader opens.
pub const OFFSET_NEWEST: i64 = -1;
/// Start from the oldest record still available.
pub const OFFSET_OLDEST: i64 = -2;

/// A single record read from one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub timestamp: DateTime<Utc>,
}
