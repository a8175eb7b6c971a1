//! Append-only log with consumer-group cursors.
//!
//! Both the jobs stream and the results stream sit on this one primitive.
//! The model follows Redis Streams: entries get ordered `<millis>-<seq>`
//! offsets, each consumer group has a delivery cursor plus a pending list of
//! claimed-but-unacknowledged entries, and pending entries idle for longer
//! than the claim timeout can be claimed again by any group member.

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::queue::QueueError;

/// Position of an entry in a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(String);

impl Offset {
    pub fn new(millis: u64, seq: u64) -> Self {
        Self(format!("{millis}-{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into `(millis, seq)`. Offsets that do not parse sort first.
    pub fn parts(&self) -> (u64, u64) {
        let mut it = self.0.splitn(2, '-');
        let millis = it.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let seq = it.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        (millis, seq)
    }

    pub fn millis(&self) -> u64 {
        self.parts().0
    }
}

impl From<String> for Offset {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for Offset {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Offset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts().cmp(&other.parts())
    }
}

/// An entry handed to a consumer by [`StreamLog::claim`].
#[derive(Debug, Clone)]
pub struct Entry {
    pub offset: Offset,
    pub payload: String,
    /// True when the entry was taken over from an expired claim.
    pub redelivered: bool,
}

/// A claimed entry that has not been acknowledged yet.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub offset: Offset,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
    /// `None` once retention has trimmed the entry out of the stream.
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest<'a> {
    pub group: &'a str,
    pub consumer: &'a str,
    pub max: usize,
    /// How long to wait for entries when none are available.
    pub block: Duration,
    /// Pending entries idle at least this long are handed out again.
    pub min_idle: Duration,
}

#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Create `group` on `stream` if it does not exist. With `from_start` the
    /// group sees every entry already in the stream, otherwise only new ones.
    async fn ensure_group(&self, stream: &str, group: &str, from_start: bool) -> Result<(), QueueError>;

    async fn drop_group(&self, stream: &str, group: &str) -> Result<(), QueueError>;

    async fn append(&self, stream: &str, payload: &str) -> Result<Offset, QueueError>;

    /// Expired claims first, then entries the group has never seen.
    async fn claim(&self, stream: &str, request: ClaimRequest<'_>) -> Result<Vec<Entry>, QueueError>;

    /// Returns how many of `offsets` were still pending.
    async fn ack(&self, stream: &str, group: &str, offsets: &[Offset]) -> Result<u64, QueueError>;

    async fn pending(&self, stream: &str, group: &str, max: usize) -> Result<Vec<PendingEntry>, QueueError>;

    /// Drop entries appended more than `age` ago.
    async fn trim_older_than(&self, stream: &str, age: Duration) -> Result<u64, QueueError>;

    /// Set `key` unless it is already live. Returns whether it was set.
    async fn put_marker(&self, key: &str, ttl: Duration) -> Result<bool, QueueError>;

    async fn has_marker(&self, key: &str) -> Result<bool, QueueError>;

    async fn remove_marker(&self, key: &str) -> Result<(), QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}
