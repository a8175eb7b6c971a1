//! In-process [`StreamLog`] backend.
//!
//! Mirrors the Redis Streams semantics closely enough that the job store,
//! result channel, dispatcher and worker behave the same on either backend.
//! Used by the test suite and by single-process deployments.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::queue::QueueError;
use super::stream_log::{ClaimRequest, Entry, Offset, PendingEntry, StreamLog};

#[derive(Default)]
struct Stream {
    entries: BTreeMap<Offset, String>,
    last: Option<Offset>,
    groups: HashMap<String, Group>,
}

struct Group {
    /// Highest offset ever delivered to this group.
    cursor: Offset,
    pending: BTreeMap<Offset, Claim>,
}

struct Claim {
    consumer: String,
    claimed_at: Instant,
    delivery_count: u64,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, Stream>,
    markers: HashMap<String, Instant>,
}

pub struct MemoryLog {
    state: Mutex<State>,
    appended: Notify,
    max_len: Option<usize>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            appended: Notify::new(),
            max_len: None,
        }
    }

    /// Cap every stream at `max_len` entries, dropping the oldest first.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            max_len: Some(max_len),
            ..Self::new()
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means another task panicked mid-update; the
        // maps themselves are still structurally valid.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One non-blocking claim pass. Also reports when the earliest live claim
    /// will expire so a blocked caller knows when to look again.
    fn try_claim(
        &self,
        stream_name: &str,
        request: &ClaimRequest<'_>,
    ) -> Result<(Vec<Entry>, Option<Duration>), QueueError> {
        let mut state = self.lock();
        let stream = state
            .streams
            .get_mut(stream_name)
            .ok_or_else(|| unknown_group(stream_name, request.group))?;
        let Stream {
            entries, groups, ..
        } = stream;
        let group = groups
            .get_mut(request.group)
            .ok_or_else(|| unknown_group(stream_name, request.group))?;

        let now = Instant::now();
        let mut out = Vec::new();
        let mut next_expiry: Option<Duration> = None;

        // Expired claims are taken over first; trimmed ones are dropped.
        let mut vanished = Vec::new();
        for (offset, claim) in group.pending.iter_mut() {
            let idle = now.saturating_duration_since(claim.claimed_at);
            if idle < request.min_idle {
                let remaining = request.min_idle - idle;
                next_expiry = Some(next_expiry.map_or(remaining, |n| n.min(remaining)));
                continue;
            }
            if out.len() >= request.max {
                continue;
            }
            match entries.get(offset) {
                Some(payload) => {
                    claim.consumer = request.consumer.to_string();
                    claim.claimed_at = now;
                    claim.delivery_count += 1;
                    out.push(Entry {
                        offset: offset.clone(),
                        payload: payload.clone(),
                        redelivered: true,
                    });
                }
                None => vanished.push(offset.clone()),
            }
        }
        for offset in vanished {
            group.pending.remove(&offset);
        }

        let room = request.max.saturating_sub(out.len());
        if room > 0 {
            let fresh: Vec<(Offset, String)> = entries
                .range((Bound::Excluded(group.cursor.clone()), Bound::Unbounded))
                .take(room)
                .map(|(offset, payload)| (offset.clone(), payload.clone()))
                .collect();

            for (offset, payload) in fresh {
                group.cursor = offset.clone();
                group.pending.insert(
                    offset.clone(),
                    Claim {
                        consumer: request.consumer.to_string(),
                        claimed_at: now,
                        delivery_count: 1,
                    },
                );
                out.push(Entry {
                    offset,
                    payload,
                    redelivered: false,
                });
            }
        }

        Ok((out, next_expiry))
    }
}

fn unknown_group(stream: &str, group: &str) -> QueueError {
    QueueError::UnknownGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

#[async_trait]
impl StreamLog for MemoryLog {
    async fn ensure_group(&self, stream: &str, group: &str, from_start: bool) -> Result<(), QueueError> {
        let mut state = self.lock();
        let stream = state.streams.entry(stream.to_string()).or_default();
        let cursor = if from_start {
            Offset::new(0, 0)
        } else {
            stream.last.clone().unwrap_or_else(|| Offset::new(0, 0))
        };
        stream.groups.entry(group.to_string()).or_insert_with(|| Group {
            cursor,
            pending: BTreeMap::new(),
        });
        Ok(())
    }

    async fn drop_group(&self, stream: &str, group: &str) -> Result<(), QueueError> {
        let mut state = self.lock();
        if let Some(stream) = state.streams.get_mut(stream) {
            stream.groups.remove(group);
        }
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &str) -> Result<Offset, QueueError> {
        let offset = {
            let mut state = self.lock();
            let stream = state.streams.entry(stream.to_string()).or_default();

            let millis = now_millis();
            let offset = match stream.last.as_ref().map(Offset::parts) {
                Some((last_ms, last_seq)) if millis <= last_ms => Offset::new(last_ms, last_seq + 1),
                _ => Offset::new(millis, 0),
            };

            stream.entries.insert(offset.clone(), payload.to_string());
            stream.last = Some(offset.clone());

            if let Some(max_len) = self.max_len {
                while stream.entries.len() > max_len {
                    stream.entries.pop_first();
                }
            }
            offset
        };

        self.appended.notify_waiters();
        Ok(offset)
    }

    async fn claim(&self, stream: &str, request: ClaimRequest<'_>) -> Result<Vec<Entry>, QueueError> {
        let deadline = Instant::now() + request.block;

        loop {
            // Register interest before looking so an append between the check
            // and the wait is not missed.
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let (entries, next_expiry) = self.try_claim(stream, &request)?;
            if !entries.is_empty() {
                return Ok(entries);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let mut wait = deadline - now;
            if let Some(expiry) = next_expiry {
                wait = wait.min(expiry);
            }
            let _ = tokio::time::timeout(wait, appended).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, offsets: &[Offset]) -> Result<u64, QueueError> {
        let mut state = self.lock();
        let Some(group) = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };

        let acked = offsets
            .iter()
            .filter(|offset| group.pending.remove(offset).is_some())
            .count();
        Ok(acked as u64)
    }

    async fn pending(&self, stream: &str, group: &str, max: usize) -> Result<Vec<PendingEntry>, QueueError> {
        let state = self.lock();
        let stream_state = state
            .streams
            .get(stream)
            .ok_or_else(|| unknown_group(stream, group))?;
        let group_state = stream_state
            .groups
            .get(group)
            .ok_or_else(|| unknown_group(stream, group))?;

        let now = Instant::now();
        Ok(group_state
            .pending
            .iter()
            .take(max)
            .map(|(offset, claim)| PendingEntry {
                offset: offset.clone(),
                consumer: claim.consumer.clone(),
                idle: now.saturating_duration_since(claim.claimed_at),
                delivery_count: claim.delivery_count,
                payload: stream_state.entries.get(offset).cloned(),
            })
            .collect())
    }

    async fn trim_older_than(&self, stream: &str, age: Duration) -> Result<u64, QueueError> {
        let cutoff = now_millis().saturating_sub(age.as_millis() as u64);
        let mut state = self.lock();
        let Some(stream) = state.streams.get_mut(stream) else {
            return Ok(0);
        };

        let before = stream.entries.len();
        stream.entries.retain(|offset, _| offset.millis() >= cutoff);
        Ok((before - stream.entries.len()) as u64)
    }

    async fn put_marker(&self, key: &str, ttl: Duration) -> Result<bool, QueueError> {
        let mut state = self.lock();
        let now = Instant::now();
        // Expired markers are only evicted here.
        state.markers.retain(|_, expires_at| *expires_at > now);
        match state.markers.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                state.markers.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn has_marker(&self, key: &str) -> Result<bool, QueueError> {
        let state = self.lock();
        Ok(state
            .markers
            .get(key)
            .is_some_and(|expires_at| *expires_at > Instant::now()))
    }

    async fn remove_marker(&self, key: &str) -> Result<(), QueueError> {
        self.lock().markers.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(group: &'a str, consumer: &'a str) -> ClaimRequest<'a> {
        ClaimRequest {
            group,
            consumer,
            max: 10,
            block: Duration::ZERO,
            min_idle: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_offsets_strictly_increase() {
        let log = MemoryLog::new();
        let mut last = Offset::new(0, 0);
        for i in 0..50 {
            let offset = log.append("s", &i.to_string()).await.unwrap();
            assert!(offset > last);
            last = offset;
        }
    }

    #[tokio::test]
    async fn test_group_created_at_end_skips_history() {
        let log = MemoryLog::new();
        log.append("s", "old").await.unwrap();
        log.ensure_group("s", "late", false).await.unwrap();
        log.ensure_group("s", "early", true).await.unwrap();
        log.append("s", "new").await.unwrap();

        let late = log.claim("s", request("late", "c")).await.unwrap();
        assert_eq!(late.iter().map(|e| e.payload.as_str()).collect::<Vec<_>>(), ["new"]);

        let early = log.claim("s", request("early", "c")).await.unwrap();
        assert_eq!(early.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_unknown_group_fails() {
        let log = MemoryLog::new();
        let err = log.claim("s", request("missing", "c")).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownGroup { .. }));
    }

    #[tokio::test]
    async fn test_max_len_drops_oldest() {
        let log = MemoryLog::with_max_len(2);
        log.ensure_group("s", "g", true).await.unwrap();
        for payload in ["a", "b", "c"] {
            log.append("s", payload).await.unwrap();
        }
        let entries = log.claim("s", request("g", "c")).await.unwrap();
        assert_eq!(entries.iter().map(|e| e.payload.as_str()).collect::<Vec<_>>(), ["b", "c"]);
    }

    #[tokio::test]
    async fn test_marker_expires() {
        let log = MemoryLog::new();
        assert!(log.put_marker("k", Duration::from_millis(20)).await.unwrap());
        assert!(!log.put_marker("k", Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!log.has_marker("k").await.unwrap());
        assert!(log.put_marker("k", Duration::from_secs(1)).await.unwrap());
        log.remove_marker("k").await.unwrap();
        assert!(!log.has_marker("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_markers_are_evicted() {
        let log = MemoryLog::new();
        for i in 0..10 {
            log.put_marker(&format!("done:{i}"), Duration::from_millis(10)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(log.put_marker("live", Duration::from_secs(60)).await.unwrap());
        assert_eq!(log.lock().markers.len(), 1);
        assert!(log.has_marker("live").await.unwrap());
    }

    #[tokio::test]
    async fn test_trim_drops_old_entries_and_pending_reports_gap() {
        let log = MemoryLog::new();
        log.ensure_group("s", "g", true).await.unwrap();
        log.append("s", "old").await.unwrap();
        log.claim("s", request("g", "c")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        log.append("s", "fresh").await.unwrap();

        let removed = log.trim_older_than("s", Duration::from_millis(15)).await.unwrap();
        assert_eq!(removed, 1);

        let pending = log.pending("s", "g", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].payload.is_none());
    }
}
