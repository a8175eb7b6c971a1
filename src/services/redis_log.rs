//! Redis Streams backend for [`StreamLog`].
//!
//! - append: `XADD <stream> MAXLEN ~ <n> * data <json>`
//! - groups: `XGROUP CREATE ... MKSTREAM` / `XGROUP DESTROY`
//! - claim: `XAUTOCLAIM` for expired claims, then `XREADGROUP ... >`
//! - ack: `XACK`, introspection: `XPENDING` + `XRANGE`
//! - retention: `XTRIM MINID`, markers: `SET NX PX` / `EXISTS` / `DEL`
//!
//! Requires Redis 7.0 or newer (XAUTOCLAIM reporting deleted entries).

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Value;

use super::queue::QueueError;
use super::stream_log::{ClaimRequest, Entry, Offset, PendingEntry, StreamLog};

const DATA_FIELD: &str = "data";
/// XAUTOCLAIM scan start, and the cursor returned once the scan wrapped.
const START_CURSOR: &str = "0-0";

pub struct RedisStreamLog {
    client: redis::Client,
    max_len: usize,
}

type RawEntry = (String, HashMap<String, String>);

impl RedisStreamLog {
    pub fn new(redis_url: &str, max_len: usize) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::StoreUnavailable)?;
        Ok(Self { client, max_len })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::StoreUnavailable)
    }

    fn map_group_error(e: redis::RedisError, stream: &str, group: &str) -> QueueError {
        if e.code() == Some("NOGROUP") {
            QueueError::UnknownGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            }
        } else {
            QueueError::StoreUnavailable(e)
        }
    }

    /// Take over entries idle past `min_idle`, following the scan cursor
    /// until the stream is exhausted or the batch is full.
    async fn autoclaim(
        &self,
        conn: &mut MultiplexedConnection,
        stream: &str,
        request: &ClaimRequest<'_>,
    ) -> Result<Vec<Entry>, QueueError> {
        let mut entries = Vec::new();
        let mut cursor = START_CURSOR.to_string();

        while entries.len() < request.max {
            let reply: Value = redis::cmd("XAUTOCLAIM")
                .arg(stream)
                .arg(request.group)
                .arg(request.consumer)
                .arg(request.min_idle.as_millis() as u64)
                .arg(&cursor)
                .arg("COUNT")
                .arg(request.max - entries.len())
                .query_async(conn)
                .await
                .map_err(|e| Self::map_group_error(e, stream, request.group))?;

            let (next, claimed) = parse_autoclaim(&reply)?;
            entries.extend(claimed);
            if next == START_CURSOR {
                break;
            }
            cursor = next;
        }
        Ok(entries)
    }

    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        stream: &str,
        request: &ClaimRequest<'_>,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<Entry>, QueueError> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(request.group)
            .arg(request.consumer)
            .arg("COUNT")
            .arg(count);
        if let Some(block) = block {
            // BLOCK 0 means forever in Redis.
            cmd.arg("BLOCK").arg((block.as_millis() as u64).max(1));
        }
        cmd.arg("STREAMS").arg(stream).arg(">");

        let reply: Value = cmd
            .query_async(conn)
            .await
            .map_err(|e| Self::map_group_error(e, stream, request.group))?;

        if matches!(reply, Value::Nil) {
            return Ok(Vec::new());
        }

        let streams: Vec<(String, Value)> = redis::from_redis_value(&reply)?;
        Ok(streams
            .iter()
            .filter(|(name, _)| name == stream)
            .flat_map(|(_, entries)| parse_entries(entries, false))
            .collect())
    }
}

/// Split an XAUTOCLAIM reply into the next cursor and the claimed entries.
fn parse_autoclaim(reply: &Value) -> Result<(String, Vec<Entry>), QueueError> {
    let Value::Array(parts) = reply else {
        return Err(QueueError::Malformed("XAUTOCLAIM reply is not an array".to_string()));
    };
    let cursor = parts
        .first()
        .and_then(|v| redis::from_redis_value::<String>(v).ok())
        .ok_or_else(|| QueueError::Malformed("XAUTOCLAIM reply has no cursor".to_string()))?;
    let entries = parts
        .get(1)
        .ok_or_else(|| QueueError::Malformed("XAUTOCLAIM reply has no entries".to_string()))?;
    Ok((cursor, parse_entries(entries, true)))
}

fn parse_entries(value: &Value, redelivered: bool) -> Vec<Entry> {
    let Value::Array(items) = value else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match redis::from_redis_value::<RawEntry>(item) {
            Ok((id, mut fields)) => match fields.remove(DATA_FIELD) {
                Some(payload) => Some(Entry {
                    offset: Offset::from(id),
                    payload,
                    redelivered,
                }),
                None => {
                    tracing::warn!(offset = %id, "Stream entry without data field");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable stream entry");
                None
            }
        })
        .collect()
}

#[async_trait]
impl StreamLog for RedisStreamLog {
    async fn ensure_group(&self, stream: &str, group: &str, from_start: bool) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(if from_start { "0" } else { "$" })
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                tracing::info!(stream, group, "Consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::StoreUnavailable(e)),
        }
    }

    async fn drop_group(&self, stream: &str, group: &str) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("XGROUP")
            .arg("DESTROY")
            .arg(stream)
            .arg(group)
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &str) -> Result<Offset, QueueError> {
        let mut conn = self.conn().await?;
        let id: String = redis::cmd("XADD")
            .arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg(DATA_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(Offset::from(id))
    }

    async fn claim(&self, stream: &str, request: ClaimRequest<'_>) -> Result<Vec<Entry>, QueueError> {
        // Dedicated connection: a blocking XREADGROUP would stall every other
        // command multiplexed onto a shared one.
        let mut conn = self.conn().await?;

        let mut entries = self.autoclaim(&mut conn, stream, &request).await?;
        let room = request.max.saturating_sub(entries.len());
        if room > 0 {
            let block = (entries.is_empty() && !request.block.is_zero()).then_some(request.block);
            entries.extend(self.read_new(&mut conn, stream, &request, room, block).await?);
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, offsets: &[Offset]) -> Result<u64, QueueError> {
        if offsets.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let ids: Vec<&str> = offsets.iter().map(Offset::as_str).collect();
        let acked: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;
        Ok(acked)
    }

    async fn pending(&self, stream: &str, group: &str, max: usize) -> Result<Vec<PendingEntry>, QueueError> {
        let mut conn = self.conn().await?;
        let rows: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::map_group_error(e, stream, group))?;

        let mut pending = Vec::with_capacity(rows.len());
        for (id, consumer, idle_ms, delivery_count) in rows {
            let mut body: Vec<RawEntry> = redis::cmd("XRANGE")
                .arg(stream)
                .arg(&id)
                .arg(&id)
                .arg("COUNT")
                .arg(1)
                .query_async(&mut conn)
                .await?;

            pending.push(PendingEntry {
                offset: Offset::from(id),
                consumer,
                idle: Duration::from_millis(idle_ms),
                delivery_count,
                payload: body.pop().and_then(|(_, mut fields)| fields.remove(DATA_FIELD)),
            });
        }
        Ok(pending)
    }

    async fn trim_older_than(&self, stream: &str, age: Duration) -> Result<u64, QueueError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let cutoff = Offset::new(now.saturating_sub(age.as_millis() as u64), 0);

        let mut conn = self.conn().await?;
        let removed: u64 = redis::cmd("XTRIM")
            .arg(stream)
            .arg("MINID")
            .arg(cutoff.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn put_marker(&self, key: &str, ttl: Duration) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg((ttl.as_millis() as u64).max(1))
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn has_marker(&self, key: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let count: u64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(count > 0)
    }

    async fn remove_marker(&self, key: &str) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL").arg(key).query_async::<u64>(&mut conn).await?;
        Ok(())
    }

    /// Check Redis connectivity (for health checks).
    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    fn entry(id: &str, payload: &str) -> Value {
        Value::Array(vec![bulk(id), Value::Array(vec![bulk(DATA_FIELD), bulk(payload)])])
    }

    #[test]
    fn test_autoclaim_reply_yields_cursor_and_entries() {
        let reply = Value::Array(vec![
            bulk("1700000000000-3"),
            Value::Array(vec![entry("1700000000000-1", "{}"), entry("1700000000000-2", "[]")]),
            Value::Array(vec![]),
        ]);

        let (cursor, entries) = parse_autoclaim(&reply).unwrap();
        assert_eq!(cursor, "1700000000000-3");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].offset.as_str(), "1700000000000-2");
        assert!(entries.iter().all(|e| e.redelivered));
    }

    #[test]
    fn test_autoclaim_reply_at_end_of_scan() {
        let reply = Value::Array(vec![bulk(START_CURSOR), Value::Array(vec![]), Value::Array(vec![])]);
        let (cursor, entries) = parse_autoclaim(&reply).unwrap();
        assert_eq!(cursor, START_CURSOR);
        assert!(entries.is_empty());
    }

    #[test]
    fn test_autoclaim_reply_without_cursor_is_malformed() {
        assert!(matches!(parse_autoclaim(&Value::Nil), Err(QueueError::Malformed(_))));
        assert!(matches!(
            parse_autoclaim(&Value::Array(vec![])),
            Err(QueueError::Malformed(_))
        ));
    }
}
