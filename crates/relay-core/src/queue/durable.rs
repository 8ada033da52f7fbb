//! redb-backed queue that survives restarts.
//!
//! # Table design
//!
//! `MESSAGES` keys are
//! ```text
//! [ name_len: u16 BE | queue name | visible_at_ms: u64 BE | message id ]
//! ```
//! so one range scan per queue, bounded above by `now`, yields every visible
//! message in visibility order. Receiving a message re-keys it under its lease
//! deadline. `HANDLES` maps the current receipt handle to the message key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{clamp_lease, Queue, QueueError, ReceivedMessage};
use crate::clock::{Clock, SystemClock};

const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");
const HANDLES: TableDefinition<&str, &[u8]> = TableDefinition::new("handles");

#[derive(Debug, Serialize, Deserialize)]
struct StoredMessage {
    id: String,
    body: String,
    receive_count: u32,
    #[serde(default)]
    handle: Option<String>,
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn queue_prefix(queue: &str) -> Vec<u8> {
    let name = queue.as_bytes();
    let mut prefix = Vec::with_capacity(2 + name.len());
    prefix.extend_from_slice(&(name.len() as u16).to_be_bytes());
    prefix.extend_from_slice(name);
    prefix
}

fn message_key(queue: &str, visible_at: DateTime<Utc>, id: &str) -> Vec<u8> {
    let mut key = queue_prefix(queue);
    let ms = visible_at.timestamp_millis().max(0) as u64;
    key.extend_from_slice(&ms.to_be_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

/// Upper bound covering every message of `queue` visible at `now`.
fn visible_upper_bound(queue: &str, now: DateTime<Utc>) -> Vec<u8> {
    let mut key = queue_prefix(queue);
    let ms = now.timestamp_millis().max(0) as u64;
    key.extend_from_slice(&ms.to_be_bytes());
    key.extend_from_slice(&[0xff; 16]);
    key
}

fn queue_upper_bound(queue: &str) -> Vec<u8> {
    let mut key = queue_prefix(queue);
    key.extend_from_slice(&[0xff; 24]);
    key
}

fn storage<E: std::fmt::Display>(e: E) -> QueueError {
    QueueError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// DurableQueue
// ---------------------------------------------------------------------------

/// Transactions are short and run inline on the calling task.
pub struct DurableQueue {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl DurableQueue {
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: &Path, clock: Arc<dyn Clock>) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(storage)?;
        }
        let db = Database::create(path).map_err(storage)?;
        let wt = db.begin_write().map_err(storage)?;
        wt.open_table(MESSAGES).map_err(storage)?;
        wt.open_table(HANDLES).map_err(storage)?;
        wt.commit().map_err(storage)?;
        Ok(Self { db, clock })
    }
}

#[async_trait]
impl Queue for DurableQueue {
    async fn send(&self, queue: &str, body: &str) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let key = message_key(queue, self.clock.now(), &id);
        let value = serde_json::to_vec(&StoredMessage {
            id: id.clone(),
            body: body.to_string(),
            receive_count: 0,
            handle: None,
        })?;

        let wt = self.db.begin_write().map_err(storage)?;
        {
            let mut table = wt.open_table(MESSAGES).map_err(storage)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(storage)?;
        }
        wt.commit().map_err(storage)?;
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &str,
        max: usize,
        lease: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let visible_at = now + chrono::Duration::from_std(clamp_lease(lease)).map_err(storage)?;
        let lower = queue_prefix(queue);
        let upper = visible_upper_bound(queue, now);

        let wt = self.db.begin_write().map_err(storage)?;
        let mut out = Vec::new();
        {
            let mut messages = wt.open_table(MESSAGES).map_err(storage)?;
            let mut handles = wt.open_table(HANDLES).map_err(storage)?;

            let mut due: Vec<(Vec<u8>, StoredMessage)> = Vec::new();
            for entry in messages
                .range(lower.as_slice()..=upper.as_slice())
                .map_err(storage)?
                .take(max)
            {
                let (k, v) = entry.map_err(storage)?;
                due.push((k.value().to_vec(), serde_json::from_slice(v.value())?));
            }

            for (old_key, mut msg) in due {
                messages.remove(old_key.as_slice()).map_err(storage)?;
                if let Some(stale) = msg.handle.take() {
                    handles.remove(stale.as_str()).map_err(storage)?;
                }

                let handle = Uuid::new_v4().to_string();
                msg.receive_count += 1;
                msg.handle = Some(handle.clone());
                let new_key = message_key(queue, visible_at, &msg.id);
                let value = serde_json::to_vec(&msg)?;
                messages
                    .insert(new_key.as_slice(), value.as_slice())
                    .map_err(storage)?;
                handles
                    .insert(handle.as_str(), new_key.as_slice())
                    .map_err(storage)?;

                out.push(ReceivedMessage {
                    id: msg.id,
                    handle,
                    body: msg.body,
                    receive_count: msg.receive_count,
                });
            }
        }
        wt.commit().map_err(storage)?;
        Ok(out)
    }

    async fn delete(&self, queue: &str, handle: &str) -> Result<(), QueueError> {
        let unknown = || QueueError::UnknownHandle {
            queue: queue.to_string(),
            handle: handle.to_string(),
        };
        let prefix = queue_prefix(queue);

        let wt = self.db.begin_write().map_err(storage)?;
        {
            let mut handles = wt.open_table(HANDLES).map_err(storage)?;
            let key = match handles.get(handle).map_err(storage)? {
                Some(k) => k.value().to_vec(),
                None => return Err(unknown()),
            };
            if !key.starts_with(&prefix) {
                return Err(unknown());
            }
            handles.remove(handle).map_err(storage)?;
            let mut messages = wt.open_table(MESSAGES).map_err(storage)?;
            messages.remove(key.as_slice()).map_err(storage)?;
        }
        wt.commit().map_err(storage)?;
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<usize, QueueError> {
        let lower = queue_prefix(queue);
        let upper = queue_upper_bound(queue);
        let rt = self.db.begin_read().map_err(storage)?;
        let table = rt.open_table(MESSAGES).map_err(storage)?;
        let mut count = 0;
        for entry in table
            .range(lower.as_slice()..=upper.as_slice())
            .map_err(storage)?
        {
            entry.map_err(storage)?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use tempfile::TempDir;

    fn open(dir: &TempDir, clock: &FakeClock) -> DurableQueue {
        DurableQueue::open_with_clock(&dir.path().join("queue.redb"), Arc::new(clock.clone()))
            .unwrap()
    }

    #[tokio::test]
    async fn lease_and_redelivery() {
        let dir = TempDir::new().unwrap();
        let clock = FakeClock::default();
        let q = open(&dir, &clock);
        q.send("apply", "hello").await.unwrap();

        let first = q.receive("apply", 10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].body, "hello");
        assert!(q.receive("apply", 10, Duration::from_secs(5)).await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(6));
        let second = q.receive("apply", 10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].receive_count, 2);

        assert!(matches!(
            q.delete("apply", &first[0].handle).await,
            Err(QueueError::UnknownHandle { .. })
        ));
        q.delete("apply", &second[0].handle).await.unwrap();
        assert_eq!(q.depth("apply").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        let clock = FakeClock::default();
        {
            let q = open(&dir, &clock);
            q.send("schedule", "one").await.unwrap();
            clock.advance(chrono::Duration::milliseconds(1));
            q.send("schedule", "two").await.unwrap();
            q.receive("schedule", 1, Duration::from_secs(30)).await.unwrap();
        }

        let q = open(&dir, &clock);
        assert_eq!(q.depth("schedule").await.unwrap(), 2);
        let visible = q.receive("schedule", 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].body, "two");
    }

    #[tokio::test]
    async fn queue_names_do_not_overlap() {
        let dir = TempDir::new().unwrap();
        let clock = FakeClock::default();
        let q = open(&dir, &clock);
        q.send("ab", "x").await.unwrap();
        q.send("a", "y").await.unwrap();

        let got = q.receive("a", 10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].body, "y");
        assert!(matches!(
            q.delete("ab", &got[0].handle).await,
            Err(QueueError::UnknownHandle { .. })
        ));
    }
}
