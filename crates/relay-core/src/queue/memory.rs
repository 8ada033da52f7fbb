use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::{clamp_lease, Queue, QueueError, ReceivedMessage};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    body: String,
    visible_at: DateTime<Utc>,
    receive_count: u32,
    handle: Option<String>,
}

/// In-process queue with lease semantics driven by an injectable clock.
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, VecDeque<Entry>>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Entry>>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bodies currently held for `queue`, in send order, visible or not.
    pub fn snapshot(&self, queue: &str) -> Vec<String> {
        self.lock()
            .get(queue)
            .map(|q| q.iter().map(|e| e.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn send(&self, queue: &str, body: &str) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let now = self.clock.now();
        self.lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(Entry {
                id: id.clone(),
                body: body.to_string(),
                visible_at: now,
                receive_count: 0,
                handle: None,
            });
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &str,
        max: usize,
        lease: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let now = self.clock.now();
        let lease = chrono::Duration::from_std(clamp_lease(lease))
            .map_err(|e| QueueError::Storage(e.to_string()))?;
        let mut queues = self.lock();
        let Some(entries) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for entry in entries.iter_mut().filter(|e| e.visible_at <= now).take(max) {
            let handle = Uuid::new_v4().to_string();
            entry.visible_at = now + lease;
            entry.receive_count += 1;
            entry.handle = Some(handle.clone());
            out.push(ReceivedMessage {
                id: entry.id.clone(),
                handle,
                body: entry.body.clone(),
                receive_count: entry.receive_count,
            });
        }
        Ok(out)
    }

    async fn delete(&self, queue: &str, handle: &str) -> Result<(), QueueError> {
        let mut queues = self.lock();
        let position = queues.get(queue).and_then(|entries| {
            entries
                .iter()
                .position(|e| e.handle.as_deref() == Some(handle))
        });
        match (position, queues.get_mut(queue)) {
            (Some(idx), Some(entries)) => {
                entries.remove(idx);
                Ok(())
            }
            _ => Err(QueueError::UnknownHandle {
                queue: queue.to_string(),
                handle: handle.to_string(),
            }),
        }
    }

    async fn depth(&self, queue: &str) -> Result<usize, QueueError> {
        Ok(self.lock().get(queue).map(|q| q.len()).unwrap_or(0))
    }
}
