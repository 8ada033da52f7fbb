//! Debounced per-key timers.
//!
//! `schedule` always replaces: at most one live entry exists per key, and a
//! replaced timer never reaches the callback. Firing removes the entry and
//! invokes the callback while the registry lock is held, so callbacks must be
//! quick and must not call back into the registry; hand work off through a
//! channel instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

pub type FireCallback<P> = Arc<dyn Fn(&str, P) + Send + Sync>;

struct TimerEntry {
    generation: u64,
    deadline: Instant,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, TimerEntry>,
    next_generation: u64,
}

pub struct TimerRegistry<P> {
    inner: Arc<Mutex<Inner>>,
    on_fire: FireCallback<P>,
}

impl<P> Clone for TimerRegistry<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            on_fire: Arc::clone(&self.on_fire),
        }
    }
}

impl<P: Send + 'static> TimerRegistry<P> {
    pub fn new<F>(on_fire: F) -> Self
    where
        F: Fn(&str, P) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            on_fire: Arc::new(on_fire),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cancel any timer under `key` and start a new one. Must be called from
    /// within a tokio runtime. Returns true when an existing timer was replaced.
    pub fn schedule(&self, key: &str, after: Duration, payload: P) -> bool {
        let mut inner = self.lock();
        let replaced = match inner.entries.remove(key) {
            Some(old) => {
                old.task.abort();
                true
            }
            None => false,
        };

        inner.next_generation += 1;
        let generation = inner.next_generation;
        let shared = Arc::clone(&self.inner);
        let on_fire = Arc::clone(&self.on_fire);
        let owned_key = key.to_string();

        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let mut inner = shared.lock().unwrap_or_else(|e| e.into_inner());
            // A replacement may have landed between wake-up and lock.
            match inner.entries.get(&owned_key) {
                Some(entry) if entry.generation == generation => {}
                _ => return,
            }
            inner.entries.remove(&owned_key);
            debug!(key = %owned_key, "timer fired");
            on_fire(&owned_key, payload);
        });

        inner.entries.insert(
            key.to_string(),
            TimerEntry {
                generation,
                deadline: Instant::now() + after,
                task,
            },
        );
        debug!(key, after_ms = after.as_millis() as u64, replaced, "timer scheduled");
        replaced
    }

    pub fn cancel(&self, key: &str) -> bool {
        match self.lock().entries.remove(key) {
            Some(entry) => {
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, entry) in self.lock().entries.drain() {
            entry.task.abort();
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn remaining(&self, key: &str) -> Option<Duration> {
        self.lock()
            .entries
            .get(key)
            .map(|e| e.deadline.saturating_duration_since(Instant::now()))
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time;

    fn registry() -> (TimerRegistry<&'static str>, mpsc::UnboundedReceiver<(String, &'static str)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reg = TimerRegistry::new(move |key: &str, payload| {
            let _ = tx.send((key.to_string(), payload));
        });
        (reg, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_duration() {
        let (reg, mut rx) = registry();
        let start = Instant::now();
        assert!(!reg.schedule("a1", Duration::from_secs(30), "p"));
        assert!(reg.contains("a1"));

        let (key, payload) = rx.recv().await.unwrap();
        assert_eq!((key.as_str(), payload), ("a1", "p"));
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert!(!reg.contains("a1"));
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_pending_timer() {
        let (reg, mut rx) = registry();
        let start = Instant::now();
        reg.schedule("a1", Duration::from_secs(10), "first");
        assert!(reg.schedule("a1", Duration::from_secs(20), "second"));
        assert_eq!(reg.len(), 1);

        let (_, payload) = rx.recv().await.unwrap();
        assert_eq!(payload, "second");
        assert_eq!(start.elapsed(), Duration::from_secs(20));

        time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_replacement_still_wins() {
        let (reg, mut rx) = registry();
        reg.schedule("a1", Duration::from_secs(60), "long");
        reg.schedule("a1", Duration::from_secs(5), "short");

        let (_, payload) = rx.recv().await.unwrap();
        assert_eq!(payload, "short");
        time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let (reg, mut rx) = registry();
        reg.schedule("a1", Duration::from_secs(5), "one");
        reg.schedule("a2", Duration::from_secs(10), "two");

        assert_eq!(rx.recv().await.unwrap().1, "one");
        assert_eq!(rx.recv().await.unwrap().1, "two");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_fire() {
        let (reg, mut rx) = registry();
        reg.schedule("a1", Duration::from_secs(5), "p");
        assert!(reg.cancel("a1"));
        assert!(!reg.cancel("a1"));

        time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_counts_down() {
        let (reg, _rx) = registry();
        reg.schedule("a1", Duration::from_secs(30), "p");
        time::advance(Duration::from_secs(10)).await;
        assert_eq!(reg.remaining("a1"), Some(Duration::from_secs(20)));
        assert_eq!(reg.remaining("missing"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_clears_everything() {
        let (reg, mut rx) = registry();
        reg.schedule("a1", Duration::from_secs(5), "p");
        reg.schedule("a2", Duration::from_secs(5), "q");
        reg.cancel_all();
        assert!(reg.is_empty());

        time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }
}
