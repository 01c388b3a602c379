//! In-process [`QueueStore`] for tests and local development without Redis.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::Result;
use crate::store::QueueStore;

#[derive(Default)]
struct Inner {
    lists: HashMap<String, VecDeque<String>>,
    values: HashMap<String, (String, Instant)>,
}

impl Inner {
    fn set(&mut self, key: &str, value: &str, ttl: Duration) {
        self.values
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
    }

    fn get(&mut self, key: &str) -> Option<String> {
        match self.values.get(key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                self.values.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    pushed: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_pop(&self, list: &str) -> Option<String> {
        self.inner
            .lock()
            .lists
            .get_mut(list)
            .and_then(|items| items.pop_back())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn push_with_value(
        &self,
        list: &str,
        payload: &str,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner
                .lists
                .entry(list.to_string())
                .or_default()
                .push_front(payload.to_string());
            inner.set(key, value, ttl);
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn blocking_pop(&self, list: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            // Register interest before checking so a push in between is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.try_pop(list) {
                return Ok(Some(payload));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn set_many(&self, entries: &[(String, String)], ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        for (key, value) in entries {
            inner.set(key, value, ttl);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().get(key))
    }

    async fn list_len(&self, list: &str) -> Result<u64> {
        Ok(self
            .inner
            .lock()
            .lists
            .get(list)
            .map_or(0, |items| items.len() as u64))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_pop_is_fifo() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.push_with_value("q", "a", "s:a", "pending", ttl).await.unwrap();
        store.push_with_value("q", "b", "s:b", "pending", ttl).await.unwrap();

        let first = store.blocking_pop("q", Duration::from_millis(10)).await.unwrap();
        let second = store.blocking_pop("q", Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(second.as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_times_out_on_empty_list() {
        let store = MemoryStore::new();
        let popped = store.blocking_pop("q", Duration::from_secs(2)).await.unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_wakes_on_push() {
        let store = Arc::new(MemoryStore::new());
        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.blocking_pop("q", Duration::ZERO).await })
        };
        tokio::task::yield_now().await;
        store
            .push_with_value("q", "task", "s", "pending", Duration::from_secs(60))
            .await
            .unwrap();
        let popped = waiter.await.unwrap().unwrap();
        assert_eq!(popped.as_deref(), Some("task"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_values_expire_after_ttl() {
        let store = MemoryStore::new();
        store
            .set_many(&[("k".to_string(), "v".to_string())], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }
}
