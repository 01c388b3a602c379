use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{Result, TarotError};
use crate::store::QueueStore;

/// Redis-backed [`QueueStore`].
///
/// Regular commands share one multiplexed connection. Blocking pops hold a
/// connection for the whole wait, so they draw from a separate pool of
/// dedicated connections that grows to the number of concurrent poppers.
pub struct RedisStore {
    client: Client,
    shared: MultiplexedConnection,
    blocking: Mutex<Vec<MultiplexedConnection>>,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            TarotError::Configuration(format!("Failed to create Redis client: {}", e))
        })?;

        let shared = client.get_multiplexed_tokio_connection().await.map_err(|e| {
            TarotError::BackendUnavailable(format!("Failed to connect to Redis: {}", e))
        })?;

        Ok(Self {
            client,
            shared,
            blocking: Mutex::new(Vec::new()),
        })
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }
        tracing::debug!("Opening dedicated Redis connection for blocking pop");
        Ok(self.client.get_multiplexed_tokio_connection().await?)
    }

    async fn checkin_blocking(&self, conn: MultiplexedConnection) {
        self.blocking.lock().await.push(conn);
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// BRPOP timeout in whole seconds, rounded up; servers before 6.0 reject
/// fractional values. Zero still means wait forever.
fn brpop_timeout_secs(timeout: Duration) -> u64 {
    timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0)
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn push_with_value(
        &self,
        list: &str,
        payload: &str,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.shared.clone();
        redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(list)
            .arg(payload)
            .ignore()
            .cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn blocking_pop(&self, list: &str, timeout: Duration) -> Result<Option<String>> {
        let mut conn = self.checkout_blocking().await?;
        let popped: redis::RedisResult<Option<(String, String)>> = redis::cmd("BRPOP")
            .arg(list)
            .arg(brpop_timeout_secs(timeout))
            .query_async(&mut conn)
            .await;

        match popped {
            Ok(entry) => {
                self.checkin_blocking(conn).await;
                Ok(entry.map(|(_, payload)| payload))
            }
            // A failed connection is dropped rather than returned to the pool.
            Err(e) => Err(e.into()),
        }
    }

    async fn set_many(&self, entries: &[(String, String)], ttl: Duration) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs(ttl))
                .ignore();
        }
        let mut conn = self.shared.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.shared.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn list_len(&self, list: &str) -> Result<u64> {
        let mut conn = self.shared.clone();
        let len: u64 = redis::cmd("LLEN").arg(list).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.shared.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(TarotError::BackendUnavailable(format!(
                "unexpected PING reply: {}",
                pong
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_rounds_up_to_one_second() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(300)), 300);
    }

    #[test]
    fn test_brpop_timeout_is_whole_seconds() {
        assert_eq!(brpop_timeout_secs(Duration::ZERO), 0);
        assert_eq!(brpop_timeout_secs(Duration::from_millis(200)), 1);
        assert_eq!(brpop_timeout_secs(Duration::from_secs(5)), 5);
        assert_eq!(brpop_timeout_secs(Duration::from_millis(5001)), 6);
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        let result = RedisStore::connect("not-a-redis-url").await;
        assert!(matches!(result, Err(TarotError::Configuration(_))));
    }
}
