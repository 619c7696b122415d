//! Redis KV backend.
//!
//! Thin mapping of the [`KvStore`](super::KvStore) contract onto Redis
//! commands through a shared tokio connection manager. SET NX EX and EXPIRE
//! go through raw commands so the exact wire form is pinned down.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

use super::{KvError, KvStore};

pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client =
            redis::Client::open(url).map_err(|e| KvError::Unavailable(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        Ok(Self { manager })
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        // Redis EX of zero would reject; clamp to one second.
        ttl.as_secs().max(1)
    }
}

fn map_err(e: redis::RedisError) -> KvError {
    KvError::Unavailable(e.to_string())
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut con = self.manager.clone();
        con.get(key).await.map_err(map_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut con = self.manager.clone();
        match ttl {
            Some(ttl) => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("EX")
                    .arg(Self::ttl_secs(ttl))
                    .query_async::<_, ()>(&mut con)
                    .await
                    .map_err(map_err)?;
            }
            None => {
                con.set::<_, _, ()>(key, value).await.map_err(map_err)?;
            }
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut con = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(Self::ttl_secs(ttl))
            .query_async(&mut con)
            .await
            .map_err(map_err)?;
        Ok(reply.is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        let mut con = self.manager.clone();
        redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut con)
            .await
            .map_err(|e| {
                if e.kind() == redis::ErrorKind::TypeError {
                    KvError::NotAnInteger {
                        key: key.to_string(),
                    }
                } else {
                    map_err(e)
                }
            })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut con = self.manager.clone();
        let applied: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(Self::ttl_secs(ttl))
            .query_async(&mut con)
            .await
            .map_err(map_err)?;
        Ok(applied == 1)
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut con = self.manager.clone();
        con.del::<_, ()>(key).await.map_err(map_err)
    }
}
