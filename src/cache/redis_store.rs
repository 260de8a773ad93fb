//! Redis-backed [`RemoteStore`]
//!
//! Uses a multiplexed async connection; one session is shared by every
//! caller of the distributed tier. Prefix clears walk the keyspace with
//! `SCAN` so a large cache never blocks the server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use super::distributed::{RemoteSession, RemoteStore};
use crate::error::{Error, Result};

const SCAN_BATCH: usize = 500;

/// Connects to a Redis endpoint such as `redis://127.0.0.1:6379`
pub struct RedisStore {
    client: redis::Client,
    endpoint: String,
}

impl RedisStore {
    /// Parse the endpoint. No connection is made until first use.
    pub fn open(endpoint: &str) -> Result<Self> {
        let client = redis::Client::open(endpoint)
            .map_err(|e| Error::Config(format!("invalid redis endpoint {}: {}", endpoint, e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn connect(&self) -> Result<Arc<dyn RemoteSession>> {
        let con = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        Ok(Arc::new(RedisSession { con }))
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

struct RedisSession {
    con: MultiplexedConnection,
}

fn unavailable(err: redis::RedisError) -> Error {
    Error::unavailable("distributed", err.to_string())
}

/// Escape glob metacharacters so a prefix matches literally
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl RemoteSession for RedisSession {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut con = self.con.clone();
        let raw: Option<Vec<u8>> = con.get(key).await.map_err(unavailable)?;
        Ok(raw.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let mut con = self.con.clone();
        // PSETEX rejects zero
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        con.pset_ex::<_, _, ()>(key, value.as_ref(), millis)
            .await
            .map_err(unavailable)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut con = self.con.clone();
        let removed: i64 = con.del(key).await.map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn clear(&self, prefix: Option<&str>) -> Result<usize> {
        let mut con = self.con.clone();
        let pattern = format!("{}*", glob_escape(prefix.unwrap_or("")));

        let mut cursor: u64 = 0;
        let mut removed = 0usize;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut con)
                .await
                .map_err(unavailable)?;

            if !keys.is_empty() {
                let n: i64 = con.del(&keys).await.map_err(unavailable)?;
                removed += n.max(0) as usize;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }
}
