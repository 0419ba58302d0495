use std::time::Duration;

use async_trait::async_trait;
use frameos_core::{FrameError, FrameResult};
use redis::aio::MultiplexedConnection;
use tracing::info;

use super::SharedStore;

/// Redis-backed store shared by every controller process.
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> FrameResult<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_err)?;
        info!("connected to redis");
        Ok(Self { client, conn })
    }
}

fn store_err(e: redis::RedisError) -> FrameError {
    FrameError::Store(e.to_string())
}

/// Escape glob metacharacters so a prefix matches literally in `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('*');
    out
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> FrameResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> FrameResult<bool> {
        let mut conn = self.conn.clone();
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .query_async::<_, bool>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn del(&self, key: &str) -> FrameResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn count_prefix(&self, prefix: &str) -> FrameResult<usize> {
        let mut conn = self.conn.clone();
        let pattern = glob_escape(prefix);
        let mut cursor: u64 = 0;
        let mut count = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            count += keys.len();
            if next == 0 {
                return Ok(count);
            }
            cursor = next;
        }
    }

    async fn rpush(&self, key: &str, value: String) -> FrameResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> FrameResult<Option<String>> {
        // BLPOP parks the connection, so it must not share the multiplexed one.
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(store_err)?;
        let secs = timeout.as_secs_f64().max(0.01);
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(key)
            .arg(secs)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(popped.map(|(_, value)| value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_matched_literally() {
        assert_eq!(glob_escape("frame:a*b:conn:"), "frame:a\\*b:conn:*");
        assert_eq!(glob_escape("frame:x:conn:"), "frame:x:conn:*");
    }
}
