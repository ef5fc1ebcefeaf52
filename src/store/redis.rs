//! Redis bucket store using a server-side Lua script.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo, Script};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{LimiterError, Result};
use crate::ratelimit::Decision;

use super::{BucketKeys, BucketRequest, BucketStore};

/// Refill, consume and write back in one script execution.
const TOKEN_BUCKET_SCRIPT: &str = include_str!("token_bucket.lua");

/// Redis-backed bucket store.
///
/// Redis runs each script to completion before serving any other command, so
/// concurrent updates from any number of processes never interleave.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    /// Sent by SHA, with a fallback to the full source on a script cache miss
    script: Script,
    response_timeout: Duration,
}

impl RedisStore {
    /// Connect using the given store configuration.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let mut info = config.url.as_str().into_connection_info()?;
        if let Some(password) = &config.password {
            info.redis.password = Some(password.clone());
        }
        if config.db != 0 {
            info.redis.db = config.db;
        }
        let db = info.redis.db;
        let client = Client::open(info)?;

        // Use timeout to prevent hanging if Redis is unreachable
        let connect_timeout = config.connect_timeout();
        let conn = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| LimiterError::Timeout(connect_timeout))??;

        info!(db = db, "Connected to Redis bucket store");

        Ok(Self {
            conn,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
            response_timeout: config.response_timeout(),
        })
    }
}

/// Turn the script's `{allowed, tokens}` reply into a decision.
fn parse_reply(allowed: i64, tokens: &str) -> Result<Decision> {
    let allowed = match allowed {
        0 => false,
        1 => true,
        other => {
            return Err(LimiterError::Reply(format!(
                "expected allowed flag 0 or 1, got {}",
                other
            )))
        }
    };
    let tokens = tokens
        .parse::<f64>()
        .map_err(|e| LimiterError::Reply(format!("token count {:?}: {}", tokens, e)))?;

    Ok(Decision { allowed, tokens })
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn eval_bucket(&self, keys: &BucketKeys, request: &BucketRequest) -> Result<Decision> {
        let mut conn = self.conn.clone();

        let (allowed, tokens): (i64, String) = tokio::time::timeout(
            self.response_timeout,
            self.script
                .key(&keys.tokens)
                .key(&keys.timestamp)
                .arg(request.rate)
                .arg(request.capacity)
                .arg(request.now)
                .arg(request.requested)
                .invoke_async(&mut conn),
        )
        .await
        .map_err(|_| LimiterError::Timeout(self.response_timeout))??;

        debug!(key = %keys.tokens, allowed = allowed, tokens = %tokens, "Evaluated bucket script");

        parse_reply(allowed, &tokens)
    }
}
