//! Redis facade: scan/notification queues, scan-bucket dedup, chain-snapshot
//! cache, listed-expiry cache for tiering, stability state, per-record locks.
//! Every component shares one cloned connection manager.

use std::future::Future;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::config::{CACHE_OP_TIMEOUT_MS, NOTIFY_QUEUE, SCAN_QUEUE};
use crate::error::{AppError, Result};
use crate::stability::StabilityState;
use crate::types::{ChainSnapshot, NotificationJob, ScanJob};

#[derive(Clone)]
pub struct Cache {
    conn: ConnectionManager,
}

/// Apply the cache-op ceiling to a non-blocking command. Queue pops are
/// exempt: BRPOP blocks up to its own timeout.
async fn bounded<T>(fut: impl Future<Output = redis::RedisResult<T>>) -> Result<T> {
    match tokio::time::timeout(Duration::from_millis(CACHE_OP_TIMEOUT_MS), fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(AppError::CacheTimeout),
    }
}

impl Cache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = bounded(redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queues
    // -----------------------------------------------------------------------

    pub async fn push_scan_job(&self, job: &ScanJob) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(job)?;
        bounded(conn.lpush::<_, _, ()>(SCAN_QUEUE, payload)).await
    }

    pub async fn pop_scan_job(&self, timeout_secs: f64) -> Result<Option<ScanJob>> {
        let mut conn = self.conn.clone();
        let res: Option<(String, String)> = conn.brpop(SCAN_QUEUE, timeout_secs).await?;
        match res {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    pub async fn scan_queue_depth(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        bounded(conn.llen::<_, usize>(SCAN_QUEUE)).await
    }

    pub async fn push_notification(&self, job: &NotificationJob) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(job)?;
        bounded(conn.lpush::<_, _, ()>(NOTIFY_QUEUE, payload)).await
    }

    pub async fn pop_notification(&self, timeout_secs: f64) -> Result<Option<NotificationJob>> {
        let mut conn = self.conn.clone();
        let res: Option<(String, String)> = conn.brpop(NOTIFY_QUEUE, timeout_secs).await?;
        match res {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Scan-bucket dedup
    // -----------------------------------------------------------------------

    /// Claim `(ticker, bucket)` for this scheduler instance. SET NX with a
    /// TTL of one cadence: the claim dies on bucket rollover, not on scan
    /// success, so a crashed worker cannot cause a re-scan inside the bucket.
    pub async fn try_claim_scan_bucket(
        &self,
        ticker: &str,
        bucket: i64,
        ttl_secs: u64,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = scan_bucket_key(ticker, bucket);
        let claimed: Option<String> = bounded(
            redis::cmd("SET")
                .arg(&key)
                .arg(1)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs)
                .query_async(&mut conn),
        )
        .await?;
        Ok(claimed.is_some())
    }

    // -----------------------------------------------------------------------
    // Chain snapshots
    // -----------------------------------------------------------------------

    pub async fn get_chain(&self, ticker: &str, bucket: i64) -> Result<Option<ChainSnapshot>> {
        let mut conn = self.conn.clone();
        let key = chain_key(ticker, bucket);
        let raw: Option<String> = bounded(conn.get(&key)).await?;
        match raw {
            Some(json) => match serde_json::from_str(&json) {
                Ok(snap) => Ok(Some(snap)),
                Err(e) => {
                    // A stale or truncated cache entry is never fatal; refetch.
                    debug!("discarding undecodable chain cache entry {key}: {e}");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn put_chain(&self, snap: &ChainSnapshot, bucket: i64, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = chain_key(&snap.ticker, bucket);
        let payload = serde_json::to_string(snap)?;
        bounded(conn.set_ex::<_, _, ()>(&key, payload, ttl_secs)).await
    }

    // -----------------------------------------------------------------------
    // Listed expiries (feeds the scheduler's high-tier rule)
    // -----------------------------------------------------------------------

    pub async fn put_listed_expiries(
        &self,
        ticker: &str,
        dates: &[chrono::NaiveDate],
        ttl_secs: u64,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = format!("expiries|{ticker}");
        let payload = serde_json::to_string(dates)?;
        bounded(conn.set_ex::<_, _, ()>(&key, payload, ttl_secs)).await
    }

    pub async fn get_listed_expiries(&self, ticker: &str) -> Result<Option<Vec<chrono::NaiveDate>>> {
        let mut conn = self.conn.clone();
        let key = format!("expiries|{ticker}");
        let raw: Option<String> = bounded(conn.get(&key)).await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json).ok()),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Stability state
    // -----------------------------------------------------------------------

    pub async fn get_stability(&self, key: &str) -> Result<Option<StabilityState>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = bounded(conn.get(key)).await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json).ok()),
            None => Ok(None),
        }
    }

    /// Persist tracker state, refreshing the TTL on every write.
    pub async fn put_stability(
        &self,
        key: &str,
        state: &StabilityState,
        ttl_secs: u64,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(state)?;
        bounded(conn.set_ex::<_, _, ()>(key, payload, ttl_secs)).await
    }

    // -----------------------------------------------------------------------
    // Short-lived per-record locks
    // -----------------------------------------------------------------------

    pub async fn acquire_lock(&self, key: &str, token: &str, ttl_ms: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = bounded(
            redis::cmd("SET")
                .arg(key)
                .arg(token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn),
        )
        .await?;
        Ok(acquired.is_some())
    }

    /// Release only if we still hold it: compare-and-delete in one script so
    /// an expired lock reacquired by another worker is never clobbered.
    pub async fn release_lock(&self, key: &str, token: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(
            r"if redis.call('get', KEYS[1]) == ARGV[1] then
                return redis.call('del', KEYS[1])
              else
                return 0
              end",
        );
        let _: i64 = bounded(script.key(key).arg(token).invoke_async(&mut conn)).await?;
        Ok(())
    }
}

/// Claim key for one (ticker, bucket). Every scheduler instance derives the
/// same key, so the SET NX in `try_claim_scan_bucket` admits exactly one
/// enqueue per bucket. Ticker symbols are uppercase alphanumerics, so the
/// `|` separator cannot occur inside a field.
fn scan_bucket_key(ticker: &str, bucket: i64) -> String {
    format!("scanbucket|{ticker}|{bucket}")
}

fn chain_key(ticker: &str, bucket: i64) -> String {
    format!("chain|{ticker}|{bucket}")
}
