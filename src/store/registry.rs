//! Ticker registry, subscriptions, and policy reads. The per-scan subscriber
//! load is a single joined query, not one policy read per user.

use std::collections::HashMap;

use sqlx::PgPool;
use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::store::models::PolicyRow;
use crate::types::{Tier, UserPolicy};

/// Ticker symbols are 1–5 uppercase alphanumerics.
pub fn valid_symbol(symbol: &str) -> bool {
    !symbol.is_empty()
        && symbol.len() <= 5
        && symbol.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

#[derive(Clone)]
pub struct Registry {
    pool: PgPool,
    cfg: Config,
}

impl Registry {
    pub fn new(pool: PgPool, cfg: Config) -> Self {
        Self { pool, cfg }
    }

    /// All active subscribers of a ticker with their policies, one query.
    pub async fn subscribers_with_policies(&self, ticker: &str) -> Result<Vec<UserPolicy>> {
        let rows = sqlx::query_as::<_, PolicyRow>(
            r#"
            SELECT p.*
            FROM user_policies p
            JOIN subscriptions s ON s.user_id = p.user_id
            WHERE s.ticker = $1 AND s.active AND p.active
            ORDER BY p.user_id
            "#,
        )
        .bind(ticker)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.into_policy(&self.cfg)).collect())
    }

    pub async fn policy(&self, user_id: &str) -> Result<Option<UserPolicy>> {
        let row = sqlx::query_as::<_, PolicyRow>("SELECT * FROM user_policies WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.into_policy(&self.cfg)))
    }

    /// Permanent messenger failure: stop routing to this user until they
    /// re-activate out of band.
    pub async fn set_policy_active(&self, user_id: &str, active: bool) -> Result<()> {
        sqlx::query("UPDATE user_policies SET active = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Tickers to scan for a tier. Zero-subscriber tickers sit in the low
    /// tier and are never scheduled; discovery mode is out of scope here.
    pub async fn tickers_in_tier(&self, tier: Tier) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            r#"
            SELECT symbol FROM tickers
            WHERE scan_tier = $1 AND active_subscriber_count > 0
            ORDER BY symbol
            "#,
        )
        .bind(tier.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Active subscriber count per ticker.
    pub async fn subscription_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT ticker, COUNT(*) FROM subscriptions WHERE active GROUP BY ticker",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Every distinct front-target (days) wanted by any active subscriber,
    /// grouped by ticker. Feeds the high-tier proximity rule.
    pub async fn front_targets_by_ticker(&self) -> Result<HashMap<String, Vec<i32>>> {
        let rows = sqlx::query_as::<_, (String, sqlx::types::Json<Vec<crate::types::DtePair>>)>(
            r#"
            SELECT s.ticker, p.dte_pairs
            FROM subscriptions s
            JOIN user_policies p ON p.user_id = s.user_id
            WHERE s.active AND p.active
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut targets: HashMap<String, Vec<i32>> = HashMap::new();
        for (ticker, pairs) in rows {
            let entry = targets.entry(ticker).or_default();
            for pair in pairs.0 {
                if !entry.contains(&pair.front_target) {
                    entry.push(pair.front_target);
                }
            }
        }
        Ok(targets)
    }

    /// Idempotent tier write; the scheduler's next tick picks it up.
    pub async fn upsert_ticker(&self, symbol: &str, subscriber_count: i64, tier: Tier) -> Result<()> {
        if !valid_symbol(symbol) {
            warn!(symbol, "skipping registry write for invalid symbol");
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO tickers (symbol, active_subscriber_count, scan_tier)
            VALUES ($1, $2, $3)
            ON CONFLICT (symbol) DO UPDATE SET
                active_subscriber_count = EXCLUDED.active_subscriber_count,
                scan_tier = EXCLUDED.scan_tier
            "#,
        )
        .bind(symbol)
        .bind(subscriber_count as i32)
        .bind(tier.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Tickers that lost their last subscriber drop to the low tier.
    pub async fn demote_unsubscribed(&self, subscribed: &[String]) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tickers
            SET active_subscriber_count = 0, scan_tier = 'low'
            WHERE NOT (symbol = ANY($1))
            "#,
        )
        .bind(subscribed.to_vec())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn touch_last_scan(&self, ticker: &str) -> Result<()> {
        sqlx::query("UPDATE tickers SET last_scan_at = now() WHERE symbol = $1")
            .bind(ticker)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
