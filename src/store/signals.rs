//! Durable signal records and per-user decisions. Deduplication relies on
//! the unique constraint, never on a prior SELECT, so concurrent workers
//! emitting the same logical signal coalesce to one row.

use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgPool, Row};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::store::models::{DecisionExtras, DecisionKind, DecisionRow, SignalRow};
use crate::types::SignalCandidate;

/// Identity of a logical signal within a day:
/// SHA-256 over ticker, both expiry dates, the as-of calendar date, and the
/// vol point. Stable under reordering of every non-key field.
pub fn dedupe_key(c: &SignalCandidate) -> String {
    let input = format!(
        "{}:{}:{}:{}:{}",
        c.ticker,
        c.front_expiry,
        c.back_expiry,
        c.as_of.date_naive(),
        c.vol_point
    );
    hex::encode(Sha256::digest(input.as_bytes()))
}

#[derive(Clone)]
pub struct SignalStore {
    pool: PgPool,
}

impl SignalStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a candidate; `None` means a row with the same dedupe key
    /// already exists (silently coalesced).
    pub async fn create(&self, c: &SignalCandidate) -> Result<Option<Uuid>> {
        let reasons: Vec<String> = c.reason_codes.iter().map(ToString::to_string).collect();
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO signals (
                id, ticker, as_of_ts, front_expiry, back_expiry,
                front_dte, back_dte, front_iv, back_iv, sigma_fwd,
                ff_value, vol_point, quality_score, reason_codes,
                dedupe_key, underlying_price
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (dedupe_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&c.ticker)
        .bind(c.as_of)
        .bind(c.front_expiry)
        .bind(c.back_expiry)
        .bind(c.front_dte)
        .bind(c.back_dte)
        .bind(c.front_iv)
        .bind(c.back_iv)
        .bind(c.sigma_fwd)
        .bind(c.ff_value)
        .bind(c.vol_point.to_string())
        .bind(c.quality_score)
        .bind(sqlx::types::Json(reasons))
        .bind(dedupe_key(c))
        .bind(c.underlying_price)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// Resolve the row id behind a dedupe key (for notifying off a
    /// coalesced duplicate).
    pub async fn id_for_dedupe_key(&self, key: &str) -> Result<Option<Uuid>> {
        let id = sqlx::query_scalar::<_, Uuid>("SELECT id FROM signals WHERE dedupe_key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<SignalRow>> {
        let row = sqlx::query_as::<_, SignalRow>("SELECT * FROM signals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Upsert the user's decision on a signal. Kinds outside the closed set
    /// never reach this method; the string form is rejected at parse time.
    pub async fn record_decision(
        &self,
        signal_id: Uuid,
        user_id: &str,
        kind: DecisionKind,
        extras: &DecisionExtras,
    ) -> Result<DecisionRow> {
        let row = sqlx::query_as::<_, DecisionRow>(
            r#"
            INSERT INTO decisions (signal_id, user_id, kind, decided_at, entry_price, exit_price, pnl, notes)
            VALUES ($1, $2, $3, now(), $4, $5, $6, $7)
            ON CONFLICT (user_id, signal_id) DO UPDATE SET
                kind = EXCLUDED.kind,
                decided_at = EXCLUDED.decided_at,
                entry_price = EXCLUDED.entry_price,
                exit_price = EXCLUDED.exit_price,
                pnl = EXCLUDED.pnl,
                notes = EXCLUDED.notes
            RETURNING *
            "#,
        )
        .bind(signal_id)
        .bind(user_id)
        .bind(kind.to_string())
        .bind(extras.entry_price)
        .bind(extras.exit_price)
        .bind(extras.pnl)
        .bind(extras.notes.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Parse-and-record for the API/messenger callback path.
    pub async fn record_decision_str(
        &self,
        signal_id: Uuid,
        user_id: &str,
        kind: &str,
        extras: &DecisionExtras,
    ) -> Result<DecisionRow> {
        let kind = kind
            .parse::<DecisionKind>()
            .map_err(AppError::InvalidDecision)?;
        self.record_decision(signal_id, user_id, kind, extras).await
    }

    /// Signals on tickers the user subscribes to, newest first.
    pub async fn recent_signals(
        &self,
        user_id: &str,
        ticker: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SignalRow>> {
        let rows = sqlx::query_as::<_, SignalRow>(
            r#"
            SELECT s.*
            FROM signals s
            JOIN subscriptions sub
              ON sub.ticker = s.ticker AND sub.user_id = $1 AND sub.active
            WHERE $2::text IS NULL OR s.ticker = $2
            ORDER BY s.as_of_ts DESC
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(ticker.map(|t| t.to_uppercase()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// (signal, decision?) pairs for the user's subscribed tickers.
    pub async fn history(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<(SignalRow, Option<DecisionRow>)>> {
        let rows = sqlx::query(
            r#"
            SELECT s.*,
                   d.kind AS d_kind,
                   d.decided_at AS d_decided_at,
                   d.entry_price AS d_entry_price,
                   d.exit_price AS d_exit_price,
                   d.pnl AS d_pnl,
                   d.notes AS d_notes
            FROM signals s
            JOIN subscriptions sub
              ON sub.ticker = s.ticker AND sub.user_id = $1 AND sub.active
            LEFT JOIN decisions d
              ON d.signal_id = s.id AND d.user_id = $1
            ORDER BY s.as_of_ts DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let signal = SignalRow::from_row(&row)?;
            let decision = match row.try_get::<Option<String>, _>("d_kind")? {
                Some(kind) => Some(DecisionRow {
                    signal_id: signal.id,
                    user_id: user_id.to_string(),
                    kind,
                    decided_at: row.try_get("d_decided_at")?,
                    entry_price: row.try_get("d_entry_price")?,
                    exit_price: row.try_get("d_exit_price")?,
                    pnl: row.try_get("d_pnl")?,
                    notes: row.try_get("d_notes")?,
                }),
                None => None,
            };
            out.push((signal, decision));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ReasonCode, VolPoint};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn candidate() -> SignalCandidate {
        SignalCandidate {
            ticker: "SPY".to_string(),
            as_of: Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap(),
            front_expiry: NaiveDate::from_ymd_opt(2026, 4, 2).unwrap(),
            back_expiry: NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
            front_dte: 31,
            back_dte: 60,
            front_iv: 0.30,
            back_iv: 0.22,
            sigma_fwd: 0.08249,
            ff_value: 2.637,
            vol_point: VolPoint::Atm,
            quality_score: 1.0,
            reason_codes: vec![],
            underlying_price: 500.0,
        }
    }

    #[test]
    fn dedupe_key_is_deterministic() {
        assert_eq!(dedupe_key(&candidate()), dedupe_key(&candidate()));
        // 64 hex chars of SHA-256.
        assert_eq!(dedupe_key(&candidate()).len(), 64);
    }

    #[test]
    fn dedupe_key_ignores_non_key_fields() {
        let a = candidate();
        let mut b = candidate();
        b.ff_value = 9.9;
        b.front_iv = 0.99;
        b.quality_score = 0.5;
        b.reason_codes = vec![ReasonCode::WideSpread];
        // Same ticker/expiries/date/vol-point → same identity.
        assert_eq!(dedupe_key(&a), dedupe_key(&b));
    }

    #[test]
    fn dedupe_key_varies_with_key_fields() {
        let a = candidate();

        let mut day = candidate();
        day.as_of = Utc.with_ymd_and_hms(2026, 3, 3, 0, 5, 0).unwrap();
        assert_ne!(dedupe_key(&a), dedupe_key(&day));

        let mut vp = candidate();
        vp.vol_point = VolPoint::DeltaPut(35);
        assert_ne!(dedupe_key(&a), dedupe_key(&vp));

        let mut exp = candidate();
        exp.back_expiry = NaiveDate::from_ymd_opt(2026, 5, 8).unwrap();
        assert_ne!(dedupe_key(&a), dedupe_key(&exp));
    }

    #[test]
    fn same_day_different_hour_shares_identity() {
        let a = candidate();
        let mut b = candidate();
        b.as_of = Utc.with_ymd_and_hms(2026, 3, 2, 20, 45, 0).unwrap();
        assert_eq!(dedupe_key(&a), dedupe_key(&b));
    }

    #[test]
    fn decision_kind_is_a_closed_set() {
        assert_eq!("placed".parse::<DecisionKind>(), Ok(DecisionKind::Placed));
        assert_eq!("ignored".parse::<DecisionKind>(), Ok(DecisionKind::Ignored));
        assert!("expired".parse::<DecisionKind>().is_err());
        assert!("PLACED".parse::<DecisionKind>().is_err());
    }
}
