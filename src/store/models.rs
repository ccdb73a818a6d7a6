//! Row types for the durable tables. Used by sqlx for typed queries; the
//! policy row converts into the domain `UserPolicy` at load time.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::types::Json;
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::types::{DtePair, QuietHours, UserPolicy, VolPoint};

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct SignalRow {
    pub id: Uuid,
    pub ticker: String,
    pub as_of_ts: DateTime<Utc>,
    pub front_expiry: NaiveDate,
    pub back_expiry: NaiveDate,
    pub front_dte: i32,
    pub back_dte: i32,
    pub front_iv: f64,
    pub back_iv: f64,
    pub sigma_fwd: f64,
    pub ff_value: f64,
    pub vol_point: String,
    pub quality_score: f64,
    pub reason_codes: Json<Vec<String>>,
    pub dedupe_key: String,
    pub underlying_price: Option<f64>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct DecisionRow {
    pub signal_id: Uuid,
    pub user_id: String,
    pub kind: String,
    pub decided_at: DateTime<Utc>,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub pnl: Option<f64>,
    pub notes: Option<String>,
}

/// Closed set of recordable decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionKind {
    Placed,
    Ignored,
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionKind::Placed => write!(f, "placed"),
            DecisionKind::Ignored => write!(f, "ignored"),
        }
    }
}

impl FromStr for DecisionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "placed" => Ok(DecisionKind::Placed),
            "ignored" => Ok(DecisionKind::Ignored),
            other => Err(other.to_string()),
        }
    }
}

/// Optional bookkeeping a user may attach when recording a decision.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct DecisionExtras {
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub pnl: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PolicyRow {
    pub user_id: String,
    pub chat_id: Option<String>,
    pub active: bool,
    pub ff_threshold: f64,
    pub dte_pairs: Json<Vec<DtePair>>,
    pub vol_point: String,
    pub min_open_interest: i32,
    pub min_volume: i32,
    pub max_bid_ask_pct: f64,
    pub sigma_fwd_floor: f64,
    pub stability_scans: i32,
    pub cooldown_minutes: i32,
    pub quiet_hours: Json<QuietHours>,
    pub timezone: String,
}

impl PolicyRow {
    /// Convert a stored row into a domain policy. Fields that fail to parse
    /// fall back to the configured defaults with a warning; a bad stored
    /// field must not take the subscriber out of the scan.
    pub fn into_policy(self, cfg: &Config) -> UserPolicy {
        let vol_point = self.vol_point.parse::<VolPoint>().unwrap_or_else(|e| {
            warn!(user_id = %self.user_id, "{e}; falling back to {}", cfg.default_vol_point);
            cfg.default_vol_point.parse().unwrap_or(VolPoint::Atm)
        });
        let timezone = if self.timezone.parse::<chrono_tz::Tz>().is_ok() {
            self.timezone
        } else {
            warn!(
                user_id = %self.user_id,
                "unknown timezone {}; falling back to {}", self.timezone, cfg.default_timezone
            );
            cfg.default_timezone.clone()
        };
        let policy = UserPolicy {
            user_id: self.user_id,
            chat_id: self.chat_id,
            active: self.active,
            ff_threshold: self.ff_threshold,
            dte_pairs: self.dte_pairs.0,
            vol_point,
            min_open_interest: i64::from(self.min_open_interest),
            min_volume: i64::from(self.min_volume),
            max_bid_ask_pct: self.max_bid_ask_pct,
            sigma_fwd_floor: self.sigma_fwd_floor,
            stability_scans: self.stability_scans,
            cooldown_minutes: i64::from(self.cooldown_minutes),
            quiet_hours: self.quiet_hours.0,
            timezone,
        };
        if let Err(e) = policy.validate() {
            warn!(user_id = %policy.user_id, "stored policy fails validation: {e}");
        }
        policy
    }
}
