use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Contracts and chains
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Right {
    Call,
    Put,
}

impl std::fmt::Display for Right {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Right::Call => write!(f, "call"),
            Right::Put => write!(f, "put"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub symbol: String,
    pub strike: f64,
    pub right: Right,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub implied_volatility: Option<f64>,
    pub delta: Option<f64>,
    pub volume: Option<i64>,
    pub open_interest: Option<i64>,
}

impl Contract {
    /// Provider-boundary sanity rules: bid ≤ ask when both quoted,
    /// IV in (0, 5) when present, |delta| ≤ 1 when present.
    pub fn is_well_formed(&self) -> bool {
        if let (Some(bid), Some(ask)) = (self.bid, self.ask) {
            if bid > ask {
                return false;
            }
        }
        if let Some(iv) = self.implied_volatility {
            if iv <= 0.0 || iv >= 5.0 {
                return false;
            }
        }
        if let Some(delta) = self.delta {
            if delta.abs() > 1.0 {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expiry {
    pub expiry_date: NaiveDate,
    /// Calendar days from the snapshot's as-of date.
    pub dte: i32,
    pub contracts: Vec<Contract>,
}

impl Expiry {
    /// Contract of `right` whose strike is nearest the underlying.
    /// Ties break toward the lower strike.
    pub fn atm_contract(&self, underlying_price: f64, right: Right) -> Option<&Contract> {
        self.contracts
            .iter()
            .filter(|c| c.right == right)
            .min_by(|a, b| {
                let da = (a.strike - underlying_price).abs();
                let db = (b.strike - underlying_price).abs();
                da.partial_cmp(&db)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.strike.partial_cmp(&b.strike).unwrap_or(std::cmp::Ordering::Equal))
            })
    }

    /// Contract of `right` whose |delta| is nearest `target_delta`.
    /// Contracts without a delta are not candidates.
    pub fn delta_contract(&self, target_delta: f64, right: Right) -> Option<&Contract> {
        self.contracts
            .iter()
            .filter(|c| c.right == right && c.delta.is_some())
            .min_by(|a, b| {
                let da = (a.delta.unwrap_or(0.0).abs() - target_delta).abs();
                let db = (b.delta.unwrap_or(0.0).abs() - target_delta).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub ticker: String,
    pub as_of: DateTime<Utc>,
    pub underlying_price: f64,
    pub expiries: Vec<Expiry>,
}

impl ChainSnapshot {
    /// Expiry whose DTE lies inside [target − tol, target + tol], nearest the
    /// target. Ties break toward the earlier expiry.
    pub fn expiry_near_dte(&self, target: i32, tol: i32) -> Option<&Expiry> {
        self.expiries
            .iter()
            .filter(|e| (e.dte - target).abs() <= tol)
            .min_by_key(|e| ((e.dte - target).abs(), e.expiry_date))
    }

    pub fn listed_expiry_dates(&self) -> Vec<NaiveDate> {
        self.expiries.iter().map(|e| e.expiry_date).collect()
    }
}

// ---------------------------------------------------------------------------
// User policy
// ---------------------------------------------------------------------------

/// Which contract's IV represents an expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolPoint {
    Atm,
    /// Target |delta| in percent, e.g. 35 for a 35-delta put.
    DeltaPut(u8),
    DeltaCall(u8),
}

impl std::fmt::Display for VolPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolPoint::Atm => write!(f, "ATM"),
            VolPoint::DeltaPut(n) => write!(f, "{n}d_put"),
            VolPoint::DeltaCall(n) => write!(f, "{n}d_call"),
        }
    }
}

impl FromStr for VolPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("ATM") {
            return Ok(VolPoint::Atm);
        }
        if let Some(n) = s.strip_suffix("d_put") {
            return n
                .parse::<u8>()
                .map(VolPoint::DeltaPut)
                .map_err(|_| format!("bad vol point: {s}"));
        }
        if let Some(n) = s.strip_suffix("d_call") {
            return n
                .parse::<u8>()
                .map(VolPoint::DeltaCall)
                .map_err(|_| format!("bad vol point: {s}"));
        }
        Err(format!("bad vol point: {s}"))
    }
}

/// One expiry-pairing rule: pick a front expiry near `front_target` and a
/// back expiry near `back_target`, each within its tolerance (days).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtePair {
    #[serde(alias = "front")]
    pub front_target: i32,
    #[serde(alias = "back")]
    pub back_target: i32,
    #[serde(default = "default_front_tol")]
    pub front_tol: i32,
    #[serde(default = "default_back_tol")]
    pub back_tol: i32,
}

fn default_front_tol() -> i32 {
    5
}

fn default_back_tol() -> i32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuietHours {
    pub enabled: bool,
    /// "HH:MM" in the user's timezone.
    pub start: String,
    pub end: String,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: false,
            start: "22:00".to_string(),
            end: "07:00".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserPolicy {
    pub user_id: String,
    pub chat_id: Option<String>,
    pub active: bool,
    pub ff_threshold: f64,
    pub dte_pairs: Vec<DtePair>,
    pub vol_point: VolPoint,
    pub min_open_interest: i64,
    pub min_volume: i64,
    pub max_bid_ask_pct: f64,
    pub sigma_fwd_floor: f64,
    pub stability_scans: i32,
    pub cooldown_minutes: i64,
    pub quiet_hours: QuietHours,
    pub timezone: String,
}

impl UserPolicy {
    /// Policy-write-time validation. Unknown timezones and out-of-range
    /// thresholds are rejected here, never deep in the pipeline.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.ff_threshold > 0.0 && self.ff_threshold <= 1.0) {
            return Err(format!("ff_threshold out of range: {}", self.ff_threshold));
        }
        if !(0.0..=1.0).contains(&self.max_bid_ask_pct) {
            return Err(format!("max_bid_ask_pct out of range: {}", self.max_bid_ask_pct));
        }
        if self.sigma_fwd_floor < 0.0 {
            return Err(format!("sigma_fwd_floor negative: {}", self.sigma_fwd_floor));
        }
        if self.stability_scans < 1 {
            return Err(format!("stability_scans must be >= 1, got {}", self.stability_scans));
        }
        if self.cooldown_minutes < 0 {
            return Err(format!("cooldown_minutes negative: {}", self.cooldown_minutes));
        }
        if self.min_open_interest < 0 || self.min_volume < 0 {
            return Err("liquidity minimums must be non-negative".to_string());
        }
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(format!("unknown timezone: {}", self.timezone));
        }
        if chrono::NaiveTime::parse_from_str(&self.quiet_hours.start, "%H:%M").is_err() {
            return Err(format!("bad quiet_hours start: {}", self.quiet_hours.start));
        }
        if chrono::NaiveTime::parse_from_str(&self.quiet_hours.end, "%H:%M").is_err() {
            return Err(format!("bad quiet_hours end: {}", self.quiet_hours.end));
        }
        for pair in &self.dte_pairs {
            if pair.front_target < 1 || pair.back_target <= pair.front_target {
                return Err(format!(
                    "bad dte pair: front={} back={}",
                    pair.front_target, pair.back_target
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scan tiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::High => write!(f, "high"),
            Tier::Medium => write!(f, "medium"),
            Tier::Low => write!(f, "low"),
        }
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Tier::High),
            "medium" => Ok(Tier::Medium),
            "low" => Ok(Tier::Low),
            other => Err(format!("bad tier: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine output
// ---------------------------------------------------------------------------

/// Closed vocabulary of engine rejections and liquidity degradations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    InvalidDte,
    NegativeForwardVariance,
    SigmaFwdFloor,
    MissingIv,
    MissingQuotes,
    NonpositiveMid,
    WideSpread,
    LowOi,
    LowVolume,
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReasonCode::InvalidDte => "invalid_dte",
            ReasonCode::NegativeForwardVariance => "negative_forward_variance",
            ReasonCode::SigmaFwdFloor => "sigma_fwd_floor",
            ReasonCode::MissingIv => "missing_iv",
            ReasonCode::MissingQuotes => "missing_quotes",
            ReasonCode::NonpositiveMid => "nonpositive_mid",
            ReasonCode::WideSpread => "wide_spread",
            ReasonCode::LowOi => "low_oi",
            ReasonCode::LowVolume => "low_volume",
        };
        write!(f, "{s}")
    }
}

/// A threshold-crossing candidate produced by the engine for one user.
/// Becomes a durable Signal row once persisted.
#[derive(Debug, Clone)]
pub struct SignalCandidate {
    pub ticker: String,
    pub as_of: DateTime<Utc>,
    pub front_expiry: NaiveDate,
    pub back_expiry: NaiveDate,
    pub front_dte: i32,
    pub back_dte: i32,
    pub front_iv: f64,
    pub back_iv: f64,
    pub sigma_fwd: f64,
    pub ff_value: f64,
    pub vol_point: VolPoint,
    pub quality_score: f64,
    pub reason_codes: Vec<ReasonCode>,
    pub underlying_price: f64,
}

/// A pair that was evaluated but produced no candidate, with why.
#[derive(Debug, Clone)]
pub struct EngineDiagnostic {
    pub ticker: String,
    pub front_expiry: NaiveDate,
    pub back_expiry: NaiveDate,
    pub reasons: Vec<ReasonCode>,
}

#[derive(Debug, Default)]
pub struct EngineOutput {
    pub signals: Vec<SignalCandidate>,
    pub diagnostics: Vec<EngineDiagnostic>,
}

// ---------------------------------------------------------------------------
// Queue payloads, serialized as JSON onto the Redis lists
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub ticker: String,
    /// floor(unix seconds / cadence) for the ticker's tier at enqueue time.
    pub bucket: i64,
    pub cadence_secs: i64,
    /// Unix seconds; the worker abandons the job past this point.
    pub deadline: i64,
    /// Set after a rate-limited fetch requeues the job; a job requeues at most once.
    #[serde(default)]
    pub requeued: bool,
}

impl ScanJob {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() > self.deadline
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationJob {
    pub signal_id: uuid::Uuid,
    pub user_id: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(strike: f64, right: Right, delta: Option<f64>) -> Contract {
        Contract {
            symbol: format!("T{strike}{right}"),
            strike,
            right,
            bid: Some(1.0),
            ask: Some(1.1),
            implied_volatility: Some(0.3),
            delta,
            volume: Some(100),
            open_interest: Some(500),
        }
    }

    fn expiry(dte: i32, contracts: Vec<Contract>) -> Expiry {
        Expiry {
            expiry_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap() + chrono::Days::new(dte as u64),
            dte,
            contracts,
        }
    }

    #[test]
    fn atm_ties_break_to_lower_strike() {
        let e = expiry(
            30,
            vec![
                contract(95.0, Right::Call, None),
                contract(105.0, Right::Call, None),
            ],
        );
        let atm = e.atm_contract(100.0, Right::Call).unwrap();
        assert_eq!(atm.strike, 95.0);
    }

    #[test]
    fn atm_filters_by_right() {
        let e = expiry(
            30,
            vec![
                contract(100.0, Right::Put, None),
                contract(110.0, Right::Call, None),
            ],
        );
        let atm = e.atm_contract(100.0, Right::Call).unwrap();
        assert_eq!(atm.strike, 110.0);
    }

    #[test]
    fn delta_contract_uses_absolute_delta() {
        let e = expiry(
            30,
            vec![
                contract(90.0, Right::Put, Some(-0.34)),
                contract(95.0, Right::Put, Some(-0.48)),
                contract(85.0, Right::Put, None),
            ],
        );
        let c = e.delta_contract(0.35, Right::Put).unwrap();
        assert_eq!(c.strike, 90.0);
    }

    #[test]
    fn expiry_near_dte_prefers_closest_then_earlier() {
        let snap = ChainSnapshot {
            ticker: "SPY".to_string(),
            as_of: Utc::now(),
            underlying_price: 500.0,
            expiries: vec![expiry(27, vec![]), expiry(33, vec![]), expiry(45, vec![])],
        };
        // 27 and 33 are both 3 off target 30; earlier expiry wins.
        assert_eq!(snap.expiry_near_dte(30, 5).unwrap().dte, 27);
        // Out of tolerance → none.
        assert!(snap.expiry_near_dte(10, 5).is_none());
    }

    #[test]
    fn vol_point_round_trips() {
        assert_eq!("ATM".parse::<VolPoint>().unwrap(), VolPoint::Atm);
        assert_eq!("35d_put".parse::<VolPoint>().unwrap(), VolPoint::DeltaPut(35));
        assert_eq!(VolPoint::DeltaCall(35).to_string(), "35d_call");
        assert!("35d_strangle".parse::<VolPoint>().is_err());
    }

    #[test]
    fn malformed_contracts_detected() {
        let mut c = contract(100.0, Right::Call, Some(0.5));
        assert!(c.is_well_formed());
        c.bid = Some(2.0);
        c.ask = Some(1.0);
        assert!(!c.is_well_formed());
        c.ask = Some(3.0);
        c.implied_volatility = Some(7.0);
        assert!(!c.is_well_formed());
    }

    #[test]
    fn policy_validation_rejects_unknown_timezone() {
        let policy = UserPolicy {
            user_id: "u1".to_string(),
            chat_id: None,
            active: true,
            ff_threshold: 0.2,
            dte_pairs: vec![],
            vol_point: VolPoint::Atm,
            min_open_interest: 100,
            min_volume: 10,
            max_bid_ask_pct: 0.08,
            sigma_fwd_floor: 0.05,
            stability_scans: 2,
            cooldown_minutes: 120,
            quiet_hours: QuietHours::default(),
            timezone: "Mars/Olympus_Mons".to_string(),
        };
        assert!(policy.validate().is_err());
        let ok = UserPolicy {
            timezone: "America/Vancouver".to_string(),
            ..policy
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn policy_validation_rejects_malformed_quiet_hours() {
        let base = UserPolicy {
            user_id: "u1".to_string(),
            chat_id: None,
            active: true,
            ff_threshold: 0.2,
            dte_pairs: vec![],
            vol_point: VolPoint::Atm,
            min_open_interest: 100,
            min_volume: 10,
            max_bid_ask_pct: 0.08,
            sigma_fwd_floor: 0.05,
            stability_scans: 2,
            cooldown_minutes: 120,
            quiet_hours: QuietHours::default(),
            timezone: "America/Vancouver".to_string(),
        };
        assert!(base.validate().is_ok());

        let bad_start = UserPolicy {
            quiet_hours: QuietHours {
                enabled: true,
                start: "25:99".to_string(),
                end: "07:00".to_string(),
            },
            ..base.clone()
        };
        assert!(bad_start.validate().is_err());

        // A malformed window is bad data even while the gate is disabled.
        let bad_end_disabled = UserPolicy {
            quiet_hours: QuietHours {
                enabled: false,
                start: "22:00".to_string(),
                end: "7pm".to_string(),
            },
            ..base
        };
        assert!(bad_end_disabled.validate().is_err());
    }
}
