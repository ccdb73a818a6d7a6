//! Per-(ticker, expiry-pair, user) debounce state: a signal must hold above
//! threshold for a configured number of consecutive scans, then respects a
//! cooldown and a minimum FF delta between alerts. State lives in Redis under
//! a 24h TTL; keys use expiry dates, never DTEs, so they do not drift daily.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::Cache;
use crate::config::{
    DELTA_FF_MIN, STABILITY_TTL_SECS, TRACKER_LOCK_BACKOFF_MS, TRACKER_LOCK_RETRIES,
    TRACKER_LOCK_TTL_MS,
};
use crate::error::{AppError, Result};
use crate::types::UserPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityState {
    pub last_ff: f64,
    pub consecutive_above: i64,
    pub last_alert_ts: Option<DateTime<Utc>>,
    pub last_alert_ff: Option<f64>,
}

/// Why a check did or did not approve an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackReason {
    FirstScan,
    NeedsStability,
    Cooldown,
    DeltaTooSmall,
    BelowThreshold,
    Ok,
}

impl std::fmt::Display for TrackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrackReason::FirstScan => "first_scan",
            TrackReason::NeedsStability => "needs_stability",
            TrackReason::Cooldown => "cooldown",
            TrackReason::DeltaTooSmall => "delta_too_small",
            TrackReason::BelowThreshold => "below_threshold",
            TrackReason::Ok => "ok",
        };
        write!(f, "{s}")
    }
}

pub fn stability_key(ticker: &str, front: NaiveDate, back: NaiveDate, user_id: &str) -> String {
    format!("stab|{ticker}|{front}|{back}|{user_id}")
}

/// Pure debounce step. Returns the state to persist, whether to alert, and
/// the reason. The caller owns atomicity and persistence.
pub fn transition(
    prior: Option<&StabilityState>,
    ff: f64,
    policy: &UserPolicy,
    now: DateTime<Utc>,
) -> (StabilityState, bool, TrackReason) {
    let Some(prior) = prior else {
        let state = StabilityState {
            last_ff: ff,
            consecutive_above: 1,
            last_alert_ts: None,
            last_alert_ff: None,
        };
        return (state, false, TrackReason::FirstScan);
    };

    if ff < policy.ff_threshold {
        let state = StabilityState {
            last_ff: ff,
            consecutive_above: 0,
            last_alert_ts: prior.last_alert_ts,
            last_alert_ff: prior.last_alert_ff,
        };
        return (state, false, TrackReason::BelowThreshold);
    }

    let consecutive_above = prior.consecutive_above + 1;
    let mut state = StabilityState {
        last_ff: ff,
        consecutive_above,
        last_alert_ts: prior.last_alert_ts,
        last_alert_ff: prior.last_alert_ff,
    };

    if consecutive_above < i64::from(policy.stability_scans) {
        return (state, false, TrackReason::NeedsStability);
    }

    if let Some(last_alert_ts) = prior.last_alert_ts {
        let elapsed_secs = (now - last_alert_ts).num_seconds();
        if elapsed_secs < policy.cooldown_minutes * 60 {
            return (state, false, TrackReason::Cooldown);
        }
    }

    if let Some(last_alert_ff) = prior.last_alert_ff {
        if ff - last_alert_ff < DELTA_FF_MIN {
            return (state, false, TrackReason::DeltaTooSmall);
        }
    }

    state.last_alert_ts = Some(now);
    state.last_alert_ff = Some(ff);
    (state, true, TrackReason::Ok)
}

/// Redis-backed tracker. The read-modify-write runs under a short-lived
/// per-record lock with bounded acquisition retries; exhausting them surfaces
/// as contention without touching the state.
#[derive(Clone)]
pub struct StabilityTracker {
    cache: Cache,
}

impl StabilityTracker {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }

    pub async fn check(
        &self,
        ticker: &str,
        front: NaiveDate,
        back: NaiveDate,
        user_id: &str,
        ff: f64,
        policy: &UserPolicy,
        now: DateTime<Utc>,
    ) -> Result<(bool, TrackReason)> {
        let key = stability_key(ticker, front, back, user_id);
        let lock_key = format!("lock|{key}");
        let token = uuid::Uuid::new_v4().to_string();

        let mut acquired = false;
        for attempt in 0..TRACKER_LOCK_RETRIES {
            if self
                .cache
                .acquire_lock(&lock_key, &token, TRACKER_LOCK_TTL_MS)
                .await?
            {
                acquired = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(
                TRACKER_LOCK_BACKOFF_MS * (attempt as u64 + 1),
            ))
            .await;
        }
        if !acquired {
            return Err(AppError::TrackerConflict(key));
        }

        let outcome = self.checked_update(&key, ff, policy, now).await;
        let _ = self.cache.release_lock(&lock_key, &token).await;
        outcome
    }

    async fn checked_update(
        &self,
        key: &str,
        ff: f64,
        policy: &UserPolicy,
        now: DateTime<Utc>,
    ) -> Result<(bool, TrackReason)> {
        let prior = self.cache.get_stability(key).await?;
        let (state, should_alert, reason) = transition(prior.as_ref(), ff, policy, now);
        self.cache
            .put_stability(key, &state, STABILITY_TTL_SECS)
            .await?;
        debug!(
            key,
            ff,
            consecutive = state.consecutive_above,
            %reason,
            "stability check"
        );
        Ok((should_alert, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QuietHours, VolPoint};
    use chrono::TimeZone;

    fn policy() -> UserPolicy {
        UserPolicy {
            user_id: "u1".to_string(),
            chat_id: None,
            active: true,
            ff_threshold: 0.20,
            dte_pairs: vec![],
            vol_point: VolPoint::Atm,
            min_open_interest: 100,
            min_volume: 10,
            max_bid_ask_pct: 0.08,
            sigma_fwd_floor: 0.05,
            stability_scans: 2,
            cooldown_minutes: 120,
            quiet_hours: QuietHours::default(),
            timezone: "UTC".to_string(),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap()
    }

    fn mins(n: i64) -> chrono::Duration {
        chrono::Duration::minutes(n)
    }

    #[test]
    fn first_scan_never_alerts() {
        let (state, alert, reason) = transition(None, 2.637, &policy(), t0());
        assert!(!alert);
        assert_eq!(reason, TrackReason::FirstScan);
        assert_eq!(state.consecutive_above, 1);
        assert!(state.last_alert_ts.is_none());
    }

    #[test]
    fn second_consecutive_pass_alerts() {
        let p = policy();
        let (s1, _, _) = transition(None, 2.637, &p, t0());
        let now = t0() + mins(3);
        let (s2, alert, reason) = transition(Some(&s1), 2.637, &p, now);
        assert!(alert);
        assert_eq!(reason, TrackReason::Ok);
        assert_eq!(s2.consecutive_above, 2);
        assert_eq!(s2.last_alert_ts, Some(now));
        assert_eq!(s2.last_alert_ff, Some(2.637));
    }

    #[test]
    fn stability_scans_of_one_alerts_immediately_after_first_scan() {
        let mut p = policy();
        p.stability_scans = 1;
        // First sight of a key is always first_scan; the next pass alerts.
        let (s1, alert, _) = transition(None, 0.30, &p, t0());
        assert!(!alert);
        let (_, alert, reason) = transition(Some(&s1), 0.30, &p, t0() + mins(3));
        assert!(alert);
        assert_eq!(reason, TrackReason::Ok);
    }

    #[test]
    fn one_tick_spike_is_debounced() {
        // Scan1 FF=0.30 (first_scan), Scan2 FF=0.02 (reset), Scan3 FF=0.28:
        // the reset zeroed the streak, so scan3 is one-above again — no alert.
        let p = policy();
        let (s1, a1, r1) = transition(None, 0.30, &p, t0());
        assert!(!a1);
        assert_eq!(r1, TrackReason::FirstScan);

        let (s2, a2, r2) = transition(Some(&s1), 0.02, &p, t0() + mins(3));
        assert!(!a2);
        assert_eq!(r2, TrackReason::BelowThreshold);
        assert_eq!(s2.consecutive_above, 0);

        let (s3, a3, r3) = transition(Some(&s2), 0.28, &p, t0() + mins(6));
        assert!(!a3);
        assert_eq!(r3, TrackReason::NeedsStability);
        assert_eq!(s3.consecutive_above, 1);
    }

    #[test]
    fn cooldown_blocks_realerts() {
        let p = policy();
        let (s1, _, _) = transition(None, 2.637, &p, t0());
        let (s2, alert, _) = transition(Some(&s1), 2.637, &p, t0() + mins(3));
        assert!(alert);

        // 27 minutes after the alert: inside the 120-minute cooldown.
        let (s3, alert, reason) = transition(Some(&s2), 2.7, &p, t0() + mins(30));
        assert!(!alert);
        assert_eq!(reason, TrackReason::Cooldown);
        // The alert stamp is preserved through blocked checks.
        assert_eq!(s3.last_alert_ts, s2.last_alert_ts);
    }

    #[test]
    fn delta_gate_after_cooldown() {
        let p = policy();
        let (s1, _, _) = transition(None, 2.637, &p, t0());
        let alert_at = t0() + mins(3);
        let (s2, alert, _) = transition(Some(&s1), 2.637, &p, alert_at);
        assert!(alert);

        // Past cooldown but FF barely moved: blocked.
        let later = t0() + mins(125);
        let (s3, alert, reason) = transition(Some(&s2), 2.65, &p, later);
        assert!(!alert);
        assert_eq!(reason, TrackReason::DeltaTooSmall);

        // Past cooldown with a real move: alerts and restamps.
        let (s4, alert, reason) = transition(Some(&s3), 2.80, &p, later + mins(3));
        assert!(alert);
        assert_eq!(reason, TrackReason::Ok);
        assert_eq!(s4.last_alert_ff, Some(2.80));
    }

    #[test]
    fn at_most_one_alert_per_cooldown_window() {
        // Property: replay many above-threshold checks; count approvals
        // inside any cooldown-length window.
        let p = policy();
        let mut state: Option<StabilityState> = None;
        let mut alerts: Vec<DateTime<Utc>> = Vec::new();
        for i in 0..100 {
            let now = t0() + mins(i * 3);
            // Rising FF so the delta gate never masks the cooldown gate.
            let ff = 0.30 + 0.03 * i as f64;
            let (next, alert, _) = transition(state.as_ref(), ff, &p, now);
            if alert {
                alerts.push(now);
            }
            state = Some(next);
        }
        for w in alerts.windows(2) {
            assert!((w[1] - w[0]).num_minutes() >= 120, "alerts too close: {w:?}");
        }
    }

    #[test]
    fn key_uses_expiry_dates_and_user() {
        let f = NaiveDate::from_ymd_opt(2026, 4, 2).unwrap();
        let b = NaiveDate::from_ymd_opt(2026, 5, 1).unwrap();
        assert_eq!(
            stability_key("SPY", f, b, "u42"),
            "stab|SPY|2026-04-02|2026-05-01|u42"
        );
    }
}
