//! Pure signal engine: pairs expiries per policy rules, picks a vol point on
//! each leg, computes the Forward Factor, and applies liquidity gates.
//! No I/O, no clock reads beyond the snapshot's as-of, no input mutation.

pub mod filters;
pub mod forward;

use self::forward::forward_factor;
use crate::types::{
    ChainSnapshot, Contract, EngineDiagnostic, EngineOutput, Expiry, ReasonCode, Right,
    SignalCandidate, UserPolicy, VolPoint,
};

/// Resolve each pairing rule against the listed expiries. The front leg is
/// picked independently of the back; a rule drops out when either side has
/// no expiry in tolerance or the legs are not strictly front < back.
pub fn pair_expiries<'a>(
    snapshot: &'a ChainSnapshot,
    policy: &UserPolicy,
) -> Vec<(&'a Expiry, &'a Expiry)> {
    let mut pairs = Vec::new();
    for rule in &policy.dte_pairs {
        let Some(front) = snapshot.expiry_near_dte(rule.front_target, rule.front_tol) else {
            continue;
        };
        let Some(back) = snapshot.expiry_near_dte(rule.back_target, rule.back_tol) else {
            continue;
        };
        if front.dte >= back.dte {
            continue;
        }
        pairs.push((front, back));
    }
    pairs
}

/// Pick the contract representing an expiry's vol and its IV.
/// ATM = nearest strike (lower on ties); Nd_put/Nd_call = nearest |delta|.
/// An empty candidate set or an absent IV both reject as missing_iv.
pub fn select_vol_point<'a>(
    expiry: &'a Expiry,
    underlying_price: f64,
    vol_point: VolPoint,
) -> Result<(&'a Contract, f64), ReasonCode> {
    let contract = match vol_point {
        VolPoint::Atm => expiry.atm_contract(underlying_price, Right::Call),
        VolPoint::DeltaPut(n) => expiry.delta_contract(f64::from(n) / 100.0, Right::Put),
        VolPoint::DeltaCall(n) => expiry.delta_contract(f64::from(n) / 100.0, Right::Call),
    };
    let Some(contract) = contract else {
        return Err(ReasonCode::MissingIv);
    };
    match contract.implied_volatility {
        Some(iv) => Ok((contract, iv)),
        None => Err(ReasonCode::MissingIv),
    }
}

/// Run the full per-user pipeline over one snapshot. Threshold-crossing
/// candidates come back sorted by FF descending; everything else that was
/// evaluated and rejected is reported as a diagnostic.
pub fn compute(snapshot: &ChainSnapshot, policy: &UserPolicy) -> EngineOutput {
    let mut out = EngineOutput::default();

    for (front, back) in pair_expiries(snapshot, policy) {
        let diag = |reasons: Vec<ReasonCode>| EngineDiagnostic {
            ticker: snapshot.ticker.clone(),
            front_expiry: front.expiry_date,
            back_expiry: back.expiry_date,
            reasons,
        };

        let front_sel = select_vol_point(front, snapshot.underlying_price, policy.vol_point);
        let back_sel = select_vol_point(back, snapshot.underlying_price, policy.vol_point);
        let ((front_contract, front_iv), (back_contract, back_iv)) = match (front_sel, back_sel) {
            (Ok(f), Ok(b)) => (f, b),
            (f, b) => {
                let mut reasons = Vec::new();
                if let Err(r) = f {
                    reasons.push(r);
                }
                if let Err(r) = b {
                    if !reasons.contains(&r) {
                        reasons.push(r);
                    }
                }
                out.diagnostics.push(diag(reasons));
                continue;
            }
        };

        let fv = match forward_factor(
            front_iv,
            front.dte,
            back_iv,
            back.dte,
            policy.sigma_fwd_floor,
        ) {
            Ok(fv) => fv,
            Err(reject) => {
                out.diagnostics.push(diag(vec![reject.reason()]));
                continue;
            }
        };

        let reasons = filters::liquidity_reasons(front_contract, back_contract, policy);

        if fv.ff < policy.ff_threshold {
            continue;
        }

        let quality_score = if reasons.is_empty() { 1.0 } else { 0.5 };
        out.signals.push(SignalCandidate {
            ticker: snapshot.ticker.clone(),
            as_of: snapshot.as_of,
            front_expiry: front.expiry_date,
            back_expiry: back.expiry_date,
            front_dte: front.dte,
            back_dte: back.dte,
            front_iv,
            back_iv,
            sigma_fwd: fv.sigma_fwd,
            ff_value: fv.ff,
            vol_point: policy.vol_point,
            quality_score,
            reason_codes: reasons,
            underlying_price: snapshot.underlying_price,
        });
    }

    out.signals
        .sort_by(|a, b| b.ff_value.partial_cmp(&a.ff_value).unwrap_or(std::cmp::Ordering::Equal));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DtePair, QuietHours};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn contract(
        strike: f64,
        right: Right,
        iv: Option<f64>,
        bid: Option<f64>,
        ask: Option<f64>,
        oi: i64,
        vol: i64,
    ) -> Contract {
        Contract {
            symbol: format!("{strike}-{right}"),
            strike,
            right,
            bid,
            ask,
            implied_volatility: iv,
            delta: Some(if right == Right::Call { 0.5 } else { -0.5 }),
            volume: Some(vol),
            open_interest: Some(oi),
        }
    }

    fn expiry(dte: i32, contracts: Vec<Contract>) -> Expiry {
        Expiry {
            expiry_date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
                + chrono::Days::new(dte as u64),
            dte,
            contracts,
        }
    }

    fn snapshot(expiries: Vec<Expiry>) -> ChainSnapshot {
        ChainSnapshot {
            ticker: "SPY".to_string(),
            as_of: Utc.with_ymd_and_hms(2026, 3, 1, 15, 30, 0).unwrap(),
            underlying_price: 500.0,
            expiries,
        }
    }

    fn policy() -> UserPolicy {
        UserPolicy {
            user_id: "u1".to_string(),
            chat_id: None,
            active: true,
            ff_threshold: 0.20,
            dte_pairs: vec![DtePair {
                front_target: 30,
                back_target: 60,
                front_tol: 5,
                back_tol: 10,
            }],
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

    fn rich_front_chain() -> ChainSnapshot {
        snapshot(vec![
            expiry(
                30,
                vec![contract(500.0, Right::Call, Some(0.30), Some(3.00), Some(3.10), 500, 120)],
            ),
            expiry(
                60,
                vec![contract(500.0, Right::Call, Some(0.22), Some(4.50), Some(4.55), 800, 90)],
            ),
        ])
    }

    #[test]
    fn happy_path_emits_full_quality_signal() {
        let out = compute(&rich_front_chain(), &policy());
        assert_eq!(out.signals.len(), 1);
        assert!(out.diagnostics.is_empty());
        let s = &out.signals[0];
        assert!((s.ff_value - 2.637).abs() < 5e-3, "ff={}", s.ff_value);
        assert!((s.sigma_fwd - 0.08249).abs() < 1e-4);
        assert_eq!(s.quality_score, 1.0);
        assert!(s.reason_codes.is_empty());
        assert_eq!(s.front_dte, 30);
        assert_eq!(s.back_dte, 60);
    }

    #[test]
    fn compute_is_pure_and_repeatable() {
        let chain = rich_front_chain();
        let p = policy();
        let a = compute(&chain, &p);
        let b = compute(&chain, &p);
        assert_eq!(a.signals.len(), b.signals.len());
        assert_eq!(a.signals[0].ff_value.to_bits(), b.signals[0].ff_value.to_bits());
        assert_eq!(a.signals[0].reason_codes, b.signals[0].reason_codes);
    }

    #[test]
    fn wide_spread_degrades_quality_but_still_emits() {
        let chain = snapshot(vec![
            expiry(
                30,
                vec![contract(500.0, Right::Call, Some(0.30), Some(2.50), Some(3.00), 500, 120)],
            ),
            expiry(
                60,
                vec![contract(500.0, Right::Call, Some(0.22), Some(4.50), Some(4.55), 800, 90)],
            ),
        ]);
        let out = compute(&chain, &policy());
        assert_eq!(out.signals.len(), 1);
        let s = &out.signals[0];
        assert_eq!(s.quality_score, 0.5);
        assert_eq!(s.reason_codes, vec![ReasonCode::WideSpread]);
    }

    #[test]
    fn negative_forward_variance_becomes_diagnostic() {
        let chain = snapshot(vec![
            expiry(
                30,
                vec![contract(500.0, Right::Call, Some(0.50), Some(3.00), Some(3.10), 500, 120)],
            ),
            expiry(
                60,
                vec![contract(500.0, Right::Call, Some(0.20), Some(4.50), Some(4.55), 800, 90)],
            ),
        ]);
        let out = compute(&chain, &policy());
        assert!(out.signals.is_empty());
        assert_eq!(out.diagnostics.len(), 1);
        assert_eq!(out.diagnostics[0].reasons, vec![ReasonCode::NegativeForwardVariance]);
    }

    #[test]
    fn missing_iv_becomes_diagnostic() {
        let chain = snapshot(vec![
            expiry(
                30,
                vec![contract(500.0, Right::Call, None, Some(3.00), Some(3.10), 500, 120)],
            ),
            expiry(
                60,
                vec![contract(500.0, Right::Call, Some(0.22), Some(4.50), Some(4.55), 800, 90)],
            ),
        ]);
        let out = compute(&chain, &policy());
        assert!(out.signals.is_empty());
        assert_eq!(out.diagnostics[0].reasons, vec![ReasonCode::MissingIv]);
    }

    #[test]
    fn below_threshold_is_silent() {
        // Mild dislocation: FF positive but under 20%.
        let chain = snapshot(vec![
            expiry(
                30,
                vec![contract(500.0, Right::Call, Some(0.23), Some(3.00), Some(3.10), 500, 120)],
            ),
            expiry(
                60,
                vec![contract(500.0, Right::Call, Some(0.22), Some(4.50), Some(4.55), 800, 90)],
            ),
        ]);
        let out = compute(&chain, &policy());
        assert!(out.signals.is_empty());
        assert!(out.diagnostics.is_empty());
    }

    #[test]
    fn no_expiry_in_tolerance_drops_rule() {
        let chain = snapshot(vec![
            expiry(
                10,
                vec![contract(500.0, Right::Call, Some(0.30), Some(3.00), Some(3.10), 500, 120)],
            ),
            expiry(
                60,
                vec![contract(500.0, Right::Call, Some(0.22), Some(4.50), Some(4.55), 800, 90)],
            ),
        ]);
        let out = compute(&chain, &policy());
        assert!(out.signals.is_empty());
        assert!(out.diagnostics.is_empty());
    }

    #[test]
    fn overlapping_tolerances_cannot_invert_legs() {
        // One listed expiry satisfies both targets; front == back must drop.
        let chain = snapshot(vec![expiry(
            45,
            vec![contract(500.0, Right::Call, Some(0.30), Some(3.00), Some(3.10), 500, 120)],
        )]);
        let mut p = policy();
        p.dte_pairs = vec![DtePair {
            front_target: 40,
            back_target: 50,
            front_tol: 10,
            back_tol: 10,
        }];
        let out = compute(&chain, &p);
        assert!(out.signals.is_empty());
    }

    #[test]
    fn delta_vol_point_uses_put_side() {
        let mut p = policy();
        p.vol_point = VolPoint::DeltaPut(35);
        let mut front_put =
            contract(480.0, Right::Put, Some(0.32), Some(2.00), Some(2.05), 400, 50);
        front_put.delta = Some(-0.35);
        let mut back_put =
            contract(470.0, Right::Put, Some(0.24), Some(3.80), Some(3.85), 600, 40);
        back_put.delta = Some(-0.34);
        let chain = snapshot(vec![expiry(30, vec![front_put]), expiry(60, vec![back_put])]);
        let out = compute(&chain, &p);
        assert_eq!(out.signals.len(), 1);
        assert_eq!(out.signals[0].vol_point, VolPoint::DeltaPut(35));
        assert!((out.signals[0].front_iv - 0.32).abs() < 1e-12);
    }

    #[test]
    fn signals_sorted_by_ff_descending() {
        let mut p = policy();
        p.dte_pairs = vec![
            DtePair { front_target: 30, back_target: 60, front_tol: 2, back_tol: 2 },
            DtePair { front_target: 14, back_target: 60, front_tol: 2, back_tol: 2 },
        ];
        let chain = snapshot(vec![
            expiry(
                14,
                vec![contract(500.0, Right::Call, Some(0.40), Some(2.00), Some(2.05), 500, 120)],
            ),
            expiry(
                30,
                vec![contract(500.0, Right::Call, Some(0.30), Some(3.00), Some(3.10), 500, 120)],
            ),
            expiry(
                60,
                vec![contract(500.0, Right::Call, Some(0.22), Some(4.50), Some(4.55), 800, 90)],
            ),
        ]);
        let out = compute(&chain, &p);
        assert_eq!(out.signals.len(), 2);
        assert!(out.signals[0].ff_value >= out.signals[1].ff_value);
    }
}
