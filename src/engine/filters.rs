//! Liquidity and quote-quality gates applied to the two legs of a candidate.
//! Reasons degrade a signal's quality score; they never abort the scan.

use crate::types::{Contract, ReasonCode, UserPolicy};

/// Evaluate one leg. Reasons are appended in check order: quotes, mid,
/// spread, open interest, volume.
fn leg_reasons(contract: &Contract, policy: &UserPolicy, out: &mut Vec<ReasonCode>) {
    let (Some(bid), Some(ask)) = (contract.bid, contract.ask) else {
        out.push(ReasonCode::MissingQuotes);
        return;
    };

    let mid = (bid + ask) / 2.0;
    if mid <= 0.0 {
        out.push(ReasonCode::NonpositiveMid);
        return;
    }

    // bid == ask gives spread 0, which always passes.
    if (ask - bid) / mid > policy.max_bid_ask_pct {
        out.push(ReasonCode::WideSpread);
    }

    if contract.open_interest.unwrap_or(0) < policy.min_open_interest {
        out.push(ReasonCode::LowOi);
    }

    if contract.volume.unwrap_or(0) < policy.min_volume {
        out.push(ReasonCode::LowVolume);
    }
}

/// Reasons raised across both legs, deduplicated, front leg first.
pub fn liquidity_reasons(
    front: &Contract,
    back: &Contract,
    policy: &UserPolicy,
) -> Vec<ReasonCode> {
    let mut reasons = Vec::new();
    leg_reasons(front, policy, &mut reasons);
    leg_reasons(back, policy, &mut reasons);
    let mut seen = Vec::with_capacity(reasons.len());
    for r in reasons {
        if !seen.contains(&r) {
            seen.push(r);
        }
    }
    seen
}
