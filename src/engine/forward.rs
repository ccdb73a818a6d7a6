//! Forward Factor math. Pure, clock-free, and total: every input either
//! yields a finite result or a typed rejection, never NaN or infinity.

use crate::types::ReasonCode;

/// Why a forward-vol computation was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfReject {
    /// dte < 1 on either leg, or front tenor >= back tenor.
    InvalidDte,
    /// Back total variance below front total variance.
    NegativeForwardVariance,
    /// sigma_fwd below the policy floor (or exactly zero).
    SigmaFwdFloor,
}

impl FfReject {
    pub fn reason(self) -> ReasonCode {
        match self {
            FfReject::InvalidDte => ReasonCode::InvalidDte,
            FfReject::NegativeForwardVariance => ReasonCode::NegativeForwardVariance,
            FfReject::SigmaFwdFloor => ReasonCode::SigmaFwdFloor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForwardVol {
    pub sigma_fwd: f64,
    pub ff: f64,
}

/// Compute the forward volatility between two expiries and the Forward Factor
/// (front IV rich/cheap versus the implied forward):
///
/// V1 = σ1²·T1, V2 = σ2²·T2, V_fwd = (V2 − V1)/(T2 − T1),
/// σ_fwd = √V_fwd, FF = (σ1 − σ_fwd)/σ_fwd.
///
/// A σ_fwd of exactly zero is rejected through the floor arm even when the
/// floor is zero, since FF is undefined there.
pub fn forward_factor(
    front_iv: f64,
    front_dte: i32,
    back_iv: f64,
    back_dte: i32,
    sigma_fwd_floor: f64,
) -> Result<ForwardVol, FfReject> {
    let t1 = f64::from(front_dte) / 365.0;
    let t2 = f64::from(back_dte) / 365.0;

    if front_dte < 1 || back_dte < 1 || t1 >= t2 {
        return Err(FfReject::InvalidDte);
    }

    let v1 = front_iv * front_iv * t1;
    let v2 = back_iv * back_iv * t2;
    let v_fwd = (v2 - v1) / (t2 - t1);

    if v_fwd < 0.0 {
        return Err(FfReject::NegativeForwardVariance);
    }

    let sigma_fwd = v_fwd.sqrt();
    if sigma_fwd < sigma_fwd_floor || sigma_fwd <= 0.0 {
        return Err(FfReject::SigmaFwdFloor);
    }

    Ok(ForwardVol {
        sigma_fwd,
        ff: (front_iv - sigma_fwd) / sigma_fwd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spy_30_60_example() {
        // 30d @ 30 vol against 60d @ 22 vol: front is rich.
        let fv = forward_factor(0.30, 30, 0.22, 60, 0.05).unwrap();
        assert!((fv.sigma_fwd - 0.08249).abs() < 1e-4, "sigma_fwd={}", fv.sigma_fwd);
        assert!((fv.ff - 2.637).abs() < 5e-3, "ff={}", fv.ff);
    }

    #[test]
    fn zero_front_dte_rejected() {
        assert_eq!(forward_factor(0.30, 0, 0.22, 60, 0.0), Err(FfReject::InvalidDte));
    }

    #[test]
    fn equal_dtes_rejected() {
        assert_eq!(forward_factor(0.30, 30, 0.22, 30, 0.0), Err(FfReject::InvalidDte));
    }

    #[test]
    fn inverted_tenors_rejected() {
        assert_eq!(forward_factor(0.30, 60, 0.22, 30, 0.0), Err(FfReject::InvalidDte));
    }

    #[test]
    fn negative_forward_variance_rejected() {
        // 50 vol front, 20 vol back: V2 < V1.
        assert_eq!(
            forward_factor(0.50, 30, 0.20, 60, 0.0),
            Err(FfReject::NegativeForwardVariance)
        );
    }

    #[test]
    fn sigma_fwd_below_floor_rejected() {
        // Nearly flat total variance → tiny sigma_fwd.
        let err = forward_factor(0.2000, 30, 0.1420, 60, 0.05);
        assert_eq!(err, Err(FfReject::SigmaFwdFloor));
    }

    #[test]
    fn zero_forward_variance_never_divides_by_zero() {
        // 0.2 is exactly twice 0.1 in binary and T2 is exactly 4·T1, so
        // σ1²·T1 == σ2²·T2 bit-for-bit: V_fwd = 0 → σ_fwd = 0 → floor reject.
        let res = forward_factor(0.2, 365, 0.1, 1460, 0.0);
        assert_eq!(res, Err(FfReject::SigmaFwdFloor));
    }

    #[test]
    fn never_nan_over_a_grid() {
        for &iv1 in &[0.01, 0.2, 1.0, 4.9] {
            for &iv2 in &[0.01, 0.2, 1.0, 4.9] {
                for &(d1, d2) in &[(1, 2), (7, 30), (30, 60), (364, 365)] {
                    if let Ok(fv) = forward_factor(iv1, d1, iv2, d2, 0.0) {
                        assert!(fv.ff.is_finite());
                        assert!(fv.sigma_fwd.is_finite());
                    }
                }
            }
        }
    }
}
