//! Notification body for a Forward Factor signal. Values are fractions in
//! storage; this is the one place they become percentages.

use crate::store::SignalRow;

pub fn format_signal_message(signal: &SignalRow) -> String {
    let ff_pct = signal.ff_value * 100.0;
    let front_iv_pct = signal.front_iv * 100.0;
    let back_iv_pct = signal.back_iv * 100.0;
    let sigma_fwd_pct = signal.sigma_fwd * 100.0;

    let underlying = signal
        .underlying_price
        .map(|p| format!("${p:.2}"))
        .unwrap_or_else(|| "n/a".to_string());

    let mut message = format!(
        "🚨 Forward Factor Signal: {ticker}\n\
         \n\
         📊 Forward Factor: {ff_pct:.2}%\n\
         Front IV ({front_dte}d): {front_iv_pct:.2}%\n\
         Back IV ({back_dte}d): {back_iv_pct:.2}%\n\
         Implied Forward IV: {sigma_fwd_pct:.2}%\n\
         \n\
         📅 Expiries:\n\
         Front: {front_expiry} ({front_dte} DTE)\n\
         Back: {back_expiry} ({back_dte} DTE)\n\
         \n\
         💰 Underlying: {underlying}\n\
         📍 Vol Point: {vol_point}\n\
         \n\
         📋 Calendar spread: sell front, buy back, same strike.\n\
         Close before front expiry.\n\
         \n\
         🕐 {as_of} UTC",
        ticker = signal.ticker,
        front_dte = signal.front_dte,
        back_dte = signal.back_dte,
        front_expiry = signal.front_expiry,
        back_expiry = signal.back_expiry,
        vol_point = signal.vol_point,
        as_of = signal.as_of_ts.format("%Y-%m-%d %H:%M"),
    );

    if signal.quality_score < 1.0 && !signal.reason_codes.0.is_empty() {
        message.push_str(&format!(
            "\n\n⚠️ Liquidity flags: {}",
            signal.reason_codes.0.join(", ")
        ));
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use sqlx::types::Json;
    use uuid::Uuid;

    fn row(quality: f64, reasons: Vec<String>) -> SignalRow {
        SignalRow {
            id: Uuid::new_v4(),
            ticker: "SPY".to_string(),
            as_of_ts: Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap(),
            front_expiry: NaiveDate::from_ymd_opt(2026, 4, 2).unwrap(),
            back_expiry: NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
            front_dte: 31,
            back_dte: 60,
            front_iv: 0.30,
            back_iv: 0.22,
            sigma_fwd: 0.08249,
            ff_value: 2.637,
            vol_point: "ATM".to_string(),
            quality_score: quality,
            reason_codes: Json(reasons),
            dedupe_key: "k".to_string(),
            underlying_price: Some(500.0),
        }
    }

    #[test]
    fn clean_signal_renders_percentages() {
        let msg = format_signal_message(&row(1.0, vec![]));
        assert!(msg.contains("SPY"));
        assert!(msg.contains("263.70%"));
        assert!(msg.contains("Front IV (31d): 30.00%"));
        assert!(msg.contains("$500.00"));
        assert!(!msg.contains("Liquidity flags"));
    }

    #[test]
    fn degraded_signal_lists_flags() {
        let msg = format_signal_message(&row(0.5, vec!["wide_spread".to_string()]));
        assert!(msg.contains("Liquidity flags: wide_spread"));
    }
}
