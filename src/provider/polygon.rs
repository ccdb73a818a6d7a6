//! Polygon.io implementation of the chain provider: previous-close aggregate
//! for the underlying, then the options-chain snapshot endpoint. Responses
//! are parsed field-by-field from JSON; contracts that violate the chain
//! invariants are dropped at this boundary, never passed downstream.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tracing::{debug, warn};

use crate::config::{PROVIDER_RATE_BURST, PROVIDER_RATE_PER_SEC, PROVIDER_TIMEOUT_SECS};
use crate::provider::{ChainProvider, ProviderError, TokenBucket};
use crate::types::{ChainSnapshot, Contract, Expiry, Right};

pub const POLYGON_BASE_URL: &str = "https://api.polygon.io";

pub struct PolygonProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    bucket: TokenBucket,
}

impl PolygonProvider {
    pub fn new(api_key: String) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(PROVIDER_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url: std::env::var("POLYGON_BASE_URL")
                .unwrap_or_else(|_| POLYGON_BASE_URL.to_string()),
            bucket: TokenBucket::new(PROVIDER_RATE_PER_SEC, PROVIDER_RATE_BURST),
        })
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, ProviderError> {
        self.bucket.acquire().await;

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("request failed: {e}")))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            if let Some(delay) = retry_after {
                self.bucket.penalize(delay).await;
            }
            return Err(ProviderError::rate_limited(retry_after));
        }
        if status.is_server_error() {
            return Err(ProviderError {
                kind: crate::provider::ProviderErrorKind::Transient,
                http_status: Some(status.as_u16()),
                retry_after: None,
                message: format!("server error {status}"),
            });
        }
        if !status.is_success() {
            return Err(ProviderError {
                kind: crate::provider::ProviderErrorKind::Permanent,
                http_status: Some(status.as_u16()),
                retry_after: None,
                message: format!("client error {status}"),
            });
        }

        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| ProviderError::permanent(format!("malformed payload: {e}")))
    }

    async fn underlying_price(&self, ticker: &str) -> Result<f64, ProviderError> {
        let url = format!(
            "{}/v2/aggs/ticker/{ticker}/prev?apiKey={}",
            self.base_url, self.api_key
        );
        let body = self.get_json(&url).await?;
        body.get("results")
            .and_then(|r| r.as_array())
            .and_then(|a| a.first())
            .and_then(|bar| bar.get("c"))
            .and_then(|c| c.as_f64())
            .ok_or_else(|| ProviderError::permanent(format!("no price data for {ticker}")))
    }
}

#[async_trait]
impl ChainProvider for PolygonProvider {
    async fn get_chain_snapshot(&self, ticker: &str) -> Result<ChainSnapshot, ProviderError> {
        let ticker = ticker.to_uppercase();
        let underlying_price = self.underlying_price(&ticker).await?;

        let url = format!(
            "{}/v3/snapshot/options/{ticker}?limit=250&apiKey={}",
            self.base_url, self.api_key
        );
        let body = self.get_json(&url).await?;

        if body.get("status").and_then(|s| s.as_str()) != Some("OK") {
            return Err(ProviderError::permanent(format!(
                "snapshot status {:?} for {ticker}",
                body.get("status")
            )));
        }

        let as_of = Utc::now();
        let today = as_of.date_naive();
        let results = body
            .get("results")
            .and_then(|r| r.as_array())
            .ok_or_else(|| ProviderError::permanent("snapshot results missing"))?;

        let mut by_expiry: BTreeMap<NaiveDate, Vec<Contract>> = BTreeMap::new();
        let mut dropped = 0usize;
        for item in results {
            let Some((expiry_date, contract)) = parse_contract(item) else {
                dropped += 1;
                continue;
            };
            if !contract.is_well_formed() {
                debug!(
                    symbol = %contract.symbol,
                    "dropping contract violating chain invariants"
                );
                dropped += 1;
                continue;
            }
            by_expiry.entry(expiry_date).or_default().push(contract);
        }
        if dropped > 0 {
            warn!(ticker = %ticker, dropped, "snapshot contained unusable contracts");
        }

        let expiries = by_expiry
            .into_iter()
            .map(|(expiry_date, contracts)| Expiry {
                expiry_date,
                dte: (expiry_date - today).num_days() as i32,
                contracts,
            })
            .collect();

        Ok(ChainSnapshot {
            ticker,
            as_of,
            underlying_price,
            expiries,
        })
    }
}

/// Parse one snapshot entry. Returns None when structurally unusable
/// (missing expiry, strike, or contract type).
fn parse_contract(item: &serde_json::Value) -> Option<(NaiveDate, Contract)> {
    let details = item.get("details")?;
    let expiry_date =
        NaiveDate::parse_from_str(details.get("expiration_date")?.as_str()?, "%Y-%m-%d").ok()?;
    let strike = details.get("strike_price")?.as_f64()?;
    let right = match details.get("contract_type")?.as_str()? {
        "call" => Right::Call,
        "put" => Right::Put,
        _ => return None,
    };

    let quote = item.get("last_quote");
    let greeks = item.get("greeks");
    let day = item.get("day");

    let contract = Contract {
        symbol: details
            .get("ticker")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string(),
        strike,
        right,
        bid: quote.and_then(|q| q.get("bid")).and_then(|v| v.as_f64()),
        ask: quote.and_then(|q| q.get("ask")).and_then(|v| v.as_f64()),
        implied_volatility: greeks
            .and_then(|g| g.get("implied_volatility"))
            .and_then(|v| v.as_f64()),
        delta: greeks.and_then(|g| g.get("delta")).and_then(|v| v.as_f64()),
        volume: day.and_then(|d| d.get("volume")).and_then(|v| v.as_i64()),
        open_interest: item.get("open_interest").and_then(|v| v.as_i64()),
    };

    Some((expiry_date, contract))
}

/// Retry-After arrives as delta-seconds; date forms are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_contract() {
        let item = json!({
            "details": {
                "ticker": "O:SPY260402C00500000",
                "expiration_date": "2026-04-02",
                "strike_price": 500.0,
                "contract_type": "call"
            },
            "last_quote": {"bid": 3.00, "ask": 3.10},
            "greeks": {"implied_volatility": 0.30, "delta": 0.52},
            "day": {"volume": 120},
            "open_interest": 500
        });
        let (expiry, c) = parse_contract(&item).unwrap();
        assert_eq!(expiry, NaiveDate::from_ymd_opt(2026, 4, 2).unwrap());
        assert_eq!(c.right, Right::Call);
        assert_eq!(c.bid, Some(3.00));
        assert_eq!(c.open_interest, Some(500));
        assert!(c.is_well_formed());
    }

    #[test]
    fn missing_quote_fields_stay_none() {
        let item = json!({
            "details": {
                "expiration_date": "2026-04-02",
                "strike_price": 500.0,
                "contract_type": "put"
            }
        });
        let (_, c) = parse_contract(&item).unwrap();
        assert!(c.bid.is_none());
        assert!(c.ask.is_none());
        assert!(c.implied_volatility.is_none());
    }

    #[test]
    fn structurally_unusable_entry_is_none() {
        let item = json!({"details": {"strike_price": 500.0, "contract_type": "call"}});
        assert!(parse_contract(&item).is_none());
        let item = json!({"details": {
            "expiration_date": "2026-04-02", "strike_price": 500.0, "contract_type": "straddle"
        }});
        assert!(parse_contract(&item).is_none());
    }

    #[test]
    fn crossed_quote_fails_invariants() {
        let item = json!({
            "details": {
                "expiration_date": "2026-04-02",
                "strike_price": 500.0,
                "contract_type": "call"
            },
            "last_quote": {"bid": 3.20, "ask": 3.10}
        });
        let (_, c) = parse_contract(&item).unwrap();
        assert!(!c.is_well_formed());
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2026 07:28:00 GMT"), None);
    }
}
