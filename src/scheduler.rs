//! Tiered scan scheduling. Each tier ticks at its own cadence and enqueues
//! one job per (ticker, bucket); a Redis SET NX claim keyed on the bucket
//! collapses concurrent scheduler instances onto a single scan. A separate
//! slow tick recomputes subscriber counts and tiers from the subscriptions
//! table; tier changes are plain row writes picked up on the next cadence
//! tick, so they never reorder or lose scans.

use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::cache::Cache;
use crate::config::{Config, HIGH_TIER_DTE_SLACK, REGISTRY_REFRESH_SECS, SCAN_QUEUE_WATERMARK};
use crate::error::Result;
use crate::store::Registry;
use crate::types::{ScanJob, Tier};

/// Tier for a ticker given its subscriber count, the front targets its
/// subscribers want, and the listed expiries last seen by a scan. No cached
/// expiries means the proximity rule cannot hold, so at most medium.
pub fn derive_tier(
    subscriber_count: i64,
    front_targets: &[i32],
    listed_expiries: Option<&[NaiveDate]>,
    today: NaiveDate,
) -> Tier {
    if subscriber_count <= 0 {
        return Tier::Low;
    }
    let Some(expiries) = listed_expiries else {
        return Tier::Medium;
    };
    for &target in front_targets {
        for &expiry in expiries {
            let dte = (expiry - today).num_days();
            if dte >= 0 && (dte - i64::from(target)).abs() <= i64::from(HIGH_TIER_DTE_SLACK) {
                return Tier::High;
            }
        }
    }
    Tier::Medium
}

/// Scan bucket for an instant: floor(unix seconds / cadence). Every
/// scheduler instance maps any instant inside one cadence window to the same
/// bucket, which is what lets the cache claim collapse them to a single scan.
pub fn bucket_for(now_secs: i64, cadence_secs: i64) -> i64 {
    now_secs / cadence_secs
}

/// Job deadline: the end of the bucket's cadence window.
pub fn deadline_for(bucket: i64, cadence_secs: i64) -> i64 {
    (bucket + 1) * cadence_secs
}

pub struct Scheduler {
    cfg: Config,
    cache: Cache,
    registry: Registry,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(cfg: Config, cache: Cache, registry: Registry, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            cfg,
            cache,
            registry,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        // Tiers must exist before the first cadence tick fires.
        if let Err(e) = self.refresh_registry().await {
            error!("initial registry refresh failed: {e}");
        }

        let mut high = interval(Duration::from_secs(self.cfg.cadence_secs(Tier::High) as u64));
        let mut medium = interval(Duration::from_secs(self.cfg.cadence_secs(Tier::Medium) as u64));
        let mut low = interval(Duration::from_secs(self.cfg.cadence_secs(Tier::Low) as u64));
        let mut registry_tick = interval(Duration::from_secs(REGISTRY_REFRESH_SECS));
        registry_tick.tick().await; // refresh already ran above

        info!(
            high_mins = self.cfg.cadence_high_mins,
            medium_mins = self.cfg.cadence_medium_mins,
            low_mins = self.cfg.cadence_low_mins,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = high.tick() => self.run_tier(Tier::High).await,
                _ = medium.tick() => self.run_tier(Tier::Medium).await,
                _ = low.tick() => self.run_tier(Tier::Low).await,
                _ = registry_tick.tick() => {
                    if let Err(e) = self.refresh_registry().await {
                        error!("registry refresh failed: {e}");
                    }
                }
                _ = self.shutdown.changed() => {
                    info!("scheduler draining");
                    return;
                }
            }
        }
    }

    async fn run_tier(&self, tier: Tier) {
        if let Err(e) = self.enqueue_tier(tier).await {
            error!(tier = %tier, "scheduler tick failed: {e}");
        }
    }

    async fn enqueue_tier(&self, tier: Tier) -> Result<()> {
        let tickers = self.registry.tickers_in_tier(tier).await?;
        if tickers.is_empty() {
            return Ok(());
        }

        // Backpressure: a deep queue means the pool is behind. Skip the
        // bucket rather than stack scans onto it.
        let depth = self.cache.scan_queue_depth().await?;
        if depth > SCAN_QUEUE_WATERMARK {
            warn!(
                tier = %tier,
                depth,
                skipped = tickers.len(),
                "scan queue over watermark, dropping bucket"
            );
            return Ok(());
        }

        let cadence = self.cfg.cadence_secs(tier);
        let bucket = bucket_for(Utc::now().timestamp(), cadence);

        let mut enqueued = 0usize;
        let mut already_claimed = 0usize;
        for ticker in tickers {
            if !self
                .cache
                .try_claim_scan_bucket(&ticker, bucket, cadence as u64)
                .await?
            {
                already_claimed += 1;
                continue;
            }
            let job = ScanJob {
                ticker,
                bucket,
                cadence_secs: cadence,
                deadline: deadline_for(bucket, cadence),
                requeued: false,
            };
            self.cache.push_scan_job(&job).await?;
            enqueued += 1;
        }

        info!(
            tier = %tier,
            bucket,
            enqueued,
            already_claimed,
            "tier tick: {enqueued} enqueued, {already_claimed} already claimed"
        );
        Ok(())
    }

    /// Recompute subscriber counts and tiers. Writes are idempotent; a
    /// concurrent scheduler doing the same work converges on the same rows.
    async fn refresh_registry(&self) -> Result<()> {
        let counts = self.registry.subscription_counts().await?;
        let targets = self.registry.front_targets_by_ticker().await?;
        let today = Utc::now().date_naive();

        let mut subscribed = Vec::with_capacity(counts.len());
        for (ticker, count) in counts {
            let listed = self.cache.get_listed_expiries(&ticker).await.unwrap_or(None);
            let tier = derive_tier(
                count,
                targets.get(&ticker).map(Vec::as_slice).unwrap_or(&[]),
                listed.as_deref(),
                today,
            );
            self.registry.upsert_ticker(&ticker, count, tier).await?;
            subscribed.push(ticker);
        }
        self.registry.demote_unsubscribed(&subscribed).await?;

        info!(tickers = subscribed.len(), "registry refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn date(dte: i64) -> NaiveDate {
        today() + chrono::Days::new(dte as u64)
    }

    #[test]
    fn zero_subscribers_is_low() {
        assert_eq!(derive_tier(0, &[30], Some(&[date(30)]), today()), Tier::Low);
    }

    #[test]
    fn subscribers_without_cached_expiries_is_medium() {
        assert_eq!(derive_tier(3, &[30], None, today()), Tier::Medium);
    }

    #[test]
    fn expiry_near_front_target_is_high() {
        // Listed expiry at 33 DTE, target 30: within the 5-day slack.
        assert_eq!(derive_tier(1, &[30], Some(&[date(33)]), today()), Tier::High);
    }

    #[test]
    fn expiry_far_from_all_targets_is_medium() {
        assert_eq!(
            derive_tier(5, &[30, 60], Some(&[date(10), date(90)]), today()),
            Tier::Medium
        );
    }

    #[test]
    fn expired_dates_never_promote() {
        // An expiry 30 days in the past is |dte - target| = 60 — and even a
        // target of -30 would not count because dte must be non-negative.
        let past = today() - chrono::Days::new(30);
        assert_eq!(derive_tier(5, &[30], Some(&[past]), today()), Tier::Medium);
    }

    #[test]
    fn boundary_slack_is_inclusive() {
        assert_eq!(derive_tier(1, &[30], Some(&[date(35)]), today()), Tier::High);
        assert_eq!(derive_tier(1, &[30], Some(&[date(36)]), today()), Tier::Medium);
    }

    #[test]
    fn instants_within_one_cadence_window_share_a_bucket() {
        // Two scheduler instances ticking at different moments inside the
        // same window derive the same bucket, and with it the same claim
        // key, so only one of their enqueues survives the SET NX.
        let cadence = 180;
        let window_start = 9_000 * cadence;
        for offset in [0, 1, 89, 179] {
            assert_eq!(bucket_for(window_start + offset, cadence), 9_000);
        }
        assert_eq!(bucket_for(window_start + cadence, cadence), 9_001);
    }

    #[test]
    fn deadline_is_end_of_bucket_window() {
        let cadence = 180;
        let now = 9_000 * cadence + 42;
        let bucket = bucket_for(now, cadence);
        let deadline = deadline_for(bucket, cadence);
        // Any instant in the window sits before the deadline; the first
        // instant of the next window does not.
        assert!(now < deadline);
        assert_eq!(deadline, (9_000 + 1) * cadence);
    }
}
