//! Scan worker: FETCH, COMPUTE, TRACK, PERSIST, NOTIFY, DONE, with an ABORT
//! short-circuit on unrecoverable errors and a per-job deadline of one
//! cadence. Chain fetches are shared through the snapshot cache; engine work
//! runs per subscriber because policies differ, and per-subscriber failures
//! stay contained to that subscriber.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::api::latency::ScanLatency;
use crate::cache::Cache;
use crate::config::{
    EXPIRY_CACHE_TTL_SECS, FETCH_MAX_ATTEMPTS, PROVIDER_BACKOFF_MS, QUEUE_POP_TIMEOUT_SECS,
    RETRY_AFTER_CAP_SECS,
};
use crate::engine;
use crate::error::Result;
use crate::provider::{ChainProvider, ProviderErrorKind};
use crate::stability::StabilityTracker;
use crate::store::{signals, Registry, SignalStore};
use crate::types::{ChainSnapshot, NotificationJob, ScanJob};

pub struct ScanWorker {
    id: usize,
    cache: Cache,
    provider: Arc<dyn ChainProvider>,
    store: SignalStore,
    registry: Registry,
    tracker: StabilityTracker,
    health: Arc<HealthState>,
    latency: Arc<ScanLatency>,
    shutdown: watch::Receiver<bool>,
}

impl ScanWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        cache: Cache,
        provider: Arc<dyn ChainProvider>,
        store: SignalStore,
        registry: Registry,
        tracker: StabilityTracker,
        health: Arc<HealthState>,
        latency: Arc<ScanLatency>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            cache,
            provider,
            store,
            registry,
            tracker,
            health,
            latency,
            shutdown,
        }
    }

    pub async fn run(self) {
        info!(worker = self.id, "scan worker started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.health.mark_worker_ready(Utc::now().timestamp());

            match self.cache.pop_scan_job(QUEUE_POP_TIMEOUT_SECS).await {
                Ok(Some(job)) => {
                    let started = Instant::now();
                    let ticker = job.ticker.clone();
                    match self.scan(job).await {
                        Ok(true) => {
                            self.health.inc_scans_completed();
                            self.latency.record(started.elapsed());
                        }
                        Ok(false) => self.health.inc_scans_aborted(),
                        Err(e) => {
                            self.health.inc_scans_aborted();
                            error!(worker = self.id, ticker = %ticker, "scan failed: {e}");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker = self.id, "queue pop failed: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!(worker = self.id, "scan worker drained");
    }

    /// One job through the full state machine. Ok(true) = DONE, Ok(false) =
    /// ABORT (dropped, expired, or requeued), Err = job failure.
    async fn scan(&self, job: ScanJob) -> Result<bool> {
        if job.expired(Utc::now()) {
            warn!(ticker = %job.ticker, bucket = job.bucket, "job past deadline before fetch, abandoning");
            return Ok(false);
        }

        // FETCH
        let Some(snapshot) = self.fetch(&job).await? else {
            return Ok(false);
        };

        if job.expired(Utc::now()) {
            warn!(ticker = %job.ticker, bucket = job.bucket, "job past deadline after fetch, abandoning");
            return Ok(false);
        }

        // COMPUTE: one batched subscriber+policy read, then per-user engine runs.
        let subscribers = self.registry.subscribers_with_policies(&job.ticker).await?;
        if subscribers.is_empty() {
            debug!(ticker = %job.ticker, "no active subscribers");
            self.registry.touch_last_scan(&job.ticker).await?;
            return Ok(true);
        }

        let mut store_failed = false;
        for policy in &subscribers {
            let output = engine::compute(&snapshot, policy);

            for diag in &output.diagnostics {
                let reasons: Vec<String> = diag.reasons.iter().map(ToString::to_string).collect();
                info!(
                    ticker = %diag.ticker,
                    user_id = %policy.user_id,
                    front = %diag.front_expiry,
                    back = %diag.back_expiry,
                    reasons = reasons.join(","),
                    "pair rejected"
                );
            }

            for candidate in &output.signals {
                // TRACK: linearizable per-key RMW. Contention only affects
                // this (user, pair).
                let verdict = self
                    .tracker
                    .check(
                        &candidate.ticker,
                        candidate.front_expiry,
                        candidate.back_expiry,
                        &policy.user_id,
                        candidate.ff_value,
                        policy,
                        Utc::now(),
                    )
                    .await;
                let (should_alert, reason) = match verdict {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(
                            ticker = %candidate.ticker,
                            user_id = %policy.user_id,
                            "stability check failed: {e}"
                        );
                        continue;
                    }
                };

                // PERSIST: every threshold-crossing signal, alertable or not.
                // Duplicates coalesce on the dedupe-key constraint.
                let signal_id = match self.store.create(candidate).await {
                    Ok(Some(id)) => {
                        info!(
                            ticker = %candidate.ticker,
                            ff = format_args!("{:.4}", candidate.ff_value),
                            quality = candidate.quality_score,
                            "signal persisted"
                        );
                        Some(id)
                    }
                    Ok(None) => self
                        .store
                        .id_for_dedupe_key(&signals::dedupe_key(candidate))
                        .await
                        .unwrap_or_else(|e| {
                            warn!("dedupe-key lookup failed: {e}");
                            None
                        }),
                    Err(e) => {
                        warn!(user_id = %policy.user_id, "signal store unavailable: {e}");
                        store_failed = true;
                        continue;
                    }
                };

                // NOTIFY: only tracker-approved signals, never past the
                // job deadline.
                if !should_alert {
                    debug!(
                        ticker = %candidate.ticker,
                        user_id = %policy.user_id,
                        %reason,
                        "alert withheld"
                    );
                    continue;
                }
                if job.expired(Utc::now()) {
                    warn!(ticker = %job.ticker, "deadline passed, not enqueueing notifications");
                    return Ok(false);
                }
                if let Some(signal_id) = signal_id {
                    let notification = NotificationJob {
                        signal_id,
                        user_id: policy.user_id.clone(),
                    };
                    if let Err(e) = self.cache.push_notification(&notification).await {
                        warn!(user_id = %policy.user_id, "notification enqueue failed: {e}");
                    }
                }
            }
        }

        // DONE
        self.registry.touch_last_scan(&job.ticker).await?;
        if store_failed {
            error!(ticker = %job.ticker, "scan finished with store failures");
            return Ok(false);
        }
        Ok(true)
    }

    /// Snapshot for (ticker, bucket): cache first, then the provider with
    /// bounded backoff. Transient errors retry in place; a 429 honours
    /// Retry-After and requeues the job at most once; permanent errors drop
    /// the job with the failure recorded.
    async fn fetch(&self, job: &ScanJob) -> Result<Option<ChainSnapshot>> {
        if let Some(snapshot) = self.cache.get_chain(&job.ticker, job.bucket).await? {
            debug!(ticker = %job.ticker, bucket = job.bucket, "chain cache hit");
            return Ok(Some(snapshot));
        }

        let mut attempt = 0usize;
        loop {
            match self.provider.get_chain_snapshot(&job.ticker).await {
                Ok(snapshot) => {
                    let ttl = job.cadence_secs.max(1) as u64;
                    if let Err(e) = self.cache.put_chain(&snapshot, job.bucket, ttl).await {
                        warn!("chain cache write failed: {e}");
                    }
                    if let Err(e) = self
                        .cache
                        .put_listed_expiries(
                            &job.ticker,
                            &snapshot.listed_expiry_dates(),
                            EXPIRY_CACHE_TTL_SECS,
                        )
                        .await
                    {
                        warn!("expiry cache write failed: {e}");
                    }
                    return Ok(Some(snapshot));
                }
                Err(err) => match err.kind {
                    ProviderErrorKind::Permanent => {
                        error!(ticker = %job.ticker, "provider permanent failure, dropping job: {err}");
                        return Ok(None);
                    }
                    ProviderErrorKind::RateLimited => {
                        let delay = err
                            .retry_after
                            .unwrap_or(Duration::from_secs(5))
                            .min(Duration::from_secs(RETRY_AFTER_CAP_SECS));
                        tokio::time::sleep(delay).await;
                        if job.requeued {
                            warn!(ticker = %job.ticker, "rate limited after requeue, dropping job");
                        } else {
                            let requeue = ScanJob {
                                requeued: true,
                                ..job.clone()
                            };
                            self.cache.push_scan_job(&requeue).await?;
                            info!(ticker = %job.ticker, "rate limited, job requeued once");
                        }
                        return Ok(None);
                    }
                    ProviderErrorKind::Transient => {
                        attempt += 1;
                        if attempt >= FETCH_MAX_ATTEMPTS {
                            warn!(
                                ticker = %job.ticker,
                                attempts = attempt,
                                "provider retries exhausted, dropping job: {err}"
                            );
                            return Ok(None);
                        }
                        let backoff_ms = PROVIDER_BACKOFF_MS
                            .get(attempt - 1)
                            .copied()
                            .unwrap_or(*PROVIDER_BACKOFF_MS.last().unwrap());
                        debug!(
                            ticker = %job.ticker,
                            attempt,
                            backoff_ms,
                            "provider transient failure, retrying: {err}"
                        );
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        if job.expired(Utc::now()) {
                            warn!(ticker = %job.ticker, "deadline passed during fetch retries");
                            return Ok(None);
                        }
                    }
                },
            }
        }
    }
}
