//! Notification fan-out. The router drains the notification queue and feeds
//! one dispatch task per user, so per-user delivery is strictly FIFO while
//! users proceed in parallel. Gates run at dispatch time: policy still
//! active, quiet hours in the user's zone, and a threshold re-check against
//! the current policy (it may have changed since the worker enqueued).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::cache::Cache;
use crate::config::{MESSENGER_BACKOFF_MS, NOTIFY_CHANNEL_CAPACITY, QUEUE_POP_TIMEOUT_SECS};
use crate::messenger::format::format_signal_message;
use crate::messenger::{signal_actions, Messenger, SendErrorKind};
use crate::store::{DecisionExtras, Registry, SignalRow, SignalStore};
use crate::types::{NotificationJob, QuietHours, UserPolicy};

/// Quiet-hours membership for `now` in the user's zone. The window wraps
/// midnight when end < start. `UserPolicy::validate` rejects unparseable
/// windows and zones at policy-write time; anything malformed that still
/// reaches this gate fails open with a warning so misconfigured quiet hours
/// are visible in logs rather than silently ignored.
pub fn is_in_quiet_hours(quiet: &QuietHours, timezone: &str, now_utc: DateTime<Utc>) -> bool {
    if !quiet.enabled {
        return false;
    }
    let Ok(tz) = timezone.parse::<chrono_tz::Tz>() else {
        warn!(timezone, "unknown timezone, quiet hours not applied");
        return false;
    };
    let Ok(start) = NaiveTime::parse_from_str(&quiet.start, "%H:%M") else {
        warn!(start = %quiet.start, "bad quiet-hours start, quiet hours not applied");
        return false;
    };
    let Ok(end) = NaiveTime::parse_from_str(&quiet.end, "%H:%M") else {
        warn!(end = %quiet.end, "bad quiet-hours end, quiet hours not applied");
        return false;
    };

    let local = now_utc.with_timezone(&tz).time();
    if start > end {
        local >= start || local <= end
    } else {
        start <= local && local <= end
    }
}

pub struct NotificationRouter {
    cache: Cache,
    store: SignalStore,
    registry: Registry,
    messenger: Arc<dyn Messenger>,
    health: Arc<HealthState>,
    shutdown: watch::Receiver<bool>,
}

impl NotificationRouter {
    pub fn new(
        cache: Cache,
        store: SignalStore,
        registry: Registry,
        messenger: Arc<dyn Messenger>,
        health: Arc<HealthState>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            cache,
            store,
            registry,
            messenger,
            health,
            shutdown,
        }
    }

    pub async fn run(self) {
        info!("notification router started");
        let mut user_txs: HashMap<String, mpsc::Sender<NotificationJob>> = HashMap::new();

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.cache.pop_notification(QUEUE_POP_TIMEOUT_SECS).await {
                Ok(Some(job)) => self.dispatch(&mut user_txs, job),
                Ok(None) => {}
                Err(e) => {
                    error!("notification pop failed: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!("notification router drained");
    }

    /// Forward onto the user's dispatch channel, spawning the per-user task
    /// on first contact. A full channel drops rather than reorders.
    fn dispatch(
        &self,
        user_txs: &mut HashMap<String, mpsc::Sender<NotificationJob>>,
        job: NotificationJob,
    ) {
        let tx = user_txs.entry(job.user_id.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
            let dispatcher = UserDispatcher {
                store: self.store.clone(),
                registry: self.registry.clone(),
                messenger: Arc::clone(&self.messenger),
                health: Arc::clone(&self.health),
                user_id: job.user_id.clone(),
            };
            tokio::spawn(dispatcher.run(rx));
            tx
        });
        if let Err(e) = tx.try_send(job) {
            warn!("user dispatch channel unavailable, dropping notification: {e}");
            self.health.inc_notifications_dropped();
        }
    }
}

/// Sequential delivery for one user: a single in-flight notification at a
/// time preserves ordering and keeps per-chat rate limits simple.
struct UserDispatcher {
    store: SignalStore,
    registry: Registry,
    messenger: Arc<dyn Messenger>,
    health: Arc<HealthState>,
    user_id: String,
}

impl UserDispatcher {
    async fn run(self, mut rx: mpsc::Receiver<NotificationJob>) {
        while let Some(job) = rx.recv().await {
            if let Some((signal, policy)) = self.resolve(&job).await {
                self.gate_and_send(signal, policy, Utc::now()).await;
            }
        }
    }

    /// Load the signal and the user's current policy; None means the
    /// notification was dropped here.
    async fn resolve(&self, job: &NotificationJob) -> Option<(SignalRow, UserPolicy)> {
        let signal = match self.store.get(job.signal_id).await {
            Ok(Some(signal)) => signal,
            Ok(None) => {
                warn!(signal_id = %job.signal_id, "signal not found, dropping notification");
                self.health.inc_notifications_dropped();
                return None;
            }
            Err(e) => {
                error!(signal_id = %job.signal_id, "signal load failed: {e}");
                self.health.inc_notifications_dropped();
                return None;
            }
        };

        let policy = match self.registry.policy(&self.user_id).await {
            Ok(Some(policy)) if policy.active => policy,
            Ok(_) => {
                debug!(user_id = %self.user_id, "no active policy, dropping notification");
                self.health.inc_notifications_dropped();
                return None;
            }
            Err(e) => {
                error!(user_id = %self.user_id, "policy load failed: {e}");
                self.health.inc_notifications_dropped();
                return None;
            }
        };

        Some((signal, policy))
    }

    /// Dispatch-time gates in order (chat id, quiet hours, threshold
    /// re-check), then the send-with-backoff loop.
    async fn gate_and_send(&self, signal: SignalRow, policy: UserPolicy, now: DateTime<Utc>) {
        let Some(chat_id) = policy.chat_id.clone() else {
            warn!(user_id = %self.user_id, "no chat id on policy, dropping notification");
            self.health.inc_notifications_dropped();
            return;
        };

        if is_in_quiet_hours(&policy.quiet_hours, &policy.timezone, now) {
            info!(user_id = %self.user_id, "user in quiet hours, dropping notification");
            self.health.inc_notifications_dropped();
            return;
        }

        // The policy may have tightened between scheduling and dispatch.
        if signal.ff_value < policy.ff_threshold {
            info!(
                user_id = %self.user_id,
                ff = signal.ff_value,
                threshold = policy.ff_threshold,
                "signal below current threshold, dropping notification"
            );
            self.health.inc_notifications_dropped();
            return;
        }

        let text = format_signal_message(&signal);
        let actions = signal_actions(signal.id, &self.user_id);

        let mut attempt = 0usize;
        loop {
            match self.messenger.send(&chat_id, &text, &actions).await {
                Ok(message_id) => {
                    info!(
                        user_id = %self.user_id,
                        signal_id = %signal.id,
                        message_id,
                        "notification delivered"
                    );
                    self.health.inc_notifications_sent();
                    return;
                }
                Err(e) if e.kind == SendErrorKind::Transient => {
                    if attempt >= MESSENGER_BACKOFF_MS.len() {
                        warn!(user_id = %self.user_id, "messenger retries exhausted: {e}");
                        self.health.inc_notifications_dropped();
                        return;
                    }
                    let backoff_ms = MESSENGER_BACKOFF_MS[attempt];
                    debug!(user_id = %self.user_id, attempt, backoff_ms, "messenger transient failure: {e}");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(user_id = %self.user_id, "recipient unreachable, deactivating: {e}");
                    if let Err(e) = self.registry.set_policy_active(&self.user_id, false).await {
                        error!(user_id = %self.user_id, "failed to deactivate policy: {e}");
                    }
                    self.health.inc_notifications_dropped();
                    return;
                }
            }
        }
    }
}

/// Translates messenger action callbacks into decision rows.
pub struct CallbackListener {
    messenger: Arc<dyn Messenger>,
    store: SignalStore,
    shutdown: watch::Receiver<bool>,
}

impl CallbackListener {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        store: SignalStore,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            messenger,
            store,
            shutdown,
        }
    }

    pub async fn run(self) {
        info!("callback listener started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            match self.messenger.poll_callbacks().await {
                Ok(events) => {
                    for event in events {
                        match self
                            .store
                            .record_decision(
                                event.signal_id,
                                &event.user_id,
                                event.action,
                                &DecisionExtras::default(),
                            )
                            .await
                        {
                            Ok(decision) => info!(
                                user_id = %event.user_id,
                                signal_id = %event.signal_id,
                                kind = %decision.kind,
                                "decision recorded"
                            ),
                            Err(e) => warn!(
                                user_id = %event.user_id,
                                signal_id = %event.signal_id,
                                "decision record failed: {e}"
                            ),
                        }
                    }
                }
                Err(e) => {
                    warn!("callback poll failed: {e}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
        info!("callback listener drained");
    }
}
