use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::{RetryDecision, RetryPolicy};
use crate::channels::Channels;
use crate::config::DispatcherConfig;
use crate::error::{DispatchError, HandleError, StoreError};
use crate::lock::LockCoordinator;
use crate::rate_limit::{FixedWindowLimiter, RateLimiter};
use crate::storage::{OutboxStore, Transition};
use crate::telemetry;
use crate::types::{kind_of, OutboxEvent};
use crate::worker::{NotificationHandler, Resolution, THROTTLED_MARKER};

/// Why a tick did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A previous tick of this process is still in flight.
    AlreadyRunning,
    /// Another dispatcher holds the cluster-wide lock.
    LockUnavailable,
}

/// Counts collected during one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Stale `SENDING` rows returned to `PENDING`.
    pub recovered: u64,
    pub fetched: usize,
    pub claimed: usize,
    /// Rows another poller claimed first.
    pub lost_claims: usize,
    pub sent: usize,
    /// Acknowledged without contacting providers (dry-run, test-env).
    pub dry: usize,
    pub throttled: usize,
    pub retried: usize,
    pub dead: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Completed(TickReport),
    Skipped(SkipReason),
}

/// Liveness snapshot of a dispatcher.
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub started_at: Option<DateTime<Utc>>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_report: Option<TickReport>,
}

/// Polls the outbox, claims due notification events and drives each one to
/// its next state.
///
/// Safe to run in several processes at once: ticks are serialized by the
/// [`LockCoordinator`], and rows by the store's conditional claim.
pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    lock: Arc<dyn LockCoordinator>,
    handler: NotificationHandler,
    retry: RetryPolicy,
    config: DispatcherConfig,
    ticking: AtomicBool,
    status: RwLock<WorkerStatus>,
}

/// Clears the in-flight flag even if the tick future is dropped midway.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Dispatcher {
    /// Build a dispatcher with a process-local rate limiter seeded from
    /// `config.rate_limits`.
    pub fn new(
        config: DispatcherConfig,
        store: Arc<dyn OutboxStore>,
        lock: Arc<dyn LockCoordinator>,
        channels: Channels,
    ) -> Self {
        let limiter: Arc<dyn RateLimiter> = Arc::new(FixedWindowLimiter::new(config.rate_limits.clone()));
        Self {
            store,
            lock,
            handler: NotificationHandler::new(channels, limiter, config.runtime),
            retry: RetryPolicy::from_config(&config),
            config,
            ticking: AtomicBool::new(false),
            status: RwLock::new(WorkerStatus::default()),
        }
    }

    /// Replace the rate limiter, e.g. with a shared one.
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.handler.set_rate_limiter(limiter);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Whether a tick is currently in flight in this process.
    pub fn is_ticking(&self) -> bool {
        self.ticking.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> WorkerStatus {
        self.status.read().await.clone()
    }

    /// Run one dispatch cycle.
    ///
    /// The lock is released before returning, whether the batch succeeded or not.
    pub async fn tick(&self) -> Result<TickOutcome, DispatchError> {
        self.tick_until(&CancellationToken::new()).await
    }

    /// A tick that abandons its batch once `abort` fires. The lock is still
    /// released; rows claimed by the abandoned batch stay `SENDING` until
    /// stale recovery picks them up.
    #[instrument(skip(self, abort), fields(worker = %self.config.worker_name))]
    async fn tick_until(&self, abort: &CancellationToken) -> Result<TickOutcome, DispatchError> {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Previous tick still running, skipping");
            return Ok(TickOutcome::Skipped(SkipReason::AlreadyRunning));
        }
        let _guard = TickGuard(&self.ticking);

        let Some(token) = self.lock.try_acquire(&self.config.worker_name).await? else {
            debug!("Dispatcher lock held elsewhere, skipping tick");
            return Ok(TickOutcome::Skipped(SkipReason::LockUnavailable));
        };

        let result = tokio::select! {
            biased;
            _ = abort.cancelled() => Err(DispatchError::Interrupted),
            batch = self.run_batch() => batch.map_err(DispatchError::from),
        };

        if let Err(err) = self.lock.release(token).await {
            warn!(error = %err, "Failed to release dispatcher lock");
        }

        let report = result?;
        self.status.write().await.last_report = Some(report.clone());
        Ok(TickOutcome::Completed(report))
    }

    async fn run_batch(&self) -> Result<TickReport, StoreError> {
        let mut report = TickReport::default();
        let now = Utc::now();
        self.mark_tick(now).await;

        let namespace = self.config.namespace.as_str();
        if let Some(stale_after) = self.config.sending_stale_after {
            if let Some(stale_before) = before(now, stale_after) {
                report.recovered = self.store.recover_stale(namespace, stale_before, now).await?;
                if report.recovered > 0 {
                    info!(recovered = report.recovered, "Returned stale sending notifications to pending");
                }
            }
        }

        let events = self
            .store
            .fetch_due(namespace, now, self.config.batch_size)
            .await?;
        report.fetched = events.len();

        for event in events {
            match self.store.claim(&event.id, Utc::now()).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(event_id = %event.id, "Event claimed by another poller");
                    telemetry::claim_lost();
                    report.lost_claims += 1;
                    continue;
                }
                Err(err) => {
                    warn!(event_id = %event.id, error = %err, "Claim failed, skipping event");
                    continue;
                }
            }
            report.claimed += 1;
            self.process(event, &mut report).await;
        }

        Ok(report)
    }

    async fn process(&self, event: OutboxEvent, report: &mut TickReport) {
        let kind = kind_of(&event.event_type);
        let outcome = self.handler.handle(&event).await;

        let now = Utc::now();
        let (transition, result) = match outcome {
            Ok(Resolution::Sent { marker, result }) => (
                Transition::Sent {
                    marker: marker.map(str::to_string),
                },
                result,
            ),
            Ok(Resolution::Throttled) => (
                Transition::Reschedule {
                    retries: event.retries,
                    next_retry_at: after(now, self.config.throttle_delay),
                    last_error: THROTTLED_MARKER.to_string(),
                },
                "throttled",
            ),
            Err(err) => return self.fail(&event, kind, err, report).await,
        };

        match self.store.resolve(&event.id, &transition, now).await {
            Ok(true) => {
                match result {
                    "dry" => report.dry += 1,
                    "throttled" => {
                        report.throttled += 1;
                        telemetry::throttled(&event.merchant_id);
                    }
                    _ => report.sent += 1,
                }
                telemetry::processed(kind, result);
                debug!(event_id = %event.id, kind, result, "Notification processed");
            }
            Ok(false) => {
                warn!(event_id = %event.id, result, "Event left SENDING before its outcome was recorded");
            }
            Err(err) => self.fail(&event, kind, HandleError::Store(err), report).await,
        }
    }

    async fn fail(&self, event: &OutboxEvent, kind: &'static str, err: HandleError, report: &mut TickReport) {
        let message = err.to_string();
        let now = Utc::now();
        let (transition, result) = match self.retry.decide(event.retries) {
            RetryDecision::Dead { retries } => (
                Transition::Dead {
                    retries,
                    last_error: message.clone(),
                },
                "dead",
            ),
            RetryDecision::Retry { retries, delay } => (
                Transition::Reschedule {
                    retries,
                    next_retry_at: after(now, delay),
                    last_error: message.clone(),
                },
                "retry",
            ),
        };

        match self.store.resolve(&event.id, &transition, now).await {
            Ok(true) if result == "dead" => {
                report.dead += 1;
                telemetry::processed(kind, result);
                error!(
                    event_id = %event.id,
                    merchant_id = %event.merchant_id,
                    retries = event.retries + 1,
                    error = %message,
                    "Notification dead-lettered"
                );
            }
            Ok(true) => {
                report.retried += 1;
                telemetry::processed(kind, result);
                warn!(
                    event_id = %event.id,
                    merchant_id = %event.merchant_id,
                    retries = event.retries + 1,
                    error = %message,
                    "Notification failed, retry scheduled"
                );
            }
            Ok(false) => {
                warn!(event_id = %event.id, "Event left SENDING before its failure was recorded");
            }
            Err(store_err) => {
                error!(
                    event_id = %event.id,
                    error = %store_err,
                    cause = %message,
                    "Could not record failure; event stays SENDING until stale recovery"
                );
            }
        }
    }

    async fn mark_tick(&self, now: DateTime<Utc>) {
        self.status.write().await.last_tick_at = Some(now);
        telemetry::last_tick(&self.config.worker_name, now.timestamp());
    }

    /// Start the periodic scheduler.
    ///
    /// Returns `None` without spawning anything when the dispatcher is disabled.
    pub fn spawn(self: Arc<Self>) -> Option<DispatcherHandle> {
        if !self.config.enabled {
            info!("Notification dispatcher disabled");
            return None;
        }

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let abort = CancellationToken::new();
        let interrupt = abort.clone();
        let interval = self.config.tick_interval;
        let shutdown_timeout = self.config.shutdown_timeout;
        let dispatcher = self;

        let join = tokio::spawn(async move {
            dispatcher.status.write().await.started_at = Some(Utc::now());
            info!(
                interval_ms = interval.as_millis() as u64,
                batch_size = dispatcher.config.batch_size,
                "Notification dispatcher started"
            );

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        match dispatcher.tick_until(&interrupt).await {
                            Ok(TickOutcome::Completed(report)) if report.claimed > 0 => {
                                debug!(?report, "Tick completed");
                            }
                            Ok(_) => {}
                            Err(DispatchError::Interrupted) => {
                                warn!("Tick interrupted by shutdown");
                                break;
                            }
                            Err(err) => error!(error = %err, "Notification dispatcher tick failed"),
                        }
                    }
                }
            }

            info!("Notification dispatcher stopped");
        });

        Some(DispatcherHandle {
            cancel,
            abort,
            join,
            shutdown_timeout,
        })
    }
}

/// Handle to a running scheduler.
///
/// Dropping the handle leaves the scheduler running; call
/// [`shutdown`](Self::shutdown) to stop it.
pub struct DispatcherHandle {
    cancel: CancellationToken,
    abort: CancellationToken,
    join: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl DispatcherHandle {
    /// Stop scheduling ticks and wait up to the configured timeout for the
    /// in-flight tick. Returns `false` if the tick had to be interrupted.
    pub async fn shutdown(self) -> bool {
        let timeout = self.shutdown_timeout;
        self.shutdown_within(timeout).await
    }

    pub async fn shutdown_within(mut self, deadline: Duration) -> bool {
        self.cancel.cancel();
        if tokio::time::timeout(deadline, &mut self.join).await.is_ok() {
            return true;
        }

        warn!(deadline_ms = deadline.as_millis() as u64, "In-flight tick exceeded shutdown deadline, interrupting");
        self.abort.cancel();
        // The interrupted tick still has to release its lock; that gets the
        // same deadline before the task is torn down.
        if tokio::time::timeout(deadline, &mut self.join).await.is_err() {
            warn!("Lock release did not finish in time, aborting scheduler task");
            self.join.abort();
        }
        false
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn before(now: DateTime<Utc>, age: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
}
