//! Core token-bucket rate limiter.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client_key::ClientKey;
use super::clock::{Clock, SystemClock};
use super::events::{LimiterAction, LimiterEvent, LimiterObserver, TracingObserver};
use super::tasks::spawn_periodic;
use crate::error::{LimiterError, Result};

/// Upper bound on the number of map slots reserved up front.
const MAX_PREALLOCATED_BUCKETS: usize = 1 << 16;

/// Validated limiter parameters, fixed for the lifetime of a limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    bucket_capacity: u64,
    per_entry_max_token: u32,
    cleanup_interval: Duration,
    fill_up_rate: Duration,
    shut_down_duration: Duration,
}

impl LimiterConfig {
    /// Validate and build a configuration.
    ///
    /// Both bounds must be positive and every duration non-zero.
    pub fn new(
        bucket_capacity: u64,
        per_entry_max_token: u32,
        cleanup_interval: Duration,
        fill_up_rate: Duration,
        shut_down_duration: Duration,
    ) -> Result<Self> {
        if bucket_capacity == 0 {
            return Err(invalid("bucket_capacity must be positive"));
        }
        if per_entry_max_token == 0 {
            return Err(invalid("per_entry_max_token must be positive"));
        }
        if cleanup_interval.is_zero() {
            return Err(invalid("cleanup_interval must be set"));
        }
        if fill_up_rate.is_zero() {
            return Err(invalid("fill_up_rate must be set"));
        }
        if shut_down_duration.is_zero() {
            return Err(invalid("shut_down_duration must be set"));
        }

        Ok(Self {
            bucket_capacity,
            per_entry_max_token,
            cleanup_interval,
            fill_up_rate,
            shut_down_duration,
        })
    }

    pub fn bucket_capacity(&self) -> u64 {
        self.bucket_capacity
    }

    pub fn per_entry_max_token(&self) -> u32 {
        self.per_entry_max_token
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    pub fn fill_up_rate(&self) -> Duration {
        self.fill_up_rate
    }

    pub fn shut_down_duration(&self) -> Duration {
        self.shut_down_duration
    }
}

fn invalid(msg: &str) -> LimiterError {
    LimiterError::InvalidConfiguration(msg.to_string())
}

/// Why `add` refused a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The key has an empty identifier
    InvalidKey,
    /// The client already holds the maximum number of tokens
    BucketFull,
}

/// Outcome of [`RateLimiter::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A token was granted; carries the client's new token count
    Granted(u32),
    /// Nothing changed
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted(_))
    }
}

/// Outcome of [`RateLimiter::use_token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenUse {
    /// A token was spent
    Spent { remaining: u32 },
    /// The client had no token left; nothing was spent
    Exhausted,
    /// The key has an empty identifier; nothing happened
    Ignored,
}

/// Lifecycle of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterState {
    Constructed,
    Scheduled,
    Stopped,
}

enum Lifecycle {
    Constructed,
    Scheduled {
        cancel: watch::Sender<bool>,
        tasks: Vec<JoinHandle<()>>,
    },
    Stopped {
        tasks: Vec<JoinHandle<()>>,
    },
}

/// A per-client token-bucket rate limiter.
///
/// Each valid client key maps to a token count between zero and
/// `per_entry_max_token`. `add` grants a token, `use_token` spends one,
/// `refill` tops up clients that have been quiet for at least
/// `fill_up_rate`, and `cleanup` forgets clients idle for at least
/// `cleanup_interval`.
///
/// The limiter is cheap to clone; clones share state. Token counts are
/// updated with compare-and-swap loops on a sharded map, so concurrent
/// callers never lose updates and never contend on a global lock.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

struct Inner {
    config: LimiterConfig,
    buckets: DashMap<ClientKey, AtomicU32>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn LimiterObserver>,
    runtime: Option<Handle>,
    stopped: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    idle: Notify,
}

/// Builder for [`RateLimiter`] with injectable collaborators.
pub struct RateLimiterBuilder {
    config: LimiterConfig,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn LimiterObserver>,
    runtime: Option<Handle>,
}

impl RateLimiterBuilder {
    /// Use `clock` as the time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Send events to `observer`.
    pub fn observer(mut self, observer: Arc<dyn LimiterObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Run background tasks on `handle` instead of the ambient runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> RateLimiter {
        let capacity = usize::try_from(self.config.bucket_capacity)
            .unwrap_or(usize::MAX)
            .min(MAX_PREALLOCATED_BUCKETS);

        RateLimiter {
            inner: Arc::new(Inner {
                config: self.config,
                buckets: DashMap::with_capacity(capacity),
                clock: self.clock,
                observer: self.observer,
                runtime: self.runtime,
                stopped: AtomicBool::new(false),
                lifecycle: Mutex::new(Lifecycle::Constructed),
                idle: Notify::new(),
            }),
        }
    }
}

impl RateLimiter {
    /// Create a limiter with the system clock and tracing-backed events.
    pub fn new(config: LimiterConfig) -> Self {
        Self::builder(config).build()
    }

    /// Validate the parameters and create a limiter.
    pub fn try_new(
        bucket_capacity: u64,
        per_entry_max_token: u32,
        cleanup_interval: Duration,
        fill_up_rate: Duration,
        shut_down_duration: Duration,
    ) -> Result<Self> {
        let config = LimiterConfig::new(
            bucket_capacity,
            per_entry_max_token,
            cleanup_interval,
            fill_up_rate,
            shut_down_duration,
        )?;
        Ok(Self::new(config))
    }

    pub fn builder(config: LimiterConfig) -> RateLimiterBuilder {
        RateLimiterBuilder {
            config,
            clock: Arc::new(SystemClock),
            observer: Arc::new(TracingObserver),
            runtime: None,
        }
    }

    /// Register activity for `key` and grant it a token.
    ///
    /// A new client starts with one token. A known client below the maximum
    /// gains one. Both cases stamp the client's last activity. A client at
    /// the maximum, or an invalid key, is rejected without any change.
    pub fn add(&self, key: &ClientKey) -> Result<Admission> {
        self.inner.add(key)
    }

    /// Spend one of `key`'s tokens.
    ///
    /// Only a spent token counts as activity. Finding the bucket empty
    /// changes nothing, so a retrying client still gets refilled.
    ///
    /// Fails with [`LimiterError::UnknownClient`] if the client is not
    /// tracked; it is never inserted as a side effect.
    pub fn use_token(&self, key: &ClientKey) -> Result<TokenUse> {
        self.inner.use_token(key)
    }

    /// Grant one token to every client idle for at least `fill_up_rate`.
    ///
    /// Returns the number of clients refilled.
    pub fn refill(&self) -> Result<usize> {
        self.inner.refill()
    }

    /// Forget every client idle for at least `cleanup_interval`.
    ///
    /// Returns the number of clients evicted.
    pub fn cleanup(&self) -> Result<usize> {
        self.inner.cleanup()
    }

    /// Signal idleness if no clients are tracked. Returns whether it did.
    ///
    /// Only a signal: the limiter keeps running. Owners that want to stop
    /// when idle wait on [`RateLimiter::idle`] and call
    /// [`RateLimiter::stop`] themselves.
    pub fn check_idle(&self) -> bool {
        self.inner.check_idle()
    }

    /// Wait until the next idle check that finds the limiter empty.
    pub async fn idle(&self) {
        self.inner.idle.notified().await;
    }

    /// Start the refill, cleanup and idle-check tasks.
    ///
    /// Tasks run on the runtime given to the builder, or else on the runtime
    /// of the calling thread.
    pub fn schedule(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Constructed => {}
            Lifecycle::Scheduled { .. } => return Err(LimiterError::AlreadyScheduled),
            Lifecycle::Stopped { .. } => return Err(LimiterError::LimiterStopped),
        }

        let handle = match &self.inner.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|_| LimiterError::NoRuntime)?,
        };

        let config = &self.inner.config;
        let (cancel, cancelled) = watch::channel(false);
        let target = Arc::downgrade(&self.inner);

        let tasks = vec![
            spawn_periodic(
                &handle,
                "refill",
                config.fill_up_rate,
                target.clone(),
                cancelled.clone(),
                |inner: &Inner| inner.refill().map(drop),
            ),
            spawn_periodic(
                &handle,
                "cleanup",
                config.cleanup_interval,
                target.clone(),
                cancelled.clone(),
                |inner: &Inner| inner.cleanup().map(drop),
            ),
            spawn_periodic(
                &handle,
                "idle-check",
                config.shut_down_duration,
                target,
                cancelled,
                |inner: &Inner| {
                    inner.check_idle();
                    Ok(())
                },
            ),
        ];

        *lifecycle = Lifecycle::Scheduled { cancel, tasks };

        info!(
            fill_up_rate_ms = config.fill_up_rate.as_millis() as u64,
            cleanup_interval_ms = config.cleanup_interval.as_millis() as u64,
            shut_down_duration_ms = config.shut_down_duration.as_millis() as u64,
            "Rate limiter background tasks scheduled"
        );
        Ok(())
    }

    /// Stop the limiter.
    ///
    /// Cancels the background tasks and rejects all further mutations with
    /// [`LimiterError::LimiterStopped`]. Runs already in progress finish.
    /// Calling it again has no effect.
    pub fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        self.inner.stopped.store(true, Ordering::Release);

        match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped { tasks: Vec::new() }) {
            Lifecycle::Constructed => {
                info!("Rate limiter stopped before scheduling");
            }
            Lifecycle::Scheduled { cancel, tasks } => {
                let _ = cancel.send(true);
                *lifecycle = Lifecycle::Stopped { tasks };
                info!(tracked = self.inner.buckets.len(), "Rate limiter stopped");
            }
            previous @ Lifecycle::Stopped { .. } => {
                *lifecycle = previous;
            }
        }
    }

    /// Wait for the background tasks to finish after [`RateLimiter::stop`].
    ///
    /// Returns immediately if the limiter is not stopped or the tasks were
    /// already awaited.
    pub async fn wait_stopped(&self) {
        let tasks = match &mut *self.inner.lifecycle.lock() {
            Lifecycle::Stopped { tasks } => std::mem::take(tasks),
            _ => return,
        };

        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task did not finish cleanly");
            }
        }
    }

    pub fn state(&self) -> LimiterState {
        match *self.inner.lifecycle.lock() {
            Lifecycle::Constructed => LimiterState::Constructed,
            Lifecycle::Scheduled { .. } => LimiterState::Scheduled,
            Lifecycle::Stopped { .. } => LimiterState::Stopped,
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.inner.config
    }

    /// Current token count for a client, if tracked.
    pub fn tokens(&self, identifier: &str) -> Option<u32> {
        self.inner
            .buckets
            .get(identifier)
            .map(|entry| entry.value().load(Ordering::Acquire))
    }

    /// Last recorded activity for a client, if tracked.
    pub fn last_activity(&self, identifier: &str) -> Option<Instant> {
        self.inner
            .buckets
            .get(identifier)
            .map(|entry| entry.key().last_activity())
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.inner.buckets.contains_key(identifier)
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.inner.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.buckets.is_empty()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.inner.config)
            .field("state", &self.state())
            .field("tracked", &self.len())
            .finish()
    }
}

impl Inner {
    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            Err(LimiterError::LimiterStopped)
        } else {
            Ok(())
        }
    }

    fn emit(&self, event: LimiterEvent) {
        self.observer.on_event(&event);
    }

    fn add(&self, key: &ClientKey) -> Result<Admission> {
        self.ensure_running()?;

        if !key.is_valid() {
            self.emit(LimiterEvent::for_key(key.identifier(), LimiterAction::Rejected, None));
            return Ok(Admission::Rejected(RejectReason::InvalidKey));
        }

        let now = self.clock.now();
        let max = self.config.per_entry_max_token;

        let granted = loop {
            if let Some(entry) = self.buckets.get(key) {
                break grant(entry.key(), entry.value(), max, now);
            }

            let stored = key.clone();
            stored.touch(now);
            if let Entry::Vacant(vacant) = self.buckets.entry(stored) {
                vacant.insert(AtomicU32::new(1));
                break Some(1);
            }
            // Lost the insert race; take the existing entry on the next pass.
        };

        match granted {
            Some(tokens) => {
                key.touch(now);
                self.emit(LimiterEvent::for_key(key.identifier(), LimiterAction::Granted, Some(tokens)));
                Ok(Admission::Granted(tokens))
            }
            None => {
                self.emit(LimiterEvent::for_key(key.identifier(), LimiterAction::Rejected, Some(max)));
                Ok(Admission::Rejected(RejectReason::BucketFull))
            }
        }
    }

    fn use_token(&self, key: &ClientKey) -> Result<TokenUse> {
        self.ensure_running()?;

        if !key.is_valid() {
            return Ok(TokenUse::Ignored);
        }

        let now = self.clock.now();
        let spent = {
            let entry = self.buckets.get(key).ok_or_else(|| {
                debug!(key = %key, "Token requested for untracked client");
                LimiterError::UnknownClient(key.identifier().to_string())
            })?;
            let spent = entry
                .value()
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| tokens.checked_sub(1));
            if spent.is_ok() {
                entry.key().touch(now);
            }
            spent
        };

        match spent {
            Ok(previous) => {
                key.touch(now);
                let remaining = previous - 1;
                self.emit(LimiterEvent::for_key(key.identifier(), LimiterAction::TokenUsed, Some(remaining)));
                Ok(TokenUse::Spent { remaining })
            }
            Err(_) => {
                self.emit(LimiterEvent::for_key(key.identifier(), LimiterAction::Exhausted, Some(0)));
                Ok(TokenUse::Exhausted)
            }
        }
    }

    fn refill(&self) -> Result<usize> {
        self.ensure_running()?;

        let now = self.clock.now();
        let max = self.config.per_entry_max_token;
        let rate = self.config.fill_up_rate;

        let mut refilled = Vec::new();
        for entry in self.buckets.iter() {
            if now.saturating_duration_since(entry.key().last_activity()) < rate {
                continue;
            }
            if let Ok(previous) = entry
                .value()
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                    (tokens < max).then(|| tokens + 1)
                })
            {
                refilled.push((entry.key().identifier().to_string(), previous + 1));
            }
        }

        for (key, tokens) in &refilled {
            self.emit(LimiterEvent::for_key(key, LimiterAction::Refilled, Some(*tokens)));
        }

        debug!(refilled = refilled.len(), tracked = self.buckets.len(), "Refill pass complete");
        Ok(refilled.len())
    }

    fn cleanup(&self) -> Result<usize> {
        self.ensure_running()?;

        let now = self.clock.now();
        let interval = self.config.cleanup_interval;

        let mut evicted = Vec::new();
        self.buckets.retain(|key, tokens| {
            let expired = now.saturating_duration_since(key.last_activity()) >= interval;
            if expired {
                evicted.push((key.identifier().to_string(), tokens.load(Ordering::Acquire)));
            }
            !expired
        });

        for (key, tokens) in &evicted {
            self.emit(LimiterEvent::for_key(key, LimiterAction::Evicted, Some(*tokens)));
        }

        debug!(evicted = evicted.len(), tracked = self.buckets.len(), "Cleanup pass complete");
        Ok(evicted.len())
    }

    fn check_idle(&self) -> bool {
        if !self.buckets.is_empty() {
            return false;
        }
        self.emit(LimiterEvent::idle());
        self.idle.notify_waiters();
        true
    }
}

/// Add one token to a stored bucket unless it is full, stamping the stored
/// key on success. Returns the new count.
fn grant(stored: &ClientKey, tokens: &AtomicU32, max: u32, now: Instant) -> Option<u32> {
    let previous = tokens
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current < max).then(|| current + 1)
        })
        .ok()?;
    stored.touch(now);
    Some(previous + 1)
}
