//! Circuit breaker whose state lives in the shared store.
//!
//! ```text
//! Closed   --failures >= threshold-->  Open      (opened_at = now)
//! Open     --timeout elapsed------->   HalfOpen  (on next access, one trial)
//! HalfOpen --trial succeeds-------->   Closed    (failures reset)
//! HalfOpen --trial fails----------->   Open      (opened_at = now)
//! ```
//!
//! Two keys per breaker:
//! - `{prefix}:state`: JSON [`StateRecord`], only ever replaced by
//!   compare-and-swap against the exact value that was read
//! - `{prefix}:failures`: consecutive-failure counter, `INCR`-style
//!
//! Every record carries an `epoch` bumped on each transition, so two
//! processes racing on the same transition cannot both win the swap.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use imagegate_core::{Clock, SystemClock};

use crate::shared_store::{SharedCacheStore, StoreError};

/// Bounded retries when a swap loses a race; the loser re-reads and
/// re-evaluates instead of spinning.
const MAX_CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast without touching the network.
    Open,
    /// One trial call is in flight to probe recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub threshold: u32,
    /// How long the circuit stays open before a trial is allowed.
    pub timeout: Duration,
    /// Shared-store key prefix; all instances guarding the same dependency
    /// must use the same prefix.
    pub key_prefix: String,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            timeout: Duration::from_secs(30),
            key_prefix: "auth:circuit_breaker".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StateRecord {
    state: CircuitState,
    opened_at: Option<DateTime<Utc>>,
    /// When the current half-open trial was handed out.
    trial_started_at: Option<DateTime<Utc>>,
    epoch: u64,
}

impl StateRecord {
    fn closed(epoch: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            trial_started_at: None,
            epoch,
        }
    }

    fn open(now: DateTime<Utc>, epoch: u64) -> Self {
        Self {
            state: CircuitState::Open,
            opened_at: Some(now),
            trial_started_at: None,
            epoch,
        }
    }
}

/// Permission to make one guarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPermit {
    /// Circuit closed.
    Normal,
    /// The single probe call of a half-open window.
    Trial,
}

/// Point-in-time view for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u64,
    pub opened_at: Option<DateTime<Utc>>,
    pub threshold: u32,
    pub timeout_secs: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    store: Arc<dyn SharedCacheStore>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    state_key: String,
    failures_key: String,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, store: Arc<dyn SharedCacheStore>, config: BreakerConfig) -> Self {
        let name = name.into();
        let state_key = format!("{}:state", config.key_prefix);
        let failures_key = format!("{}:failures", config.key_prefix);

        info!(
            component = %name,
            failure_threshold = config.threshold,
            timeout_seconds = config.timeout.as_secs(),
            "circuit breaker initialized"
        );

        Self {
            name,
            store,
            config,
            clock: Arc::new(SystemClock),
            state_key,
            failures_key,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Ask for permission to call the guarded dependency.
    ///
    /// Returns `None` while open (or while another caller holds the half-open
    /// trial). The `Open → HalfOpen` transition happens here, lazily, and only
    /// the caller whose swap succeeds receives [`CallPermit::Trial`].
    ///
    /// If the store itself is unreachable the breaker degrades to closed.
    pub async fn try_acquire(&self) -> Option<CallPermit> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (raw, record) = match self.load().await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(component = %self.name, error = %e, "breaker state unreadable; treating as closed");
                    return Some(CallPermit::Normal);
                }
            };

            let now = self.clock.now();
            let trial_due = match record.state {
                CircuitState::Closed => return Some(CallPermit::Normal),
                CircuitState::Open => self.elapsed(record.opened_at, now),
                // A trial holder that never reported back must not wedge the
                // breaker half-open forever.
                CircuitState::HalfOpen => self.elapsed(record.trial_started_at, now),
            };
            if !trial_due {
                return None;
            }

            let next = StateRecord {
                state: CircuitState::HalfOpen,
                opened_at: record.opened_at,
                trial_started_at: Some(now),
                epoch: record.epoch + 1,
            };
            match self.swap(raw.as_deref(), &next).await {
                Ok(true) => {
                    info!(component = %self.name, previous = record.state.as_str(), "circuit breaker half-open (testing recovery)");
                    return Some(CallPermit::Trial);
                }
                Ok(false) => continue,
                Err(e) => {
                    warn!(component = %self.name, error = %e, "could not move breaker to half-open");
                    return None;
                }
            }
        }

        None
    }

    /// Current state without side effects (an expired open window still
    /// reports `Open` until someone asks for a permit).
    pub async fn state(&self) -> CircuitState {
        match self.load().await {
            Ok((_, record)) => record.state,
            Err(_) => CircuitState::Closed,
        }
    }

    /// Record a successful guarded call.
    pub async fn record_success(&self) {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (raw, record) = match self.load().await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(component = %self.name, error = %e, "could not record breaker success");
                    return;
                }
            };

            match record.state {
                CircuitState::Closed => {
                    self.reset_failures().await;
                    return;
                }
                CircuitState::HalfOpen => match self.swap(raw.as_deref(), &StateRecord::closed(record.epoch + 1)).await {
                    Ok(true) => {
                        self.reset_failures().await;
                        info!(component = %self.name, "circuit breaker closed (recovered)");
                        return;
                    }
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(component = %self.name, error = %e, "could not close breaker");
                        return;
                    }
                },
                CircuitState::Open => {
                    // A call admitted before the circuit opened; the open
                    // window still stands.
                    debug!(component = %self.name, "success recorded while circuit is open");
                    return;
                }
            }
        }
    }

    /// Record a failed guarded call.
    pub async fn record_failure(&self) {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (raw, record) = match self.load().await {
                Ok(loaded) => loaded,
                Err(e) => {
                    warn!(component = %self.name, error = %e, "could not record breaker failure");
                    return;
                }
            };

            match record.state {
                CircuitState::Closed => {
                    let failures = match self.store.atomic_increment(&self.failures_key).await {
                        Ok(n) => n,
                        Err(e) => {
                            warn!(component = %self.name, error = %e, "could not count breaker failure");
                            return;
                        }
                    };
                    if failures < i64::from(self.config.threshold) {
                        debug!(component = %self.name, failures, "breaker failure counted");
                        return;
                    }

                    let next = StateRecord::open(self.clock.now(), record.epoch + 1);
                    match self.swap(raw.as_deref(), &next).await {
                        Ok(true) => warn!(
                            component = %self.name,
                            failures,
                            threshold = self.config.threshold,
                            timeout_seconds = self.config.timeout.as_secs(),
                            "circuit breaker opened (failing fast)"
                        ),
                        // Another instance already moved the breaker on.
                        Ok(false) => {}
                        Err(e) => warn!(component = %self.name, error = %e, "could not open breaker"),
                    }
                    return;
                }
                CircuitState::HalfOpen => {
                    let next = StateRecord::open(self.clock.now(), record.epoch + 1);
                    match self.swap(raw.as_deref(), &next).await {
                        Ok(true) => {
                            warn!(component = %self.name, "circuit breaker re-opened (trial failed)");
                            return;
                        }
                        Ok(false) => continue,
                        Err(e) => {
                            warn!(component = %self.name, error = %e, "could not re-open breaker");
                            return;
                        }
                    }
                }
                CircuitState::Open => return,
            }
        }
    }

    /// Operator override: open now.
    pub async fn force_open(&self) -> Result<(), StoreError> {
        warn!(component = %self.name, "circuit breaker forced open");
        self.force(|epoch, now| StateRecord::open(now, epoch)).await
    }

    /// Operator override: close now and clear the failure count.
    pub async fn force_closed(&self) -> Result<(), StoreError> {
        warn!(component = %self.name, "circuit breaker forced closed");
        self.force(|epoch, _| StateRecord::closed(epoch)).await?;
        self.reset_failures().await;
        Ok(())
    }

    pub async fn status(&self) -> Result<CircuitSnapshot, StoreError> {
        let (_, record) = self.load().await?;
        let failure_count = match self.store.get(&self.failures_key).await? {
            Some(raw) => raw.parse::<u64>().map_err(|e| StoreError::Corrupt(e.to_string()))?,
            None => 0,
        };

        Ok(CircuitSnapshot {
            state: record.state,
            failure_count,
            opened_at: record.opened_at,
            threshold: self.config.threshold,
            timeout_secs: self.config.timeout.as_secs(),
        })
    }

    async fn force<F>(&self, next: F) -> Result<(), StoreError>
    where
        F: Fn(u64, DateTime<Utc>) -> StateRecord,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (raw, record) = self.load().await?;
            if self.swap(raw.as_deref(), &next(record.epoch + 1, self.clock.now())).await? {
                return Ok(());
            }
        }
        Err(StoreError::Unavailable(format!("{}: breaker state kept changing", self.name)))
    }

    fn elapsed(&self, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(since) = since else {
            // No timestamp recorded; allow a probe rather than stay stuck.
            return true;
        };
        (now - since).to_std().is_ok_and(|elapsed| elapsed >= self.config.timeout)
    }

    async fn load(&self) -> Result<(Option<String>, StateRecord), StoreError> {
        let raw = self.store.get(&self.state_key).await?;
        let record = match raw.as_deref() {
            Some(s) => serde_json::from_str(s).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            None => StateRecord::closed(0),
        };
        Ok((raw, record))
    }

    async fn swap(&self, expected: Option<&str>, next: &StateRecord) -> Result<bool, StoreError> {
        let encoded = serde_json::to_string(next).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.store
            .compare_and_swap(&self.state_key, expected, &encoded, None)
            .await
    }

    async fn reset_failures(&self) {
        if let Err(e) = self.store.delete(&self.failures_key).await {
            warn!(component = %self.name, error = %e, "could not reset breaker failure count");
        }
    }
}
