//! External policy source integration with a fail-secure posture.
//!
//! Whatever supplies live policy and attribute updates sits behind
//! [`PolicySource`]. The refresher fetches on an interval; a successful
//! fetch compiles and atomically swaps the engine's snapshot (clearing the
//! decision cache), while any failure — transport, timeout, malformed
//! payload, rejected compile — retains the last-known-good set. Repeated
//! failures open a circuit breaker that pauses fetch attempts for a
//! cooldown while decisions keep being served from the retained set.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::DecisionCache;
use crate::engine::DecisionEngine;
use crate::errors::SourceError;
use crate::metrics::EngineMetricsHelper;
use crate::model::{PolicyBundle, SubjectAttributes};
use crate::policy;

/// Provider of policy (and optionally subject attribute) updates.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn fetch(&self) -> Result<PolicyBundle, SourceError>;
}

/// Re-reads a policy bundle from disk. The production deployment points
/// this at a file kept current by external tooling; tests point it at a
/// tempfile.
pub struct FilePolicySource {
    path: PathBuf,
}

impl FilePolicySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PolicySource for FilePolicySource {
    async fn fetch(&self) -> Result<PolicyBundle, SourceError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SourceError::Unavailable {
                reason: format!("{}: {e}", self.path.display()),
            })?;
        serde_json::from_str(&raw).map_err(|e| SourceError::MalformedPayload {
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit suppresses fetch attempts.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker over the policy source.
pub struct CircuitBreaker {
    state: RwLock<BreakerState>,
    consecutive_failures: RwLock<u32>,
    opened_at: RwLock<Option<Instant>>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: RwLock::new(BreakerState::Closed),
            consecutive_failures: RwLock::new(0),
            opened_at: RwLock::new(None),
            config,
        }
    }

    /// Whether a fetch attempt is allowed right now. An open circuit
    /// transitions to half-open (one probe) after the cooldown elapses.
    pub async fn can_proceed(&self) -> bool {
        let state = *self.state.read().await;
        match state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let opened_at = *self.opened_at.read().await;
                match opened_at {
                    Some(at) if at.elapsed() >= self.config.cooldown => {
                        *self.state.write().await = BreakerState::HalfOpen;
                        EngineMetricsHelper::record_breaker_transition("half_open");
                        info!("policy source circuit half-open, probing");
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let was = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, BreakerState::Closed)
        };
        *self.consecutive_failures.write().await = 0;
        *self.opened_at.write().await = None;
        if was != BreakerState::Closed {
            info!("policy source circuit closed");
            EngineMetricsHelper::record_breaker_transition("closed");
        }
    }

    pub async fn record_failure(&self) {
        let failures = {
            let mut failures = self.consecutive_failures.write().await;
            *failures += 1;
            *failures
        };

        let opened = {
            let mut state = self.state.write().await;
            let should_open = match *state {
                // A failed half-open probe re-opens immediately.
                BreakerState::HalfOpen => true,
                BreakerState::Closed => failures >= self.config.failure_threshold,
                BreakerState::Open => false,
            };
            if should_open {
                *state = BreakerState::Open;
            }
            should_open
        };

        if opened {
            *self.opened_at.write().await = Some(Instant::now());
            EngineMetricsHelper::record_breaker_transition("open");
            warn!(
                consecutive_failures = failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "policy source circuit opened; serving last-known-good policies"
            );
        }
    }

    pub async fn state(&self) -> BreakerState {
        *self.state.read().await
    }
}

/// Swappable view of the subject attribute directory, refreshed alongside
/// policies when the source includes one.
pub struct SubjectDirectory {
    inner: std::sync::RwLock<Arc<SubjectAttributes>>,
}

impl SubjectDirectory {
    pub fn new(subjects: SubjectAttributes) -> Self {
        Self {
            inner: std::sync::RwLock::new(Arc::new(subjects)),
        }
    }

    pub fn snapshot(&self) -> Arc<SubjectAttributes> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn swap(&self, subjects: SubjectAttributes) {
        let subjects = Arc::new(subjects);
        match self.inner.write() {
            Ok(mut guard) => *guard = subjects,
            Err(poisoned) => *poisoned.into_inner() = subjects,
        }
    }
}

/// Periodic fail-secure refresh of the engine from a policy source.
pub struct PolicyRefresher {
    engine: Arc<DecisionEngine>,
    cache: Arc<DecisionCache>,
    directory: Arc<SubjectDirectory>,
    source: Arc<dyn PolicySource>,
    breaker: CircuitBreaker,
}

impl PolicyRefresher {
    pub fn new(
        engine: Arc<DecisionEngine>,
        cache: Arc<DecisionCache>,
        directory: Arc<SubjectDirectory>,
        source: Arc<dyn PolicySource>,
        breaker_config: BreakerConfig,
    ) -> Self {
        Self {
            engine,
            cache,
            directory,
            source,
            breaker: CircuitBreaker::new(breaker_config),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// One fetch-validate-swap cycle. Returns whether a new set was
    /// installed. Every failure path leaves the last-known-good set (and
    /// the cache entries computed under it) serving.
    pub async fn refresh_once(&self) -> bool {
        if !self.breaker.can_proceed().await {
            debug!("policy refresh skipped: circuit open");
            return false;
        }

        let bundle = match self.source.fetch().await {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(error = %e, "policy fetch failed; retaining last-known-good set");
                EngineMetricsHelper::record_reload("failure", "refresh");
                self.breaker.record_failure().await;
                return false;
            }
        };

        let set = match policy::compile(&bundle.document) {
            Ok(set) => set,
            Err(e) => {
                warn!(error = %e, "fetched policy document rejected; retaining last-known-good set");
                EngineMetricsHelper::record_reload("failure", "refresh");
                self.breaker.record_failure().await;
                return false;
            }
        };

        let count = set.len();
        self.engine.reload(set);
        self.cache.clear().await;
        if let Some(subjects) = bundle.subjects {
            self.directory.swap(subjects);
        }
        self.breaker.record_success().await;
        EngineMetricsHelper::record_reload("success", "refresh");
        EngineMetricsHelper::set_active_policies(count);

        info!(policies = count, "policy set refreshed");
        true
    }

    /// Refresh loop; spawn as a background task.
    pub async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; startup already loaded a set.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.refresh_once().await;
        }
    }
}
