//! Circuit breaker for external services (vector store).

use anyhow::anyhow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_threshold: u32,
    timeout: Duration,
    state: Arc<RwLock<CircuitState>>,
    failure_count: Arc<AtomicU32>,
    success_count: Arc<RwLock<u32>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_threshold: recovery_threshold.max(1),
            timeout,
            state: Arc::new(RwLock::new(CircuitState::Closed)),
            failure_count: Arc::new(AtomicU32::new(0)),
            success_count: Arc::new(RwLock::new(0)),
        }
    }

    /// Breaker tuned for the vector store: 5 consecutive failures open it
    /// for 30s, 2 successes close it again.
    pub fn for_store() -> Self {
        Self::new(5, 2, Duration::from_secs(30))
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    /// Execute an async operation through the circuit breaker
    pub async fn call<F, T, E, Fut>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: From<anyhow::Error>,
    {
        let state = *self.state.read().await;
        if let CircuitState::Open { opened_at } = state {
            if opened_at.elapsed() >= self.timeout {
                *self.state.write().await = CircuitState::HalfOpen;
                *self.success_count.write().await = 0;
                tracing::info!("Circuit breaker transitioning to half-open");
            } else {
                return Err(E::from(anyhow!("Circuit breaker open")));
            }
        }

        match f().await {
            Ok(val) => {
                self.record_success().await;
                Ok(val)
            }
            Err(err) => {
                self.record_failure().await;
                Err(err)
            }
        }
    }

    async fn record_success(&self) {
        let mut state = self.state.write().await;
        match *state {
            CircuitState::HalfOpen => {
                let mut success = self.success_count.write().await;
                *success += 1;
                if *success >= self.recovery_threshold {
                    *state = CircuitState::Closed;
                    self.failure_count.store(0, Ordering::Relaxed);
                    tracing::info!("Circuit breaker recovered (closed)");
                }
            }
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    async fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.write().await;
        match *state {
            // A failed probe reopens immediately
            CircuitState::HalfOpen => {
                *state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                tracing::warn!("Circuit breaker probe failed (open)");
            }
            CircuitState::Closed if failures >= self.failure_threshold => {
                *state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                tracing::warn!("Circuit breaker tripped after {} failures (open)", failures);
            }
            _ => {}
        }
    }
}
