//! Admission scheduler — process-wide concurrency cap, duplicate-start
//! suppression, and per-provider cooldown windows.
//!
//! All state lives in one value owned by the orchestrator; nothing is
//! process-global. The semaphore bounds concurrent tasks, the in-flight set
//! dedupes concurrent starts of the same task, and the cooldown map holds
//! back providers that recently returned a quota signal.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::task::Provider;

/// Scheduler tunables.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Concurrent running tasks across the process.
    pub capacity: usize,
    /// How long a provider is held back after a provider-limit outcome.
    pub provider_cooldown: Duration,
    /// Delay before a deferred start retries.
    pub defer_backoff: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            provider_cooldown: Duration::from_secs(300),
            defer_backoff: Duration::from_secs(5),
        }
    }
}

/// Non-blocking admission outcome.
#[derive(Debug)]
pub enum AdmissionDecision {
    Admitted(AdmissionPermit),
    /// Capacity exhausted; caller should emit `start_deferred` and wait.
    Deferred { in_use: usize, capacity: usize },
    /// The same task is already starting or running.
    Deduped,
}

/// Routing answer for a provider under cooldown rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderRoute {
    Primary,
    /// Preferred provider is cooling; the configured fallback is clear.
    Fallback(Provider),
    /// Preferred cooling and no usable fallback; hold for this long.
    Hold { remaining: Duration },
}

#[derive(Debug)]
struct Inner {
    semaphore: Arc<Semaphore>,
    in_flight: Mutex<HashSet<String>>,
    cooldown_until: Mutex<HashMap<Provider, Instant>>,
    config: AdmissionConfig,
}

/// Held for the lifetime of a running task; releases capacity and the
/// dedup slot on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    task_id: String,
    inner: Arc<Inner>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut set = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.task_id);
        debug!(task_id = %self.task_id, "admission released");
    }
}

/// The scheduler itself. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct AdmissionScheduler {
    inner: Arc<Inner>,
}

impl AdmissionScheduler {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(config.capacity)),
                in_flight: Mutex::new(HashSet::new()),
                cooldown_until: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.inner.config
    }

    /// Try to admit without waiting.
    pub fn try_admit(&self, task_id: &str) -> AdmissionDecision {
        {
            let set = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if set.contains(task_id) {
                return AdmissionDecision::Deduped;
            }
        }
        match self.inner.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                let mut set = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                if !set.insert(task_id.to_string()) {
                    // Lost the race to another start of the same task.
                    return AdmissionDecision::Deduped;
                }
                AdmissionDecision::Admitted(AdmissionPermit {
                    _permit: permit,
                    task_id: task_id.to_string(),
                    inner: Arc::clone(&self.inner),
                })
            }
            Err(_) => {
                let capacity = self.inner.config.capacity;
                AdmissionDecision::Deferred {
                    in_use: capacity - self.inner.semaphore.available_permits(),
                    capacity,
                }
            }
        }
    }

    /// Wait for capacity after a deferral. Returns `None` when canceled or
    /// when another start of the same task won meanwhile.
    pub async fn admit_wait(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Option<AdmissionPermit> {
        {
            let mut set = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !set.insert(task_id.to_string()) {
                return None;
            }
        }

        let semaphore = Arc::clone(&self.inner.semaphore);
        let acquired = tokio::select! {
            _ = cancel.cancelled() => None,
            permit = semaphore.acquire_owned() => permit.ok(),
        };

        match acquired {
            Some(permit) => {
                info!(task_id, "admission granted after deferral");
                Some(AdmissionPermit {
                    _permit: permit,
                    task_id: task_id.to_string(),
                    inner: Arc::clone(&self.inner),
                })
            }
            None => {
                let mut set = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                set.remove(task_id);
                None
            }
        }
    }

    /// Record a provider-limit outcome, opening that provider's cooldown
    /// window.
    pub fn record_provider_limit(&self, provider: &Provider) {
        let until = Instant::now() + self.inner.config.provider_cooldown;
        let mut map = self.inner.cooldown_until.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(provider.clone(), until);
        info!(provider = %provider, cooldown_secs = self.inner.config.provider_cooldown.as_secs(), "provider cooldown opened");
    }

    /// Remaining cooldown for a provider, if any.
    pub fn cooldown_remaining(&self, provider: &Provider) -> Option<Duration> {
        let map = self.inner.cooldown_until.lock().unwrap_or_else(|e| e.into_inner());
        let until = map.get(provider)?;
        let now = Instant::now();
        if now < *until {
            Some(*until - now)
        } else {
            None
        }
    }

    /// Route work for a provider: primary when clear, the task's fallback
    /// when the primary is cooling, hold when neither is usable.
    pub fn resolve_provider(
        &self,
        preferred: &Provider,
        fallback: Option<&Provider>,
    ) -> ProviderRoute {
        match self.cooldown_remaining(preferred) {
            None => ProviderRoute::Primary,
            Some(remaining) => match fallback {
                Some(candidate) if self.cooldown_remaining(candidate).is_none() => {
                    ProviderRoute::Fallback(candidate.clone())
                }
                _ => ProviderRoute::Hold { remaining },
            },
        }
    }
}
