//! Concurrency controller: global, per-model, and per-client slots.
//!
//! Every inference request acquires up to three semaphores in order — global,
//! then per-model (if a cap is configured), then per-client (if fairness is
//! enabled) — and releases them in reverse on drop. `priority = high` requests
//! bypass all of them.
//!
//! The global limit is adaptive: a memory-pressure baseline with a latency
//! overlay on top (rolling p95 against a target). Tokio semaphores cannot
//! shrink in place, so re-sizing replaces the semaphore object — and the swap
//! is deferred while any request is in flight to avoid orphaning waiters on
//! the old semaphore.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::{
    config::ConcurrencyConfig,
    error::LmxError,
    memory::MemoryMonitor,
};

/// Request priority. `High` bypasses slot acquisition entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("high") => Self::High,
            _ => Self::Normal,
        }
    }
}

struct GlobalSlots {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

struct Inner {
    max_concurrent: usize,
    min_concurrent: usize,
    semaphore_timeout: Duration,
    adaptive_enabled: bool,
    latency_target_sec: f64,
    latency_window: usize,

    global: Mutex<GlobalSlots>,
    model_semaphores: HashMap<String, Arc<Semaphore>>,
    client_semaphores: DashMap<String, Arc<Semaphore>>,
    per_client_default: Option<usize>,
    per_client_overrides: HashMap<String, usize>,

    in_flight: AtomicUsize,
    waiting: AtomicUsize,
    waiting_by_model: DashMap<String, usize>,

    latency_samples: Mutex<VecDeque<f64>>,
    last_adapt_reason: Mutex<String>,

    /// `true` while `in_flight == 0`. `drain` waits on this.
    idle_tx: watch::Sender<bool>,
}

/// Held for the duration of one request. Dropping releases the acquired
/// permits in reverse order and decrements the in-flight counter.
pub struct SlotGuard {
    inner: Arc<Inner>,
    pub queue_wait_sec: f64,
    // Field order is drop order: client, then model, then global.
    _client_permit: Option<OwnedSemaphorePermit>,
    _model_permit: Option<OwnedSemaphorePermit>,
    _global_permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("queue_wait_sec", &self.queue_wait_sec)
            .finish()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let remaining = self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            let _ = self.inner.idle_tx.send(true);
        }
    }
}

/// Decrements the waiting counters if acquisition bails before completing.
struct WaitingGuard<'a> {
    inner: &'a Inner,
    model_id: String,
    armed: bool,
}

impl WaitingGuard<'_> {
    fn disarm(mut self) {
        self.release();
        self.armed = false;
    }

    fn release(&mut self) {
        if self.armed {
            self.inner.waiting.fetch_sub(1, Ordering::SeqCst);
            if let Some(mut count) = self.inner.waiting_by_model.get_mut(&self.model_id) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct ConcurrencyController {
    inner: Arc<Inner>,
}

impl ConcurrencyController {
    pub fn new(config: &ConcurrencyConfig) -> Self {
        let max = config.max_concurrent_requests.max(1);
        let min = config.min_concurrent.clamp(1, max);

        let model_semaphores = config
            .per_model_limits
            .iter()
            .map(|(model, limit)| {
                (
                    model.clone(),
                    Arc::new(Semaphore::new((*limit).clamp(1, max))),
                )
            })
            .collect();

        let (idle_tx, _) = watch::channel(true);

        Self {
            inner: Arc::new(Inner {
                max_concurrent: max,
                min_concurrent: min,
                semaphore_timeout: Duration::from_secs_f64(config.semaphore_timeout_sec.max(0.001)),
                adaptive_enabled: config.adaptive_enabled,
                latency_target_sec: (config.latency_target_ms / 1000.0).max(0.1),
                latency_window: config.latency_window.max(8),
                global: Mutex::new(GlobalSlots {
                    semaphore: Arc::new(Semaphore::new(max)),
                    limit: max,
                }),
                model_semaphores,
                client_semaphores: DashMap::new(),
                per_client_default: config.per_client_default,
                per_client_overrides: config.per_client_overrides.clone(),
                in_flight: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                waiting_by_model: DashMap::new(),
                latency_samples: Mutex::new(VecDeque::with_capacity(config.latency_window.max(8))),
                last_adapt_reason: Mutex::new(String::from("initial")),
                idle_tx,
            }),
        }
    }

    /// Acquire slots for one request, waiting up to the semaphore timeout per
    /// stage. Fails busy (429-shaped) on timeout.
    pub async fn acquire(
        &self,
        model_id: &str,
        priority: Priority,
        client_id: Option<&str>,
    ) -> Result<SlotGuard, LmxError> {
        if priority == Priority::High {
            self.note_in_flight();
            return Ok(SlotGuard {
                inner: Arc::clone(&self.inner),
                queue_wait_sec: 0.0,
                _client_permit: None,
                _model_permit: None,
                _global_permit: None,
            });
        }

        self.inner.waiting.fetch_add(1, Ordering::SeqCst);
        *self
            .inner
            .waiting_by_model
            .entry(model_id.to_string())
            .or_insert(0) += 1;
        let waiting = WaitingGuard {
            inner: self.inner.as_ref(),
            model_id: model_id.to_string(),
            armed: true,
        };
        let wait_start = Instant::now();

        let global = {
            let slots = self.inner.global.lock().expect("global slots lock poisoned");
            Arc::clone(&slots.semaphore)
        };
        let global_permit = self.acquire_one(global).await?;

        let model_permit = match self.inner.model_semaphores.get(model_id) {
            Some(semaphore) => Some(self.acquire_one(Arc::clone(semaphore)).await?),
            None => None,
        };

        let client_permit = match self.client_semaphore_for(client_id) {
            Some(semaphore) => Some(self.acquire_one(semaphore).await?),
            None => None,
        };

        waiting.disarm();
        self.note_in_flight();

        Ok(SlotGuard {
            inner: Arc::clone(&self.inner),
            queue_wait_sec: wait_start.elapsed().as_secs_f64(),
            _client_permit: client_permit,
            _model_permit: model_permit,
            _global_permit: global_permit.into(),
        })
    }

    async fn acquire_one(
        &self,
        semaphore: Arc<Semaphore>,
    ) -> Result<OwnedSemaphorePermit, LmxError> {
        match tokio::time::timeout(self.inner.semaphore_timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            // A closed semaphore only happens during shutdown; surface busy.
            Ok(Err(_)) | Err(_) => Err(LmxError::Busy),
        }
    }

    fn note_in_flight(&self) {
        if self.inner.in_flight.fetch_add(1, Ordering::SeqCst) == 0 {
            let _ = self.inner.idle_tx.send(false);
        }
    }

    fn client_semaphore_for(&self, client_id: Option<&str>) -> Option<Arc<Semaphore>> {
        let key = normalize_client_key(client_id);
        let limit = self.per_client_limit_for(&key)?;
        let semaphore = self
            .inner
            .client_semaphores
            .entry(key)
            .or_insert_with(|| Arc::new(Semaphore::new(limit)));
        Some(Arc::clone(semaphore.value()))
    }

    fn per_client_limit_for(&self, client_key: &str) -> Option<usize> {
        let default = self.inner.per_client_default?;
        let explicit = self
            .inner
            .per_client_overrides
            .get(client_key)
            .or_else(|| self.inner.per_client_overrides.get(&client_key.to_lowercase()));
        Some(
            explicit
                .copied()
                .unwrap_or(default)
                .clamp(1, self.inner.max_concurrent),
        )
    }

    // ── Telemetry inputs ────────────────────────────────────────────────

    pub fn record_latency_sample(&self, latency_sec: f64) {
        if latency_sec < 0.0 {
            return;
        }
        let mut samples = self
            .inner
            .latency_samples
            .lock()
            .expect("latency lock poisoned");
        if samples.len() == self.inner.latency_window {
            samples.pop_front();
        }
        samples.push_back(latency_sec);
    }

    /// Rolling p95 over the sample window; `None` until any sample exists.
    pub fn latency_p95_sec(&self) -> Option<f64> {
        let samples = self
            .inner
            .latency_samples
            .lock()
            .expect("latency lock poisoned");
        if samples.is_empty() {
            return None;
        }
        let mut ordered: Vec<f64> = samples.iter().copied().collect();
        ordered.sort_by(|a, b| a.partial_cmp(b).expect("latency samples are finite"));
        let index = ((ordered.len() as f64) * 0.95) as usize;
        Some(ordered[index.min(ordered.len() - 1)])
    }

    fn latency_sample_count(&self) -> usize {
        self.inner
            .latency_samples
            .lock()
            .expect("latency lock poisoned")
            .len()
    }

    // ── Adaptive sizing ─────────────────────────────────────────────────

    /// Recompute the global limit from memory pressure and latency.
    ///
    /// The semaphore object is only replaced while nothing is in flight;
    /// otherwise the swap is deferred to a later call that reaches idle.
    /// Returns the computed target (which may not yet be live).
    pub fn adapt(&self, memory: &MemoryMonitor) -> usize {
        let usage_pct = memory.usage_percent();
        let threshold = memory.threshold_percent();
        let max = self.inner.max_concurrent;
        let min = self.inner.min_concurrent;

        let ratio = if threshold > 0.0 { usage_pct / threshold } else { 0.0 };
        let mut reason = "memory";
        let mut target = if ratio < 0.7 {
            max
        } else if ratio < 0.85 {
            (max * 3 / 4).clamp(min, max).max(1)
        } else if ratio < 0.95 {
            (max / 2).clamp(min, max).max(1)
        } else {
            min
        };

        if self.inner.adaptive_enabled && self.latency_sample_count() >= 8 {
            if let Some(p95) = self.latency_p95_sec() {
                let high_watermark = self.inner.latency_target_sec * 1.25;
                let low_watermark = self.inner.latency_target_sec * 0.70;
                if p95 > high_watermark {
                    target = target.saturating_sub(1).max(min);
                    reason = "latency_high";
                } else if p95 < low_watermark && self.waiting_queue_count() > 0 {
                    target = (target + 1).min(max);
                    reason = "latency_low_queue_backlog";
                }
            }
        }

        let mut slots = self.inner.global.lock().expect("global slots lock poisoned");
        if target != slots.limit {
            if self.in_flight_count() == 0 {
                slots.semaphore = Arc::new(Semaphore::new(target));
                slots.limit = target;
                *self
                    .inner
                    .last_adapt_reason
                    .lock()
                    .expect("adapt reason lock poisoned") = reason.to_string();
                tracing::info!(
                    new_limit = target,
                    memory_usage_pct = usage_pct,
                    latency_p95_sec = ?self.latency_p95_sec(),
                    reason,
                    "concurrency_adapted"
                );
            } else {
                tracing::debug!(
                    target,
                    reason,
                    in_flight = self.in_flight_count(),
                    "concurrency_adaptation_deferred"
                );
            }
        } else {
            *self
                .inner
                .last_adapt_reason
                .lock()
                .expect("adapt reason lock poisoned") = reason.to_string();
        }

        target
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn current_limit(&self) -> usize {
        self.inner.global.lock().expect("global slots lock poisoned").limit
    }

    /// Identity of the live global semaphore; used by tests to assert the
    /// no-swap-while-busy invariant.
    pub fn global_semaphore_id(&self) -> usize {
        let slots = self.inner.global.lock().expect("global slots lock poisoned");
        Arc::as_ptr(&slots.semaphore) as usize
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn waiting_queue_count(&self) -> usize {
        self.inner.waiting.load(Ordering::SeqCst)
    }

    pub fn last_adapt_reason(&self) -> String {
        self.inner
            .last_adapt_reason
            .lock()
            .expect("adapt reason lock poisoned")
            .clone()
    }

    /// Receiver that reads `true` while nothing is in flight.
    pub fn idle_watch(&self) -> watch::Receiver<bool> {
        self.inner.idle_tx.subscribe()
    }
}

fn normalize_client_key(client_id: Option<&str>) -> String {
    match client_id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => "anonymous".to_string(),
    }
}
