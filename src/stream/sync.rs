//! Local-monitor sync
//!
//! A dead-band proportional controller keeps the local monitor delayed by
//! roughly the same amount as the remote speaker path:
//!
//! ```text
//! target = baseline_delay + (rtt - baseline_rtt), clamped to [0, max]
//! apply round(target, step) only when |target - current| > threshold
//! ```
//!
//! The applied delay and `SyncState::current_delay_ms` are written under the
//! same lock, so the controller's view never diverges from the device.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{StreamError, StreamResult};
use crate::models::{Device, SyncState, SyncStatus};
use crate::stream::monitor::AudioControl;

// =============================================================================
// RTT Probe
// =============================================================================

#[async_trait]
pub trait RttProbe: Send + Sync {
    /// One round-trip sample in milliseconds
    async fn probe(&self, device: &Device) -> StreamResult<u32>;
}

/// Times a TCP handshake with the device's control port
pub struct TcpRttProbe {
    timeout: Duration,
}

impl TcpRttProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl RttProbe for TcpRttProbe {
    async fn probe(&self, device: &Device) -> StreamResult<u32> {
        let started = std::time::Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect((device.address, device.port))).await {
            Ok(Ok(stream)) => {
                let rtt = started.elapsed().as_millis().min(u32::MAX as u128) as u32;
                drop(stream);
                Ok(rtt)
            }
            Ok(Err(_)) | Err(_) => Err(StreamError::DeviceUnreachable(device.display_name.clone())),
        }
    }
}

// =============================================================================
// Delay Controller
// =============================================================================

/// Pure dead-band controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayController {
    pub threshold_ms: u32,
    pub step_ms: u32,
    pub max_delay_ms: u32,
}

impl DelayController {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            threshold_ms: config.adjustment_threshold_ms,
            step_ms: config.rounding_step_ms.max(1),
            max_delay_ms: config.max_delay_ms,
        }
    }

    /// Unrounded target for a sample, clamped to `[0, max]`
    pub fn target(&self, state: &SyncState, rtt_ms: u32) -> u32 {
        let raw = i64::from(state.baseline_delay_ms) + i64::from(rtt_ms) - i64::from(state.baseline_rtt_ms);
        raw.clamp(0, i64::from(self.max_delay_ms)) as u32
    }

    pub fn round(&self, delay_ms: u32) -> u32 {
        let step = self.step_ms;
        let rounded = (delay_ms.saturating_add(step / 2) / step).saturating_mul(step);
        rounded.min(self.max_delay_ms)
    }

    /// New delay to apply for this sample, or `None` inside the dead band
    pub fn decide(&self, state: &SyncState, rtt_ms: u32) -> Option<u32> {
        let target = self.target(state, rtt_ms);
        if target.abs_diff(state.current_delay_ms) <= self.threshold_ms {
            return None;
        }
        let next = self.round(target);
        (next != state.current_delay_ms).then_some(next)
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

struct Shared {
    state: Option<SyncState>,
    /// Delay to baseline against once a first sample arrives
    pending_delay_ms: u32,
    manual_until: Option<Instant>,
    failures: u32,
}

/// Everything a probe tick needs; cloned into the background task
#[derive(Clone)]
struct Worker {
    config: SyncConfig,
    controller: DelayController,
    probe: Arc<dyn RttProbe>,
    audio: Arc<dyn AudioControl>,
    device: Device,
    endpoint: String,
    shared: Arc<Mutex<Shared>>,
    status: Arc<watch::Sender<SyncStatus>>,
}

impl Worker {
    async fn sample(&self) -> StreamResult<u32> {
        let window = Duration::from_millis(self.config.probe_timeout_ms);
        match tokio::time::timeout(window, self.probe.probe(&self.device)).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::DeviceUnreachable(self.device.display_name.clone())),
        }
    }

    fn set_status(&self, status: SyncStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Apply `delay_ms` and commit it to the state in one step
    async fn apply(&self, shared: &mut Shared, delay_ms: u32) -> StreamResult<()> {
        self.audio.set_delay(&self.endpoint, delay_ms).await?;
        if let Some(state) = shared.state.as_mut() {
            state.current_delay_ms = delay_ms;
        }
        Ok(())
    }

    async fn tick(&self) {
        let sample = self.sample().await;
        let mut guard = self.shared.lock().await;
        let shared = &mut *guard;

        let rtt = match sample {
            Ok(rtt) => rtt,
            Err(e) => {
                shared.failures += 1;
                debug!("rtt probe failed ({} in a row): {}", shared.failures, e);
                if shared.failures >= self.config.failure_threshold {
                    let already = *self.status.borrow() == SyncStatus::Degraded;
                    if !already {
                        warn!(
                            "{}",
                            StreamError::SyncProbeDegraded {
                                failures: shared.failures
                            }
                        );
                    }
                    self.set_status(SyncStatus::Degraded);
                }
                return;
            }
        };

        shared.failures = 0;
        let now = Instant::now();
        let in_grace = shared.manual_until.is_some_and(|until| now < until);
        if !in_grace {
            shared.manual_until = None;
        }
        self.set_status(if in_grace {
            SyncStatus::Manual
        } else {
            SyncStatus::Active
        });

        let Some(state) = shared.state.as_mut() else {
            let delay = shared.pending_delay_ms;
            let mut state = SyncState::new(rtt, delay);
            state.last_measured_rtt_ms = Some(rtt);
            state.last_measured_at = Some(now.into_std());
            shared.state = Some(state);
            info!("Sync baseline: rtt {}ms, delay {}ms", rtt, delay);
            return;
        };
        state.last_measured_rtt_ms = Some(rtt);
        state.last_measured_at = Some(now.into_std());

        if in_grace {
            return;
        }
        if let Some(next) = self.controller.decide(state, rtt) {
            let previous = state.current_delay_ms;
            match self.apply(shared, next).await {
                Ok(()) => info!("Monitor delay {}ms -> {}ms (rtt {}ms)", previous, next, rtt),
                Err(e) => warn!("Could not apply monitor delay: {}", e),
            }
        }
    }

    async fn run(self, cancel: CancellationToken) {
        let period = Duration::from_millis(self.config.probe_interval_ms.max(1));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.tick().await;

            let degraded = *self.status.borrow() == SyncStatus::Degraded;
            if degraded {
                // Pause probing, then try again from scratch
                let backoff = Duration::from_millis(self.config.degraded_backoff_ms);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                self.shared.lock().await.failures = 0;
                interval.reset();
            }
        }
        debug!("sync task stopped");
    }
}

/// Owns the sync state and its probing task
pub struct SyncEngine {
    config: SyncConfig,
    probe: Arc<dyn RttProbe>,
    audio: Arc<dyn AudioControl>,
    status: Arc<watch::Sender<SyncStatus>>,
    worker: Option<Worker>,
    task: Option<(JoinHandle<()>, CancellationToken)>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, probe: Arc<dyn RttProbe>, audio: Arc<dyn AudioControl>) -> Self {
        let (status, _) = watch::channel(SyncStatus::Inactive);
        Self {
            config,
            probe,
            audio,
            status: Arc::new(status),
            worker: None,
            task: None,
        }
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    /// Status changes, delivered by message
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn is_enabled(&self) -> bool {
        self.worker.is_some()
    }

    /// Copy of the current state
    pub async fn state(&self) -> Option<SyncState> {
        match &self.worker {
            Some(worker) => worker.shared.lock().await.state.clone(),
            None => None,
        }
    }

    /// Start probing `device` and delaying `endpoint`.
    ///
    /// `baseline_delay_ms` is the "sounds right" delay for the current RTT;
    /// the configured default is used when absent.
    pub async fn enable(
        &mut self,
        device: &Device,
        endpoint: &str,
        baseline_delay_ms: Option<u32>,
    ) -> StreamResult<()> {
        if self.is_enabled() {
            self.disable().await?;
        }
        let controller = DelayController::from_config(&self.config);
        let delay = baseline_delay_ms
            .unwrap_or(self.config.default_delay_ms)
            .min(self.config.max_delay_ms);

        let worker = Worker {
            config: self.config.clone(),
            controller,
            probe: self.probe.clone(),
            audio: self.audio.clone(),
            device: device.clone(),
            endpoint: endpoint.to_string(),
            shared: Arc::new(Mutex::new(Shared {
                state: None,
                pending_delay_ms: delay,
                manual_until: None,
                failures: 0,
            })),
            status: self.status.clone(),
        };

        {
            let mut shared = worker.shared.lock().await;
            self.audio.set_delay(endpoint, delay).await?;
            match worker.sample().await {
                Ok(rtt) => {
                    let mut state = SyncState::new(rtt, delay);
                    state.last_measured_rtt_ms = Some(rtt);
                    state.last_measured_at = Some(std::time::Instant::now());
                    shared.state = Some(state);
                    info!("Sync enabled for {}: rtt {}ms, delay {}ms", device.display_name, rtt, delay);
                }
                Err(e) => {
                    warn!("Initial rtt probe failed, baseline deferred: {}", e);
                    shared.failures = 1;
                }
            }
        }
        worker.set_status(SyncStatus::Active);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.clone().run(cancel.clone()));
        self.task = Some((handle, cancel));
        self.worker = Some(worker);
        Ok(())
    }

    /// Re-baseline at `delay_ms` against a fresh RTT sample
    pub async fn set_baseline(&self, delay_ms: u32) -> StreamResult<()> {
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| StreamError::AudioControl("sync is not enabled".to_string()))?;
        let delay = delay_ms.min(self.config.max_delay_ms);
        let fresh = worker.sample().await.ok();

        let mut shared = worker.shared.lock().await;
        let rtt = fresh
            .or_else(|| shared.state.as_ref().and_then(|s| s.last_measured_rtt_ms))
            .unwrap_or(0);
        worker.audio.set_delay(&worker.endpoint, delay).await?;

        let mut state = SyncState::new(rtt, delay);
        if let Some(previous) = shared.state.as_ref() {
            state.last_measured_at = previous.last_measured_at;
        }
        state.last_measured_rtt_ms = Some(rtt);
        shared.state = Some(state);
        shared.pending_delay_ms = delay;
        info!("Sync baseline set: rtt {}ms, delay {}ms", rtt, delay);
        Ok(())
    }

    /// User-set delay: re-baseline and hold off automatic adjustment
    pub async fn set_manual_delay(&self, delay_ms: u32) -> StreamResult<()> {
        self.set_baseline(delay_ms).await?;
        if let Some(worker) = &self.worker {
            worker.shared.lock().await.manual_until =
                Some(Instant::now() + Duration::from_millis(self.config.manual_grace_ms));
            worker.set_status(SyncStatus::Manual);
        }
        Ok(())
    }

    /// Stop probing and put the delay back to zero. Waits for the task to
    /// finish before touching the delay.
    pub async fn disable(&mut self) -> StreamResult<()> {
        if let Some((handle, cancel)) = self.task.take() {
            cancel.cancel();
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!("sync task panicked");
                }
            }
        }
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        let mut shared = worker.shared.lock().await;
        let result = worker.audio.set_delay(&worker.endpoint, 0).await;
        shared.state = None;
        worker.set_status(SyncStatus::Inactive);
        match &result {
            Ok(()) => info!("Sync disabled, monitor delay reset"),
            Err(e) => warn!("Sync disabled but delay reset failed: {}", e),
        }
        result
    }
}
