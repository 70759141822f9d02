//! Stream orchestrator
//!
//! Turns a selection into a pipeline shape, builds it in order (relay,
//! encoders, output wait, concurrent receiver connects) and tears it down in
//! reverse. State flows `Idle -> Preparing -> Streaming -> Stopping -> Idle`;
//! any failure goes through `Failed` and full teardown back to `Idle`. A
//! speaker whose real-time receiver never launches gets one rebuild on the
//! segmented path instead.
//!
//! Every live resource of a build is recorded in a [`PipelineHandle`] owned
//! here and nowhere else.

use futures::future::join_all;
use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{StreamError, StreamResult};
use crate::models::{
    CapabilityClass, ChannelAssignment, ChannelFilter, Codec, Device, EncoderSpec, Pipeline,
    PipelineShape, PipelineState, Selection, SyncStatus, Target,
};
use crate::registry::DeviceRegistry;
use crate::stream::cast::{CastSessionController, Session};
use crate::stream::encoder::{EncoderHealth, ProcessHandle, Transcoder};
use crate::stream::monitor::{AudioControl, LocalMonitor, RestoreSlot};
use crate::stream::relay::{Relay, RelayEndpoints};
use crate::stream::sync::{RttProbe, SyncEngine};

/// Feed name for single-feed pipelines
pub const MAIN_FEED: &str = "pcaudio";
pub const LEFT_FEED: &str = "left";
pub const RIGHT_FEED: &str = "right";

const OUTPUT_POLL: Duration = Duration::from_millis(250);
const READER_CHECKS: u32 = 4;
const READER_CHECK_INTERVAL: Duration = Duration::from_millis(500);

// =============================================================================
// Requests and Events
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Keep a local output in sync with the remote speaker
    pub monitor: bool,
    /// Baseline monitor delay; the configured default when absent
    pub baseline_delay_ms: Option<u32>,
}

/// Status changes surfaced to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    State(PipelineState),
    /// A custom receiver timed out and the generic one took over
    ReceiverFallback { device: String, app_id: String },
    /// Non-fatal condition worth showing
    Warning(String),
}

/// External collaborators the orchestrator drives
pub struct Collaborators {
    pub registry: Arc<DeviceRegistry>,
    pub transcoder: Arc<dyn Transcoder>,
    pub relay: Arc<dyn Relay>,
    pub cast: Arc<CastSessionController>,
    pub probe: Arc<dyn RttProbe>,
    pub audio: Arc<dyn AudioControl>,
}

/// Cancels whatever build is in flight; cloneable across tasks
#[derive(Clone, Default)]
pub struct StopSignal {
    current: Arc<Mutex<CancellationToken>>,
}

impl StopSignal {
    pub fn cancel(&self) {
        match self.current.lock() {
            Ok(token) => token.cancel(),
            Err(poisoned) => poisoned.into_inner().cancel(),
        }
    }

    fn fresh(&self) -> CancellationToken {
        let token = CancellationToken::new();
        match self.current.lock() {
            Ok(mut slot) => *slot = token.clone(),
            Err(poisoned) => *poisoned.into_inner() = token.clone(),
        }
        token
    }
}

// =============================================================================
// Planning
// =============================================================================

fn realtime_spec(config: &Config, feed: &str, filter: ChannelFilter) -> EncoderSpec {
    EncoderSpec {
        output_sink: feed.to_string(),
        source_channel_filter: filter,
        codec: Codec::LowLatencyVoice,
        bitrate_kbps: config.encoder.realtime_bitrate_kbps,
        sample_rate_hz: config.encoder.sample_rate_hz,
        channel_count: if filter == ChannelFilter::None { 2 } else { 1 },
    }
}

fn segmented_spec(config: &Config) -> EncoderSpec {
    EncoderSpec {
        output_sink: MAIN_FEED.to_string(),
        source_channel_filter: ChannelFilter::None,
        codec: Codec::BroadCompat,
        bitrate_kbps: config.encoder.segmented_bitrate_kbps,
        sample_rate_hz: config.encoder.sample_rate_hz,
        channel_count: 2,
    }
}

fn both(devices: Vec<Device>) -> Vec<Target> {
    devices
        .into_iter()
        .map(|device| Target {
            device,
            channel: ChannelAssignment::Both,
            feed: MAIN_FEED.to_string(),
        })
        .collect()
}

fn stereo(left: Device, right: Device) -> Vec<Target> {
    vec![
        Target {
            device: left,
            channel: ChannelAssignment::Left,
            feed: LEFT_FEED.to_string(),
        },
        Target {
            device: right,
            channel: ChannelAssignment::Right,
            feed: RIGHT_FEED.to_string(),
        },
    ]
}

/// The same devices moved onto one shared segmented feed, for receivers
/// that never came up on the real-time path
fn segmented_fallback(pipeline: &Pipeline, config: &Config) -> Pipeline {
    let devices = pipeline.targets.iter().map(|t| t.device.clone()).collect();
    Pipeline {
        id: Uuid::new_v4(),
        shape: PipelineShape::DisplayFallback,
        targets: both(devices),
        encoder_specs: vec![segmented_spec(config)],
        state: PipelineState::Idle,
    }
}

/// Decide the pipeline for a selection.
///
/// One encoder spec per distinct feed: two for a stereo split, one for
/// everything else however many targets share it.
pub fn plan_pipeline(
    selection: &Selection,
    registry: &DeviceRegistry,
    config: &Config,
) -> StreamResult<Pipeline> {
    let (shape, targets) = match selection {
        Selection::Single(key) => {
            let device = registry.require(key)?;
            match device.class {
                CapabilityClass::Display => (PipelineShape::DisplayFallback, both(vec![device])),
                CapabilityClass::Speaker => (PipelineShape::Mono, both(vec![device])),
                CapabilityClass::Group => {
                    let members = device.group_members.clone();
                    if members.iter().any(|m| m.class == CapabilityClass::Display) {
                        (PipelineShape::DisplayFallback, both(members))
                    } else {
                        match members.len() {
                            0 => (PipelineShape::Mono, both(vec![device])),
                            1 => (PipelineShape::Mono, both(members)),
                            2 => {
                                let mut it = members.into_iter();
                                match (it.next(), it.next()) {
                                    (Some(l), Some(r)) => (PipelineShape::StereoSplit, stereo(l, r)),
                                    _ => return Err(StreamError::InvalidSelection(key.clone())),
                                }
                            }
                            _ => (PipelineShape::Multicast, both(members)),
                        }
                    }
                }
            }
        }
        Selection::Pair { left, right } => {
            let l = registry.require(left)?;
            let r = registry.require(right)?;
            if l.id == r.id {
                return Err(StreamError::InvalidSelection(format!(
                    "'{}' cannot be both left and right",
                    l.display_name
                )));
            }
            if l.class == CapabilityClass::Display || r.class == CapabilityClass::Display {
                (PipelineShape::DisplayFallback, both(vec![l, r]))
            } else if l.class == CapabilityClass::Group || r.class == CapabilityClass::Group {
                return Err(StreamError::InvalidSelection(
                    "a stereo pair needs two individual speakers".to_string(),
                ));
            } else {
                (PipelineShape::StereoSplit, stereo(l, r))
            }
        }
    };

    let encoder_specs = match shape {
        PipelineShape::DisplayFallback => vec![segmented_spec(config)],
        PipelineShape::StereoSplit => vec![
            realtime_spec(config, LEFT_FEED, ChannelFilter::LeftOnly),
            realtime_spec(config, RIGHT_FEED, ChannelFilter::RightOnly),
        ],
        PipelineShape::Mono | PipelineShape::Multicast => {
            vec![realtime_spec(config, MAIN_FEED, ChannelFilter::None)]
        }
    };

    Ok(Pipeline {
        id: Uuid::new_v4(),
        shape,
        targets,
        encoder_specs,
        state: PipelineState::Idle,
    })
}

// =============================================================================
// Pipeline Handle
// =============================================================================

/// Live resources of one build
pub struct PipelineHandle {
    pub pipeline: Pipeline,
    pub options: StartOptions,
    relay_started: bool,
    pub endpoints: Option<RelayEndpoints>,
    pub encoders: Vec<ProcessHandle>,
    pub sessions: Vec<Session>,
    /// Targets whose connect began; cleaned up even if it never finished
    connect_attempted: Vec<Device>,
    monitor: Option<LocalMonitor>,
}

impl PipelineHandle {
    fn new(pipeline: Pipeline, options: StartOptions) -> Self {
        Self {
            pipeline,
            options,
            relay_started: false,
            endpoints: None,
            encoders: Vec::new(),
            sessions: Vec::new(),
            connect_attempted: Vec::new(),
            monitor: None,
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Outcome of one build; segmented pipelines never ask for a fallback
enum Attempt {
    Finished(StreamResult<()>),
    Fallback(Pipeline),
}

pub struct Orchestrator {
    config: Config,
    host_ip: IpAddr,
    registry: Arc<DeviceRegistry>,
    transcoder: Arc<dyn Transcoder>,
    relay: Arc<dyn Relay>,
    cast: Arc<CastSessionController>,
    audio: Arc<dyn AudioControl>,
    sync: SyncEngine,
    restore: RestoreSlot,
    state: PipelineState,
    active: Option<PipelineHandle>,
    last_request: Option<(Selection, StartOptions)>,
    rebuilt: bool,
    /// Signature of the real-time plan the active segmented fallback replaced
    fallback_of: Option<String>,
    stop_signal: StopSignal,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        host_ip: IpAddr,
        parts: Collaborators,
        restore: RestoreSlot,
    ) -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let sync = SyncEngine::new(config.sync.clone(), parts.probe, parts.audio.clone());
        let orchestrator = Self {
            config,
            host_ip,
            registry: parts.registry,
            transcoder: parts.transcoder,
            relay: parts.relay,
            cast: parts.cast,
            audio: parts.audio,
            sync,
            restore,
            state: PipelineState::Idle,
            active: None,
            last_request: None,
            rebuilt: false,
            fallback_of: None,
            stop_signal: StopSignal::default(),
            events,
        };
        (orchestrator, rx)
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn pipeline(&self) -> Option<&Pipeline> {
        self.active.as_ref().map(|h| &h.pipeline)
    }

    pub fn handle(&self) -> Option<&PipelineHandle> {
        self.active.as_ref()
    }

    /// Cancels an in-flight build from another task
    pub fn stop_signal(&self) -> StopSignal {
        self.stop_signal.clone()
    }

    pub fn sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.sync.subscribe()
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync
    }

    fn set_state(&mut self, state: PipelineState) {
        if self.state == state {
            return;
        }
        debug!("pipeline state {} -> {}", self.state, state);
        self.state = state.clone();
        if let Some(handle) = self.active.as_mut() {
            handle.pipeline.state = state.clone();
        }
        let _ = self.events.send(OrchestratorEvent::State(state));
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }

    /// Build the pipeline for `selection`.
    ///
    /// A request for the pipeline already running is a no-op; a different
    /// one stops the current pipeline completely first.
    pub async fn start(&mut self, selection: Selection, options: StartOptions) -> StreamResult<()> {
        let pipeline = plan_pipeline(&selection, &self.registry, &self.config)?;

        if let Some(active) = &self.active {
            let signature = pipeline.signature();
            let same = active.pipeline.signature() == signature
                || self.fallback_of.as_deref() == Some(signature.as_str());
            if self.state.is_active() && same {
                info!("Already streaming {} to {}; ignoring start", pipeline.shape, selection);
                return Ok(());
            }
            info!("Switching pipeline to {}", selection);
            if let Err(e) = self.stop().await {
                warn!("Cleanup before switch: {}", e);
            }
        }

        self.rebuilt = false;
        self.fallback_of = None;
        self.last_request = Some((selection, options));
        self.build(pipeline, options).await
    }

    async fn build(&mut self, pipeline: Pipeline, options: StartOptions) -> StreamResult<()> {
        let mut pipeline = pipeline;
        loop {
            match self.attempt(pipeline, options).await {
                Attempt::Finished(result) => return result,
                Attempt::Fallback(next) => pipeline = next,
            }
        }
    }

    async fn attempt(&mut self, pipeline: Pipeline, options: StartOptions) -> Attempt {
        info!(
            "Preparing {} pipeline: {} target(s), {} feed(s)",
            pipeline.shape,
            pipeline.targets.len(),
            pipeline.encoder_specs.len()
        );
        self.set_state(PipelineState::Preparing);
        let token = self.stop_signal.fresh();
        let mut handle = PipelineHandle::new(pipeline, options);
        handle.pipeline.state = PipelineState::Preparing;

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(StreamError::Cancelled),
            result = self.prepare(&mut handle, &token) => result,
        };

        match result {
            Ok(()) => {
                handle.pipeline.state = PipelineState::Streaming;
                self.active = Some(handle);
                self.set_state(PipelineState::Streaming);
                info!("Streaming");
                if options.monitor {
                    self.enable_monitor().await;
                }
                Attempt::Finished(Ok(()))
            }
            Err(e) => {
                let fallback = match &e {
                    StreamError::ReceiverTimeout { device, .. } if handle.pipeline.shape.is_realtime() => {
                        Some((device.clone(), segmented_fallback(&handle.pipeline, &self.config)))
                    }
                    _ => None,
                };
                let planned = handle.pipeline.signature();

                if matches!(e, StreamError::Cancelled) {
                    info!("Start cancelled, tearing down");
                    self.set_state(PipelineState::Stopping);
                } else if fallback.is_some() {
                    warn!("{}; rebuilding on the segmented path", e);
                } else {
                    warn!("Pipeline failed while preparing: {}", e);
                    self.set_state(PipelineState::Failed(e.to_string()));
                }
                if let Err(cleanup) = self.teardown(handle).await {
                    warn!("Cleanup after failed start: {}", cleanup);
                }

                if let Some((device, pipeline)) = fallback.filter(|_| !token.is_cancelled()) {
                    self.emit(OrchestratorEvent::ReceiverFallback {
                        device,
                        app_id: self.config.cast.generic_app_id.clone(),
                    });
                    self.fallback_of = Some(planned);
                    return Attempt::Fallback(pipeline);
                }
                self.set_state(PipelineState::Idle);
                Attempt::Finished(Err(e))
            }
        }
    }

    /// The `Preparing` steps. Every started resource is recorded in `handle`
    /// as soon as it exists.
    async fn prepare(&self, handle: &mut PipelineHandle, token: &CancellationToken) -> StreamResult<()> {
        // RTSP ingress is push-based, so the relay must listen before encoders start
        handle.relay_started = true;
        let endpoints = self.relay.start(self.host_ip).await?;
        handle.endpoints = Some(endpoints.clone());

        let specs = handle.pipeline.encoder_specs.clone();
        for spec in &specs {
            let route = self.relay.route_feed(&spec.output_sink, spec.codec).await?;
            let process = self.transcoder.start(spec, &route).await?;
            handle.encoders.push(process);
        }

        if !self.relay.is_live().await {
            return Err(StreamError::RelayDown);
        }

        for (spec, process) in specs.iter().zip(handle.encoders.clone()) {
            self.wait_for_output(spec, &process).await?;
        }

        // Every connect starts together; sequential connects drift L/R apart
        let targets = handle.pipeline.targets.clone();
        let codec = if handle.pipeline.shape.is_realtime() {
            Codec::LowLatencyVoice
        } else {
            Codec::BroadCompat
        };
        handle.connect_attempted = targets.iter().map(|t| t.device.clone()).collect();
        let results = join_all(
            targets
                .iter()
                .map(|t| self.cast.connect(&t.device, t.channel, &t.feed, codec, &endpoints)),
        )
        .await;

        let mut first_err = None;
        for result in results {
            match result {
                Ok(session) => {
                    if session.used_fallback {
                        self.emit(OrchestratorEvent::ReceiverFallback {
                            device: session.device.display_name.clone(),
                            app_id: session.app_id.clone(),
                        });
                    }
                    handle.sessions.push(session);
                }
                Err(e) => {
                    warn!("Connect failed: {}", e);
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        if handle.pipeline.shape.is_realtime() {
            self.spawn_reader_check(&specs, token.clone());
        }
        Ok(())
    }

    /// Poll until the relay reports output for the feed.
    ///
    /// Waits `output_wait`, then up to `output_grace` more before giving up.
    /// An encoder that dies meanwhile fails immediately.
    async fn wait_for_output(&self, spec: &EncoderSpec, process: &ProcessHandle) -> StreamResult<()> {
        let started = Instant::now();
        let wait = self.config.timeouts.output_wait();
        let limit = wait + self.config.timeouts.output_grace();
        let mut warned = false;

        loop {
            if let EncoderHealth::Exited(code) = self.transcoder.health(process).await {
                return Err(StreamError::EncoderExited {
                    feed: spec.output_sink.clone(),
                    code,
                });
            }
            if self.relay.feed_ready(&spec.output_sink, spec.codec).await {
                debug!("output for '{}' ready after {:?}", spec.output_sink, started.elapsed());
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= limit {
                return Err(StreamError::OutputTimeout {
                    feed: spec.output_sink.clone(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            if elapsed >= wait && !warned {
                warned = true;
                warn!("Output for '{}' not visible yet, extending wait", spec.output_sink);
            }
            tokio::time::sleep(OUTPUT_POLL).await;
        }
    }

    /// Brief check that receivers actually pull the real-time feeds.
    /// Ends with the build it belongs to.
    fn spawn_reader_check(&self, specs: &[EncoderSpec], token: CancellationToken) {
        let relay = self.relay.clone();
        let events = self.events.clone();
        let feeds: Vec<String> = specs.iter().map(|s| s.output_sink.clone()).collect();
        let check = async move {
            for feed in feeds {
                let mut connected = false;
                for _ in 0..READER_CHECKS {
                    tokio::time::sleep(READER_CHECK_INTERVAL).await;
                    if relay.reader_active(&feed).await {
                        connected = true;
                        break;
                    }
                }
                if !connected {
                    warn!("no_session: no receiver is reading feed '{}' yet", feed);
                    let _ = events.send(OrchestratorEvent::Warning(format!(
                        "no receiver session on feed '{}' yet",
                        feed
                    )));
                }
            }
        };
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("reader check dropped with its pipeline"),
                _ = check => {}
            }
        });
    }

    /// Local monitor and sync; failures here never stop the audio
    async fn enable_monitor(&mut self) {
        let Some(handle) = self.active.as_mut() else {
            return;
        };
        if !handle.pipeline.shape.is_realtime() {
            info!("Local monitor sync only applies to speaker pipelines");
            return;
        }
        let Some(device) = handle.sessions.first().map(|s| s.device.clone()) else {
            return;
        };

        let mut monitor = LocalMonitor::new(
            self.audio.clone(),
            self.config.monitor.clone(),
            self.restore.clone(),
        );
        let endpoint = match monitor.enable().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!("Local monitor unavailable: {}", e);
                let _ = monitor.disable().await;
                let _ = self.events.send(OrchestratorEvent::Warning(format!(
                    "local monitor unavailable: {}",
                    e
                )));
                return;
            }
        };
        handle.monitor = Some(monitor);

        let baseline = handle.options.baseline_delay_ms;
        if let Err(e) = self.sync.enable(&device, &endpoint, baseline).await {
            warn!("Sync unavailable: {}", e);
            let _ = self.events.send(OrchestratorEvent::Warning(format!("sync unavailable: {}", e)));
        }
    }

    /// Reverse-order teardown; every step runs, the first error is returned
    async fn teardown(&mut self, mut handle: PipelineHandle) -> StreamResult<()> {
        let mut first_err: Option<StreamError> = None;

        if self.sync.is_enabled() {
            if let Err(e) = self.sync.disable().await {
                first_err.get_or_insert(e);
            }
        }
        if let Some(mut monitor) = handle.monitor.take() {
            if let Err(e) = monitor.disable().await {
                first_err.get_or_insert(e);
            }
        }

        let sessions = std::mem::take(&mut handle.sessions);
        let results = join_all(sessions.iter().map(|s| self.cast.disconnect(s))).await;
        for (session, result) in sessions.iter().zip(results) {
            if let Err(e) = result {
                warn!("Disconnect from {} failed: {}", session.device.display_name, e);
                first_err.get_or_insert(e);
            }
        }
        // Receivers launched by a connect that never completed
        let client = self.cast.client();
        for device in handle
            .connect_attempted
            .iter()
            .filter(|d| !sessions.iter().any(|s| s.device.id == d.id))
        {
            if let Err(e) = client.quit_app(device).await {
                debug!("quit on unfinished connect to {}: {}", device.display_name, e);
            }
        }

        if handle.relay_started {
            if let Err(e) = self.relay.stop().await {
                first_err.get_or_insert(e);
            }
        }

        for process in handle.encoders.drain(..) {
            if let Err(e) = self.transcoder.stop(&process).await {
                warn!("Encoder for '{}' did not stop cleanly: {}", process.feed, e);
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop everything. Cancels a build in flight; a no-op when idle.
    pub async fn stop(&mut self) -> StreamResult<()> {
        self.stop_signal.cancel();
        let Some(handle) = self.active.take() else {
            self.set_state(PipelineState::Idle);
            return Ok(());
        };
        info!("Stopping {} pipeline", handle.pipeline.shape);
        self.set_state(PipelineState::Stopping);
        let result = self.teardown(handle).await;
        self.set_state(PipelineState::Idle);
        result
    }

    /// Poll encoders and relay while streaming; a fault goes to
    /// [`handle_fault`](Self::handle_fault).
    pub async fn check_health(&mut self) -> StreamResult<()> {
        if self.state != PipelineState::Streaming {
            return Ok(());
        }
        let Some(handle) = self.active.as_ref() else {
            return Ok(());
        };

        let mut fault = None;
        for process in &handle.encoders {
            match self.transcoder.health(process).await {
                EncoderHealth::Alive => {}
                EncoderHealth::Exited(code) => {
                    fault = Some(StreamError::EncoderExited {
                        feed: process.feed.clone(),
                        code,
                    });
                    break;
                }
                EncoderHealth::Unresponsive => {
                    warn!("Encoder for '{}' is not reporting progress", process.feed);
                }
            }
        }
        if fault.is_none() && !self.relay.is_live().await {
            fault = Some(StreamError::RelayDown);
        }

        match fault {
            Some(e) => self.handle_fault(e).await,
            None => Ok(()),
        }
    }

    /// Pipeline fault while streaming: tear down and rebuild once per user
    /// start. A second fault, or a failed rebuild, ends in `Idle`.
    pub async fn handle_fault(&mut self, fault: StreamError) -> StreamResult<()> {
        warn!("Pipeline fault: {}", fault);
        self.set_state(PipelineState::Failed(fault.to_string()));
        if let Some(handle) = self.active.take() {
            if let Err(e) = self.teardown(handle).await {
                warn!("Cleanup after fault: {}", e);
            }
        }

        let request = self.last_request.clone();
        match request {
            Some((selection, options)) if !self.rebuilt => {
                self.rebuilt = true;
                info!("Rebuilding pipeline once");
                let pipeline = match plan_pipeline(&selection, &self.registry, &self.config) {
                    Ok(p) => p,
                    Err(e) => {
                        self.set_state(PipelineState::Idle);
                        return Err(e);
                    }
                };
                self.build(pipeline, options).await
            }
            _ => {
                self.set_state(PipelineState::Idle);
                Err(fault)
            }
        }
    }

    /// Apply a volume level to every connected device
    pub async fn set_volume(&self, level_percent: u8) -> StreamResult<()> {
        let Some(handle) = self.active.as_ref() else {
            return Ok(());
        };
        let results = join_all(
            handle
                .sessions
                .iter()
                .map(|s| self.cast.set_volume(&s.device, level_percent)),
        )
        .await;
        results.into_iter().collect::<StreamResult<Vec<_>>>().map(|_| ())
    }

    /// User-chosen monitor delay
    pub async fn set_monitor_delay(&self, delay_ms: u32) -> StreamResult<()> {
        self.sync.set_manual_delay(delay_ms).await
    }

    /// Health-check on an interval until `shutdown` resolves, then stop.
    /// Returns the fault that ended streaming, if any.
    pub async fn supervise<F>(&mut self, shutdown: F) -> StreamResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(self.config.timeouts.health_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.check_health().await?;
                    if self.state == PipelineState::Idle {
                        return Ok(());
                    }
                }
            }
        }
        self.stop().await
    }
}
