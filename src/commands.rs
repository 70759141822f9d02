//! CLI Command Handlers
//!
//! Each handler takes its CLI args, the loaded config and Output, and returns
//! an ExitCode. Backend errors map onto exit codes through their kind.

use serde_json::json;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cli::{
    DevicesCmd, ExitCode, Output, ProbeCmd, ProbeResponse, StreamCmd, VolumeCmd, VolumeLevel,
    VolumeResponse,
};
use crate::config::Config;
use crate::error::StreamError;
use crate::models::SyncStatus;
use crate::orchestrator::{Collaborators, Orchestrator, OrchestratorEvent, StartOptions};
use crate::registry::DeviceRegistry;
use crate::stream::monitor::RestoreSlot;
use crate::stream::{
    CastClient, CastSessionController, DaemonCastClient, FfmpegTranscoder, HelperAudioControl,
    MediaMtxRelay, RttProbe, TcpRttProbe,
};

fn fail(output: &Output, e: &StreamError) -> ExitCode {
    let code = match e {
        StreamError::Config(_) | StreamError::InvalidSelection(_) => ExitCode::InvalidArgs,
        _ => ExitCode::from(e.kind()),
    };
    output.error(e.to_string(), code)
}

/// Spawn the cast helper and run one discovery scan
async fn scan(
    config: &Config,
    timeout_secs: Option<u64>,
    output: &Output,
) -> Result<(Arc<dyn CastClient>, Arc<DeviceRegistry>), StreamError> {
    let client: Arc<dyn CastClient> = Arc::new(DaemonCastClient::spawn(&config.cast).await?);
    let registry = Arc::new(DeviceRegistry::new(client.clone()));
    let timeout = Duration::from_secs(timeout_secs.unwrap_or(config.cast.discovery_timeout_secs));
    output.info(format!("Scanning for Cast devices ({}s)...", timeout.as_secs()));
    registry.scan(timeout).await?;
    Ok((client, registry))
}

// =============================================================================
// Devices Command
// =============================================================================

pub async fn devices_cmd(cmd: DevicesCmd, config: &Config, output: &Output) -> ExitCode {
    let registry = match scan(config, cmd.timeout, output).await {
        Ok((_, registry)) => registry,
        Err(e) => return fail(output, &e),
    };

    let devices = registry.devices();
    if devices.is_empty() {
        return output.error("No Cast devices found", ExitCode::DeviceNotFound);
    }

    if output.json {
        if let Err(e) = output.print(devices.as_slice()) {
            return output.error(format!("Failed to serialize: {}", e), ExitCode::Error);
        }
    } else {
        for device in devices.iter() {
            println!("{}  {}", device.id, device);
        }
    }
    ExitCode::Success
}

// =============================================================================
// Stream Command
// =============================================================================

fn report_event(event: &OrchestratorEvent, output: &Output) {
    if output.json {
        let line = match event {
            OrchestratorEvent::State(state) => json!({ "event": "state", "state": state }),
            OrchestratorEvent::ReceiverFallback { device, app_id } => {
                json!({ "event": "receiver_fallback", "device": device, "app_id": app_id })
            }
            OrchestratorEvent::Warning(message) => json!({ "event": "warning", "message": message }),
        };
        if let Err(e) = output.print_line(&line) {
            debug!("event not printed: {}", e);
        }
        return;
    }
    match event {
        OrchestratorEvent::State(state) => output.info(state),
        OrchestratorEvent::ReceiverFallback { device, app_id } => {
            output.info(format!("{} is playing through the generic receiver ({})", device, app_id))
        }
        OrchestratorEvent::Warning(message) => output.info(format!("Warning: {}", message)),
    }
}

fn report_sync(status: SyncStatus, output: &Output) {
    if output.json {
        let _ = output.print_line(&json!({ "event": "sync", "status": status }));
    } else {
        output.info(format!("Sync: {:?}", status).to_lowercase());
    }
}

/// Drive `work` to completion while printing orchestrator and sync events
async fn with_events<F: Future>(
    work: F,
    events: &mut mpsc::UnboundedReceiver<OrchestratorEvent>,
    sync: &mut watch::Receiver<SyncStatus>,
    output: &Output,
) -> F::Output {
    tokio::pin!(work);
    let result = loop {
        tokio::select! {
            result = &mut work => break result,
            Some(event) = events.recv() => report_event(&event, output),
            Ok(()) = sync.changed() => {
                let status = *sync.borrow_and_update();
                report_sync(status, output);
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        report_event(&event, output);
    }
    result
}

pub async fn stream_cmd(
    cmd: StreamCmd,
    config: &Config,
    host_ip: Option<IpAddr>,
    restore: RestoreSlot,
    output: &Output,
) -> ExitCode {
    let host = match config.resolve_host_ip(host_ip) {
        Ok(ip) => ip,
        Err(e) => return fail(output, &e),
    };
    output.info(format!("Advertising {} to receivers", host));

    let (client, registry) = match scan(config, cmd.timeout, output).await {
        Ok(found) => found,
        Err(e) => return fail(output, &e),
    };

    let stop_grace = config.timeouts.process_stop();
    let transcoder = match FfmpegTranscoder::detect(config.encoder.clone(), stop_grace).await {
        Ok(t) => t,
        Err(e) => return fail(output, &e),
    };
    output.info(format!("Capturing from '{}'", transcoder.capture_device()));

    let parts = Collaborators {
        registry,
        transcoder: Arc::new(transcoder),
        relay: Arc::new(MediaMtxRelay::new(
            config.relay.clone(),
            Duration::from_millis(config.timeouts.relay_start_ms),
            stop_grace,
        )),
        cast: Arc::new(CastSessionController::new(client, config.cast.clone())),
        probe: Arc::new(TcpRttProbe::new(Duration::from_millis(config.sync.probe_timeout_ms))),
        audio: Arc::new(HelperAudioControl::new(&config.monitor)),
    };
    let (mut orchestrator, mut events) = Orchestrator::new(config.clone(), host, parts, restore);
    let mut sync = orchestrator.sync_status();

    // Ctrl-C cancels a start in flight and ends supervision
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        let stop = orchestrator.stop_signal();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.cancel();
                shutdown.cancel();
            }
        });
    }

    let options = StartOptions {
        monitor: cmd.monitor,
        baseline_delay_ms: cmd.delay,
    };
    let started = with_events(
        orchestrator.start(cmd.selection(), options),
        &mut events,
        &mut sync,
        output,
    )
    .await;

    match started {
        Ok(()) => {}
        Err(StreamError::Cancelled) => {
            output.info("Stopped before streaming began");
            return ExitCode::Success;
        }
        Err(e) => return fail(output, &e),
    }

    if let Some(pipeline) = orchestrator.pipeline() {
        if output.json {
            if let Err(e) = output.print_line(&json!({ "event": "pipeline", "pipeline": pipeline })) {
                warn!("pipeline not printed: {}", e);
            }
        } else {
            let targets: Vec<String> = pipeline
                .targets
                .iter()
                .map(|t| format!("{} ({:?})", t.device.display_name, t.channel))
                .collect();
            output.info(format!("{} -> {}  (Ctrl-C to stop)", pipeline.shape, targets.join(", ")));
        }
    }

    let finished = with_events(
        orchestrator.supervise(shutdown.cancelled()),
        &mut events,
        &mut sync,
        output,
    )
    .await;

    match finished {
        Ok(()) => {
            output.info("Stopped");
            ExitCode::Success
        }
        Err(e) => fail(output, &e),
    }
}

// =============================================================================
// Volume Command
// =============================================================================

pub async fn volume_cmd(cmd: VolumeCmd, config: &Config, output: &Output) -> ExitCode {
    let level = cmd.parse_level();
    if let VolumeLevel::Invalid(s) = &level {
        return output.error(format!("Invalid volume level: {}", s), ExitCode::InvalidArgs);
    }

    let (client, registry) = match scan(config, None, output).await {
        Ok(found) => found,
        Err(e) => return fail(output, &e),
    };
    let device = match registry.require(&cmd.device) {
        Ok(d) => d,
        Err(e) => return fail(output, &e),
    };
    let controller = CastSessionController::new(client, config.cast.clone());

    let result = match level {
        VolumeLevel::Absolute(vol) => controller.set_volume(&device, vol).await,
        VolumeLevel::Relative(delta) => controller.adjust_volume(&device, delta).await,
        VolumeLevel::Mute => controller.mute(&device).await,
        VolumeLevel::Unmute => controller.unmute(&device).await,
        VolumeLevel::Invalid(_) => return ExitCode::InvalidArgs,
    };

    match result {
        Ok(state) => {
            let response = VolumeResponse {
                device: device.display_name.clone(),
                level: state.level_percent,
                muted: state.is_muted,
            };
            if let Err(e) = output.print(&response) {
                return output.error(format!("Failed to serialize: {}", e), ExitCode::Error);
            }
            ExitCode::Success
        }
        Err(e) => fail(output, &e),
    }
}

// =============================================================================
// Probe Command
// =============================================================================

fn median(samples: &[u32]) -> Option<u32> {
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    sorted.get(sorted.len() / 2).copied()
}

pub async fn probe_cmd(cmd: ProbeCmd, config: &Config, output: &Output) -> ExitCode {
    if cmd.count == 0 {
        return output.error("--count must be at least 1", ExitCode::InvalidArgs);
    }
    let (_, registry) = match scan(config, None, output).await {
        Ok(found) => found,
        Err(e) => return fail(output, &e),
    };
    let device = match registry.require(&cmd.device) {
        Ok(d) => d,
        Err(e) => return fail(output, &e),
    };

    let probe = TcpRttProbe::new(Duration::from_millis(config.sync.probe_timeout_ms));
    let interval = Duration::from_millis(config.sync.probe_interval_ms);
    let mut samples = Vec::new();
    let mut failures = 0;
    for i in 0..cmd.count {
        if i > 0 {
            tokio::time::sleep(interval).await;
        }
        match probe.probe(&device).await {
            Ok(rtt) => {
                output.info(format!("{}: {}ms", device.display_name, rtt));
                samples.push(rtt);
            }
            Err(e) => {
                output.info(format!("{}: {}", device.display_name, e));
                failures += 1;
            }
        }
    }

    if samples.is_empty() {
        return fail(output, &StreamError::DeviceUnreachable(device.display_name));
    }
    let response = ProbeResponse {
        device: device.display_name.clone(),
        median_ms: median(&samples),
        samples_ms: samples,
        failures,
    };
    if let Err(e) = output.print(&response) {
        return output.error(format!("Failed to serialize: {}", e), ExitCode::Error);
    }
    ExitCode::Success
}
