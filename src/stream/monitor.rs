//! Local monitor output
//!
//! While streaming, desktop audio can also play on a local output (the
//! "monitor"), delayed to line up with the remote speaker. The OS-level
//! work is delegated to an audio-control helper invoked once per call:
//!
//! ```text
//! nestcast-audio-helper get-default
//! nestcast-audio-helper set-default <device>
//! nestcast-audio-helper mirror <source> <target> on|off
//! nestcast-audio-helper set-delay <endpoint> <ms>
//! nestcast-audio-helper get-delay <endpoint>
//! ```
//!
//! Each prints one JSON object (`{"success": true, ...}`) on stdout.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::{StreamError, StreamResult};

/// Local audio device control
#[async_trait]
pub trait AudioControl: Send + Sync {
    async fn default_output(&self) -> StreamResult<String>;
    async fn set_default_output(&self, device: &str) -> StreamResult<()>;
    /// Enable or disable mirroring `source`'s output onto `target`
    async fn set_mirror(&self, source: &str, target: &str, enabled: bool) -> StreamResult<()>;
    async fn set_delay(&self, endpoint: &str, delay_ms: u32) -> StreamResult<()>;
    async fn delay(&self, endpoint: &str) -> StreamResult<u32>;
}

#[derive(Debug, Default, Deserialize)]
struct HelperReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    device: Option<String>,
    #[serde(default)]
    delay_ms: Option<u32>,
}

fn parse_reply(verb: &str, stdout: &[u8]) -> StreamResult<HelperReply> {
    let text = String::from_utf8_lossy(stdout);
    let line = text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
    let reply: HelperReply = serde_json::from_str(line)
        .map_err(|e| StreamError::AudioControl(format!("{}: unreadable reply ({})", verb, e)))?;
    if !reply.success {
        return Err(StreamError::AudioControl(format!(
            "{}: {}",
            verb,
            reply.error.as_deref().unwrap_or("failed")
        )));
    }
    Ok(reply)
}

// =============================================================================
// Helper-backed Control
// =============================================================================

/// [`AudioControl`] running the configured helper command
pub struct HelperAudioControl {
    helper: Vec<String>,
    timeout: Duration,
}

impl HelperAudioControl {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            helper: config.helper.clone(),
            timeout: Duration::from_secs(5),
        }
    }

    async fn run(&self, args: &[&str]) -> StreamResult<HelperReply> {
        let (program, base) = self
            .helper
            .split_first()
            .ok_or_else(|| StreamError::Config("monitor.helper is empty".to_string()))?;
        let verb = args.first().copied().unwrap_or_default();

        let output = Command::new(program)
            .args(base)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| StreamError::AudioControl(format!("{}: helper timed out", verb)))?
            .map_err(|source| StreamError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(target: "nestcast::audio_helper", "{}", stderr.trim());
        }
        parse_reply(verb, &output.stdout)
    }
}

#[async_trait]
impl AudioControl for HelperAudioControl {
    async fn default_output(&self) -> StreamResult<String> {
        self.run(&["get-default"])
            .await?
            .device
            .ok_or_else(|| StreamError::AudioControl("get-default: no device".to_string()))
    }

    async fn set_default_output(&self, device: &str) -> StreamResult<()> {
        self.run(&["set-default", device]).await.map(|_| ())
    }

    async fn set_mirror(&self, source: &str, target: &str, enabled: bool) -> StreamResult<()> {
        let state = if enabled { "on" } else { "off" };
        self.run(&["mirror", source, target, state]).await.map(|_| ())
    }

    async fn set_delay(&self, endpoint: &str, delay_ms: u32) -> StreamResult<()> {
        let ms = delay_ms.to_string();
        self.run(&["set-delay", endpoint, ms.as_str()])
            .await
            .map(|_| ())
    }

    async fn delay(&self, endpoint: &str) -> StreamResult<u32> {
        Ok(self.run(&["get-delay", endpoint]).await?.delay_ms.unwrap_or(0))
    }
}

// =============================================================================
// Crash Restore
// =============================================================================

/// What must be undone if the process dies while streaming
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestorePlan {
    pub helper: Vec<String>,
    pub original_output: Option<String>,
    /// Endpoint carrying a delay and mirror relationship
    pub monitor: Option<(String, String)>,
}

impl RestorePlan {
    /// Synchronous best-effort restore, safe to call from a panic hook
    pub fn restore_blocking(&self) {
        let Some((program, base)) = self.helper.split_first() else {
            return;
        };
        let run = |args: &[&str]| {
            let _ = std::process::Command::new(program)
                .args(base)
                .args(args)
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status();
        };
        if let Some((source, endpoint)) = &self.monitor {
            run(&["set-delay", endpoint.as_str(), "0"]);
            run(&["mirror", source.as_str(), endpoint.as_str(), "off"]);
        }
        if let Some(original) = &self.original_output {
            run(&["set-default", original.as_str()]);
        }
    }
}

/// Shared slot read by the panic hook
pub type RestoreSlot = Arc<Mutex<Option<RestorePlan>>>;

pub fn restore_slot() -> RestoreSlot {
    Arc::new(Mutex::new(None))
}

/// Run whatever restore is pending and clear the slot
pub fn restore_now(slot: &RestoreSlot) {
    let plan = match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(plan) = plan {
        plan.restore_blocking();
    }
}

// =============================================================================
// Local Monitor
// =============================================================================

/// Active monitor arrangement: capture sink as default output, mirrored onto
/// the local monitor device
pub struct LocalMonitor {
    audio: Arc<dyn AudioControl>,
    config: MonitorConfig,
    slot: RestoreSlot,
    original_output: Option<String>,
    mirror: Option<(String, String)>,
}

impl LocalMonitor {
    pub fn new(audio: Arc<dyn AudioControl>, config: MonitorConfig, slot: RestoreSlot) -> Self {
        Self {
            audio,
            config,
            slot,
            original_output: None,
            mirror: None,
        }
    }

    /// Endpoint the sync engine applies its delay to
    pub fn endpoint(&self) -> Option<&str> {
        self.mirror.as_ref().map(|(_, target)| target.as_str())
    }

    /// Route desktop audio to the capture sink and mirror it locally.
    /// Returns the monitor endpoint.
    pub async fn enable(&mut self) -> StreamResult<String> {
        let original = self.audio.default_output().await?;
        let monitor = self.config.device.clone().unwrap_or_else(|| original.clone());
        let source = self.config.capture_sink.clone().unwrap_or_else(|| original.clone());

        if source != original {
            self.audio.set_default_output(&source).await?;
            self.original_output = Some(original.clone());
            self.publish();
        }
        if source != monitor {
            self.audio.set_mirror(&source, &monitor, true).await?;
        }
        self.mirror = Some((source, monitor.clone()));
        self.publish();

        info!("Local monitor on '{}'", monitor);
        Ok(monitor)
    }

    /// Zero the delay, drop the mirror and restore the original default
    /// output. Every step is attempted; the first error is returned.
    pub async fn disable(&mut self) -> StreamResult<()> {
        let mut first_err = None;
        if let Some((source, monitor)) = self.mirror.take() {
            if let Err(e) = self.audio.set_delay(&monitor, 0).await {
                warn!("Could not reset monitor delay: {}", e);
                first_err.get_or_insert(e);
            }
            if source != monitor {
                if let Err(e) = self.audio.set_mirror(&source, &monitor, false).await {
                    warn!("Could not remove monitor mirror: {}", e);
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(original) = self.original_output.take() {
            if let Err(e) = self.audio.set_default_output(&original).await {
                warn!("Could not restore default output '{}': {}", original, e);
                first_err.get_or_insert(e);
            }
        }
        self.publish();
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn publish(&self) {
        let plan = if self.original_output.is_none() && self.mirror.is_none() {
            None
        } else {
            Some(RestorePlan {
                helper: self.config.helper.clone(),
                original_output: self.original_output.clone(),
                monitor: self.mirror.clone(),
            })
        };
        match self.slot.lock() {
            Ok(mut guard) => *guard = plan,
            Err(poisoned) => *poisoned.into_inner() = plan,
        }
    }
}
