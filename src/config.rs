//! Configuration management for nestcast
//!
//! Config is stored at ~/.config/nestcast/config.toml. Every tuning constant
//! (timeouts, probe interval, delay rounding) lives here with its default.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::StreamError;

/// Custom receiver able to play the real-time feed
pub const REALTIME_RECEIVER_APP_ID: &str = "FCAA4619";
/// Cast's built-in Default Media Receiver
pub const DEFAULT_MEDIA_RECEIVER_APP_ID: &str = "CC1AD845";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub relay: RelayConfig,
    pub encoder: EncoderConfig,
    pub cast: CastConfig,
    pub sync: SyncConfig,
    pub monitor: MonitorConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address advertised to remote devices
    pub host_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay binary (MediaMTX)
    pub binary: String,
    /// Ingress for encoder output
    pub rtsp_port: u16,
    /// Real-time egress to receivers
    pub webrtc_port: u16,
    /// Liveness / session API
    pub api_port: u16,
    /// Plain HTTP egress for segment files
    pub segment_port: u16,
    /// Per-reader write-ahead queue on the real-time path
    pub write_queue_size: u32,
    /// Where segmented feeds are written (defaults to the cache dir)
    pub segment_dir: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            binary: "mediamtx".to_string(),
            rtsp_port: 8554,
            webrtc_port: 8889,
            api_port: 9997,
            segment_port: 8090,
            write_queue_size: 64,
            segment_dir: None,
        }
    }
}

impl RelayConfig {
    pub fn segment_root(&self) -> PathBuf {
        self.segment_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join("nestcast")
                .join("segments")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub ffmpeg: String,
    /// ffmpeg input format for the capture source (dshow, pulse, avfoundation)
    pub capture_format: String,
    /// Explicit capture device; detected from `preferred_devices` when unset
    pub capture_device: Option<String>,
    pub preferred_devices: Vec<String>,
    pub realtime_bitrate_kbps: u32,
    pub segmented_bitrate_kbps: u32,
    pub sample_rate_hz: u32,
    pub segment_seconds: f32,
    pub segment_window: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            capture_format: default_capture_format().to_string(),
            capture_device: None,
            preferred_devices: vec![
                "virtual-audio-capturer".to_string(),
                "CABLE Output (VB-Audio Virtual Cable)".to_string(),
            ],
            realtime_bitrate_kbps: 128,
            segmented_bitrate_kbps: 128,
            sample_rate_hz: 48_000,
            segment_seconds: 2.0,
            segment_window: 5,
        }
    }
}

fn default_capture_format() -> &'static str {
    if cfg!(target_os = "windows") {
        "dshow"
    } else if cfg!(target_os = "macos") {
        "avfoundation"
    } else {
        "pulse"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CastConfig {
    /// Command line of the cast helper daemon (JSON lines on stdin/stdout)
    pub helper: Vec<String>,
    pub realtime_app_id: String,
    pub display_app_id: String,
    pub generic_app_id: String,
    pub receiver_timeout_ms: u64,
    /// Per-call timeout for helper requests
    pub call_timeout_ms: u64,
    pub discovery_timeout_secs: u64,
    /// Pause between quit and chime launch on disconnect
    pub chime_pause_ms: u64,
    /// How long the chime receiver stays up
    pub chime_hold_ms: u64,
}

impl Default for CastConfig {
    fn default() -> Self {
        Self {
            helper: vec!["nestcast-cast-helper".to_string()],
            realtime_app_id: REALTIME_RECEIVER_APP_ID.to_string(),
            display_app_id: REALTIME_RECEIVER_APP_ID.to_string(),
            generic_app_id: DEFAULT_MEDIA_RECEIVER_APP_ID.to_string(),
            receiver_timeout_ms: 10_000,
            call_timeout_ms: 15_000,
            discovery_timeout_secs: 12,
            chime_pause_ms: 300,
            chime_hold_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub adjustment_threshold_ms: u32,
    pub rounding_step_ms: u32,
    pub max_delay_ms: u32,
    /// Automatic adjustment pause after a manual delay change
    pub manual_grace_ms: u64,
    pub failure_threshold: u32,
    /// Pause before probing resumes once degraded
    pub degraded_backoff_ms: u64,
    pub default_delay_ms: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 500,
            probe_timeout_ms: 400,
            adjustment_threshold_ms: 10,
            rounding_step_ms: 50,
            max_delay_ms: 2_000,
            manual_grace_ms: 5_000,
            failure_threshold: 5,
            degraded_backoff_ms: 5_000,
            default_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Local output that mirrors the capture source (defaults to the
    /// output that was the system default before streaming)
    pub device: Option<String>,
    /// Output made the system default while streaming, so desktop audio
    /// reaches the capture source
    pub capture_sink: Option<String>,
    /// Command line of the local audio-control helper
    pub helper: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            device: None,
            capture_sink: None,
            helper: vec!["nestcast-audio-helper".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub output_wait_ms: u64,
    pub output_grace_ms: u64,
    pub process_stop_ms: u64,
    pub health_interval_ms: u64,
    pub relay_start_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            output_wait_ms: 7_000,
            output_grace_ms: 3_000,
            process_stop_ms: 3_000,
            health_interval_ms: 1_000,
            relay_start_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn output_wait(&self) -> Duration {
        Duration::from_millis(self.output_wait_ms)
    }

    pub fn output_grace(&self) -> Duration {
        Duration::from_millis(self.output_grace_ms)
    }

    pub fn process_stop(&self) -> Duration {
        Duration::from_millis(self.process_stop_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}

impl Config {
    /// Get config file path (~/.config/nestcast/config.toml)
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("nestcast").join("config.toml"))
    }

    /// Load config from file, or return default if not found
    pub fn load() -> Self {
        Self::path().map(|p| Self::load_from(&p)).unwrap_or_default()
    }

    /// Load from an explicit path, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str(&s) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Ignoring malformed config {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        let path = Self::path().ok_or_else(|| anyhow::anyhow!("Could not determine config path"))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Resolve the address advertised to remote devices.
    ///
    /// Fallback chain:
    /// 1. Explicit override (CLI flag)
    /// 2. `network.host_ip` from the config file
    /// 3. Address of the primary route's interface
    pub fn resolve_host_ip(&self, override_ip: Option<IpAddr>) -> Result<IpAddr, StreamError> {
        let ip = match override_ip.or(self.network.host_ip) {
            Some(ip) => ip,
            None => local_ip_address::local_ip()
                .map_err(|e| StreamError::Config(format!("cannot determine host address: {}", e)))?,
        };
        validate_host_ip(ip)?;
        Ok(ip)
    }
}

/// Reject addresses a remote device can never reach
pub fn validate_host_ip(ip: IpAddr) -> Result<(), StreamError> {
    let unusable = match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_unspecified() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    };
    if unusable {
        return Err(StreamError::Config(format!(
            "host address {} is not reachable from the network; set network.host_ip",
            ip
        )));
    }
    Ok(())
}
