//! Data structures shared across nestcast
//!
//! Organized by domain:
//! - **Devices**: discovered Cast targets and their capability class
//! - **Pipeline**: shape, targets, encoder specs and lifecycle state
//! - **Sync**: local-monitor delay bookkeeping
//! - **Volume**: per-device volume state

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Instant;
use uuid::Uuid;

/// Default Cast control port
pub const CAST_PORT: u16 = 8009;

// =============================================================================
// Device Models
// =============================================================================

/// Capability class of a playback target, decides pipeline shape and receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityClass {
    /// Audio-only device, accepts the real-time transport
    Speaker,
    /// Multi-device group
    Group,
    /// Screen device, needs the segmented transport
    Display,
}

impl fmt::Display for CapabilityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityClass::Speaker => write!(f, "speaker"),
            CapabilityClass::Group => write!(f, "group"),
            CapabilityClass::Display => write!(f, "display"),
        }
    }
}

/// Device record as reported by the cast helper, before classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDeviceInfo {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    pub ip: String,
    #[serde(default = "default_cast_port")]
    pub port: u16,
    /// Vendor type string ("audio", "cast", "group", ...)
    #[serde(default)]
    pub cast_type: Option<String>,
}

fn default_cast_port() -> u16 {
    CAST_PORT
}

/// A discovered playback target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable identifier (network address)
    pub id: String,
    pub display_name: String,
    pub class: CapabilityClass,
    pub address: IpAddr,
    pub port: u16,
    pub model: Option<String>,
    /// Ordered child devices, only for `Group`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_members: Vec<Device>,
}

impl Device {
    /// True when `key` matches the id or (case-insensitively) the name
    pub fn matches(&self, key: &str) -> bool {
        self.id == key || self.display_name.eq_ignore_ascii_case(key)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] - {}", self.display_name, self.class, self.address)?;
        if !self.group_members.is_empty() {
            let names: Vec<&str> = self
                .group_members
                .iter()
                .map(|m| m.display_name.as_str())
                .collect();
            write!(f, " ({})", names.join(", "))?;
        }
        Ok(())
    }
}

// =============================================================================
// Pipeline Models
// =============================================================================

/// What the user asked to stream to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// One device: speaker, display or group
    Single(String),
    /// Explicit left/right speaker pair
    Pair { left: String, right: String },
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::Single(id) => write!(f, "{}", id),
            Selection::Pair { left, right } => write!(f, "L={} R={}", left, right),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineShape {
    Mono,
    StereoSplit,
    Multicast,
    DisplayFallback,
}

impl PipelineShape {
    /// Real-time transport shapes (everything but the display fallback)
    pub fn is_realtime(self) -> bool {
        !matches!(self, PipelineShape::DisplayFallback)
    }
}

impl fmt::Display for PipelineShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineShape::Mono => "mono",
            PipelineShape::StereoSplit => "stereo-split",
            PipelineShape::Multicast => "multicast",
            PipelineShape::DisplayFallback => "display-fallback",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelAssignment {
    Left,
    Right,
    Both,
}

/// One device receiving one feed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    pub device: Device,
    pub channel: ChannelAssignment,
    /// Relay path of the feed this target plays
    pub feed: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelFilter {
    None,
    LeftOnly,
    RightOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// Opus over the real-time transport
    LowLatencyVoice,
    /// AAC in rolling HLS segments
    BroadCompat,
}

/// Contract for one encoder subprocess
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EncoderSpec {
    /// Relay path this feed is published under
    pub output_sink: String,
    pub source_channel_filter: ChannelFilter,
    pub codec: Codec,
    pub bitrate_kbps: u32,
    pub sample_rate_hz: u32,
    pub channel_count: u8,
}

/// Lifecycle state of the active pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Preparing,
    Streaming,
    Stopping,
    Failed(String),
}

impl PipelineState {
    pub fn is_active(&self) -> bool {
        matches!(self, PipelineState::Preparing | PipelineState::Streaming)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "Idle"),
            PipelineState::Preparing => write!(f, "Preparing..."),
            PipelineState::Streaming => write!(f, "▶ Streaming"),
            PipelineState::Stopping => write!(f, "Stopping..."),
            PipelineState::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

/// The active streaming configuration
#[derive(Debug, Clone, Serialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub shape: PipelineShape,
    pub targets: Vec<Target>,
    pub encoder_specs: Vec<EncoderSpec>,
    pub state: PipelineState,
}

impl Pipeline {
    /// Identity of the build: shape plus ordered (device, channel) pairs.
    /// Two start requests with equal signatures describe the same pipeline.
    pub fn signature(&self) -> String {
        let targets: Vec<String> = self
            .targets
            .iter()
            .map(|t| format!("{}:{:?}", t.device.id, t.channel))
            .collect();
        format!("{}|{}", self.shape, targets.join(","))
    }

    /// Targets that play the given feed
    pub fn targets_for<'a>(&'a self, feed: &'a str) -> impl Iterator<Item = &'a Target> + 'a {
        self.targets.iter().filter(move |t| t.feed == feed)
    }
}

// =============================================================================
// Sync Models
// =============================================================================

/// Local-monitor delay relationship
#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    pub baseline_rtt_ms: u32,
    pub baseline_delay_ms: u32,
    /// Value currently applied to the local monitor effect
    pub current_delay_ms: u32,
    pub last_measured_rtt_ms: Option<u32>,
    pub last_measured_at: Option<Instant>,
}

impl SyncState {
    pub fn new(baseline_rtt_ms: u32, baseline_delay_ms: u32) -> Self {
        Self {
            baseline_rtt_ms,
            baseline_delay_ms,
            current_delay_ms: baseline_delay_ms,
            last_measured_rtt_ms: None,
            last_measured_at: None,
        }
    }
}

/// Health of the sync engine as seen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Inactive,
    Active,
    /// Automatic adjustment paused after a manual delay change
    Manual,
    Degraded,
}

// =============================================================================
// Volume Models
// =============================================================================

/// Volume of one connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VolumeState {
    pub level_percent: u8,
    pub is_muted: bool,
    pub pre_mute_level: u8,
}

impl VolumeState {
    pub fn new(level_percent: u8) -> Self {
        let level = level_percent.min(100);
        Self {
            level_percent: level,
            is_muted: false,
            pre_mute_level: level,
        }
    }

    /// Set an absolute level; any level above zero clears mute
    pub fn set(&mut self, level_percent: u8) {
        self.level_percent = level_percent.min(100);
        if self.level_percent > 0 {
            self.is_muted = false;
        }
    }

    /// Apply a relative change, saturating at 0 and 100
    pub fn adjust(&mut self, delta: i16) -> u8 {
        let level = (self.level_percent as i16 + delta).clamp(0, 100) as u8;
        self.set(level);
        level
    }

    pub fn mute(&mut self) {
        if !self.is_muted {
            self.pre_mute_level = self.level_percent;
            self.level_percent = 0;
            self.is_muted = true;
        }
    }

    /// Restore the level remembered at mute time
    pub fn unmute(&mut self) -> u8 {
        if self.is_muted {
            self.level_percent = self.pre_mute_level;
            self.is_muted = false;
        }
        self.level_percent
    }
}

impl Default for VolumeState {
    fn default() -> Self {
        Self::new(50)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
