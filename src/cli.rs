//! CLI - Command Line Interface for nestcast
//!
//! Every command prints JSON with `--json` (the default
//! when stdout is not a terminal) and maps failures onto stable exit codes.
//!
//! # Examples
//!
//! ```bash
//! # Find speakers
//! nestcast devices --timeout 8
//!
//! # Stream to one speaker, or split stereo across two
//! nestcast stream "Kitchen"
//! nestcast stream "Left Shelf" "Right Shelf" --monitor --delay 250
//!
//! # Volume and RTT
//! nestcast volume Kitchen +10
//! nestcast probe Kitchen --count 5
//! ```

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::error::ErrorKind;
use crate::models::Selection;

// =============================================================================
// Exit Codes
// =============================================================================

/// Exit codes for CLI operations (semantic for scripting)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success
    Success = 0,
    /// General error
    Error = 1,
    /// Invalid arguments
    InvalidArgs = 2,
    /// Discovery or network error
    NetworkError = 3,
    /// Device unreachable or not found
    DeviceNotFound = 4,
    /// Relay could not bind its ports
    BindFailed = 5,
    /// Receiver launch or cast call failed
    CastFailed = 6,
    /// Encoder failed to start or exited
    EncoderFailed = 7,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> std::process::ExitCode {
        std::process::ExitCode::from(code as u8)
    }
}

impl From<ErrorKind> for ExitCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Discovery => ExitCode::NetworkError,
            ErrorKind::Unreachable => ExitCode::DeviceNotFound,
            ErrorKind::Bind => ExitCode::BindFailed,
            ErrorKind::Receiver => ExitCode::CastFailed,
            ErrorKind::Encoder => ExitCode::EncoderFailed,
            ErrorKind::Sync | ErrorKind::Cancelled | ErrorKind::Other => ExitCode::Error,
        }
    }
}

// =============================================================================
// Main CLI Structure
// =============================================================================

/// nestcast - stream desktop audio to Cast speakers, groups and TVs
#[derive(Parser, Debug)]
#[command(
    name = "nestcast",
    version,
    about = "Stream desktop audio to Google Cast speakers, groups and TVs",
    long_about = "Captures system audio, encodes it with ffmpeg, relays it through a local \
                  MediaMTX instance and drives Cast receivers to play it.\n\n\
                  Speakers and groups get a low-latency real-time stream; TVs and \
                  displays get segmented HLS.",
    after_help = "EXAMPLES:\n\
                  nestcast devices                       List devices on the network\n\
                  nestcast stream Kitchen                Mono to one speaker\n\
                  nestcast stream Left Right --monitor   Stereo pair with synced local monitor\n\
                  nestcast volume Kitchen 40             Set volume"
)]
pub struct Cli {
    /// Output format as JSON (default for non-TTY)
    #[arg(long, short = 'j', global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Debug logging
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Address advertised to remote devices (overrides config and auto-detect)
    #[arg(long, global = true)]
    pub host_ip: Option<IpAddr>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Check if JSON output should be used
    pub fn should_json(&self) -> bool {
        self.json || !std::io::stdout().is_terminal()
    }
}

// =============================================================================
// Subcommands
// =============================================================================

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List Cast devices on the network
    #[command(visible_alias = "dev")]
    Devices(DevicesCmd),

    /// Stream desktop audio until interrupted
    #[command(visible_alias = "s")]
    Stream(StreamCmd),

    /// Set, adjust or mute a device's volume
    #[command(visible_alias = "vol")]
    Volume(VolumeCmd),

    /// Measure round-trip time to a device
    Probe(ProbeCmd),
}

// =============================================================================
// Devices Command
// =============================================================================

/// Scan for Cast devices
#[derive(Args, Debug)]
pub struct DevicesCmd {
    /// Scan timeout in seconds (config default when omitted)
    #[arg(long, short = 't')]
    pub timeout: Option<u64>,
}

// =============================================================================
// Stream Command
// =============================================================================

/// Stream to one device, a group, or a left/right speaker pair
#[derive(Args, Debug)]
pub struct StreamCmd {
    /// Device id or name (the left speaker when RIGHT is given)
    #[arg(required = true)]
    pub device: String,

    /// Right speaker of a stereo pair
    pub right: Option<String>,

    /// Keep a local output in sync with the remote speaker
    #[arg(long, short = 'm')]
    pub monitor: bool,

    /// Baseline local monitor delay in milliseconds
    #[arg(long, short = 'd')]
    pub delay: Option<u32>,

    /// Discovery timeout in seconds before streaming
    #[arg(long, short = 't')]
    pub timeout: Option<u64>,
}

impl StreamCmd {
    pub fn selection(&self) -> Selection {
        match &self.right {
            Some(right) => Selection::Pair {
                left: self.device.clone(),
                right: right.clone(),
            },
            None => Selection::Single(self.device.clone()),
        }
    }
}

// =============================================================================
// Volume Command
// =============================================================================

/// Set volume level
#[derive(Args, Debug)]
pub struct VolumeCmd {
    /// Device id or name
    #[arg(required = true)]
    pub device: String,

    /// Volume level (0-100), relative (+/- N), `mute` or `unmute`
    #[arg(required = true, allow_hyphen_values = true)]
    pub level: String,
}

impl VolumeCmd {
    /// Parse the volume argument
    pub fn parse_level(&self) -> VolumeLevel {
        let s = self.level.trim();
        if s.eq_ignore_ascii_case("mute") {
            return VolumeLevel::Mute;
        }
        if s.eq_ignore_ascii_case("unmute") {
            return VolumeLevel::Unmute;
        }
        if let Some(stripped) = s.strip_prefix('+') {
            if let Ok(delta) = stripped.parse::<i16>() {
                return VolumeLevel::Relative(delta.min(100));
            }
        } else if let Some(stripped) = s.strip_prefix('-') {
            if let Ok(delta) = stripped.parse::<i16>() {
                return VolumeLevel::Relative(-delta.min(100));
            }
        } else if let Ok(vol) = s.parse::<u8>() {
            return VolumeLevel::Absolute(vol.min(100));
        } else if s.parse::<u32>().is_ok() {
            return VolumeLevel::Absolute(100);
        }
        VolumeLevel::Invalid(self.level.clone())
    }
}

/// Parsed volume level
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeLevel {
    /// Absolute volume (0-100)
    Absolute(u8),
    /// Relative volume change
    Relative(i16),
    Mute,
    Unmute,
    /// Invalid level string
    Invalid(String),
}

// =============================================================================
// Probe Command
// =============================================================================

/// Sample round-trip time to a device
#[derive(Args, Debug)]
pub struct ProbeCmd {
    /// Device id or name
    #[arg(required = true)]
    pub device: String,

    /// Number of samples
    #[arg(long, short = 'n', default_value = "5")]
    pub count: u32,
}

// =============================================================================
// JSON Output Types
// =============================================================================

/// Generic JSON output wrapper with status
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonOutput<T: Serialize> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub exit_code: i32,
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

impl<T: Serialize> JsonOutput<T> {
    /// Create success output with data
    pub fn success(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
            exit_code: 0,
        }
    }

    /// Create error output (no data)
    pub fn error_msg(msg: impl Into<String>, code: ExitCode) -> JsonOutput<()> {
        JsonOutput::<()> {
            data: None,
            error: Some(msg.into()),
            exit_code: code.into(),
        }
    }
}

/// Volume change response
#[derive(Debug, Serialize, Deserialize)]
pub struct VolumeResponse {
    pub device: String,
    pub level: u8,
    pub muted: bool,
}

/// RTT probe response
#[derive(Debug, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub device: String,
    pub samples_ms: Vec<u32>,
    pub failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub median_ms: Option<u32>,
}

// =============================================================================
// Output Helpers
// =============================================================================

/// Output handler for consistent formatting
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    pub fn new(cli: &Cli) -> Self {
        Self {
            json: cli.should_json(),
            quiet: cli.quiet,
        }
    }

    /// Print success data
    pub fn print<T: Serialize>(&self, data: T) -> anyhow::Result<()> {
        if self.json {
            let output = JsonOutput::success(data);
            println!("{}", serde_json::to_string_pretty(&output)?);
        } else {
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Ok(())
    }

    /// One JSON object per line, for streams of events
    pub fn print_line<T: Serialize>(&self, data: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string(data)?);
        Ok(())
    }

    /// Print error and return exit code
    pub fn error(&self, msg: impl Into<String>, code: ExitCode) -> ExitCode {
        let msg = msg.into();
        if self.json {
            let output = JsonOutput::<()>::error_msg(&msg, code);
            if let Ok(json) = serde_json::to_string_pretty(&output) {
                eprintln!("{}", json);
            }
        } else if !self.quiet {
            eprintln!("Error: {}", msg);
        }
        code
    }

    /// Print info message (suppressed in quiet mode)
    pub fn info(&self, msg: impl std::fmt::Display) {
        if !self.quiet && !self.json {
            eprintln!("{}", msg);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
