//! nestcast - desktop audio to Google Cast speakers, groups and TVs
//!
//! Captures system audio with ffmpeg, republishes it through a local MediaMTX
//! relay and drives Cast receivers to play it, with a sync engine that keeps
//! a local monitor output aligned with the remote speaker.
//!
//! # Modules
//!
//! - `models` - Devices, pipelines, sync and volume state
//! - `registry` - Discovery snapshot and capability classification
//! - `stream` - Encoder, relay, cast, sync and local monitor components
//! - `orchestrator` - Pipeline state machine
//! - `cli` / `commands` - Command line surface

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod stream;

// Re-export commonly used types
pub use error::{ErrorKind, StreamError, StreamResult};
pub use models::{
    CapabilityClass, ChannelAssignment, ChannelFilter, Codec, Device, EncoderSpec, Pipeline,
    PipelineShape, PipelineState, RawDeviceInfo, Selection, SyncState, SyncStatus, Target,
    VolumeState,
};
pub use orchestrator::{Orchestrator, OrchestratorEvent, StartOptions};
pub use registry::DeviceRegistry;
