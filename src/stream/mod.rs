//! Streaming infrastructure
//!
//! - Encoder: ffmpeg subprocesses, one per audio feed
//! - Relay: MediaMTX plus the segment HTTP server
//! - Cast: receiver sessions and volume via the cast helper
//! - Sync: RTT-driven local monitor delay
//! - Monitor: local audio device control and crash restore

pub mod cast;
pub mod encoder;
pub mod monitor;
pub mod process;
pub mod relay;
pub mod sync;

pub use cast::{CastClient, CastSessionController, DaemonCastClient, Session};
pub use encoder::{EncoderHealth, FfmpegTranscoder, ProcessHandle, Transcoder};
pub use monitor::{AudioControl, HelperAudioControl, LocalMonitor};
pub use relay::{FeedRoute, MediaMtxRelay, Relay, RelayEndpoints};
pub use sync::{DelayController, RttProbe, SyncEngine, TcpRttProbe};
