//! Transcode process manager
//!
//! One ffmpeg subprocess per [`EncoderSpec`], reading the capture source and
//! writing either to the relay's RTSP ingress (real-time) or to a rolling HLS
//! directory (segmented).

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EncoderConfig;
use crate::error::{StreamError, StreamResult};
use crate::models::{ChannelFilter, Codec, EncoderSpec};
use crate::stream::process::{forward_output, terminate};
use crate::stream::relay::{FeedRoute, PLAYLIST_NAME};

/// Resampling that keeps output timestamps monotonic under jittery input
pub const MONOTONIC_RESAMPLE: &str = "aresample=async=1:first_pts=0";

/// Opaque reference to a running encoder
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pub id: u64,
    pub feed: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderHealth {
    Alive,
    Exited(Option<i32>),
    /// Running but no progress reported recently
    Unresponsive,
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn start(&self, spec: &EncoderSpec, route: &FeedRoute) -> StreamResult<ProcessHandle>;
    /// Terminate and block until the OS confirms exit
    async fn stop(&self, handle: &ProcessHandle) -> StreamResult<()>;
    async fn health(&self, handle: &ProcessHandle) -> EncoderHealth;
}

// =============================================================================
// ffmpeg Transcoder
// =============================================================================

struct ManagedProcess {
    child: Child,
    last_progress: Arc<Mutex<Instant>>,
}

/// [`Transcoder`] driving ffmpeg
pub struct FfmpegTranscoder {
    config: EncoderConfig,
    capture_device: String,
    stop_grace: Duration,
    stall_after: Duration,
    next_id: AtomicU64,
    processes: tokio::sync::Mutex<HashMap<u64, ManagedProcess>>,
}

impl FfmpegTranscoder {
    /// Create with an already resolved capture device
    pub fn new(config: EncoderConfig, capture_device: impl Into<String>, stop_grace: Duration) -> Self {
        Self {
            config,
            capture_device: capture_device.into(),
            stop_grace,
            stall_after: Duration::from_secs(10),
            next_id: AtomicU64::new(1),
            processes: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the capture device from config, probing when unset
    pub async fn detect(config: EncoderConfig, stop_grace: Duration) -> StreamResult<Self> {
        let device = match &config.capture_device {
            Some(device) => device.clone(),
            None => detect_capture_device(&config).await?,
        };
        info!("Capture device: {}", device);
        Ok(Self::new(config, device, stop_grace))
    }

    pub fn capture_device(&self) -> &str {
        &self.capture_device
    }

    /// Number of encoder processes still tracked
    pub async fn running(&self) -> usize {
        self.processes.lock().await.len()
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn start(&self, spec: &EncoderSpec, route: &FeedRoute) -> StreamResult<ProcessHandle> {
        let args = build_args(spec, route, &self.config, &self.capture_device)?;
        debug!("ffmpeg {}", args.join(" "));

        let mut child = Command::new(&self.config.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StreamError::Spawn {
                program: self.config.ffmpeg.clone(),
                source,
            })?;

        let last_progress = Arc::new(Mutex::new(Instant::now()));
        if let Some(stdout) = child.stdout.take() {
            let progress = last_progress.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.starts_with("progress=") {
                        *progress.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(format!("encoder:{}", spec.output_sink), stderr);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.processes
            .lock()
            .await
            .insert(id, ManagedProcess { child, last_progress });

        info!(
            "Encoder started for '{}' ({:?}, {} kbps, {} ch)",
            spec.output_sink, spec.codec, spec.bitrate_kbps, spec.channel_count
        );
        Ok(ProcessHandle {
            id,
            feed: spec.output_sink.clone(),
        })
    }

    async fn stop(&self, handle: &ProcessHandle) -> StreamResult<()> {
        let process = self.processes.lock().await.remove(&handle.id);
        if let Some(mut process) = process {
            let code = terminate(&mut process.child, self.stop_grace).await?;
            info!("Encoder for '{}' stopped ({:?})", handle.feed, code);
        }
        Ok(())
    }

    async fn health(&self, handle: &ProcessHandle) -> EncoderHealth {
        let mut processes = self.processes.lock().await;
        let Some(process) = processes.get_mut(&handle.id) else {
            return EncoderHealth::Exited(None);
        };
        match process.child.try_wait() {
            Ok(Some(status)) => EncoderHealth::Exited(status.code()),
            Ok(None) => {
                let last = *process.last_progress.lock().unwrap_or_else(|p| p.into_inner());
                if last.elapsed() > self.stall_after {
                    EncoderHealth::Unresponsive
                } else {
                    EncoderHealth::Alive
                }
            }
            Err(e) => {
                warn!("encoder status query failed: {}", e);
                EncoderHealth::Unresponsive
            }
        }
    }
}

// =============================================================================
// Command Line
// =============================================================================

fn input_arg(format: &str, device: &str) -> String {
    match format {
        "dshow" => format!("audio={}", device),
        _ => device.to_string(),
    }
}

fn audio_filter(filter: ChannelFilter) -> String {
    match filter {
        ChannelFilter::None => MONOTONIC_RESAMPLE.to_string(),
        ChannelFilter::LeftOnly => format!("{},pan=mono|c0=FL", MONOTONIC_RESAMPLE),
        ChannelFilter::RightOnly => format!("{},pan=mono|c0=FR", MONOTONIC_RESAMPLE),
    }
}

/// Full ffmpeg argument list for one feed
pub fn build_args(
    spec: &EncoderSpec,
    route: &FeedRoute,
    config: &EncoderConfig,
    capture_device: &str,
) -> StreamResult<Vec<String>> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "warning".into(),
        "-nostats".into(),
        "-progress".into(),
        "pipe:1".into(),
    ];

    if spec.codec == Codec::LowLatencyVoice {
        args.extend(
            ["-fflags", "+genpts+nobuffer", "-flags", "low_delay", "-probesize", "32", "-analyzeduration", "0"]
                .map(String::from),
        );
    }
    if config.capture_format == "dshow" {
        args.extend(["-audio_buffer_size", "50"].map(String::from));
    }

    args.extend([
        "-f".into(),
        config.capture_format.clone(),
        "-i".into(),
        input_arg(&config.capture_format, capture_device),
        "-vn".into(),
        "-af".into(),
        audio_filter(spec.source_channel_filter),
        "-ac".into(),
        spec.channel_count.to_string(),
        "-ar".into(),
        spec.sample_rate_hz.to_string(),
    ]);

    match (spec.codec, route) {
        (Codec::LowLatencyVoice, FeedRoute::Rtsp(url)) => {
            args.extend(
                [
                    "-c:a", "libopus", "-application", "lowdelay", "-frame_duration", "10",
                ]
                .map(String::from),
            );
            args.extend([
                "-b:a".into(),
                format!("{}k", spec.bitrate_kbps),
                "-max_delay".into(),
                "0".into(),
                "-muxdelay".into(),
                "0".into(),
                "-f".into(),
                "rtsp".into(),
                "-rtsp_transport".into(),
                "tcp".into(),
                url.clone(),
            ]);
        }
        (Codec::BroadCompat, FeedRoute::SegmentDir(dir)) => {
            args.extend([
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                format!("{}k", spec.bitrate_kbps),
                "-f".into(),
                "hls".into(),
                "-hls_time".into(),
                format!("{}", config.segment_seconds),
                "-hls_list_size".into(),
                config.segment_window.to_string(),
                "-hls_flags".into(),
                "delete_segments+independent_segments".into(),
                "-hls_segment_filename".into(),
                dir.join("segment%05d.ts").to_string_lossy().into_owned(),
                dir.join(PLAYLIST_NAME).to_string_lossy().into_owned(),
            ]);
        }
        (codec, route) => {
            return Err(StreamError::Config(format!(
                "feed '{}' routed as {:?} cannot carry {:?}",
                spec.output_sink, route, codec
            )))
        }
    }

    Ok(args)
}

// =============================================================================
// Capture Device Detection
// =============================================================================

/// Audio devices from `ffmpeg -list_devices true -f dshow -i dummy` output
pub fn parse_dshow_devices(output: &str) -> Vec<String> {
    let Ok(name) = Regex::new(r#""([^"]+)""#) else {
        return vec![];
    };
    output
        .lines()
        .filter(|line| line.contains("(audio)"))
        .filter_map(|line| name.captures(line).map(|c| c[1].to_string()))
        .collect()
}

/// First device matching the preference list (case-insensitive substring)
pub fn pick_capture_device(devices: &[String], preferred: &[String]) -> Option<String> {
    preferred.iter().find_map(|want| {
        let want = want.to_lowercase();
        devices
            .iter()
            .find(|d| d.to_lowercase().contains(&want))
            .cloned()
    })
}

async fn detect_capture_device(config: &EncoderConfig) -> StreamResult<String> {
    match config.capture_format.as_str() {
        "dshow" => {
            let output = Command::new(&config.ffmpeg)
                .args(["-hide_banner", "-list_devices", "true", "-f", "dshow", "-i", "dummy"])
                .output()
                .await
                .map_err(|source| StreamError::Spawn {
                    program: config.ffmpeg.clone(),
                    source,
                })?;
            // ffmpeg prints the listing on stderr and exits non-zero
            let listing = String::from_utf8_lossy(&output.stderr);
            let devices = parse_dshow_devices(&listing);
            debug!("capture devices: {:?}", devices);
            pick_capture_device(&devices, &config.preferred_devices).ok_or_else(|| {
                StreamError::Config(format!(
                    "no capture device matching {:?}; set encoder.capture_device",
                    config.preferred_devices
                ))
            })
        }
        "avfoundation" => Ok(":0".to_string()),
        _ => Ok("default".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec(codec: Codec, filter: ChannelFilter, channels: u8) -> EncoderSpec {
        EncoderSpec {
            output_sink: "left".into(),
            source_channel_filter: filter,
            codec,
            bitrate_kbps: 128,
            sample_rate_hz: 48_000,
            channel_count: channels,
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_low_latency_flags() {
        let config = EncoderConfig {
            capture_format: "dshow".into(),
            ..Default::default()
        };
        let route = FeedRoute::Rtsp("rtsp://127.0.0.1:8554/left".into());
        let args = build_args(&spec(Codec::LowLatencyVoice, ChannelFilter::LeftOnly, 1), &route, &config, "virtual-audio-capturer").unwrap();

        assert!(has_pair(&args, "-probesize", "32"));
        assert!(has_pair(&args, "-analyzeduration", "0"));
        assert!(has_pair(&args, "-audio_buffer_size", "50"));
        assert!(has_pair(&args, "-application", "lowdelay"));
        assert!(has_pair(&args, "-i", "audio=virtual-audio-capturer"));
        assert!(has_pair(&args, "-af", "aresample=async=1:first_pts=0,pan=mono|c0=FL"));
        assert!(has_pair(&args, "-ac", "1"));
        assert_eq!(args.last().unwrap(), "rtsp://127.0.0.1:8554/left");
    }

    #[test]
    fn test_segmented_flags() {
        let config = EncoderConfig {
            capture_format: "pulse".into(),
            ..Default::default()
        };
        let dir = PathBuf::from("/tmp/seg/pcaudio");
        let route = FeedRoute::SegmentDir(dir.clone());
        let args = build_args(&spec(Codec::BroadCompat, ChannelFilter::None, 2), &route, &config, "default").unwrap();

        assert!(has_pair(&args, "-c:a", "aac"));
        assert!(has_pair(&args, "-hls_time", "2"));
        assert!(has_pair(&args, "-hls_list_size", "5"));
        assert!(has_pair(&args, "-hls_flags", "delete_segments+independent_segments"));
        assert!(has_pair(&args, "-af", MONOTONIC_RESAMPLE));
        assert!(!args.iter().any(|a| a == "-audio_buffer_size"));
        assert_eq!(args.last().unwrap(), "/tmp/seg/pcaudio/index.m3u8");
    }

    #[test]
    fn test_mismatched_route_rejected() {
        let route = FeedRoute::SegmentDir(PathBuf::from("/tmp/x"));
        let err = build_args(
            &spec(Codec::LowLatencyVoice, ChannelFilter::None, 2),
            &route,
            &EncoderConfig::default(),
            "default",
        )
        .unwrap_err();
        assert!(matches!(err, StreamError::Config(_)));
    }

    #[test]
    fn test_parse_dshow_listing() {
        let listing = r#"
[dshow @ 000001] "Integrated Camera" (video)
[dshow @ 000001]   Alternative name "@device_pnp_\\?\usb#vid"
[dshow @ 000001] "Microphone (Realtek Audio)" (audio)
[dshow @ 000001] "CABLE Output (VB-Audio Virtual Cable)" (audio)
[dshow @ 000001] "virtual-audio-capturer" (audio)
"#;
        let devices = parse_dshow_devices(listing);
        assert_eq!(
            devices,
            vec![
                "Microphone (Realtek Audio)",
                "CABLE Output (VB-Audio Virtual Cable)",
                "virtual-audio-capturer"
            ]
        );

        let preferred = EncoderConfig::default().preferred_devices;
        assert_eq!(
            pick_capture_device(&devices, &preferred).as_deref(),
            Some("virtual-audio-capturer")
        );
        assert_eq!(pick_capture_device(&devices[..1], &preferred), None);
    }

    #[tokio::test]
    async fn test_unknown_handle_reads_as_exited() {
        let transcoder = FfmpegTranscoder::new(EncoderConfig::default(), "default", Duration::from_secs(2));
        let handle = ProcessHandle { id: 99, feed: "x".into() };
        assert_eq!(transcoder.health(&handle).await, EncoderHealth::Exited(None));
        assert_eq!(transcoder.running().await, 0);
        transcoder.stop(&handle).await.unwrap();
    }
}
