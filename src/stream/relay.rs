//! Local relay
//!
//! MediaMTX takes the encoders' RTSP output and re-serves it over WebRTC to
//! speakers; an axum server publishes the HLS segment directory for
//! displays. Liveness is always checked against the running process and the
//! API, never inferred from the handle existing.

use async_trait::async_trait;
use axum::Router;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{StreamError, StreamResult};
use crate::models::Codec;
use crate::stream::process::{forward_output, terminate};

/// Playlist name written by the segmented encoder
pub const PLAYLIST_NAME: &str = "index.m3u8";

// =============================================================================
// Addresses
// =============================================================================

/// Addresses remote devices use to reach the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoints {
    /// Explicitly injected host address, never auto-detected per interface
    pub host: IpAddr,
    pub webrtc_port: u16,
    pub segment_port: u16,
}

impl RelayEndpoints {
    /// Base URL of the real-time egress (the receiver appends `/<feed>/whep`)
    pub fn realtime_base(&self) -> String {
        format!("http://{}", SocketAddr::new(self.host, self.webrtc_port))
    }

    /// Segmented egress for one feed
    pub fn segment_playlist(&self, feed: &str) -> String {
        format!(
            "http://{}/{}/{}",
            SocketAddr::new(self.host, self.segment_port),
            urlencoding::encode(feed),
            PLAYLIST_NAME
        )
    }
}

/// Where an encoder writes a feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedRoute {
    /// Push to the relay's RTSP ingress
    Rtsp(String),
    /// Write HLS segments into this directory
    SegmentDir(PathBuf),
}

// =============================================================================
// Relay Contract
// =============================================================================

#[async_trait]
pub trait Relay: Send + Sync {
    /// Start, or confirm a live instance; fails with `Bind` when ports are taken
    async fn start(&self, host: IpAddr) -> StreamResult<RelayEndpoints>;
    /// Map a feed to a named path on the relay
    async fn route_feed(&self, feed: &str, codec: Codec) -> StreamResult<FeedRoute>;
    /// Liveness: process running and status endpoint answering
    async fn is_live(&self) -> bool;
    /// Output for `feed` is visible to receivers
    async fn feed_ready(&self, feed: &str, codec: Codec) -> bool;
    /// A receiver is pulling data from `feed`
    async fn reader_active(&self, feed: &str) -> bool;
    async fn stop(&self) -> StreamResult<()>;
}

// =============================================================================
// MediaMTX Relay
// =============================================================================

struct RelayRuntime {
    child: Child,
    endpoints: RelayEndpoints,
    segment_server: JoinHandle<()>,
    shutdown: CancellationToken,
}

/// [`Relay`] running MediaMTX plus the built-in segment server
pub struct MediaMtxRelay {
    config: RelayConfig,
    api_base: String,
    http: reqwest::Client,
    start_timeout: Duration,
    stop_grace: Duration,
    runtime: Mutex<Option<RelayRuntime>>,
}

impl MediaMtxRelay {
    pub fn new(config: RelayConfig, start_timeout: Duration, stop_grace: Duration) -> Self {
        let api_base = format!("http://127.0.0.1:{}", config.api_port);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            config,
            api_base,
            http,
            start_timeout,
            stop_grace,
            runtime: Mutex::new(None),
        }
    }

    /// Point status queries at another API base (tests)
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    fn segment_root(&self) -> PathBuf {
        self.config.segment_root()
    }

    /// Status endpoint answers
    pub async fn api_alive(&self) -> bool {
        match self.http.get(format!("{}/v3/paths/list", self.api_base)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("relay api unreachable: {}", e);
                false
            }
        }
    }

    async fn path_ready(&self, feed: &str) -> bool {
        let url = format!("{}/v3/paths/get/{}", self.api_base, urlencoding::encode(feed));
        match self.http.get(url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<PathInfo>().await {
                Ok(info) => info.ready,
                Err(e) => {
                    debug!("unexpected path info for {}: {}", feed, e);
                    false
                }
            },
            _ => false,
        }
    }

    async fn launch(&self, host: IpAddr) -> StreamResult<RelayRuntime> {
        for port in [
            self.config.rtsp_port,
            self.config.webrtc_port,
            self.config.api_port,
        ] {
            ensure_port_free(port)?;
        }

        let root = self.segment_root();
        tokio::fs::create_dir_all(&root).await?;
        let config_path = runtime_dir(&root).join("mediamtx.yml");
        tokio::fs::write(&config_path, render_mediamtx_config(&self.config, host)).await?;

        // Segment server first: it is ours, so a bind failure is exact
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.config.segment_port))
            .await
            .map_err(|_| StreamError::Bind {
                port: self.config.segment_port,
            })?;
        let shutdown = CancellationToken::new();
        let app = Router::new().fallback_service(ServeDir::new(&root));
        let server_shutdown = shutdown.clone();
        let segment_server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(server_shutdown.cancelled_owned())
                .await
            {
                warn!("segment server stopped: {}", e);
            }
        });

        let spawned = Command::new(&self.config.binary)
            .arg(&config_path)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                shutdown.cancel();
                return Err(StreamError::Spawn {
                    program: self.config.binary.clone(),
                    source,
                });
            }
        };
        if let Some(out) = child.stdout.take() {
            forward_output("relay".to_string(), out);
        }
        if let Some(err) = child.stderr.take() {
            forward_output("relay".to_string(), err);
        }

        let mut runtime = RelayRuntime {
            child,
            endpoints: RelayEndpoints {
                host,
                webrtc_port: self.config.webrtc_port,
                segment_port: self.config.segment_port,
            },
            segment_server,
            shutdown,
        };

        let deadline = tokio::time::Instant::now() + self.start_timeout;
        loop {
            if let Ok(Some(status)) = runtime.child.try_wait() {
                runtime.shutdown.cancel();
                warn!("relay exited during startup: {}", status);
                return Err(StreamError::RelayDown);
            }
            if self.api_alive().await {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                self.teardown(&mut runtime).await;
                return Err(StreamError::RelayDown);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        info!(
            "Relay live: rtsp :{}, webrtc {}, segments :{}",
            self.config.rtsp_port,
            runtime.endpoints.realtime_base(),
            self.config.segment_port
        );
        Ok(runtime)
    }

    async fn teardown(&self, runtime: &mut RelayRuntime) {
        runtime.shutdown.cancel();
        if tokio::time::timeout(self.stop_grace, &mut runtime.segment_server)
            .await
            .is_err()
        {
            runtime.segment_server.abort();
        }
        if let Err(e) = terminate(&mut runtime.child, self.stop_grace).await {
            warn!("relay did not stop cleanly: {}", e);
        }
    }

    async fn runtime_alive(&self, runtime: &mut RelayRuntime) -> bool {
        let process_up = matches!(runtime.child.try_wait(), Ok(None));
        process_up && !runtime.segment_server.is_finished() && self.api_alive().await
    }
}

impl Drop for RelayRuntime {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug, Deserialize)]
struct PathInfo {
    #[serde(default)]
    ready: bool,
}

#[derive(Debug, Deserialize)]
struct SessionList {
    #[serde(default)]
    items: Vec<WebRtcSession>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebRtcSession {
    #[serde(default)]
    path: String,
    #[serde(default)]
    bytes_sent: u64,
}

#[async_trait]
impl Relay for MediaMtxRelay {
    async fn start(&self, host: IpAddr) -> StreamResult<RelayEndpoints> {
        let mut guard = self.runtime.lock().await;
        if let Some(runtime) = guard.as_mut() {
            if runtime.endpoints.host == host && self.runtime_alive(runtime).await {
                debug!("Relay already live");
                return Ok(runtime.endpoints.clone());
            }
            warn!("Relay handle is stale, restarting");
            self.teardown(runtime).await;
            *guard = None;
        }

        let runtime = self.launch(host).await?;
        let endpoints = runtime.endpoints.clone();
        *guard = Some(runtime);
        Ok(endpoints)
    }

    async fn route_feed(&self, feed: &str, codec: Codec) -> StreamResult<FeedRoute> {
        match codec {
            Codec::LowLatencyVoice => Ok(FeedRoute::Rtsp(format!(
                "rtsp://127.0.0.1:{}/{}",
                self.config.rtsp_port, feed
            ))),
            Codec::BroadCompat => {
                let dir = self.segment_root().join(feed);
                // Stale segments from a previous run would satisfy the readiness wait
                if dir.exists() {
                    tokio::fs::remove_dir_all(&dir).await?;
                }
                tokio::fs::create_dir_all(&dir).await?;
                Ok(FeedRoute::SegmentDir(dir))
            }
        }
    }

    async fn is_live(&self) -> bool {
        let mut guard = self.runtime.lock().await;
        match guard.as_mut() {
            Some(runtime) => self.runtime_alive(runtime).await,
            None => false,
        }
    }

    async fn feed_ready(&self, feed: &str, codec: Codec) -> bool {
        match codec {
            Codec::LowLatencyVoice => self.path_ready(feed).await,
            Codec::BroadCompat => playlist_has_segment(&self.segment_root().join(feed)).await,
        }
    }

    async fn reader_active(&self, feed: &str) -> bool {
        let url = format!("{}/v3/webrtcsessions/list", self.api_base);
        match self.http.get(url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<SessionList>().await {
                Ok(list) => list
                    .items
                    .iter()
                    .any(|s| s.path == feed && s.bytes_sent > 0),
                Err(_) => false,
            },
            _ => false,
        }
    }

    async fn stop(&self) -> StreamResult<()> {
        let mut guard = self.runtime.lock().await;
        if let Some(mut runtime) = guard.take() {
            self.teardown(&mut runtime).await;
            info!("Relay stopped");
        }
        Ok(())
    }
}

fn ensure_port_free(port: u16) -> StreamResult<()> {
    std::net::TcpListener::bind(("0.0.0.0", port))
        .map(drop)
        .map_err(|_| StreamError::Bind { port })
}

fn runtime_dir(segment_root: &Path) -> PathBuf {
    segment_root
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| segment_root.to_path_buf())
}

/// Relay configuration: host address pinned, interface discovery off,
/// write queue kept small.
pub fn render_mediamtx_config(config: &RelayConfig, host: IpAddr) -> String {
    format!(
        "logLevel: info\n\
         api: yes\n\
         apiAddress: 127.0.0.1:{api}\n\
         rtsp: yes\n\
         rtspAddress: :{rtsp}\n\
         rtspTransports: [tcp]\n\
         webrtc: yes\n\
         webrtcAddress: :{webrtc}\n\
         webrtcIPsFromInterfaces: no\n\
         webrtcAdditionalHosts: [{host}]\n\
         writeQueueSize: {queue}\n\
         hls: no\n\
         rtmp: no\n\
         srt: no\n\
         paths:\n  all_others:\n",
        api = config.api_port,
        rtsp = config.rtsp_port,
        webrtc = config.webrtc_port,
        host = host,
        queue = config.write_queue_size,
    )
}

/// True once the playlist in `dir` lists at least one media segment
pub async fn playlist_has_segment(dir: &Path) -> bool {
    match tokio::fs::read_to_string(dir.join(PLAYLIST_NAME)).await {
        Ok(content) => content
            .lines()
            .map(str::trim)
            .any(|line| line.ends_with(".ts") || line.ends_with(".m4s")),
        Err(_) => false,
    }
}

// =============================================================================
// Tests
// =============================================================================
