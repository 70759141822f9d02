//! Cast device control
//!
//! Remote devices are driven through a long-running helper process speaking
//! JSON lines on stdin/stdout (one request per line, one response per line,
//! matched by `id`). [`CastSessionController`] layers the session rules on
//! top: always teardown-then-launch on connect, a chime on disconnect, and
//! the single generic-receiver fallback for displays.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CastConfig;
use crate::error::{StreamError, StreamResult};
use crate::models::{
    CapabilityClass, ChannelAssignment, Codec, Device, RawDeviceInfo, VolumeState,
};
use crate::stream::relay::RelayEndpoints;

/// Message namespace understood by the real-time receiver
pub const REALTIME_NAMESPACE: &str = "urn:x-cast:com.pcnestspeaker.webrtc";
/// Content type announced for segmented playlists
pub const SEGMENTED_CONTENT_TYPE: &str = "application/x-mpegURL";

// =============================================================================
// Client Contract
// =============================================================================

/// Call-response interface to Cast devices.
///
/// Every call is synchronous-with-timeout from the caller's side.
#[async_trait]
pub trait CastClient: Send + Sync {
    async fn discover(&self, timeout: Duration) -> StreamResult<Vec<RawDeviceInfo>>;
    async fn group_members(&self, group: &RawDeviceInfo) -> StreamResult<Vec<RawDeviceInfo>>;
    /// Launch a receiver application; resolves once the receiver acknowledges
    async fn launch_app(&self, device: &Device, app_id: &str) -> StreamResult<()>;
    async fn quit_app(&self, device: &Device) -> StreamResult<()>;
    /// Load a live media source on the running receiver
    async fn load_media(&self, device: &Device, url: &str, content_type: &str) -> StreamResult<()>;
    async fn send_message(&self, device: &Device, namespace: &str, payload: &Value)
        -> StreamResult<()>;
    async fn is_standby(&self, device: &Device) -> StreamResult<bool>;
    async fn wake(&self, device: &Device) -> StreamResult<()>;
    async fn set_volume(&self, device: &Device, level_percent: u8) -> StreamResult<()>;
    async fn get_volume(&self, device: &Device) -> StreamResult<u8>;
}

// =============================================================================
// Helper Daemon Client
// =============================================================================

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// [`CastClient`] backed by the JSON-lines helper daemon
pub struct DaemonCastClient {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Pending,
    next_id: AtomicU64,
    call_timeout: Duration,
    reader_task: JoinHandle<()>,
    _child: Option<Mutex<Child>>,
}

impl DaemonCastClient {
    /// Spawn the helper daemon described by `config.helper`
    pub async fn spawn(config: &CastConfig) -> StreamResult<Self> {
        let (program, args) = config
            .helper
            .split_first()
            .ok_or_else(|| StreamError::Config("cast.helper is empty".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StreamError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or_else(|| StreamError::Cast("helper stdin unavailable".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| StreamError::Cast("helper stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "nestcast::cast_helper", "{}", line);
                }
            });
        }

        info!("Cast helper started ({})", program);
        let mut client = Self::from_io(stdout, stdin, Duration::from_millis(config.call_timeout_ms));
        client._child = Some(Mutex::new(child));
        Ok(client)
    }

    /// Build a client over any reader/writer pair speaking the helper protocol
    pub fn from_io<R, W>(reader: R, writer: W, call_timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader_task = tokio::spawn(read_responses(reader, pending.clone()));
        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(1),
            call_timeout,
            reader_task,
            _child: None,
        }
    }

    /// Send one request and wait for its response
    async fn call(&self, cmd: &str, mut args: Value, timeout: Duration) -> StreamResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Value::Object(map) = &mut args {
            map.insert("id".into(), json!(id));
            map.insert("cmd".into(), json!(cmd));
        }
        let mut line = serde_json::to_string(&args)
            .map_err(|e| StreamError::Cast(format!("encode {}: {}", cmd, e)))?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _entry = PendingEntry {
            pending: &self.pending,
            id,
        };

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                return Err(StreamError::Cast(format!("helper write failed: {}", e)));
            }
            writer.flush().await?;
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => return Err(StreamError::Cast("cast helper exited".to_string())),
            Err(_) => {
                return Err(StreamError::Cast(format!(
                    "helper call '{}' timed out after {}ms",
                    cmd,
                    timeout.as_millis()
                )));
            }
        };

        check_response(cmd, &args, response)
    }

    async fn device_call(&self, cmd: &str, device: &Device, extra: Value) -> StreamResult<Value> {
        let mut args = device_args(device);
        merge(&mut args, extra);
        self.call(cmd, args, self.call_timeout).await
    }
}

impl Drop for DaemonCastClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Drops a request's pending slot when `call` returns or is cancelled
struct PendingEntry<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn read_responses<R: AsyncRead + Unpin>(reader: R, pending: Pending) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let value: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(_) => {
                        debug!("Ignoring non-JSON helper output: {}", line);
                        continue;
                    }
                };
                let Some(id) = value.get("id").and_then(Value::as_u64) else {
                    debug!("Ignoring helper response without id");
                    continue;
                };
                if let Some(tx) = lock(&pending).remove(&id) {
                    let _ = tx.send(value);
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    // Dropping the senders wakes every waiting call with an error
    lock(&pending).clear();
    warn!("Cast helper output closed");
}

/// Device addressing: the address lets the helper skip discovery
fn device_args(device: &Device) -> Value {
    json!({ "speaker": device.display_name, "ip": device.address.to_string() })
}

fn merge(base: &mut Value, extra: Value) {
    if let (Value::Object(base), Value::Object(extra)) = (base, extra) {
        base.extend(extra);
    }
}

/// Map a `{"success": false, ...}` response onto the error taxonomy
fn check_response(cmd: &str, request: &Value, response: Value) -> StreamResult<Value> {
    if response.get("success").and_then(Value::as_bool) == Some(true) {
        return Ok(response);
    }
    let message = response
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let device = request
        .get("speaker")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Err(match response.get("kind").and_then(Value::as_str) {
        Some("unreachable") => StreamError::DeviceUnreachable(device),
        Some("not_found") => StreamError::DeviceNotFound(device),
        Some("receiver_timeout") => StreamError::ReceiverTimeout {
            device,
            app_id: request
                .get("app_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        Some("discovery") => StreamError::Discovery(message),
        _ => StreamError::Cast(format!("{}: {}", cmd, message)),
    })
}

fn parse_devices(value: &Value) -> StreamResult<Vec<RawDeviceInfo>> {
    let list = value.get("devices").cloned().unwrap_or_else(|| json!([]));
    serde_json::from_value(list).map_err(|e| StreamError::Discovery(format!("bad device list: {}", e)))
}

#[async_trait]
impl CastClient for DaemonCastClient {
    async fn discover(&self, timeout: Duration) -> StreamResult<Vec<RawDeviceInfo>> {
        let response = self
            .call(
                "discover",
                json!({ "timeout": timeout.as_secs() }),
                timeout + self.call_timeout,
            )
            .await
            .map_err(|e| match e {
                StreamError::Cast(msg) => StreamError::Discovery(msg),
                other => other,
            })?;
        parse_devices(&response)
    }

    async fn group_members(&self, group: &RawDeviceInfo) -> StreamResult<Vec<RawDeviceInfo>> {
        let response = self
            .call(
                "group-members",
                json!({ "speaker": group.name, "ip": group.ip }),
                self.call_timeout,
            )
            .await?;
        parse_devices(&response)
    }

    async fn launch_app(&self, device: &Device, app_id: &str) -> StreamResult<()> {
        self.device_call("launch-app", device, json!({ "app_id": app_id }))
            .await
            .map(|_| ())
    }

    async fn quit_app(&self, device: &Device) -> StreamResult<()> {
        self.device_call("quit-app", device, json!({})).await.map(|_| ())
    }

    async fn load_media(&self, device: &Device, url: &str, content_type: &str) -> StreamResult<()> {
        self.device_call(
            "load-media",
            device,
            json!({ "url": url, "content_type": content_type, "stream_type": "LIVE" }),
        )
        .await
        .map(|_| ())
    }

    async fn send_message(
        &self,
        device: &Device,
        namespace: &str,
        payload: &Value,
    ) -> StreamResult<()> {
        self.device_call(
            "send-message",
            device,
            json!({ "namespace": namespace, "payload": payload }),
        )
        .await
        .map(|_| ())
    }

    async fn is_standby(&self, device: &Device) -> StreamResult<bool> {
        let response = self.device_call("status", device, json!({})).await?;
        Ok(response
            .get("is_stand_by")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn wake(&self, device: &Device) -> StreamResult<()> {
        self.device_call("wake", device, json!({})).await.map(|_| ())
    }

    async fn set_volume(&self, device: &Device, level_percent: u8) -> StreamResult<()> {
        let volume = f64::from(level_percent.min(100)) / 100.0;
        self.device_call("set-volume", device, json!({ "volume": volume }))
            .await
            .map(|_| ())
    }

    async fn get_volume(&self, device: &Device) -> StreamResult<u8> {
        let response = self.device_call("get-volume", device, json!({})).await?;
        let volume = response
            .get("volume")
            .and_then(Value::as_f64)
            .ok_or_else(|| StreamError::Cast("get-volume: missing volume".to_string()))?;
        Ok((volume * 100.0).round().clamp(0.0, 100.0) as u8)
    }
}

// =============================================================================
// Session Controller
// =============================================================================

/// A connected receiver playing one feed
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub device: Device,
    pub channel: ChannelAssignment,
    pub feed: String,
    /// Receiver actually running on the device
    pub app_id: String,
    pub used_fallback: bool,
}

/// Drives receiver sessions and owns per-device volume state
pub struct CastSessionController {
    client: Arc<dyn CastClient>,
    config: CastConfig,
    volumes: Mutex<HashMap<String, VolumeState>>,
}

impl CastSessionController {
    pub fn new(client: Arc<dyn CastClient>, config: CastConfig) -> Self {
        Self {
            client,
            config,
            volumes: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> Arc<dyn CastClient> {
        self.client.clone()
    }

    /// Connect `device` to `feed`, carried as `codec`.
    ///
    /// Real-time feeds get the custom receiver and a connect message.
    /// Segmented feeds get a live playlist load: displays through their
    /// receiver (or, on timeout, the generic one), speakers and groups
    /// through the generic receiver.
    pub async fn connect(
        &self,
        device: &Device,
        channel: ChannelAssignment,
        feed: &str,
        codec: Codec,
        endpoints: &RelayEndpoints,
    ) -> StreamResult<Session> {
        let realtime = codec == Codec::LowLatencyVoice;
        let display = device.class == CapabilityClass::Display;
        let primary = if realtime {
            &self.config.realtime_app_id
        } else if display {
            &self.config.display_app_id
        } else {
            &self.config.generic_app_id
        };

        // Fresh launch every time so the connect tone always plays
        match self.client.quit_app(device).await {
            Ok(()) => {}
            Err(e @ StreamError::DeviceUnreachable(_)) => return Err(e),
            Err(e) => debug!("quit before launch on {}: {}", device.display_name, e),
        }

        let mut app_id = primary.clone();
        let mut used_fallback = false;
        match self.launch(device, primary).await {
            Ok(()) => {}
            Err(StreamError::ReceiverTimeout { .. })
                if !realtime && *primary != self.config.generic_app_id =>
            {
                warn!(
                    "Receiver {} on '{}' did not respond in time, falling back to {}",
                    primary, device.display_name, self.config.generic_app_id
                );
                self.launch(device, &self.config.generic_app_id).await?;
                app_id = self.config.generic_app_id.clone();
                used_fallback = true;
            }
            Err(e) => return Err(e),
        }

        if realtime {
            let payload = json!({
                "type": "connect",
                "url": endpoints.realtime_base(),
                "stream": feed,
            });
            self.client
                .send_message(device, REALTIME_NAMESPACE, &payload)
                .await?;
        } else {
            if display {
                self.wake_if_standby(device).await;
            }
            self.client
                .load_media(device, &endpoints.segment_playlist(feed), SEGMENTED_CONTENT_TYPE)
                .await?;
        }

        info!(
            "Connected {} ({:?}) to feed '{}' via {}",
            device.display_name, channel, feed, app_id
        );
        Ok(Session {
            device: device.clone(),
            channel,
            feed: feed.to_string(),
            app_id,
            used_fallback,
        })
    }

    async fn launch(&self, device: &Device, app_id: &str) -> StreamResult<()> {
        let window = Duration::from_millis(self.config.receiver_timeout_ms);
        match tokio::time::timeout(window, self.client.launch_app(device, app_id)).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::ReceiverTimeout {
                device: device.display_name.clone(),
                app_id: app_id.to_string(),
            }),
        }
    }

    async fn wake_if_standby(&self, device: &Device) {
        match self.client.is_standby(device).await {
            Ok(true) => {
                info!("Waking {} from standby", device.display_name);
                if let Err(e) = self.client.wake(device).await {
                    warn!("Could not wake {}: {}", device.display_name, e);
                }
            }
            Ok(false) => {}
            Err(e) => debug!("standby query on {} failed: {}", device.display_name, e),
        }
    }

    /// Stop playback and tear the receiver down.
    ///
    /// A brief launch of the generic receiver before the final quit produces
    /// the disconnect tone.
    pub async fn disconnect(&self, session: &Session) -> StreamResult<()> {
        let device = &session.device;
        let first = self.client.quit_app(device).await;

        tokio::time::sleep(Duration::from_millis(self.config.chime_pause_ms)).await;
        if let Err(e) = self.launch(device, &self.config.generic_app_id).await {
            debug!("chime launch on {} failed: {}", device.display_name, e);
        }
        tokio::time::sleep(Duration::from_millis(self.config.chime_hold_ms)).await;

        let last = self.client.quit_app(device).await;
        lock(&self.volumes).remove(&device.id);
        info!("Disconnected {}", device.display_name);
        first.and(last)
    }

    pub async fn set_volume(&self, device: &Device, level_percent: u8) -> StreamResult<VolumeState> {
        let level = level_percent.min(100);
        self.client.set_volume(device, level).await?;
        let mut volumes = lock(&self.volumes);
        let state = volumes.entry(device.id.clone()).or_default();
        state.set(level);
        Ok(*state)
    }

    /// Query the device and refresh the cached state
    pub async fn get_volume(&self, device: &Device) -> StreamResult<u8> {
        let level = self.client.get_volume(device).await?;
        let mut volumes = lock(&self.volumes);
        let state = volumes.entry(device.id.clone()).or_insert_with(|| VolumeState::new(level));
        if !state.is_muted {
            state.set(level);
        }
        Ok(level)
    }

    pub async fn adjust_volume(&self, device: &Device, delta: i16) -> StreamResult<VolumeState> {
        let current = self.get_volume(device).await?;
        let mut next = VolumeState::new(current);
        let level = next.adjust(delta);
        self.set_volume(device, level).await
    }

    pub async fn mute(&self, device: &Device) -> StreamResult<VolumeState> {
        let mut state = self.volume_state(device).await?;
        state.mute();
        self.client.set_volume(device, 0).await?;
        lock(&self.volumes).insert(device.id.clone(), state);
        Ok(state)
    }

    pub async fn unmute(&self, device: &Device) -> StreamResult<VolumeState> {
        let mut state = self.volume_state(device).await?;
        let level = state.unmute();
        self.client.set_volume(device, level).await?;
        lock(&self.volumes).insert(device.id.clone(), state);
        Ok(state)
    }

    async fn volume_state(&self, device: &Device) -> StreamResult<VolumeState> {
        let cached = lock(&self.volumes).get(&device.id).copied();
        match cached {
            Some(state) => Ok(state),
            None => Ok(VolumeState::new(self.client.get_volume(device).await?)),
        }
    }

    /// Cached volume of a connected device
    pub fn cached_volume(&self, device_id: &str) -> Option<VolumeState> {
        lock(&self.volumes).get(device_id).copied()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CAST_PORT;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{duplex, split};

    fn device() -> Device {
        Device {
            id: "192.168.1.20".into(),
            display_name: "Kitchen".into(),
            class: CapabilityClass::Speaker,
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
            port: CAST_PORT,
            model: None,
            group_members: vec![],
        }
    }

    /// Fake helper: answers each request with `respond(request)`
    fn fake_helper<F>(respond: F) -> DaemonCastClient
    where
        F: Fn(&Value) -> Option<Value> + Send + 'static,
    {
        let (client_side, helper_side) = duplex(8192);
        let (client_read, client_write) = split(client_side);
        let (helper_read, mut helper_write) = split(helper_side);

        tokio::spawn(async move {
            let mut lines = BufReader::new(helper_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                if let Some(mut response) = respond(&request) {
                    response["id"] = request["id"].clone();
                    let mut out = response.to_string();
                    out.push('\n');
                    helper_write.write_all(out.as_bytes()).await.unwrap();
                }
            }
        });

        DaemonCastClient::from_io(client_read, client_write, Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_get_volume_scales_to_percent() {
        let client = fake_helper(|req| {
            assert_eq!(req["cmd"], "get-volume");
            assert_eq!(req["ip"], "192.168.1.20");
            Some(json!({ "success": true, "volume": 0.42 }))
        });
        assert_eq!(client.get_volume(&device()).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_error_kinds_map_to_taxonomy() {
        let client = fake_helper(|req| match req["cmd"].as_str() {
            Some("quit-app") => Some(json!({ "success": false, "kind": "unreachable", "error": "no route" })),
            Some("launch-app") => Some(json!({ "success": false, "kind": "receiver_timeout", "error": "slow" })),
            _ => Some(json!({ "success": false, "error": "boom" })),
        });
        let d = device();
        assert!(matches!(
            client.quit_app(&d).await,
            Err(StreamError::DeviceUnreachable(name)) if name == "Kitchen"
        ));
        assert!(matches!(
            client.launch_app(&d, "FCAA4619").await,
            Err(StreamError::ReceiverTimeout { app_id, .. }) if app_id == "FCAA4619"
        ));
        assert!(matches!(client.wake(&d).await, Err(StreamError::Cast(_))));
    }

    #[tokio::test]
    async fn test_silent_helper_times_out() {
        let client = fake_helper(|_| None);
        let err = client.get_volume(&device()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancelled_call_releases_pending_slot() {
        let client = fake_helper(|_| None);
        let cut_short = tokio::time::timeout(
            Duration::from_millis(50),
            client.launch_app(&device(), "FCAA4619"),
        )
        .await;
        assert!(cut_short.is_err());
        assert!(lock(&client.pending).is_empty());
    }

    #[tokio::test]
    async fn test_discover_parses_devices() {
        let client = fake_helper(|_| {
            Some(json!({
                "success": true,
                "devices": [
                    { "name": "Kitchen", "ip": "192.168.1.20", "cast_type": "audio" },
                    { "name": "TV", "ip": "192.168.1.30", "port": 8009, "cast_type": "cast", "model": "Chromecast" }
                ]
            }))
        });
        let devices = client.discover(Duration::from_secs(1)).await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].model.as_deref(), Some("Chromecast"));
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_matched_by_id() {
        let client = Arc::new(fake_helper(|req| {
            let level = if req["speaker"] == "A" { 0.1 } else { 0.9 };
            Some(json!({ "success": true, "volume": level }))
        }));
        let mut a = device();
        a.display_name = "A".into();
        let mut b = device();
        b.display_name = "B".into();
        let (va, vb) = tokio::join!(client.get_volume(&a), client.get_volume(&b));
        assert_eq!(va.unwrap(), 10);
        assert_eq!(vb.unwrap(), 90);
    }
}
