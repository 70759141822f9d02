//! Cast tests
//!
//! Discovery snapshots and receiver session control, driven through a
//! scripted CastClient.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

use nestcast::config::{CastConfig, DEFAULT_MEDIA_RECEIVER_APP_ID, REALTIME_RECEIVER_APP_ID};
use nestcast::stream::cast::{REALTIME_NAMESPACE, SEGMENTED_CONTENT_TYPE};
use nestcast::stream::{CastClient, CastSessionController, RelayEndpoints};
use nestcast::{
    CapabilityClass, ChannelAssignment, Codec, Device, DeviceRegistry, RawDeviceInfo, StreamError,
    StreamResult,
};

// =============================================================================
// Scripted Client
// =============================================================================

#[derive(Default)]
struct ScriptedClient {
    found: Vec<RawDeviceInfo>,
    members: HashMap<String, Vec<RawDeviceInfo>>,
    broken_groups: HashSet<String>,
    hang_apps: HashSet<String>,
    standby: bool,
    unreachable: bool,
    log: Mutex<Vec<String>>,
    messages: Mutex<Vec<(String, Value)>>,
    volumes: Mutex<HashMap<String, u8>>,
}

impl ScriptedClient {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn volume_of(&self, device: &str) -> Option<u8> {
        self.volumes.lock().unwrap().get(device).copied()
    }
}

#[async_trait]
impl CastClient for ScriptedClient {
    async fn discover(&self, _timeout: Duration) -> StreamResult<Vec<RawDeviceInfo>> {
        Ok(self.found.clone())
    }

    async fn group_members(&self, group: &RawDeviceInfo) -> StreamResult<Vec<RawDeviceInfo>> {
        if self.broken_groups.contains(&group.name) {
            return Err(StreamError::DeviceUnreachable(group.name.clone()));
        }
        Ok(self.members.get(&group.name).cloned().unwrap_or_default())
    }

    async fn launch_app(&self, device: &Device, app_id: &str) -> StreamResult<()> {
        self.record(format!("launch {} {}", device.display_name, app_id));
        if self.hang_apps.contains(app_id) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn quit_app(&self, device: &Device) -> StreamResult<()> {
        if self.unreachable {
            return Err(StreamError::DeviceUnreachable(device.display_name.clone()));
        }
        self.record(format!("quit {}", device.display_name));
        Ok(())
    }

    async fn load_media(&self, device: &Device, url: &str, content_type: &str) -> StreamResult<()> {
        self.record(format!("load {} {} {}", device.display_name, url, content_type));
        Ok(())
    }

    async fn send_message(&self, device: &Device, namespace: &str, payload: &Value) -> StreamResult<()> {
        self.record(format!("message {} {}", device.display_name, namespace));
        self.messages
            .lock()
            .unwrap()
            .push((device.display_name.clone(), payload.clone()));
        Ok(())
    }

    async fn is_standby(&self, _device: &Device) -> StreamResult<bool> {
        Ok(self.standby)
    }

    async fn wake(&self, device: &Device) -> StreamResult<()> {
        self.record(format!("wake {}", device.display_name));
        Ok(())
    }

    async fn set_volume(&self, device: &Device, level_percent: u8) -> StreamResult<()> {
        self.volumes
            .lock()
            .unwrap()
            .insert(device.display_name.clone(), level_percent);
        Ok(())
    }

    async fn get_volume(&self, device: &Device) -> StreamResult<u8> {
        Ok(self.volume_of(&device.display_name).unwrap_or(40))
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn raw(name: &str, ip: &str, port: u16, cast_type: &str) -> RawDeviceInfo {
    RawDeviceInfo {
        name: name.into(),
        model: None,
        ip: ip.into(),
        port,
        cast_type: Some(cast_type.into()),
    }
}

fn device(name: &str, ip: &str, class: CapabilityClass) -> Device {
    Device {
        id: ip.into(),
        display_name: name.into(),
        class,
        address: ip.parse().unwrap(),
        port: 8009,
        model: None,
        group_members: vec![],
    }
}

fn endpoints() -> RelayEndpoints {
    RelayEndpoints {
        host: "192.168.1.5".parse().unwrap(),
        webrtc_port: 8889,
        segment_port: 8090,
    }
}

fn controller(client: ScriptedClient) -> (Arc<ScriptedClient>, CastSessionController) {
    let client = Arc::new(client);
    let controller = CastSessionController::new(client.clone(), CastConfig::default());
    (client, controller)
}

fn home_network() -> ScriptedClient {
    let mut client = ScriptedClient {
        found: vec![
            raw("Kitchen", "192.168.1.10", 8009, "audio"),
            raw("Living Room TV", "192.168.1.20", 8009, "cast"),
            raw("Bookshelf Pair", "192.168.1.11", 32187, "group"),
            raw("Broken", "not-an-address", 8009, "audio"),
        ],
        ..Default::default()
    };
    client.members.insert(
        "Bookshelf Pair".into(),
        vec![
            raw("Left Shelf", "192.168.1.11", 8009, "audio"),
            raw("Right Shelf", "192.168.1.12", 8009, "audio"),
        ],
    );
    client
}

// =============================================================================
// Discovery
// =============================================================================

#[tokio::test]
async fn test_scan_classifies_and_expands_groups() {
    let registry = DeviceRegistry::new(Arc::new(home_network()));
    let devices = assert_ok!(registry.scan(Duration::from_secs(1)).await);

    // The unparseable address is skipped, the rest survive
    assert_eq!(devices.len(), 3);
    let classes: Vec<CapabilityClass> = devices.iter().map(|d| d.class).collect();
    assert_eq!(
        classes,
        vec![
            CapabilityClass::Speaker,
            CapabilityClass::Display,
            CapabilityClass::Group
        ]
    );

    let group = &devices[2];
    assert_eq!(group.id, "192.168.1.11:32187");
    let members: Vec<&str> = group
        .group_members
        .iter()
        .map(|m| m.display_name.as_str())
        .collect();
    assert_eq!(members, vec!["Left Shelf", "Right Shelf"]);
}

#[tokio::test]
async fn test_resolve_by_id_name_and_member() {
    let registry = DeviceRegistry::new(Arc::new(home_network()));
    registry.scan(Duration::from_secs(1)).await.unwrap();

    assert_eq!(registry.resolve("192.168.1.10").unwrap().display_name, "Kitchen");
    assert_eq!(registry.resolve("living room tv").unwrap().id, "192.168.1.20");
    // Group members resolve even though they were not listed on their own
    assert_eq!(registry.resolve("Right Shelf").unwrap().id, "192.168.1.12");

    let err = assert_err!(registry.require("Garage"));
    assert!(matches!(err, StreamError::DeviceNotFound(ref key) if key == "Garage"));
}

#[tokio::test]
async fn test_broken_group_keeps_scan() {
    let mut client = home_network();
    client.broken_groups.insert("Bookshelf Pair".into());
    let registry = DeviceRegistry::new(Arc::new(client));

    let devices = assert_ok!(registry.scan(Duration::from_secs(1)).await);
    let group = devices.iter().find(|d| d.class == CapabilityClass::Group).unwrap();
    assert!(group.group_members.is_empty());
    assert_eq!(devices.len(), 3);
}

#[tokio::test]
async fn test_rescan_swaps_snapshot() {
    let registry = DeviceRegistry::new(Arc::new(home_network()));
    let before = registry.devices();
    assert!(before.is_empty());

    registry.scan(Duration::from_secs(1)).await.unwrap();
    // A snapshot taken earlier is untouched by the scan
    assert!(before.is_empty());
    assert_eq!(registry.devices().len(), 3);

    registry.replace(vec![device("Kitchen", "192.168.1.10", CapabilityClass::Speaker)]);
    assert_eq!(registry.devices().len(), 1);
    assert!(registry.resolve("Living Room TV").is_none());
}

// =============================================================================
// Sessions
// =============================================================================

#[tokio::test]
async fn test_speaker_connect_sends_feed_message() {
    let (client, cast) = controller(ScriptedClient::default());
    let kitchen = device("Kitchen", "192.168.1.10", CapabilityClass::Speaker);

    let session = assert_ok!(
        cast.connect(&kitchen, ChannelAssignment::Left, "left", Codec::LowLatencyVoice, &endpoints())
            .await
    );
    assert_eq!(session.app_id, REALTIME_RECEIVER_APP_ID);
    assert!(!session.used_fallback);
    assert_eq!(session.feed, "left");

    assert_eq!(
        client.log(),
        vec![
            "quit Kitchen".to_string(),
            format!("launch Kitchen {}", REALTIME_RECEIVER_APP_ID),
            format!("message Kitchen {}", REALTIME_NAMESPACE),
        ]
    );
    let messages = client.messages.lock().unwrap().clone();
    let (_, payload) = &messages[0];
    assert_eq!(payload["type"], "connect");
    assert_eq!(payload["url"], "http://192.168.1.5:8889");
    assert_eq!(payload["stream"], "left");
}

#[tokio::test]
async fn test_display_connect_wakes_and_loads_playlist() {
    let (client, cast) = controller(ScriptedClient {
        standby: true,
        ..Default::default()
    });
    let tv = device("Living Room TV", "192.168.1.20", CapabilityClass::Display);

    let session = assert_ok!(
        cast.connect(&tv, ChannelAssignment::Both, "pcaudio", Codec::BroadCompat, &endpoints())
            .await
    );
    assert!(!session.used_fallback);

    let log = client.log();
    assert!(log.contains(&"wake Living Room TV".to_string()));
    assert_eq!(
        log.last().unwrap(),
        &format!(
            "load Living Room TV http://192.168.1.5:8090/pcaudio/index.m3u8 {}",
            SEGMENTED_CONTENT_TYPE
        )
    );
}

#[tokio::test(start_paused = true)]
async fn test_display_falls_back_to_generic_receiver() {
    let mut client = ScriptedClient::default();
    client.hang_apps.insert(REALTIME_RECEIVER_APP_ID.into());
    let (client, cast) = controller(client);
    let tv = device("Living Room TV", "192.168.1.20", CapabilityClass::Display);

    let session = assert_ok!(
        cast.connect(&tv, ChannelAssignment::Both, "pcaudio", Codec::BroadCompat, &endpoints())
            .await
    );
    assert!(session.used_fallback);
    assert_eq!(session.app_id, DEFAULT_MEDIA_RECEIVER_APP_ID);

    let launches: Vec<String> = client
        .log()
        .into_iter()
        .filter(|l| l.starts_with("launch"))
        .collect();
    assert_eq!(launches.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_speaker_receiver_timeout_is_reported() {
    let mut client = ScriptedClient::default();
    client.hang_apps.insert(REALTIME_RECEIVER_APP_ID.into());
    let (client, cast) = controller(client);
    let kitchen = device("Kitchen", "192.168.1.10", CapabilityClass::Speaker);

    let err = assert_err!(
        cast.connect(&kitchen, ChannelAssignment::Both, "pcaudio", Codec::LowLatencyVoice, &endpoints())
            .await
    );
    assert!(matches!(err, StreamError::ReceiverTimeout { .. }));
    assert!(client.messages.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_speaker_on_segmented_feed_uses_generic_receiver() {
    let mut client = ScriptedClient::default();
    client.hang_apps.insert(REALTIME_RECEIVER_APP_ID.into());
    let (client, cast) = controller(client);
    let kitchen = device("Kitchen", "192.168.1.10", CapabilityClass::Speaker);

    let session = assert_ok!(
        cast.connect(&kitchen, ChannelAssignment::Both, "pcaudio", Codec::BroadCompat, &endpoints())
            .await
    );
    assert_eq!(session.app_id, DEFAULT_MEDIA_RECEIVER_APP_ID);
    assert_eq!(
        client.log(),
        vec![
            "quit Kitchen".to_string(),
            format!("launch Kitchen {}", DEFAULT_MEDIA_RECEIVER_APP_ID),
            format!(
                "load Kitchen http://192.168.1.5:8090/pcaudio/index.m3u8 {}",
                SEGMENTED_CONTENT_TYPE
            ),
        ]
    );
    assert!(client.messages.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_device_fails_before_launch() {
    let (client, cast) = controller(ScriptedClient {
        unreachable: true,
        ..Default::default()
    });
    let kitchen = device("Kitchen", "192.168.1.10", CapabilityClass::Speaker);

    let err = assert_err!(
        cast.connect(&kitchen, ChannelAssignment::Both, "pcaudio", Codec::LowLatencyVoice, &endpoints())
            .await
    );
    assert!(matches!(err, StreamError::DeviceUnreachable(_)));
    assert!(client.log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_plays_chime_between_quits() {
    let (client, cast) = controller(ScriptedClient::default());
    let kitchen = device("Kitchen", "192.168.1.10", CapabilityClass::Speaker);
    let session = cast
        .connect(&kitchen, ChannelAssignment::Both, "pcaudio", Codec::LowLatencyVoice, &endpoints())
        .await
        .unwrap();
    cast.set_volume(&kitchen, 30).await.unwrap();
    client.log.lock().unwrap().clear();

    assert_ok!(cast.disconnect(&session).await);
    assert_eq!(
        client.log(),
        vec![
            "quit Kitchen".to_string(),
            format!("launch Kitchen {}", DEFAULT_MEDIA_RECEIVER_APP_ID),
            "quit Kitchen".to_string(),
        ]
    );
    assert!(cast.cached_volume(&kitchen.id).is_none());
}

// =============================================================================
// Volume
// =============================================================================

#[tokio::test]
async fn test_set_volume_clamps() {
    let (client, cast) = controller(ScriptedClient::default());
    let kitchen = device("Kitchen", "192.168.1.10", CapabilityClass::Speaker);

    let state = assert_ok!(cast.set_volume(&kitchen, 140).await);
    assert_eq!(state.level_percent, 100);
    assert_eq!(client.volume_of("Kitchen"), Some(100));
    assert_eq!(cast.cached_volume(&kitchen.id).unwrap().level_percent, 100);
}

#[tokio::test]
async fn test_adjust_volume_from_device_level() {
    let (client, cast) = controller(ScriptedClient::default());
    let kitchen = device("Kitchen", "192.168.1.10", CapabilityClass::Speaker);

    // Device reports 40 until told otherwise
    let state = assert_ok!(cast.adjust_volume(&kitchen, 15).await);
    assert_eq!(state.level_percent, 55);
    let state = assert_ok!(cast.adjust_volume(&kitchen, -80).await);
    assert_eq!(state.level_percent, 0);
    assert_eq!(client.volume_of("Kitchen"), Some(0));
}

#[tokio::test]
async fn test_mute_then_unmute_restores_level() {
    let (client, cast) = controller(ScriptedClient::default());
    let kitchen = device("Kitchen", "192.168.1.10", CapabilityClass::Speaker);
    cast.set_volume(&kitchen, 35).await.unwrap();

    let muted = assert_ok!(cast.mute(&kitchen).await);
    assert!(muted.is_muted);
    assert_eq!(client.volume_of("Kitchen"), Some(0));

    // A second mute keeps the remembered level
    cast.mute(&kitchen).await.unwrap();

    let restored = assert_ok!(cast.unmute(&kitchen).await);
    assert!(!restored.is_muted);
    assert_eq!(restored.level_percent, 35);
    assert_eq!(client.volume_of("Kitchen"), Some(35));
}
