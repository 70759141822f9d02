//! Relay tests
//!
//! Status queries run against a mock API; segment readiness against a temp dir.

use mockito::Server;
use std::time::Duration;

use nestcast::config::RelayConfig;
use nestcast::stream::relay::{FeedRoute, MediaMtxRelay, Relay, PLAYLIST_NAME};
use nestcast::{Codec, StreamError};

fn relay_in(dir: &std::path::Path) -> MediaMtxRelay {
    let config = RelayConfig {
        segment_dir: Some(dir.to_path_buf()),
        ..RelayConfig::default()
    };
    MediaMtxRelay::new(config, Duration::from_secs(1), Duration::from_secs(1))
}

// =============================================================================
// Status API
// =============================================================================

#[tokio::test]
async fn test_api_alive() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/v3/paths/list")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"itemCount":0,"pageCount":0,"items":[]}"#)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let relay = relay_in(dir.path()).with_api_base(server.url());
    assert!(relay.api_alive().await);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_api_down() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay_in(dir.path()).with_api_base("http://127.0.0.1:1");
    assert!(!relay.api_alive().await);

    let mut server = Server::new_async().await;
    server
        .mock("GET", "/v3/paths/list")
        .with_status(500)
        .create_async()
        .await;
    let relay = relay_in(dir.path()).with_api_base(server.url());
    assert!(!relay.api_alive().await);
}

#[tokio::test]
async fn test_realtime_feed_ready() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/v3/paths/get/pcaudio")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"name":"pcaudio","ready":true,"readers":[]}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/v3/paths/get/left")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"name":"left","ready":false}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/v3/paths/get/right")
        .with_status(404)
        .with_body(r#"{"error":"path not found"}"#)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let relay = relay_in(dir.path()).with_api_base(server.url());
    assert!(relay.feed_ready("pcaudio", Codec::LowLatencyVoice).await);
    assert!(!relay.feed_ready("left", Codec::LowLatencyVoice).await);
    assert!(!relay.feed_ready("right", Codec::LowLatencyVoice).await);
}

#[tokio::test]
async fn test_reader_needs_bytes_sent() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/v3/webrtcsessions/list")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"itemCount":2,"items":[
                {"id":"a","path":"pcaudio","state":"read","bytesSent":0},
                {"id":"b","path":"left","state":"read","bytesSent":48213}
            ]}"#,
        )
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let relay = relay_in(dir.path()).with_api_base(server.url());
    assert!(relay.reader_active("left").await);
    assert!(!relay.reader_active("pcaudio").await, "a connected but silent reader");
    assert!(!relay.reader_active("right").await);
}

// =============================================================================
// Feed Routing
// =============================================================================

#[tokio::test]
async fn test_realtime_route_points_at_rtsp_ingress() {
    let dir = tempfile::tempdir().unwrap();
    let relay = relay_in(dir.path());
    let route = relay.route_feed("left", Codec::LowLatencyVoice).await.unwrap();
    assert_eq!(route, FeedRoute::Rtsp("rtsp://127.0.0.1:8554/left".into()));
}

#[tokio::test]
async fn test_segment_route_clears_stale_playlist() {
    let dir = tempfile::tempdir().unwrap();
    let feed_dir = dir.path().join("pcaudio");
    std::fs::create_dir_all(&feed_dir).unwrap();
    std::fs::write(feed_dir.join(PLAYLIST_NAME), "#EXTM3U\n#EXTINF:2.0,\nold0.ts\n").unwrap();

    let relay = relay_in(dir.path());
    assert!(relay.feed_ready("pcaudio", Codec::BroadCompat).await);

    let route = relay.route_feed("pcaudio", Codec::BroadCompat).await.unwrap();
    assert_eq!(route, FeedRoute::SegmentDir(feed_dir.clone()));
    assert!(feed_dir.is_dir());
    assert!(!relay.feed_ready("pcaudio", Codec::BroadCompat).await);

    std::fs::write(feed_dir.join(PLAYLIST_NAME), "#EXTM3U\n#EXTINF:2.0,\nseg0.ts\n").unwrap();
    assert!(relay.feed_ready("pcaudio", Codec::BroadCompat).await);
}

// =============================================================================
// Startup
// =============================================================================

#[tokio::test]
async fn test_occupied_port_is_a_bind_error() {
    let occupied = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
    let port = occupied.local_addr().unwrap().port();

    let dir = tempfile::tempdir().unwrap();
    let config = RelayConfig {
        rtsp_port: port,
        segment_dir: Some(dir.path().to_path_buf()),
        ..RelayConfig::default()
    };
    let relay = MediaMtxRelay::new(config, Duration::from_secs(1), Duration::from_secs(1));

    let err = relay.start("127.0.0.1".parse().unwrap()).await.unwrap_err();
    assert!(matches!(err, StreamError::Bind { port: p } if p == port));
    assert!(!relay.is_live().await);
}

/// Ports free at the moment of asking, all distinct
#[cfg(unix)]
fn free_ports<const N: usize>() -> [u16; N] {
    let listeners: Vec<std::net::TcpListener> = (0..N)
        .map(|_| std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap())
        .collect();
    let mut ports = [0; N];
    for (port, listener) in ports.iter_mut().zip(&listeners) {
        *port = listener.local_addr().unwrap().port();
    }
    ports
}

/// Stand-in relay binary: records its pid, then idles
#[cfg(unix)]
fn idle_binary(dir: &std::path::Path) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = dir.join("fake-relay");
    let pids = dir.join("pids");
    std::fs::write(
        &script,
        format!("#!/bin/sh\necho $$ >> '{}'\nexec sleep 30\n", pids.display()),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}

/// Pids recorded by the stand-in, once `count` launches have written theirs
#[cfg(unix)]
async fn launched_pids(dir: &std::path::Path, count: usize) -> Vec<String> {
    for _ in 0..100 {
        let pids: Vec<String> = std::fs::read_to_string(dir.join("pids"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect();
        if pids.len() >= count {
            return pids;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("relay stand-in launched fewer than {} times", count);
}

#[cfg(unix)]
#[tokio::test]
async fn test_stale_handle_is_relaunched() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/v3/paths/list")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"itemCount":0,"pageCount":0,"items":[]}"#)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let [rtsp, webrtc, api, segments] = free_ports::<4>();
    let config = RelayConfig {
        binary: idle_binary(dir.path()).display().to_string(),
        rtsp_port: rtsp,
        webrtc_port: webrtc,
        api_port: api,
        segment_port: segments,
        segment_dir: Some(dir.path().join("segments")),
        ..RelayConfig::default()
    };
    let relay = MediaMtxRelay::new(config, Duration::from_secs(5), Duration::from_secs(1))
        .with_api_base(server.url());
    let host = "127.0.0.1".parse().unwrap();

    relay.start(host).await.unwrap();
    assert!(relay.is_live().await);
    // A second start reuses the live relay
    relay.start(host).await.unwrap();
    let first = launched_pids(dir.path(), 1).await;
    assert_eq!(first.len(), 1);

    // The relay process dies behind the handle's back
    let killed = std::process::Command::new("kill")
        .args(["-9", &first[0]])
        .status()
        .unwrap();
    assert!(killed.success());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!relay.is_live().await, "a dead process is not live");

    let endpoints = relay.start(host).await.unwrap();
    assert_eq!(endpoints.segment_port, segments);
    let relaunched = launched_pids(dir.path(), 2).await;
    assert_eq!(relaunched.len(), 2);
    assert_ne!(relaunched[0], relaunched[1]);
    assert!(relay.is_live().await);

    relay.stop().await.unwrap();
    assert!(!relay.is_live().await);
}
