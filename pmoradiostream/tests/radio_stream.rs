//! Integration tests for pmoradiostream

use futures::StreamExt;
use pmorelay::ResourceProvider;
use pmoradiostream::{RadioClient, RadioStreamProvider};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> RadioClient {
    RadioClient::builder()
        .stream_url(format!("{}/stream", server.uri()))
        .status_url(format!("{}/api/status", server.uri()))
        .station_name("Test FM")
        .connect_timeout(Duration::from_secs(2))
        .status_timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

async fn drain(resource: pmorelay::AudioResource) -> Result<Vec<u8>, std::io::Error> {
    let (_, mut stream) = resource.into_parts();
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk?);
    }
    Ok(data)
}

#[tokio::test]
async fn test_acquire_opens_stream_with_browser_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stream"))
        .and(header("cache-control", "no-cache"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "audio/mpeg")
                .set_body_bytes(vec![1u8, 2, 3, 4]),
        )
        .expect(1)
        .mount(&server)
        .await;

    let provider = RadioStreamProvider::new(client_for(&server), 0.5);
    let resource = provider.acquire().await.unwrap();

    assert!(!resource.is_degraded());
    assert_eq!(resource.title(), "Test FM Stream");
    assert_eq!(resource.content_type(), Some("audio/mpeg"));
    assert_eq!(resource.volume().map(|v| v.get()), Some(0.5));
    assert_eq!(drain(resource).await.unwrap(), vec![1, 2, 3, 4]);

    let requests = server.received_requests().await.unwrap();
    let user_agent = requests[0].headers.get("user-agent").unwrap();
    assert!(user_agent.to_str().unwrap().starts_with("Mozilla/5.0"));
}

#[tokio::test]
async fn test_acquire_falls_back_to_lazy_stream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stream"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let provider = RadioStreamProvider::new(client_for(&server), 0.3);
    let resource = provider.acquire().await.unwrap();

    assert!(resource.is_degraded());
    assert_eq!(resource.volume().map(|v| v.get()), Some(0.3));
    // Nothing is fetched until the resource is read
    assert_eq!(server.received_requests().await.unwrap().len(), 1);

    assert!(drain(resource).await.is_err());
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_degraded_stream_plays_once_upstream_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stream"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/stream"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"audio".to_vec()))
        .mount(&server)
        .await;

    let provider = RadioStreamProvider::new(client_for(&server), 0.5);
    let resource = provider.acquire().await.unwrap();

    assert!(resource.is_degraded());
    assert_eq!(drain(resource).await.unwrap(), b"audio".to_vec());
}

#[tokio::test]
async fn test_detailed_stats_from_status_api() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/status"))
        .and(header("user-agent", "HiiZun-HitsTV-Bot/1.0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "streaming": {
                "currentTrack": { "title": "07 Midnight City.mp4", "position": 185 },
                "listeners": 42,
                "isLive": true,
                "station": { "name": "Hits", "description": "All day", "bitrate": 192 }
            },
            "totalTracks": 1200,
            "shuffle": true,
            "uptime": 7300
        })))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let stats = client.detailed_stats().await;

    assert_eq!(stats.current_song, "Midnight City");
    assert_eq!(stats.position, "3:05");
    assert_eq!(stats.total_listeners, 42);
    assert_eq!(stats.total_tracks, 1200);
    assert_eq!(stats.bitrate, 192);
    assert_eq!(stats.uptime_hours, 2);
    assert_eq!(stats.station_name, "Hits");
    assert_eq!(stats.station_description, "All day");
    assert!(stats.shuffle);
    assert!(stats.live);
}

#[tokio::test]
async fn test_status_failure_returns_fallback_document() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/status"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = client_for(&server);
    assert!(client.try_fetch_status().await.is_err());

    let status = client.fetch_status().await;
    assert!(status.fallback);
    assert_eq!(status.extra["currentMedia"]["title"], json!("Test FM"));
    assert_eq!(client.current_song_title().await, "Test FM");
}

#[tokio::test]
async fn test_access_token_is_sent_to_status_api() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/status"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "currentTrack": { "title": "Song" }
        })))
        .mount(&server)
        .await;

    let client = RadioClient::builder()
        .status_url(format!("{}/api/status", server.uri()))
        .access_token("secret")
        .build()
        .unwrap();

    assert_eq!(client.current_song_title().await, "Song");
}
