//! Webhook notification delivery against a mock HTTP server

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use clipcast::notifications::{EngineEvent, NotificationChannel, NotificationManager, WebhookChannel};

fn sample_event() -> EngineEvent {
    EngineEvent::UploadSucceeded {
        entry_id: Uuid::new_v4(),
        schedule_id: Uuid::new_v4(),
        channel_id: Uuid::new_v4(),
        destination_url: "https://videos.example/watch/1".into(),
        at: Utc::now(),
    }
}

#[tokio::test]
async fn webhook_posts_event_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/engine"))
        .and(body_partial_json(serde_json::json!({
            "kind": "upload_succeeded",
            "severity": "info",
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let endpoint = url::Url::parse(&format!("{}/hooks/engine", server.uri())).unwrap();
    let channel = WebhookChannel::new(endpoint, Duration::from_secs(5)).unwrap();

    channel.deliver(&sample_event()).await.unwrap();
    server.verify().await;
}

#[tokio::test]
async fn webhook_surfaces_http_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let endpoint = url::Url::parse(&server.uri()).unwrap();
    let channel = WebhookChannel::new(endpoint, Duration::from_secs(5)).unwrap();

    assert!(channel.deliver(&sample_event()).await.is_err());
}

#[tokio::test]
async fn manager_retries_transient_webhook_failures() {
    let server = MockServer::start().await;
    // First attempt fails, the retry succeeds
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let endpoint = url::Url::parse(&server.uri()).unwrap();
    let mut manager = NotificationManager::new();
    manager.add_channel(Arc::new(
        WebhookChannel::new(endpoint, Duration::from_secs(5)).unwrap(),
    ));

    manager.notify(sample_event()).await;
    server.verify().await;
}
