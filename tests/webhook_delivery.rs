//! Webhook fan-out and per-subscriber event filtering (spec §8 scenario
//! S6). Spins up a bare-bones TCP listener that speaks just enough HTTP
//! to count requests, rather than pulling in a mocking crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use hypersdk_core::job::model::Job;
use hypersdk_core::job::{events::LifecycleListener, JobEvent};
use hypersdk_core::webhook::{Webhook, WebhookNotifier};

/// Accepts connections until `expected_hits` requests have been served,
/// responding 200 OK to each and recording how many arrived.
async fn spawn_counting_server(expected_hits: usize) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();

    tokio::spawn(async move {
        for _ in 0..expected_hits {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                .await;
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }
    });

    (format!("http://{addr}"), hits)
}

/// Serves one HTTP response per entry in `statuses`, in order, then keeps
/// no further connections open. Used to script a failing-then-succeeding
/// endpoint for the retry/backoff path.
async fn spawn_scripted_server(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();

    tokio::spawn(async move {
        for status in statuses {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let reason = if status == 200 { "OK" } else { "Internal Server Error" };
            let response = format!("HTTP/1.1 {status} {reason}\r\ncontent-length: 0\r\n\r\n");
            let _ = socket.write_all(response.as_bytes()).await;
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }
    });

    (format!("http://{addr}"), hits)
}

fn sample_job() -> Job {
    Job::builder()
        .name("export vm-1")
        .payload(serde_json::json!({}))
        .build()
}

#[tokio::test]
async fn subscribed_webhook_receives_matching_event() {
    let (url, hits) = spawn_counting_server(1).await;
    let notifier = WebhookNotifier::new(reqwest::Client::new());
    notifier
        .register(Webhook::builder().url(url).events(vec!["completed".to_string()]).build())
        .await;

    notifier.on_event(JobEvent::completed(&sample_job())).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unsubscribed_event_name_does_not_trigger_delivery() {
    let (url, hits) = spawn_counting_server(0).await;
    let notifier = WebhookNotifier::new(reqwest::Client::new());
    notifier
        .register(Webhook::builder().url(url).events(vec!["failed".to_string()]).build())
        .await;

    notifier.on_event(JobEvent::completed(&sample_job())).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn two_matching_webhooks_both_receive_the_event() {
    let (url_a, hits_a) = spawn_counting_server(1).await;
    let (url_b, hits_b) = spawn_counting_server(1).await;
    let notifier = WebhookNotifier::new(reqwest::Client::new());
    notifier.register(Webhook::builder().url(url_a).build()).await;
    notifier.register(Webhook::builder().url(url_b).build()).await;

    notifier.on_event(JobEvent::created(&sample_job())).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hits_a.load(Ordering::SeqCst), 1);
    assert_eq!(hits_b.load(Ordering::SeqCst), 1);
}

/// Spec §8 scenario S6: one endpoint returns 500 twice then 200 on a
/// `retry=3` subscription; two other matching subscriptions each see it
/// exactly once. Exercises the backoff path in `notifier.rs`, not just the
/// success-path fan-out the other tests here cover.
#[tokio::test]
async fn failing_endpoint_is_retried_while_others_see_it_once() {
    let (flaky_url, flaky_hits) = spawn_scripted_server(vec![500, 500, 200]).await;
    let (url_a, hits_a) = spawn_counting_server(1).await;
    let (url_b, hits_b) = spawn_counting_server(1).await;

    let notifier = WebhookNotifier::new(reqwest::Client::new());
    notifier
        .register(
            Webhook::builder()
                .url(flaky_url)
                .events(vec!["completed".to_string()])
                .max_retries(3u32)
                .build(),
        )
        .await;
    notifier
        .register(Webhook::builder().url(url_a).events(vec!["completed".to_string()]).build())
        .await;
    notifier
        .register(Webhook::builder().url(url_b).events(vec!["completed".to_string()]).build())
        .await;

    notifier.on_event(JobEvent::completed(&sample_job())).await;

    // Backoff is 2^1 + 2^2 = 6s between the flaky endpoint's three
    // attempts; give it headroom.
    tokio::time::sleep(Duration::from_secs(8)).await;

    assert_eq!(flaky_hits.load(Ordering::SeqCst), 3);
    assert_eq!(hits_a.load(Ordering::SeqCst), 1);
    assert_eq!(hits_b.load(Ordering::SeqCst), 1);
}
