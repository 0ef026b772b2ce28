mod common;

use std::time::Duration;

use common::{fixture, fixture_with};
use futures::StreamExt;
use jobqueue_core::{
    config::{QueueEventsOptions, QueueOptions},
    models::{EventId, EventKind},
    QueueError,
};
use jobqueue_domain::{NewJob, QueueEvents};

#[tokio::test]
async fn test_read_from_position_has_no_gaps() {
    let f = fixture();
    let events = QueueEvents::new(f.store.clone(), f.lifecycle.options(), None);
    f.lifecycle.enqueue(NewJob::new("a", "1")).await.unwrap();
    let marker = events.last_event_id().await.unwrap().unwrap();
    f.lifecycle.enqueue(NewJob::new("b", "2")).await.unwrap();
    f.lifecycle.enqueue(NewJob::new("c", "3")).await.unwrap();

    let after = events.read(marker, 100).await.unwrap();
    let kinds: Vec<(Option<String>, EventKind)> = after
        .iter()
        .map(|event| (event.job_id.clone(), event.kind))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (Some("2".to_string()), EventKind::Enqueued),
            (Some("2".to_string()), EventKind::Waiting),
            (Some("3".to_string()), EventKind::Enqueued),
            (Some("3".to_string()), EventKind::Waiting),
        ]
    );
    assert!(after.windows(2).all(|pair| pair[0].id < pair[1].id));
    assert!(after.iter().all(|event| event.id > marker));
}

#[tokio::test]
async fn test_subscription_receives_live_events() {
    let f = fixture();
    let events = QueueEvents::new(
        f.store.clone(),
        f.lifecycle.options(),
        Some(QueueEventsOptions {
            blocking_timeout_ms: 200,
            ..Default::default()
        }),
    );
    let mut subscription = events.subscribe(None).await.unwrap();

    f.lifecycle.enqueue(NewJob::new("live", "{}")).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.kind, EventKind::Enqueued);
    assert_eq!(first.job_id.as_deref(), Some("1"));

    subscription.unsubscribe();
    let end = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(item) = subscription.next().await {
            item.unwrap();
        }
    })
    .await;
    assert!(end.is_ok());
}

#[tokio::test]
async fn test_resubscribe_from_last_seen() {
    let f = fixture();
    let events = QueueEvents::new(f.store.clone(), f.lifecycle.options(), None);
    f.lifecycle.enqueue(NewJob::new("a", "{}")).await.unwrap();
    f.lifecycle.pause().await.unwrap();

    let mut subscription = events.subscribe(Some(EventId::ZERO)).await.unwrap();
    let first = subscription.next().await.unwrap().unwrap();
    subscription.unsubscribe();

    let mut resumed = events.subscribe(Some(first.id)).await.unwrap();
    let kinds: Vec<EventKind> = resumed
        .by_ref()
        .take(2)
        .map(|item| item.unwrap().kind)
        .collect()
        .await;
    assert_eq!(kinds, vec![EventKind::Waiting, EventKind::Paused]);
    resumed.unsubscribe();
}

#[tokio::test]
async fn test_trimmed_stream_is_reported() {
    let f = fixture_with(QueueOptions::new("short").with_events_max_len(2));
    let events = QueueEvents::new(f.store.clone(), f.lifecycle.options(), None);
    for name in ["a", "b", "c"] {
        f.lifecycle.enqueue(NewJob::new(name, "{}")).await.unwrap();
    }

    let err = events.read(EventId::ZERO, 10).await.unwrap_err();
    assert!(matches!(err, QueueError::EventsTrimmed { .. }));

    let mut subscription = events.subscribe(Some(EventId::ZERO)).await.unwrap();
    let first = subscription.next().await.unwrap();
    assert!(matches!(first, Err(QueueError::EventsTrimmed { .. })));
    assert!(subscription.next().await.is_none());
}

#[tokio::test]
async fn test_invalid_configured_event_id() {
    let f = fixture();
    let events = QueueEvents::new(
        f.store.clone(),
        f.lifecycle.options(),
        Some(QueueEventsOptions {
            last_event_id: Some("not-an-id".to_string()),
            ..Default::default()
        }),
    );
    assert!(events.subscribe(None).await.is_err());
}
