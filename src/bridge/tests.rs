use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::broker::PublishError;

const TIMEOUT: Duration = Duration::from_secs(10);

fn bridge(cancel: &CancellationToken) -> Bridge {
    Bridge::new(
        &BridgeConfig {
            device: "main".to_string(),
            status_timeout: TIMEOUT,
        },
        cancel.clone(),
        None,
    )
}

/// Records every publish; optionally fails them all
#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<(String, Bytes)>>,
    fail: bool,
}

impl CommandPublisher for RecordingPublisher {
    fn publish_command(&self, topic: &str, payload: Bytes) -> Result<(), PublishError> {
        if self.fail {
            return Err(PublishError::NotServing);
        }
        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }
}

/// Answers `Status0` requests the way the device does
struct FakeDevice {
    sink: ReplySink,
    reply: &'static str,
}

impl CommandPublisher for FakeDevice {
    fn publish_command(&self, topic: &str, _payload: Bytes) -> Result<(), PublishError> {
        if topic == "cmnd/main/Status0" {
            self.sink.deliver(Bytes::from_static(self.reply.as_bytes()));
        }
        Ok(())
    }
}

/// Let spawned tasks run up to their next suspension point
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_commands_published_in_order() {
    let cancel = CancellationToken::new();
    let Bridge {
        handle, dispatcher, ..
    } = bridge(&cancel);

    let publisher = Arc::new(RecordingPublisher::default());
    let task = tokio::spawn({
        let publisher = publisher.clone();
        async move { dispatcher.run(&*publisher).await }
    });

    for command in Command::ALL {
        while handle.enqueue(command).is_err() {
            settle().await;
        }
    }
    // Closing the channel lets the dispatcher drain and stop
    drop(handle);
    task.await.unwrap().unwrap();

    assert_eq!(
        *publisher.published.lock(),
        vec![
            ("cmnd/main/Power".to_string(), Bytes::from_static(b"ON")),
            ("cmnd/main/Power".to_string(), Bytes::from_static(b"OFF")),
            ("cmnd/main/Power".to_string(), Bytes::from_static(b"TOGGLE")),
            ("cmnd/main/Status0".to_string(), Bytes::new()),
        ]
    );
}

#[tokio::test]
async fn test_enqueue_fails_when_channel_holds_command() {
    let cancel = CancellationToken::new();
    let bridge = bridge(&cancel);

    assert_eq!(bridge.handle.enqueue(Command::PowerOn), Ok(()));
    assert_eq!(
        bridge.handle.enqueue(Command::PowerOff),
        Err(BridgeError::Unavailable)
    );
}

#[tokio::test]
async fn test_enqueue_fails_when_dispatcher_gone() {
    let cancel = CancellationToken::new();
    let Bridge {
        handle, dispatcher, ..
    } = bridge(&cancel);
    drop(dispatcher);

    assert_eq!(
        handle.enqueue(Command::PowerOn),
        Err(BridgeError::Unavailable)
    );
}

#[tokio::test(start_paused = true)]
async fn test_status_round_trip_through_dispatcher() {
    let cancel = CancellationToken::new();
    let Bridge {
        handle,
        reply_sink,
        dispatcher,
    } = bridge(&cancel);

    let device = FakeDevice {
        sink: reply_sink,
        reply: r#"{"Status":{"Power":"ON"}}"#,
    };
    let task = tokio::spawn(async move { dispatcher.run(&device).await });

    let started = Instant::now();
    let reply = handle.status().await.unwrap();
    assert!(started.elapsed() < TIMEOUT);
    assert_eq!(
        serde_json::Value::Object(reply),
        json!({"Status": {"Power": "ON"}})
    );

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_status_timeout_leaves_channel_empty() {
    let cancel = CancellationToken::new();
    let bridge = bridge(&cancel);

    let started = Instant::now();
    assert_eq!(bridge.handle.status().await, Err(BridgeError::Timeout));
    assert!(started.elapsed() >= TIMEOUT);

    // Room for exactly one reply means nothing was left behind
    assert!(bridge.reply_sink.deliver(Bytes::from_static(b"{}")));
    assert!(!bridge.reply_sink.deliver(Bytes::from_static(b"{}")));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_reply() {
    let cancel = CancellationToken::new();
    let bridge = bridge(&cancel);

    let request = tokio::spawn({
        let handle = bridge.handle.clone();
        async move { handle.status().await }
    });
    settle().await;
    assert!(bridge
        .reply_sink
        .deliver(Bytes::from_static(b"not json")));

    match request.await.unwrap() {
        Err(BridgeError::MalformedReply(reason)) => assert!(!reason.is_empty()),
        other => panic!("expected malformed reply, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_non_object_reply_is_malformed() {
    let cancel = CancellationToken::new();
    let Bridge {
        handle,
        reply_sink,
        dispatcher,
    } = bridge(&cancel);

    let device = FakeDevice {
        sink: reply_sink,
        reply: "[1, 2]",
    };
    tokio::spawn(async move { dispatcher.run(&device).await });

    let err = handle.status().await.unwrap_err();
    assert!(matches!(err, BridgeError::MalformedReply(_)));
    assert!(err.to_string().starts_with("malformed reply: "));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_status_request_is_refused() {
    let cancel = CancellationToken::new();
    let bridge = bridge(&cancel);

    let first = tokio::spawn({
        let handle = bridge.handle.clone();
        async move { handle.status().await }
    });
    settle().await;

    assert_eq!(bridge.handle.status().await, Err(BridgeError::Unavailable));

    assert!(bridge
        .reply_sink
        .deliver(Bytes::from_static(br#"{"Status":{"Power":"OFF"}}"#)));
    let reply = first.await.unwrap().unwrap();
    assert_eq!(reply["Status"], json!({"Power": "OFF"}));
}

#[tokio::test(start_paused = true)]
async fn test_stale_reply_is_discarded() {
    let cancel = CancellationToken::new();
    let bridge = bridge(&cancel);

    // Arrives while nobody is waiting
    assert!(bridge
        .reply_sink
        .deliver(Bytes::from_static(br#"{"stale":true}"#)));

    let request = tokio::spawn({
        let handle = bridge.handle.clone();
        async move { handle.status().await }
    });
    settle().await;
    assert!(bridge
        .reply_sink
        .deliver(Bytes::from_static(br#"{"fresh":true}"#)));

    let reply = request.await.unwrap().unwrap();
    assert_eq!(reply.get("fresh"), Some(&json!(true)));
    assert!(reply.get("stale").is_none());
}

#[tokio::test]
async fn test_status_refused_when_command_channel_full() {
    let cancel = CancellationToken::new();
    let bridge = bridge(&cancel);

    bridge.handle.enqueue(Command::PowerOn).unwrap();
    assert_eq!(bridge.handle.status().await, Err(BridgeError::Unavailable));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_ends_status_wait() {
    let cancel = CancellationToken::new();
    let bridge = bridge(&cancel);

    let request = tokio::spawn({
        let handle = bridge.handle.clone();
        async move { handle.status().await }
    });
    settle().await;
    cancel.cancel();

    assert_eq!(request.await.unwrap(), Err(BridgeError::Unavailable));
}

#[tokio::test]
async fn test_dispatcher_skips_pending_commands_after_cancel() {
    let cancel = CancellationToken::new();
    let Bridge {
        handle, dispatcher, ..
    } = bridge(&cancel);

    handle.enqueue(Command::PowerOn).unwrap();
    cancel.cancel();

    let publisher = RecordingPublisher::default();
    assert_eq!(dispatcher.run(&publisher).await, Ok(()));
    assert!(publisher.published.lock().is_empty());
}

#[tokio::test]
async fn test_publish_failure_is_fatal() {
    let cancel = CancellationToken::new();
    let Bridge {
        handle, dispatcher, ..
    } = bridge(&cancel);

    handle.enqueue(Command::PowerToggle).unwrap();
    let publisher = RecordingPublisher {
        fail: true,
        ..Default::default()
    };

    let err = dispatcher.run(&publisher).await.unwrap_err();
    assert_eq!(
        err,
        DispatchError {
            command: Command::PowerToggle,
            source: PublishError::NotServing,
        }
    );
    assert_eq!(
        err.to_string(),
        "failed to publish power_toggle: broker is not serving"
    );
}

#[tokio::test(start_paused = true)]
async fn test_status_metrics_by_outcome() {
    let cancel = CancellationToken::new();
    let metrics = Arc::new(Metrics::new().unwrap());
    let bridge = Bridge::new(
        &BridgeConfig {
            device: "main".to_string(),
            status_timeout: Duration::from_secs(1),
        },
        cancel,
        Some(metrics.clone()),
    );

    assert_eq!(bridge.handle.status().await, Err(BridgeError::Timeout));
    assert_eq!(
        metrics
            .status_requests_total
            .with_label_values(&["timeout"])
            .get(),
        1
    );
    assert_eq!(
        metrics
            .commands_enqueued_total
            .with_label_values(&["request_status"])
            .get(),
        1
    );

    // The previous RequestStatus is still queued
    assert_eq!(bridge.handle.status().await, Err(BridgeError::Unavailable));
    assert_eq!(
        metrics
            .commands_rejected_total
            .with_label_values(&["request_status"])
            .get(),
        1
    );
}

#[tokio::test]
async fn test_status_pending_until_reply() {
    let cancel = CancellationToken::new();
    let Bridge {
        handle,
        reply_sink,
        dispatcher: _dispatcher,
    } = bridge(&cancel);

    let mut status = tokio_test::task::spawn(handle.status());
    tokio_test::assert_pending!(status.poll());

    assert!(reply_sink.deliver(Bytes::from_static(br#"{"Power":"ON"}"#)));
    assert!(status.is_woken());
    let reply = tokio_test::assert_ready_ok!(status.poll());
    assert_eq!(reply["Power"], "ON");
}
