//! Unit tests for the pub/sub bus.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::msg::Message;

fn counter_handler(counter: Arc<AtomicUsize>) -> impl Handler {
    move |_subject: String, _msg: Message| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn publish_reaches_matching_subscribers_exactly_once() {
    let bus = PubSub::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let _guard = bus.subscribe("a.*", counter_handler(Arc::clone(&hits))).unwrap();

    bus.publish("a.b", Message::new(json!(1))).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    bus.publish("b.b", Message::new(json!(1))).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn no_delivery_after_cancel() {
    let bus = PubSub::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let guard = bus.subscribe("a.b", counter_handler(Arc::clone(&hits))).unwrap();

    bus.publish("a.b", Message::new(json!(1))).await.unwrap();
    guard.cancel();
    bus.publish("a.b", Message::new(json!(2))).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Cancelling twice is a no-op.
    guard.cancel();
    assert_eq!(bus.subscription_count(), 0);
}

#[tokio::test]
async fn dropping_the_guard_cancels() {
    let bus = PubSub::new();
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let _guard = bus.subscribe("a.b", counter_handler(Arc::clone(&hits))).unwrap();
        bus.publish("a.b", Message::new(json!(1))).await.unwrap();
    }
    bus.publish("a.b", Message::new(json!(2))).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn handlers_see_subject_and_payload() {
    let bus = PubSub::new();
    let seen: Arc<Mutex<Vec<(String, Message)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _guard = bus
        .subscribe("flow.*.stage.>", move |subject: String, msg: Message| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push((subject, msg));
            }
        })
        .unwrap();

    let msg = Message::new(json!({"k": "v"}));
    bus.publish("flow.f1.stage.s1.port.out", msg.clone())
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "flow.f1.stage.s1.port.out");
    assert_eq!(seen[0].1, msg);
}

#[tokio::test]
async fn debug_subscriber_receives_match_result() {
    let bus = PubSub::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let _plain = bus.subscribe("a.b", counter_handler(Arc::clone(&hits))).unwrap();

    let observed = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&observed);
    let _debug = bus
        .subscribe_debug(
            "a.>",
            move |_subject: String, _msg: Message, matches: MatchedSubscribers| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.store(matches.plain.len(), Ordering::SeqCst);
                }
            },
        )
        .unwrap();

    bus.publish("a.b", Message::new(json!(1))).await.unwrap();
    // The debug subscriber saw both subscriptions in the match result.
    assert_eq!(observed.load(Ordering::SeqCst), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn subscriber_records_caller_location() {
    let bus = PubSub::new();
    let guard = bus
        .subscribe("a.b", |_subject: String, _msg: Message| async {})
        .unwrap();
    // The guard exposes only the id; location is carried on the matched
    // subscriber, visible to debug subscriptions.
    let seen = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&seen);
    let _debug = bus
        .subscribe_debug(
            "a.b",
            move |_s: String, _m: Message, matches: MatchedSubscribers| {
                let sink = Arc::clone(&sink);
                async move {
                    for sub in &matches.plain {
                        if !sub.is_debug() {
                            *sink.lock().unwrap() = sub.location().file().to_string();
                        }
                    }
                }
            },
        )
        .unwrap();
    bus.publish("a.b", Message::new(json!(null))).await.unwrap();
    assert!(seen.lock().unwrap().contains("tests.rs"));
    drop(guard);
}

#[tokio::test]
async fn channel_subscription_forwards_and_closes_on_cancel() {
    let bus = PubSub::new();
    let token = CancellationToken::new();
    let mut rx = bus.subscribe_channel("a.b", 4, token.clone()).unwrap();

    bus.publish("a.b", Message::new(json!(1))).await.unwrap();
    bus.publish("a.b", Message::new(json!(2))).await.unwrap();

    assert_eq!(rx.recv().await.unwrap().data(), &json!(1));
    assert_eq!(rx.recv().await.unwrap().data(), &json!(2));

    token.cancel();
    // The reaper cancels the subscription and the sender side drops.
    tokio::time::timeout(Duration::from_secs(1), async {
        while rx.recv().await.is_some() {}
    })
    .await
    .expect("channel should close after cancellation");
    assert_eq!(bus.subscription_count(), 0);
}

#[tokio::test]
async fn publish_rejects_wildcard_subjects() {
    let bus = PubSub::new();
    let err = bus.publish("a.*", Message::new(json!(1))).await.unwrap_err();
    assert!(matches!(err, SubjectError::InvalidToken { .. }));
}

#[tokio::test]
async fn install_order_is_delivery_order_within_one_publish() {
    let bus = PubSub::new();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let first = Arc::clone(&order);
    let _g1 = bus
        .subscribe("a.b", move |_s: String, _m: Message| {
            let order = Arc::clone(&first);
            async move {
                order.lock().unwrap().push("first");
            }
        })
        .unwrap();
    let second = Arc::clone(&order);
    let _g2 = bus
        .subscribe("a.b", move |_s: String, _m: Message| {
            let order = Arc::clone(&second);
            async move {
                order.lock().unwrap().push("second");
            }
        })
        .unwrap();

    for _ in 0..3 {
        bus.publish("a.b", Message::new(json!(null))).await.unwrap();
    }
    let order = order.lock().unwrap();
    assert_eq!(
        order.as_slice(),
        ["first", "second", "first", "second", "first", "second"]
    );
}
