//! Live queries driven by the change feed.

use crossbeam_channel::{unbounded, Receiver};
use livequery::{
    BackoffConfig, DocumentId, ListenerConfig, ListenerEvent, LiveStore, LiveStoreConfig,
    MemoryStore, Notification, ObserveCallbacks, ObserverStatus,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn live_store() -> (Arc<MemoryStore>, LiveStore) {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let config = LiveStoreConfig::new("db").with_listener(ListenerConfig::default().with_backoff(
        BackoffConfig::new(Duration::from_millis(10), Duration::from_millis(5)),
    ));
    let live = LiveStore::with_change_feed(store.clone(), store.clone(), config).unwrap();
    (store, live)
}

fn next(rx: &Receiver<Notification>) -> Notification {
    rx.recv_timeout(WAIT).expect("notification not received in time")
}

// --- Scenarios ---

#[test]
fn test_insert_then_replace_echo() {
    let (_store, live) = live_store();
    let dolls = live.collection("dollhouse");
    let (callbacks, rx) = ObserveCallbacks::channel();
    let handle = dolls.find(json!({"_id": "echo"})).unwrap().observe(callbacks).unwrap();

    dolls.insert(json!({"_id": "echo", "age": 10})).unwrap();
    assert_eq!(
        next(&rx),
        Notification::Added {
            document: json!({"_id": "echo", "age": 10}),
            index: 0
        }
    );

    dolls.save(json!({"_id": "echo", "age": 100})).unwrap();
    assert_eq!(
        next(&rx),
        Notification::Changed {
            before: None,
            after: json!({"_id": "echo", "age": 100}),
            index: 0
        }
    );

    handle.stop();
}

#[test]
fn test_update_leaving_filter_is_removed() {
    let (_store, live) = live_store();
    let dolls = live.collection("dollhouse");
    let (callbacks, rx) = ObserveCallbacks::channel();
    let handle = dolls
        .find(json!({"age": {"$gte": 10}}))
        .unwrap()
        .observe(callbacks)
        .unwrap();

    dolls.insert(json!({"_id": "echo", "age": 10})).unwrap();
    assert!(matches!(next(&rx), Notification::Added { index: 0, .. }));

    dolls
        .update(&DocumentId::new("echo"), &json!({"$set": {"age": 5}}), false)
        .unwrap();
    assert_eq!(
        next(&rx),
        Notification::Removed {
            document: json!({"_id": "echo", "age": 5}),
            index: 0
        }
    );
    assert!(handle.membership().is_empty());
}

#[test]
fn test_partial_update_delivers_full_document() {
    let (_store, live) = live_store();
    let dolls = live.collection("dollhouse");
    dolls
        .insert(json!({"_id": "beauty", "name": "Beauty", "stats": {"age": 16}}))
        .unwrap();

    let (callbacks, rx) = ObserveCallbacks::channel();
    let _handle = dolls.find(json!({})).unwrap().observe(callbacks).unwrap();
    assert!(matches!(next(&rx), Notification::Added { .. }));

    dolls
        .update(&DocumentId::new("beauty"), &json!({"$inc": {"stats.age": 1}}), false)
        .unwrap();
    assert_eq!(
        next(&rx),
        Notification::Changed {
            before: None,
            after: json!({"_id": "beauty", "name": "Beauty", "stats": {"age": 17}}),
            index: 0
        }
    );
}

// --- Initialization ---

#[test]
fn test_initial_documents_not_added_twice() {
    let (_store, live) = live_store();
    let dolls = live.collection("dollhouse");
    dolls.insert(json!({"_id": "echo4"})).unwrap();

    let (callbacks, rx) = ObserveCallbacks::channel();
    let handle = dolls.find(json!({})).unwrap().observe(callbacks).unwrap();
    assert_eq!(
        next(&rx),
        Notification::Added {
            document: json!({"_id": "echo4"}),
            index: 0
        }
    );

    dolls.insert(json!({"_id": "echo2"})).unwrap();
    assert_eq!(
        next(&rx),
        Notification::Added {
            document: json!({"_id": "echo2"}),
            index: 1
        }
    );
    assert!(rx.try_recv().is_err());
    assert_eq!(
        handle.membership(),
        vec![DocumentId::new("echo4"), DocumentId::new("echo2")]
    );
}

#[test]
fn test_skip_inside_added_drains_result() {
    let (_store, live) = live_store();
    let dolls = live.collection("dollhouse");
    for id in ["echo", "echo2", "echo3"] {
        dolls.insert(json!({"_id": id})).unwrap();
    }
    // Let the inserts pass through the feed before anyone listens.
    let listener = live.listener().unwrap().clone();
    wait_until(|| listener.diagnostics().entries_received >= 3);

    let cursor = dolls.find(json!({})).unwrap();
    cursor.limit(1);

    let (tx, rx) = unbounded();
    let skip = Arc::new(AtomicUsize::new(0));
    let callbacks = {
        let cursor = cursor.clone();
        ObserveCallbacks::new().on_added(move |document, _| {
            let n = skip.fetch_add(1, Ordering::SeqCst) + 1;
            cursor.skip(n);
            let _ = tx.send(document);
        })
    };
    let handle = cursor.observe(callbacks).unwrap();

    let seen: Vec<_> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(
        seen,
        vec![json!({"_id": "echo"}), json!({"_id": "echo2"}), json!({"_id": "echo3"})]
    );
    assert!(cursor.to_vec().unwrap().is_empty());
    wait_until(|| handle.membership().is_empty());
    assert!(rx.try_recv().is_err());
    handle.stop();
}

#[test]
fn test_init_callback_receives_snapshot() {
    let (_store, live) = live_store();
    let dolls = live.collection("dollhouse");
    dolls.insert(json!({"_id": "a", "n": 1})).unwrap();
    dolls.insert(json!({"_id": "b", "n": 2})).unwrap();

    let (tx, rx) = crossbeam_channel::unbounded();
    let callbacks = ObserveCallbacks::new().on_init(move |docs| {
        let _ = tx.send(docs);
    });
    let cursor = dolls.find(json!({"n": {"$gt": 1}})).unwrap();
    let _handle = cursor.observe(callbacks).unwrap();

    assert_eq!(rx.try_recv().unwrap(), vec![json!({"_id": "b", "n": 2})]);
}

#[test]
fn test_invalid_filter_rejected() {
    let (_store, live) = live_store();
    let dolls = live.collection("dollhouse");
    assert!(dolls.find(json!({"age": {"$near": 1}})).is_err());
    assert!(dolls.find(json!([1, 2])).is_err());
}

// --- Stop ---

#[test]
fn test_stop_is_idempotent_and_final() {
    let (_store, live) = live_store();
    let dolls = live.collection("dollhouse");

    let (callbacks, stopped_rx) = ObserveCallbacks::channel();
    let handle = dolls.find(json!({})).unwrap().observe(callbacks).unwrap();
    handle.stop();
    handle.stop();
    handle.dispose();
    assert_eq!(handle.status(), ObserverStatus::Stopped);

    // A second observer sees both entries; once it has seen the last one,
    // the stopped observer has had its chance too.
    let (callbacks, witness_rx) = ObserveCallbacks::channel();
    let _witness = dolls.find(json!({})).unwrap().observe(callbacks).unwrap();
    dolls.insert(json!({"_id": "a"})).unwrap();
    dolls.insert(json!({"_id": "b"})).unwrap();
    assert!(matches!(next(&witness_rx), Notification::Added { index: 0, .. }));
    assert!(matches!(next(&witness_rx), Notification::Added { index: 1, .. }));

    assert!(stopped_rx.try_recv().is_err());
    assert!(handle.membership().is_empty());
}

#[test]
fn test_dropping_handle_releases_subscription() {
    let (_store, live) = live_store();
    let dolls = live.collection("dollhouse");
    let listener = live.listener().unwrap().clone();

    let handle = dolls.find(json!({})).unwrap().observe(ObserveCallbacks::new()).unwrap();
    dolls.insert(json!({"_id": "a"})).unwrap();
    wait_until(|| listener.subscription_count() == 1);

    drop(handle);
    wait_until(|| listener.subscription_count() == 0);
}

// --- Connection ---

#[test]
fn test_observer_survives_reconnect() {
    let (store, live) = live_store();
    let dolls = live.collection("dollhouse");
    let events = live.listener().unwrap().events();

    let (callbacks, rx) = ObserveCallbacks::channel();
    let _handle = dolls.find(json!({})).unwrap().observe(callbacks).unwrap();

    store.interrupt_feed();
    let deadline = std::time::Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        match events.recv_timeout(remaining) {
            Ok(ListenerEvent::Reconnected { subscriptions }) => {
                assert_eq!(subscriptions, 1);
                break;
            }
            Ok(_) => continue,
            Err(e) => panic!("no reconnect: {e}"),
        }
    }

    dolls.insert(json!({"_id": "after"})).unwrap();
    assert_eq!(
        next(&rx),
        Notification::Added {
            document: json!({"_id": "after"}),
            index: 0
        }
    );
    assert_eq!(live.listener().unwrap().diagnostics().reconnects, 1);
}

fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + WAIT;
    while !check() {
        assert!(std::time::Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}
