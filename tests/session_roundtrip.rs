//! End-to-end session tests over real named pipes.

use std::sync::Arc;
use std::thread;

use pipekvs::{
    ClientConnection, Kvs, MAX_CLIENT_SUBSCRIPTIONS, SessionServer, Store, SubscribeOutcome,
    UnsubscribeOutcome,
};

fn pairs(input: &[(&str, &str)]) -> Vec<(String, String)> {
    input
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn subscribe_notify_disconnect_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let intake = dir.path().join("intake");

    let store = Arc::new(Store::new());
    let kvs = Arc::new(Kvs::new(Arc::clone(&store)));
    kvs.write(&pairs(&[("apple", "red")]));

    let server = SessionServer::bind(Arc::clone(&kvs), &intake).unwrap();
    let stop = server.stop_handle();
    let server_thread = thread::spawn(move || server.run());

    let connection = ClientConnection::connect(
        &dir.path().join("req1"),
        &dir.path().join("resp1"),
        &dir.path().join("notif1"),
        &intake,
    )
    .unwrap();

    // Subscribe acks report whether the key exists.
    assert_eq!(
        connection.subscribe("apple").unwrap(),
        SubscribeOutcome::Subscribed
    );
    assert_eq!(
        connection.subscribe("missing").unwrap(),
        SubscribeOutcome::KeyMissing
    );

    // A write after the subscribe ack must reach the notification pipe.
    kvs.write(&pairs(&[("apple", "green")]));
    let reader = connection.notifications();
    let update = reader.next().unwrap().unwrap();
    assert_eq!(update.key, "apple");
    assert_eq!(update.value, "green");
    assert!(!update.is_delete());

    // A delete delivers the sentinel to the former subscriber.
    let mut sink: Vec<u8> = Vec::new();
    kvs.delete(&["apple".to_string()], &mut sink).unwrap();
    assert!(sink.is_empty());
    let removal = reader.next().unwrap().unwrap();
    assert_eq!(removal.key, "apple");
    assert!(removal.is_delete());

    // Consuming the DELETED frame freed the ledger slot, so the ledger is
    // empty again and the unsubscribe is refused locally.
    assert_eq!(
        connection.unsubscribe("apple").unwrap(),
        UnsubscribeOutcome::NoSubscriptions
    );

    connection.disconnect().unwrap();
    stop.stop();
    server_thread.join().unwrap().unwrap();

    // Session cleanup swept the notification sink out of every entry.
    kvs.write(&pairs(&[("apple", "blue")]));
    assert!(store.remove("apple").unwrap().is_empty());
}

#[test]
fn subscription_ledger_refuses_duplicates_and_enforces_the_cap() {
    let dir = tempfile::tempdir().unwrap();
    let intake = dir.path().join("intake");

    let store = Arc::new(Store::new());
    let kvs = Arc::new(Kvs::new(Arc::clone(&store)));
    let keys: Vec<String> = (0..=MAX_CLIENT_SUBSCRIPTIONS)
        .map(|i| format!("key{i}"))
        .collect();
    for key in &keys {
        kvs.write(&pairs(&[(key, "value")]));
    }

    let server = SessionServer::bind(Arc::clone(&kvs), &intake).unwrap();
    let stop = server.stop_handle();
    let server_thread = thread::spawn(move || server.run());

    let connection = ClientConnection::connect(
        &dir.path().join("req9"),
        &dir.path().join("resp9"),
        &dir.path().join("notif9"),
        &intake,
    )
    .unwrap();

    assert_eq!(
        connection.subscribe(&keys[0]).unwrap(),
        SubscribeOutcome::Subscribed
    );
    assert_eq!(
        connection.subscribe(&keys[0]).unwrap(),
        SubscribeOutcome::AlreadySubscribed
    );
    for key in &keys[1..MAX_CLIENT_SUBSCRIPTIONS] {
        assert_eq!(connection.subscribe(key).unwrap(), SubscribeOutcome::Subscribed);
    }
    assert_eq!(
        connection.subscribe(&keys[MAX_CLIENT_SUBSCRIPTIONS]).unwrap(),
        SubscribeOutcome::LimitReached
    );

    // Unsubscribing a key the ledger never recorded is refused locally.
    assert_eq!(
        connection.unsubscribe("never").unwrap(),
        UnsubscribeOutcome::NotSubscribed
    );

    // Dropping one subscription frees a slot for the key past the cap.
    assert_eq!(
        connection.unsubscribe(&keys[0]).unwrap(),
        UnsubscribeOutcome::Unsubscribed
    );
    assert_eq!(
        connection.subscribe(&keys[MAX_CLIENT_SUBSCRIPTIONS]).unwrap(),
        SubscribeOutcome::Subscribed
    );

    connection.disconnect().unwrap();
    stop.stop();
    server_thread.join().unwrap().unwrap();
}

#[test]
fn several_clients_share_the_worker_pool() {
    let dir = tempfile::tempdir().unwrap();
    let intake = dir.path().join("intake");

    let store = Arc::new(Store::new());
    let kvs = Arc::new(Kvs::new(Arc::clone(&store)));
    kvs.write(&pairs(&[("shared", "value")]));

    let server = SessionServer::bind(Arc::clone(&kvs), &intake).unwrap();
    let stop = server.stop_handle();
    let server_thread = thread::spawn(move || server.run());

    let clients: Vec<_> = (0..3)
        .map(|i| {
            let dir = dir.path().to_path_buf();
            let intake = intake.clone();
            thread::spawn(move || {
                let connection = ClientConnection::connect(
                    &dir.join(format!("req{i}")),
                    &dir.join(format!("resp{i}")),
                    &dir.join(format!("notif{i}")),
                    &intake,
                )
                .unwrap();
                assert_eq!(
                    connection.subscribe("shared").unwrap(),
                    SubscribeOutcome::Subscribed
                );
                connection
            })
        })
        .collect();
    let connections: Vec<_> = clients.into_iter().map(|c| c.join().unwrap()).collect();

    kvs.write(&pairs(&[("shared", "updated")]));
    for connection in &connections {
        let update = connection.notifications().next().unwrap().unwrap();
        assert_eq!(update.key, "shared");
        assert_eq!(update.value, "updated");
    }

    for connection in connections {
        connection.disconnect().unwrap();
    }
    stop.stop();
    server_thread.join().unwrap().unwrap();
}
