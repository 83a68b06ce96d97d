//! Administrative-signal behavior, isolated in its own test binary because
//! signal disposition is process-global.

use std::sync::Arc;
use std::thread;

use pipekvs::{
    CONNECT_FRAME_SIZE, ClientConnection, Kvs, PipeHandle, SessionServer, Store,
    SubscribeOutcome, signal,
};

#[test]
fn usr1_closes_client_pipes_and_clears_subscriptions() {
    signal::install_server_handlers().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let intake = dir.path().join("intake");

    let store = Arc::new(Store::new());
    let kvs = Arc::new(Kvs::new(Arc::clone(&store)));
    kvs.write(&[("apple".to_string(), "red".to_string())]);

    let server = SessionServer::bind(Arc::clone(&kvs), &intake).unwrap();
    let stop = server.stop_handle();
    let server_thread = thread::spawn(move || server.run());

    let connection = ClientConnection::connect(
        &dir.path().join("reqA"),
        &dir.path().join("respA"),
        &dir.path().join("notifA"),
        &intake,
    )
    .unwrap();
    assert_eq!(
        connection.subscribe("apple").unwrap(),
        SubscribeOutcome::Subscribed
    );

    // The handler only sets a flag; the acceptor services it on its next
    // loop iteration, so nudge the loop with a junk frame after raising.
    unsafe {
        libc::raise(libc::SIGUSR1);
    }
    let junk = [0xFFu8; CONNECT_FRAME_SIZE];
    let nudge = PipeHandle::open_write(&intake).unwrap();
    nudge.write_all(&junk).unwrap();
    drop(nudge);

    // The sweep closes the session's pipes: the notification reader observes
    // end-of-input rather than an error.
    let reader = connection.notifications();
    assert!(reader.next().unwrap().is_none());

    // No subscriber survives the sweep: a later write reaches nobody.
    kvs.write(&[("apple".to_string(), "green".to_string())]);
    assert!(store.remove("apple").unwrap().is_empty());

    drop(connection);
    stop.stop();
    server_thread.join().unwrap().unwrap();
}
