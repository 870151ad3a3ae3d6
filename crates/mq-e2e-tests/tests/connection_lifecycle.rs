//! E2E tests for connect, refusal, failure, ping and disconnect against a
//! live broker.

mod helpers;

use std::time::Duration;

use mq_connection::{ConnectOptions, ConnectReturnCode, ErrorCode, ReconnectOptions, SocketOptions};
use mq_protocol::Packet;

use helpers::{Recorder, TestBroker};

/// An accepted CONNACK reaches the handler and the broker sees our CONNECT.
#[tokio::test]
async fn e2e_connack_accepted() {
    let broker = TestBroker::start().await;
    let client = helpers::client();
    let connection = helpers::connection(&client, &broker);

    let mut events = Recorder::new();
    let tx = events.sender();
    connection.set_on_connack(move |_, code, session_present| {
        tx.send(format!("connack {code} {session_present}")).unwrap();
    });
    connection.connect("lifecycle-1", true, 30).unwrap();
    assert_eq!(events.next().await, "connack accepted false");

    broker
        .wait_for("lifecycle-1", |packets| {
            matches!(packets.first(), Some(Packet::Connect(c)) if c.keep_alive == 30 && c.clean_session)
        })
        .await;
    assert_eq!(broker.connected_clients(), vec!["lifecycle-1".to_string()]);
}

/// A refused CONNACK is terminal: the handler sees the code, and the
/// connection can try again.
#[tokio::test]
async fn e2e_connack_refused() {
    let broker = TestBroker::start().await;
    broker.refuse_with(ConnectReturnCode::NotAuthorized);
    let client = helpers::client();
    let connection = helpers::connection(&client, &broker);

    let mut events = Recorder::new();
    let tx = events.sender();
    connection.set_on_connack(move |_, code, _| {
        tx.send(format!("connack {code}")).unwrap();
    });
    let tx = events.sender();
    connection.set_on_connection_failed(move |_, code| {
        tx.send(format!("failed {code}")).unwrap();
    });

    connection.connect("refused-1", true, 30).unwrap();
    assert_eq!(events.next().await, "connack not authorized");
    events.assert_quiet(Duration::from_millis(200)).await;

    // The attempt is over, so a new one is allowed.
    connection.connect("refused-1", true, 30).unwrap();
    assert_eq!(events.next().await, "connack not authorized");
}

/// Nothing listening: the connection-failed handler fires once.
#[tokio::test]
async fn e2e_connection_failure() {
    let port = helpers::closed_port().await;
    let client = helpers::client();
    let connection = client.new_connection("127.0.0.1", port, &SocketOptions::default(), None);
    assert!(connection.is_valid());

    let mut events = Recorder::new();
    let tx = events.sender();
    connection.set_on_connection_failed(move |_, code| {
        assert_ne!(code, ErrorCode::Success);
        tx.send("failed".to_string()).unwrap();
    });
    let tx = events.sender();
    connection.set_on_connack(move |_, _, _| {
        tx.send("connack".to_string()).unwrap();
    });

    connection.connect("nobody-home", true, 30).unwrap();
    assert_eq!(events.next().await, "failed");
    events.assert_quiet(Duration::from_millis(200)).await;
}

/// Graceful disconnect sends DISCONNECT and fires the handler once.
#[tokio::test]
async fn e2e_disconnect() {
    let broker = TestBroker::start().await;
    let client = helpers::client();
    let connection = helpers::connection(&client, &broker);
    helpers::connect(&connection, "bye-1").await;

    let mut events = Recorder::new();
    let tx = events.sender();
    connection.set_on_disconnect(move |_| {
        tx.send("disconnected".to_string()).unwrap();
    });
    connection.disconnect().unwrap();
    assert_eq!(events.next().await, "disconnected");

    broker
        .wait_for("bye-1", |packets| matches!(packets.last(), Some(Packet::Disconnect)))
        .await;
    events.assert_quiet(Duration::from_millis(200)).await;

    // Idle again: a second disconnect is rejected.
    assert!(connection.disconnect().is_err());
    assert_ne!(connection.last_error(), ErrorCode::Success);
}

/// Disconnect right after connect never deadlocks and ends with exactly one
/// terminal callback.
#[tokio::test]
async fn e2e_connect_then_disconnect_immediately() {
    let broker = TestBroker::start().await;
    let client = helpers::client();

    for round in 0..10 {
        let connection = helpers::connection(&client, &broker);
        let mut events = Recorder::new();
        let tx = events.sender();
        connection.set_on_disconnect(move |_| {
            tx.send("terminal".to_string()).unwrap();
        });
        let tx = events.sender();
        connection.set_on_connection_failed(move |_, _| {
            tx.send("terminal".to_string()).unwrap();
        });

        connection.connect(&format!("quick-{round}"), true, 30).unwrap();
        connection.disconnect().unwrap();
        assert_eq!(events.next().await, "terminal");
        events.assert_quiet(Duration::from_millis(50)).await;
    }
}

/// An explicit ping reaches the broker.
#[tokio::test]
async fn e2e_ping() {
    let broker = TestBroker::start().await;
    let client = helpers::client();
    let connection = helpers::connection(&client, &broker);
    helpers::connect(&connection, "ping-1").await;

    connection.ping().unwrap();
    broker
        .wait_for("ping-1", |packets| packets.contains(&Packet::PingReq))
        .await;
}

/// A broker that stops answering pings ends the session with a ping timeout.
#[tokio::test]
async fn e2e_ping_timeout() {
    let broker = TestBroker::start().await;
    broker.ignore_pings();
    let client = helpers::client();
    let connection = helpers::connection(&client, &broker);

    let mut events = Recorder::new();
    let tx = events.sender();
    connection.set_on_connack(move |_, code, _| {
        tx.send(format!("connack {code}")).unwrap();
    });
    let tx = events.sender();
    connection.set_on_connection_failed(move |_, code| {
        tx.send(format!("failed {code:?}")).unwrap();
    });

    let options = ConnectOptions::new("silent-1", true, 30)
        .with_ping_timeout(Duration::from_millis(200))
        .with_reconnect(ReconnectOptions::disabled());
    connection.connect_with(options).unwrap();
    assert_eq!(events.next().await, "connack accepted");

    connection.ping().unwrap();
    assert_eq!(events.next().await, "failed PingTimeout");
}

/// Login and will travel in CONNECT.
#[tokio::test]
async fn e2e_login_and_will_in_connect() {
    let broker = TestBroker::start().await;
    let client = helpers::client();
    let connection = helpers::connection(&client, &broker);
    connection.set_login("device", Some("hunter2")).unwrap();
    connection
        .set_will("status/device", mq_connection::QoS::AtLeastOnce, true, "gone")
        .unwrap();
    helpers::connect(&connection, "creds-1").await;

    let packets = broker.received_from("creds-1");
    let Some(Packet::Connect(connect)) = packets.first() else {
        panic!("expected CONNECT, got {packets:?}");
    };
    let login = connect.login.as_ref().unwrap();
    assert_eq!(login.username, "device");
    assert_eq!(login.password.as_deref(), Some("hunter2"));
    let will = connect.will.as_ref().unwrap();
    assert_eq!(will.topic, "status/device");
    assert_eq!(&will.payload[..], b"gone");
    assert!(will.retain);
}
