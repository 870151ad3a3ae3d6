//! Shared test harness for E2E tests.
//!
//! `TestBroker` is a small MQTT 3.1.1 broker on `127.0.0.1:0` built from
//! tokio sockets and the `mq-protocol` codec. It routes publishes between
//! its clients at QoS 0/1/2, answers pings, publishes wills when a client
//! vanishes, and records every packet it receives so tests can assert on
//! the wire traffic.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::BytesMut;
use mq_connection::{ClientBootstrap, MqttClient, MqttConnection, SocketOptions};
use mq_protocol::{
    ConnAck, ConnectReturnCode, LastWill, Packet, Publish, QoS, SubAck, SubscribeReturnCode, decode,
    encode, topic,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

const MAX_PACKET: usize = 1024 * 1024;

struct Peer {
    client_id: String,
    outbox: mpsc::UnboundedSender<Packet>,
    subscriptions: Vec<(String, QoS)>,
    will: Option<LastWill>,
    kill: Arc<Notify>,
}

#[derive(Default)]
struct BrokerState {
    refuse: Option<ConnectReturnCode>,
    ignore_pings: bool,
    denied_filters: HashSet<String>,
    peers: HashMap<u64, Peer>,
    next_peer: u64,
    next_pkid: u16,
    /// Every packet received, tagged with the sender's client id.
    received: Vec<(String, Packet)>,
}

impl BrokerState {
    fn next_pkid(&mut self) -> u16 {
        self.next_pkid = self.next_pkid.wrapping_add(1).max(1);
        self.next_pkid
    }

    /// Deliver `publish` to every matching subscriber at the lower QoS.
    fn route(&mut self, publish: &Publish) {
        let mut deliveries = Vec::new();
        for peer in self.peers.values() {
            let granted = peer
                .subscriptions
                .iter()
                .filter(|(filter, _)| topic::matches(filter, &publish.topic))
                .map(|(_, qos)| *qos)
                .max();
            if let Some(granted) = granted {
                deliveries.push((peer.outbox.clone(), granted.min(publish.qos)));
            }
        }
        for (outbox, qos) in deliveries {
            let pkid = if qos == QoS::AtMostOnce {
                0
            } else {
                self.next_pkid()
            };
            let _ = outbox.send(Packet::Publish(Publish {
                dup: false,
                qos,
                retain: false,
                topic: publish.topic.clone(),
                pkid,
                payload: publish.payload.clone(),
            }));
        }
    }
}

pub struct TestBroker {
    addr: SocketAddr,
    state: Arc<Mutex<BrokerState>>,
    task: JoinHandle<()>,
}

impl TestBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(BrokerState::default()));
        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });
        Self { addr, state, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    /// Answer every following CONNECT with `code`.
    pub fn refuse_with(&self, code: ConnectReturnCode) {
        self.state().refuse = Some(code);
    }

    /// Stop answering PINGREQ.
    pub fn ignore_pings(&self) {
        self.state().ignore_pings = true;
    }

    /// Answer SUBSCRIBE to `filter` with a failure return code.
    pub fn deny_filter(&self, filter: &str) {
        self.state().denied_filters.insert(filter.to_string());
    }

    /// Publish from the broker itself to matching subscribers.
    pub fn publish(&self, topic: &str, qos: QoS, payload: &'static [u8]) {
        self.state().route(&Publish::new(topic, qos, payload));
    }

    /// Drop every client connection without a DISCONNECT.
    pub fn kill_clients(&self) {
        for peer in self.state().peers.values() {
            peer.kill.notify_one();
        }
    }

    pub fn connected_clients(&self) -> Vec<String> {
        self.state()
            .peers
            .values()
            .map(|p| p.client_id.clone())
            .collect()
    }

    /// Packets received from `client_id`, oldest first.
    pub fn received_from(&self, client_id: &str) -> Vec<Packet> {
        self.state()
            .received
            .iter()
            .filter(|(id, _)| id == client_id)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Poll until `predicate` holds for the packets from `client_id`.
    pub async fn wait_for(&self, client_id: &str, predicate: impl Fn(&[Packet]) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if predicate(&self.received_from(client_id)) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "broker never saw the expected packets from {client_id}: {:?}",
                self.received_from(client_id)
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until `client_id` holds a subscription on `filter`.
    pub async fn wait_for_subscription(&self, client_id: &str, filter: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let subscribed = self.state().peers.values().any(|p| {
                p.client_id == client_id && p.subscriptions.iter().any(|(f, _)| f == filter)
            });
            if subscribed {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{client_id} never subscribed to {filter}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.task.abort();
        self.kill_clients();
    }
}

/// Serve one client connection.
async fn serve(stream: TcpStream, state: Arc<Mutex<BrokerState>>) {
    stream.set_nodelay(true).ok();
    let (mut reader, mut writer) = stream.into_split();
    let (outbox, mut rx) = mpsc::unbounded_channel::<Packet>();

    let writer_task = tokio::spawn(async move {
        let mut buf = BytesMut::new();
        while let Some(packet) = rx.recv().await {
            buf.clear();
            encode(&packet, &mut buf).unwrap();
            if writer.write_all(&buf).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut read_buf = BytesMut::new();
    let Some(Packet::Connect(connect)) = read_packet(&mut reader, &mut read_buf).await else {
        return;
    };
    let client_id = connect.client_id.clone();
    let kill = Arc::new(Notify::new());
    let admitted = {
        let mut state = state.lock().unwrap();
        state
            .received
            .push((client_id.clone(), Packet::Connect(connect.clone())));
        match state.refuse {
            Some(code) => Err(code),
            None => {
                state.next_peer += 1;
                let peer_id = state.next_peer;
                state.peers.insert(
                    peer_id,
                    Peer {
                        client_id: client_id.clone(),
                        outbox: outbox.clone(),
                        subscriptions: Vec::new(),
                        will: connect.will.clone(),
                        kill: kill.clone(),
                    },
                );
                Ok(peer_id)
            }
        }
    };
    let peer_id = match admitted {
        Ok(peer_id) => peer_id,
        Err(code) => {
            let _ = outbox.send(Packet::ConnAck(ConnAck {
                session_present: false,
                code,
            }));
            drop(outbox);
            let _ = writer_task.await;
            return;
        }
    };
    let _ = outbox.send(Packet::ConnAck(ConnAck {
        session_present: false,
        code: ConnectReturnCode::Accepted,
    }));

    let mut graceful = false;
    loop {
        let packet = tokio::select! {
            packet = read_packet(&mut reader, &mut read_buf) => packet,
            () = kill.notified() => None,
        };
        let Some(packet) = packet else { break };

        let mut state = state.lock().unwrap();
        state.received.push((client_id.clone(), packet.clone()));
        let reply = match packet {
            Packet::Subscribe(subscribe) => {
                let mut return_codes = Vec::new();
                for filter in subscribe.filters {
                    if state.denied_filters.contains(&filter.path) {
                        return_codes.push(SubscribeReturnCode::Failure);
                        continue;
                    }
                    return_codes.push(SubscribeReturnCode::Success(filter.qos));
                    if let Some(peer) = state.peers.get_mut(&peer_id) {
                        peer.subscriptions.retain(|(f, _)| *f != filter.path);
                        peer.subscriptions.push((filter.path, filter.qos));
                    }
                }
                Some(Packet::SubAck(SubAck {
                    pkid: subscribe.pkid,
                    return_codes,
                }))
            }
            Packet::Unsubscribe(unsubscribe) => {
                if let Some(peer) = state.peers.get_mut(&peer_id) {
                    peer.subscriptions
                        .retain(|(f, _)| !unsubscribe.filters.contains(f));
                }
                Some(Packet::UnsubAck(unsubscribe.pkid))
            }
            Packet::Publish(publish) => {
                state.route(&publish);
                match publish.qos {
                    QoS::AtMostOnce => None,
                    QoS::AtLeastOnce => Some(Packet::PubAck(publish.pkid)),
                    QoS::ExactlyOnce => Some(Packet::PubRec(publish.pkid)),
                }
            }
            Packet::PubRel(pkid) => Some(Packet::PubComp(pkid)),
            Packet::PubRec(pkid) => Some(Packet::PubRel(pkid)),
            Packet::PingReq if !state.ignore_pings => Some(Packet::PingResp),
            Packet::Disconnect => {
                graceful = true;
                None
            }
            _ => None,
        };
        if let Some(reply) = reply {
            let _ = outbox.send(reply);
        }
        if graceful {
            break;
        }
    }

    let mut state = state.lock().unwrap();
    if let Some(peer) = state.peers.remove(&peer_id) {
        if let Some(will) = peer.will.filter(|_| !graceful) {
            state.route(&Publish {
                retain: will.retain,
                ..Publish::new(will.topic, will.qos, will.payload)
            });
        }
    }
    drop(state);
    drop(outbox);
    writer_task.abort();
}

async fn read_packet(reader: &mut OwnedReadHalf, buf: &mut BytesMut) -> Option<Packet> {
    loop {
        match decode(buf, MAX_PACKET) {
            Ok(Some(packet)) => return Some(packet),
            Ok(None) => {}
            Err(_) => return None,
        }
        match reader.read_buf(buf).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

// ── Client side ─────────────────────────────────────────────────

pub fn client() -> MqttClient {
    MqttClient::new(&ClientBootstrap::current().unwrap())
}

pub fn connection(client: &MqttClient, broker: &TestBroker) -> MqttConnection {
    let connection = client.new_connection("127.0.0.1", broker.port(), &SocketOptions::default(), None);
    assert!(connection.is_valid(), "{}", connection.last_error());
    connection
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Callback recorder: handlers push strings, tests pop them in order.
pub struct Recorder {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Recorder {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<String> {
        self.tx.clone()
    }

    pub async fn next(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("callback did not fire")
            .expect("recorder closed")
    }

    /// Assert nothing more arrives within `window`.
    pub async fn assert_quiet(&mut self, window: Duration) {
        if let Ok(Some(extra)) = tokio::time::timeout(window, self.rx.recv()).await {
            panic!("unexpected callback: {extra}");
        }
    }
}

/// Connect `connection` as `client_id` and wait for an accepted CONNACK.
pub async fn connect(connection: &MqttConnection, client_id: &str) {
    let mut recorder = Recorder::new();
    let tx = recorder.sender();
    connection.set_on_connack(move |_, code, _| {
        let _ = tx.send(code.to_string());
    });
    connection.connect(client_id, true, 30).unwrap();
    assert_eq!(recorder.next().await, "accepted");
}
