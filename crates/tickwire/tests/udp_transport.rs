//! Loopback integration tests for the unreliable (UDP) roles.

use std::net::{SocketAddr, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use tickwire::{
    ClientId, CommsHandler, Config, Endpoint, Message, MessageBody, UnreliableClient,
    UnreliableServer,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Connect(ClientId),
    Message(ClientId, Vec<u8>),
    Disconnect(ClientId),
}

#[derive(Debug, Default)]
struct Recorder {
    events: Vec<Event>,
}

impl CommsHandler for Recorder {
    fn on_connect(&mut self, client: ClientId) {
        self.events.push(Event::Connect(client));
    }

    fn on_message(&mut self, message: Message) {
        let MessageBody::Bytes(payload) = message.body else {
            panic!("expected byte payloads in this test");
        };
        self.events.push(Event::Message(message.client, payload.to_vec()));
    }

    fn on_disconnect(&mut self, client: ClientId) {
        self.events.push(Event::Disconnect(client));
    }
}

fn start_udp_server(mut config: Config) -> (UnreliableServer, SocketAddr) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    config.endpoint = Endpoint::new("127.0.0.1", 0, "udp_server");
    let mut server = UnreliableServer::new(config);
    server.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(addr) = server.local_addr() {
            return (server, addr);
        }
        assert!(Instant::now() < deadline, "server did not bind");
        thread::sleep(Duration::from_millis(5));
    }
}

fn tick_until(
    server: &mut UnreliableServer,
    rec: &mut Recorder,
    timeout: Duration,
    pred: impl Fn(&Recorder) -> bool,
) {
    let deadline = Instant::now() + timeout;
    loop {
        server.tick(rec);
        if pred(rec) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "condition not reached; events: {:?}",
            rec.events
        );
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn affinity_peers_connect_then_expire() {
    let mut config = Config::default();
    config.client_ttl = Some(Duration::from_millis(150));
    let (mut server, addr) = start_udp_server(config);

    let mut client = UnreliableClient::new(Config::with_endpoint(Endpoint::new(
        addr.ip().to_string(),
        addr.port(),
        "udp_client",
    )));
    client.start().unwrap();
    client.send(b"ping").unwrap();

    let mut rec = Recorder::default();
    tick_until(&mut server, &mut rec, Duration::from_secs(2), |r| {
        r.events.len() >= 2
    });

    let Event::Connect(id) = rec.events[0].clone() else {
        panic!("expected connect first, got {:?}", rec.events);
    };
    assert_ne!(id, 0, "affinity entries get real ids");
    assert_eq!(rec.events[1], Event::Message(id, b"ping".to_vec()));
    assert_eq!(server.client_count(), 1);

    // No more datagrams: the idle sweep evicts the entry.
    tick_until(&mut server, &mut rec, Duration::from_secs(2), |r| {
        r.events.contains(&Event::Disconnect(id))
    });
    assert_eq!(server.client_count(), 0);
}

#[test]
fn without_affinity_messages_are_anonymous() {
    let (mut server, addr) = start_udp_server(Config::default());

    let mut client = UnreliableClient::new(Config::with_endpoint(Endpoint::new(
        addr.ip().to_string(),
        addr.port(),
        "udp_client",
    )));
    client.start().unwrap();
    client.send(b"hello").unwrap();

    let mut rec = Recorder::default();
    tick_until(&mut server, &mut rec, Duration::from_secs(2), |r| {
        !r.events.is_empty()
    });
    assert_eq!(rec.events, vec![Event::Message(0, b"hello".to_vec())]);
    assert_eq!(server.client_count(), 0);
}

#[test]
fn broadcast_reaches_every_configured_target() {
    let (mut server_a, addr_a) = start_udp_server(Config::default());
    let (mut server_b, addr_b) = start_udp_server(Config::default());

    let mut config = Config::with_endpoint(Endpoint::new(
        addr_a.ip().to_string(),
        addr_a.port(),
        "udp_client",
    ));
    config.targets = vec![
        Endpoint::new(addr_a.ip().to_string(), addr_a.port(), "a"),
        Endpoint::new(addr_b.ip().to_string(), addr_b.port(), "b"),
    ];
    let mut client = UnreliableClient::new(config);
    client.start().unwrap();
    client.broadcast(b"fanout");

    for server in [&mut server_a, &mut server_b] {
        let mut rec = Recorder::default();
        tick_until(server, &mut rec, Duration::from_secs(2), |r| {
            !r.events.is_empty()
        });
        assert_eq!(rec.events, vec![Event::Message(0, b"fanout".to_vec())]);
    }
}

#[test]
fn server_replies_to_a_known_sender() {
    let mut config = Config::default();
    config.client_ttl = Some(Duration::from_secs(5));
    let (mut server, addr) = start_udp_server(config);

    // Raw socket standing in for a remote peer.
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    peer.send_to(b"ping", addr).unwrap();

    let mut rec = Recorder::default();
    tick_until(&mut server, &mut rec, Duration::from_secs(2), |r| {
        r.events.len() >= 2
    });
    let Event::Connect(id) = rec.events[0].clone() else {
        panic!("expected connect first, got {:?}", rec.events);
    };

    server.send_to(id, b"pong").unwrap();
    let mut buf = [0u8; 64];
    let (n, from) = peer.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong");
    assert_eq!(from, addr);
}
