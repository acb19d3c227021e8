//! Loopback integration tests for the reliable (TCP) roles.

use std::net::{SocketAddr, TcpListener};
use std::thread;
use std::time::{Duration, Instant};

use tickwire::{
    ClientId, CommsHandler, Config, Endpoint, FrameSchema, Message, MessageBody, MessageKind,
    ReliableClient, ReliableServer,
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
        let payload = match message.body {
            MessageBody::Bytes(b) => b.to_vec(),
            MessageBody::Text(t) => t.into_bytes(),
            MessageBody::Json(v) => v.to_string().into_bytes(),
            MessageBody::Fields(f) => f.payload().to_vec(),
        };
        self.events.push(Event::Message(message.client, payload));
    }

    fn on_disconnect(&mut self, client: ClientId) {
        self.events.push(Event::Disconnect(client));
    }
}

impl Recorder {
    fn messages(&self) -> Vec<(ClientId, Vec<u8>)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Message(c, p) => Some((*c, p.clone())),
                _ => None,
            })
            .collect()
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn wait_for(timeout: Duration, what: &str, pred: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn server_config() -> Config {
    Config::with_endpoint(Endpoint::new("127.0.0.1", 0, "test_server"))
}

fn client_config(addr: SocketAddr) -> Config {
    Config::with_endpoint(Endpoint::new(addr.ip().to_string(), addr.port(), "test_client"))
}

fn start_server(config: Config) -> (ReliableServer, SocketAddr) {
    init_logging();
    let mut server = ReliableServer::new(config);
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

fn start_client(config: Config) -> ReliableClient {
    let mut client = ReliableClient::new(config);
    client.start().unwrap();
    wait_for(Duration::from_secs(2), "client to connect", || {
        client.is_connected()
    });
    client
}

#[test]
fn connect_is_observed_before_the_first_message_in_one_tick() {
    let (mut server, addr) = start_server(server_config());
    let client = start_client(client_config(addr));

    client.send(b"hello").unwrap();
    let stats = server.stats();
    wait_for(Duration::from_secs(2), "server to receive", || {
        stats.snapshot().messages_received == 1
    });

    // Both the accept and the first message are pending; a single tick
    // must deliver the connect notification first.
    let mut rec = Recorder::default();
    server.tick(&mut rec);

    assert_eq!(rec.events.len(), 2, "events: {:?}", rec.events);
    let Event::Connect(id) = rec.events[0].clone() else {
        panic!("expected connect first, got {:?}", rec.events);
    };
    assert_eq!(rec.events[1], Event::Message(id, b"hello".to_vec()));
}

#[test]
fn client_observes_connect_before_server_payload() {
    let (mut server, addr) = start_server(server_config());
    let mut client = start_client(client_config(addr));

    // Wait for the accept without ticking the client, then push one
    // payload down to it.
    let server_stats = server.stats();
    wait_for(Duration::from_secs(2), "accept", || {
        server_stats.snapshot().connections == 1
    });
    let mut server_rec = Recorder::default();
    server.tick(&mut server_rec);
    server.send_all(b"pong");

    let client_stats = client.stats();
    wait_for(Duration::from_secs(2), "client to receive", || {
        client_stats.snapshot().messages_received == 1
    });

    let mut rec = Recorder::default();
    client.tick(&mut rec);
    assert_eq!(rec.events.len(), 2, "events: {:?}", rec.events);
    let Event::Connect(id) = rec.events[0].clone() else {
        panic!("expected connect first, got {:?}", rec.events);
    };
    assert_eq!(rec.events[1], Event::Message(id, b"pong".to_vec()));
}

#[test]
fn three_clients_produce_independent_streams_and_disconnects() {
    let (mut server, addr) = start_server(server_config());
    let mut clients: Vec<ReliableClient> = (0..3)
        .map(|_| start_client(client_config(addr)))
        .collect();
    for (i, client) in clients.iter().enumerate() {
        client.send(format!("payload-{i}").as_bytes()).unwrap();
    }

    let stats = server.stats();
    wait_for(Duration::from_secs(2), "all three payloads", || {
        stats.snapshot().messages_received == 3
    });

    let mut rec = Recorder::default();
    server.tick(&mut rec);

    let connect_ids: Vec<ClientId> = rec
        .events
        .iter()
        .filter_map(|e| match e {
            Event::Connect(c) => Some(*c),
            _ => None,
        })
        .collect();
    assert_eq!(connect_ids.len(), 3);

    let messages = rec.messages();
    assert_eq!(messages.len(), 3);
    let mut payloads: Vec<Vec<u8>> = messages.iter().map(|(_, p)| p.clone()).collect();
    payloads.sort();
    assert_eq!(
        payloads,
        vec![
            b"payload-0".to_vec(),
            b"payload-1".to_vec(),
            b"payload-2".to_vec()
        ]
    );
    // Every message stream belongs to a distinct, announced connection.
    let mut message_ids: Vec<ClientId> = messages.iter().map(|(c, _)| *c).collect();
    message_ids.sort_unstable();
    message_ids.dedup();
    assert_eq!(message_ids.len(), 3);
    for id in &message_ids {
        assert!(connect_ids.contains(id));
    }

    // Closing one client is observed as exactly one disconnect.
    clients[0].close();

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut rec = Recorder::default();
    loop {
        server.tick(&mut rec);
        let disconnects: Vec<ClientId> = rec
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Disconnect(c) => Some(*c),
                _ => None,
            })
            .collect();
        if disconnects.len() == 1 {
            assert!(connect_ids.contains(&disconnects[0]));
            break;
        }
        assert!(
            Instant::now() < deadline,
            "disconnect not observed; events: {:?}",
            rec.events
        );
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(server.client_count(), 2);
}

#[test]
fn refused_connections_retry_no_faster_than_the_interval() {
    init_logging();
    // Grab a port with nothing listening on it.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = client_config(addr);
    config.reconnect_interval = Duration::from_millis(500);
    let mut client = ReliableClient::new(config);
    client.start().unwrap();

    thread::sleep(Duration::from_millis(1250));
    client.close();

    // Attempts land at t=0, 500, 1000: at least two refusals, and never
    // more than one per interval.
    let errors = client.stats().snapshot().stream_errors;
    assert!(
        (2..=3).contains(&errors),
        "expected paced retries, got {errors} errors"
    );
}

#[test]
fn close_delivers_a_final_disconnect_notification() {
    let (_server, addr) = start_server(server_config());
    let mut client = start_client(client_config(addr));

    client.close();

    let mut rec = Recorder::default();
    client.tick(&mut rec);
    let Event::Connect(id) = rec.events[0].clone() else {
        panic!("expected connect first, got {:?}", rec.events);
    };
    assert_eq!(rec.events[1], Event::Disconnect(id));
}

#[test]
fn max_messages_per_tick_spreads_the_backlog_in_order() {
    let mut config = server_config();
    config.max_messages_per_tick = 2;
    let (mut server, addr) = start_server(config);
    let client = start_client(client_config(addr));

    for n in 1u8..=5 {
        client.send(&[n]).unwrap();
    }
    let stats = server.stats();
    wait_for(Duration::from_secs(2), "backlog of five", || {
        stats.snapshot().messages_received == 5
    });

    let mut dispatched = Vec::new();
    for _ in 0..3 {
        let mut rec = Recorder::default();
        server.tick(&mut rec);
        let batch: Vec<u8> = rec.messages().iter().map(|(_, p)| p[0]).collect();
        assert!(batch.len() <= 2, "tick exceeded cap: {batch:?}");
        dispatched.extend(batch);
    }
    assert_eq!(dispatched, vec![1, 2, 3, 4, 5]);
    assert_eq!(stats.snapshot().dropped_messages, 0);
}

#[test]
fn drop_accumulated_dispatches_only_the_newest() {
    let mut config = server_config();
    config.drop_accumulated = true;
    let (mut server, addr) = start_server(config);
    let client = start_client(client_config(addr));

    for n in 1u8..=5 {
        client.send(&[n]).unwrap();
    }
    let stats = server.stats();
    wait_for(Duration::from_secs(2), "backlog of five", || {
        stats.snapshot().messages_received == 5
    });

    let mut rec = Recorder::default();
    server.tick(&mut rec);
    let messages = rec.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].1, vec![5]);
    assert_eq!(stats.snapshot().dropped_messages, 4);
}

#[test]
fn oversized_fixed_payloads_never_reach_the_wire() {
    let mut config = server_config();
    config.schema = FrameSchema::Fixed(8);
    let (server, addr) = start_server(config);

    let mut client_cfg = client_config(addr);
    client_cfg.schema = FrameSchema::Fixed(8);
    let client = start_client(client_cfg);

    assert!(client.send(b"way too long for eight").is_err());
    let snap = client.stats().snapshot();
    assert_eq!(snap.rejected_sends, 1);
    assert_eq!(snap.messages_sent, 0);
    assert_eq!(snap.bytes_sent, 0);
    drop(server);
}

#[test]
fn schema_driven_frames_dispatch_as_fields() {
    #[derive(Default)]
    struct FieldsRecorder {
        frames: Vec<tickwire::FrameBody>,
    }
    impl CommsHandler for FieldsRecorder {
        fn on_message(&mut self, message: Message) {
            if let MessageBody::Fields(body) = message.body {
                self.frames.push(body);
            }
        }
    }

    let schema = FrameSchema::from_json(
        r#"[{"name":"len","length":4},{"name":"data","length":"len"}]"#,
    )
    .unwrap();

    let mut config = server_config();
    config.schema = schema.clone();
    let (mut server, addr) = start_server(config);

    let mut client_cfg = client_config(addr);
    client_cfg.schema = schema;
    let client = start_client(client_cfg);

    // Schema-driven sends are raw: the caller lays the frame out.
    let mut frame = 10u32.to_le_bytes().to_vec();
    frame.extend_from_slice(b"0123456789");
    client.send(&frame).unwrap();

    let stats = server.stats();
    wait_for(Duration::from_secs(2), "framed message", || {
        stats.snapshot().messages_received == 1
    });

    let mut rec = FieldsRecorder::default();
    server.tick(&mut rec);
    assert_eq!(rec.frames.len(), 1);
    let body = &rec.frames[0];
    assert_eq!(body.get("len").unwrap().as_ref(), &10u32.to_le_bytes());
    assert_eq!(body.get("data").unwrap().as_ref(), b"0123456789");
}

#[test]
fn json_kind_delivers_parsed_values() {
    #[derive(Default)]
    struct JsonRecorder {
        values: Vec<serde_json::Value>,
    }
    impl CommsHandler for JsonRecorder {
        fn on_message(&mut self, message: Message) {
            if let MessageBody::Json(value) = message.body {
                self.values.push(value);
            }
        }
    }

    let mut config = server_config();
    config.kind = MessageKind::Json;
    let (mut server, addr) = start_server(config);
    let client = start_client(client_config(addr));

    client.send(br#"{"kind":"pose","x":4}"#).unwrap();
    let stats = server.stats();
    wait_for(Duration::from_secs(2), "json message", || {
        stats.snapshot().messages_received == 1
    });

    let mut rec = JsonRecorder::default();
    server.tick(&mut rec);
    assert_eq!(rec.values.len(), 1);
    assert_eq!(rec.values[0]["kind"], "pose");
    assert_eq!(rec.values[0]["x"], 4);
}
