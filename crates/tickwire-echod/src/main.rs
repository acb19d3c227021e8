use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use tickwire::{
    ClientId, CommsHandler, Config, Endpoint, Message, MessageBody, ReliableServer,
};

/// Echo daemon: frames every received message straight back to its
/// sender. Mostly useful for poking at the transport from other tools.
#[derive(Parser, Debug)]
#[command(name = "tickwire-echod")]
#[command(about = "TCP echo daemon built on the tickwire transport", long_about = None)]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Listen port
    #[arg(short, long, default_value_t = 5233)]
    port: u16,

    /// Consumer tick rate in Hz
    #[arg(long, default_value_t = 60)]
    tick_hz: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

/// Collects one tick's worth of traffic; payloads are echoed after the
/// tick so the handler never re-enters the server.
#[derive(Default)]
struct Turn {
    inbox: Vec<(ClientId, Vec<u8>)>,
}

impl CommsHandler for Turn {
    fn on_connect(&mut self, client: ClientId) {
        info!(client, "client connected");
    }

    fn on_message(&mut self, message: Message) {
        if let MessageBody::Bytes(payload) = message.body {
            self.inbox.push((message.client, payload.to_vec()));
        }
    }

    fn on_disconnect(&mut self, client: ClientId) {
        info!(client, "client disconnected");
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::with_endpoint(Endpoint::new(args.bind.clone(), args.port, "echod"));
    let mut server = ReliableServer::new(config);
    server.start()?;
    info!("echo server started on {}:{}", args.bind, args.port);

    let tick = Duration::from_secs_f64(1.0 / f64::from(args.tick_hz.max(1)));
    loop {
        let mut turn = Turn::default();
        server.tick(&mut turn);
        for (client, payload) in turn.inbox {
            if let Err(e) = server.send_to(client, &payload) {
                warn!(client, error = %e, "echo failed");
            }
        }
        thread::sleep(tick);
    }
}
