mod events;
mod output;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use events::{EventFrame, EventStarted, EventStopped, Lifecycle};
use mesh_topology::{
    ReconnectPolicy, Topology, TopologyChannels, TopologyConfig, TopologyEvent, TopologyHandle,
    TransportConfig,
};
use output::Output;

#[derive(Parser)]
#[command(name = "mesh-node", about = "Keep a full TCP mesh with a set of peers")]
struct Cli {
    /// Identity: `host:port`, a bare port (prefixed with the local network
    /// address), or empty to only dial out.
    #[arg(long, default_value = "")]
    id: String,

    /// Peer to keep connected (`host:port`). Repeat for more peers.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Address to listen on. Defaults to $MESH_BIND_HOST or 0.0.0.0.
    #[arg(long)]
    bind_host: Option<String>,

    /// Handshake deadline per socket in ms.
    #[arg(long, default_value = "15000")]
    handshake_timeout_ms: u64,

    /// Cap on the reconnect backoff in ms. Unbounded when omitted.
    #[arg(long)]
    max_reconnect_delay_ms: Option<u64>,

    /// Send a greeting frame on every new connection.
    #[arg(long)]
    greet: bool,

    /// Also append events to a JSONL file in this directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

impl Cli {
    fn topology_config(&self) -> TopologyConfig {
        let mut transport = TransportConfig::new()
            .handshake_timeout(Duration::from_millis(self.handshake_timeout_ms));
        if let Some(host) = &self.bind_host {
            transport = transport.bind_host(host.clone());
        }

        let mut reconnect = ReconnectPolicy::default();
        if let Some(max) = self.max_reconnect_delay_ms {
            reconnect = reconnect.with_max_delay(Duration::from_millis(max));
        }

        TopologyConfig::new(self.id.clone())
            .transport(transport)
            .reconnect(reconnect)
            .peers(self.peers.iter().map(String::as_str))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let start = Instant::now();

    let mut out = match &cli.output_dir {
        Some(dir) => {
            let (out, path) = Output::with_dir(dir, &cli.id)?;
            eprintln!("Writing events to {}", path.display());
            out
        }
        None => Output::stdout(),
    };

    let TopologyChannels {
        handle,
        mut events,
        mut frames,
    } = Topology::spawn(cli.topology_config()).await?;

    eprintln!("mesh-node v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Identity: {}", display_id(&handle));
    eprintln!("Press Ctrl+C to stop.\n");
    out.emit(&EventStarted::new(handle.local_id(), &cli.peers));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut frames_received: u64 = 0;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            Some(event) = events.recv() => {
                out.emit(&Lifecycle::from(&event));
                if cli.greet {
                    greet(&handle, &event).await;
                }
            }
            Some(frame) = frames.recv() => {
                frames_received += 1;
                out.emit(&EventFrame::new(&frame));
            }
            else => break,
        }
    }

    handle.shutdown().await;
    out.emit(&EventStopped::new(
        frames_received,
        start.elapsed().as_secs_f64(),
    ));
    eprintln!("\nStopped after {frames_received} frame(s).");
    Ok(())
}

fn display_id(handle: &TopologyHandle) -> String {
    if handle.local_id().is_empty() {
        "(dial-only)".to_string()
    } else {
        handle.local_id().to_string()
    }
}

async fn greet(handle: &TopologyHandle, event: &TopologyEvent) {
    let TopologyEvent::Connected { peer, connection } = event else {
        return;
    };
    let greeting = format!("hello from {}", display_id(handle));
    if let Err(e) = connection.send(greeting).await {
        tracing::warn!("greet: could not greet {peer}: {e}");
    }
}
