//! ReplidB Replica Binary
//!
//! One process per cluster member. Point every member at the same
//! backend list and they will elect a leader among themselves.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replidb::{EntityStore, Replica, Server, TimingConfig};

#[derive(Parser)]
#[command(name = "replidb-server")]
#[command(about = "Replicated record store cluster member")]
struct Args {
    /// Address for this replica to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Comma-separated addresses of the cluster members (listing
    /// ourselves is fine)
    #[arg(
        short,
        long,
        value_delimiter = ',',
        default_value = "127.0.0.1:8081,127.0.0.1:8082"
    )]
    backend: Vec<SocketAddr>,

    /// Milliseconds between leader heartbeats
    #[arg(long, default_value = "300")]
    heartbeat_ms: u64,

    /// Lower bound of the randomized election timeout, in milliseconds
    #[arg(long, default_value = "350")]
    election_min_ms: u64,

    /// Upper bound of the randomized election timeout, in milliseconds
    #[arg(long, default_value = "700")]
    election_max_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "replidb=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    anyhow::ensure!(
        args.election_min_ms > args.heartbeat_ms,
        "election_min_ms must exceed heartbeat_ms or healthy leaders get deposed"
    );
    anyhow::ensure!(
        args.election_max_ms >= args.election_min_ms,
        "election_max_ms must be at least election_min_ms"
    );

    let timing = TimingConfig {
        heartbeat: Duration::from_millis(args.heartbeat_ms),
        election_min: Duration::from_millis(args.election_min_ms),
        election_max: Duration::from_millis(args.election_max_ms),
        ..Default::default()
    };

    tracing::info!("starting replica on {}", args.listen);
    tracing::info!("cluster members: {:?}", args.backend);

    let store = Arc::new(EntityStore::new());
    let state_machine: Arc<dyn replidb::StateMachine> = Arc::clone(&store) as Arc<dyn replidb::StateMachine>;
    let replica = Replica::new(args.listen, &args.backend, state_machine, timing);
    replica.spawn();

    Server::new(args.listen, replica, store).run().await
}
