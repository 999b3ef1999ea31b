use std::error::Error;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;
#[cfg(target_family = "unix")]
use tokio::signal::{self, unix::SignalKind};
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use olsa::lsdb::MemoryLsdb;
use olsa::metrics::NoMetrics;
use olsa::proto;
use olsa::server::ApiServer;
use olsa::topology::{IfState, Neighbor, NeighborState};

/// The default address to listen on for api client connections.
const DEFAULT_LISTEN_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// The default advertising router id put in installed advertisements.
const DEFAULT_ROUTER_ID: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 1);

#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Address to listen on for api client connections.
    #[arg(short = 'l', long = "listen-addr", default_value_t = DEFAULT_LISTEN_ADDRESS)]
    listen_addr: IpAddr,

    /// Port of the synchronous channel. Defaults to the `olsa` entry of the service database,
    /// or 2607 if there is none.
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Router id used as the advertising router of installed advertisements.
    #[arg(short = 'r', long = "router-id", default_value_t = DEFAULT_ROUTER_ID)]
    router_id: Ipv4Addr,

    /// Path to a topology file loaded at startup.
    #[arg(short = 't', long = "topology")]
    topology: Option<PathBuf>,

    /// Enable debug logging. Does nothing if `--silent` is set.
    #[arg(short = 'd', long = "debug", default_value_t = false)]
    debug: bool,

    /// Disable all logs except error logs.
    #[arg(long = "silent", default_value_t = false)]
    silent: bool,
}

/// On disk description of the interfaces and neighbors the daemon pretends to have.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TopologyFile {
    #[serde(default)]
    interface: Vec<InterfaceSection>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct InterfaceSection {
    addr: Ipv4Addr,
    area: Ipv4Addr,
    #[serde(default = "default_interface_state")]
    state: IfState,
    #[serde(default)]
    neighbor: Vec<NeighborSection>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct NeighborSection {
    addr: Ipv4Addr,
    router_id: Ipv4Addr,
    #[serde(default = "default_neighbor_state")]
    state: NeighborState,
    #[serde(default = "default_true")]
    opaque_capable: bool,
}

fn default_interface_state() -> IfState {
    IfState::PointToPoint
}

fn default_neighbor_state() -> NeighborState {
    NeighborState::Full
}

fn default_true() -> bool {
    true
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let level = if cli.silent {
        LevelFilter::ERROR
    } else if cli.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::registry()
        .with(tracing_logfmt::layer())
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let port = cli.port.unwrap_or_else(proto::well_known_port);
    let listen_addr = SocketAddr::new(cli.listen_addr, port);

    let (lsdb, lsdb_events) = MemoryLsdb::new();
    let server = ApiServer::new(
        listen_addr,
        cli.router_id,
        Arc::new(lsdb),
        lsdb_events,
        NoMetrics,
    )
    .await?;
    info!(
        "Serving the opaque advertisement api on {} with router id {}",
        server.local_addr(),
        cli.router_id
    );

    match &cli.topology {
        Some(path) => load_topology(&server, path).await?,
        None => warn!("No topology file given, origination stays gated until one is loaded"),
    }

    wait_for_shutdown().await?;

    info!("Shutting down");
    server.shutdown();

    Ok(())
}

/// Feed the interfaces and neighbors of a topology file through the server's topology hooks, as
/// a real routing daemon would while its adjacencies form.
async fn load_topology(server: &ApiServer<NoMetrics>, path: &Path) -> Result<(), Box<dyn Error>> {
    let raw = tokio::fs::read_to_string(path).await?;
    let topology: TopologyFile = toml::from_str(&raw)?;

    let mut interfaces = 0;
    let mut neighbors = 0;
    for interface in topology.interface {
        server.add_interface(interface.addr, interface.area);
        server.interface_state_change(interface.addr, interface.state);
        interfaces += 1;
        for neighbor in interface.neighbor {
            server.neighbor_state_change(
                interface.addr,
                Neighbor {
                    addr: neighbor.addr,
                    router_id: neighbor.router_id,
                    state: neighbor.state,
                    opaque_capable: neighbor.opaque_capable,
                },
            );
            neighbors += 1;
        }
    }
    info!(
        "Loaded topology from {}: {interfaces} interfaces, {neighbors} neighbors",
        path.display()
    );

    Ok(())
}

#[cfg(target_family = "unix")]
async fn wait_for_shutdown() -> Result<(), Box<dyn Error>> {
    let mut sigint = signal::unix::signal(SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(target_family = "unix"))]
async fn wait_for_shutdown() -> Result<(), Box<dyn Error>> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
