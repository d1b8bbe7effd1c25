// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! dmrhubd: the DMRHub routing daemon.
//!
//! Wires the sqlite `Repository`, the in-memory `KvStore`/`Bus`, the Hub
//! router, `CallTracker` and `NetScheduler` together and drives the HBRP,
//! IPSC and OpenBridge UDP transports until a shutdown signal arrives.
//!
//! # Usage
//!
//! ```bash
//! dmrhubd --database dmrhub.sqlite3 --peers-file peers.json
//! ```

mod peers;
mod transports;

use clap::Parser;
use dashmap::DashMap;
use dmrhub_core::calltracker::CallTracker;
use dmrhub_core::config::Config;
use dmrhub_core::engine::transport::{Transport, TransportKind};
use dmrhub_core::engine::Hub;
use dmrhub_core::kv::InMemoryKvStore;
use dmrhub_core::netscheduler::{ClockReading, NetScheduler};
use dmrhub_core::pubsub::{Bus, InMemoryBus};
use dmrhub_persistence::SqliteRepository;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use transports::hbrp::HbrpTransport;
use transports::ipsc::IpscTransport;
use transports::openbridge::OpenBridgeTransport;

/// DMRHub routing daemon
#[derive(Parser, Debug)]
#[command(name = "dmrhubd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Sqlite database path (overrides DMRHUB_DATABASE_URL / the default).
    #[arg(long, env = "DMRHUB_DATABASE_URL")]
    database: Option<String>,

    /// HBRP UDP listen port.
    #[arg(long, env = "DMRHUB_HBRP_PORT")]
    hbrp_port: Option<u16>,

    /// IPSC UDP listen port.
    #[arg(long, env = "DMRHUB_IPSC_PORT")]
    ipsc_port: Option<u16>,

    /// OpenBridge UDP listen port.
    #[arg(long, env = "DMRHUB_OPENBRIDGE_PORT")]
    openbridge_port: Option<u16>,

    /// Bind address for all transports.
    #[arg(long, env = "DMRHUB_BIND_ADDRESS")]
    bind_address: Option<String>,

    /// JSON file describing OpenBridge peers (spec section 4.4). Peers have
    /// no connection FSM, so there is nothing to authenticate against the
    /// repository -- IP:port and password come from this file instead.
    #[arg(long)]
    peers_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "DMRHUB_LOG_LEVEL")]
    log_level: Option<String>,
}

fn build_config(args: &Args) -> Config {
    let mut config = Config::from_env();
    if let Some(database) = &args.database {
        config.database_url = database.clone();
    }
    if let Some(port) = args.hbrp_port {
        config.hbrp_port = port;
    }
    if let Some(port) = args.ipsc_port {
        config.ipsc_port = port;
    }
    if let Some(port) = args.openbridge_port {
        config.openbridge_port = port;
    }
    if let Some(bind) = &args.bind_address {
        config.bind_address = bind.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    config
}

fn wall_clock_reading() -> ClockReading {
    use chrono::{Datelike, Timelike, Utc};
    let now = Utc::now();
    ClockReading {
        day_of_week: now.weekday().num_days_from_sunday() as u8,
        hour: now.hour() as u8,
        minute: now.minute() as u8,
        unix_ms: now.timestamp_millis(),
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Arc::new(build_config(&args));

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log_level.clone()))
        .init();

    config.validate()?;

    info!(
        hbrp_port = config.hbrp_port,
        ipsc_port = config.ipsc_port,
        openbridge_port = config.openbridge_port,
        database_url = %config.database_url,
        "starting dmrhubd"
    );

    let repository = Arc::new(SqliteRepository::open(&config.database_url)?);
    let kv = Arc::new(InMemoryKvStore::new());
    let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());

    let owner_cache: Arc<DashMap<u32, u32>> = Arc::new(DashMap::new());
    let owner_lookup_cache = owner_cache.clone();
    let owner_lookup = Arc::new(move |repeater_id: u32| owner_lookup_cache.get(&repeater_id).map(|e| *e));

    let calltracker = Arc::new(CallTracker::new(repository.clone(), bus.clone(), owner_lookup));
    let hub = Hub::new(repository.clone(), kv.clone(), bus.clone(), calltracker, config.clone());

    let openbridge_peers = match &args.peers_file {
        Some(path) => peers::load_peers(path)?,
        None => Vec::new(),
    };
    for peer in &openbridge_peers {
        hub.register_peer(peers::to_repository_peer(peer));
    }

    let hbrp = HbrpTransport::new(
        hub.clone(),
        repository.clone(),
        bus.clone(),
        config.bind_address.clone(),
        config.hbrp_port,
        config.ping_timeout(),
        config.handshake_timeout(),
        owner_cache.clone(),
    );
    let ipsc = IpscTransport::new(
        hub.clone(),
        repository.clone(),
        bus.clone(),
        config.bind_address.clone(),
        config.ipsc_port,
        config.ping_timeout(),
        owner_cache.clone(),
    );
    let openbridge = OpenBridgeTransport::new(
        hub.clone(),
        config.bind_address.clone(),
        config.openbridge_port,
        openbridge_peers.iter().map(peers::to_endpoint).collect(),
    );

    hub.register_transport(TransportKind::Hbrp, hbrp.clone());
    hub.register_transport(TransportKind::Ipsc, ipsc.clone());
    hub.register_transport(TransportKind::OpenBridge, openbridge.clone());

    hbrp.start().await?;
    ipsc.start().await?;
    openbridge.start().await?;

    let netscheduler = Arc::new(NetScheduler::new(repository.clone(), kv.clone(), bus.clone()));
    let scheduler_handle = netscheduler.spawn(wall_clock_reading);

    info!("dmrhubd running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping transports");

    hbrp.stop().await?;
    ipsc.stop().await?;
    openbridge.stop().await?;
    scheduler_handle.stop().await;
    hub.stop().await;

    info!("dmrhubd stopped cleanly");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "dmrhubd exited with a fatal error");
            if err.downcast_ref::<dmrhub_core::config::ConfigError>().is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
