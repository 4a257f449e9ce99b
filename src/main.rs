//! The xnetd daemon binary: flag parsing, wiring, and signal handling.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use log::{error, info, warn};

use xnetd::service::{self, BusKind};
use xnetd::{watch_system_resume, NetWatcher, StateManager, SupplicantClient, TrafficSampler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Bus {
    Session,
    System,
}

#[derive(Debug, Parser)]
#[command(name = "xnetd", about = "Desktop network daemon on D-Bus", version)]
struct Args {
    /// Which message bus to publish the service on.
    #[arg(long, value_enum, default_value_t = Bus::Session)]
    bus: Bus,

    /// Enable debug logging (overridden by RUST_LOG).
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    info!("xnetd starting");

    let state = Arc::new(StateManager::new());
    // The first IPv4 assignment after boot triggers the startup fetches.
    state.update(|st| st.is_startup = true);

    let supplicant = match SupplicantClient::new(state.clone()).await {
        Ok(client) => Some(client),
        Err(e) => {
            // The daemon still tracks wired/USB interfaces without Wi-Fi.
            warn!("supplicant client unavailable: {e}");
            None
        }
    };

    match NetWatcher::new(state.clone()) {
        Ok((watcher, messages)) => {
            tokio::spawn(watcher.run(messages));
            info!("kernel event watcher started");
        }
        Err(e) => warn!("kernel event watcher unavailable: {e}"),
    }

    tokio::spawn(TrafficSampler::new(state.clone()).run());
    info!("traffic sampler started");

    let bus = match args.bus {
        Bus::Session => BusKind::Session,
        Bus::System => BusKind::System,
    };
    // Keep the connection alive for the daemon's lifetime; dropping it
    // would release the name.
    let _conn = match service::serve(bus, state.clone(), supplicant.clone()).await {
        Ok(conn) => conn,
        Err(e) => {
            error!("failed to register bus service: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("service registered on the {:?} bus", args.bus);

    tokio::spawn(watch_system_resume(state, supplicant));

    info!("xnetd ready");
    wait_for_shutdown().await;
    info!("shutting down");
    ExitCode::SUCCESS
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("SIGTERM handler unavailable: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
