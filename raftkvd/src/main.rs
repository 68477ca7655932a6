#![deny(clippy::as_conversions)]
use opts::Opts;
use raftkvd::{Cluster, Parameters};
use std::io;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod opts;

fn main() -> anyhow::Result<()> {
    init_logging();

    let opts = Opts::from_args();

    let base = Parameters::builder()
        .tick_interval(
            opts.tick_interval
                .unwrap_or(Parameters::DEFAULT_TICK_INTERVAL),
        )
        .election_tick(
            opts.election_tick
                .unwrap_or(Parameters::DEFAULT_ELECTION_TICK),
        )
        .heartbeat_tick(
            opts.heartbeat_tick
                .unwrap_or(Parameters::DEFAULT_HEARTBEAT_TICK),
        )
        .snapshot_threshold(
            opts.snapshot_threshold
                .unwrap_or(Parameters::DEFAULT_SNAPSHOT_THRESHOLD),
        )
        .build();
    let base = Parameters {
        seed: opts.seed,
        ..base
    };

    let cluster = Cluster::new(Cluster::params(opts.nodes, &base))?;
    for id in cluster.ids() {
        if let Some(ctrl) = cluster.ctrl(id) {
            ctrl.install_signal_handler()?;
        }
    }

    let election_timeout = base.tick_interval * u32::try_from(base.election_tick * 4)?;
    match cluster.wait_for_leader(election_timeout.max(Duration::from_secs(1))) {
        Some(leader) => info!(leader = %leader, "Cluster elected a leader"),
        None => warn!("No leader elected yet"),
    }

    cluster.wait();

    Ok(())
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stderr))
                .with_writer(io::stderr),
        )
        .init();
}
