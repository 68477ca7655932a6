use clap::Parser;
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
pub struct Opts {
    /// Number of nodes of the in-process cluster
    #[clap(long = "nodes", env = "RAFTKV_NODES", default_value = "3")]
    pub nodes: u64,

    /// Duration of a raft tick, e.g. `100ms` or `1s`
    #[clap(long = "tick-interval", env = "RAFTKV_TICK_INTERVAL", value_parser = parse_duration)]
    pub tick_interval: Option<Duration>,

    #[clap(long = "election-tick", env = "RAFTKV_ELECTION_TICK")]
    pub election_tick: Option<usize>,

    #[clap(long = "heartbeat-tick", env = "RAFTKV_HEARTBEAT_TICK")]
    pub heartbeat_tick: Option<usize>,

    /// Seed of the election timeout randomization
    #[clap(long = "seed", env = "RAFTKV_SEED")]
    pub seed: Option<u64>,

    /// Compact the log every that many applied entries
    #[clap(long = "snapshot-threshold", env = "RAFTKV_SNAPSHOT_THRESHOLD")]
    pub snapshot_threshold: Option<u64>,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }
}

/// Milliseconds by default
fn parse_duration(s: &str) -> std::result::Result<Duration, ParseIntError> {
    let s = s.trim().to_lowercase();

    Ok(if let Some(num) = s.strip_suffix("ms") {
        Duration::from_millis(u64::from_str(num)?)
    } else if let Some(num) = s.strip_suffix('s') {
        Duration::from_secs(u64::from_str(num)?)
    } else {
        Duration::from_millis(u64::from_str(&s)?)
    })
}

#[test]
fn parse_duration_test() {
    assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
    assert_eq!(parse_duration("150"), Ok(Duration::from_millis(150)));
    assert_eq!(parse_duration("150ms"), Ok(Duration::from_millis(150)));
    assert_eq!(parse_duration("2s"), Ok(Duration::from_secs(2)));
    assert_eq!(parse_duration(" 2S "), Ok(Duration::from_secs(2)));
    assert!(parse_duration("ms").is_err());
    assert!(parse_duration("1m").is_err());
    assert!(parse_duration("-1").is_err());
}
