use std::{error::Error, path::PathBuf, time::Duration};

use busbridge::{
    Bridge, BridgeConfig,
    protocol::{
        DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_CONTENT_LENGTH, SensorId, Subscription,
        SupervisorConfig,
    },
};
use clap::Parser;
use log::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Gateway host
    #[arg(long, env = "BUSBRIDGE_HOST", default_value = "127.0.0.1")]
    host: String,
    /// Gateway port
    #[arg(long, env = "BUSBRIDGE_PORT", default_value_t = 8080)]
    port: u16,
    /// Directory for persisted history; kept in memory when omitted
    #[arg(long, env = "BUSBRIDGE_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Identity announced in the subscription handshake
    #[arg(long, env = "BUSBRIDGE_IDENTITY", default_value = "py_miner,pm1")]
    identity: String,
    /// Ask the gateway to re-send its value table after connecting
    #[arg(long, env = "BUSBRIDGE_REFRESH_ON_CONNECT")]
    refresh_on_connect: bool,
    /// Delay before reconnecting after a session ends
    #[arg(long, env = "BUSBRIDGE_RECONNECT_DELAY_MS", default_value_t = 1000)]
    reconnect_delay_ms: u64,
    /// Bound on each connection attempt
    #[arg(
        long,
        env = "BUSBRIDGE_CONNECT_TIMEOUT_MS",
        default_value_t = DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
    )]
    connect_timeout_ms: u64,
    /// Largest frame body accepted from the gateway
    #[arg(long, env = "BUSBRIDGE_MAX_CONTENT_LENGTH", default_value_t = DEFAULT_MAX_CONTENT_LENGTH)]
    max_content_length: usize,
    /// Sensor ids with a history series (comma separated); defaults to the built-in catalogue
    #[arg(long, env = "BUSBRIDGE_TRACK", value_delimiter = ',')]
    track: Vec<SensorId>,
    /// How long sampled history is kept
    #[arg(long, env = "BUSBRIDGE_RETENTION_HOURS", default_value_t = 7 * 24)]
    retention_hours: u64,
    /// Interval between value table snapshots in the log
    #[arg(long, env = "BUSBRIDGE_SNAPSHOT_INTERVAL_SECS", default_value_t = 30 * 60)]
    snapshot_interval_secs: u64,
    /// Interval between history samples
    #[arg(long, env = "BUSBRIDGE_SAMPLE_INTERVAL_SECS", default_value_t = 10 * 60)]
    sample_interval_secs: u64,
}

impl From<Cli> for BridgeConfig {
    fn from(cli: Cli) -> Self {
        let defaults = BridgeConfig::default();
        Self {
            supervisor: SupervisorConfig {
                address: format!("{}:{}", cli.host, cli.port),
                subscription: Subscription {
                    identity: cli.identity,
                    refresh_on_connect: cli.refresh_on_connect,
                    ..Default::default()
                },
                reconnect_delay: Duration::from_millis(cli.reconnect_delay_ms),
                connect_timeout: Duration::from_millis(cli.connect_timeout_ms.max(1)),
                max_content_length: cli.max_content_length,
            },
            data_dir: cli.data_dir,
            tracked: if cli.track.is_empty() {
                defaults.tracked
            } else {
                cli.track
            },
            retention: Duration::from_secs(cli.retention_hours.saturating_mul(60 * 60)),
            snapshot_interval: Duration::from_secs(cli.snapshot_interval_secs.max(1)),
            sample_interval: Duration::from_secs(cli.sample_interval_secs.max(1)),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    if let Some(dir) = &cli.data_dir {
        if !dir.is_dir() {
            return Err(format!("'{}' is not a directory", dir.display()).into());
        }
    }

    let bridge = Bridge::new(cli.into());
    let handle = bridge.handle();
    ctrlc::set_handler(move || {
        info!("received shutdown signal");
        handle.shutdown();
    })?;

    bridge.run()?;
    Ok(())
}
