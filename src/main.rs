mod portrelay;

use std::{path::PathBuf, time::Duration};

use clap::Parser;

use portrelay::config;

#[derive(Debug, Parser)]
#[command(
    name = "portrelay",
    version,
    about = "portrelay - transparent TCP port forwarder with port discovery"
)]
struct Cli {
    /// Listen address: `host:port` for a single forward, or a bare host to mirror every open port of the target.
    host: Option<String>,

    /// Target address: `host:port`, or a bare host to scan.
    target: Option<String>,

    /// Per-port probe timeout in milliseconds (default 100).
    #[arg(allow_hyphen_values = true)]
    timeout_ms: Option<String>,

    /// Config file used when host and target are not both given (.json/.toml/.yaml/.yml).
    #[arg(long, env = "PORTRELAY_CONFIG", default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level (trace|debug|info|warn|error). RUST_LOG takes precedence.
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (text|json).
    #[arg(long)]
    log_format: Option<String>,

    /// Log output (stdout|stderr|discard|<file path>).
    #[arg(long)]
    log_output: Option<String>,

    /// Relay policy (first_close|drain).
    #[arg(long)]
    relay: Option<String>,

    /// Re-scan the target this often in discovery mode, e.g. `30s` or `5m`.
    #[arg(long, value_parser = humantime::parse_duration)]
    rescan_interval: Option<Duration>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let args = config::Args {
        host: cli.host,
        target: cli.target,
        timeout_ms: cli.timeout_ms,
        config_path: cli.config,
        log_level: cli.log_level,
        log_format: cli.log_format,
        log_output: cli.log_output,
        relay: cli.relay,
        rescan_interval: cli.rescan_interval,
    };

    match portrelay::run(args).await {
        Err(err) if err.downcast_ref::<config::ConfigError>().is_some() => {
            println!("{err}");
            for line in config::USAGE {
                println!("{line}");
            }
            std::process::exit(1);
        }
        res => res,
    }
}
