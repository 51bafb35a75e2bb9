//! hubmq – the hub daemon.
//
//  $ hubmq start --config hubmq.toml
//
// The daemon serves subscribers; publishing happens in the process that
// embeds [`hubmq::Hub`].

use std::process;

use clap::{Parser, Subcommand};
use hubmq::config::{load_config, Config};
use hubmq::logging::init_logging;
use hubmq::Hub;

#[derive(Debug, Parser)]
#[command(name = "hubmq", version, about = "hubmq fan-out hub daemon")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the hub daemon.
    Start {
        /// Path to config TOML (env HUBMQ_CONFIG overrides)
        #[arg(short, long, default_value = "hubmq.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.cmd {
        Command::Start { config } => {
            let cfg_path = std::env::var("HUBMQ_CONFIG").unwrap_or(config);
            let cfg: Config = match load_config(&cfg_path) {
                Ok(cfg) => cfg,
                Err(err) => {
                    eprintln!("[FATAL] failed to load config {cfg_path}: {err}");
                    process::exit(1);
                }
            };

            let hub = Hub::new(cfg);
            let addr = hub.start().await?;
            println!("📡 hubmq listening on {addr}");

            tokio::signal::ctrl_c().await?;
            println!("shutting down");
            hub.shutdown().await;
        }
    }
    Ok(())
}
