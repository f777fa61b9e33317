//! Queue administration CLI.
//!
//! `trellis-cli queue reload -q <name> -c <channel>...` moves dead-channel
//! events back to waiting; `queue flush` deletes them. Connection and key
//! namespacing come from the environment (`REDIS_URL`, `TRELLIS_APP`,
//! `TRELLIS_ENV`), the same knobs the services use.

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use trellis_core::Context;
use trellis_queue::driver::redis::RedisDriver;
use trellis_queue::{Channel, Driver, QueueConfig};

#[derive(Parser)]
#[command(name = "trellis-cli", version, about = "trellis queue administration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Administer persistent queue channels.
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
}

#[derive(Subcommand)]
enum QueueCommand {
    /// Move every event of the given channels back to waiting.
    Reload {
        /// Queue name.
        #[arg(short, long, default_value = "default")]
        queue: String,
        /// Channels to reload (failed, timeout).
        #[arg(short, long, required = true)]
        channel: Vec<String>,
    },
    /// Delete every event of the given channels.
    Flush {
        /// Queue name.
        #[arg(short, long, default_value = "default")]
        queue: String,
        /// Channels to flush.
        #[arg(short, long, required = true)]
        channel: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    trellis_observability::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Queue { command } => match command {
            QueueCommand::Reload { queue, channel } => {
                let driver = open_driver(&queue)?;
                let ctx = Context::background();
                for name in channel {
                    let channel: Channel = name.parse()?;
                    let moved = driver
                        .reload(&ctx, channel)
                        .with_context(|| format!("reloading {channel} of queue {queue}"))?;
                    println!("{queue}/{channel}: moved {moved} events back to waiting");
                }
            }
            QueueCommand::Flush { queue, channel } => {
                let driver = open_driver(&queue)?;
                let ctx = Context::background();
                for name in channel {
                    let channel: Channel = name.parse()?;
                    driver
                        .flush(&ctx, channel)
                        .with_context(|| format!("flushing {channel} of queue {queue}"))?;
                    println!("{queue}/{channel}: flushed");
                }
            }
        },
    }

    Ok(())
}

fn open_driver(queue: &str) -> anyhow::Result<RedisDriver> {
    let config = QueueConfig::from_env(queue);
    RedisDriver::open(
        &config.redis_url,
        &config.app,
        &config.env,
        &config.name,
        config.pop_timeout,
    )
    .with_context(|| format!("connecting to {}", config.redis_url))
}
