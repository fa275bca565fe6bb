//! Command-line definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dispatchd", version, about = "Distributed task dispatcher")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the dispatcher service.
    Run {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "dispatchd.toml")]
        config: PathBuf,
    },

    /// Send a control command to a running dispatcher and print replies.
    Control {
        /// Control command name (e.g. alive, running, cancel).
        command: String,

        /// Path to the TOML configuration file.
        #[arg(long, default_value = "dispatchd.toml")]
        config: PathBuf,

        /// Channel to publish on; defaults to the first configured channel.
        #[arg(long)]
        channel: Option<String>,

        /// JSON object passed to the handler as control_data.
        #[arg(long)]
        data: Option<String>,

        /// How many replies to wait for (the known cluster size).
        #[arg(long, default_value_t = 1)]
        expected_replies: usize,

        /// Seconds to wait before returning whatever replies arrived.
        #[arg(long, default_value_t = 5.0)]
        timeout: f64,

        /// Publish fire-and-forget without waiting for replies.
        #[arg(long)]
        no_reply: bool,
    },

    /// Worker loop; spawned by the service, not for interactive use.
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        worker_id: usize,
    },
}
