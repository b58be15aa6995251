//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use netq_core::Interval;
use netq_worker::Settings;

#[derive(Parser)]
#[command(author, version, about = "Asynchronous HTTP dispatch worker", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database holding the queue
    #[arg(short, long, global = true)]
    pub database: Option<PathBuf>,

    /// Retention for queue rows, e.g. "6 hours"
    #[arg(long, global = true)]
    pub ttl: Option<Interval>,

    /// Cap on simultaneously open connections
    #[arg(long, global = true)]
    pub max_connections: Option<usize>,

    /// Dispatch tick period in milliseconds
    #[arg(long, global = true)]
    pub idle_interval_ms: Option<u64>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the worker until SIGTERM or SIGINT (default)
    Run,
    /// Queue one request and print its id
    Enqueue {
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        #[arg(short, long)]
        url: String,
        /// "Name: value" header line, repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        #[arg(short, long)]
        body: Option<String>,
    },
    /// Print the response record for an id
    Show { id: i64 },
}

impl Cli {
    /// Command line values win over the config file.
    pub fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(database) = &self.database {
            settings.database = database.clone();
        }
        if let Some(ttl) = &self.ttl {
            settings.ttl = ttl.clone();
        }
        if let Some(max) = self.max_connections {
            settings.max_connections = max;
        }
        if let Some(ms) = self.idle_interval_ms {
            settings.idle_interval_ms = ms;
        }
    }
}
