use std::process::ExitCode;

use clap::Parser;
use netq_worker::{ConfigSource, SqliteQueue, Worker, WorkerError};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command};

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "netq-worker failed");
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<(), WorkerError> {
    let source = ConfigSource::new(cli.config.clone()).with_ttl_override(cli.ttl.clone());
    let mut settings = source.load()?;
    cli.apply_overrides(&mut settings);
    settings.validate()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let queue = SqliteQueue::open(&settings.database)?;
            let mut worker = Worker::with_source(&settings, queue, source)?;
            worker.watch_signals()?;
            info!(
                database = %settings.database.display(),
                ttl = %settings.ttl,
                max_connections = settings.max_connections,
                "netq worker starting"
            );
            worker.run()
        }
        Command::Enqueue {
            method,
            url,
            headers,
            body,
        } => {
            let queue = SqliteQueue::open(&settings.database)?;
            let lines: Vec<&str> = headers.iter().map(String::as_str).collect();
            let id = queue.enqueue(&method, &url, &lines, body.as_deref())?;
            println!("{id}");
            Ok(())
        }
        Command::Show { id } => {
            let queue = SqliteQueue::open(&settings.database)?;
            match queue.response(id)? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("no response recorded for {id}"),
            }
            Ok(())
        }
    }
}
