mod abi;
mod config;
mod consumer;
mod database;
mod decoder;
mod source;
mod spec;

use self::{
    abi::Abi,
    config::Config,
    consumer::Consumer,
    database::{Database, Projection},
    source::node::Node,
    spec::Spec,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::broadcast;

#[derive(Parser)]
struct Arguments {
    #[clap(short, long, env = "EVENTSQL_CONFIG", default_value = "eventsql.toml")]
    config: PathBuf,
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Streams finalized blocks into the database until interrupted.
    Run,
    /// Prints the rows committed for a block height as JSON.
    Block { height: u64 },
    /// Copies the tables as they were at a point in time into tables
    /// prefixed with the label.
    Restore {
        /// RFC 3339 timestamp, e.g. `2023-05-01T12:00:00Z`.
        #[clap(long)]
        time: DateTime<Utc>,
        #[clap(long)]
        label: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Arguments::parse();
    let config = Config::load(&args.config).context("failed to load configuration")?;
    tracing::info!("{config:#?}");

    let mut database = database::open(&config.database, config.retention())
        .await
        .context("failed to open database")?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config, database).await,
        Command::Block { height } => {
            let block = database.block(height).await?;
            match block {
                Some(block) => println!("{}", serde_json::to_string_pretty(&block)?),
                None => anyhow::bail!("block {height} has not been committed"),
            }
            Ok(())
        }
        Command::Restore { time, label } => {
            database.restore(time, &label).await?;
            tracing::info!(%time, %label, "restored");
            Ok(())
        }
    }
}

async fn run(config: Config, database: Box<dyn Database>) -> Result<()> {
    let abi = Abi::load(&config.abi)?;
    anyhow::ensure!(!abi.is_empty(), "ABI files declare no events");
    for entry in abi.iter() {
        tracing::debug!(event = %entry.canonical(), "loaded event");
    }
    let spec = Spec::load(&config.spec, &abi, config.blocks)?;
    tracing::info!(
        events = abi.len(),
        tables = spec.tables().len(),
        "loaded mapping"
    );

    let (notifications, mut committed) =
        broadcast::channel::<Arc<Projection>>(config.notifications);
    tokio::spawn(async move {
        loop {
            match committed.recv().await {
                Ok(projection) => tracing::info!(
                    block = %projection.height,
                    tables = projection.tables.len(),
                    "committed"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(%skipped, "missed block notifications")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let node = Node::new(
        ethrpc::http::Client::new(config.node.clone()),
        config.poll_interval,
    );
    let handle = Consumer::new(Arc::new(spec), Arc::new(abi), database)
        .with_notifications(notifications)
        .spawn(node, config.start);

    let shutdown = {
        let mut state = handle.state();
        async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("failed to listen for ctrl-c")?;
                    tracing::info!("shutting down");
                    Ok::<_, anyhow::Error>(true)
                }
                _ = state.wait_for(|state| *state == consumer::State::Stopped) => Ok(false),
            }
        }
    };
    if shutdown.await? {
        handle.shutdown();
    }
    let (_, result) = handle.join().await;
    Ok(result?)
}
