//! # relay-node
//!
//! Runs a Relay message store as a line-oriented process:
//! - **stdin** takes decrypted envelopes (or local send commands) as JSON
//!   lines and applies them to the store
//! - **stdout** receives every outgoing message as a JSON line (the outbox)
//! - a background interval sweeps expired disappearing messages
//! - every committed change is logged at debug level

mod config;
mod error;
mod ingest;
mod outbox;
mod sweep;

use std::sync::Arc;

use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_store::{Database, Environment, StoreFiles};

use crate::config::NodeConfig;
use crate::outbox::Outbox;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG); stdout belongs to the outbox
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,relay_node=debug,relay_store=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting Relay node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = NodeConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the store and build the environment
    // -----------------------------------------------------------------------
    let files = match &config.data_dir {
        Some(dir) => StoreFiles::in_dir(dir),
        None => StoreFiles::default_location()?,
    };
    let options = config.store_options();
    let db = tokio::task::spawn_blocking(move || -> relay_store::Result<Arc<Database>> {
        let db = Database::open(files, options)?;
        db.register_builtin_views()?;
        Ok(db)
    })
    .await??;
    info!(path = %db.files().database.display(), commit = db.commit_seq(), "Store ready");

    let (outbox, outbox_rx) = Outbox::new();
    let env = Environment::builder(Arc::clone(&db), config.local_id.clone())
        .message_sender(Arc::new(outbox))
        .build();

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    sweep::spawn_notification_logger(db.subscribe()?)?;
    let sweeper = sweep::spawn_sweeper(Arc::clone(&db), config.sweep_interval);
    let writer = tokio::spawn(outbox::run_outbox(outbox_rx, tokio::io::stdout(), config.local_id.clone()));

    // -----------------------------------------------------------------------
    // 5. Ingest stdin until EOF or Ctrl+C
    // -----------------------------------------------------------------------
    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = ingest::ingest_lines(&env, stdin) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "ingest failed");
                sweeper.abort();
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    // Dropping the last Outbox handle lets the writer finish pending sends.
    sweeper.abort();
    drop(env);
    let sent = writer.await?;
    db.checkpoint()?;
    info!(sent, "Relay node stopped");

    Ok(())
}
