//! netrack: network request tracker
//!
//! One binary for both sides of the shared store:
//!
//! - `run` / `filter`: interceptor (proxy listener, JSON-lines filter adapter)
//! - `list` / `show` / `delete` / `clear` / `watch`: viewer

mod config;

use crate::config::TrackerConfig;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netrack_filter::FilterFlow;
use netrack_provider::{
    DataVerdict, FilterPipeline, LogNotifier, NullNotifier, PipelineDecision, ProxyProvider,
    TcpProxyListener, UserNotifier,
};
use netrack_store::{RecordId, RequestRecord, RequestStore};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Intercept outbound requests and keep a log of the ones matching a filter
#[derive(Parser)]
#[command(name = "netrack")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, default_value = "netrack.toml")]
    config: PathBuf,

    /// Directory shared between interceptor and viewer
    #[arg(long, global = true, env = "NETRACK_GROUP_DIR")]
    group_dir: Option<PathBuf>,

    /// Hostname substring to log
    #[arg(long, global = true, env = "NETRACK_FILTER")]
    filter: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy listener and log matching requests (Ctrl-C stops)
    Run,

    /// Decide JSON flows read line by line from stdin
    Filter,

    /// List logged requests, newest first
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show one logged request
    Show { id: RecordId },

    /// Delete one logged request
    Delete { id: RecordId },

    /// Delete every logged request
    Clear,

    /// Print the log again whenever it changes
    Watch,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = TrackerConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.apply_overrides(cli.filter, cli.group_dir);
    config.validate().context("Invalid configuration")?;

    // Logs go to stderr; stdout carries command output
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();

    let store = RequestStore::open(config.store_config())
        .with_context(|| format!("Failed to open store in {}", config.group_dir.display()))?;

    match cli.command {
        Commands::Run => run_proxy(&config, store),
        Commands::Filter => run_filter(&config, store),
        Commands::List { json } => list(&store, json),
        Commands::Show { id } => show(&store, &id),
        Commands::Delete { id } => delete(&store, &id),
        Commands::Clear => {
            let removed = store.delete_all()?;
            println!("Deleted {} request(s)", removed);
            Ok(())
        }
        Commands::Watch => watch(&config, &store),
    }
}

fn user_notifier(config: &TrackerConfig) -> Arc<dyn UserNotifier> {
    if config.notifications {
        Arc::new(LogNotifier)
    } else {
        Arc::new(NullNotifier)
    }
}

fn run_proxy(config: &TrackerConfig, store: RequestStore) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("netrack-worker")
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async {
        let provider = Arc::new(ProxyProvider::new(
            config.proxy_provider_config(),
            config.classifier(),
            store.clone(),
        ));

        let mut started = Ok(());
        provider.start(|result| started = result);
        started.context("Failed to start proxy provider")?;

        let mut listener = TcpProxyListener::new(config.listener_config(), provider.clone());
        let addr = listener.bind().await?;
        info!("Logging requests matching '{}' via {}", config.filter, addr);

        let server = tokio::spawn(async move { listener.run().await });

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Shutting down");

        provider.stop(|| {});
        server.await.context("Listener task panicked")??;
        Ok::<_, anyhow::Error>(())
    })?;

    store.flush()?;
    Ok(())
}

fn run_filter(config: &TrackerConfig, store: RequestStore) -> Result<()> {
    let pipeline = FilterPipeline::new(config.classifier(), store, user_notifier(config));
    pipeline.start().context("Failed to start filter providers")?;

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let decision = match serde_json::from_str::<FilterFlow>(&line) {
            Ok(flow) => pipeline.handle(&flow),
            Err(e) => {
                // Undecodable flows are let through
                warn!("Invalid flow: {}", e);
                PipelineDecision {
                    data: DataVerdict::Allow,
                    control: None,
                }
            }
        };

        serde_json::to_writer(&mut stdout, &decision)?;
        writeln!(stdout)?;
        stdout.flush()?;
    }

    pipeline.stop();
    let (decided, escalated) = pipeline.data().stats();
    let (_, logged, failed) = pipeline.control().stats();
    info!(
        "Filter done: {} flow(s), {} escalated, {} logged, {} failed",
        decided, escalated, logged, failed
    );
    Ok(())
}

fn print_record(record: &RequestRecord) {
    println!("{}  {}  {}  {}", record.id, record.display_date(), record.link, record.text);
}

fn list(store: &RequestStore, json: bool) -> Result<()> {
    let records = store.fetch_all()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No requests logged");
    }
    for record in &records {
        print_record(record);
    }
    Ok(())
}

fn show(store: &RequestStore, id: &RecordId) -> Result<()> {
    let record = store
        .fetch_by_id(id)?
        .with_context(|| format!("No request with id {}", id))?;

    println!("id:    {}", record.id);
    println!("date:  {}", record.display_date());
    println!("link:  {}", record.link);
    println!("text:  {}", record.text);
    Ok(())
}

fn delete(store: &RequestStore, id: &RecordId) -> Result<()> {
    if store.delete(id)? {
        println!("Deleted {}", id);
    } else {
        println!("No request with id {}", id);
    }
    Ok(())
}

fn watch(config: &TrackerConfig, store: &RequestStore) -> Result<()> {
    let _watcher = store.watch(config.watch_interval())?;
    let changes = store.subscribe();

    info!("Watching {}", store.path().display());
    list(store, false)?;

    while changes.recv().is_some() {
        println!();
        list(store, false)?;
    }
    Ok(())
}
