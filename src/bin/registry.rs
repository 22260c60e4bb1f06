//! Contract Registry operator CLI
//!
//! Usage:
//!   contract-registry check --old v1.json --new v2.json --mode backward
//!   contract-registry sweep
//!   contract-registry dead-letters list
//!   contract-registry dead-letters replay <RECORD_ID>
//!   contract-registry config show

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::debug;

use contract_registry::compatibility::CompatibilityChecker;
use contract_registry::config::{LoggingConfig, RegistryConfig};
use contract_registry::dead_letter::{DeadLetterSink, FileDeadLetterSink};
use contract_registry::delivery::{
    DeliveryId, DeliveryRecord, DeliveryStore, Dispatcher, FileDeliveryStore, MemoryDeliveryStore,
    StaticSubscriptions,
};
use contract_registry::{
    logging, CompatibilityMode, CompatibilityOutcome, ContractEngine, ContractVersion, EngineSettings,
    MemoryStore, SchemaDocument,
};

#[derive(Parser)]
#[command(name = "contract-registry")]
#[command(about = "Check contract compatibility and operate the governance registry")]
struct Cli {
    /// Config file layered over the default locations
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare two schema files under a compatibility mode
    Check {
        /// Currently published schema
        #[arg(long)]
        old: PathBuf,

        /// Candidate schema
        #[arg(long)]
        new: PathBuf,

        /// Compatibility mode (backward, forward, full, none)
        #[arg(short, long, default_value = "backward")]
        mode: CompatibilityMode,

        /// Treat the old schema as having live consumers (gates forward checks)
        #[arg(long)]
        consumers: bool,

        /// Current version, to print a suggested next version
        #[arg(long)]
        current_version: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Expire pending proposals past their deadline
    Sweep {
        /// Governance state snapshot (defaults to [store].snapshot_path)
        #[arg(long)]
        state: Option<PathBuf>,
    },

    /// Inspect and replay dead-lettered deliveries
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterCommands,
    },

    /// Show or write configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum DeadLetterCommands {
    List {
        /// Only entries for this destination URL
        #[arg(short, long)]
        destination: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    Replay {
        /// Id of the dead-lettered delivery record
        record_id: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Write a default configuration file
    Init {
        #[arg(default_value = "contracts.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match RegistryConfig::load_from(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            // Still log with defaults so the failure is visible
            let _ = logging::init(&LoggingConfig::default());
            eprintln!("❌ Error: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = logging::init(&config.logging) {
        eprintln!("⚠️  {}", e);
    }

    match run(cli.command, config).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(command: Commands, config: RegistryConfig) -> anyhow::Result<i32> {
    match command {
        Commands::Check {
            old,
            new,
            mode,
            consumers,
            current_version,
            format,
        } => check(&old, &new, mode, consumers, current_version.as_deref(), &format, &config),
        Commands::Sweep { state } => sweep(state, &config).await,
        Commands::DeadLetters { action } => match action {
            DeadLetterCommands::List { destination, format } => {
                list_dead_letters(destination.as_deref(), &format, &config).await
            }
            DeadLetterCommands::Replay { record_id } => replay(&record_id, &config).await,
        },
        Commands::Config { action } => match action {
            ConfigCommands::Show => {
                print!("{}", config.to_toml()?);
                Ok(0)
            }
            ConfigCommands::Init { path, force } => {
                if path.exists() && !force {
                    bail!("{} already exists; pass --force to overwrite", path.display());
                }
                RegistryConfig::default().save(&path)?;
                println!("✅ Wrote {}", path.display());
                Ok(0)
            }
        },
    }
}

fn load_schema(path: &Path, config: &RegistryConfig) -> anyhow::Result<SchemaDocument> {
    let text = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let schema = SchemaDocument::parse(&text).with_context(|| format!("cannot parse {}", path.display()))?;
    schema
        .validate(&config.schema_limits())
        .with_context(|| format!("invalid schema {}", path.display()))?;
    Ok(schema)
}

fn check(
    old: &Path,
    new: &Path,
    mode: CompatibilityMode,
    consumers: bool,
    current_version: Option<&str>,
    format: &str,
    config: &RegistryConfig,
) -> anyhow::Result<i32> {
    let old_schema = load_schema(old, config)?;
    let new_schema = load_schema(new, config)?;

    let team = contract_registry::TeamId::new("consumers");
    let registered = [contract_registry::compatibility::RegisteredSchema {
        team: &team,
        schema: &old_schema,
    }];
    let registrations: &[_] = if consumers { &registered } else { &[] };
    let outcome = CompatibilityChecker::new().check(&old_schema, &new_schema, mode, registrations);

    let suggested = current_version
        .map(ContractVersion::parse)
        .transpose()
        .context("invalid --current-version")?
        .map(|v| outcome.suggested_version(&v));

    match format {
        "json" => {
            let report = serde_json::json!({
                "mode": outcome.mode,
                "compatible": outcome.is_compatible(),
                "changes": outcome.changes,
                "suggested_version": suggested.as_ref().map(ToString::to_string),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => print_text_report(&outcome, suggested.as_ref()),
    }

    if outcome.is_compatible() {
        Ok(0)
    } else {
        eprintln!("\n❌ BREAKING CHANGES DETECTED - publishing will open a proposal");
        Ok(2)
    }
}

fn print_text_report(outcome: &CompatibilityOutcome, suggested: Option<&ContractVersion>) {
    println!("🔍 Compatibility check ({} mode)\n", outcome.mode);
    if outcome.changes.is_empty() {
        println!("✅ No changes detected");
    }
    for change in &outcome.changes {
        let marker = if change.breaking { "❌" } else { "✓ " };
        println!("  {} [{:?}] {}: {}", marker, change.kind, change.field, change.description);
    }
    println!("\n{}", outcome.summary());
    if let Some(version) = suggested {
        println!("Suggested next version: {}", version);
    }
}

async fn sweep(state: Option<PathBuf>, config: &RegistryConfig) -> anyhow::Result<i32> {
    let path = state.unwrap_or_else(|| config.store.snapshot_path.clone());
    let store = Arc::new(
        MemoryStore::load_snapshot(&path).with_context(|| format!("cannot load state {}", path.display()))?,
    );
    let dispatcher = dispatcher(config)?;
    let engine = ContractEngine::new(store.clone(), EngineSettings::try_from(config)?)
        .with_dispatcher(dispatcher.clone());

    let expired = engine.sweep_expired().await?;
    store
        .save_snapshot(&path)
        .with_context(|| format!("cannot save state {}", path.display()))?;
    // Expiry notices go out before the process exits
    dispatcher.flush().await?;
    println!("✅ Expired {} proposal(s)", expired);
    Ok(0)
}

fn delivery_store(config: &RegistryConfig) -> anyhow::Result<Arc<dyn DeliveryStore>> {
    match config.dead_letter.delivery_state_path() {
        Some(path) => {
            let store = FileDeliveryStore::open(&path)
                .with_context(|| format!("cannot load delivery state {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryDeliveryStore::new())),
    }
}

/// Dispatcher for the configured webhook, sharing breaker state with earlier runs
fn dispatcher(config: &RegistryConfig) -> anyhow::Result<Dispatcher> {
    let subscriptions = StaticSubscriptions::new(config.global_subscription().into_iter().collect());
    let mut builder = Dispatcher::builder()
        .settings(config.dispatcher_settings()?)
        .subscriptions(Arc::new(subscriptions))
        .store(delivery_store(config)?);
    if let Some(path) = &config.dead_letter.path {
        builder = builder.dead_letters(Arc::new(FileDeadLetterSink::new(path.clone())));
    }
    Ok(builder.spawn()?)
}

fn dead_letter_sink(config: &RegistryConfig) -> anyhow::Result<FileDeadLetterSink> {
    let Some(path) = &config.dead_letter.path else {
        bail!("no dead-letter file configured; set [dead_letter].path");
    };
    Ok(FileDeadLetterSink::new(path.clone()))
}

async fn list_dead_letters(destination: Option<&str>, format: &str, config: &RegistryConfig) -> anyhow::Result<i32> {
    let sink = dead_letter_sink(config)?;
    let entries = sink.list(destination).await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(0);
    }
    if entries.is_empty() {
        println!("✅ No dead letters");
    }
    for record in &entries {
        print_record(record);
    }
    Ok(0)
}

fn print_record(record: &DeliveryRecord) {
    println!(
        "{}  {:<24} {:<14} {}  attempts={} {}",
        record.id,
        record.action.as_str(),
        record.status.as_str(),
        record.destination,
        record.attempts,
        record.last_error.as_deref().unwrap_or("")
    );
}

async fn replay(record_id: &str, config: &RegistryConfig) -> anyhow::Result<i32> {
    let id: DeliveryId = record_id
        .parse()
        .with_context(|| format!("invalid record id '{}'", record_id))?;
    // Fails early when no dead-letter file is configured
    dead_letter_sink(config)?;
    let dispatcher = dispatcher(config)?;

    let record = dispatcher.replay(id).await?;
    dispatcher.flush().await?;
    debug!(delivery_id = %record.id, status = %record.status, "replay finished");
    print_record(&record);
    Ok(if record.status == contract_registry::DeliveryStatus::Delivered { 0 } else { 1 })
}
