//! Vault guard CLI
//!
//! Command-line interface for validating, signing, and submitting vault
//! operations.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vault_guard::audit_log::AuditLog;
use vault_guard::submission::{cancel_pair, SubmissionCoordinator};
use vault_guard::tx::{assemble, SignatureWitness, SignedTransaction, UnsignedTransaction};
use vault_guard::vault::{Credential, FileVaultStore, Operation, VaultId, VaultSettings};
use vault_guard::wallet::LocalKeyHolder;
use vault_guard::{Config, Error, Result, VaultService};

#[derive(Parser)]
#[command(name = "vault-guard")]
#[command(about = "Authorize, sign, and submit operations on agent-traded vaults")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current configuration
    Config,

    /// Open a vault with its first deposit
    Create {
        #[arg(long)]
        vault: String,

        /// Owner credential (hex public-key hash)
        #[arg(long)]
        owner: String,

        /// Agent credential (hex public-key hash)
        #[arg(long)]
        agent: String,

        /// Initial deposit in the smallest currency unit
        #[arg(long)]
        deposit: u64,

        #[arg(long, default_value_t = 0)]
        max_trade: u64,

        #[arg(long, default_value_t = 2)]
        leverage_limit: u64,
    },

    /// Print a vault's stored state
    Show {
        #[arg(long)]
        vault: String,
    },

    /// Check an operation against a vault without signing or storing anything
    Validate {
        #[arg(long)]
        vault: String,

        /// Operation JSON file
        #[arg(long)]
        operation: PathBuf,

        /// Unsigned transaction JSON file
        #[arg(long)]
        tx: PathBuf,
    },

    /// Merge a signature witness into an unsigned transaction
    Assemble {
        #[arg(long)]
        tx: PathBuf,

        #[arg(long)]
        witness: PathBuf,

        /// Write the signed transaction here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Submit a signed transaction through the configured channels
    Submit {
        #[arg(long)]
        vault: String,

        /// Signed transaction JSON file
        #[arg(long)]
        signed: PathBuf,
    },

    /// Validate, sign, commit, and submit an operation
    Execute {
        #[arg(long)]
        vault: String,

        #[arg(long)]
        operation: PathBuf,

        #[arg(long)]
        tx: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (ignore if not found)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(cli.json_logs.then(|| fmt::layer().json()))
        .with((!cli.json_logs).then(|| fmt::layer()))
        .with(filter)
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Create {
            vault,
            owner,
            agent,
            deposit,
            max_trade,
            leverage_limit,
        } => {
            let service = build_service(&config).await?;
            let record = service
                .open_vault(
                    &VaultId::new(vault),
                    Credential::new(owner),
                    Credential::new(agent),
                    VaultSettings {
                        max_trade_amount: max_trade,
                        leverage_limit,
                    },
                    deposit,
                    chrono::Utc::now(),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Show { vault } => {
            let service = build_service(&config).await?;
            let record = service.load(&VaultId::new(vault)).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Validate {
            vault,
            operation,
            tx,
        } => {
            let service = build_service(&config).await?;
            let op = read_operation(&operation).await?;
            let tx: UnsignedTransaction = read_json(&tx).await?;
            let (record, next) = service.authorize(&VaultId::new(vault), &op, &tx).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "vault_id": record.vault_id,
                    "version": record.version,
                    "operation": op.kind(),
                    "current": record.state,
                    "proposed": next,
                }))?
            );
        }
        Commands::Assemble { tx, witness, out } => {
            let unsigned: UnsignedTransaction = read_json(&tx).await?;
            let witness: SignatureWitness = read_json(&witness).await?;
            let signed = assemble(&unsigned, &witness)?;
            let json = serde_json::to_string_pretty(&signed)?;
            match out {
                Some(path) => {
                    tokio::fs::write(&path, json).await?;
                    tracing::info!(
                        path = %path.display(),
                        tx_id = %signed.tx_id(),
                        "Signed transaction written"
                    );
                }
                None => println!("{}", json),
            }
        }
        Commands::Submit { vault, signed } => {
            let service = build_service(&config).await?;
            let signed: SignedTransaction = read_json(&signed).await?;
            let (handle, signal) = cancel_pair();
            spawn_ctrl_c(handle);
            let receipt = service
                .submit(&VaultId::new(vault), &signed, &signal)
                .await?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Commands::Execute {
            vault,
            operation,
            tx,
        } => {
            let key_holder = LocalKeyHolder::from_env(&config.signing_key_env)?;
            tracing::info!(
                credential = %vault_guard::wallet::KeyHolder::credential(&key_holder),
                "Loaded signing key from {}",
                config.signing_key_env
            );
            let service = build_service(&config)
                .await?
                .with_key_holder(Arc::new(key_holder));
            let op = read_operation(&operation).await?;
            let tx: UnsignedTransaction = read_json(&tx).await?;

            let (handle, signal) = cancel_pair();
            spawn_ctrl_c(handle);
            let report = service
                .execute(&VaultId::new(vault), &op, &tx, &signal)
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn build_service(config: &Config) -> Result<VaultService> {
    let store = FileVaultStore::open(&config.store_dir).await?;
    let channels = config.submission.build_channels()?;
    tracing::debug!(
        store_dir = %config.store_dir,
        channels = channels.len(),
        timeout_ms = config.submission.channel_timeout_ms,
        "Building vault service"
    );

    let mut service = VaultService::new(config.policy.clone(), Arc::new(store))
        .with_channels(channels)
        .with_coordinator(SubmissionCoordinator::new(
            config.submission.channel_timeout(),
        ));
    if let Some(path) = &config.audit_log_path {
        service = service.with_audit_log(AuditLog::new(path));
    }
    Ok(service)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::InvalidArgument(format!("cannot read {}: {}", path.display(), e))
    })?;
    Ok(serde_json::from_str(&content)?)
}

async fn read_operation(path: &Path) -> Result<Operation> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        Error::InvalidArgument(format!("cannot read {}: {}", path.display(), e))
    })?;
    Ok(Operation::from_json_str(&content)?)
}

/// Cancel remaining submission attempts on Ctrl-C
fn spawn_ctrl_c(handle: vault_guard::submission::CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; no further submission channels will be tried");
            handle.cancel();
        }
    });
}
