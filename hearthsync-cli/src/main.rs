use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use hearthsync_core::audit::AuditLogger;
use hearthsync_core::crypto::{derive_root_secret, KdfParams};
use hearthsync_core::export::seal_snapshot;
use hearthsync_core::keys::SqliteKeyStore;
use hearthsync_core::sync::{ChangeState, Priority};
use hearthsync_core::{platform, ChangeFilter, CoreConfig, EncryptionService, KeyManager, LocalStore};
use rpassword::prompt_password;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PASSPHRASE_ENV: &str = "HEARTHSYNC_PASSPHRASE";

/// HearthSync - inspect and maintain a local encrypted store
#[derive(Parser)]
#[command(name = "hearthsync")]
#[command(about = "Inspect and maintain a HearthSync local store", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store database, overriding the configured path
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Do not ask for a passphrase; persisted keys are written unwrapped
    #[arg(long, global = true)]
    no_passphrase: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Key management
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },

    /// Write fields to a record and queue the change
    Put {
        /// Entity type, e.g. "symptom_log"
        entity: String,
        /// Record identifier
        id: String,
        /// Fields as key=value; values are parsed as JSON, falling back to text
        #[arg(required = true)]
        fields: Vec<String>,
        #[arg(long, default_value = "medium")]
        priority: String,
    },

    /// Print a decrypted record
    Get { id: String },

    /// Delete a record and queue the deletion
    Delete {
        id: String,
        #[arg(long, default_value = "medium")]
        priority: String,
    },

    /// List pending changes
    Queue {
        /// Only changes in this state (queued, in_flight, conflicted, failed)
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        record: Option<String>,
    },

    /// List conflicts awaiting a decision
    Conflicts,

    /// Put failed changes back in the queue
    Requeue {
        /// Only changes of this record
        #[arg(long)]
        record: Option<String>,
    },

    /// Move records onto the active key of a key id
    Reencrypt {
        #[arg(default_value = "primary")]
        key_id: String,
    },

    /// Write a sealed export bundle
    Export {
        /// Backup key to seal with; must start with "backup-"
        #[arg(long)]
        key: String,
        /// Output file
        #[arg(long)]
        output: PathBuf,
        /// Records to include (all when omitted)
        ids: Vec<String>,
    },

    /// Queue, conflict and key usage overview
    Status,
}

#[derive(Subcommand)]
enum KeyCommands {
    List,
    Generate { id: String },
    Rotate { id: String },
    Delete { id: String },
}

struct Session {
    keys: Arc<KeyManager>,
    store: LocalStore,
}

fn parse_priority(s: &str) -> Result<Priority> {
    Priority::parse(s).ok_or_else(|| anyhow!("unknown priority '{}'", s))
}

fn parse_fields(pairs: &[String]) -> Result<BTreeMap<String, Value>> {
    pairs
        .iter()
        .map(|pair| {
            let (field, raw) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("expected key=value, got '{}'", pair))?;
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            Ok((field.to_string(), value))
        })
        .collect()
}

/// Load the passphrase KDF parameters, creating them with a fresh salt on
/// first use.
fn root_params(path: &Path, config: &CoreConfig) -> Result<KdfParams> {
    if path.exists() {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        return serde_json::from_str(&json).context("parsing passphrase parameters");
    }

    let params = config.keys.kdf_params().with_fresh_salt()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&params)?)?;
    info!("Created passphrase parameters at {:?}", path);
    Ok(params)
}

fn read_passphrase() -> Result<String> {
    match std::env::var(PASSPHRASE_ENV) {
        Ok(passphrase) => Ok(passphrase),
        Err(_) => Ok(prompt_password("Passphrase: ")?),
    }
}

fn open_session(cli: &Cli) -> Result<Session> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(platform::get_default_config_path);
    let mut config = CoreConfig::load_or_default(&config_path)?;
    if let Some(store) = &cli.store {
        config.storage.path = store.clone();
    }

    let data_dir = config
        .storage
        .path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(platform::get_data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let key_store = Arc::new(SqliteKeyStore::open(data_dir.join("keys.db"))?);
    let mut manager = KeyManager::from_config(&config.keys, key_store);
    if let Some(dir) = &config.keys.audit_dir {
        manager = manager.with_audit(Arc::new(AuditLogger::new(dir.clone())?));
    }
    let keys = Arc::new(manager);

    if cli.no_passphrase {
        warn!("No passphrase given; persisted keys are stored unwrapped");
    } else {
        let params = root_params(&data_dir.join("root-kdf.json"), &config)?;
        let passphrase = zeroize::Zeroizing::new(read_passphrase()?);
        let root = derive_root_secret(passphrase.as_bytes(), &params)?;
        keys.unlock(root)?;
    }

    let encryption = Arc::new(EncryptionService::new(keys.clone(), config.keys.default_key_id.clone())?);
    let store = LocalStore::from_config(&config.storage, encryption)?;
    Ok(Session { keys, store })
}

fn run_keys(ctx: &Session, action: KeyCommands) -> Result<()> {
    match action {
        KeyCommands::List => {
            let persisted = ctx.keys.list_keys()?;
            let usage = ctx.store.key_usage()?;
            for key_id in &persisted {
                let records = usage
                    .iter()
                    .find(|u| &u.key_id == key_id)
                    .map(|u| u.record_count)
                    .unwrap_or(0);
                println!("{:<48} {:>6} record(s)", key_id, records);
            }
            for u in usage.iter().filter(|u| !persisted.contains(&u.key_id)) {
                println!("{:<48} {:>6} record(s) (ephemeral)", u.key_id, u.record_count);
            }
        }
        KeyCommands::Generate { id } => {
            let payload = ctx.keys.generate_key(&id)?;
            println!("Generated '{}' ({} payload)", id, payload.shape());
        }
        KeyCommands::Rotate { id } => {
            ctx.keys.rotate_key(&id)?;
            let stale = ctx.store.stale_records(&id)?;
            println!("Rotated '{}'", id);
            if !stale.is_empty() {
                println!(
                    "{} record(s) still use the archived key; run `hearthsync reencrypt {}`",
                    stale.len(),
                    id
                );
            }
        }
        KeyCommands::Delete { id } => {
            let stale = ctx.store.stale_records(&id)?;
            let in_use = ctx
                .store
                .key_usage()?
                .into_iter()
                .any(|u| u.key_id == id && u.record_count > 0);
            if in_use || !stale.is_empty() {
                warn!("Key '{}' still protects stored records", id);
            }
            ctx.keys.delete_key(&id)?;
            println!("Deleted '{}'", id);
        }
    }
    Ok(())
}

fn print_changes(ctx: &Session, filter: &ChangeFilter) -> Result<()> {
    let changes = ctx.store.list_changes(filter)?;
    if changes.is_empty() {
        println!("Queue is empty");
    }
    for c in changes {
        println!(
            "{:>5} {} {:<24} {:<7} {:<8} {:<10} retries={}{}",
            c.seq,
            c.change_id,
            c.record_id,
            c.op.as_str(),
            c.priority.as_str(),
            c.state.as_str(),
            c.retry_count,
            c.failure_reason
                .map(|r| format!(" ({})", r))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let ctx = open_session(&cli)?;

    match cli.command {
        Commands::Keys { action } => run_keys(&ctx, action)?,
        Commands::Put {
            entity,
            id,
            fields,
            priority,
        } => {
            let updates = parse_fields(&fields)?;
            match ctx
                .store
                .write_document(&entity, &id, updates, parse_priority(&priority)?)?
            {
                Some(change) => println!("Queued {} of '{}'", change.op.as_str(), id),
                None => println!("No changes to '{}'", id),
            }
        }
        Commands::Get { id } => {
            let doc = ctx
                .store
                .read_document(&id)?
                .filter(|doc| !doc.deleted)
                .ok_or_else(|| anyhow!("record '{}' not found", id))?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Commands::Delete { id, priority } => {
            ctx.store.delete_document(&id, parse_priority(&priority)?)?;
            println!("Queued deletion of '{}'", id);
        }
        Commands::Queue { state, record } => {
            let state = match state.as_deref() {
                None => None,
                Some(s @ ("queued" | "in_flight" | "conflicted" | "failed")) => {
                    Some(ChangeState::parse(s))
                }
                Some(other) => bail!("unknown state '{}'", other),
            };
            let filter = ChangeFilter {
                state,
                record_id: record,
                ..ChangeFilter::default()
            };
            print_changes(&ctx, &filter)?;
        }
        Commands::Conflicts => {
            let conflicts = ctx.store.list_conflicts()?;
            if conflicts.is_empty() {
                println!("No unresolved conflicts");
            }
            for conflict in conflicts {
                println!(
                    "{} {} ({}, remote v{})",
                    conflict.conflict_id,
                    conflict.record_id,
                    conflict.strategy.as_str(),
                    conflict.remote.version
                );
                for diff in conflict.diffs {
                    println!(
                        "    {}: local={} remote={}",
                        diff.field,
                        diff.local.unwrap_or(Value::Null),
                        diff.remote.unwrap_or(Value::Null)
                    );
                }
            }
        }
        Commands::Requeue { record } => {
            let count = ctx.store.requeue_failed(record.as_deref())?;
            println!("Requeued {} change(s)", count);
        }
        Commands::Reencrypt { key_id } => {
            let count = ctx.store.reencrypt_records(&key_id)?;
            println!("Re-encrypted {} record(s) under '{}'", count, key_id);
        }
        Commands::Export { key, output, ids } => {
            let selected = (!ids.is_empty()).then_some(ids);
            let bundle = seal_snapshot(&ctx.store, &key, selected.as_deref())?;
            std::fs::write(&output, bundle.to_json()?)
                .with_context(|| format!("writing {}", output.display()))?;
            println!(
                "Exported {} record(s) to {}",
                bundle.record_count,
                output.display()
            );
        }
        Commands::Status => {
            let stats = ctx.store.queue_stats(chrono::Utc::now().timestamp_millis())?;
            println!("Records:     {}", ctx.store.record_ids()?.len());
            println!("Stored:      {} bytes", ctx.store.stored_bytes()?);
            println!(
                "Queue:       {} queued ({} ready), {} in flight, {} conflicted, {} failed",
                stats.queued, stats.ready, stats.in_flight, stats.conflicted, stats.failed
            );
            println!("Conflicts:   {} unresolved", stats.unresolved_conflicts);
            println!("Keys:        {}", if ctx.keys.is_unlocked() { "unlocked" } else { "no wrapper" });
            for usage in ctx.store.key_usage()? {
                println!(
                    "  {:<40} {:>6} record(s){}",
                    usage.key_id,
                    usage.record_count,
                    if usage.persisted { "" } else { " (ephemeral)" }
                );
            }
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .with_writer(std::io::stderr)
        .init();

    run(Cli::parse())
}
