//! walvault - backup integrity and point-in-time recovery
//!
//! Operational entry point. Wires the engines over directory-backed
//! object stores under the data directory, with metadata and the audit
//! chain persisted as JSON between invocations. Restores run against the
//! simulated database source; production deployments swap in a live
//! [`DatabaseSource`] implementation instead.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use walvault::audit::AuditLog;
use walvault::backup::{BackupEngine, BackupTargets, DrillEngine, RetentionEngine, WalArchiver};
use walvault::config::{BackupTier, VaultConfig};
use walvault::crypto::{ArtifactCipher, ChaChaCipher};
use walvault::db::{DatabaseSource, SimulatedDatabase};
use walvault::error::{Result, VaultError};
use walvault::metadata::{DrillType, MemoryMetadataStore, MetadataSnapshot, MetadataStore};
use walvault::storage::{BackendDescriptor, LocalObjectStore, ObjectStore};

/// walvault - backup integrity and point-in-time recovery
#[derive(Parser, Debug)]
#[command(name = "walvault")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory for local backends, metadata, and the audit chain
    #[arg(
        long = "data-dir",
        value_name = "PATH",
        env = "WALVAULT_DATA_DIR",
        global = true
    )]
    data_dir: Option<PathBuf>,

    /// Recovery tier: critical, high, standard, low
    #[arg(long = "tier", value_name = "TIER", env = "WALVAULT_TIER", global = true)]
    tier: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[arg(
        short = 'l',
        long = "log-level",
        value_name = "LEVEL",
        env = "WALVAULT_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a base backup and distribute it per the 3-2-1 policy
    Backup {
        /// Gzip level for the artifact (0-9)
        #[arg(long = "compression-level", value_name = "LEVEL")]
        compression_level: Option<u32>,
    },

    /// Archive one or more WAL segments
    ArchiveWal {
        /// Segment filenames, e.g. 000000010000000000000001
        #[arg(required = true, value_name = "SEGMENT")]
        segments: Vec<String>,
    },

    /// Run a restore drill against a target point in time
    Drill {
        /// Target point in time (RFC 3339); defaults to one hour ago
        #[arg(long = "target", value_name = "TIMESTAMP")]
        target: Option<String>,

        /// What kind of drill this is
        #[arg(long = "drill-type", value_enum, default_value = "scheduled")]
        drill_type: DrillTypeArg,
    },

    /// Remove backups and WAL archives past their retention window
    Cleanup,

    /// Rotate the active encryption key
    RotateKey,

    /// Verify the audit chain end to end
    Verify,

    /// Print backup, compliance, and drill status as JSON
    Status,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DrillTypeArg {
    Scheduled,
    Gameday,
    Incident,
}

impl From<DrillTypeArg> for DrillType {
    fn from(arg: DrillTypeArg) -> Self {
        match arg {
            DrillTypeArg::Scheduled => DrillType::Scheduled,
            DrillTypeArg::Gameday => DrillType::Gameday,
            DrillTypeArg::Incident => DrillType::Incident,
        }
    }
}

/// Everything a command needs, wired once per invocation
struct Vault {
    config: VaultConfig,
    meta: Arc<MemoryMetadataStore>,
    audit: Arc<AuditLog>,
    cipher: Arc<dyn ArtifactCipher>,
    db: Arc<dyn DatabaseSource>,
    primary: Arc<dyn ObjectStore>,
    archive: Arc<dyn ObjectStore>,
    cold: Arc<dyn ObjectStore>,
}

impl Vault {
    fn open(config: VaultConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let meta = Arc::new(load_metadata(&config.data_dir)?);
        let audit = Arc::new(load_audit(&config.data_dir)?);

        let primary: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(
            BackendDescriptor::primary("local"),
            config.data_dir.clone(),
        ));
        let archive: Arc<dyn ObjectStore> = Arc::new(
            LocalObjectStore::new(
                BackendDescriptor::archive("local-replica"),
                config.data_dir.clone(),
            )
            .with_compression(true),
        );
        let cold: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(
            BackendDescriptor::cold("local-vault"),
            config.data_dir.clone(),
        ));

        let db: Arc<dyn DatabaseSource> = Arc::new(SimulatedDatabase::new(format!(
            "simulated cluster snapshot ({})",
            config.db_dsn
        )));

        Ok(Self {
            config,
            meta,
            audit,
            cipher: Arc::new(ChaChaCipher::new()),
            db,
            primary,
            archive,
            cold,
        })
    }

    fn backup_engine(&self) -> BackupEngine {
        BackupEngine::new(
            self.config.clone(),
            self.db.clone(),
            self.cipher.clone(),
            BackupTargets {
                primary: self.primary.clone(),
                archive: self.archive.clone(),
                cold: self.cold.clone(),
            },
            self.meta.clone(),
            self.audit.clone(),
        )
    }

    fn wal_archiver(&self) -> WalArchiver {
        WalArchiver::new(
            self.db.clone(),
            self.cipher.clone(),
            self.primary.clone(),
            self.archive.clone(),
            self.meta.clone(),
            self.audit.clone(),
            self.config.wal_immutable_days,
        )
    }

    fn drill_engine(&self) -> DrillEngine {
        DrillEngine::new(
            self.db.clone(),
            self.cipher.clone(),
            self.backends(),
            self.meta.clone(),
            self.audit.clone(),
            self.config.tier,
        )
    }

    fn retention_engine(&self) -> RetentionEngine {
        RetentionEngine::new(
            self.config.clone(),
            self.backends(),
            self.meta.clone(),
            self.audit.clone(),
        )
    }

    fn backends(&self) -> Vec<Arc<dyn ObjectStore>> {
        vec![self.primary.clone(), self.archive.clone(), self.cold.clone()]
    }

    /// Persist metadata and the audit chain for the next invocation
    fn close(&self) -> Result<()> {
        let snapshot = serde_json::to_string_pretty(&self.meta.snapshot())
            .map_err(|e| VaultError::Config(format!("metadata serialization failed: {}", e)))?;
        std::fs::write(metadata_path(&self.config.data_dir), snapshot)?;

        let chain = self.audit.export_jsonl()?;
        std::fs::write(audit_path(&self.config.data_dir), chain)?;
        Ok(())
    }
}

fn metadata_path(data_dir: &Path) -> PathBuf {
    data_dir.join("metadata.json")
}

fn audit_path(data_dir: &Path) -> PathBuf {
    data_dir.join("audit.jsonl")
}

fn load_metadata(data_dir: &Path) -> Result<MemoryMetadataStore> {
    let path = metadata_path(data_dir);
    if !path.exists() {
        return Ok(MemoryMetadataStore::new());
    }
    let data = std::fs::read_to_string(&path)?;
    let snapshot: MetadataSnapshot = serde_json::from_str(&data)
        .map_err(|e| VaultError::Config(format!("corrupt metadata store at {:?}: {}", path, e)))?;
    Ok(MemoryMetadataStore::from_snapshot(snapshot))
}

fn load_audit(data_dir: &Path) -> Result<AuditLog> {
    let path = audit_path(data_dir);
    if !path.exists() {
        return Ok(AuditLog::new());
    }
    let data = std::fs::read_to_string(&path)?;
    Ok(AuditLog::from_jsonl(&data)?)
}

fn build_config(cli: &Cli) -> Result<VaultConfig> {
    let mut config = VaultConfig::from_env()?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(tier) = &cli.tier {
        config.tier = BackupTier::from_str_loose(tier)
            .ok_or_else(|| VaultError::Config(format!("unknown tier '{}'", tier)))?;
    }
    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    let config = build_config(&cli)?;
    let vault = Vault::open(config)?;

    // Failed commands still append to the in-memory chain; the chain and
    // metadata must land on disk either way
    let result = dispatch(&vault, cli.command).await;
    let closed = vault.close();
    result.and(closed)
}

async fn dispatch(vault: &Vault, command: Commands) -> Result<()> {
    match command {
        Commands::Backup { compression_level } => {
            let backup_id = vault
                .backup_engine()
                .create_base_backup(compression_level)
                .await?;
            let compliance = vault.meta.compliance(&backup_id);
            println!(
                "{}",
                serde_json::json!({
                    "backup_id": backup_id,
                    "compliance": compliance,
                })
            );
        }
        Commands::ArchiveWal { segments } => {
            let archiver = vault.wal_archiver();
            let mut failed = 0usize;
            for segment in &segments {
                if !archiver.archive_wal_segment(segment).await {
                    failed += 1;
                }
            }
            if failed > 0 {
                return Err(VaultError::BackupCreation(format!(
                    "{} of {} WAL segments failed to archive",
                    failed,
                    segments.len()
                )));
            }
            info!("Archived {} WAL segments", segments.len());
        }
        Commands::Drill { target, drill_type } => {
            let target = target
                .map(|t| {
                    DateTime::parse_from_rfc3339(&t)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|e| VaultError::Config(format!("invalid --target: {}", e)))
                })
                .transpose()?;
            let record = vault
                .drill_engine()
                .perform_restore_drill(target, drill_type.into())
                .await;
            println!(
                "{}",
                serde_json::to_string_pretty(&record)
                    .map_err(|e| VaultError::Config(e.to_string()))?
            );
            if !record.success {
                return Err(VaultError::Integrity(format!(
                    "drill {} failed: {}",
                    record.drill_id,
                    record.issues.join("; ")
                )));
            }
        }
        Commands::Cleanup => {
            let removed = vault.retention_engine().cleanup_expired_backups().await;
            println!("{}", serde_json::json!({ "backups_removed": removed }));
        }
        Commands::RotateKey => {
            let key_id = vault.backup_engine().rotate_encryption_key();
            println!("{}", serde_json::json!({ "active_key_id": key_id }));
        }
        Commands::Verify => {
            let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_else(Utc::now);
            let report = vault.audit.verify_chain(epoch, Utc::now());
            println!(
                "{}",
                serde_json::to_string_pretty(&report)
                    .map_err(|e| VaultError::Config(e.to_string()))?
            );
            if !report.chain_intact {
                return Err(VaultError::Integrity(format!(
                    "audit chain broken at {} points",
                    report.broken_links.len()
                )));
            }
        }
        Commands::Status => {
            let backups = vault.meta.list_backups();
            let status = serde_json::json!({
                "tier": vault.config.tier,
                "retention_days": vault.config.retention_days(),
                "backups": backups.len(),
                "restore_tested": backups.iter().filter(|b| b.restore_tested).count(),
                "compliant": backups
                    .iter()
                    .filter(|b| {
                        vault
                            .meta
                            .compliance(&b.backup_id)
                            .map(|c| c.compliant)
                            .unwrap_or(false)
                    })
                    .count(),
                "wal_segments": vault.meta.list_wal_segments().len(),
                "drills": vault.meta.list_drills().len(),
                "audit_events": vault.audit.count(),
                "audit_head": vault.audit.head_hash(),
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&status)
                    .map_err(|e| VaultError::Config(e.to_string()))?
            );
        }
    }

    Ok(())
}


#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("walvault: {}", e);
            ExitCode::FAILURE
        }
    }
}
