//! Configuration for walvault
//!
//! Configuration is read once at startup (environment or explicit
//! construction) and treated as immutable for the process lifetime.
//! Recovery tiers are a closed enum: each tier carries its own policy
//! struct, resolved by exhaustive matching so adding a tier is a
//! compile-time-checked change.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

/// Recovery tier, ordered from strictest to most relaxed targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupTier {
    /// Production-critical: seconds of data loss at most
    Critical,
    /// High-value: minutes of data loss at most
    High,
    /// Standard workloads
    Standard,
    /// Low-priority or archival workloads
    Low,
}

impl Default for BackupTier {
    fn default() -> Self {
        Self::Standard
    }
}

/// Recovery and retention targets for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Maximum acceptable data loss
    pub rpo_target: Duration,
    /// Maximum acceptable restore time
    pub rto_target: Duration,
    /// How long backups are retained
    pub retention_days: u32,
    /// Object-lock window applied to the immutable copy
    pub immutable_days: u32,
}

impl BackupTier {
    /// Policy for this tier.
    pub fn policy(&self) -> TierPolicy {
        match self {
            Self::Critical => TierPolicy {
                rpo_target: Duration::from_secs(60),
                rto_target: Duration::from_secs(300),
                retention_days: 90,
                immutable_days: 30,
            },
            Self::High => TierPolicy {
                rpo_target: Duration::from_secs(300),
                rto_target: Duration::from_secs(900),
                retention_days: 60,
                immutable_days: 21,
            },
            Self::Standard => TierPolicy {
                rpo_target: Duration::from_secs(900),
                rto_target: Duration::from_secs(1800),
                retention_days: 30,
                immutable_days: 14,
            },
            Self::Low => TierPolicy {
                rpo_target: Duration::from_secs(3600),
                rto_target: Duration::from_secs(7200),
                retention_days: 14,
                immutable_days: 7,
            },
        }
    }

    /// Parse from string (case-insensitive).
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "standard" => Some(Self::Standard),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Database connection string
    pub db_dsn: String,
    /// Base directory for local storage backends and state
    pub data_dir: PathBuf,
    /// Recovery tier governing RPO/RTO targets and retention
    pub tier: BackupTier,
    /// Retention window override in days (tier default when absent)
    pub retention_days: Option<u32>,
    /// Ransomware-protection window on archived WAL segments, in days
    pub wal_immutable_days: u32,
    /// Gzip level used for base-backup artifacts (0-9)
    pub compression_level: u32,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            db_dsn: String::new(),
            data_dir: PathBuf::from("./walvault-data"),
            tier: BackupTier::Standard,
            retention_days: None,
            wal_immutable_days: 7,
            compression_level: 6,
        }
    }
}

impl VaultConfig {
    /// Load configuration from the environment.
    ///
    /// `DB_DSN` is required; everything else falls back to defaults.
    /// Fails fast on malformed values rather than guessing.
    pub fn from_env() -> Result<Self> {
        let db_dsn = std::env::var("DB_DSN")
            .map_err(|_| VaultError::Config("DB_DSN is not set".to_string()))?;

        let data_dir = std::env::var("WALVAULT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./walvault-data"));

        let tier = match std::env::var("WALVAULT_TIER") {
            Ok(v) => BackupTier::from_str_loose(&v)
                .ok_or_else(|| VaultError::Config(format!("unknown tier '{}'", v)))?,
            Err(_) => BackupTier::Standard,
        };

        let retention_days = match std::env::var("WALVAULT_RETENTION_DAYS") {
            Ok(v) => Some(v.parse::<u32>().map_err(|_| {
                VaultError::Config(format!("WALVAULT_RETENTION_DAYS is not a number: '{}'", v))
            })?),
            Err(_) => None,
        };

        Ok(Self {
            db_dsn,
            data_dir,
            tier,
            retention_days,
            ..Default::default()
        })
    }

    /// Effective retention window, honoring the per-config override.
    pub fn retention_days(&self) -> u32 {
        self.retention_days
            .unwrap_or_else(|| self.tier.policy().retention_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_policies_are_ordered() {
        let critical = BackupTier::Critical.policy();
        let high = BackupTier::High.policy();
        let standard = BackupTier::Standard.policy();
        let low = BackupTier::Low.policy();

        assert!(critical.rpo_target < high.rpo_target);
        assert!(high.rpo_target < standard.rpo_target);
        assert!(standard.rpo_target < low.rpo_target);

        assert!(critical.rto_target < high.rto_target);
        assert!(high.rto_target < standard.rto_target);
        assert!(standard.rto_target < low.rto_target);
    }

    #[test]
    fn test_tier_targets() {
        let p = BackupTier::Critical.policy();
        assert_eq!(p.rpo_target, Duration::from_secs(60));
        assert_eq!(p.rto_target, Duration::from_secs(300));

        let p = BackupTier::Low.policy();
        assert_eq!(p.rpo_target, Duration::from_secs(3600));
        assert_eq!(p.rto_target, Duration::from_secs(7200));
    }

    #[test]
    fn test_tier_from_str() {
        assert_eq!(
            BackupTier::from_str_loose("CRITICAL"),
            Some(BackupTier::Critical)
        );
        assert_eq!(BackupTier::from_str_loose("high"), Some(BackupTier::High));
        assert_eq!(BackupTier::from_str_loose("bogus"), None);
    }

    #[test]
    fn test_retention_override() {
        let mut config = VaultConfig::default();
        assert_eq!(config.retention_days(), 30);

        config.retention_days = Some(7);
        assert_eq!(config.retention_days(), 7);
    }
}
