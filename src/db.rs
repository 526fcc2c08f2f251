//! Database collaborator
//!
//! The engines never speak SQL themselves; they depend on the
//! [`DatabaseSource`] trait for WAL positions, base-snapshot bytes, WAL
//! segment bytes, and point-in-time restoration. [`SimulatedDatabase`]
//! backs drills in lower environments and tests, with injectable
//! replication lag and failures.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{Result, VaultError};

/// Live database interface
#[async_trait]
pub trait DatabaseSource: Send + Sync {
    /// Current WAL position, e.g. "0/1A2B3C4D"
    async fn current_wal_lsn(&self) -> Result<String>;

    /// Take a base snapshot, returning the raw artifact bytes
    async fn base_snapshot(&self) -> Result<Bytes>;

    /// Raw bytes of one WAL segment
    async fn read_wal_segment(&self, segment_name: &str) -> Result<Bytes>;

    /// Restore from the given artifact up to `target`, returning the point
    /// in time actually reached
    async fn restore_to(&self, target: DateTime<Utc>, artifact: &[u8]) -> Result<DateTime<Utc>>;
}

/// Simulated database for drills and tests
pub struct SimulatedDatabase {
    state: RwLock<SimState>,
}

struct SimState {
    /// Monotonic WAL byte position
    lsn: u64,
    /// Payload returned by `base_snapshot`
    payload: Bytes,
    /// How far behind the target a restore lands
    replication_lag: Duration,
    /// Registered WAL segment contents
    segments: HashMap<String, Bytes>,
    /// Artificial snapshot duration
    snapshot_delay: Duration,
    fail_snapshot: bool,
    fail_restore: bool,
}

impl SimulatedDatabase {
    /// Create a simulated database serving the given snapshot payload
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            state: RwLock::new(SimState {
                lsn: 0x0100_0000,
                payload: payload.into(),
                replication_lag: Duration::from_secs(0),
                segments: HashMap::new(),
                snapshot_delay: Duration::from_secs(0),
                fail_snapshot: false,
                fail_restore: false,
            }),
        }
    }

    /// Set how far behind the requested target a restore lands
    pub fn set_replication_lag(&self, lag: Duration) {
        self.state.write().replication_lag = lag;
    }

    /// Register WAL segment contents
    pub fn add_wal_segment(&self, name: impl Into<String>, data: impl Into<Bytes>) {
        self.state.write().segments.insert(name.into(), data.into());
    }

    /// Make snapshots take this long (for exercising concurrent callers)
    pub fn set_snapshot_delay(&self, delay: Duration) {
        self.state.write().snapshot_delay = delay;
    }

    /// Make the next snapshots fail
    pub fn fail_snapshots(&self, fail: bool) {
        self.state.write().fail_snapshot = fail;
    }

    /// Make the next restores fail
    pub fn fail_restores(&self, fail: bool) {
        self.state.write().fail_restore = fail;
    }
}

#[async_trait]
impl DatabaseSource for SimulatedDatabase {
    async fn current_wal_lsn(&self) -> Result<String> {
        let state = self.state.read();
        Ok(format!("0/{:X}", state.lsn))
    }

    async fn base_snapshot(&self) -> Result<Bytes> {
        let delay = self.state.read().snapshot_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write();
        if state.fail_snapshot {
            return Err(VaultError::BackupCreation(
                "simulated snapshot failure".to_string(),
            ));
        }
        // A snapshot advances the WAL position, as writes would
        state.lsn += 0x100;
        Ok(state.payload.clone())
    }

    async fn read_wal_segment(&self, segment_name: &str) -> Result<Bytes> {
        let state = self.state.read();
        if let Some(data) = state.segments.get(segment_name) {
            return Ok(data.clone());
        }
        // Unregistered segments get deterministic filler so archiving can
        // be exercised without pre-seeding every name
        Ok(Bytes::from(format!("wal-segment:{}", segment_name)))
    }

    async fn restore_to(&self, target: DateTime<Utc>, artifact: &[u8]) -> Result<DateTime<Utc>> {
        let state = self.state.read();
        if state.fail_restore {
            return Err(VaultError::Database(
                "simulated restore failure".to_string(),
            ));
        }
        if artifact.is_empty() {
            return Err(VaultError::Database("empty restore artifact".to_string()));
        }
        let lag = chrono::Duration::from_std(state.replication_lag)
            .unwrap_or_else(|_| chrono::Duration::seconds(0));
        Ok(target - lag)
    }
}
