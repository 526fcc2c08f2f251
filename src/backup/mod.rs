//! Backup subsystem
//!
//! The engines that do the actual work: base-backup creation and
//! distribution, incremental WAL archiving, 3-2-1 compliance evaluation,
//! restore drills, and retention enforcement. Each engine takes its
//! collaborators (database, cipher, object stores, metadata, audit log)
//! by injection, so production backends and simulated ones wire up the
//! same way.

pub mod compliance;
pub mod drill;
pub mod engine;
pub mod retention;
pub mod wal;

pub use compliance::{MIN_COPIES, MIN_MEDIA_TYPES, MIN_OFFLINE_COPIES};
pub use drill::DrillEngine;
pub use engine::{BackupEngine, BackupTargets};
pub use retention::RetentionEngine;
pub use wal::WalArchiver;
