//! Backup catalog engine of the physical backup tool.
//!
//! The catalog is an on-disk hierarchy recording, per managed database
//! instance, the completed and in-progress backups and the archived WAL
//! that makes them recoverable:
//!
//! ```text
//! {root}/backups/{instance}/{backup id}/backup.control
//! {root}/backups/{instance}/{backup id}/backup_content.control
//! {root}/backups/{instance}/{backup id}/database/...
//! {root}/wal/{instance}/{segment files, .history files}
//! ```
//!
//! This crate owns the data model and its serialization, enumeration of
//! the hierarchy, analysis of incremental backup chains, reconstruction of
//! the timeline forest from the WAL archive, and the `wal_depth` retention
//! planner that decides which archived segments must be kept. Taking
//! backups, fetching WAL and purging files are the callers' business.
//!
//! Mutual exclusion between catalog users on one host goes through
//! per-backup lock files, see [`lock`].

pub mod backup;
pub mod chain;
pub mod config;
pub mod control_file;
pub mod filelist;
pub mod history;
pub mod id;
pub mod list;
pub mod lock;
pub mod paths;
pub mod retention;
pub mod timelines;

pub use backup::{BackupMode, BackupRecord, BackupStatus};
pub use config::InstanceConfig;
pub use id::BackupId;
pub use list::{list_backups, list_instances, BackupList};
pub use paths::BackupCatalog;
pub use timelines::{collect_timelines, TimelineForest};
