//! Per-instance settings the catalog engine needs.

use anyhow::Context;
use camino::Utf8Path;
use serde::Deserialize;

pub const INSTANCE_CONFIG_FILE: &str = "instance.toml";

/// 16 MiB, the stock WAL segment size.
pub const DEFAULT_XLOG_SEG_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub name: String,
    /// WAL segment size in bytes.
    pub xlog_seg_size: u64,
    /// How many recent valid backups per timeline must stay usable for
    /// PITR. `0` disables WAL retention planning.
    pub wal_depth: i32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct OnDiskConfig {
    xlog_seg_size: u64,
    wal_depth: i32,
}

impl Default for OnDiskConfig {
    fn default() -> Self {
        OnDiskConfig {
            xlog_seg_size: DEFAULT_XLOG_SEG_SIZE,
            wal_depth: 0,
        }
    }
}

impl InstanceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let on_disk = OnDiskConfig::default();
        InstanceConfig {
            name: name.into(),
            xlog_seg_size: on_disk.xlog_seg_size,
            wal_depth: on_disk.wal_depth,
        }
    }

    /// Load the instance settings from `instance.toml` in the instance's
    /// backups directory. An absent file yields the defaults, so catalogs
    /// populated by other tooling still enumerate; a malformed file is an
    /// error.
    pub fn load(instance_backups_dir: &Utf8Path, name: &str) -> anyhow::Result<InstanceConfig> {
        let path = instance_backups_dir.join(INSTANCE_CONFIG_FILE);

        let on_disk = match std::fs::read_to_string(&path) {
            Ok(text) => toml_edit::de::from_str::<OnDiskConfig>(&text)
                .with_context(|| format!("Failed to parse instance config \"{path}\""))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => OnDiskConfig::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read instance config \"{path}\""))
            }
        };

        Ok(InstanceConfig {
            name: name.to_string(),
            xlog_seg_size: on_disk.xlog_seg_size,
            wal_depth: on_disk.wal_depth,
        })
    }
}
