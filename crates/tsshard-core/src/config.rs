//! Shard-level configuration for the metadata core.
//!
//! The hosting repository loads and validates its configuration elsewhere;
//! this module only defines the fields the metadata core consumes. Serde
//! defaults keep older configuration files readable when new fields are
//! added.

use serde::{Deserialize, Serialize};

/// Default capacity of the dense table-slot array.
const DEFAULT_MAX_TABLES: usize = 4096;

/// Configuration consumed by a shard's metadata core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Numeric id of the shard, used in log lines and passed back to the
    /// host's configuration callback.
    #[serde(default)]
    pub shard_id: u32,

    /// Size of the table-slot array. Valid tids are `[1, max_tables)`;
    /// slot 0 is reserved.
    #[serde(default = "default_max_tables")]
    pub max_tables: usize,
}

fn default_max_tables() -> usize {
    DEFAULT_MAX_TABLES
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            shard_id: 0,
            max_tables: DEFAULT_MAX_TABLES,
        }
    }
}
