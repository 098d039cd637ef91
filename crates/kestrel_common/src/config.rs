use serde::{Deserialize, Serialize};

/// Top-level instance configuration, loaded from `kestrel.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KestrelConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub wal: WalConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Spaces created at startup, before recovery replays the log.
    #[serde(default, rename = "space")]
    pub spaces: Vec<SpaceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Binary protocol listen address.
    pub listen_addr: String,
    /// Data directory holding log and snapshot segments.
    pub data_dir: String,
    /// Replica id of this instance (component of every written row).
    pub replica_id: u32,
    /// Reject all DML when set.
    #[serde(default)]
    pub read_only: bool,
    /// Max concurrent connections (0 = unlimited).
    #[serde(default)]
    pub max_connections: usize,
    /// Instance identity stamped into segment headers and the greeting.
    #[serde(default = "default_instance_uuid")]
    pub instance_uuid: String,
}

fn default_instance_uuid() -> String {
    "kestrel-0001".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3301".into(),
            data_dir: "./data".into(),
            replica_id: 1,
            read_only: false,
            max_connections: 0,
            instance_uuid: default_instance_uuid(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Rotate to a new log segment after this many rows.
    pub max_rows_per_segment: u64,
    /// Payloads at/above this size are compressed (bytes).
    pub compress_threshold: usize,
    /// Flush buffered rows mid-transaction once the buffer exceeds this.
    pub autocommit_flush_bytes: usize,
    /// fsync after this many newly written bytes.
    pub sync_interval_bytes: u64,
    /// Keep reading past checksum mismatches and bad magics.
    #[serde(default)]
    pub force_recovery: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_rows_per_segment: 500_000,
            compress_threshold: 2 * 1024,
            autocommit_flush_bytes: 128 * 1024,
            sync_interval_bytes: 512 * 1024,
            force_recovery: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// How many checkpoints to retain before garbage collection.
    pub checkpoint_count: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            checkpoint_count: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// In-flight decoded-message budget per live connection; the global
    /// cap is this value times the connection count.
    pub msg_budget_per_conn: usize,
    /// Depth of the bounded queue between the net and tx contexts.
    pub queue_depth: usize,
    /// Max requests the tx context drains per scheduling slice before
    /// flushing the response batch.
    pub timeslice_requests: usize,
    /// Initial read buffer capacity per connection.
    pub readahead: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            msg_budget_per_conn: 8,
            queue_depth: 1024,
            timeslice_requests: 64,
            readahead: 16 * 1024,
        }
    }
}

/// A space declared in the config file. Index 0 must be present and
/// unique; it is the primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceConfig {
    pub id: u32,
    pub name: String,
    #[serde(default, rename = "index")]
    pub indexes: Vec<IndexConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub id: u32,
    pub name: String,
    #[serde(default = "default_unique")]
    pub unique: bool,
    #[serde(rename = "part")]
    pub parts: Vec<PartConfig>,
}

fn default_unique() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartConfig {
    /// Zero-based tuple field.
    pub field: u32,
    /// One of: unsigned, integer, double, string, boolean.
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub nullable: bool,
}
