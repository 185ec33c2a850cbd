use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cell framing constants
pub mod cell {
    /// Body of a fixed-width cell (everything after circuit id + command)
    pub const CELL_BODY_LEN: usize = 509;

    /// Fixed-width cell with a 4-byte circuit id (link version 4+)
    pub const FIXED_CELL_LEN_V4: usize = 4 + 1 + CELL_BODY_LEN;

    /// Fixed-width cell with a 2-byte circuit id (link version 3)
    pub const FIXED_CELL_LEN_V3: usize = 2 + 1 + CELL_BODY_LEN;

    /// Relay header: command(1) recognized(2) stream id(2) digest(4) length(2)
    pub const RELAY_HEADER_LEN: usize = 11;

    /// Maximum data bytes in one relay cell
    pub const MAX_RELAY_DATA_LEN: usize = CELL_BODY_LEN - RELAY_HEADER_LEN;

    /// Upper bound on the body of a variable-width cell
    pub const MAX_VAR_CELL_LEN: usize = u16::MAX as usize;
}

/// Link protocol constants
pub mod link {
    /// Lowest link protocol version we will negotiate
    pub const MIN_LINK_VERSION: u16 = 3;

    /// Link versions this implementation speaks, preferred last
    pub const SUPPORTED_LINK_VERSIONS: &[u16] = &[3, 4, 5];

    /// First link version that uses 4-byte circuit ids
    pub const WIDE_CIRC_ID_VERSION: u16 = 4;
}

/// Flow-control window constants
pub mod flow {
    /// Initial circuit-level package and deliver window, in cells
    pub const CIRC_WINDOW_INIT: u16 = 1000;

    /// Deliver-window level at which a circuit SENDME is emitted
    pub const CIRC_SENDME_THRESHOLD: u16 = 900;

    /// Cells restored by one circuit SENDME
    pub const CIRC_SENDME_INC: u16 = 100;

    /// Initial stream-level package and deliver window, in cells
    pub const STREAM_WINDOW_INIT: u16 = 500;

    /// Deliver-window level at which a stream SENDME is emitted
    pub const STREAM_SENDME_THRESHOLD: u16 = 450;

    /// Cells restored by one stream SENDME
    pub const STREAM_SENDME_INC: u16 = 50;
}

/// Circuit constants
pub mod circuit {
    /// Random draws before declaring a channel's circuit-id space saturated
    pub const ID_ALLOC_ATTEMPTS: usize = 64;

    /// Hops in a general-purpose client circuit
    pub const DEFAULT_CIRCUIT_LEN: usize = 3;

    /// A responding relay refuses EXTENDs beyond this hop count
    pub const MAX_CLIENT_HOPS: usize = 3;

    /// Cells a half-closed circuit id will still absorb after DESTROY
    pub const HALF_CLOSED_CELL_BUDGET: u32 = 3000;
}

/// Configuration knobs recognized by the relay core.
///
/// This is a read-only snapshot: the core never mutates it, and a restart is
/// required for changes to take effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Close a channel holding no circuits after this many seconds
    pub channel_idle_timeout_secs: u64,

    /// Seed circuit-build timeout before the estimator has learned, in ms
    pub circuit_build_timeout_initial_ms: u64,

    /// Reject further BEGINs on a circuit past this many streams
    pub max_streams_per_circuit: usize,

    /// Per-circuit cap on queued outbound cell bytes
    pub cell_queue_highwater_bytes: usize,

    /// Scheduler's per-channel kernel write-queue depth target
    pub kist_target_kernel_queue_bytes: usize,

    /// SENDME emission version; 1 = payload-digest authenticated
    pub sendme_emit_version: u8,

    /// Maximum RELAY_EARLY cells allowed per circuit
    pub relay_early_budget: u32,

    /// Close an unanswered BEGIN after this many seconds
    pub stream_attach_timeout_secs: u64,

    /// Ceiling on total queued cell memory across all circuits
    pub total_queue_ceiling_bytes: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            channel_idle_timeout_secs: 180,
            circuit_build_timeout_initial_ms: 60_000,
            max_streams_per_circuit: 50,
            cell_queue_highwater_bytes: 256 * 1024,
            kist_target_kernel_queue_bytes: 64 * 1024,
            sendme_emit_version: 1,
            relay_early_budget: 8,
            stream_attach_timeout_secs: 120,
            total_queue_ceiling_bytes: 8 * 1024 * 1024,
        }
    }
}

impl CoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relay_early_budget(mut self, budget: u32) -> Self {
        self.relay_early_budget = budget;
        self
    }

    pub fn with_max_streams_per_circuit(mut self, max: usize) -> Self {
        self.max_streams_per_circuit = max;
        self
    }

    pub fn with_queue_ceiling(mut self, bytes: usize) -> Self {
        self.total_queue_ceiling_bytes = bytes;
        self
    }

    pub fn with_kist_target(mut self, bytes: usize) -> Self {
        self.kist_target_kernel_queue_bytes = bytes;
        self
    }

    pub fn channel_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_idle_timeout_secs)
    }

    pub fn circuit_build_timeout_initial(&self) -> Duration {
        Duration::from_millis(self.circuit_build_timeout_initial_ms)
    }

    pub fn stream_attach_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_attach_timeout_secs)
    }
}

/// Node configuration: listener settings plus the core snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Listen address
    pub listen_addr: String,

    /// Listen port
    pub listen_port: u16,

    /// Data directory (persisted estimator state, identity keys)
    pub data_dir: String,

    /// Enable verbose logging
    pub verbose: bool,

    /// Relay-core knobs
    pub core: CoreConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 9050,
            data_dir: "./data".to_string(),
            verbose: false,
            core: CoreConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_data_dir(mut self, dir: String) -> Self {
        self.data_dir = dir;
        self
    }

    /// Read the node configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Invalid {
            path: path.to_owned(),
            detail: e.to_string(),
        })
    }

    /// Write the node configuration back out as TOML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid {
            path: path.to_owned(),
            detail: e.to_string(),
        })?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })
    }
}

/// Why a configuration file could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {}: {detail}", path.display())]
    Invalid { path: PathBuf, detail: String },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            Self::Io { path, .. } | Self::Invalid { path, .. } => path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoreConfig::default();
        assert_eq!(config.relay_early_budget, 8);
        assert_eq!(config.max_streams_per_circuit, 50);
        assert_eq!(config.sendme_emit_version, 1);
        assert_eq!(config.channel_idle_timeout(), Duration::from_secs(180));
    }

    #[test]
    fn test_config_builder() {
        let config = CoreConfig::new()
            .with_relay_early_budget(4)
            .with_max_streams_per_circuit(10);

        assert_eq!(config.relay_early_budget, 4);
        assert_eq!(config.max_streams_per_circuit, 10);
    }

    #[test]
    fn test_window_constants_consistent() {
        assert_eq!(
            flow::CIRC_WINDOW_INIT - flow::CIRC_SENDME_INC,
            flow::CIRC_SENDME_THRESHOLD
        );
        assert_eq!(
            flow::STREAM_WINDOW_INIT - flow::STREAM_SENDME_INC,
            flow::STREAM_SENDME_THRESHOLD
        );
    }

    #[test]
    fn test_node_config_toml_roundtrip() {
        let config = NodeConfig::new().with_port(9051);
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.listen_port, 9051);
        assert_eq!(parsed.core.relay_early_budget, 8);
    }
}
