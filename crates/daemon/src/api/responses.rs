/// API Response types
use serde::{Deserialize, Serialize};

/// One peer channel as reported by the relay core
#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub index: u32,
    pub peer_addr: String,
    pub peer_identity: Option<String>,
    pub link_version: u16,
    pub direction: String,
    pub open: bool,
    pub n_circuits: usize,
    pub cells_in: u64,
    pub cells_out: u64,
    pub padding_out: u64,
}

/// Channel listing response
#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelsResponse {
    pub channels: Vec<ChannelEntry>,
    pub total: usize,
}

/// One circuit as reported by the relay core
#[derive(Debug, Serialize, Deserialize)]
pub struct CircuitEntry {
    pub kind: String,
    pub global_id: Option<u64>,
    pub state: String,
    pub n_hops: Option<usize>,
    pub n_streams: usize,
    pub queued_bytes: usize,
}

/// Circuit listing response
#[derive(Debug, Serialize, Deserialize)]
pub struct CircuitsResponse {
    pub circuits: Vec<CircuitEntry>,
    pub total: usize,
}

/// Node status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Identity digest of this relay
    pub identity: String,
    pub channels: usize,
    pub circuits: usize,
    /// Invariant violations survived since start
    pub bug_count: u64,
}

/// Result of a circuit-close request
#[derive(Debug, Serialize, Deserialize)]
pub struct CloseCircuitResponse {
    pub closed: bool,
}

/// Body returned alongside any non-2xx status
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}
