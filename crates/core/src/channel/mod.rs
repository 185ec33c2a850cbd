//! Channels: one authenticated transport per peer, carrying cells for many
//! circuits.
//!
//! The registry owns every channel record in a generational arena;
//! circuits refer to channels by handle and a stale handle simply fails to
//! resolve after teardown.

pub mod handshake;
pub mod padding;

pub use handshake::{HandshakeRole, HandshakeState, LinkContext, LinkHandshake, LinkInfo};
pub use padding::PaddingTimer;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::util::{Arena, Handle};

/// Handle naming a channel in the registry.
pub type ChannelHandle = Handle<Channel>;

/// Who opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDirection {
    Inbound,
    Outbound,
}

/// Liveness of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLiveness {
    /// Handshake complete, carrying traffic.
    Open,
    /// Orderly shutdown under way; no new circuits.
    Closing,
}

/// One authenticated peer connection.
#[derive(Debug)]
pub struct Channel {
    /// Verified identity digest of the peer, if it authenticated.
    pub peer_identity: Option<[u8; 32]>,
    pub peer_addr: SocketAddr,
    pub link_version: u16,
    pub direction: ChannelDirection,
    pub liveness: ChannelLiveness,
    /// Peer clock minus ours, learned from NETINFO.
    pub clock_skew_secs: i64,

    /// Circuits currently indexed on this channel; maintained by the
    /// circuit store.
    pub n_circuits: usize,

    /// Kernel bytes accepted but not yet acknowledged, refreshed by the
    /// runtime before each scheduler tick.
    pub unacked_bytes: usize,

    /// When the channel last moved a non-padding cell.
    pub last_activity: Instant,

    pub cells_in: u64,
    pub cells_out: u64,
    pub padding_in: u64,
    pub padding_out: u64,

    pub padding_timer: PaddingTimer,
}

impl Channel {
    pub fn new(
        info: &LinkInfo,
        peer_addr: SocketAddr,
        direction: ChannelDirection,
        now: Instant,
        padding_timer: PaddingTimer,
    ) -> Self {
        Self {
            peer_identity: info.peer_identity,
            peer_addr,
            link_version: info.link_version,
            direction,
            liveness: ChannelLiveness::Open,
            clock_skew_secs: info.clock_skew_secs,
            n_circuits: 0,
            unacked_bytes: 0,
            last_activity: now,
            cells_in: 0,
            cells_out: 0,
            padding_in: 0,
            padding_out: 0,
            padding_timer,
        }
    }

    pub fn is_open(&self) -> bool {
        self.liveness == ChannelLiveness::Open
    }

    /// Record an inbound cell for accounting and idle tracking.
    pub fn note_cell_in(&mut self, padding: bool, now: Instant) {
        self.cells_in += 1;
        if padding {
            self.padding_in += 1;
        } else {
            self.last_activity = now;
        }
    }

    /// Record an outbound cell.
    pub fn note_cell_out(&mut self, padding: bool, now: Instant) {
        self.cells_out += 1;
        if padding {
            self.padding_out += 1;
        } else {
            self.last_activity = now;
        }
    }

    /// True once the channel has sat without circuits or traffic past the
    /// grace period.
    pub fn is_idle_expired(&self, now: Instant, grace: Duration) -> bool {
        self.n_circuits == 0 && now.duration_since(self.last_activity) >= grace
    }

    /// High bit of circuit ids this side allocates on this channel: the
    /// initiator takes the high half of the space so both ends can pick
    /// ids without colliding.
    pub fn circ_id_high_bit(&self) -> bool {
        self.direction == ChannelDirection::Outbound
    }
}

/// Operator-facing snapshot of one channel.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChannelInfo {
    pub index: u32,
    pub peer_addr: String,
    pub peer_identity: Option<String>,
    pub link_version: u16,
    pub direction: &'static str,
    pub open: bool,
    pub n_circuits: usize,
    pub cells_in: u64,
    pub cells_out: u64,
    pub padding_out: u64,
}

/// All live channels.
pub struct ChannelRegistry {
    arena: Arena<Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn add(&mut self, channel: Channel) -> ChannelHandle {
        self.arena.insert(channel)
    }

    pub fn get(&self, handle: ChannelHandle) -> Option<&Channel> {
        self.arena.get(handle)
    }

    pub fn get_mut(&mut self, handle: ChannelHandle) -> Option<&mut Channel> {
        self.arena.get_mut(handle)
    }

    pub fn remove(&mut self, handle: ChannelHandle) -> Option<Channel> {
        self.arena.remove(handle)
    }

    pub fn handles(&self) -> Vec<ChannelHandle> {
        self.arena.handles()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelHandle, &Channel)> {
        self.arena.iter()
    }

    /// An open outbound channel to the given identity, if one exists.
    pub fn find_by_identity(&self, identity: &[u8; 32]) -> Option<ChannelHandle> {
        self.arena
            .iter()
            .find(|(_, ch)| ch.is_open() && ch.peer_identity.as_ref() == Some(identity))
            .map(|(h, _)| h)
    }

    /// Channels whose idle grace period has expired.
    pub fn idle_expired(&self, now: Instant, grace: Duration) -> Vec<ChannelHandle> {
        self.arena
            .iter()
            .filter(|(_, ch)| ch.is_idle_expired(now, grace))
            .map(|(h, _)| h)
            .collect()
    }

    /// Operator listing.
    pub fn list(&self) -> Vec<ChannelInfo> {
        self.arena
            .iter()
            .map(|(h, ch)| ChannelInfo {
                index: h.index(),
                peer_addr: ch.peer_addr.to_string(),
                peer_identity: ch.peer_identity.map(hex::encode),
                link_version: ch.link_version,
                direction: match ch.direction {
                    ChannelDirection::Inbound => "inbound",
                    ChannelDirection::Outbound => "outbound",
                },
                open: ch.is_open(),
                n_circuits: ch.n_circuits,
                cells_in: ch.cells_in,
                cells_out: ch.cells_out,
                padding_out: ch.padding_out,
            })
            .collect()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel(direction: ChannelDirection, now: Instant) -> Channel {
        let info = LinkInfo {
            link_version: 4,
            peer_identity: Some([7; 32]),
            clock_skew_secs: 0,
        };
        Channel::new(
            &info,
            "192.0.2.1:9001".parse().unwrap(),
            direction,
            now,
            PaddingTimer::disabled(now),
        )
    }

    #[test]
    fn test_registry_add_find_remove() {
        let now = Instant::now();
        let mut registry = ChannelRegistry::new();
        let handle = registry.add(test_channel(ChannelDirection::Outbound, now));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find_by_identity(&[7; 32]), Some(handle));
        assert_eq!(registry.find_by_identity(&[8; 32]), None);

        registry.remove(handle);
        assert!(registry.get(handle).is_none());
        assert_eq!(registry.find_by_identity(&[7; 32]), None);
    }

    #[test]
    fn test_idle_expiry_requires_no_circuits() {
        let now = Instant::now();
        let grace = Duration::from_secs(180);
        let mut channel = test_channel(ChannelDirection::Inbound, now);

        let later = now + grace;
        assert!(channel.is_idle_expired(later, grace));

        channel.n_circuits = 1;
        assert!(!channel.is_idle_expired(later, grace));

        channel.n_circuits = 0;
        channel.note_cell_in(false, later);
        assert!(!channel.is_idle_expired(later, grace));
        assert!(channel.is_idle_expired(later + grace, grace));
    }

    #[test]
    fn test_padding_does_not_reset_idle_clock() {
        let now = Instant::now();
        let grace = Duration::from_secs(180);
        let mut channel = test_channel(ChannelDirection::Inbound, now);

        channel.note_cell_in(true, now + Duration::from_secs(100));
        assert!(channel.is_idle_expired(now + grace, grace));
        assert_eq!(channel.padding_in, 1);
        assert_eq!(channel.cells_in, 1);
    }

    #[test]
    fn test_circ_id_high_bit_by_direction() {
        let now = Instant::now();
        assert!(test_channel(ChannelDirection::Outbound, now).circ_id_high_bit());
        assert!(!test_channel(ChannelDirection::Inbound, now).circ_id_high_bit());
    }
}
