//! Circuits: the unit of anonymity.
//!
//! A circuit is either *origin* (we built it and hold every hop's keys) or
//! *forwarding* (we are one relay on it and hold a single layer). Both
//! kinds sit between channels; the store in [`store`] owns the indices
//! that map `(channel, circuit id)` to live circuits.

pub mod store;

pub use store::{CircuitStore, ClosedCircuit};

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use crate::cell::{Cell, CircId};
use crate::channel::ChannelHandle;
use crate::crypto::handshake::{ClientHandshake, FastClientHandshake};
use crate::crypto::{InboundClientCrypt, OutboundClientCrypt, RelayLayerCrypt};
use crate::provider::HopSpec;
use crate::relay::flow::CircWindows;
use crate::relay::stream::StreamMap;
use crate::util::Handle;
use veil_common::cell::CELL_BODY_LEN;

/// Key of a circuit in the store's arena.
pub type CircuitKey = Handle<Circuit>;

/// Process-wide id for origin circuits, used by the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalCircId(pub u64);

impl std::fmt::Display for GlobalCircId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Circuit({})", self.0)
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Being built or extended.
    Building,
    /// Ready to carry streams; hops are frozen.
    Open,
    /// Teardown under way.
    Closing,
}

/// Why a circuit exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitPurpose {
    /// General anonymous traffic.
    General,
    /// Directory fetches.
    Directory,
    /// Testing and measurement.
    Testing,
}

/// One end of a circuit: a channel plus the id the circuit uses on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelSide {
    pub chan: ChannelHandle,
    pub circ_id: CircId,
}

/// A cell waiting for the scheduler.
#[derive(Debug)]
pub struct QueuedCell {
    pub cell: Cell,
    pub queued_at: Instant,
    pub bytes: usize,
}

impl QueuedCell {
    pub fn new(cell: Cell, now: Instant) -> Self {
        // Close enough for memory accounting: fixed body plus framing.
        let bytes = CELL_BODY_LEN + 5;
        Self {
            cell,
            queued_at: now,
            bytes,
        }
    }
}

/// What the origin remembers about each hop besides its keys.
#[derive(Debug, Clone)]
pub struct HopMeta {
    pub identity: [u8; 32],
    pub addr: SocketAddr,
}

/// The in-flight extension handshake of an origin circuit.
pub enum PendingClientHandshake {
    Ntor(ClientHandshake),
    Fast(FastClientHandshake),
}

impl std::fmt::Debug for PendingClientHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ntor(_) => write!(f, "PendingClientHandshake::Ntor"),
            Self::Fast(_) => write!(f, "PendingClientHandshake::Fast"),
        }
    }
}

/// A circuit this node built.
pub struct OriginCircuit {
    pub global_id: GlobalCircId,
    /// Toward the first hop.
    pub side: ChannelSide,
    pub state: CircuitState,
    pub purpose: CircuitPurpose,
    /// Established hops, first hop at index 0. Append-only while
    /// BUILDING; frozen at OPEN.
    pub hops: Vec<HopMeta>,
    pub crypt_out: OutboundClientCrypt,
    pub crypt_in: InboundClientCrypt,
    /// Handshake awaiting its CREATED2/EXTENDED2/CREATED_FAST answer.
    pub pending_handshake: Option<PendingClientHandshake>,
    /// Metadata of the hop the pending handshake is adding.
    pub building_meta: Option<HopMeta>,
    /// Hops still to be added, next one first.
    pub planned_path: Vec<HopSpec>,
    pub windows: CircWindows,
    pub streams: StreamMap,
    /// RELAY_EARLY cells this circuit may still emit.
    pub relay_early_remaining: u32,
    pub build_started: Instant,
    /// Cells waiting to go out toward the first hop.
    pub outbound: VecDeque<QueuedCell>,
}

impl OriginCircuit {
    pub fn new(
        global_id: GlobalCircId,
        side: ChannelSide,
        purpose: CircuitPurpose,
        planned_path: Vec<HopSpec>,
        relay_early_budget: u32,
        now: Instant,
    ) -> Self {
        Self {
            global_id,
            side,
            state: CircuitState::Building,
            purpose,
            hops: Vec::new(),
            crypt_out: OutboundClientCrypt::new(),
            crypt_in: InboundClientCrypt::new(),
            pending_handshake: None,
            building_meta: None,
            planned_path,
            windows: CircWindows::new(),
            streams: StreamMap::new(),
            relay_early_remaining: relay_early_budget,
            build_started: now,
            outbound: VecDeque::new(),
        }
    }

    pub fn n_hops(&self) -> usize {
        self.hops.len()
    }

    /// Index of the last hop, where streams terminate.
    pub fn exit_hop(&self) -> Option<usize> {
        self.hops.len().checked_sub(1)
    }

    /// Building is done when the planned path is exhausted.
    pub fn build_complete(&self) -> bool {
        self.planned_path.is_empty() && self.pending_handshake.is_none()
    }
}

/// A circuit this node relays for someone else.
pub struct ForwardingCircuit {
    /// Toward the origin.
    pub prev: ChannelSide,
    /// Away from the origin; `None` while we are the last hop.
    pub next: Option<ChannelSide>,
    pub state: CircuitState,
    /// Our single onion layer.
    pub layer: RelayLayerCrypt,
    /// Exit-side circuit windows (mirroring the origin's view).
    pub windows: CircWindows,
    /// Exit-side streams.
    pub streams: StreamMap,
    /// RELAY_EARLY cells seen from the previous hop.
    pub relay_early_seen: u32,
    /// EXTENDs this circuit has asked of us.
    pub n_extends: u32,
    /// CREATE_FAST circuits are first-hop only and may never extend.
    pub allow_extend: bool,
    /// Cells waiting toward the next hop.
    pub outbound_next: VecDeque<QueuedCell>,
    /// Cells waiting toward the previous hop.
    pub outbound_prev: VecDeque<QueuedCell>,
}

impl ForwardingCircuit {
    pub fn new(prev: ChannelSide, layer: RelayLayerCrypt) -> Self {
        Self {
            prev,
            next: None,
            state: CircuitState::Open,
            layer,
            windows: CircWindows::new(),
            streams: StreamMap::new(),
            relay_early_seen: 0,
            n_extends: 0,
            allow_extend: true,
            outbound_next: VecDeque::new(),
            outbound_prev: VecDeque::new(),
        }
    }
}

/// A circuit of either kind.
pub enum Circuit {
    Origin(OriginCircuit),
    Forwarding(ForwardingCircuit),
}

impl Circuit {
    pub fn state(&self) -> CircuitState {
        match self {
            Circuit::Origin(c) => c.state,
            Circuit::Forwarding(c) => c.state,
        }
    }

    pub fn set_state(&mut self, state: CircuitState) {
        match self {
            Circuit::Origin(c) => c.state = state,
            Circuit::Forwarding(c) => c.state = state,
        }
    }

    pub fn is_origin(&self) -> bool {
        matches!(self, Circuit::Origin(_))
    }

    pub fn as_origin(&self) -> Option<&OriginCircuit> {
        match self {
            Circuit::Origin(c) => Some(c),
            Circuit::Forwarding(_) => None,
        }
    }

    pub fn as_origin_mut(&mut self) -> Option<&mut OriginCircuit> {
        match self {
            Circuit::Origin(c) => Some(c),
            Circuit::Forwarding(_) => None,
        }
    }

    pub fn as_forwarding_mut(&mut self) -> Option<&mut ForwardingCircuit> {
        match self {
            Circuit::Forwarding(c) => Some(c),
            Circuit::Origin(_) => None,
        }
    }

    /// Every channel end this circuit occupies.
    pub fn sides(&self) -> Vec<ChannelSide> {
        match self {
            Circuit::Origin(c) => vec![c.side],
            Circuit::Forwarding(c) => {
                let mut sides = vec![c.prev];
                if let Some(next) = c.next {
                    sides.push(next);
                }
                sides
            }
        }
    }

    /// The outbound queue that drains onto the given channel, if any.
    pub fn queue_for(&mut self, chan: ChannelHandle) -> Option<&mut VecDeque<QueuedCell>> {
        match self {
            Circuit::Origin(c) => (c.side.chan == chan).then_some(&mut c.outbound),
            Circuit::Forwarding(c) => {
                if c.prev.chan == chan {
                    Some(&mut c.outbound_prev)
                } else if c.next.map_or(false, |n| n.chan == chan) {
                    Some(&mut c.outbound_next)
                } else {
                    None
                }
            }
        }
    }

    /// Queue a cell toward the given channel.
    pub fn enqueue(&mut self, chan: ChannelHandle, cell: Cell, now: Instant) -> bool {
        match self.queue_for(chan) {
            Some(queue) => {
                queue.push_back(QueuedCell::new(cell, now));
                true
            }
            None => false,
        }
    }

    pub fn total_queued_bytes(&self) -> usize {
        match self {
            Circuit::Origin(c) => c.outbound.iter().map(|q| q.bytes).sum(),
            Circuit::Forwarding(c) => c
                .outbound_next
                .iter()
                .chain(c.outbound_prev.iter())
                .map(|q| q.bytes)
                .sum(),
        }
    }

    /// When the oldest queued cell was enqueued; the OOM handler sheds the
    /// circuit holding the oldest one first.
    pub fn oldest_queued_at(&self) -> Option<Instant> {
        match self {
            Circuit::Origin(c) => c.outbound.front().map(|q| q.queued_at),
            Circuit::Forwarding(c) => {
                let next = c.outbound_next.front().map(|q| q.queued_at);
                let prev = c.outbound_prev.front().map(|q| q.queued_at);
                match (next, prev) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            }
        }
    }

    /// Drop every queued cell, for cancellation on close.
    pub fn drop_queues(&mut self) {
        match self {
            Circuit::Origin(c) => c.outbound.clear(),
            Circuit::Forwarding(c) => {
                c.outbound_next.clear();
                c.outbound_prev.clear();
            }
        }
    }

    pub fn n_streams(&self) -> usize {
        match self {
            Circuit::Origin(c) => c.streams.len(),
            Circuit::Forwarding(c) => c.streams.len(),
        }
    }

    pub fn info(&self) -> CircuitInfo {
        CircuitInfo {
            kind: match self {
                Circuit::Origin(_) => "origin",
                Circuit::Forwarding(_) => "forwarding",
            },
            global_id: self.as_origin().map(|c| c.global_id.0),
            state: format!("{:?}", self.state()),
            n_hops: self.as_origin().map(|c| c.hops.len()),
            n_streams: self.n_streams(),
            queued_bytes: self.total_queued_bytes(),
        }
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Circuit::Origin(c) => f
                .debug_struct("OriginCircuit")
                .field("global_id", &c.global_id)
                .field("state", &c.state)
                .field("hops", &c.hops.len())
                .field("streams", &c.streams.len())
                .finish(),
            Circuit::Forwarding(c) => f
                .debug_struct("ForwardingCircuit")
                .field("prev", &c.prev)
                .field("next", &c.next)
                .field("state", &c.state)
                .finish(),
        }
    }
}

/// Operator-facing snapshot of one circuit.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitInfo {
    pub kind: &'static str,
    pub global_id: Option<u64>,
    pub state: String,
    pub n_hops: Option<usize>,
    pub n_streams: usize,
    pub queued_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellBody, DestroyReason};
    use crate::channel::{Channel, ChannelDirection, LinkInfo, PaddingTimer};
    use crate::util::Arena;

    fn origin_for_test(chan: ChannelHandle) -> OriginCircuit {
        OriginCircuit::new(
            GlobalCircId(1),
            ChannelSide {
                chan,
                circ_id: CircId(5),
            },
            CircuitPurpose::General,
            Vec::new(),
            8,
            Instant::now(),
        )
    }

    fn channel_handles(n: usize) -> Vec<ChannelHandle> {
        let mut arena: Arena<Channel> = Arena::new();
        let mut out = Vec::new();
        for _ in 0..n {
            let info = LinkInfo {
                link_version: 4,
                peer_identity: None,
                clock_skew_secs: 0,
            };
            let now = Instant::now();
            out.push(arena.insert(Channel::new(
                &info,
                "192.0.2.1:9001".parse().unwrap(),
                ChannelDirection::Outbound,
                now,
                PaddingTimer::disabled(now),
            )));
        }
        out
    }

    #[test]
    fn test_origin_queue_routing() {
        let chans = channel_handles(2);
        let mut circuit = Circuit::Origin(origin_for_test(chans[0]));

        let now = Instant::now();
        let cell = Cell::new(CircId(5), CellBody::Destroy(DestroyReason::None));
        assert!(circuit.enqueue(chans[0], cell.clone(), now));
        assert!(!circuit.enqueue(chans[1], cell, now));
        assert!(circuit.total_queued_bytes() > 0);
        assert!(circuit.oldest_queued_at().is_some());

        circuit.drop_queues();
        assert_eq!(circuit.total_queued_bytes(), 0);
    }

    #[test]
    fn test_build_complete() {
        let chans = channel_handles(1);
        let mut origin = origin_for_test(chans[0]);
        assert!(origin.build_complete());

        origin.planned_path.push(HopSpec {
            identity: [0; 32],
            onion_key: [0; 32],
            addr: "192.0.2.2:9001".parse().unwrap(),
        });
        assert!(!origin.build_complete());
    }

    #[test]
    fn test_sides_of_forwarding() {
        let chans = channel_handles(2);
        let layer = {
            use crate::crypto::{LayerKeys, RelayCrypt, RelayLayerCrypt};
            let keys = LayerKeys {
                key: [0; 32],
                iv: [0; 12],
                digest_seed: [0; 32],
            };
            RelayLayerCrypt::new(RelayCrypt::new(&keys), RelayCrypt::new(&keys))
        };
        let mut fwd = ForwardingCircuit::new(
            ChannelSide {
                chan: chans[0],
                circ_id: CircId(10),
            },
            layer,
        );
        fwd.next = Some(ChannelSide {
            chan: chans[1],
            circ_id: CircId(20),
        });
        let circuit = Circuit::Forwarding(fwd);
        assert_eq!(circuit.sides().len(), 2);
    }
}
