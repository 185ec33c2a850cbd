//! Streams: application byte conduits multiplexed inside a circuit.
//!
//! A stream is owned by exactly one circuit; an origin circuit carries the
//! client ends, a forwarding circuit at an exit carries the TCP-facing
//! ends. Stream ids are 16-bit, non-zero, unique within their circuit.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::Instant;

use rand::Rng;

use super::edge::EdgeId;
use super::flow::StreamWindows;
use crate::cell::relay::{EndReason, StreamId};
use veil_common::{Result, TargetAddr, VeilError};

/// Draws before giving up on a free stream id.
const STREAM_ID_ATTEMPTS: usize = 64;

/// Lifecycle of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, BEGIN not yet answered and edge not yet attached.
    New,
    /// BEGIN sent (origin) or edge TCP connect in flight (exit).
    Connecting,
    /// Data may flow both ways.
    Open,
    /// We sent END and are waiting for the peer's.
    CloseWait,
    /// Fully closed; kept only until reaped.
    Closed,
}

/// One stream.
#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    pub state: StreamState,
    pub windows: StreamWindows,
    /// Why the stream ended, once it has.
    pub end_reason: Option<EndReason>,
    /// Where the exit is asked to connect.
    pub target: Option<TargetAddr>,
    /// Attached edge connection (exit side) .
    pub edge: Option<EdgeId>,
    /// Address the exit actually reached, reported by CONNECTED.
    pub connected_addr: Option<IpAddr>,
    /// Data delivered to the origin, waiting for the client to read.
    pub recv_buffer: VecDeque<Vec<u8>>,
    /// Exit side: edge bytes waiting for window room.
    pub edge_backlog: Vec<u8>,
    /// Exit side: whether we told the runtime to stop reading the socket.
    pub read_stopped: bool,
    pub opened_at: Instant,
}

impl Stream {
    pub fn new(id: StreamId, now: Instant) -> Self {
        Self {
            id,
            state: StreamState::New,
            windows: StreamWindows::new(),
            end_reason: None,
            target: None,
            edge: None,
            connected_addr: None,
            recv_buffer: VecDeque::new(),
            edge_backlog: Vec::new(),
            read_stopped: false,
            opened_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Record the terminal reason and state.
    pub fn close(&mut self, reason: EndReason) {
        if self.end_reason.is_none() {
            self.end_reason = Some(reason);
        }
        self.state = StreamState::Closed;
    }

    /// BEGIN answered too slowly.
    pub fn attach_expired(&self, now: Instant, timeout: std::time::Duration) -> bool {
        matches!(self.state, StreamState::New | StreamState::Connecting)
            && now.duration_since(self.opened_at) >= timeout
    }
}

/// The streams of one circuit.
#[derive(Debug, Default)]
pub struct StreamMap {
    map: HashMap<StreamId, Stream>,
}

impl StreamMap {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Allocate a fresh random non-zero id and insert a new stream.
    pub fn open_local<R: Rng>(&mut self, rng: &mut R, now: Instant) -> Result<StreamId> {
        for _ in 0..STREAM_ID_ATTEMPTS {
            let id = StreamId(rng.gen_range(1..=u16::MAX));
            if !self.map.contains_key(&id) {
                self.map.insert(id, Stream::new(id, now));
                return Ok(id);
            }
        }
        Err(VeilError::resource("stream id space saturated"))
    }

    /// Insert a stream under the id a remote BEGIN carried.
    pub fn open_remote(&mut self, id: StreamId, now: Instant) -> Result<&mut Stream> {
        if id.is_circuit_level() {
            return Err(VeilError::protocol("BEGIN with stream id zero"));
        }
        if self.map.contains_key(&id) {
            return Err(VeilError::protocol(format!(
                "BEGIN reusing live stream id {}",
                id
            )));
        }
        Ok(self.map.entry(id).or_insert_with(|| Stream::new(id, now)))
    }

    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.map.get_mut(&id)
    }

    pub fn remove(&mut self, id: StreamId) -> Option<Stream> {
        self.map.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stream> {
        self.map.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.map.values_mut()
    }

    pub fn ids(&self) -> Vec<StreamId> {
        self.map.keys().copied().collect()
    }

    /// Pull every stream out, for circuit teardown.
    pub fn detach_all(&mut self) -> Vec<Stream> {
        self.map.drain().map(|(_, s)| s).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_open_local_unique_ids() {
        let mut rng = rand::thread_rng();
        let now = Instant::now();
        let mut streams = StreamMap::new();
        let a = streams.open_local(&mut rng, now).unwrap();
        let b = streams.open_local(&mut rng, now).unwrap();
        assert_ne!(a, b);
        assert!(!a.is_circuit_level());
        assert_eq!(streams.len(), 2);
    }

    #[test]
    fn test_open_remote_rejects_zero_and_duplicates() {
        let now = Instant::now();
        let mut streams = StreamMap::new();
        assert!(streams.open_remote(StreamId(0), now).is_err());

        streams.open_remote(StreamId(5), now).unwrap();
        assert!(streams.open_remote(StreamId(5), now).is_err());
    }

    #[test]
    fn test_close_records_first_reason() {
        let now = Instant::now();
        let mut stream = Stream::new(StreamId(1), now);
        stream.close(EndReason::Done);
        stream.close(EndReason::Misc);
        assert_eq!(stream.end_reason, Some(EndReason::Done));
        assert!(stream.is_closed());
    }

    #[test]
    fn test_attach_timeout() {
        let now = Instant::now();
        let timeout = Duration::from_secs(120);
        let mut stream = Stream::new(StreamId(1), now);
        assert!(!stream.attach_expired(now + Duration::from_secs(60), timeout));
        assert!(stream.attach_expired(now + timeout, timeout));

        stream.state = StreamState::Open;
        assert!(!stream.attach_expired(now + timeout, timeout));
    }

    #[test]
    fn test_detach_all_empties_map() {
        let mut rng = rand::thread_rng();
        let now = Instant::now();
        let mut streams = StreamMap::new();
        streams.open_local(&mut rng, now).unwrap();
        streams.open_local(&mut rng, now).unwrap();
        let detached = streams.detach_all();
        assert_eq!(detached.len(), 2);
        assert!(streams.is_empty());
    }
}
