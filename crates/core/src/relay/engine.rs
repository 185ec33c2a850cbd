//! The relay engine: interpretation of the inner relay protocol.
//!
//! Origin-side functions drive building, stream opening and data transfer
//! on [`OriginCircuit`]s; exit/relay-side functions process recognized
//! cells on [`ForwardingCircuit`]s and bridge them to edge connections.
//! The engine mutates the circuit it is given and queues outbound cells on
//! the circuit's own queues; anything that needs other state (a new
//! channel, an edge socket) is reported as a [`RelayOutcome`] for the
//! caller to perform.

use std::time::Instant;

use rand::{CryptoRng, Rng, RngCore};
use tracing::{debug, info};

use crate::cell::relay::{
    BeginPayload, ConnectedPayload, EndReason, Extend2Payload, Extended2Payload, LinkSpec,
    RelayCellBody, RelayCommand, RelayMsg, ResolvedAnswer, ResolvedPayload, SendmePayload,
    StreamId,
};
use crate::cell::{Cell, CellBody, Create2Msg, Created2Msg, CreatedFastMsg};
use crate::circuit::{
    CircuitState, ForwardingCircuit, HopMeta, OriginCircuit, PendingClientHandshake, QueuedCell,
};
use crate::crypto::handshake::{ClientHandshake, FastClientHandshake, KeySeed};
use crate::crypto::{RelayCrypt, HANDSHAKE_TYPE_NTOR};
use crate::provider::ExitPolicy;
use crate::relay::edge::EdgeAction;
use crate::relay::flow::DeliverOutcome;
use crate::relay::stream::StreamState;
use veil_common::cell::MAX_RELAY_DATA_LEN;
use veil_common::{CoreConfig, Result, TargetAddr, VeilError};

/// A relay asked us to extend the circuit to this next hop.
#[derive(Debug, Clone)]
pub struct ExtendRequest {
    pub target: std::net::SocketAddrV4,
    pub identity: [u8; 32],
    pub handshake_type: u16,
    pub handshake: Vec<u8>,
}

/// Side effects of processing one relay cell, for the caller to act on.
#[derive(Debug)]
pub enum RelayOutcome {
    /// Origin: stream data is buffered for the client.
    DataReady { stream: StreamId },
    /// Origin: the exit reported the stream open.
    StreamConnected { stream: StreamId },
    /// Origin: the remote side ended the stream.
    StreamEnded { stream: StreamId, reason: EndReason },
    /// Origin: a RESOLVE answer arrived.
    StreamResolved {
        stream: StreamId,
        payload: ResolvedPayload,
    },
    /// Origin: one more hop is up, more to come.
    BuildProgressed,
    /// Origin: the planned path is fully built; circuit is OPEN.
    BuildComplete,
    /// Origin: the circuit was truncated down to this many hops.
    Truncated { n_hops: usize },
    /// Exit: create an edge token for this stream and connect it.
    EdgeConnectRequested { stream: StreamId, target: TargetAddr },
    /// Exit: create an edge token for this stream and resolve a name.
    /// `for_connect` distinguishes BEGIN-with-hostname from RESOLVE.
    EdgeResolveRequested {
        stream: StreamId,
        hostname: String,
        for_connect: bool,
    },
    /// Exit: act on an already-attached edge.
    Edge(EdgeAction),
    /// Relay: open the next hop and forward the embedded handshake.
    ExtendRequested(ExtendRequest),
    /// Relay: tear down the next side (TRUNCATE).
    DropNextSide,
}

/// True when config demands digest-authenticated circuit SENDMEs.
fn require_sendme_auth(config: &CoreConfig) -> bool {
    config.sendme_emit_version >= 1
}

// ---------------------------------------------------------------------------
// Origin side: building

/// Queue the first-hop CREATE2 (or CREATE_FAST) and arm the handshake.
pub fn begin_build<R: RngCore + CryptoRng>(
    circuit: &mut OriginCircuit,
    rng: &mut R,
    use_fast: bool,
    now: Instant,
) -> Result<()> {
    if !circuit.hops.is_empty() || circuit.pending_handshake.is_some() {
        return Err(VeilError::internal("build already started"));
    }
    let spec = circuit
        .planned_path
        .first()
        .cloned()
        .ok_or_else(|| VeilError::internal("empty path"))?;

    let body = if use_fast {
        let (hs, msg) = FastClientHandshake::start(rng);
        circuit.pending_handshake = Some(PendingClientHandshake::Fast(hs));
        CellBody::CreateFast(msg)
    } else {
        let (hs, onionskin) = ClientHandshake::start(rng, spec.identity, spec.onion_key);
        circuit.pending_handshake = Some(PendingClientHandshake::Ntor(hs));
        CellBody::Create2(Create2Msg::new(HANDSHAKE_TYPE_NTOR, onionskin))
    };
    circuit.building_meta = Some(HopMeta {
        identity: spec.identity,
        addr: spec.addr,
    });
    circuit.planned_path.remove(0);
    let cell = Cell::new(circuit.side.circ_id, body);
    circuit.outbound.push_back(QueuedCell::new(cell, now));
    Ok(())
}

/// The first hop answered CREATE2.
pub fn handle_created2<R: RngCore + CryptoRng>(
    circuit: &mut OriginCircuit,
    msg: &Created2Msg,
    rng: &mut R,
    now: Instant,
) -> Result<Vec<RelayOutcome>> {
    let pending = circuit
        .pending_handshake
        .take()
        .ok_or_else(|| VeilError::protocol("CREATED2 with no handshake pending"))?;
    let hs = match pending {
        PendingClientHandshake::Ntor(hs) => hs,
        PendingClientHandshake::Fast(_) => {
            return Err(VeilError::protocol("CREATED2 answering CREATE_FAST"))
        }
    };
    let seed = hs.complete(&msg.handshake)?;
    let meta = first_hop_meta(circuit)?;
    add_hop(circuit, seed, meta);
    advance_build(circuit, rng, now)
}

/// The first hop answered CREATE_FAST.
pub fn handle_created_fast<R: RngCore + CryptoRng>(
    circuit: &mut OriginCircuit,
    msg: &CreatedFastMsg,
    rng: &mut R,
    now: Instant,
) -> Result<Vec<RelayOutcome>> {
    let pending = circuit
        .pending_handshake
        .take()
        .ok_or_else(|| VeilError::protocol("CREATED_FAST with no handshake pending"))?;
    let hs = match pending {
        PendingClientHandshake::Fast(hs) => hs,
        PendingClientHandshake::Ntor(_) => {
            return Err(VeilError::protocol("CREATED_FAST answering CREATE2"))
        }
    };
    let seed = hs.complete(msg)?;
    let meta = first_hop_meta(circuit)?;
    add_hop(circuit, seed, meta);
    advance_build(circuit, rng, now)
}

fn first_hop_meta(circuit: &OriginCircuit) -> Result<HopMeta> {
    // The hop being handshaken was popped off the planned path when the
    // CREATE went out; its metadata travels in `building_meta`.
    circuit
        .building_meta
        .clone()
        .ok_or_else(|| VeilError::internal("no hop metadata recorded"))
}

fn add_hop(circuit: &mut OriginCircuit, seed: KeySeed, meta: HopMeta) {
    let material = seed.expand();
    circuit
        .crypt_out
        .add_layer(RelayCrypt::new(&material.forward));
    circuit
        .crypt_in
        .add_layer(RelayCrypt::new(&material.backward));
    circuit.hops.push(meta);
    circuit.building_meta = None;
}

/// Send the next EXTEND2, or declare the circuit open.
pub fn advance_build<R: RngCore + CryptoRng>(
    circuit: &mut OriginCircuit,
    rng: &mut R,
    now: Instant,
) -> Result<Vec<RelayOutcome>> {
    if circuit.planned_path.is_empty() {
        circuit.state = CircuitState::Open;
        debug!(hops = circuit.n_hops(), "circuit build complete");
        return Ok(vec![RelayOutcome::BuildComplete]);
    }
    let spec = circuit.planned_path.remove(0);
    let (hs, onionskin) = ClientHandshake::start(rng, spec.identity, spec.onion_key);
    circuit.pending_handshake = Some(PendingClientHandshake::Ntor(hs));
    circuit.building_meta = Some(HopMeta {
        identity: spec.identity,
        addr: spec.addr,
    });

    let v4 = match spec.addr {
        std::net::SocketAddr::V4(v4) => v4,
        std::net::SocketAddr::V6(_) => {
            return Err(VeilError::internal("extension targets must be IPv4"))
        }
    };
    let payload = Extend2Payload {
        specs: vec![LinkSpec::Ipv4(v4), LinkSpec::Identity(spec.identity)],
        handshake_type: HANDSHAKE_TYPE_NTOR,
        handshake: onionskin,
    };
    let exit = circuit
        .exit_hop()
        .ok_or_else(|| VeilError::internal("extend with no hops"))?;
    let msg = RelayMsg::new(RelayCommand::Extend2, StreamId::CIRCUIT, payload.encode());
    origin_send(circuit, exit, &msg, true, now)?;
    Ok(vec![RelayOutcome::BuildProgressed])
}

// ---------------------------------------------------------------------------
// Origin side: streams

/// Open a stream to `target` through the exit hop.
pub fn origin_begin_stream<R: Rng>(
    circuit: &mut OriginCircuit,
    target: &str,
    config: &CoreConfig,
    rng: &mut R,
    now: Instant,
) -> Result<StreamId> {
    if circuit.state != CircuitState::Open {
        return Err(VeilError::CircuitClosed);
    }
    if circuit.streams.len() >= config.max_streams_per_circuit {
        return Err(VeilError::resource("stream cap reached on circuit"));
    }
    let parsed = TargetAddr::parse(target)?;
    let stream_id = circuit.streams.open_local(rng, now)?;
    let stream = circuit
        .streams
        .get_mut(stream_id)
        .expect("stream just inserted");
    stream.state = StreamState::Connecting;
    stream.target = Some(parsed);

    let exit = circuit
        .exit_hop()
        .ok_or_else(|| VeilError::internal("stream on hopless circuit"))?;
    let msg = RelayMsg::new(
        RelayCommand::Begin,
        stream_id,
        BeginPayload::new(target).encode(),
    );
    origin_send(circuit, exit, &msg, false, now)?;
    Ok(stream_id)
}

/// Package client bytes into DATA cells; returns how many bytes were
/// accepted before a window closed.
pub fn origin_write(
    circuit: &mut OriginCircuit,
    stream_id: StreamId,
    data: &[u8],
    now: Instant,
) -> Result<usize> {
    let exit = circuit
        .exit_hop()
        .ok_or_else(|| VeilError::internal("write on hopless circuit"))?;
    let stream = circuit
        .streams
        .get(stream_id)
        .ok_or(VeilError::StreamClosed)?;
    if !stream.is_open() {
        return Err(VeilError::StreamClosed);
    }

    let mut written = 0;
    for chunk in data.chunks(MAX_RELAY_DATA_LEN) {
        let stream_ok = circuit
            .streams
            .get(stream_id)
            .map_or(false, |s| s.windows.can_package());
        if !circuit.windows.can_package() || !stream_ok {
            break;
        }
        let msg = RelayMsg::new(RelayCommand::Data, stream_id, chunk.to_vec());
        let tag = origin_send(circuit, exit, &msg, false, now)?;
        circuit.windows.note_packaged(tag)?;
        circuit
            .streams
            .get_mut(stream_id)
            .expect("stream checked above")
            .windows
            .note_packaged()?;
        written += chunk.len();
    }
    Ok(written)
}

/// Read data the exit delivered, if any.
pub fn origin_read(circuit: &mut OriginCircuit, stream_id: StreamId) -> Option<Vec<u8>> {
    circuit
        .streams
        .get_mut(stream_id)
        .and_then(|s| s.recv_buffer.pop_front())
}

/// Close a stream from the client side.
pub fn origin_close_stream(
    circuit: &mut OriginCircuit,
    stream_id: StreamId,
    reason: EndReason,
    now: Instant,
) -> Result<()> {
    let exit = circuit
        .exit_hop()
        .ok_or_else(|| VeilError::internal("close on hopless circuit"))?;
    let stream = circuit
        .streams
        .get_mut(stream_id)
        .ok_or(VeilError::StreamClosed)?;
    if stream.is_closed() {
        return Ok(());
    }
    stream.state = StreamState::CloseWait;
    let msg = RelayMsg::new(RelayCommand::End, stream_id, vec![reason.as_u8()]);
    origin_send(circuit, exit, &msg, false, now)?;
    Ok(())
}

/// Process a relay cell arriving at the origin from the first hop.
///
/// Returns `Ok(None)` when no hop recognized the cell (it is dropped as
/// noise per the recognition rule).
pub fn origin_deliver(
    circuit: &mut OriginCircuit,
    body: RelayCellBody,
    config: &CoreConfig,
    now: Instant,
) -> Result<Option<Vec<RelayOutcome>>> {
    let mut body = body;
    let (hop, tag) = match circuit.crypt_in.decrypt(&mut body) {
        Some(found) => found,
        None => {
            debug!("unrecognized inbound relay cell dropped");
            return Ok(None);
        }
    };
    let msg = RelayMsg::parse(&body)?;
    let outcomes = origin_dispatch(circuit, hop, tag, msg, config, now)?;
    Ok(Some(outcomes))
}

fn origin_dispatch(
    circuit: &mut OriginCircuit,
    hop: usize,
    tag: crate::crypto::SendmeTag,
    msg: RelayMsg,
    config: &CoreConfig,
    now: Instant,
) -> Result<Vec<RelayOutcome>> {
    let mut outcomes = Vec::new();
    match msg.command {
        RelayCommand::Data => {
            // Circuit accounting first: an exhausted window is fatal no
            // matter which stream the cell names.
            match circuit.windows.note_delivered(tag)? {
                DeliverOutcome::SendmeDue(echo) => {
                    let sendme = RelayMsg::new(
                        RelayCommand::Sendme,
                        StreamId::CIRCUIT,
                        SendmePayload::authenticated(echo).encode(),
                    );
                    origin_send(circuit, hop, &sendme, false, now)?;
                    circuit.windows.note_sendme_sent()?;
                }
                DeliverOutcome::Ok => {}
            }
            if msg.stream_id.is_circuit_level() {
                return Err(VeilError::protocol("DATA with stream id zero"));
            }
            let mut stream_sendme_due = false;
            match circuit.streams.get_mut(msg.stream_id) {
                Some(stream) => {
                    stream_sendme_due = stream.windows.note_delivered()?;
                    stream.recv_buffer.push_back(msg.data);
                    outcomes.push(RelayOutcome::DataReady {
                        stream: msg.stream_id,
                    });
                }
                // Data racing a close we already sent; window was counted.
                None => debug!(stream = %msg.stream_id, "data for dead stream dropped"),
            }
            if stream_sendme_due {
                let sendme = RelayMsg::new(RelayCommand::Sendme, msg.stream_id, Vec::new());
                origin_send(circuit, hop, &sendme, false, now)?;
                circuit
                    .streams
                    .get_mut(msg.stream_id)
                    .expect("stream present above")
                    .windows
                    .note_sendme_sent()?;
            }
        }

        RelayCommand::Connected => {
            let stream = circuit
                .streams
                .get_mut(msg.stream_id)
                .ok_or_else(|| VeilError::protocol("CONNECTED for unknown stream"))?;
            if stream.state != StreamState::Connecting {
                return Err(VeilError::protocol("CONNECTED for a non-connecting stream"));
            }
            let payload = ConnectedPayload::parse(&msg.data)?;
            stream.state = StreamState::Open;
            stream.connected_addr = payload.addr;
            outcomes.push(RelayOutcome::StreamConnected {
                stream: msg.stream_id,
            });
        }

        RelayCommand::End => {
            let reason = msg
                .data
                .first()
                .map(|b| EndReason::from_u8(*b))
                .unwrap_or(EndReason::Misc);
            if let Some(stream) = circuit.streams.get_mut(msg.stream_id) {
                stream.close(reason);
                outcomes.push(RelayOutcome::StreamEnded {
                    stream: msg.stream_id,
                    reason,
                });
            }
        }

        RelayCommand::Sendme => {
            if msg.stream_id.is_circuit_level() {
                let payload = SendmePayload::parse(&msg.data)?;
                circuit
                    .windows
                    .handle_sendme(payload.tag, require_sendme_auth(config))?;
            } else if let Some(stream) = circuit.streams.get_mut(msg.stream_id) {
                stream.windows.handle_sendme()?;
            }
        }

        RelayCommand::Extended2 => {
            let payload = Extended2Payload::parse(&msg.data)?;
            let pending = circuit
                .pending_handshake
                .take()
                .ok_or_else(|| VeilError::protocol("EXTENDED2 with no handshake pending"))?;
            let hs = match pending {
                PendingClientHandshake::Ntor(hs) => hs,
                PendingClientHandshake::Fast(_) => {
                    return Err(VeilError::protocol("EXTENDED2 answering CREATE_FAST"))
                }
            };
            let seed = hs.complete(&payload.handshake)?;
            let meta = first_hop_meta(circuit)?;
            add_hop(circuit, seed, meta);
            // Continue building with a fresh rng; extension decisions are
            // data-independent so thread_rng is fine here.
            let mut rng = rand::thread_rng();
            outcomes.extend(advance_build(circuit, &mut rng, now)?);
        }

        RelayCommand::Truncated => {
            // Hops beyond the sender are gone.
            let kept = hop + 1;
            circuit.hops.truncate(kept);
            circuit.crypt_out.truncate(kept);
            circuit.crypt_in.truncate(kept);
            info!(hops = kept, "circuit truncated by relay");
            outcomes.push(RelayOutcome::Truncated { n_hops: kept });
        }

        RelayCommand::Resolved => {
            let payload = ResolvedPayload::parse(&msg.data)?;
            if let Some(stream) = circuit.streams.get_mut(msg.stream_id) {
                stream.close(EndReason::Done);
                outcomes.push(RelayOutcome::StreamResolved {
                    stream: msg.stream_id,
                    payload,
                });
            }
        }

        RelayCommand::Drop => {}

        other => {
            return Err(VeilError::protocol(format!(
                "{} cell arriving at origin",
                other
            )));
        }
    }
    Ok(outcomes)
}

/// Encrypt and queue a relay cell for the given hop.
fn origin_send(
    circuit: &mut OriginCircuit,
    hop: usize,
    msg: &RelayMsg,
    early: bool,
    now: Instant,
) -> Result<crate::crypto::SendmeTag> {
    if early {
        if circuit.relay_early_remaining == 0 {
            return Err(VeilError::protocol("RELAY_EARLY budget exhausted"));
        }
        circuit.relay_early_remaining -= 1;
    }
    let mut body = msg.encode()?;
    let tag = circuit.crypt_out.encrypt(&mut body, hop)?;
    let cell_body = if early {
        CellBody::RelayEarly(body)
    } else {
        CellBody::Relay(body)
    };
    let cell = Cell::new(circuit.side.circ_id, cell_body);
    circuit.outbound.push_back(QueuedCell::new(cell, now));
    Ok(tag)
}

// ---------------------------------------------------------------------------
// Forwarding / exit side

/// Process a relay cell arriving from the previous hop.
pub fn forwarding_from_prev(
    circuit: &mut ForwardingCircuit,
    body: RelayCellBody,
    early: bool,
    config: &CoreConfig,
    policy: &dyn ExitPolicy,
    now: Instant,
) -> Result<Vec<RelayOutcome>> {
    if early {
        circuit.relay_early_seen += 1;
        if circuit.relay_early_seen > config.relay_early_budget {
            return Err(VeilError::protocol("RELAY_EARLY budget exceeded"));
        }
    }

    let mut body = body;
    match circuit.layer.decrypt_forward(&mut body) {
        Some(tag) => {
            let msg = RelayMsg::parse(&body)?;
            exit_dispatch(circuit, tag, msg, early, config, policy, now)
        }
        None => {
            // Not ours: pass it along, keeping the RELAY_EARLY marking.
            let next = match circuit.next {
                Some(next) => next,
                None => {
                    return Err(VeilError::protocol(
                        "unrecognized relay cell at the last hop",
                    ))
                }
            };
            let cell_body = if early {
                CellBody::RelayEarly(body)
            } else {
                CellBody::Relay(body)
            };
            let cell = Cell::new(next.circ_id, cell_body);
            circuit.outbound_next.push_back(QueuedCell::new(cell, now));
            Ok(Vec::new())
        }
    }
}

/// Process a relay cell arriving from the next hop: add our layer and pass
/// it toward the origin.
pub fn forwarding_from_next(
    circuit: &mut ForwardingCircuit,
    body: RelayCellBody,
    now: Instant,
) -> Result<()> {
    let mut body = body;
    circuit.layer.encrypt_back(&mut body);
    let cell = Cell::new(circuit.prev.circ_id, CellBody::Relay(body));
    circuit.outbound_prev.push_back(QueuedCell::new(cell, now));
    Ok(())
}

fn exit_dispatch(
    circuit: &mut ForwardingCircuit,
    tag: crate::crypto::SendmeTag,
    msg: RelayMsg,
    early: bool,
    config: &CoreConfig,
    policy: &dyn ExitPolicy,
    now: Instant,
) -> Result<Vec<RelayOutcome>> {
    let mut outcomes = Vec::new();
    match msg.command {
        RelayCommand::Begin => {
            if circuit.streams.len() >= config.max_streams_per_circuit {
                exit_send_end(circuit, msg.stream_id, EndReason::ResourceLimit, now)?;
                return Ok(outcomes);
            }
            let payload = BeginPayload::parse(&msg.data)?;
            let target = match TargetAddr::parse(&payload.target) {
                Ok(t) => t,
                Err(_) => {
                    exit_send_end(circuit, msg.stream_id, EndReason::Misc, now)?;
                    return Ok(outcomes);
                }
            };
            let stream = circuit.streams.open_remote(msg.stream_id, now)?;
            stream.state = StreamState::Connecting;
            stream.target = Some(target.clone());
            match &target {
                TargetAddr::Ip(sock) => {
                    if !policy.allow(sock.ip(), sock.port()) {
                        circuit.streams.remove(msg.stream_id);
                        exit_send_end(circuit, msg.stream_id, EndReason::ExitPolicy, now)?;
                        return Ok(outcomes);
                    }
                    outcomes.push(RelayOutcome::EdgeConnectRequested {
                        stream: msg.stream_id,
                        target,
                    });
                }
                TargetAddr::Hostname { host, .. } => {
                    outcomes.push(RelayOutcome::EdgeResolveRequested {
                        stream: msg.stream_id,
                        hostname: host.clone(),
                        for_connect: true,
                    });
                }
            }
        }

        RelayCommand::BeginDir => {
            // No directory subsystem behind this relay.
            exit_send_end(circuit, msg.stream_id, EndReason::NotDirectory, now)?;
        }

        RelayCommand::Data => {
            match circuit.windows.note_delivered(tag)? {
                DeliverOutcome::SendmeDue(echo) => {
                    let sendme = RelayMsg::new(
                        RelayCommand::Sendme,
                        StreamId::CIRCUIT,
                        SendmePayload::authenticated(echo).encode(),
                    );
                    exit_send(circuit, &sendme, now)?;
                    circuit.windows.note_sendme_sent()?;
                }
                DeliverOutcome::Ok => {}
            }
            if msg.stream_id.is_circuit_level() {
                return Err(VeilError::protocol("DATA with stream id zero"));
            }
            let mut stream_sendme_due = false;
            if let Some(stream) = circuit.streams.get_mut(msg.stream_id) {
                stream_sendme_due = stream.windows.note_delivered()?;
                if let Some(edge) = stream.edge {
                    outcomes.push(RelayOutcome::Edge(EdgeAction::Transmit {
                        edge,
                        data: msg.data,
                    }));
                }
            } else {
                debug!(stream = %msg.stream_id, "exit data for dead stream dropped");
            }
            if stream_sendme_due {
                let sendme = RelayMsg::new(RelayCommand::Sendme, msg.stream_id, Vec::new());
                exit_send(circuit, &sendme, now)?;
                circuit
                    .streams
                    .get_mut(msg.stream_id)
                    .expect("stream present above")
                    .windows
                    .note_sendme_sent()?;
            }
        }

        RelayCommand::End => {
            let reason = msg
                .data
                .first()
                .map(|b| EndReason::from_u8(*b))
                .unwrap_or(EndReason::Misc);
            if let Some(stream) = circuit.streams.remove(msg.stream_id) {
                if let Some(edge) = stream.edge {
                    outcomes.push(RelayOutcome::Edge(EdgeAction::Shutdown { edge, reason }));
                }
            }
        }

        RelayCommand::Sendme => {
            if msg.stream_id.is_circuit_level() {
                let payload = SendmePayload::parse(&msg.data)?;
                circuit
                    .windows
                    .handle_sendme(payload.tag, require_sendme_auth(config))?;
                outcomes.extend(drain_backlogs(circuit, now)?);
            } else if let Some(stream) = circuit.streams.get_mut(msg.stream_id) {
                stream.windows.handle_sendme()?;
                outcomes.extend(drain_backlogs(circuit, now)?);
            }
        }

        RelayCommand::Extend2 => {
            if !early {
                return Err(VeilError::protocol("EXTEND2 not sent as RELAY_EARLY"));
            }
            if !circuit.allow_extend {
                return Err(VeilError::protocol("EXTEND2 on a CREATE_FAST circuit"));
            }
            if circuit.next.is_some() || circuit.n_extends > 0 {
                return Err(VeilError::protocol("EXTEND2 on an already-extended hop"));
            }
            let payload = Extend2Payload::parse(&msg.data)?;
            let target = payload
                .ipv4()
                .ok_or_else(|| VeilError::protocol("EXTEND2 without an address"))?;
            let identity = payload
                .identity()
                .ok_or_else(|| VeilError::protocol("EXTEND2 without an identity"))?;
            circuit.n_extends += 1;
            outcomes.push(RelayOutcome::ExtendRequested(ExtendRequest {
                target,
                identity,
                handshake_type: payload.handshake_type,
                handshake: payload.handshake,
            }));
        }

        RelayCommand::Truncate => {
            let reply = RelayMsg::new(
                RelayCommand::Truncated,
                StreamId::CIRCUIT,
                vec![crate::cell::DestroyReason::Requested.as_u8()],
            );
            exit_send(circuit, &reply, now)?;
            // The caller unindexes and clears the next side.
            if circuit.next.is_some() {
                outcomes.push(RelayOutcome::DropNextSide);
            }
        }

        RelayCommand::Resolve => {
            let hostname = msg
                .data
                .split(|&b| b == 0)
                .next()
                .and_then(|bytes| std::str::from_utf8(bytes).ok())
                .ok_or_else(|| VeilError::malformed_cell("bad RESOLVE payload"))?
                .to_string();
            let stream = circuit.streams.open_remote(msg.stream_id, now)?;
            stream.state = StreamState::Connecting;
            outcomes.push(RelayOutcome::EdgeResolveRequested {
                stream: msg.stream_id,
                hostname,
                for_connect: false,
            });
        }

        RelayCommand::Drop => {}

        other => {
            return Err(VeilError::protocol(format!(
                "{} cell recognized at a relay",
                other
            )));
        }
    }
    Ok(outcomes)
}

// ---------------------------------------------------------------------------
// Exit side: edge events

/// The edge TCP connect finished.
pub fn exit_edge_connected(
    circuit: &mut ForwardingCircuit,
    stream_id: StreamId,
    peer: std::net::IpAddr,
    now: Instant,
) -> Result<Vec<RelayOutcome>> {
    let stream = circuit
        .streams
        .get_mut(stream_id)
        .ok_or(VeilError::StreamClosed)?;
    stream.state = StreamState::Open;
    stream.connected_addr = Some(peer);
    let msg = RelayMsg::new(
        RelayCommand::Connected,
        stream_id,
        ConnectedPayload::new(peer, 60).encode(),
    );
    exit_send(circuit, &msg, now)?;
    Ok(Vec::new())
}

/// The edge TCP connect failed.
pub fn exit_edge_connect_failed(
    circuit: &mut ForwardingCircuit,
    stream_id: StreamId,
    reason: EndReason,
    now: Instant,
) -> Result<()> {
    circuit.streams.remove(stream_id);
    exit_send_end(circuit, stream_id, reason, now)
}

/// Bytes arrived from the edge socket: package them toward the origin.
/// Excess beyond the windows is held in the stream backlog and the socket
/// is read-stopped.
pub fn exit_edge_data(
    circuit: &mut ForwardingCircuit,
    stream_id: StreamId,
    data: Vec<u8>,
    now: Instant,
) -> Result<Vec<RelayOutcome>> {
    {
        let stream = circuit
            .streams
            .get_mut(stream_id)
            .ok_or(VeilError::StreamClosed)?;
        stream.edge_backlog.extend_from_slice(&data);
    }
    drain_stream_backlog(circuit, stream_id, now)
}

/// The edge socket closed or failed.
pub fn exit_edge_closed(
    circuit: &mut ForwardingCircuit,
    stream_id: StreamId,
    reason: EndReason,
    now: Instant,
) -> Result<()> {
    if circuit.streams.remove(stream_id).is_some() {
        exit_send_end(circuit, stream_id, reason, now)?;
    }
    Ok(())
}

/// A DNS answer came back for a RESOLVE stream or a BEGIN-by-hostname.
pub fn exit_resolved(
    circuit: &mut ForwardingCircuit,
    stream_id: StreamId,
    answers: &[std::net::IpAddr],
    policy: &dyn ExitPolicy,
    now: Instant,
) -> Result<Vec<RelayOutcome>> {
    let mut outcomes = Vec::new();
    let (target, edge) = {
        let stream = circuit
            .streams
            .get(stream_id)
            .ok_or(VeilError::StreamClosed)?;
        (stream.target.clone(), stream.edge)
    };

    match target {
        // BEGIN by hostname: connect to the first policy-approved answer.
        Some(target) => {
            let port = target.port();
            match answers.iter().find(|ip| policy.allow(**ip, port)) {
                Some(ip) => {
                    let sock = std::net::SocketAddr::new(*ip, port);
                    match edge {
                        Some(edge) => outcomes.push(RelayOutcome::Edge(EdgeAction::Connect {
                            edge,
                            target: TargetAddr::from_socket(sock),
                        })),
                        None => outcomes.push(RelayOutcome::EdgeConnectRequested {
                            stream: stream_id,
                            target: TargetAddr::from_socket(sock),
                        }),
                    }
                }
                None => {
                    let reason = if answers.is_empty() {
                        EndReason::ResolveFailed
                    } else {
                        EndReason::ExitPolicy
                    };
                    circuit.streams.remove(stream_id);
                    exit_send_end(circuit, stream_id, reason, now)?;
                }
            }
        }
        // Plain RESOLVE stream: answer and finish.
        None => {
            let payload = ResolvedPayload {
                answers: answers
                    .iter()
                    .map(|ip| (ResolvedAnswer::Ip(*ip), 300))
                    .collect(),
            };
            let msg = RelayMsg::new(RelayCommand::Resolved, stream_id, payload.encode());
            circuit.streams.remove(stream_id);
            exit_send(circuit, &msg, now)?;
        }
    }
    Ok(outcomes)
}

/// A DNS lookup failed.
pub fn exit_resolve_failed(
    circuit: &mut ForwardingCircuit,
    stream_id: StreamId,
    transient: bool,
    now: Instant,
) -> Result<()> {
    let is_begin = circuit
        .streams
        .get(stream_id)
        .map_or(false, |s| s.target.is_some());
    circuit.streams.remove(stream_id);
    if is_begin {
        exit_send_end(circuit, stream_id, EndReason::ResolveFailed, now)
    } else {
        let answer = if transient {
            ResolvedAnswer::TransientError
        } else {
            ResolvedAnswer::NontransientError
        };
        let payload = ResolvedPayload {
            answers: vec![(answer, 0)],
        };
        let msg = RelayMsg::new(RelayCommand::Resolved, stream_id, payload.encode());
        exit_send(circuit, &msg, now)?;
        Ok(())
    }
}

/// Push backlogged edge bytes through the windows of one stream.
fn drain_stream_backlog(
    circuit: &mut ForwardingCircuit,
    stream_id: StreamId,
    now: Instant,
) -> Result<Vec<RelayOutcome>> {
    let mut outcomes = Vec::new();
    loop {
        let chunk = {
            let stream = circuit
                .streams
                .get_mut(stream_id)
                .ok_or(VeilError::StreamClosed)?;
            if stream.edge_backlog.is_empty() {
                // Everything packaged: let the socket flow again.
                if let Some(edge) = stream.edge {
                    if stream.read_stopped {
                        stream.read_stopped = false;
                        outcomes.push(RelayOutcome::Edge(EdgeAction::SetReadEnabled {
                            edge,
                            enabled: true,
                        }));
                    }
                }
                return Ok(outcomes);
            }
            if !circuit.windows.can_package() || !stream.windows.can_package() {
                // Window pressure: stop the socket until a SENDME.
                if let Some(edge) = stream.edge {
                    if !stream.read_stopped {
                        stream.read_stopped = true;
                        outcomes.push(RelayOutcome::Edge(EdgeAction::SetReadEnabled {
                            edge,
                            enabled: false,
                        }));
                    }
                }
                return Ok(outcomes);
            }
            let take = stream.edge_backlog.len().min(MAX_RELAY_DATA_LEN);
            let chunk: Vec<u8> = stream.edge_backlog.drain(..take).collect();
            chunk
        };
        let msg = RelayMsg::new(RelayCommand::Data, stream_id, chunk);
        let tag = exit_send(circuit, &msg, now)?;
        circuit.windows.note_packaged(tag)?;
        circuit
            .streams
            .get_mut(stream_id)
            .ok_or(VeilError::StreamClosed)?
            .windows
            .note_packaged()?;
    }
}

/// After a window refill, try every stream with a backlog.
fn drain_backlogs(circuit: &mut ForwardingCircuit, now: Instant) -> Result<Vec<RelayOutcome>> {
    let ids = circuit.streams.ids();
    let mut outcomes = Vec::new();
    for id in ids {
        let has_backlog = circuit
            .streams
            .get(id)
            .map_or(false, |s| !s.edge_backlog.is_empty() || s.read_stopped);
        if has_backlog {
            outcomes.extend(drain_stream_backlog(circuit, id, now)?);
        }
    }
    Ok(outcomes)
}

/// Originate a relay cell here, toward the origin.
fn exit_send(
    circuit: &mut ForwardingCircuit,
    msg: &RelayMsg,
    now: Instant,
) -> Result<crate::crypto::SendmeTag> {
    let mut body = msg.encode()?;
    let tag = circuit.layer.originate_back(&mut body);
    let cell = Cell::new(circuit.prev.circ_id, CellBody::Relay(body));
    circuit.outbound_prev.push_back(QueuedCell::new(cell, now));
    Ok(tag)
}

fn exit_send_end(
    circuit: &mut ForwardingCircuit,
    stream_id: StreamId,
    reason: EndReason,
    now: Instant,
) -> Result<()> {
    let msg = RelayMsg::new(RelayCommand::End, stream_id, vec![reason.as_u8()]);
    exit_send(circuit, &msg, now)?;
    Ok(())
}

/// Relay a CREATED2 from the next hop back as EXTENDED2 toward the origin.
pub fn forward_created2_as_extended2(
    circuit: &mut ForwardingCircuit,
    msg: &Created2Msg,
    now: Instant,
) -> Result<()> {
    let payload = Extended2Payload {
        handshake: msg.handshake.clone(),
    };
    let reply = RelayMsg::new(RelayCommand::Extended2, StreamId::CIRCUIT, payload.encode());
    exit_send(circuit, &reply, now)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CircId, DestroyReason};
    use crate::channel::{Channel, ChannelDirection, ChannelHandle, LinkInfo, PaddingTimer};
    use crate::circuit::{ChannelSide, CircuitPurpose, GlobalCircId};
    use crate::crypto::RelayLayerCrypt;
    use crate::provider::{OpenExitPolicy, RejectAllPolicy};
    use crate::util::Arena;
    use std::collections::VecDeque;

    fn handles(n: usize) -> Vec<ChannelHandle> {
        let mut arena: Arena<Channel> = Arena::new();
        (0..n)
            .map(|_| {
                let now = Instant::now();
                arena.insert(Channel::new(
                    &LinkInfo {
                        link_version: 4,
                        peer_identity: None,
                        clock_skew_secs: 0,
                    },
                    "192.0.2.1:9001".parse().unwrap(),
                    ChannelDirection::Outbound,
                    now,
                    PaddingTimer::disabled(now),
                ))
            })
            .collect()
    }

    /// One-hop origin/exit pair sharing seeded keys.
    fn wired_pair() -> (OriginCircuit, ForwardingCircuit) {
        let now = Instant::now();
        let chans = handles(2);
        let seed = KeySeed::from_bytes([7; 32]);

        let mut origin = OriginCircuit::new(
            GlobalCircId(1),
            ChannelSide {
                chan: chans[0],
                circ_id: CircId(0x8000_0009),
            },
            CircuitPurpose::General,
            Vec::new(),
            8,
            now,
        );
        let material = seed.expand();
        origin.crypt_out.add_layer(RelayCrypt::new(&material.forward));
        origin.crypt_in.add_layer(RelayCrypt::new(&material.backward));
        origin.hops.push(HopMeta {
            identity: [1; 32],
            addr: "192.0.2.7:9001".parse().unwrap(),
        });
        origin.state = CircuitState::Open;

        let material = seed.expand();
        let exit = ForwardingCircuit::new(
            ChannelSide {
                chan: chans[1],
                circ_id: CircId(0x8000_0009),
            },
            RelayLayerCrypt::new(
                RelayCrypt::new(&material.forward),
                RelayCrypt::new(&material.backward),
            ),
        );
        (origin, exit)
    }

    fn pop_body(queue: &mut VecDeque<QueuedCell>) -> (RelayCellBody, bool) {
        let queued = queue.pop_front().expect("a queued cell");
        match queued.cell.body {
            CellBody::Relay(body) => (body, false),
            CellBody::RelayEarly(body) => (body, true),
            other => panic!("expected relay cell, got {:?}", other.command()),
        }
    }

    fn config() -> CoreConfig {
        CoreConfig::default()
    }

    #[test]
    fn test_begin_reaches_exit_and_requests_edge() {
        let (mut origin, mut exit) = wired_pair();
        let now = Instant::now();
        let mut rng = rand::thread_rng();

        let stream = origin_begin_stream(&mut origin, "198.51.100.7:80", &config(), &mut rng, now)
            .unwrap();
        let (body, early) = pop_body(&mut origin.outbound);
        assert!(!early);

        let outcomes =
            forwarding_from_prev(&mut exit, body, early, &config(), &OpenExitPolicy, now).unwrap();
        match &outcomes[..] {
            [RelayOutcome::EdgeConnectRequested { stream: s, target }] => {
                assert_eq!(*s, stream);
                assert_eq!(target.port(), 80);
            }
            other => panic!("unexpected outcomes {:?}", other),
        }
        assert_eq!(exit.streams.len(), 1);
    }

    #[test]
    fn test_begin_denied_by_policy_sends_end() {
        let (mut origin, mut exit) = wired_pair();
        let now = Instant::now();
        let mut rng = rand::thread_rng();

        let stream = origin_begin_stream(&mut origin, "198.51.100.7:80", &config(), &mut rng, now)
            .unwrap();
        let (body, early) = pop_body(&mut origin.outbound);
        let outcomes =
            forwarding_from_prev(&mut exit, body, early, &config(), &RejectAllPolicy, now).unwrap();
        assert!(outcomes.is_empty());
        assert_eq!(exit.streams.len(), 0);

        // The END travels back and closes the origin stream
        let (body, _) = pop_body(&mut exit.outbound_prev);
        let outcomes = origin_deliver(&mut origin, body, &config(), now)
            .unwrap()
            .unwrap();
        match &outcomes[..] {
            [RelayOutcome::StreamEnded { stream: s, reason }] => {
                assert_eq!(*s, stream);
                assert_eq!(*reason, EndReason::ExitPolicy);
            }
            other => panic!("unexpected outcomes {:?}", other),
        }
    }

    #[test]
    fn test_connected_and_data_roundtrip() {
        let (mut origin, mut exit) = wired_pair();
        let now = Instant::now();
        let mut rng = rand::thread_rng();

        let stream = origin_begin_stream(&mut origin, "198.51.100.7:80", &config(), &mut rng, now)
            .unwrap();
        let (body, early) = pop_body(&mut origin.outbound);
        forwarding_from_prev(&mut exit, body, early, &config(), &OpenExitPolicy, now).unwrap();

        // Exit: socket connected
        exit_edge_connected(&mut exit, stream, "198.51.100.7".parse().unwrap(), now).unwrap();
        let (body, _) = pop_body(&mut exit.outbound_prev);
        let outcomes = origin_deliver(&mut origin, body, &config(), now)
            .unwrap()
            .unwrap();
        assert!(matches!(
            &outcomes[..],
            [RelayOutcome::StreamConnected { stream: s }] if *s == stream
        ));

        // Client sends request bytes
        let written =
            origin_write(&mut origin, stream, b"GET / HTTP/1.0\r\n", now).unwrap();
        assert_eq!(written, 16);
        assert_eq!(origin.windows.package_window(), 999);

        let (body, early) = pop_body(&mut origin.outbound);
        let outcomes =
            forwarding_from_prev(&mut exit, body, early, &config(), &OpenExitPolicy, now).unwrap();
        assert_eq!(exit.windows.deliver_window(), 999);
        // No edge token attached in this harness, so no Transmit action
        assert!(outcomes.is_empty());

        // Exit: response bytes flow back
        let outcomes = exit_edge_data(&mut exit, stream, b"HTTP/1.0 200 OK\r\n\r\nhello".to_vec(), now)
            .unwrap();
        assert!(outcomes.is_empty());
        assert_eq!(exit.windows.package_window(), 999);

        let (body, _) = pop_body(&mut exit.outbound_prev);
        let outcomes = origin_deliver(&mut origin, body, &config(), now)
            .unwrap()
            .unwrap();
        assert!(matches!(
            &outcomes[..],
            [RelayOutcome::DataReady { stream: s }] if *s == stream
        ));
        assert_eq!(
            origin_read(&mut origin, stream).unwrap(),
            b"HTTP/1.0 200 OK\r\n\r\nhello".to_vec()
        );
        assert_eq!(origin.windows.deliver_window(), 999);
    }

    #[test]
    fn test_stream_cap_gets_resource_limit_end() {
        let (mut origin, mut exit) = wired_pair();
        let now = Instant::now();
        let mut rng = rand::thread_rng();
        let config = CoreConfig::default().with_max_streams_per_circuit(0);

        // The origin-side cap also refuses, so drive the exit directly.
        let stream = origin_begin_stream(
            &mut origin,
            "198.51.100.7:80",
            &CoreConfig::default(),
            &mut rng,
            now,
        )
        .unwrap();
        let (body, early) = pop_body(&mut origin.outbound);
        let outcomes =
            forwarding_from_prev(&mut exit, body, early, &config, &OpenExitPolicy, now).unwrap();
        assert!(outcomes.is_empty());

        let (body, _) = pop_body(&mut exit.outbound_prev);
        let outcomes = origin_deliver(&mut origin, body, &CoreConfig::default(), now)
            .unwrap()
            .unwrap();
        assert!(matches!(
            &outcomes[..],
            [RelayOutcome::StreamEnded { stream: s, reason: EndReason::ResourceLimit }] if *s == stream
        ));
    }

    #[test]
    fn test_relay_early_budget_enforced() {
        let (mut origin, mut exit) = wired_pair();
        let now = Instant::now();
        let config = CoreConfig::default();

        // Lift the origin-side limit so the relay-side check is what trips.
        origin.relay_early_remaining = 100;
        for i in 0..config.relay_early_budget + 1 {
            let msg = RelayMsg::new(RelayCommand::Drop, StreamId::CIRCUIT, Vec::new());
            origin_send(&mut origin, 0, &msg, true, now).unwrap();
            let (body, early) = pop_body(&mut origin.outbound);
            assert!(early);
            let result = forwarding_from_prev(&mut exit, body, early, &config, &OpenExitPolicy, now);
            if i < config.relay_early_budget {
                result.unwrap();
            } else {
                assert!(result.is_err(), "cell past the budget must be refused");
            }
        }
    }

    #[test]
    fn test_extend2_must_be_early() {
        let (mut origin, mut exit) = wired_pair();
        let now = Instant::now();

        // Hand-roll an EXTEND2 sent as plain RELAY
        let payload = Extend2Payload {
            specs: vec![
                LinkSpec::Ipv4("192.0.2.9:9001".parse().unwrap()),
                LinkSpec::Identity([5; 32]),
            ],
            handshake_type: HANDSHAKE_TYPE_NTOR,
            handshake: vec![0; 96],
        };
        let msg = RelayMsg::new(RelayCommand::Extend2, StreamId::CIRCUIT, payload.encode());
        origin_send(&mut origin, 0, &msg, false, now).unwrap();
        let (body, early) = pop_body(&mut origin.outbound);
        assert!(!early);
        assert!(
            forwarding_from_prev(&mut exit, body, early, &config(), &OpenExitPolicy, now).is_err()
        );
    }

    #[test]
    fn test_extend2_early_requests_extension() {
        let (mut origin, mut exit) = wired_pair();
        let now = Instant::now();

        let payload = Extend2Payload {
            specs: vec![
                LinkSpec::Ipv4("192.0.2.9:9001".parse().unwrap()),
                LinkSpec::Identity([5; 32]),
            ],
            handshake_type: HANDSHAKE_TYPE_NTOR,
            handshake: vec![0; 96],
        };
        let msg = RelayMsg::new(RelayCommand::Extend2, StreamId::CIRCUIT, payload.encode());
        origin_send(&mut origin, 0, &msg, true, now).unwrap();
        assert_eq!(origin.relay_early_remaining, 7);

        let (body, early) = pop_body(&mut origin.outbound);
        assert!(early);
        let outcomes =
            forwarding_from_prev(&mut exit, body, early, &config(), &OpenExitPolicy, now).unwrap();
        match &outcomes[..] {
            [RelayOutcome::ExtendRequested(req)] => {
                assert_eq!(req.identity, [5; 32]);
                assert_eq!(req.target.port(), 9001);
            }
            other => panic!("unexpected outcomes {:?}", other),
        }
        // A second EXTEND2 on the same hop is refused
        let msg2 = RelayMsg::new(
            RelayCommand::Extend2,
            StreamId::CIRCUIT,
            Extend2Payload {
                specs: vec![
                    LinkSpec::Ipv4("192.0.2.10:9001".parse().unwrap()),
                    LinkSpec::Identity([6; 32]),
                ],
                handshake_type: HANDSHAKE_TYPE_NTOR,
                handshake: vec![0; 96],
            }
            .encode(),
        );
        origin_send(&mut origin, 0, &msg2, true, now).unwrap();
        let (body, early) = pop_body(&mut origin.outbound);
        assert!(
            forwarding_from_prev(&mut exit, body, early, &config(), &OpenExitPolicy, now).is_err()
        );
    }

    #[test]
    fn test_relay_early_budget_stops_origin_sends() {
        let (mut origin, _) = wired_pair();
        let now = Instant::now();
        origin.relay_early_remaining = 0;
        let msg = RelayMsg::new(RelayCommand::Drop, StreamId::CIRCUIT, Vec::new());
        assert!(origin_send(&mut origin, 0, &msg, true, now).is_err());
    }

    #[test]
    fn test_resolve_stream_roundtrip() {
        let (mut origin, mut exit) = wired_pair();
        let now = Instant::now();
        let mut rng = rand::thread_rng();

        // Hand-roll a RESOLVE from the origin
        let stream_id = origin.streams.open_local(&mut rng, now).unwrap();
        let msg = RelayMsg::new(
            RelayCommand::Resolve,
            stream_id,
            b"example.com\0".to_vec(),
        );
        origin_send(&mut origin, 0, &msg, false, now).unwrap();

        let (body, early) = pop_body(&mut origin.outbound);
        let outcomes =
            forwarding_from_prev(&mut exit, body, early, &config(), &OpenExitPolicy, now).unwrap();
        match &outcomes[..] {
            [RelayOutcome::EdgeResolveRequested {
                stream,
                hostname,
                for_connect,
            }] => {
                assert_eq!(*stream, stream_id);
                assert_eq!(hostname, "example.com");
                assert!(!for_connect);
            }
            other => panic!("unexpected outcomes {:?}", other),
        }

        let answers = vec!["198.51.100.7".parse().unwrap()];
        exit_resolved(&mut exit, stream_id, &answers, &OpenExitPolicy, now).unwrap();
        let (body, _) = pop_body(&mut exit.outbound_prev);
        let outcomes = origin_deliver(&mut origin, body, &config(), now)
            .unwrap()
            .unwrap();
        match &outcomes[..] {
            [RelayOutcome::StreamResolved { stream, payload }] => {
                assert_eq!(*stream, stream_id);
                assert_eq!(payload.answers.len(), 1);
            }
            other => panic!("unexpected outcomes {:?}", other),
        }
    }

    #[test]
    fn test_truncate_drops_next_and_replies() {
        let (mut origin, mut exit) = wired_pair();
        let now = Instant::now();
        let chans = handles(1);
        exit.next = Some(ChannelSide {
            chan: chans[0],
            circ_id: CircId(77),
        });

        let msg = RelayMsg::new(RelayCommand::Truncate, StreamId::CIRCUIT, Vec::new());
        origin_send(&mut origin, 0, &msg, false, now).unwrap();
        let (body, early) = pop_body(&mut origin.outbound);
        let outcomes =
            forwarding_from_prev(&mut exit, body, early, &config(), &OpenExitPolicy, now).unwrap();
        assert!(matches!(&outcomes[..], [RelayOutcome::DropNextSide]));

        let (body, _) = pop_body(&mut exit.outbound_prev);
        let outcomes = origin_deliver(&mut origin, body, &config(), now)
            .unwrap()
            .unwrap();
        assert!(matches!(
            &outcomes[..],
            [RelayOutcome::Truncated { n_hops: 1 }]
        ));
    }

    #[test]
    fn test_end_from_origin_shuts_edge() {
        let (mut origin, mut exit) = wired_pair();
        let now = Instant::now();
        let mut rng = rand::thread_rng();

        let stream = origin_begin_stream(&mut origin, "198.51.100.7:80", &config(), &mut rng, now)
            .unwrap();
        let (body, early) = pop_body(&mut origin.outbound);
        forwarding_from_prev(&mut exit, body, early, &config(), &OpenExitPolicy, now).unwrap();

        // Attach an edge token so the shutdown is observable
        exit.streams.get_mut(stream).unwrap().edge = Some(crate::relay::edge::EdgeId(4));

        origin_close_stream(&mut origin, stream, EndReason::Done, now).unwrap();
        let (body, early) = pop_body(&mut origin.outbound);
        let outcomes =
            forwarding_from_prev(&mut exit, body, early, &config(), &OpenExitPolicy, now).unwrap();
        match &outcomes[..] {
            [RelayOutcome::Edge(EdgeAction::Shutdown { edge, reason })] => {
                assert_eq!(*edge, crate::relay::edge::EdgeId(4));
                assert_eq!(*reason, EndReason::Done);
            }
            other => panic!("unexpected outcomes {:?}", other),
        }
        assert_eq!(exit.streams.len(), 0);
    }

    #[test]
    fn test_destroy_reason_is_not_relay() {
        // Sanity: DestroyReason and EndReason are distinct wire spaces
        assert_ne!(
            DestroyReason::Protocol.as_u8(),
            EndReason::Protocol.as_u8()
        );
    }
}
