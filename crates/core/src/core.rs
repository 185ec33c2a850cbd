//! The `Core` value: single owner of channels, circuits, scheduler,
//! estimator and the worker pool.
//!
//! Every registry lives inside one `Core` rather than in process globals,
//! so tests run several interoperating cores in one process. All methods
//! execute on the owning task; the runtime feeds in decoded cells, edge
//! events and worker completions, drains the action queue, and writes out
//! whatever the scheduler releases.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::cell::relay::{EndReason, StreamId};
use crate::cell::{
    Cell, CellBody, CircId, Create2Msg, CreateFastMsg, Created2Msg, CreatedFastMsg, DestroyReason,
};
use crate::channel::{Channel, ChannelHandle, ChannelRegistry, ChannelInfo};
use crate::circuit::{
    ChannelSide, Circuit, CircuitInfo, CircuitKey, CircuitPurpose, CircuitStore, ForwardingCircuit,
    GlobalCircId, OriginCircuit,
};
use crate::crypto::handshake::KeySeed;
use crate::crypto::{
    CryptoCompletion, CryptoRequest, CryptoToken, CryptoWorkerPool, RelayCrypt, RelayLayerCrypt,
    ResponderKeys, HANDSHAKE_TYPE_NTOR,
};
use crate::provider::{ExitPolicy, HopSpec, IdentityKeystore, PathProvider};
use crate::relay::edge::{EdgeAction, EdgeEvent, EdgeRegistry};
use crate::relay::engine::{self, ExtendRequest, RelayOutcome};
use crate::sched::{ScheduledCell, Scheduler};
use crate::timeout::BuildTimeEstimator;
use veil_common::{CoreConfig, Result, VeilError};

/// Client-visible stream notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamNotice {
    Connected,
    DataReady,
    Ended { reason: EndReason },
    Resolved,
}

/// Work the runtime must perform on the core's behalf.
#[derive(Debug, Clone)]
pub enum CoreAction {
    /// Dial a TCP+TLS connection and run the link handshake.
    OpenChannel { addr: SocketAddr, identity: [u8; 32] },
    /// Tear down a channel's transport.
    CloseChannel { chan: ChannelHandle },
    /// Edge socket / DNS work for exit streams.
    Edge(EdgeAction),
    /// An origin circuit finished building.
    CircuitReady { circuit: GlobalCircId },
    /// An origin circuit is gone.
    CircuitClosed {
        circuit: GlobalCircId,
        reason: DestroyReason,
    },
    /// Something happened on a client stream.
    Stream {
        circuit: GlobalCircId,
        stream: StreamId,
        notice: StreamNotice,
    },
}

/// A circuit launch waiting for its first-hop channel.
struct PendingLaunch {
    global: GlobalCircId,
    purpose: CircuitPurpose,
    path: Vec<HopSpec>,
    use_fast: bool,
    first_identity: [u8; 32],
}

/// An EXTEND waiting for the onward channel.
struct PendingExtend {
    circuit: CircuitKey,
    request: ExtendRequest,
}

/// The relay core. One per node; tests build several.
pub struct Core {
    config: CoreConfig,
    channels: ChannelRegistry,
    circuits: CircuitStore,
    scheduler: Scheduler,
    estimator: BuildTimeEstimator,
    edges: EdgeRegistry<CircuitKey>,
    keystore: Arc<dyn IdentityKeystore>,
    policy: Box<dyn ExitPolicy>,
    path_provider: Box<dyn PathProvider>,
    responder: Arc<ResponderKeys>,
    /// Worker pool for responder handshakes; `None` answers inline (tests,
    /// low-volume clients).
    workers: Option<CryptoWorkerPool>,
    pending_create: HashMap<CryptoToken, (ChannelHandle, CircId)>,
    next_token: u64,
    pending_extends: Vec<PendingExtend>,
    pending_launches: Vec<PendingLaunch>,
    actions: VecDeque<CoreAction>,
    /// Invariant violations survived so far; reported, never fatal.
    bug_count: u64,
}

impl Core {
    pub fn new(
        config: CoreConfig,
        keystore: Arc<dyn IdentityKeystore>,
        policy: Box<dyn ExitPolicy>,
        path_provider: Box<dyn PathProvider>,
        responder: Arc<ResponderKeys>,
    ) -> Self {
        let estimator = BuildTimeEstimator::new(config.circuit_build_timeout_initial());
        Self {
            config,
            channels: ChannelRegistry::new(),
            circuits: CircuitStore::new(),
            scheduler: Scheduler::new(),
            estimator,
            edges: EdgeRegistry::new(),
            keystore,
            policy,
            path_provider,
            responder,
            workers: None,
            pending_create: HashMap::new(),
            next_token: 1,
            pending_extends: Vec::new(),
            pending_launches: Vec::new(),
            actions: VecDeque::new(),
            bug_count: 0,
        }
    }

    /// Attach a worker pool for responder handshakes.
    pub fn with_workers(mut self, n_workers: usize, depth: usize) -> Self {
        self.workers = Some(CryptoWorkerPool::new(
            n_workers,
            depth,
            Arc::clone(&self.responder),
        ));
        self
    }

    pub fn keystore(&self) -> &Arc<dyn IdentityKeystore> {
        &self.keystore
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Accumulated invariant-violation count, for the operator surface.
    pub fn bug_count(&self) -> u64 {
        self.bug_count
    }

    fn note_bug(&mut self, what: &str) {
        self.bug_count += 1;
        warn!(bug = self.bug_count, what, "internal invariant violation");
    }

    /// Drain the pending runtime work.
    pub fn drain_actions(&mut self) -> Vec<CoreAction> {
        self.actions.drain(..).collect()
    }

    // -----------------------------------------------------------------
    // Channel lifecycle

    /// Register a channel whose link handshake has completed.
    pub fn add_channel(&mut self, channel: Channel, now: Instant) -> ChannelHandle {
        let handle = self.channels.add(channel);
        self.on_channel_open(handle, now);
        handle
    }

    /// A channel became usable: satisfy launches and extends waiting on it.
    fn on_channel_open(&mut self, chan: ChannelHandle, now: Instant) {
        let identity = match self.channels.get(chan).and_then(|c| c.peer_identity) {
            Some(id) => id,
            None => return,
        };

        let launches: Vec<PendingLaunch> = {
            let (ready, rest) = self
                .pending_launches
                .drain(..)
                .partition(|p| p.first_identity == identity);
            self.pending_launches = rest;
            ready
        };
        for launch in launches {
            if let Err(e) = self.create_origin_on(
                launch.global,
                chan,
                launch.purpose,
                launch.path,
                launch.use_fast,
                now,
            ) {
                info!(error = %e, "pending circuit launch failed");
                self.actions.push_back(CoreAction::CircuitClosed {
                    circuit: launch.global,
                    reason: DestroyReason::ConnectFailed,
                });
            }
        }

        let extends: Vec<PendingExtend> = {
            let (ready, rest) = self
                .pending_extends
                .drain(..)
                .partition(|p| p.request.identity == identity);
            self.pending_extends = rest;
            ready
        };
        for extend in extends {
            if let Err(e) = self.do_extend(extend.circuit, extend.request, chan, now) {
                info!(error = %e, "pending extension failed");
                self.close_circuit_internal(extend.circuit, DestroyReason::ConnectFailed, None);
            }
        }
    }

    /// The runtime lost a channel's transport.
    pub fn on_channel_lost(&mut self, chan: ChannelHandle, _now: Instant) {
        let closed = self.circuits.on_channel_lost(&mut self.channels, chan);
        for closed_circuit in closed {
            self.finish_close(closed_circuit);
        }
        self.scheduler.forget_channel(chan);
        self.channels.remove(chan);
    }

    /// The runtime refreshed a channel's kernel write-queue depth.
    pub fn set_channel_unacked(&mut self, chan: ChannelHandle, bytes: usize) {
        if let Some(channel) = self.channels.get_mut(chan) {
            channel.unacked_bytes = bytes;
        }
    }

    // -----------------------------------------------------------------
    // Client API

    /// Start building a circuit for `purpose`; the returned id becomes
    /// usable when `CircuitReady` is announced.
    pub fn launch_circuit(
        &mut self,
        purpose: CircuitPurpose,
        use_fast_first_hop: bool,
        now: Instant,
    ) -> Result<GlobalCircId> {
        let path = self.path_provider.next_hops_for(purpose)?;
        let first = path
            .first()
            .cloned()
            .ok_or_else(|| VeilError::internal("path provider returned no hops"))?;
        let global = self.circuits.next_global_id();

        match self.channels.find_by_identity(&first.identity) {
            Some(chan) => {
                self.create_origin_on(global, chan, purpose, path, use_fast_first_hop, now)?;
            }
            None => {
                self.pending_launches.push(PendingLaunch {
                    global,
                    purpose,
                    path,
                    use_fast: use_fast_first_hop,
                    first_identity: first.identity,
                });
                self.actions.push_back(CoreAction::OpenChannel {
                    addr: first.addr,
                    identity: first.identity,
                });
            }
        }
        Ok(global)
    }

    fn create_origin_on(
        &mut self,
        global: GlobalCircId,
        chan: ChannelHandle,
        purpose: CircuitPurpose,
        path: Vec<HopSpec>,
        use_fast: bool,
        now: Instant,
    ) -> Result<CircuitKey> {
        let mut rng = rand::thread_rng();
        let circ_id = self.circuits.alloc_circ_id(&mut rng, &self.channels, chan)?;
        let circuit = OriginCircuit::new(
            global,
            ChannelSide { chan, circ_id },
            purpose,
            path,
            self.config.relay_early_budget,
            now,
        );
        let key = self
            .circuits
            .insert(&mut self.channels, Circuit::Origin(circuit));
        let origin = self
            .circuits
            .get_mut(key)
            .and_then(|c| c.as_origin_mut())
            .ok_or_else(|| VeilError::internal("origin circuit just inserted"))?;
        engine::begin_build(origin, &mut rng, use_fast, now)?;
        Ok(key)
    }

    /// Open a stream over an open origin circuit.
    pub fn open_stream(
        &mut self,
        circuit: GlobalCircId,
        target: &str,
        now: Instant,
    ) -> Result<StreamId> {
        let key = self
            .circuits
            .global_find(circuit)
            .ok_or(VeilError::CircuitClosed)?;
        let mut rng = rand::thread_rng();
        let origin = self
            .circuits
            .get_mut(key)
            .and_then(|c| c.as_origin_mut())
            .ok_or(VeilError::CircuitClosed)?;
        engine::origin_begin_stream(origin, target, &self.config, &mut rng, now)
    }

    /// Package client bytes; returns how many were accepted before a
    /// window closed.
    pub fn write_stream(
        &mut self,
        circuit: GlobalCircId,
        stream: StreamId,
        data: &[u8],
        now: Instant,
    ) -> Result<usize> {
        let key = self
            .circuits
            .global_find(circuit)
            .ok_or(VeilError::CircuitClosed)?;
        let origin = self
            .circuits
            .get_mut(key)
            .and_then(|c| c.as_origin_mut())
            .ok_or(VeilError::CircuitClosed)?;
        engine::origin_write(origin, stream, data, now)
    }

    /// Pull delivered bytes, if any.
    pub fn read_stream(
        &mut self,
        circuit: GlobalCircId,
        stream: StreamId,
    ) -> Result<Option<Vec<u8>>> {
        let key = self
            .circuits
            .global_find(circuit)
            .ok_or(VeilError::CircuitClosed)?;
        let origin = self
            .circuits
            .get_mut(key)
            .and_then(|c| c.as_origin_mut())
            .ok_or(VeilError::CircuitClosed)?;
        Ok(engine::origin_read(origin, stream))
    }

    /// Close a stream from the client side.
    pub fn close_stream(
        &mut self,
        circuit: GlobalCircId,
        stream: StreamId,
        reason: EndReason,
        now: Instant,
    ) -> Result<()> {
        let key = self
            .circuits
            .global_find(circuit)
            .ok_or(VeilError::CircuitClosed)?;
        let origin = self
            .circuits
            .get_mut(key)
            .and_then(|c| c.as_origin_mut())
            .ok_or(VeilError::CircuitClosed)?;
        engine::origin_close_stream(origin, stream, reason, now)
    }

    // -----------------------------------------------------------------
    // Operator API

    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        self.channels.list()
    }

    pub fn list_circuits(&self) -> Vec<CircuitInfo> {
        self.circuits.iter().map(|(_, c)| c.info()).collect()
    }

    /// Close a client circuit by its global id.
    pub fn close_circuit(&mut self, circuit: GlobalCircId, reason: DestroyReason) -> bool {
        match self.circuits.global_find(circuit) {
            Some(key) => {
                self.close_circuit_internal(key, reason, None);
                true
            }
            None => false,
        }
    }

    /// Persisted estimator state.
    pub fn estimator_blob(&self) -> Vec<u8> {
        self.estimator.to_blob()
    }

    /// Restore estimator state saved by a previous run.
    pub fn restore_estimator(&mut self, blob: &[u8]) {
        self.estimator =
            BuildTimeEstimator::from_blob(self.config.circuit_build_timeout_initial(), blob);
    }

    // -----------------------------------------------------------------
    // Inbound cells

    /// Dispatch one decoded cell from an open channel.
    ///
    /// Circuit-scoped failures close the circuit and return `Ok`; an `Err`
    /// is channel-fatal and the caller must drop the transport.
    pub fn handle_cell(&mut self, chan: ChannelHandle, cell: Cell, now: Instant) -> Result<()> {
        cell.check_circ_id()?;
        let padding = matches!(cell.body, CellBody::Padding | CellBody::Vpadding(_));
        match self.channels.get_mut(chan) {
            Some(channel) => channel.note_cell_in(padding, now),
            None => return Err(VeilError::ChannelClosed),
        }

        let circ_id = cell.circ_id;
        match cell.body {
            CellBody::Padding | CellBody::Vpadding(_) => Ok(()),

            CellBody::Versions(_)
            | CellBody::Certs(_)
            | CellBody::AuthChallenge(_)
            | CellBody::Authenticate(_)
            | CellBody::Netinfo(_) => Err(VeilError::protocol(
                "link handshake cell on an open channel",
            )),

            CellBody::Unknown { cmd } => {
                debug!(cmd, "unknown cell command dropped");
                Ok(())
            }

            // Legacy v1 circuit creation is refused, not serviced.
            CellBody::CreateLegacy => {
                self.scheduler.queue_control(
                    chan,
                    Cell::new(circ_id, CellBody::Destroy(DestroyReason::Protocol)),
                );
                Ok(())
            }

            CellBody::Create2(msg) => self.handle_create2(chan, circ_id, msg, now),
            CellBody::CreateFast(msg) => self.handle_create_fast(chan, circ_id, msg, now),
            CellBody::Created2(msg) => self.handle_created2(chan, circ_id, msg, now),
            CellBody::CreatedFast(msg) => self.handle_created_fast(chan, circ_id, msg, now),
            CellBody::Relay(body) => self.handle_relay(chan, circ_id, body, false, now),
            CellBody::RelayEarly(body) => self.handle_relay(chan, circ_id, body, true, now),
            CellBody::Destroy(reason) => self.handle_destroy(chan, circ_id, reason, now),
        }
    }

    fn handle_create2(
        &mut self,
        chan: ChannelHandle,
        circ_id: CircId,
        msg: Create2Msg,
        now: Instant,
    ) -> Result<()> {
        if self.circuits.find(chan, circ_id).is_some() {
            info!(%circ_id, "CREATE2 on an id already in use");
            self.scheduler.queue_control(
                chan,
                Cell::new(circ_id, CellBody::Destroy(DestroyReason::Protocol)),
            );
            return Ok(());
        }
        if msg.handshake_type != HANDSHAKE_TYPE_NTOR {
            self.scheduler.queue_control(
                chan,
                Cell::new(circ_id, CellBody::Destroy(DestroyReason::Protocol)),
            );
            return Ok(());
        }

        match &self.workers {
            Some(pool) => {
                let token = CryptoToken(self.next_token);
                self.next_token += 1;
                let submitted = pool.submit(CryptoRequest {
                    token,
                    onionskin: msg.handshake,
                });
                match submitted {
                    Ok(()) => {
                        self.pending_create.insert(token, (chan, circ_id));
                    }
                    Err(_) => {
                        self.scheduler.queue_control(
                            chan,
                            Cell::new(circ_id, CellBody::Destroy(DestroyReason::ResourceLimit)),
                        );
                    }
                }
                Ok(())
            }
            None => {
                let mut rng = rand::thread_rng();
                match crate::crypto::respond(&mut rng, &self.responder, &msg.handshake) {
                    Ok((reply, seed)) => {
                        self.install_forwarding(chan, circ_id, seed, reply, now);
                        Ok(())
                    }
                    Err(e) => {
                        info!(error = %e, "CREATE2 handshake refused");
                        self.scheduler.queue_control(
                            chan,
                            Cell::new(circ_id, CellBody::Destroy(DestroyReason::Protocol)),
                        );
                        Ok(())
                    }
                }
            }
        }
    }

    /// A worker finished a responder handshake.
    pub fn handle_crypto_completion(&mut self, completion: CryptoCompletion, now: Instant) {
        let (chan, circ_id) = match self.pending_create.remove(&completion.token) {
            Some(found) => found,
            // The circuit or channel died while the worker ran.
            None => return,
        };
        if self.channels.get(chan).map_or(true, |c| !c.is_open()) {
            return;
        }
        match completion.result {
            Ok((reply, seed)) => self.install_forwarding(chan, circ_id, seed, reply, now),
            Err(e) => {
                info!(error = %e, "CREATE2 handshake refused");
                self.scheduler.queue_control(
                    chan,
                    Cell::new(circ_id, CellBody::Destroy(DestroyReason::Protocol)),
                );
            }
        }
    }

    /// Poll the worker pool's completion queue.
    pub fn pump_crypto_completions(&mut self, now: Instant) {
        loop {
            let completion = match &self.workers {
                Some(pool) => pool.try_recv(),
                None => None,
            };
            match completion {
                Some(c) => self.handle_crypto_completion(c, now),
                None => break,
            }
        }
    }

    fn handle_create_fast(
        &mut self,
        chan: ChannelHandle,
        circ_id: CircId,
        msg: CreateFastMsg,
        now: Instant,
    ) -> Result<()> {
        if self.circuits.find(chan, circ_id).is_some() {
            self.scheduler.queue_control(
                chan,
                Cell::new(circ_id, CellBody::Destroy(DestroyReason::Protocol)),
            );
            return Ok(());
        }
        let mut rng = rand::thread_rng();
        let (reply, seed) = crate::crypto::fast_respond(&mut rng, &msg);
        let material = seed.expand();
        let layer = RelayLayerCrypt::new(
            RelayCrypt::new(&material.forward),
            RelayCrypt::new(&material.backward),
        );
        let mut circuit = ForwardingCircuit::new(ChannelSide { chan, circ_id }, layer);
        circuit.allow_extend = false;
        let key = self
            .circuits
            .insert(&mut self.channels, Circuit::Forwarding(circuit));
        if let Some(circuit) = self.circuits.get_mut(key) {
            circuit.enqueue(chan, Cell::new(circ_id, CellBody::CreatedFast(reply)), now);
        }
        Ok(())
    }

    fn install_forwarding(
        &mut self,
        chan: ChannelHandle,
        circ_id: CircId,
        seed: KeySeed,
        reply: Vec<u8>,
        now: Instant,
    ) {
        let material = seed.expand();
        let layer = RelayLayerCrypt::new(
            RelayCrypt::new(&material.forward),
            RelayCrypt::new(&material.backward),
        );
        let circuit = ForwardingCircuit::new(ChannelSide { chan, circ_id }, layer);
        let key = self
            .circuits
            .insert(&mut self.channels, Circuit::Forwarding(circuit));
        if let Some(circuit) = self.circuits.get_mut(key) {
            circuit.enqueue(
                chan,
                Cell::new(circ_id, CellBody::Created2(Created2Msg::new(reply))),
                now,
            );
        }
    }

    fn handle_created2(
        &mut self,
        chan: ChannelHandle,
        circ_id: CircId,
        msg: Created2Msg,
        now: Instant,
    ) -> Result<()> {
        let key = match self.circuits.find(chan, circ_id) {
            Some(key) => key,
            None => return self.unknown_circuit(chan, circ_id),
        };
        let is_origin = self.circuits.get(key).map_or(false, |c| c.is_origin());
        if is_origin {
            let mut rng = rand::thread_rng();
            let origin = self
                .circuits
                .get_mut(key)
                .and_then(|c| c.as_origin_mut())
                .expect("checked origin above");
            match engine::handle_created2(origin, &msg, &mut rng, now) {
                Ok(outcomes) => {
                    self.process_origin_outcomes(key, outcomes, now);
                    Ok(())
                }
                Err(e) => {
                    info!(error = %e, "circuit build failed");
                    self.close_circuit_internal(key, DestroyReason::Protocol, None);
                    Ok(())
                }
            }
        } else {
            // CREATED2 from the next hop completes a relayed extension.
            let from_next = self
                .circuits
                .get_mut(key)
                .and_then(|c| c.as_forwarding_mut())
                .map_or(false, |f| f.next.map_or(false, |n| n.chan == chan));
            if !from_next {
                self.close_circuit_internal(key, DestroyReason::Protocol, None);
                return Ok(());
            }
            let fwd = self
                .circuits
                .get_mut(key)
                .and_then(|c| c.as_forwarding_mut())
                .expect("checked forwarding above");
            if let Err(e) = engine::forward_created2_as_extended2(fwd, &msg, now) {
                info!(error = %e, "relaying CREATED2 failed");
                self.close_circuit_internal(key, DestroyReason::Internal, None);
            }
            Ok(())
        }
    }

    fn handle_created_fast(
        &mut self,
        chan: ChannelHandle,
        circ_id: CircId,
        msg: CreatedFastMsg,
        now: Instant,
    ) -> Result<()> {
        let key = match self.circuits.find(chan, circ_id) {
            Some(key) => key,
            None => return self.unknown_circuit(chan, circ_id),
        };
        let mut rng = rand::thread_rng();
        match self.circuits.get_mut(key).and_then(|c| c.as_origin_mut()) {
            Some(origin) => match engine::handle_created_fast(origin, &msg, &mut rng, now) {
                Ok(outcomes) => {
                    self.process_origin_outcomes(key, outcomes, now);
                    Ok(())
                }
                Err(e) => {
                    info!(error = %e, "circuit build failed");
                    self.close_circuit_internal(key, DestroyReason::Protocol, None);
                    Ok(())
                }
            },
            None => {
                self.close_circuit_internal(key, DestroyReason::Protocol, None);
                Ok(())
            }
        }
    }

    fn handle_relay(
        &mut self,
        chan: ChannelHandle,
        circ_id: CircId,
        body: crate::cell::RelayCellBody,
        early: bool,
        now: Instant,
    ) -> Result<()> {
        let key = match self.circuits.find(chan, circ_id) {
            Some(key) => key,
            None => return self.unknown_circuit(chan, circ_id),
        };

        enum Kind {
            Origin,
            FromPrev,
            FromNext,
        }
        let kind = {
            let circuit = match self.circuits.get_mut(key) {
                Some(c) => c,
                None => return Ok(()),
            };
            match circuit {
                Circuit::Origin(_) => Kind::Origin,
                Circuit::Forwarding(f) => {
                    if f.prev.chan == chan && f.prev.circ_id == circ_id {
                        Kind::FromPrev
                    } else {
                        Kind::FromNext
                    }
                }
            }
        };

        match kind {
            Kind::Origin => {
                if early {
                    info!("RELAY_EARLY arriving at origin");
                    self.close_circuit_internal(key, DestroyReason::Protocol, None);
                    return Ok(());
                }
                let origin = self
                    .circuits
                    .get_mut(key)
                    .and_then(|c| c.as_origin_mut())
                    .expect("origin checked above");
                match engine::origin_deliver(origin, body, &self.config, now) {
                    Ok(Some(outcomes)) => self.process_origin_outcomes(key, outcomes, now),
                    Ok(None) => {}
                    Err(e) => {
                        info!(error = %e, "relay cell processing failed at origin");
                        self.close_circuit_internal(key, DestroyReason::Protocol, None);
                    }
                }
            }
            Kind::FromPrev => {
                let result = {
                    let fwd = self
                        .circuits
                        .get_mut(key)
                        .and_then(|c| c.as_forwarding_mut())
                        .expect("forwarding checked above");
                    engine::forwarding_from_prev(
                        fwd,
                        body,
                        early,
                        &self.config,
                        self.policy.as_ref(),
                        now,
                    )
                };
                match result {
                    Ok(outcomes) => self.process_exit_outcomes(key, outcomes, now),
                    Err(e) => {
                        info!(error = %e, "relay cell processing failed");
                        self.close_circuit_internal(key, DestroyReason::Protocol, None);
                    }
                }
            }
            Kind::FromNext => {
                if early {
                    info!("RELAY_EARLY flowing backward");
                    self.close_circuit_internal(key, DestroyReason::Protocol, None);
                    return Ok(());
                }
                let fwd = self
                    .circuits
                    .get_mut(key)
                    .and_then(|c| c.as_forwarding_mut())
                    .expect("forwarding checked above");
                if let Err(e) = engine::forwarding_from_next(fwd, body, now) {
                    info!(error = %e, "backward relay failed");
                    self.close_circuit_internal(key, DestroyReason::Internal, None);
                }
            }
        }
        Ok(())
    }

    fn handle_destroy(
        &mut self,
        chan: ChannelHandle,
        circ_id: CircId,
        reason: DestroyReason,
        _now: Instant,
    ) -> Result<()> {
        match self.circuits.find(chan, circ_id) {
            Some(key) => {
                debug!(%circ_id, ?reason, "DESTROY received");
                self.close_circuit_internal(key, reason, Some(chan));
            }
            None => {
                // Either our own teardown racing theirs, or noise.
                self.circuits.absorb_half_closed(chan, circ_id);
            }
        }
        Ok(())
    }

    /// A cell for an id we know nothing about: answer one DESTROY and drop.
    fn unknown_circuit(&mut self, chan: ChannelHandle, circ_id: CircId) -> Result<()> {
        if self.circuits.absorb_half_closed(chan, circ_id) {
            return Ok(());
        }
        debug!(%circ_id, "cell on unknown circuit id");
        self.scheduler.queue_control(
            chan,
            Cell::new(circ_id, CellBody::Destroy(DestroyReason::None)),
        );
        Ok(())
    }

    // -----------------------------------------------------------------
    // Outcome processing

    fn process_origin_outcomes(
        &mut self,
        key: CircuitKey,
        outcomes: Vec<RelayOutcome>,
        now: Instant,
    ) {
        let (global, build_started) = match self.circuits.get(key).and_then(|c| c.as_origin()) {
            Some(origin) => (origin.global_id, origin.build_started),
            None => return,
        };
        for outcome in outcomes {
            match outcome {
                RelayOutcome::DataReady { stream } => {
                    self.actions.push_back(CoreAction::Stream {
                        circuit: global,
                        stream,
                        notice: StreamNotice::DataReady,
                    });
                }
                RelayOutcome::StreamConnected { stream } => {
                    self.actions.push_back(CoreAction::Stream {
                        circuit: global,
                        stream,
                        notice: StreamNotice::Connected,
                    });
                }
                RelayOutcome::StreamEnded { stream, reason } => {
                    self.actions.push_back(CoreAction::Stream {
                        circuit: global,
                        stream,
                        notice: StreamNotice::Ended { reason },
                    });
                }
                RelayOutcome::StreamResolved { stream, .. } => {
                    self.actions.push_back(CoreAction::Stream {
                        circuit: global,
                        stream,
                        notice: StreamNotice::Resolved,
                    });
                }
                RelayOutcome::BuildComplete => {
                    self.estimator.note_build_time(now.duration_since(build_started));
                    self.actions
                        .push_back(CoreAction::CircuitReady { circuit: global });
                }
                RelayOutcome::BuildProgressed | RelayOutcome::Truncated { .. } => {}
                other => {
                    self.note_bug("exit outcome on an origin circuit");
                    debug!(?other, "ignored outcome");
                }
            }
        }
    }

    fn process_exit_outcomes(&mut self, key: CircuitKey, outcomes: Vec<RelayOutcome>, now: Instant) {
        for outcome in outcomes {
            match outcome {
                RelayOutcome::EdgeConnectRequested { stream, target } => {
                    let edge = self.edges.register(key, stream);
                    if let Some(s) = self
                        .circuits
                        .get_mut(key)
                        .and_then(|c| c.as_forwarding_mut())
                        .and_then(|f| f.streams.get_mut(stream))
                    {
                        s.edge = Some(edge);
                    }
                    self.actions
                        .push_back(CoreAction::Edge(EdgeAction::Connect { edge, target }));
                }
                RelayOutcome::EdgeResolveRequested {
                    stream, hostname, ..
                } => {
                    let existing = self
                        .circuits
                        .get_mut(key)
                        .and_then(|c| c.as_forwarding_mut())
                        .and_then(|f| f.streams.get(stream))
                        .and_then(|s| s.edge);
                    let edge = match existing {
                        Some(edge) => edge,
                        None => {
                            let edge = self.edges.register(key, stream);
                            if let Some(s) = self
                                .circuits
                                .get_mut(key)
                                .and_then(|c| c.as_forwarding_mut())
                                .and_then(|f| f.streams.get_mut(stream))
                            {
                                s.edge = Some(edge);
                            }
                            edge
                        }
                    };
                    self.actions
                        .push_back(CoreAction::Edge(EdgeAction::Resolve { edge, hostname }));
                }
                RelayOutcome::Edge(action) => {
                    self.actions.push_back(CoreAction::Edge(action));
                }
                RelayOutcome::ExtendRequested(request) => {
                    self.start_extend(key, request, now);
                }
                RelayOutcome::DropNextSide => {
                    if let Some(side) = self.circuits.detach_next(&mut self.channels, key) {
                        self.scheduler.queue_control(
                            side.chan,
                            Cell::new(side.circ_id, CellBody::Destroy(DestroyReason::Requested)),
                        );
                    }
                }
                other => {
                    self.note_bug("origin outcome on a forwarding circuit");
                    debug!(?other, "ignored outcome");
                }
            }
        }
    }

    fn start_extend(&mut self, key: CircuitKey, request: ExtendRequest, now: Instant) {
        if request.handshake_type != HANDSHAKE_TYPE_NTOR {
            self.close_circuit_internal(key, DestroyReason::Protocol, None);
            return;
        }
        match self.channels.find_by_identity(&request.identity) {
            Some(chan) => {
                if let Err(e) = self.do_extend(key, request, chan, now) {
                    info!(error = %e, "extension failed");
                    self.close_circuit_internal(key, DestroyReason::ConnectFailed, None);
                }
            }
            None => {
                let addr = SocketAddr::V4(request.target);
                let identity = request.identity;
                self.pending_extends.push(PendingExtend {
                    circuit: key,
                    request,
                });
                self.actions
                    .push_back(CoreAction::OpenChannel { addr, identity });
            }
        }
    }

    fn do_extend(
        &mut self,
        key: CircuitKey,
        request: ExtendRequest,
        chan: ChannelHandle,
        now: Instant,
    ) -> Result<()> {
        let mut rng = rand::thread_rng();
        let circ_id = self.circuits.alloc_circ_id(&mut rng, &self.channels, chan)?;
        let side = ChannelSide { chan, circ_id };
        self.circuits
            .attach_next(&mut self.channels, key, side)?;
        let circuit = self
            .circuits
            .get_mut(key)
            .ok_or(VeilError::CircuitClosed)?;
        circuit.enqueue(
            chan,
            Cell::new(
                circ_id,
                CellBody::Create2(Create2Msg::new(request.handshake_type, request.handshake)),
            ),
            now,
        );
        Ok(())
    }

    // -----------------------------------------------------------------
    // Edge events

    /// Feed back the result of edge socket / DNS work.
    pub fn handle_edge_event(&mut self, event: EdgeEvent, now: Instant) {
        match event {
            EdgeEvent::Connected { edge, peer } => {
                let Some(owner) = self.edges.owner(edge) else { return };
                let result = self
                    .circuits
                    .get_mut(owner.circuit)
                    .and_then(|c| c.as_forwarding_mut())
                    .map(|f| engine::exit_edge_connected(f, owner.stream, peer, now));
                if let Some(Ok(outcomes)) = result {
                    self.process_exit_outcomes(owner.circuit, outcomes, now);
                }
            }
            EdgeEvent::ConnectFailed { edge, reason } => {
                let Some(owner) = self.edges.release(edge) else { return };
                if let Some(f) = self
                    .circuits
                    .get_mut(owner.circuit)
                    .and_then(|c| c.as_forwarding_mut())
                {
                    let _ = engine::exit_edge_connect_failed(f, owner.stream, reason, now);
                }
            }
            EdgeEvent::Data { edge, data } => {
                let Some(owner) = self.edges.owner(edge) else { return };
                let result = self
                    .circuits
                    .get_mut(owner.circuit)
                    .and_then(|c| c.as_forwarding_mut())
                    .map(|f| engine::exit_edge_data(f, owner.stream, data, now));
                match result {
                    Some(Ok(outcomes)) => self.process_exit_outcomes(owner.circuit, outcomes, now),
                    Some(Err(e)) => {
                        info!(error = %e, "edge data failed");
                        self.close_circuit_internal(
                            owner.circuit,
                            DestroyReason::Internal,
                            None,
                        );
                    }
                    None => {}
                }
            }
            EdgeEvent::Closed { edge, reason } => {
                let Some(owner) = self.edges.release(edge) else { return };
                if let Some(f) = self
                    .circuits
                    .get_mut(owner.circuit)
                    .and_then(|c| c.as_forwarding_mut())
                {
                    let _ = engine::exit_edge_closed(f, owner.stream, reason, now);
                }
            }
            EdgeEvent::Resolved { edge, answers } => {
                let Some(owner) = self.edges.owner(edge) else { return };
                let result = self
                    .circuits
                    .get_mut(owner.circuit)
                    .and_then(|c| c.as_forwarding_mut())
                    .map(|f| engine::exit_resolved(f, owner.stream, &answers, self.policy.as_ref(), now));
                if let Some(Ok(outcomes)) = result {
                    self.process_exit_outcomes(owner.circuit, outcomes, now);
                }
                // A pure RESOLVE stream is gone once answered.
                let stream_gone = self
                    .circuits
                    .get_mut(owner.circuit)
                    .and_then(|c| c.as_forwarding_mut())
                    .map_or(true, |f| f.streams.get(owner.stream).is_none());
                if stream_gone {
                    self.edges.release(edge);
                }
            }
            EdgeEvent::ResolveFailed { edge, transient } => {
                let Some(owner) = self.edges.release(edge) else { return };
                if let Some(f) = self
                    .circuits
                    .get_mut(owner.circuit)
                    .and_then(|c| c.as_forwarding_mut())
                {
                    let _ = engine::exit_resolve_failed(f, owner.stream, transient, now);
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Teardown and timers

    fn close_circuit_internal(
        &mut self,
        key: CircuitKey,
        reason: DestroyReason,
        exclude_chan: Option<ChannelHandle>,
    ) {
        let closed = match self
            .circuits
            .close(&mut self.channels, key, reason, exclude_chan)
        {
            Some(closed) => closed,
            None => return,
        };
        self.scheduler.forget_circuit(key);
        for side in &closed.destroys {
            self.scheduler.queue_control(
                side.chan,
                Cell::new(side.circ_id, CellBody::Destroy(reason)),
            );
        }
        self.finish_close(closed);
    }

    fn finish_close(&mut self, mut closed: crate::circuit::ClosedCircuit) {
        match &mut closed.circuit {
            Circuit::Origin(origin) => {
                for stream in origin.streams.detach_all() {
                    if !stream.is_closed() {
                        self.actions.push_back(CoreAction::Stream {
                            circuit: origin.global_id,
                            stream: stream.id,
                            notice: StreamNotice::Ended {
                                reason: EndReason::Destroy,
                            },
                        });
                    }
                }
                self.actions.push_back(CoreAction::CircuitClosed {
                    circuit: origin.global_id,
                    reason: closed.reason,
                });
            }
            Circuit::Forwarding(fwd) => {
                for stream in fwd.streams.detach_all() {
                    if let Some(edge) = stream.edge {
                        self.edges.release(edge);
                        self.actions.push_back(CoreAction::Edge(EdgeAction::Shutdown {
                            edge,
                            reason: EndReason::Destroy,
                        }));
                    }
                }
            }
        }
    }

    /// Periodic maintenance plus one scheduler pass. The runtime calls
    /// this on timer ticks and whenever new cells were queued.
    pub fn tick(&mut self, now: Instant) -> Vec<ScheduledCell> {
        self.pump_crypto_completions(now);
        self.expire_idle_channels(now);
        self.expire_stream_attaches(now);
        self.expire_builds(now);
        self.shed_queue_memory();
        let mut rng = rand::thread_rng();
        self.scheduler.tick(
            &mut self.channels,
            &mut self.circuits,
            &self.config,
            now,
            &mut rng,
        )
    }

    fn expire_idle_channels(&mut self, now: Instant) {
        let grace = self.config.channel_idle_timeout();
        for chan in self.channels.idle_expired(now, grace) {
            if self.scheduler.has_control_pending(chan) {
                continue;
            }
            info!("closing idle channel");
            self.scheduler.forget_channel(chan);
            self.channels.remove(chan);
            self.actions.push_back(CoreAction::CloseChannel { chan });
        }
    }

    fn expire_stream_attaches(&mut self, now: Instant) {
        let timeout = self.config.stream_attach_timeout();
        for key in self.circuits.handles() {
            let Some(origin) = self.circuits.get_mut(key).and_then(|c| c.as_origin_mut()) else {
                continue;
            };
            let global = origin.global_id;
            let expired: Vec<StreamId> = origin
                .streams
                .iter()
                .filter(|s| s.attach_expired(now, timeout))
                .map(|s| s.id)
                .collect();
            for stream_id in expired {
                let _ = engine::origin_close_stream(origin, stream_id, EndReason::Timeout, now);
                if let Some(stream) = origin.streams.get_mut(stream_id) {
                    stream.close(EndReason::Timeout);
                }
                self.actions.push_back(CoreAction::Stream {
                    circuit: global,
                    stream: stream_id,
                    notice: StreamNotice::Ended {
                        reason: EndReason::Timeout,
                    },
                });
            }
        }
    }

    fn expire_builds(&mut self, now: Instant) {
        let timeout = self.estimator.current_timeout();
        let expired: Vec<CircuitKey> = self
            .circuits
            .iter()
            .filter_map(|(key, circuit)| {
                let origin = circuit.as_origin()?;
                (origin.state == crate::circuit::CircuitState::Building
                    && now.duration_since(origin.build_started) >= timeout)
                    .then_some(key)
            })
            .collect();
        for key in expired {
            info!("circuit build timed out");
            self.close_circuit_internal(key, DestroyReason::Timeout, None);
        }
    }

    fn shed_queue_memory(&mut self) {
        let ceiling = self.config.total_queue_ceiling_bytes;
        let victims = self.circuits.shed_victims(ceiling);
        for key in victims {
            info!("shedding circuit over queue ceiling");
            self.close_circuit_internal(key, DestroyReason::ResourceLimit, None);
        }
    }

    // -----------------------------------------------------------------
    // Test and harness access

    /// The channel registry, for runtimes that need direct inspection.
    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut ChannelRegistry {
        &mut self.channels
    }

    /// The circuit store, exposed for harnesses and tests.
    pub fn circuits(&self) -> &CircuitStore {
        &self.circuits
    }

    pub fn circuits_mut(&mut self) -> &mut CircuitStore {
        &mut self.circuits
    }

    /// Both registries at once, for harnesses that wire circuits by hand.
    pub fn circuits_and_channels_mut(&mut self) -> (&mut CircuitStore, &mut ChannelRegistry) {
        (&mut self.circuits, &mut self.channels)
    }

    /// Direct access to the build-time estimator, for persistence and
    /// harnesses.
    pub fn estimator_mut(&mut self) -> &mut BuildTimeEstimator {
        &mut self.estimator
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("channels", &self.channels.len())
            .field("circuits", &self.circuits.len())
            .field("bug_count", &self.bug_count)
            .finish()
    }
}
