//! The daemon's event loop around a [`Core`].
//!
//! The core is a synchronous state machine owned by exactly one task: this
//! runtime. Connection tasks decode cells and push them in over a channel;
//! edge tasks push socket and DNS results; the API pushes commands. After
//! every batch of input the runtime ticks the core, encodes whatever the
//! scheduler released, and performs the queued actions.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::BytesMut;
use rand::SeedableRng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use veil_common::{now_unix, TargetAddr};
use veil_core::cell::relay::EndReason;
use veil_core::cell::{Cell, CellCodec};
use veil_core::channel::{
    Channel, ChannelDirection, ChannelHandle, ChannelInfo, HandshakeRole, LinkContext,
    LinkHandshake, LinkInfo, PaddingTimer,
};
use veil_core::circuit::CircuitInfo;
use veil_core::relay::{EdgeAction, EdgeEvent, EdgeId};
use veil_core::{Core, CoreAction, DestroyReason, GlobalCircId, IdentityKeystore, Resolver};

use crate::tls::TlsContext;

/// How often the core ticks with no other input.
const TICK_INTERVAL: Duration = Duration::from_millis(20);

/// Operator commands served by the owning task.
pub enum CoreCommand {
    ListChannels(oneshot::Sender<Vec<ChannelInfo>>),
    ListCircuits(oneshot::Sender<Vec<CircuitInfo>>),
    CloseCircuit {
        id: u64,
        reply: oneshot::Sender<bool>,
    },
    Status(oneshot::Sender<StatusSnapshot>),
    /// Snapshot of the estimator's persisted form.
    EstimatorBlob(oneshot::Sender<Vec<u8>>),
}

/// Operator status summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub identity: String,
    pub channels: usize,
    pub circuits: usize,
    pub bug_count: u64,
}

/// Cloneable handle for querying the runtime from other tasks.
#[derive(Clone)]
pub struct CoreHandle {
    tx: mpsc::UnboundedSender<CoreCommand>,
}

impl CoreHandle {
    pub async fn list_channels(&self) -> Vec<ChannelInfo> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(CoreCommand::ListChannels(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn list_circuits(&self) -> Vec<CircuitInfo> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(CoreCommand::ListCircuits(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn close_circuit(&self, id: u64) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(CoreCommand::CloseCircuit { id, reply: tx })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn status(&self) -> Option<StatusSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(CoreCommand::Status(tx)).ok()?;
        rx.await.ok()
    }

    pub async fn estimator_blob(&self) -> Option<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(CoreCommand::EstimatorBlob(tx)).ok()?;
        rx.await.ok()
    }
}

/// Input events from connection and edge tasks.
enum RuntimeEvent {
    ChannelUp {
        info: LinkInfo,
        addr: SocketAddr,
        direction: ChannelDirection,
        writer: mpsc::UnboundedSender<Vec<u8>>,
        link_version: u16,
        handle_tx: oneshot::Sender<ChannelHandle>,
    },
    Cells {
        chan: ChannelHandle,
        cells: Vec<Cell>,
    },
    ChannelDown {
        chan: ChannelHandle,
    },
    Edge(EdgeEvent),
}

/// Per-channel outbound state.
struct ChannelWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    codec: CellCodec,
}

/// Per-edge outbound state.
struct EdgeWriter {
    data_tx: mpsc::UnboundedSender<Vec<u8>>,
    read_enabled: watch::Sender<bool>,
}

/// Owns the [`Core`] and drives it from tokio.
pub struct Runtime {
    core: Core,
    tls: TlsContext,
    keystore: Arc<dyn IdentityKeystore>,
    resolver: Arc<dyn Resolver>,
    my_addrs: Vec<IpAddr>,
    events_tx: mpsc::UnboundedSender<RuntimeEvent>,
    events_rx: mpsc::UnboundedReceiver<RuntimeEvent>,
    commands_rx: mpsc::UnboundedReceiver<CoreCommand>,
    writers: HashMap<ChannelHandle, ChannelWriter>,
    edges: HashMap<EdgeId, EdgeWriter>,
}

impl Runtime {
    pub fn new(
        core: Core,
        tls: TlsContext,
        keystore: Arc<dyn IdentityKeystore>,
        resolver: Arc<dyn Resolver>,
        my_addrs: Vec<IpAddr>,
    ) -> (Self, CoreHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        (
            Self {
                core,
                tls,
                keystore,
                resolver,
                my_addrs,
                events_tx,
                events_rx,
                commands_rx,
                writers: HashMap::new(),
                edges: HashMap::new(),
            },
            CoreHandle { tx: commands_tx },
        )
    }

    /// Accept loop plus the core event loop; runs until the listener dies.
    pub async fn run(mut self, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "relay listening");
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "inbound connection");
                    self.spawn_connection(stream, peer, HandshakeRole::Responder);
                }
                Some(event) = self.events_rx.recv() => {
                    self.on_event(event);
                }
                Some(command) = self.commands_rx.recv() => {
                    self.on_command(command);
                }
                _ = ticker.tick() => {}
            }
            self.pump();
        }
    }

    fn on_event(&mut self, event: RuntimeEvent) {
        let now = Instant::now();
        match event {
            RuntimeEvent::ChannelUp {
                info,
                addr,
                direction,
                writer,
                link_version,
                handle_tx,
            } => {
                let mut rng = rand::thread_rng();
                let channel = Channel::new(
                    &info,
                    addr,
                    direction,
                    now,
                    PaddingTimer::new(now, &mut rng),
                );
                let handle = self.core.add_channel(channel, now);
                self.writers.insert(
                    handle,
                    ChannelWriter {
                        tx: writer,
                        codec: CellCodec::with_link_version(link_version),
                    },
                );
                let _ = handle_tx.send(handle);
            }
            RuntimeEvent::Cells { chan, cells } => {
                for cell in cells {
                    if let Err(e) = self.core.handle_cell(chan, cell, now) {
                        info!(error = %e, "channel-fatal cell; dropping channel");
                        self.core.on_channel_lost(chan, now);
                        self.writers.remove(&chan);
                        break;
                    }
                }
            }
            RuntimeEvent::ChannelDown { chan } => {
                self.core.on_channel_lost(chan, now);
                self.writers.remove(&chan);
            }
            RuntimeEvent::Edge(event) => {
                self.core.handle_edge_event(event, now);
            }
        }
    }

    fn on_command(&mut self, command: CoreCommand) {
        match command {
            CoreCommand::ListChannels(reply) => {
                let _ = reply.send(self.core.list_channels());
            }
            CoreCommand::ListCircuits(reply) => {
                let _ = reply.send(self.core.list_circuits());
            }
            CoreCommand::CloseCircuit { id, reply } => {
                let closed = self
                    .core
                    .close_circuit(GlobalCircId(id), DestroyReason::Requested);
                let _ = reply.send(closed);
            }
            CoreCommand::Status(reply) => {
                let _ = reply.send(StatusSnapshot {
                    identity: hex::encode(self.keystore.my_identity_digest()),
                    channels: self.core.list_channels().len(),
                    circuits: self.core.list_circuits().len(),
                    bug_count: self.core.bug_count(),
                });
            }
            CoreCommand::EstimatorBlob(reply) => {
                let _ = reply.send(self.core.estimator_blob());
            }
        }
    }

    /// Tick the core, flush scheduled cells, perform queued actions.
    fn pump(&mut self) {
        let now = Instant::now();
        for scheduled in self.core.tick(now) {
            let Some(writer) = self.writers.get_mut(&scheduled.chan) else {
                continue;
            };
            let mut buf = BytesMut::new();
            match writer.codec.encode(&scheduled.cell, &mut buf) {
                Ok(()) => {
                    if writer.tx.send(buf.to_vec()).is_err() {
                        let chan = scheduled.chan;
                        self.core.on_channel_lost(chan, now);
                        self.writers.remove(&chan);
                    }
                }
                Err(e) => warn!(error = %e, "cell encoding failed"),
            }
        }

        for action in self.core.drain_actions() {
            match action {
                CoreAction::OpenChannel { addr, identity } => {
                    self.spawn_dial(addr, identity);
                }
                CoreAction::CloseChannel { chan } => {
                    self.writers.remove(&chan);
                }
                CoreAction::Edge(edge_action) => self.perform_edge_action(edge_action),
                CoreAction::CircuitReady { circuit } => {
                    debug!(%circuit, "circuit ready");
                }
                CoreAction::CircuitClosed { circuit, reason } => {
                    debug!(%circuit, ?reason, "circuit closed");
                }
                CoreAction::Stream { circuit, stream, notice } => {
                    debug!(%circuit, %stream, ?notice, "stream event");
                }
            }
        }
    }

    fn perform_edge_action(&mut self, action: EdgeAction) {
        match action {
            EdgeAction::Connect { edge, target } => {
                let (data_tx, data_rx) = mpsc::unbounded_channel();
                let (enable_tx, enable_rx) = watch::channel(true);
                self.edges.insert(
                    edge,
                    EdgeWriter {
                        data_tx,
                        read_enabled: enable_tx,
                    },
                );
                let events = self.events_tx.clone();
                tokio::spawn(edge_connection_task(edge, target, data_rx, enable_rx, events));
            }
            EdgeAction::Transmit { edge, data } => {
                if let Some(writer) = self.edges.get(&edge) {
                    let _ = writer.data_tx.send(data);
                }
            }
            EdgeAction::Shutdown { edge, reason } => {
                debug!(?edge, %reason, "edge shutdown");
                self.edges.remove(&edge);
            }
            EdgeAction::Resolve { edge, hostname } => {
                let events = self.events_tx.clone();
                let resolver = Arc::clone(&self.resolver);
                tokio::spawn(async move {
                    // The resolver interface is synchronous; keep it off
                    // the runtime threads.
                    let result = tokio::task::spawn_blocking(move || {
                        resolver.resolve(&hostname)
                    })
                    .await;
                    let event = match result {
                        Ok(Ok(answers)) => EdgeEvent::Resolved { edge, answers },
                        Ok(Err(e)) => {
                            debug!(error = %e, "resolve failed");
                            EdgeEvent::ResolveFailed {
                                edge,
                                transient: true,
                            }
                        }
                        Err(_) => EdgeEvent::ResolveFailed {
                            edge,
                            transient: true,
                        },
                    };
                    let _ = events.send(RuntimeEvent::Edge(event));
                });
            }
            EdgeAction::SetReadEnabled { edge, enabled } => {
                if let Some(writer) = self.edges.get(&edge) {
                    let _ = writer.read_enabled.send(enabled);
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr, role: HandshakeRole) {
        let tls = self.tls.clone();
        let keystore = Arc::clone(&self.keystore);
        let events = self.events_tx.clone();
        let my_addrs = self.my_addrs.clone();
        tokio::spawn(async move {
            let result = match role {
                HandshakeRole::Responder => match tls.acceptor().accept(stream).await {
                    Ok(tls_stream) => {
                        connection_task(
                            tokio_rustls::TlsStream::Server(tls_stream),
                            peer,
                            role,
                            keystore,
                            my_addrs,
                            events,
                        )
                        .await
                    }
                    Err(e) => Err(anyhow::anyhow!("TLS accept: {e}")),
                },
                HandshakeRole::Initiator => unreachable!("dials use spawn_dial"),
            };
            if let Err(e) = result {
                info!(%peer, error = %e, "connection ended");
            }
        });
    }

    fn spawn_dial(&self, addr: SocketAddr, identity: [u8; 32]) {
        let tls = self.tls.clone();
        let keystore = Arc::clone(&self.keystore);
        let events = self.events_tx.clone();
        let my_addrs = self.my_addrs.clone();
        tokio::spawn(async move {
            let result = async {
                let tcp = TcpStream::connect(addr).await?;
                let tls_stream = tls
                    .connector()
                    .connect(TlsContext::server_name(), tcp)
                    .await?;
                connection_task(
                    tokio_rustls::TlsStream::Client(tls_stream),
                    addr,
                    HandshakeRole::Initiator,
                    keystore,
                    my_addrs,
                    events,
                )
                .await
            }
            .await;
            if let Err(e) = result {
                info!(%addr, peer = %hex::encode(identity), error = %e, "dial failed");
            }
        });
    }
}

/// Run the link handshake, then shuttle cells until the transport dies.
async fn connection_task(
    stream: tokio_rustls::TlsStream<TcpStream>,
    peer: SocketAddr,
    role: HandshakeRole,
    keystore: Arc<dyn IdentityKeystore>,
    my_addrs: Vec<IpAddr>,
    events: mpsc::UnboundedSender<RuntimeEvent>,
) -> Result<()> {
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let mut codec = CellCodec::new();
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut rng = rand::rngs::StdRng::from_entropy();

    let (mut handshake, opening) = LinkHandshake::start(role);
    let ctx = LinkContext {
        keystore: keystore.as_ref(),
        now_unix: now_unix() as u32,
        peer_addr: Some(peer.ip()),
        my_addrs,
    };
    for cell in opening {
        let mut out = BytesMut::new();
        codec.encode(&cell, &mut out)?;
        write_half.write_all(&out).await?;
    }

    // Drive the handshake to OPEN or BROKEN.
    while !handshake.is_open() {
        let n = read_half.read_buf(&mut buf).await?;
        if n == 0 {
            anyhow::bail!("transport closed during link handshake");
        }
        while let Some(cell) = codec.decode_next(&mut buf)? {
            let replies = handshake.feed(cell, &ctx, &mut rng)?;
            if let Some(version) = handshake.link_version() {
                if codec.link_version().is_none() {
                    codec.set_link_version(version);
                }
            }
            for cell in replies {
                let mut out = BytesMut::new();
                codec.encode(&cell, &mut out)?;
                write_half.write_all(&out).await?;
            }
            if handshake.is_open() {
                break;
            }
        }
    }

    let link_info = handshake
        .link_info()
        .ok_or_else(|| anyhow::anyhow!("handshake open without link info"))?;
    info!(
        %peer,
        version = link_info.link_version,
        authenticated = link_info.peer_identity.is_some(),
        "link handshake complete"
    );

    // Hand the channel to the core and learn our handle.
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (handle_tx, handle_rx) = oneshot::channel();
    let direction = match role {
        HandshakeRole::Initiator => ChannelDirection::Outbound,
        HandshakeRole::Responder => ChannelDirection::Inbound,
    };
    events
        .send(RuntimeEvent::ChannelUp {
            info: link_info.clone(),
            addr: peer,
            direction,
            writer: writer_tx,
            link_version: link_info.link_version,
            handle_tx,
        })
        .map_err(|_| anyhow::anyhow!("runtime gone"))?;
    let handle = handle_rx.await?;

    // Writer half drains the runtime's encoded cells.
    let mut write_task = tokio::spawn(async move {
        while let Some(bytes) = writer_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    // Reader half decodes cells until the transport fails.
    let read_result: Result<()> = async {
        loop {
            let mut cells = Vec::new();
            while let Some(cell) = codec.decode_next(&mut buf)? {
                cells.push(cell);
            }
            if !cells.is_empty() {
                events
                    .send(RuntimeEvent::Cells {
                        chan: handle,
                        cells,
                    })
                    .map_err(|_| anyhow::anyhow!("runtime gone"))?;
            }
            let n = read_half.read_buf(&mut buf).await?;
            if n == 0 {
                anyhow::bail!("peer closed the transport");
            }
        }
    }
    .await;

    let _ = events.send(RuntimeEvent::ChannelDown { chan: handle });
    write_task.abort();
    let _ = (&mut write_task).await;
    read_result
}

/// One exit-stream TCP bridge.
async fn edge_connection_task(
    edge: EdgeId,
    target: TargetAddr,
    mut data_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut read_enabled: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<RuntimeEvent>,
) {
    let addr = match &target {
        TargetAddr::Ip(sock) => *sock,
        TargetAddr::Hostname { host, port } => {
            match tokio::net::lookup_host((host.as_str(), *port)).await {
                Ok(mut addrs) => match addrs.next() {
                    Some(sock) => sock,
                    None => {
                        let _ = events.send(RuntimeEvent::Edge(EdgeEvent::ConnectFailed {
                            edge,
                            reason: EndReason::ResolveFailed,
                        }));
                        return;
                    }
                },
                Err(_) => {
                    let _ = events.send(RuntimeEvent::Edge(EdgeEvent::ConnectFailed {
                        edge,
                        reason: EndReason::ResolveFailed,
                    }));
                    return;
                }
            }
        }
    };

    let stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            let reason = match e.kind() {
                std::io::ErrorKind::ConnectionRefused => EndReason::ConnectRefused,
                std::io::ErrorKind::TimedOut => EndReason::Timeout,
                _ => EndReason::NoRoute,
            };
            let _ = events.send(RuntimeEvent::Edge(EdgeEvent::ConnectFailed { edge, reason }));
            return;
        }
    };
    let _ = events.send(RuntimeEvent::Edge(EdgeEvent::Connected {
        edge,
        peer: addr.ip(),
    }));

    let (mut tcp_read, mut tcp_write) = stream.into_split();
    let mut read_buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            outbound = data_rx.recv() => {
                match outbound {
                    Some(data) => {
                        if tcp_write.write_all(&data).await.is_err() {
                            let _ = events.send(RuntimeEvent::Edge(EdgeEvent::Closed {
                                edge,
                                reason: EndReason::ConnReset,
                            }));
                            return;
                        }
                    }
                    // The runtime dropped this edge: shut down quietly.
                    None => return,
                }
            }
            read = tcp_read.read(&mut read_buf), if *read_enabled.borrow() => {
                match read {
                    Ok(0) => {
                        let _ = events.send(RuntimeEvent::Edge(EdgeEvent::Closed {
                            edge,
                            reason: EndReason::Done,
                        }));
                        return;
                    }
                    Ok(n) => {
                        let _ = events.send(RuntimeEvent::Edge(EdgeEvent::Data {
                            edge,
                            data: read_buf[..n].to_vec(),
                        }));
                    }
                    Err(_) => {
                        let _ = events.send(RuntimeEvent::Edge(EdgeEvent::Closed {
                            edge,
                            reason: EndReason::ConnReset,
                        }));
                        return;
                    }
                }
            }
            changed = read_enabled.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
