//! Local-mesh runtime: discovery runner, group owner accept loop, client connect
//! loop, line-framed sockets, and store-and-forward relay.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use xwlink_core::mesh::{
    load_known_peers, route_inbound, route_outbound, save_known_peers, ConnectGate, DiscoveryMachine, DiscoveryStep,
    InboundRoute, LocalIdentity, MeshCmd, MeshNode, MeshPacket, MeshPacketError, NextStep, OutboundRoute, PeerEntry,
    StepResult,
};
use xwlink_core::scheduler::{Clock, SystemClock};
use xwlink_core::{Direction, EnvelopeStore, KvStore, PayloadSink, StatusSink, StreamId, TransportKind};

const ADDRESS_KEY: &str = "mesh.addr";
const CONNECT_RETRY_MIN: Duration = Duration::from_secs(1);
const CONNECT_RETRY_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("packet: {0}")]
    Packet(#[from] MeshPacketError),
    #[error("mesh transport disabled")]
    Disabled,
}

/// Platform peer-to-peer radio. Calls may block; they run on the blocking pool.
pub trait MeshRadio: Send + Sync {
    fn run_step(&self, step: DiscoveryStep) -> StepResult;
    /// Ask the radio to form a group with `peer`.
    fn connect(&self, peer: &str) -> StepResult;
}

/// Radio notifications that drive group formation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    ThisDevice { mac: String, name: String },
    PeersAvailable(Vec<String>),
    GroupFormed { is_owner: bool, owner_addr: Option<String> },
    GroupLost,
}

/// Radio for hosts where the group is configured statically: every step succeeds.
pub struct StaticRadio;

impl MeshRadio for StaticRadio {
    fn run_step(&self, step: DiscoveryStep) -> StepResult {
        tracing::debug!(?step, "static radio step");
        StepResult::Success
    }

    fn connect(&self, peer: &str) -> StepResult {
        tracing::debug!(peer, "static radio connect");
        StepResult::Success
    }
}

#[derive(Debug, Clone)]
pub struct MeshSettings {
    pub local: LocalIdentity,
    pub owner_port: u16,
    pub failure_threshold: u32,
    pub step_retry: Duration,
}

/// Mesh address for hosts whose radio does not report one: `configured` if set,
/// else a locally administered MAC-style address generated once and saved.
pub fn load_or_create_address(kv: &dyn KvStore, configured: &str) -> String {
    if !configured.is_empty() {
        return configured.to_string();
    }
    if let Ok(Some(bytes)) = kv.get(ADDRESS_KEY) {
        if let Ok(addr) = String::from_utf8(bytes) {
            if !addr.is_empty() {
                return addr;
            }
        }
    }
    let mut octets: [u8; 6] = rand::random();
    octets[0] = (octets[0] | 0x02) & 0xFE;
    let addr = octets
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":");
    if let Err(e) = kv.set(ADDRESS_KEY, addr.as_bytes()) {
        tracing::warn!(error = %e, "failed to persist mesh address");
    }
    addr
}

/// How a discovery run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    Steady,
    Disabled,
    Stopped,
}

/// Drive `machine` to steady state, retrying and restarting as it directs.
pub async fn run_discovery(
    radio: Arc<dyn MeshRadio>,
    mut machine: DiscoveryMachine,
    mut stop: watch::Receiver<bool>,
) -> DiscoveryOutcome {
    let mut step = machine.current();
    loop {
        let r = radio.clone();
        let result = tokio::task::spawn_blocking(move || r.run_step(step))
            .await
            .unwrap_or(StepResult::Error);
        tracing::debug!(?step, ?result, "discovery step");
        match machine.on_result(result) {
            NextStep::Run(next) => step = next,
            NextStep::RetryAfter(next, delay) => {
                step = next;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop.changed() => return DiscoveryOutcome::Stopped,
                }
            }
            NextStep::Steady => {
                tracing::info!("mesh discovery steady");
                return DiscoveryOutcome::Steady;
            }
            NextStep::Disabled => return DiscoveryOutcome::Disabled,
        }
    }
}

struct Conn {
    id: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

struct Shared {
    node: MeshNode,
    payload_sink: Arc<dyn PayloadSink>,
    status: Arc<dyn StatusSink>,
    kv: Arc<dyn KvStore>,
    /// Registered peer address to its socket writer.
    sockets: Mutex<HashMap<String, Conn>>,
    /// Every open socket, registered or not.
    open: Mutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>,
    /// Encoded packets (dest already set) waiting for a route, by destination.
    pending: EnvelopeStore<String>,
    is_owner: AtomicBool,
    disabled: AtomicBool,
    next_conn: AtomicU64,
    gate: Mutex<ConnectGate>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stop: watch::Receiver<bool>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn my_addr(&self) -> String {
        self.node.local().mac
    }

    fn has_socket(&self, addr: &str) -> bool {
        lock(&self.sockets).contains_key(addr)
    }

    fn connected(&self) -> Vec<String> {
        let mut v: Vec<String> = lock(&self.sockets).keys().cloned().collect();
        v.sort();
        v
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    fn write_line(&self, addr: &str, line: Vec<u8>) -> bool {
        let tx = lock(&self.sockets).get(addr).map(|c| c.tx.clone());
        match tx {
            Some(tx) => tx.send(line).is_ok(),
            None => false,
        }
    }

    /// Route one packet; park it if there is no route yet.
    fn send_packet(&self, dest: &str, packet: MeshPacket) -> Result<bool, MeshError> {
        let route = route_outbound(dest, &self.connected(), self.is_owner.load(Ordering::SeqCst));
        let sent = match &route {
            OutboundRoute::Direct(addr) => self.write_line(addr, packet.encode_line()?),
            OutboundRoute::ViaOwner(owner) => {
                let line = packet.clone().with_dest(dest).encode_line()?;
                self.write_line(owner, line)
            }
            OutboundRoute::Unreachable => false,
        };
        if sent {
            tracing::debug!(dest, ?route, "mesh packet sent");
            self.status
                .on_delivery_status(TransportKind::Mesh, Direction::Outbound, true);
        } else {
            tracing::debug!(dest, "no route; parking packet");
            self.pending
                .add_tagged_if_absent(&dest.to_string(), packet.with_dest(dest).encode_line()?);
        }
        Ok(sent)
    }

    /// Push parked packets down any route that has opened up.
    fn flush_pending(&self) {
        let is_owner = self.is_owner.load(Ordering::SeqCst);
        for dest in self.pending.pending_keys() {
            let via = match route_outbound(&dest, &self.connected(), is_owner) {
                OutboundRoute::Direct(a) | OutboundRoute::ViaOwner(a) => a,
                OutboundRoute::Unreachable => continue,
            };
            let envelope = self.pending.snapshot_for(&dest);
            let sent: Vec<Vec<u8>> = envelope
                .items
                .into_iter()
                .filter(|line| self.write_line(&via, line.clone()))
                .collect();
            if !sent.is_empty() {
                tracing::debug!(dest = %dest, via = %via, count = sent.len(), "flushed parked packets");
                self.pending.remove_confirmed(&dest, &sent);
            }
        }
    }

    fn register(&self, addr: String, conn_id: u64, tx: &mpsc::UnboundedSender<Vec<u8>>) {
        let fresh = {
            let mut sockets = lock(&self.sockets);
            let fresh = sockets.get(&addr).map_or(true, |c| c.id != conn_id);
            sockets.insert(
                addr.clone(),
                Conn {
                    id: conn_id,
                    tx: tx.clone(),
                },
            );
            fresh
        };
        if fresh {
            tracing::info!(addr = %addr, conn_id, "peer socket registered");
            self.flush_pending();
        }
    }

    fn on_line(&self, conn_id: u64, tx: &mpsc::UnboundedSender<Vec<u8>>, raw: &[u8]) {
        let me = self.my_addr();
        let route = match route_inbound(raw, &me, |d| self.has_socket(d)) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(conn_id, error = %e, "unparseable mesh line");
                return;
            }
        };
        match route {
            InboundRoute::Relay(dest) => {
                let mut line = raw.to_vec();
                if line.last() != Some(&b'\n') {
                    line.push(b'\n');
                }
                if self.write_line(&dest, line) {
                    tracing::debug!(dest = %dest, "relayed packet");
                } else {
                    tracing::warn!(dest = %dest, "relay target vanished; packet dropped");
                }
            }
            InboundRoute::Drop(dest) => {
                tracing::warn!(dest = %dest, "no socket for relay target; packet dropped");
            }
            InboundRoute::Local => match MeshPacket::decode(raw) {
                Ok(packet) => self.dispatch(conn_id, tx, packet),
                Err(e) => tracing::warn!(conn_id, error = %e, "bad mesh packet"),
            },
        }
    }

    fn dispatch(&self, conn_id: u64, tx: &mpsc::UnboundedSender<Vec<u8>>, packet: MeshPacket) {
        let cmd = packet.cmd;
        let handled = self.node.handle(packet, self.payload_sink.as_ref());
        if matches!(cmd, MeshCmd::Msg | MeshCmd::Invite | MeshCmd::Nogame) {
            self.status
                .on_delivery_status(TransportKind::Mesh, Direction::Inbound, true);
        }
        if let Some(addr) = handled.register_as {
            self.register(addr, conn_id, tx);
        }
        if let Some(reply) = handled.reply {
            match reply.encode_line() {
                Ok(line) => {
                    let _ = tx.send(line);
                }
                Err(e) => tracing::warn!(error = %e, "cannot encode reply"),
            }
        }
        for (dest, packet) in handled.sends {
            if let Err(e) = self.send_packet(&dest, packet) {
                tracing::warn!(dest = %dest, error = %e, "cannot send mesh packet");
            }
        }
    }

    fn opened(&self, conn_id: u64, tx: &mpsc::UnboundedSender<Vec<u8>>) {
        lock(&self.open).insert(conn_id, tx.clone());
    }

    fn closed(&self, conn_id: u64) {
        lock(&self.sockets).retain(|_, c| c.id != conn_id);
        let none_left = {
            let mut open = lock(&self.open);
            open.remove(&conn_id);
            open.is_empty()
        };
        tracing::info!(conn_id, "mesh socket closed");
        if none_left {
            self.status
                .on_delivery_status(TransportKind::Mesh, Direction::Inbound, false);
            self.status
                .on_delivery_status(TransportKind::Mesh, Direction::Outbound, false);
        }
    }
}

/// One socket: hello first, then a line reader here and a writer task fed by a channel.
/// Closes when `role` changes or its sender goes away.
async fn run_connection(shared: Arc<Shared>, stream: TcpStream, mut role: watch::Receiver<bool>) {
    let conn_id = shared.next_conn.fetch_add(1, Ordering::SeqCst);
    let peer = stream.peer_addr().ok();
    let (rd, mut wr) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = wr.write_all(&line).await {
                tracing::debug!(error = %e, "mesh write failed");
                break;
            }
        }
    });
    shared.opened(conn_id, &tx);
    tracing::info!(conn_id, ?peer, "mesh socket open");
    match shared.node.hello().encode_line() {
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(e) => tracing::warn!(error = %e, "cannot encode hello"),
    }

    let mut reader = BufReader::new(rd);
    let mut buf = Vec::with_capacity(512);
    loop {
        buf.clear();
        let read = tokio::select! {
            r = reader.read_until(b'\n', &mut buf) => r,
            _ = role.changed() => {
                tracing::debug!(conn_id, "group role ended; closing socket");
                break;
            }
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                if buf.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                shared.on_line(conn_id, &tx, &buf);
            }
            Err(e) => {
                tracing::debug!(conn_id, error = %e, "mesh read failed");
                break;
            }
        }
    }
    shared.closed(conn_id);
    drop(tx);
    writer.abort();
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, mut role: watch::Receiver<bool>) {
    let mut stop = shared.stop.clone();
    loop {
        tokio::select! {
            r = listener.accept() => match r {
                Ok((stream, _)) => {
                    let handle = tokio::spawn(run_connection(shared.clone(), stream, role.clone()));
                    shared.track(handle);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = stop.changed() => break,
            _ = role.changed() => break,
        }
    }
    tracing::info!("mesh listener closed");
}

async fn connect_loop(shared: Arc<Shared>, owner: String, mut role: watch::Receiver<bool>) {
    let mut stop = shared.stop.clone();
    let mut delay = CONNECT_RETRY_MIN;
    loop {
        let attempt = tokio::select! {
            r = TcpStream::connect(owner.as_str()) => r,
            _ = stop.changed() => return,
            _ = role.changed() => return,
        };
        match attempt {
            Ok(stream) => {
                delay = CONNECT_RETRY_MIN;
                tokio::select! {
                    _ = run_connection(shared.clone(), stream, role.clone()) => {}
                    _ = stop.changed() => return,
                }
                if *role.borrow() {
                    return;
                }
            }
            Err(e) => tracing::debug!(owner = %owner, error = %e, ?delay, "connect to owner failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => return,
            _ = role.changed() => return,
        }
        delay = (delay * 2).min(CONNECT_RETRY_MAX);
    }
}

/// The accept loop or connect loop for the current group role.
struct RoleTask {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct MeshRuntime {
    shared: Arc<Shared>,
    radio: Arc<dyn MeshRadio>,
    settings: MeshSettings,
    stop_tx: watch::Sender<bool>,
    role: Mutex<Option<RoleTask>>,
}

impl MeshRuntime {
    pub fn new(
        settings: MeshSettings,
        radio: Arc<dyn MeshRadio>,
        kv: Arc<dyn KvStore>,
        payload_sink: Arc<dyn PayloadSink>,
        status: Arc<dyn StatusSink>,
    ) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            node: MeshNode::new(settings.local.clone()),
            payload_sink,
            status,
            kv,
            sockets: Mutex::new(HashMap::new()),
            open: Mutex::new(HashMap::new()),
            pending: EnvelopeStore::new(),
            is_owner: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            next_conn: AtomicU64::new(1),
            gate: Mutex::new(ConnectGate::new()),
            tasks: Mutex::new(Vec::new()),
            stop: stop_rx,
        });
        Arc::new(Self {
            shared,
            radio,
            settings,
            stop_tx,
            role: Mutex::new(None),
        })
    }

    /// Start discovery and the radio event handler.
    pub fn start(self: &Arc<Self>, events: mpsc::UnboundedReceiver<RadioEvent>) {
        let machine = DiscoveryMachine::new(self.settings.failure_threshold, self.settings.step_retry);
        let this = self.clone();
        let discovery = tokio::spawn(async move {
            let outcome = run_discovery(this.radio.clone(), machine, this.shared.stop.clone()).await;
            if outcome == DiscoveryOutcome::Disabled {
                tracing::error!("mesh radio unsupported; transport disabled");
                this.shared.disabled.store(true, Ordering::SeqCst);
                this.shared
                    .status
                    .on_delivery_status(TransportKind::Mesh, Direction::Outbound, false);
            }
        });
        self.shared.track(discovery);
        let this = self.clone();
        let handler = tokio::spawn(async move { this.radio_events(events).await });
        self.shared.track(handler);
        self.reconnect_known_peers();
    }

    async fn radio_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<RadioEvent>) {
        let mut stop = self.shared.stop.clone();
        loop {
            let ev = tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => ev,
                    None => return,
                },
                _ = stop.changed() => return,
            };
            tracing::debug!(?ev, "radio event");
            match ev {
                RadioEvent::ThisDevice { mac, name } => self.shared.node.set_local(LocalIdentity { mac, name }),
                RadioEvent::PeersAvailable(peers) => {
                    save_known_peers(self.shared.kv.as_ref(), &peers);
                    self.connect_peers(&peers);
                }
                RadioEvent::GroupFormed { is_owner, owner_addr } => {
                    if is_owner {
                        if let Err(e) = self.become_owner().await {
                            tracing::error!(error = %e, "cannot open listening socket; mesh disabled");
                            self.shared.disabled.store(true, Ordering::SeqCst);
                        }
                    } else if let Some(addr) = owner_addr {
                        self.join_owner(&addr).await;
                    }
                }
                RadioEvent::GroupLost => {
                    tracing::info!("mesh group lost");
                    self.shared.is_owner.store(false, Ordering::SeqCst);
                    self.stop_role().await;
                }
            }
        }
    }

    fn reconnect_known_peers(&self) {
        let peers = load_known_peers(self.shared.kv.as_ref());
        if !peers.is_empty() {
            self.connect_peers(&peers);
        }
    }

    fn connect_peers(&self, peers: &[String]) {
        if self.shared.is_owner.load(Ordering::SeqCst) {
            return;
        }
        let now = SystemClock.now_ms();
        for peer in peers {
            let go = lock(&self.shared.gate).should_connect(peer, now, self.shared.has_socket(peer));
            if go {
                let radio = self.radio.clone();
                let peer = peer.clone();
                tokio::task::spawn_blocking(move || {
                    let result = radio.connect(&peer);
                    tracing::debug!(peer = %peer, ?result, "radio connect");
                });
            }
        }
    }

    /// Stop the accept or connect loop of the current role and close its sockets.
    async fn stop_role(&self) {
        let role = lock(&self.role).take();
        if let Some(role) = role {
            let _ = role.stop.send(true);
            let _ = role.task.await;
            tracing::debug!("previous group role stopped");
        }
    }

    fn set_role(&self, stop: watch::Sender<bool>, task: JoinHandle<()>) {
        let old = lock(&self.role).replace(RoleTask { stop, task });
        if let Some(old) = old {
            let _ = old.stop.send(true);
            old.task.abort();
        }
    }

    /// Open the listening socket and accept peers. Returns the bound address.
    pub async fn become_owner(&self) -> Result<SocketAddr, MeshError> {
        if self.shared.disabled.load(Ordering::SeqCst) {
            return Err(MeshError::Disabled);
        }
        self.stop_role().await;
        let listener = TcpListener::bind(("0.0.0.0", self.settings.owner_port)).await?;
        let addr = listener.local_addr()?;
        self.shared.is_owner.store(true, Ordering::SeqCst);
        tracing::info!(%addr, "mesh group owner listening");
        let (stop, role) = watch::channel(false);
        let task = tokio::spawn(accept_loop(self.shared.clone(), listener, role));
        self.set_role(stop, task);
        Ok(addr)
    }

    /// Connect out to the group owner, reconnecting with backoff until the role changes.
    pub async fn join_owner(&self, owner: &str) {
        self.stop_role().await;
        self.shared.is_owner.store(false, Ordering::SeqCst);
        let (stop, role) = watch::channel(false);
        let task = tokio::spawn(connect_loop(self.shared.clone(), owner.to_string(), role));
        self.set_role(stop, task);
    }

    /// Send `bytes` on `stream` to `dest`: directly, through the owner, or parked.
    pub fn send_to(&self, dest: &str, stream: StreamId, bytes: &[u8]) -> Result<bool, MeshError> {
        let packet = MeshPacket::msg(&self.shared.my_addr(), stream, bytes);
        self.shared.send_packet(dest, packet)
    }

    pub fn send_invite(&self, dest: &str, invite: &[u8]) -> Result<bool, MeshError> {
        let packet = MeshPacket::invite(&self.shared.my_addr(), invite);
        self.shared.send_packet(dest, packet)
    }

    pub fn connected_peers(&self) -> Vec<String> {
        self.shared.connected()
    }

    /// Peer names without this device.
    pub fn peer_names(&self) -> Vec<PeerEntry> {
        self.shared
            .node
            .identities()
            .entries_excluding(&self.shared.my_addr())
    }

    pub fn is_disabled(&self) -> bool {
        self.shared.disabled.load(Ordering::SeqCst)
    }

    pub fn has_pending(&self) -> bool {
        self.shared.pending.has_any_data()
    }

    /// Stop every loop and close every socket.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        self.stop_role().await;
        let tasks: Vec<JoinHandle<()>> = lock(&self.shared.tasks).drain(..).collect();
        for t in tasks {
            t.abort();
            let _ = t.await;
        }
        lock(&self.shared.sockets).clear();
        lock(&self.shared.open).clear();
    }
}
