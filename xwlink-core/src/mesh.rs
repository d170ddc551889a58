//! Local-mesh protocol: JSON packets, relay and send routing, peer identities,
//! connect throttling, and the discovery state machine.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::engine::{DeliveryResult, PayloadSink};
use crate::identity::{Destination, StreamId};
use crate::storage::KvStore;

/// Port the group owner listens on.
pub const OWNER_PORT: u16 = 5432;
pub const SERVICE_REG_TYPE: &str = "_presence._tcp";

/// Window during which a second connect attempt to the same peer is suppressed.
pub const CONNECT_PENDING_MS: u64 = 3_000;

const PEERS_LIST_KEY: &str = "mesh.peers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MeshCmd {
    Ping,
    Pong,
    Invite,
    Msg,
    Nogame,
}

/// One hardware address to display name mapping, as carried in a PONG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub mac: String,
    pub name: String,
}

/// Application packet, one JSON object per line on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshPacket {
    pub cmd: MeshCmd,
    pub src: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gmid: Option<u32>,
    /// Base64 message payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Base64 serialized invitation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nli: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<Vec<PeerEntry>>,
}

/// Error encoding or decoding a mesh packet.
#[derive(Debug, thiserror::Error)]
pub enum MeshPacketError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("missing field: {0}")]
    Missing(&'static str),
}

impl MeshPacket {
    fn bare(cmd: MeshCmd, src: &str) -> Self {
        Self {
            cmd,
            src: src.to_string(),
            dest: None,
            gmid: None,
            data: None,
            nli: None,
            mac: None,
            name: None,
            map: None,
        }
    }

    pub fn ping(src: &str, name: &str) -> Self {
        Self {
            mac: Some(src.to_string()),
            name: Some(name.to_string()),
            ..Self::bare(MeshCmd::Ping, src)
        }
    }

    pub fn pong(src: &str, map: Vec<PeerEntry>) -> Self {
        Self {
            mac: Some(src.to_string()),
            map: Some(map),
            ..Self::bare(MeshCmd::Pong, src)
        }
    }

    pub fn msg(src: &str, stream: StreamId, payload: &[u8]) -> Self {
        Self {
            gmid: Some(stream.0),
            data: Some(BASE64.encode(payload)),
            ..Self::bare(MeshCmd::Msg, src)
        }
    }

    pub fn invite(src: &str, invite: &[u8]) -> Self {
        Self {
            nli: Some(BASE64.encode(invite)),
            ..Self::bare(MeshCmd::Invite, src)
        }
    }

    pub fn nogame(src: &str, stream: StreamId) -> Self {
        Self {
            gmid: Some(stream.0),
            ..Self::bare(MeshCmd::Nogame, src)
        }
    }

    pub fn with_dest(mut self, dest: &str) -> Self {
        self.dest = Some(dest.to_string());
        self
    }

    pub fn stream(&self) -> StreamId {
        StreamId(self.gmid.unwrap_or(0))
    }

    pub fn payload(&self) -> Result<Vec<u8>, MeshPacketError> {
        let data = self.data.as_deref().ok_or(MeshPacketError::Missing("data"))?;
        Ok(BASE64.decode(data)?)
    }

    pub fn invite_bytes(&self) -> Result<Vec<u8>, MeshPacketError> {
        let nli = self.nli.as_deref().ok_or(MeshPacketError::Missing("nli"))?;
        Ok(BASE64.decode(nli)?)
    }

    /// Serialized JSON followed by a newline.
    pub fn encode_line(&self) -> Result<Vec<u8>, MeshPacketError> {
        let mut out = serde_json::to_vec(self)?;
        out.push(b'\n');
        Ok(out)
    }

    pub fn decode(line: &[u8]) -> Result<Self, MeshPacketError> {
        Ok(serde_json::from_slice(line.trim_ascii_end())?)
    }
}

/// Just enough of a packet to decide where it goes.
#[derive(Deserialize)]
struct RoutingHeader {
    #[serde(default)]
    dest: Option<String>,
}

/// Where an inbound raw packet goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundRoute {
    /// Ours: decode and dispatch.
    Local,
    /// Someone else's and we hold their socket: forward the raw bytes unchanged.
    Relay(String),
    /// Someone else's and we cannot reach them.
    Drop(String),
}

pub fn route_inbound(
    raw: &[u8],
    my_addr: &str,
    has_socket: impl Fn(&str) -> bool,
) -> Result<InboundRoute, MeshPacketError> {
    let header: RoutingHeader = serde_json::from_slice(raw.trim_ascii_end())?;
    Ok(match header.dest {
        None => InboundRoute::Local,
        Some(d) if d == my_addr => InboundRoute::Local,
        Some(d) if has_socket(&d) => InboundRoute::Relay(d),
        Some(d) => InboundRoute::Drop(d),
    })
}

/// How an outbound packet for `dest` leaves this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundRoute {
    Direct(String),
    /// Through the only open socket (the owner), with `dest` set so it relays.
    ViaOwner(String),
    Unreachable,
}

pub fn route_outbound(dest: &str, connected: &[String], is_owner: bool) -> OutboundRoute {
    if connected.iter().any(|c| c == dest) {
        OutboundRoute::Direct(dest.to_string())
    } else if !is_owner && connected.len() == 1 {
        OutboundRoute::ViaOwner(connected[0].clone())
    } else {
        OutboundRoute::Unreachable
    }
}

/// Address to display name. Entries are overwritten, never removed.
#[derive(Debug, Default)]
pub struct PeerIdentities {
    map: Mutex<HashMap<String, String>>,
}

impl PeerIdentities {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, mac: &str, name: &str) {
        self.lock().insert(mac.to_string(), name.to_string());
    }

    pub fn merge(&self, entries: &[PeerEntry]) {
        let mut map = self.lock();
        for e in entries {
            map.insert(e.mac.clone(), e.name.clone());
        }
    }

    pub fn name_of(&self, mac: &str) -> Option<String> {
        self.lock().get(mac).cloned()
    }

    /// Every entry except `exclude` (normally this device), sorted by address.
    pub fn entries_excluding(&self, exclude: &str) -> Vec<PeerEntry> {
        let mut out: Vec<PeerEntry> = self
            .lock()
            .iter()
            .filter(|(mac, _)| mac.as_str() != exclude)
            .map(|(mac, name)| PeerEntry {
                mac: mac.clone(),
                name: name.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.mac.cmp(&b.mac));
        out
    }
}

/// Persisted list of peers we have seen, for reconnecting after restart.
pub fn load_known_peers(kv: &dyn KvStore) -> Vec<String> {
    match kv.get(PEERS_LIST_KEY) {
        Ok(Some(bytes)) => String::from_utf8_lossy(&bytes)
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

pub fn save_known_peers(kv: &dyn KvStore, peers: &[String]) {
    if let Err(e) = kv.set(PEERS_LIST_KEY, peers.join(",").as_bytes()) {
        tracing::warn!(error = %e, "failed to persist peer list");
    }
}

/// Suppresses repeat connect attempts while one is pending.
#[derive(Debug, Default)]
pub struct ConnectGate {
    pending: HashMap<String, u64>,
}

impl ConnectGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// True (and marks pending) if a connect to `peer` should be attempted now.
    pub fn should_connect(&mut self, peer: &str, now_ms: u64, connected: bool) -> bool {
        if connected {
            self.pending.remove(peer);
            return false;
        }
        if let Some(&started) = self.pending.get(peer) {
            if now_ms.saturating_sub(started) <= CONNECT_PENDING_MS {
                return false;
            }
        }
        self.pending.insert(peer.to_string(), now_ms);
        true
    }
}

/// What handling one local packet asks the socket layer to do.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Handled {
    /// Register the arriving socket under this peer address.
    pub register_as: Option<String>,
    /// Send back on the arriving socket.
    pub reply: Option<MeshPacket>,
    /// Route to these addresses.
    pub sends: Vec<(String, MeshPacket)>,
}

/// This device's address and display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub mac: String,
    pub name: String,
}

/// Transport-independent handling of decoded packets.
pub struct MeshNode {
    local: RwLock<LocalIdentity>,
    identities: PeerIdentities,
}

impl MeshNode {
    pub fn new(local: LocalIdentity) -> Self {
        Self {
            local: RwLock::new(local),
            identities: PeerIdentities::new(),
        }
    }

    pub fn local(&self) -> LocalIdentity {
        self.local.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Radio reported our real address or name.
    pub fn set_local(&self, local: LocalIdentity) {
        *self.local.write().unwrap_or_else(|e| e.into_inner()) = local;
    }

    pub fn identities(&self) -> &PeerIdentities {
        &self.identities
    }

    /// Handshake packet to send first on every new socket.
    pub fn hello(&self) -> MeshPacket {
        let me = self.local();
        MeshPacket::ping(&me.mac, &me.name)
    }

    pub fn handle(&self, packet: MeshPacket, sink: &dyn PayloadSink) -> Handled {
        let me = self.local();
        let from = Destination::Mesh(packet.src.clone());
        let mut out = Handled::default();
        match packet.cmd {
            MeshCmd::Ping => {
                let mac = packet.mac.clone().unwrap_or_else(|| packet.src.clone());
                if let Some(name) = &packet.name {
                    self.identities.record(&mac, name);
                }
                self.identities.record(&me.mac, &me.name);
                let mut map = self.identities.entries_excluding("");
                map.retain(|e| e.mac != mac);
                out.reply = Some(MeshPacket::pong(&me.mac, map));
                out.register_as = Some(mac);
            }
            MeshCmd::Pong => {
                let mac = packet.mac.clone().unwrap_or_else(|| packet.src.clone());
                if let Some(map) = &packet.map {
                    let others: Vec<PeerEntry> =
                        map.iter().filter(|e| e.mac != me.mac).cloned().collect();
                    self.identities.merge(&others);
                }
                out.register_as = Some(mac);
            }
            MeshCmd::Invite => match packet.invite_bytes() {
                Ok(nli) => sink.on_invite(&from, &nli),
                Err(e) => tracing::warn!(error = %e, src = %packet.src, "bad invite packet"),
            },
            MeshCmd::Msg => match packet.payload() {
                Ok(data) => {
                    let stream = packet.stream();
                    if sink.decode_inbound(&from, stream, &data) == DeliveryResult::NoSuchStream {
                        out.sends.push((
                            packet.src.clone(),
                            MeshPacket::nogame(&me.mac, stream).with_dest(&packet.src),
                        ));
                    }
                }
                Err(e) => tracing::warn!(error = %e, src = %packet.src, "bad msg packet"),
            },
            MeshCmd::Nogame => sink.on_stream_gone(&from, packet.stream()),
        }
        out
    }
}

/// Discovery steps, run in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryStep {
    ClearLocalServices,
    AddLocalService,
    ClearServiceRequests,
    AddServiceRequest,
    DiscoverPeers,
    DiscoverServices,
    /// Steady state: wait for peers and group events.
    Done,
}

impl DiscoveryStep {
    pub const FIRST: DiscoveryStep = DiscoveryStep::ClearLocalServices;

    fn next(self) -> Self {
        use DiscoveryStep::*;
        match self {
            ClearLocalServices => AddLocalService,
            AddLocalService => ClearServiceRequests,
            ClearServiceRequests => AddServiceRequest,
            AddServiceRequest => DiscoverPeers,
            DiscoverPeers => DiscoverServices,
            DiscoverServices | Done => Done,
        }
    }
}

/// Result of one asynchronous radio step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Success,
    /// Transient: the radio is busy.
    Busy,
    /// General failure: start over.
    Error,
    /// No radio or no permission; the transport cannot run.
    Unsupported,
}

/// What the discovery runner does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Run(DiscoveryStep),
    RetryAfter(DiscoveryStep, Duration),
    Steady,
    Disabled,
}

/// Sequential, restartable discovery. Busy retries the same step; too many failures,
/// or any hard error, restarts from the top after a delay.
#[derive(Debug, Clone)]
pub struct DiscoveryMachine {
    step: DiscoveryStep,
    failures: u32,
    threshold: u32,
    retry_delay: Duration,
}

impl DiscoveryMachine {
    pub fn new(threshold: u32, retry_delay: Duration) -> Self {
        Self {
            step: DiscoveryStep::FIRST,
            failures: 0,
            threshold,
            retry_delay,
        }
    }

    pub fn current(&self) -> DiscoveryStep {
        self.step
    }

    pub fn restart(&mut self) -> DiscoveryStep {
        self.step = DiscoveryStep::FIRST;
        self.failures = 0;
        self.step
    }

    pub fn on_result(&mut self, result: StepResult) -> NextStep {
        match result {
            StepResult::Success => {
                self.failures = 0;
                self.step = self.step.next();
                if self.step == DiscoveryStep::Done {
                    NextStep::Steady
                } else {
                    NextStep::Run(self.step)
                }
            }
            StepResult::Busy => {
                self.failures += 1;
                if self.failures > self.threshold {
                    tracing::warn!(step = ?self.step, failures = self.failures, "restarting discovery");
                    NextStep::RetryAfter(self.restart(), self.retry_delay)
                } else {
                    NextStep::RetryAfter(self.step, self.retry_delay)
                }
            }
            StepResult::Error => {
                tracing::warn!(step = ?self.step, "discovery step failed; restarting");
                NextStep::RetryAfter(self.restart(), self.retry_delay)
            }
            StepResult::Unsupported => NextStep::Disabled,
        }
    }
}

impl Default for DiscoveryMachine {
    /// 8 failures, 10 s between attempts.
    fn default() -> Self {
        Self::new(8, Duration::from_secs(10))
    }
}
