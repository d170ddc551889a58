//! Cloud pub/sub protocol: per-session connection state machine, topic naming,
//! packet codec, last-will and control payloads.

use serde::{Deserialize, Serialize};

use crate::identity::{DeviceId, StreamId};
use crate::protocol::{decode_app_frame, encode_app_frame, AppFrame, FrameError};
use crate::storage::KvStore;

/// Packet format version written as the first byte.
pub const PROTO_VERSION: u8 = 3;

const PACKET_HEADER: usize = 1 + 8;

pub const LWT_TOPIC: &str = "xw4/device/LWT";

/// Key the transport registers with the scheduler under.
pub const TIMER_KEY: &str = "pubsub";

const DEVICE_ID_KEY: &str = "pubsub.devid";

/// Lifecycle of one session. A new session always starts from `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Subscribing,
    Ready,
    Closing,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PubSubError {
    #[error("bad transition {from:?} -> {to:?} (state was {actual:?})")]
    BadTransition {
        from: ConnectionState,
        to: ConnectionState,
        actual: ConnectionState,
    },
    #[error("short packet: {0} bytes")]
    ShortPacket(usize),
    #[error("unknown packet version {0}")]
    UnknownVersion(u8),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// State field of one session plus the id that tells its callbacks apart from a
/// previous session's.
#[derive(Debug)]
pub struct SessionState {
    state: ConnectionState,
    generation: u64,
}

impl SessionState {
    pub fn new(generation: u64) -> Self {
        Self {
            state: ConnectionState::Idle,
            generation,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Move `from -> to`, checking the prior state. Only forward steps are allowed.
    pub fn advance(&mut self, from: ConnectionState, to: ConnectionState) -> Result<(), PubSubError> {
        use ConnectionState::*;
        let legal = matches!(
            (from, to),
            (Idle, Connecting) | (Connecting, Connected) | (Connected, Subscribing) | (Subscribing, Ready)
        );
        if !legal || self.state != from {
            return Err(PubSubError::BadTransition {
                from,
                to,
                actual: self.state,
            });
        }
        tracing::debug!(generation = self.generation, ?from, ?to, "session state");
        self.state = to;
        Ok(())
    }

    /// Closing is reachable from anywhere and terminal.
    pub fn close(&mut self) {
        self.state = ConnectionState::Closing;
    }
}

/// Topics for one device.
pub fn device_topic(dev: DeviceId) -> String {
    format!("xw4/device/{}", dev)
}

pub fn stream_topic(dev: DeviceId, stream: StreamId) -> String {
    format!("xw4/device/{}/{}", dev, stream)
}

pub fn ctrl_topic(dev: DeviceId) -> String {
    format!("xw4/ctrl/{}", dev)
}

/// Everything a device subscribes to.
pub fn subscriptions(dev: DeviceId) -> Vec<String> {
    vec![
        device_topic(dev),
        format!("{}/+", device_topic(dev)),
        ctrl_topic(dev),
    ]
}

/// MQTT-style match: `+` matches exactly one level, `#` the rest.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// `[proto][sender:8 BE][application frame]`.
pub fn encode_packet(sender: DeviceId, stream: StreamId, items: &[Vec<u8>]) -> Result<Vec<u8>, PubSubError> {
    let frame = encode_app_frame(stream, items)?;
    let mut out = Vec::with_capacity(PACKET_HEADER + frame.len());
    out.push(PROTO_VERSION);
    out.extend_from_slice(&sender.to_be_bytes());
    out.extend_from_slice(&frame);
    Ok(out)
}

pub fn decode_packet(bytes: &[u8]) -> Result<(DeviceId, AppFrame), PubSubError> {
    if bytes.len() < PACKET_HEADER {
        return Err(PubSubError::ShortPacket(bytes.len()));
    }
    if bytes[0] != PROTO_VERSION {
        return Err(PubSubError::UnknownVersion(bytes[0]));
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&bytes[1..PACKET_HEADER]);
    let frame = decode_app_frame(&bytes[PACKET_HEADER..])?;
    Ok((DeviceId::from_be_bytes(id), frame))
}

/// This install's pub/sub id from `kv`, generated and saved on first use.
pub fn load_device_id(kv: &dyn KvStore) -> DeviceId {
    if let Ok(Some(bytes)) = kv.get(DEVICE_ID_KEY) {
        if let Ok(arr) = <[u8; 8]>::try_from(bytes.as_slice()) {
            let id = DeviceId::from_be_bytes(arr);
            if id.0 != 0 {
                return id;
            }
        }
    }
    let id = DeviceId::generate();
    if let Err(e) = kv.set(DEVICE_ID_KEY, &id.to_be_bytes()) {
        tracing::warn!(error = %e, "failed to persist pubsub device id");
    }
    id
}

/// Published by the broker on our behalf if we vanish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastWill {
    pub devid: String,
    pub ts: u64,
}

impl LastWill {
    pub fn new(dev: DeviceId, ts_secs: u64) -> Self {
        Self {
            devid: dev.to_string(),
            ts: ts_secs,
        }
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Operator broadcast arriving on the control topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlNotice {
    pub msg: String,
    #[serde(default)]
    pub title: String,
}

/// Publish counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendStats {
    pub published: u64,
    pub failed: u64,
    pub received: u64,
    pub sessions: u64,
    pub disconnects: u64,
}
