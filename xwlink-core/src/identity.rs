//! Identities and addressing: logical stream ids, device ids, per-transport destinations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Logical stream (one game/conversation). Zero means "not yet resolved".
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl StreamId {
    pub const UNRESOLVED: StreamId = StreamId(0);

    pub fn is_resolved(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// Pub/sub device id. Rendered as 16 upper-case hex digits in topics and logs.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl DeviceId {
    /// Random non-zero id for a fresh install.
    pub fn generate() -> Self {
        loop {
            let v: u64 = rand::random();
            if v != 0 {
                return DeviceId(v);
            }
        }
    }

    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        DeviceId(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid device id: {0}")]
pub struct ParseDeviceIdError(String);

impl FromStr for DeviceId {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16)
            .map(DeviceId)
            .map_err(|_| ParseDeviceIdError(s.to_string()))
    }
}

/// Which transport a status report or destination belongs to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    PubSub,
    Tap,
    Mesh,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Transport-specific address. Equality by value.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// Cloud pub/sub peer, by device id.
    PubSub(DeviceId),
    /// Local-mesh peer, by hardware address string.
    Mesh(String),
    /// Whoever is next tapped; the tap exchange has no addressing.
    Tap,
}

impl Destination {
    pub fn kind(&self) -> TransportKind {
        match self {
            Destination::PubSub(_) => TransportKind::PubSub,
            Destination::Mesh(_) => TransportKind::Mesh,
            Destination::Tap => TransportKind::Tap,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::PubSub(d) => write!(f, "pubsub:{}", d),
            Destination::Mesh(a) => write!(f, "mesh:{}", a),
            Destination::Tap => write!(f, "tap"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_hex_format() {
        let d = DeviceId(0x00ab_cdef_0123_4567);
        assert_eq!(d.to_string(), "00ABCDEF01234567");
        assert_eq!("00ABCDEF01234567".parse::<DeviceId>().unwrap(), d);
    }

    #[test]
    fn device_id_rejects_garbage() {
        assert!("not-hex".parse::<DeviceId>().is_err());
    }

    #[test]
    fn generated_device_id_nonzero() {
        for _ in 0..32 {
            assert_ne!(DeviceId::generate().0, 0);
        }
    }

    #[test]
    fn destination_kind() {
        assert_eq!(Destination::Tap.kind(), TransportKind::Tap);
        assert_eq!(
            Destination::Mesh("aa:bb".into()).kind(),
            TransportKind::Mesh
        );
        assert_eq!(Destination::PubSub(DeviceId(1)).kind(), TransportKind::PubSub);
        assert!(!StreamId::UNRESOLVED.is_resolved());
    }
}
