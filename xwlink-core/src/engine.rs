//! Capabilities the delivery core consumes from the game engine and UI layer.

use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Mutex;

use crate::identity::{Destination, Direction, StreamId, TransportKind};
use crate::protocol::{tagged, AppFrame, Item, REPLY_NO_GAME, TAG_REPLY};

/// Result of handing an inbound payload to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered,
    NoSuchStream,
}

/// Decoded-payload sink (the game engine's receive hook).
pub trait PayloadSink: Send + Sync {
    fn decode_inbound(&self, from: &Destination, stream: StreamId, bytes: &[u8]) -> DeliveryResult;
    fn on_invite(&self, from: &Destination, invite: &[u8]);
    /// The peer reported it has no stream `stream`. Not a transport failure; not retried.
    fn on_stream_gone(&self, from: &Destination, stream: StreamId);
}

/// Delivery-status sink, for UI display only.
pub trait StatusSink: Send + Sync {
    fn on_delivery_status(&self, kind: TransportKind, direction: Direction, success: bool);

    /// Broadcast notice from the operator's control topic.
    fn on_control_notice(&self, _title: &str, _msg: &str) {}
}

/// Demultiplex a decoded frame into the engine. Returns reply items to queue back to
/// the sender on the same stream (one no-game reply if any message was undeliverable).
pub fn deliver_frame(frame: &AppFrame, from: &Destination, sink: &dyn PayloadSink) -> Vec<Vec<u8>> {
    let mut replies = Vec::new();
    for item in frame.parsed_items() {
        match item {
            Item::Message(body) => {
                if sink.decode_inbound(from, frame.stream, &body) == DeliveryResult::NoSuchStream {
                    let reply = tagged(TAG_REPLY, &[REPLY_NO_GAME]);
                    if !replies.contains(&reply) {
                        replies.push(reply);
                    }
                }
            }
            Item::Invite(body) => sink.on_invite(from, &body),
            Item::NoGame => sink.on_stream_gone(from, frame.stream),
            Item::Reply(code) => {
                tracing::warn!(stream = %frame.stream, code, "unexpected reply code");
            }
            Item::Unknown(tag) => {
                tracing::warn!(stream = %frame.stream, tag, "unknown item tag; dropped");
            }
        }
    }
    replies
}

/// Everything the core reports upward, as one closed set of variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Inbound {
        from: Destination,
        stream: StreamId,
        bytes: Vec<u8>,
    },
    Invite {
        from: Destination,
        bytes: Vec<u8>,
    },
    StreamGone {
        from: Destination,
        stream: StreamId,
    },
    Status {
        kind: TransportKind,
        direction: Direction,
        success: bool,
    },
    Control {
        title: String,
        msg: String,
    },
}

/// Sink that forwards every callback as an [`EngineEvent`] over a channel.
/// Inbound messages for streams not in the known set report `NoSuchStream`.
pub struct EventSink {
    known: Mutex<HashSet<StreamId>>,
    tx: mpsc::Sender<EngineEvent>,
}

impl EventSink {
    pub fn new() -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel();
        let sink = Self {
            known: Mutex::new(HashSet::new()),
            tx,
        };
        (sink, rx)
    }

    pub fn add_stream(&self, stream: StreamId) {
        self.known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(stream);
    }

    pub fn remove_stream(&self, stream: StreamId) {
        self.known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&stream);
    }

    fn emit(&self, event: EngineEvent) {
        // Receiver gone means the host is shutting down.
        let _ = self.tx.send(event);
    }
}

impl PayloadSink for EventSink {
    fn decode_inbound(&self, from: &Destination, stream: StreamId, bytes: &[u8]) -> DeliveryResult {
        let known = self
            .known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&stream);
        if !known {
            return DeliveryResult::NoSuchStream;
        }
        self.emit(EngineEvent::Inbound {
            from: from.clone(),
            stream,
            bytes: bytes.to_vec(),
        });
        DeliveryResult::Delivered
    }

    fn on_invite(&self, from: &Destination, invite: &[u8]) {
        self.emit(EngineEvent::Invite {
            from: from.clone(),
            bytes: invite.to_vec(),
        });
    }

    fn on_stream_gone(&self, from: &Destination, stream: StreamId) {
        self.emit(EngineEvent::StreamGone {
            from: from.clone(),
            stream,
        });
    }
}

impl StatusSink for EventSink {
    fn on_delivery_status(&self, kind: TransportKind, direction: Direction, success: bool) {
        self.emit(EngineEvent::Status {
            kind,
            direction,
            success,
        });
    }

    fn on_control_notice(&self, title: &str, msg: &str) {
        self.emit(EngineEvent::Control {
            title: title.to_string(),
            msg: msg.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{TAG_INVITE, TAG_MESSAGE};

    #[test]
    fn message_for_unknown_stream_yields_one_reply() {
        let (sink, rx) = EventSink::new();
        let frame = AppFrame {
            stream: StreamId(9),
            items: vec![tagged(TAG_MESSAGE, b"a"), tagged(TAG_MESSAGE, b"b")],
        };
        let replies = deliver_frame(&frame, &Destination::Tap, &sink);
        assert_eq!(replies, vec![vec![TAG_REPLY, REPLY_NO_GAME]]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn known_stream_and_invite_delivered() {
        let (sink, rx) = EventSink::new();
        sink.add_stream(StreamId(9));
        let frame = AppFrame {
            stream: StreamId(9),
            items: vec![tagged(TAG_MESSAGE, b"move"), tagged(TAG_INVITE, b"inv")],
        };
        assert!(deliver_frame(&frame, &Destination::Tap, &sink).is_empty());
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::Inbound {
                from: Destination::Tap,
                stream: StreamId(9),
                bytes: b"move".to_vec()
            }
        );
        assert!(matches!(rx.try_recv().unwrap(), EngineEvent::Invite { .. }));
    }

    #[test]
    fn no_game_reply_reports_stream_gone() {
        let (sink, rx) = EventSink::new();
        let frame = AppFrame {
            stream: StreamId(3),
            items: vec![tagged(TAG_REPLY, &[REPLY_NO_GAME])],
        };
        assert!(deliver_frame(&frame, &Destination::Tap, &sink).is_empty());
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::StreamGone {
                from: Destination::Tap,
                stream: StreamId(3)
            }
        );
    }
}
