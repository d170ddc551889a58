//! Tap exchange: handshake, initiator message loop, responder command handling,
//! inbound decode, and the read-mode duty cycle.
//!
//! The initiator transmits, the responder answers; every command gets exactly one
//! response. Each side's first frame of an envelope carries the id of the last
//! envelope it fully received, which retires the matching sent envelope on the far side.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use crate::chunk::{
    split_envelope, AckSlot, ChunkError, MsgIdAllocator, Reassembler, SentEnvelopes, CMD_MSG_PART,
};
use crate::engine::{deliver_frame, PayloadSink, StatusSink};
use crate::identity::{Destination, Direction, StreamId, TransportKind};
use crate::protocol::{decode_app_frame, decode_num, encode_app_frame, encode_num, FrameError};
use crate::storage::KvStore;
use crate::store::{Envelope, EnvelopeStore};

pub const VERSION_1: u8 = 0x01;

/// Application id selected during the handshake.
pub const DEFAULT_AID: [u8; 6] = [0xFC, 0x8F, 0xF5, 0x10, 0xB3, 0x60];

pub const STATUS_SUCCESS: [u8; 2] = [0x90, 0x00];
pub const STATUS_FAILED: [u8; 2] = [0x6F, 0x00];
pub const CLA_NOT_SUPPORTED: [u8; 2] = [0x6E, 0x00];
pub const INS_NOT_SUPPORTED: [u8; 2] = [0x6D, 0x00];

const SELECT_HEADER: [u8; 4] = [0x00, 0xA4, 0x04, 0x00];

/// Initiator frame ceiling unless the link allows less.
pub const DEFAULT_MAX_FRAME: usize = 50;

/// Responses are not bound by the initiator's transceive ceiling; the responder's
/// envelope always goes back as a single frame.
const RESPONDER_MAX_FRAME: usize = i16::MAX as usize;

/// Upper bound on initiator rounds in one tap, in case neither side goes quiet.
const MAX_ROUNDS: usize = 16;

const DEVICE_ID_KEY: &str = "tap.devid";

/// Error during a tap exchange.
#[derive(Debug, thiserror::Error)]
pub enum TapError {
    #[error("link error: {0}")]
    Link(String),
    #[error("remote answered with status {0:02X?}")]
    Status([u8; 2]),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Proximity link as seen by the initiator: one blocking request/response at a time.
pub trait TapLink {
    fn max_transceive(&self) -> usize;
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TapError>;
}

/// Read this device's tap id from `kv`, creating a random non-zero one on first use.
pub fn load_device_id(kv: &dyn KvStore) -> u32 {
    if let Ok(Some(bytes)) = kv.get(DEVICE_ID_KEY) {
        if let Ok(arr) = <[u8; 4]>::try_from(bytes.as_slice()) {
            let id = u32::from_be_bytes(arr);
            if id != 0 {
                return id;
            }
        }
    }
    let id: u32 = rand::thread_rng().gen_range(1..=i32::MAX as u32);
    if let Err(e) = kv.set(DEVICE_ID_KEY, &id.to_be_bytes()) {
        tracing::warn!(error = %e, "failed to persist tap device id");
    }
    id
}

/// Outcome of one responder command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub response: Vec<u8>,
    /// A fully reassembled application frame to hand to the decode queue.
    pub payload: Option<Vec<u8>>,
}

/// One device's side of the tap exchange, usable as initiator or responder.
pub struct TapEndpoint {
    device_id: u32,
    aid: Vec<u8>,
    max_frame: usize,
    store: Arc<EnvelopeStore<StreamId>>,
    status: Arc<dyn StatusSink>,
    active_stream: AtomicU32,
    ids: MsgIdAllocator,
    ack: AckSlot,
    sent: SentEnvelopes<Envelope<StreamId>>,
    last_sent: Mutex<Option<(u32, Envelope<StreamId>)>>,
    reassembler: Mutex<Reassembler>,
    /// Device id of the peer in the current exchange.
    remote: AtomicU32,
    /// `(remote, msg_id)` of the envelope last handed up, to drop in-tap resends.
    last_delivered: Mutex<Option<(u32, u32)>>,
}

impl TapEndpoint {
    pub fn new(
        device_id: u32,
        max_frame: usize,
        store: Arc<EnvelopeStore<StreamId>>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            device_id,
            aid: DEFAULT_AID.to_vec(),
            max_frame,
            store,
            status,
            active_stream: AtomicU32::new(0),
            ids: MsgIdAllocator::new(),
            ack: AckSlot::new(),
            sent: SentEnvelopes::new(),
            last_sent: Mutex::new(None),
            reassembler: Mutex::new(Reassembler::new()),
            remote: AtomicU32::new(0),
            last_delivered: Mutex::new(None),
        }
    }

    pub fn with_aid(mut self, aid: &[u8]) -> Self {
        self.aid = aid.to_vec();
        self
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn store(&self) -> &Arc<EnvelopeStore<StreamId>> {
        &self.store
    }

    /// The stream whose envelope goes out on the next tap.
    pub fn set_active_stream(&self, stream: StreamId) {
        self.active_stream.store(stream.0, Ordering::SeqCst);
    }

    pub fn active_stream(&self) -> StreamId {
        StreamId(self.active_stream.load(Ordering::SeqCst))
    }

    /// Frames for the active stream's pending envelope (one ack-only frame if none).
    /// Returns the msg id used (0 when nothing was pending) and the ack carried.
    fn build_frames(&self, max_frame: usize) -> Result<(u32, u32, Vec<Vec<u8>>), TapError> {
        let stream = self.active_stream();
        let envelope = self.store.snapshot_for(&stream);
        let payload = if envelope.is_empty() {
            Vec::new()
        } else {
            encode_app_frame(stream, &envelope.items)?
        };
        let msg_id = if envelope.is_empty() {
            0
        } else {
            let mut last = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
            match last.as_ref() {
                // Unchanged and unacked: resend under the same id.
                Some((id, prev)) if *prev == envelope => *id,
                _ => {
                    let id = self.ids.next_id();
                    self.sent.remember(id, envelope.clone());
                    *last = Some((id, envelope));
                    id
                }
            }
        };
        let ack = self.ack.take();
        match split_envelope(&payload, msg_id, ack, max_frame) {
            Ok(frames) => {
                if msg_id != 0 {
                    tracing::debug!(msg_id, ack, frames = frames.len(), "wrapped envelope");
                }
                Ok((msg_id, ack, frames))
            }
            Err(e) => {
                if ack != 0 {
                    self.ack.record(ack);
                }
                Err(e.into())
            }
        }
    }

    /// Feed one message-part frame. Returns a newly completed application frame.
    fn accept_frame(&self, frame: &[u8]) -> Result<Option<Vec<u8>>, TapError> {
        let outcome = self
            .reassembler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .accept(frame)?;
        if let Some(ack) = outcome.ack {
            self.confirm(ack);
        }
        let Some(done) = outcome.completed else {
            return Ok(None);
        };
        if done.msg_id == 0 {
            return Ok(None);
        }
        self.ack.record(done.msg_id);
        let key = (self.remote.load(Ordering::SeqCst), done.msg_id);
        let repeat = self
            .last_delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(key)
            == Some(key);
        if repeat {
            tracing::debug!(remote = key.0, msg_id = key.1, "repeat of delivered envelope; re-acked");
            return Ok(None);
        }
        self.status
            .on_delivery_status(TransportKind::Tap, Direction::Inbound, true);
        Ok(Some(done.payload))
    }

    /// A handshake starts a new exchange: ids seen so far belong to the previous peer.
    fn begin_exchange(&self, remote: u32) {
        let previous = self.remote.swap(remote, Ordering::SeqCst);
        *self.last_delivered.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let stale = self.ack.take();
        if stale != 0 {
            tracing::debug!(previous, remote, ack = stale, "unsent ack discarded on new handshake");
        }
    }

    fn confirm(&self, ack: u32) {
        let Some(envelope) = self.sent.confirm(ack) else {
            tracing::debug!(ack, "ack for unknown msg id");
            return;
        };
        let removed = self.store.remove_confirmed(&envelope.key, &envelope.items);
        tracing::debug!(ack, removed, stream = %envelope.key, "envelope acknowledged");
        let mut last = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
        if last.as_ref().is_some_and(|(id, _)| *id == ack) {
            *last = None;
        }
        drop(last);
        self.status
            .on_delivery_status(TransportKind::Tap, Direction::Outbound, true);
    }

    /// Handshake command the initiator sends first.
    pub fn hello(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.extend_from_slice(&SELECT_HEADER);
        out.push(self.aid.len() as u8);
        out.extend_from_slice(&self.aid);
        out.push(VERSION_1); // min
        out.push(VERSION_1); // max
        out.extend_from_slice(&encode_num(self.device_id as i64));
        out.extend_from_slice(&encode_num(self.active_stream().0 as i64));
        out
    }

    /// Run the initiator side over `link` until both sides go quiet or the link drops.
    /// Completed inbound payloads go to `on_payload` as soon as they arrive.
    pub fn run_initiator(
        &self,
        link: &mut dyn TapLink,
        on_payload: &mut dyn FnMut(Vec<u8>),
    ) -> Result<usize, TapError> {
        let response = link.transceive(&self.hello())?;
        let rest = expect_success(&response)?;
        let (&version, rest) = rest
            .split_first()
            .ok_or_else(|| TapError::Handshake("empty hello response".into()))?;
        if version != VERSION_1 {
            return Err(TapError::Handshake(format!("remote version {}", version)));
        }
        let (remote, _) = decode_num(rest)?;
        tracing::debug!(remote, "tap handshake complete");
        self.begin_exchange(remote as u32);

        let max_frame = self.max_frame.min(link.max_transceive());
        let mut rounds = 0;
        while rounds < MAX_ROUNDS {
            rounds += 1;
            let (msg_id, ack, frames) = self.build_frames(max_frame)?;
            let mut got_new = false;
            for frame in frames {
                let response = link.transceive(&frame)?;
                let body = expect_success(&response)?;
                if body.starts_with(&CMD_MSG_PART) {
                    match self.accept_frame(body) {
                        Ok(Some(payload)) => {
                            got_new = true;
                            on_payload(payload);
                        }
                        Ok(None) => {}
                        Err(e) => tracing::debug!(error = %e, "discarding response frame"),
                    }
                }
            }
            if msg_id == 0 && ack == 0 && !got_new {
                break;
            }
        }
        Ok(rounds)
    }

    /// Responder side: answer one command from the initiator.
    pub fn process_command(&self, apdu: &[u8]) -> CommandOutcome {
        if apdu.starts_with(&CMD_MSG_PART) {
            let payload = match self.accept_frame(apdu) {
                Ok(p) => p,
                Err(e) => {
                    tracing::debug!(error = %e, "discarding command frame");
                    None
                }
            };
            let mut response = STATUS_SUCCESS.to_vec();
            match self.build_frames(RESPONDER_MAX_FRAME) {
                Ok((_, _, frames)) => {
                    if let Some(first) = frames.first() {
                        response.extend_from_slice(first);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "cannot wrap outbound envelope"),
            }
            return CommandOutcome { response, payload };
        }
        let response = match self.parse_hello(apdu) {
            Ok(()) => {
                let mut r = STATUS_SUCCESS.to_vec();
                r.push(VERSION_1);
                r.extend_from_slice(&encode_num(self.device_id as i64));
                r
            }
            Err(status) => status.to_vec(),
        };
        CommandOutcome {
            response,
            payload: None,
        }
    }

    fn parse_hello(&self, apdu: &[u8]) -> Result<(), [u8; 2]> {
        if apdu.first() != Some(&SELECT_HEADER[0]) {
            return Err(CLA_NOT_SUPPORTED);
        }
        if apdu.get(1) != Some(&SELECT_HEADER[1]) {
            return Err(INS_NOT_SUPPORTED);
        }
        let rest = apdu.get(SELECT_HEADER.len()..).ok_or(STATUS_FAILED)?;
        let (&aid_len, rest) = rest.split_first().ok_or(STATUS_FAILED)?;
        let aid_len = aid_len as usize;
        if rest.len() < aid_len + 2 {
            return Err(STATUS_FAILED);
        }
        if rest[..aid_len] != self.aid[..] {
            tracing::warn!("aid mismatch");
            return Err(STATUS_FAILED);
        }
        let (min_version, rest) = (rest[aid_len], &rest[aid_len + 2..]);
        if min_version != VERSION_1 {
            tracing::warn!(min_version, "unsupported tap version");
            return Err(STATUS_FAILED);
        }
        let (remote, n) = decode_num(rest).map_err(|_| STATUS_FAILED)?;
        let (stream, _) = decode_num(&rest[n..]).map_err(|_| STATUS_FAILED)?;
        tracing::debug!(remote, stream, "tap hello");
        self.begin_exchange(remote as u32);
        self.set_active_stream(StreamId(stream as u32));
        Ok(())
    }

    /// Decode a reassembled application frame into `sink`. A message for an unknown
    /// stream queues a no-game reply for the next exchange.
    pub fn decode_inbound(&self, payload: &[u8], sink: &dyn PayloadSink) -> Result<(), TapError> {
        let frame = decode_app_frame(payload)?;
        for reply in deliver_frame(&frame, &Destination::Tap, sink) {
            self.store.add_tagged_if_absent(&frame.stream, reply);
        }
        Ok(())
    }
}

fn expect_success(response: &[u8]) -> Result<&[u8], TapError> {
    match response.strip_prefix(&STATUS_SUCCESS[..]) {
        Some(rest) => Ok(rest),
        None => {
            let mut status = [0u8; 2];
            for (dst, src) in status.iter_mut().zip(response) {
                *dst = *src;
            }
            Err(TapError::Status(status))
        }
    }
}

/// What the read-mode loop should do after one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadModeStep {
    /// `Some(on)` when reader mode must be switched.
    pub toggle: Option<bool>,
    /// How long to wait before evaluating again; `None` means until woken.
    pub sleep: Option<Duration>,
}

/// Alternates passive read mode at a randomized interval to avoid lock-step with
/// other readers. Data pending forces read mode on; an active connection holds it.
#[derive(Debug, Clone)]
pub struct ReadModePolicy {
    min: Duration,
    max: Duration,
    in_read_mode: bool,
}

impl ReadModePolicy {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            in_read_mode: false,
        }
    }

    pub fn in_read_mode(&self) -> bool {
        self.in_read_mode
    }

    pub fn step<R: Rng>(&mut self, connected: bool, have_data: bool, rng: &mut R) -> ReadModeStep {
        let want = connected || (!self.in_read_mode && have_data);
        let toggle = (want != self.in_read_mode).then_some(want);
        self.in_read_mode = want;
        let sleep = if (self.in_read_mode && !connected) || have_data {
            let span = (self.max - self.min).as_millis() as u64;
            let jitter = if span == 0 { 0 } else { rng.gen_range(0..span) };
            Some(self.min + Duration::from_millis(jitter))
        } else {
            None
        };
        ReadModeStep { toggle, sleep }
    }

    /// Reader mode must be off when the loop exits.
    pub fn shutdown(&mut self) -> bool {
        std::mem::replace(&mut self.in_read_mode, false)
    }
}

impl Default for ReadModePolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(300), Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineEvent, EventSink};
    use crate::protocol::TAG_MESSAGE;
    use crate::storage::MemoryKvStore;

    struct Peer {
        endpoint: TapEndpoint,
        sink: Arc<EventSink>,
        events: std::sync::mpsc::Receiver<EngineEvent>,
    }

    fn peer(device_id: u32) -> Peer {
        let (sink, events) = EventSink::new();
        let sink = Arc::new(sink);
        let store = Arc::new(EnvelopeStore::new());
        let endpoint = TapEndpoint::new(device_id, DEFAULT_MAX_FRAME, store, sink.clone());
        Peer {
            endpoint,
            sink,
            events,
        }
    }

    /// Initiator-side link straight into a responder, decoding inline.
    struct DirectLink<'a> {
        responder: &'a Peer,
        max: usize,
        sizes: Vec<usize>,
    }

    impl TapLink for DirectLink<'_> {
        fn max_transceive(&self) -> usize {
            self.max
        }
        fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TapError> {
            self.sizes.push(command.len());
            let out = self.responder.endpoint.process_command(command);
            if let Some(p) = out.payload {
                self.responder
                    .endpoint
                    .decode_inbound(&p, self.responder.sink.as_ref())?;
            }
            Ok(out.response)
        }
    }

    fn inbound(events: &std::sync::mpsc::Receiver<EngineEvent>) -> Vec<Vec<u8>> {
        events
            .try_iter()
            .filter_map(|e| match e {
                EngineEvent::Inbound { bytes, .. } => Some(bytes),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn full_exchange_both_directions() {
        let a = peer(11);
        let b = peer(22);
        let stream = StreamId(0x1234);
        a.sink.add_stream(stream);
        b.sink.add_stream(stream);
        a.endpoint.set_active_stream(stream);
        let big: Vec<u8> = (0..500).map(|i| i as u8).collect();
        a.endpoint.store().add_if_absent(&stream, TAG_MESSAGE, &big);
        b.endpoint.store().add_if_absent(&stream, TAG_MESSAGE, b"reply");

        let mut link = DirectLink {
            responder: &b,
            max: 64,
            sizes: Vec::new(),
        };
        let mut got = Vec::new();
        a.endpoint
            .run_initiator(&mut link, &mut |p| got.push(p))
            .unwrap();
        assert!(link.sizes.iter().all(|&n| n <= DEFAULT_MAX_FRAME));

        for p in &got {
            a.endpoint.decode_inbound(p, a.sink.as_ref()).unwrap();
        }
        assert_eq!(inbound(&b.events), vec![big]);
        assert_eq!(inbound(&a.events), vec![b"reply".to_vec()]);
        // both envelopes were acknowledged and retired
        assert!(!a.endpoint.store().has_data(&stream));
        assert!(!b.endpoint.store().has_data(&stream));
    }

    fn tap(initiator: &Peer, responder: &Peer) {
        let mut link = DirectLink {
            responder,
            max: DEFAULT_MAX_FRAME,
            sizes: Vec::new(),
        };
        let mut got = Vec::new();
        initiator
            .endpoint
            .run_initiator(&mut link, &mut |p| got.push(p))
            .unwrap();
        for p in &got {
            initiator
                .endpoint
                .decode_inbound(p, initiator.sink.as_ref())
                .unwrap();
        }
    }

    fn send(p: &Peer, stream: StreamId, body: &[u8]) {
        p.endpoint.set_active_stream(stream);
        p.endpoint.store().add_if_absent(&stream, TAG_MESSAGE, body);
    }

    #[test]
    fn two_peers_with_same_first_id_both_delivered() {
        let a = peer(11);
        let b = peer(22);
        let c = peer(33);
        let stream = StreamId(5);
        b.sink.add_stream(stream);
        send(&a, stream, b"from-a");
        send(&c, stream, b"from-c");

        tap(&a, &b);
        tap(&c, &b);

        assert_eq!(inbound(&b.events), vec![b"from-a".to_vec(), b"from-c".to_vec()]);
        assert!(!a.endpoint.store().has_data(&stream));
        assert!(!c.endpoint.store().has_data(&stream));
    }

    #[test]
    fn restarted_sender_reusing_id_is_delivered() {
        let b = peer(22);
        let stream = StreamId(5);
        b.sink.add_stream(stream);

        let a = peer(11);
        send(&a, stream, b"before");
        tap(&a, &b);
        drop(a);

        // same device id, fresh id counter
        let a = peer(11);
        send(&a, stream, b"after");
        tap(&a, &b);

        assert_eq!(inbound(&b.events), vec![b"before".to_vec(), b"after".to_vec()]);
        assert!(!a.endpoint.store().has_data(&stream));
    }

    #[test]
    fn handshake_drops_ack_owed_to_previous_peer() {
        let b = peer(22);
        let c = peer(33);
        // A's envelope was received but the tap ended before the ack went back.
        b.endpoint.ack.record(1);
        let out = b.endpoint.process_command(&c.endpoint.hello());
        assert!(out.response.starts_with(&STATUS_SUCCESS));
        assert_eq!(b.endpoint.ack.peek(), 0);
    }

    #[test]
    fn unknown_stream_queues_no_game_reply() {
        let a = peer(1);
        let b = peer(2);
        let stream = StreamId(77);
        a.endpoint.set_active_stream(stream);
        a.endpoint.store().add_if_absent(&stream, TAG_MESSAGE, b"hi");
        let mut link = DirectLink {
            responder: &b,
            max: 50,
            sizes: Vec::new(),
        };
        let mut got = Vec::new();
        a.endpoint.run_initiator(&mut link, &mut |p| got.push(p)).unwrap();
        for p in &got {
            a.endpoint.decode_inbound(p, a.sink.as_ref()).unwrap();
        }
        let gone: Vec<EngineEvent> = a.events.try_iter().collect();
        assert!(gone.contains(&EngineEvent::StreamGone {
            from: Destination::Tap,
            stream
        }));
        // reply was acked too
        assert!(!b.endpoint.store().has_data(&stream));
    }

    #[test]
    fn hello_rejected_on_aid_mismatch() {
        let a = peer(1);
        let b = TapEndpoint::new(
            2,
            DEFAULT_MAX_FRAME,
            Arc::new(EnvelopeStore::new()),
            a.sink.clone(),
        )
        .with_aid(&[1, 2, 3]);
        let out = b.process_command(&a.endpoint.hello());
        assert_eq!(out.response, STATUS_FAILED.to_vec());
        assert_eq!(b.process_command(&[0x80, 0xA4]).response, CLA_NOT_SUPPORTED.to_vec());
        assert_eq!(b.process_command(&[0x00, 0xB0]).response, INS_NOT_SUPPORTED.to_vec());
    }

    #[test]
    fn hello_sets_responder_stream() {
        let a = peer(5);
        let b = peer(6);
        a.endpoint.set_active_stream(StreamId(0xABCD));
        let out = b.endpoint.process_command(&a.endpoint.hello());
        assert!(out.response.starts_with(&STATUS_SUCCESS));
        assert_eq!(out.response[2], VERSION_1);
        assert_eq!(b.endpoint.active_stream(), StreamId(0xABCD));
    }

    #[test]
    fn superseded_envelope_ack_removes_only_original() {
        let a = peer(1);
        let stream = StreamId(3);
        a.endpoint.set_active_stream(stream);
        a.endpoint.store().add_if_absent(&stream, TAG_MESSAGE, b"first");
        let (msg_id, _, _) = a.endpoint.build_frames(50).unwrap();
        a.endpoint.store().add_if_absent(&stream, TAG_MESSAGE, b"second");
        a.endpoint.confirm(msg_id);
        let left = a.endpoint.store().snapshot_for(&stream);
        assert_eq!(left.items, vec![crate::protocol::tagged(TAG_MESSAGE, b"second")]);
    }

    #[test]
    fn unchanged_envelope_keeps_msg_id() {
        let a = peer(1);
        let stream = StreamId(3);
        a.endpoint.set_active_stream(stream);
        a.endpoint.store().add_if_absent(&stream, TAG_MESSAGE, b"x");
        let (id1, _, _) = a.endpoint.build_frames(50).unwrap();
        let (id2, _, _) = a.endpoint.build_frames(50).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(a.endpoint.sent.len(), 1);
    }

    #[test]
    fn link_failure_surfaces() {
        struct Dead;
        impl TapLink for Dead {
            fn max_transceive(&self) -> usize {
                50
            }
            fn transceive(&mut self, _: &[u8]) -> Result<Vec<u8>, TapError> {
                Err(TapError::Link("tag lost".into()))
            }
        }
        let a = peer(1);
        assert!(matches!(
            a.endpoint.run_initiator(&mut Dead, &mut |_| {}),
            Err(TapError::Link(_))
        ));
    }

    #[test]
    fn device_id_persisted() {
        let kv = MemoryKvStore::new();
        let id = load_device_id(&kv);
        assert_ne!(id, 0);
        assert_eq!(load_device_id(&kv), id);
    }

    #[test]
    fn read_mode_duty_cycle() {
        let mut rng = rand::thread_rng();
        let mut p = ReadModePolicy::default();
        // idle, nothing pending: stay off and sleep until woken
        assert_eq!(
            p.step(false, false, &mut rng),
            ReadModeStep {
                toggle: None,
                sleep: None
            }
        );
        // data pending forces read mode on with a jittered wait
        let s = p.step(false, true, &mut rng);
        assert_eq!(s.toggle, Some(true));
        let d = s.sleep.unwrap();
        assert!(d >= Duration::from_millis(300) && d < Duration::from_millis(500));
        // next tick alternates off while data still pending
        assert_eq!(p.step(false, true, &mut rng).toggle, Some(false));
        // a live connection holds read mode and waits to be woken
        let s = p.step(true, false, &mut rng);
        assert_eq!(s.toggle, Some(true));
        assert_eq!(s.sleep, None);
        assert!(p.shutdown());
        assert!(!p.in_read_mode());
    }
}
