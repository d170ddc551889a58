//! Tap-exchange framing: split an envelope into size-limited frames, reassemble them,
//! and track the piggy-backed acknowledgment.
//!
//! Frame: `[70 FC][index:1][count:1]` then, on index 0 only, `[num msgId][num ack]`,
//! then a payload chunk. Numbers use [`crate::protocol::encode_num`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::protocol::{decode_num, encode_num};

/// Command prefix of every message-part frame.
pub const CMD_MSG_PART: [u8; 2] = [0x70, 0xFC];

/// Bytes reserved per frame for the header, sized for the largest index-0 header.
pub const HEADER_SIZE: usize = 10;

/// Largest message id; keeps each encoded id within three bytes.
pub const MAX_MSG_ID: u32 = 0x7FFF;

/// Error building or parsing tap-exchange frames.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("frame ceiling {0} leaves no room for payload")]
    FrameTooSmall(usize),
    #[error("envelope needs {0} frames; at most 255 allowed")]
    TooManyChunks(usize),
    #[error("not a message-part frame")]
    NotMsgPart,
    #[error("frame truncated")]
    Truncated,
    #[error("chunk {got} of {count} out of sequence (expected {expected})")]
    OutOfSequence { got: u8, expected: u8, count: u8 },
    #[error("chunk count {got} does not match in-progress count {expected}")]
    CountMismatch { got: u8, expected: u8 },
}

/// Allocates message ids in `1..=MAX_MSG_ID`, wrapping. Zero is reserved for "nothing".
#[derive(Debug, Default)]
pub struct MsgIdAllocator(AtomicU32);

impl MsgIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u32 {
        let prev = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(if v >= MAX_MSG_ID { 1 } else { v + 1 })
            })
            .unwrap_or(0);
        if prev >= MAX_MSG_ID {
            1
        } else {
            prev + 1
        }
    }
}

/// Number of frames `len` bytes need under `max_frame`: at least one, so an empty
/// envelope still carries the ack.
pub fn frame_count(len: usize, max_frame: usize) -> Result<usize, ChunkError> {
    let per = max_frame
        .checked_sub(HEADER_SIZE)
        .filter(|&p| p > 0)
        .ok_or(ChunkError::FrameTooSmall(max_frame))?;
    let count = len.div_ceil(per).max(1);
    if count > u8::MAX as usize {
        return Err(ChunkError::TooManyChunks(count));
    }
    Ok(count)
}

/// Split `payload` into frames no longer than `max_frame`. `msg_id` is 0 iff `payload` is empty.
pub fn split_envelope(
    payload: &[u8],
    msg_id: u32,
    ack: u32,
    max_frame: usize,
) -> Result<Vec<Vec<u8>>, ChunkError> {
    let count = frame_count(payload.len(), max_frame)?;
    let per = max_frame - HEADER_SIZE;
    let mut frames = Vec::with_capacity(count);
    let mut chunks = payload.chunks(per);
    for index in 0..count {
        let mut frame = Vec::with_capacity(max_frame);
        frame.extend_from_slice(&CMD_MSG_PART);
        frame.push(index as u8);
        frame.push(count as u8);
        if index == 0 {
            frame.extend_from_slice(&encode_num(msg_id as i64));
            frame.extend_from_slice(&encode_num(ack as i64));
        }
        if let Some(chunk) = chunks.next() {
            frame.extend_from_slice(chunk);
        }
        frames.push(frame);
    }
    Ok(frames)
}

/// A reassembled envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub msg_id: u32,
    pub payload: Vec<u8>,
}

/// What one accepted frame produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FrameOutcome {
    /// Ack carried by an index-0 frame, if non-zero.
    pub ack: Option<u32>,
    pub completed: Option<Completed>,
}

struct Partial {
    msg_id: u32,
    count: u8,
    next: u8,
    buf: Vec<u8>,
}

/// Single-buffer reassembler. Any chunk out of sequence discards the partial envelope;
/// the sender has to start again from chunk 0.
#[derive(Default)]
pub struct Reassembler {
    partial: Option<Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Accept one frame (including the `70 FC` prefix).
    pub fn accept(&mut self, frame: &[u8]) -> Result<FrameOutcome, ChunkError> {
        let rest = frame
            .strip_prefix(&CMD_MSG_PART[..])
            .ok_or(ChunkError::NotMsgPart)?;
        if rest.len() < 2 {
            return Err(ChunkError::Truncated);
        }
        let (index, count) = (rest[0], rest[1]);
        let mut body = &rest[2..];
        let mut outcome = FrameOutcome::default();

        if index == 0 {
            let (msg_id, n) = decode_num(body).map_err(|_| ChunkError::Truncated)?;
            body = &body[n..];
            let (ack, n) = decode_num(body).map_err(|_| ChunkError::Truncated)?;
            body = &body[n..];
            if ack > 0 {
                outcome.ack = Some(ack as u32);
            }
            if let Some(stale) = self.partial.take() {
                tracing::debug!(msg_id = stale.msg_id, "restart discards partial envelope");
            }
            self.partial = Some(Partial {
                msg_id: msg_id.max(0) as u32,
                count,
                next: 0,
                buf: Vec::new(),
            });
        }

        let Some(partial) = self.partial.as_mut() else {
            return Err(ChunkError::OutOfSequence {
                got: index,
                expected: 0,
                count,
            });
        };
        if index != partial.next {
            let expected = partial.next;
            self.partial = None;
            return Err(ChunkError::OutOfSequence {
                got: index,
                expected,
                count,
            });
        }
        if count != partial.count || index >= count {
            let expected = partial.count;
            self.partial = None;
            return Err(ChunkError::CountMismatch {
                got: count,
                expected,
            });
        }
        partial.buf.extend_from_slice(body);
        partial.next += 1;
        if partial.next == partial.count {
            if let Some(done) = self.partial.take() {
                outcome.completed = Some(Completed {
                    msg_id: done.msg_id,
                    payload: done.buf,
                });
            }
        }
        Ok(outcome)
    }
}

/// One-slot "latest received msg id to acknowledge". A newer id overwrites an unsent one.
#[derive(Debug, Default)]
pub struct AckSlot(AtomicU32);

impl AckSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, msg_id: u32) {
        let old = self.0.swap(msg_id, Ordering::SeqCst);
        if old != 0 && old != msg_id {
            tracing::warn!(dropped = old, msg_id, "ack overwritten before it was sent");
        }
    }

    /// Take the pending ack (0 if none), leaving the slot empty.
    pub fn take(&self) -> u32 {
        self.0.swap(0, Ordering::SeqCst)
    }

    pub fn peek(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Envelopes sent but not yet acknowledged, by msg id.
pub struct SentEnvelopes<T> {
    map: Mutex<HashMap<u32, T>>,
}

impl<T> SentEnvelopes<T> {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn remember(&self, msg_id: u32, envelope: T) {
        if msg_id != 0 {
            self.map
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(msg_id, envelope);
        }
    }

    /// Remove and return what `ack` confirms.
    pub fn confirm(&self, ack: u32) -> Option<T> {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ack)
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for SentEnvelopes<T> {
    fn default() -> Self {
        Self::new()
    }
}
