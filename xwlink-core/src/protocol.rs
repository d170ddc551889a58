//! Application frame shared by every transport, plus the typed items it carries.
//!
//! Frame: `[streamId:4 BE][count:1]{[len:2 LE][item]}`; item: `[tag:1][body]`.

use crate::identity::StreamId;

/// Item type tags.
pub const TAG_MESSAGE: u8 = 0x01;
pub const TAG_INVITE: u8 = 0x02;
pub const TAG_REPLY: u8 = 0x03;

/// Body of a REPLY item meaning "no such game here".
pub const REPLY_NO_GAME: u8 = 0x00;

const FRAME_HEADER: usize = 5;
const ITEM_LEN_SIZE: usize = 2;

/// One decoded item from an application frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Message(Vec<u8>),
    Invite(Vec<u8>),
    /// Peer has no stream matching the one we sent on.
    NoGame,
    /// Reply with a code this build does not know.
    Reply(u8),
    Unknown(u8),
}

impl Item {
    /// Parse a tagged item (`[tag][body]`). Empty input is not an item.
    pub fn parse(raw: &[u8]) -> Option<Item> {
        let (&tag, body) = raw.split_first()?;
        Some(match tag {
            TAG_MESSAGE => Item::Message(body.to_vec()),
            TAG_INVITE => Item::Invite(body.to_vec()),
            TAG_REPLY => match body.first() {
                Some(&REPLY_NO_GAME) => Item::NoGame,
                Some(&code) => Item::Reply(code),
                None => Item::Unknown(tag),
            },
            other => Item::Unknown(other),
        })
    }
}

/// Prefix `body` with its tag, the form items take in stores and frames.
pub fn tagged(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(tag);
    out.extend_from_slice(body);
    out
}

/// Decoded application frame: stream and raw tagged items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppFrame {
    pub stream: StreamId,
    pub items: Vec<Vec<u8>>,
}

impl AppFrame {
    pub fn parsed_items(&self) -> impl Iterator<Item = Item> + '_ {
        self.items.iter().filter_map(|raw| Item::parse(raw))
    }
}

/// Error encoding or decoding an application frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated")]
    Truncated,
    #[error("too many items: {0}")]
    TooManyItems(usize),
    #[error("item too large: {0} bytes")]
    ItemTooLarge(usize),
}

/// Encode items for one stream into an application frame.
pub fn encode_app_frame(stream: StreamId, items: &[Vec<u8>]) -> Result<Vec<u8>, FrameError> {
    if items.len() > u8::MAX as usize {
        return Err(FrameError::TooManyItems(items.len()));
    }
    let body_len: usize = items.iter().map(|i| ITEM_LEN_SIZE + i.len()).sum();
    let mut out = Vec::with_capacity(FRAME_HEADER + body_len);
    out.extend_from_slice(&stream.0.to_be_bytes());
    out.push(items.len() as u8);
    for item in items {
        let len = u16::try_from(item.len()).map_err(|_| FrameError::ItemTooLarge(item.len()))?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(item);
    }
    Ok(out)
}

/// Decode an application frame. Trailing bytes after the declared items are ignored.
pub fn decode_app_frame(bytes: &[u8]) -> Result<AppFrame, FrameError> {
    if bytes.len() < FRAME_HEADER {
        return Err(FrameError::Truncated);
    }
    let stream = StreamId(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
    let count = bytes[4] as usize;
    let mut items = Vec::with_capacity(count);
    let mut pos = FRAME_HEADER;
    for _ in 0..count {
        if bytes.len() < pos + ITEM_LEN_SIZE {
            return Err(FrameError::Truncated);
        }
        let len = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]) as usize;
        pos += ITEM_LEN_SIZE;
        if bytes.len() < pos + len {
            return Err(FrameError::Truncated);
        }
        items.push(bytes[pos..pos + len].to_vec());
        pos += len;
    }
    Ok(AppFrame { stream, items })
}

/// Encode a number as `[len:1][minimal big-endian two's-complement bytes]`.
pub fn encode_num(n: i64) -> Vec<u8> {
    let bytes = n.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        let redundant = (b == 0x00 && next & 0x80 == 0) || (b == 0xFF && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    let mut out = Vec::with_capacity(1 + bytes.len() - start);
    out.push((bytes.len() - start) as u8);
    out.extend_from_slice(&bytes[start..]);
    out
}

/// Decode a number written by [`encode_num`]. Returns the value and bytes consumed.
pub fn decode_num(bytes: &[u8]) -> Result<(i64, usize), FrameError> {
    let (&len, rest) = bytes.split_first().ok_or(FrameError::Truncated)?;
    let len = len as usize;
    if len == 0 || len > 8 || rest.len() < len {
        return Err(FrameError::Truncated);
    }
    let fill = if rest[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut buf = [fill; 8];
    buf[8 - len..].copy_from_slice(&rest[..len]);
    Ok((i64::from_be_bytes(buf), 1 + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_frame_layout() {
        let items = vec![tagged(TAG_MESSAGE, b"hi"), tagged(TAG_INVITE, b"")];
        let bytes = encode_app_frame(StreamId(0x1234), &items).unwrap();
        assert_eq!(&bytes[..5], &[0x00, 0x00, 0x12, 0x34, 2]);
        // first item length is little-endian
        assert_eq!(&bytes[5..7], &[3, 0]);
        let frame = decode_app_frame(&bytes).unwrap();
        assert_eq!(frame.stream, StreamId(0x1234));
        assert_eq!(frame.items, items);
        let parsed: Vec<Item> = frame.parsed_items().collect();
        assert_eq!(parsed, vec![Item::Message(b"hi".to_vec()), Item::Invite(vec![])]);
    }

    #[test]
    fn truncated_item_rejected() {
        let bytes = encode_app_frame(StreamId(7), &[tagged(TAG_MESSAGE, b"hello")]).unwrap();
        assert_eq!(
            decode_app_frame(&bytes[..bytes.len() - 1]),
            Err(FrameError::Truncated)
        );
        assert_eq!(decode_app_frame(&bytes[..3]), Err(FrameError::Truncated));
    }

    #[test]
    fn too_many_items() {
        let items = vec![vec![TAG_MESSAGE]; 256];
        assert_eq!(
            encode_app_frame(StreamId(1), &items),
            Err(FrameError::TooManyItems(256))
        );
    }

    #[test]
    fn reply_items() {
        assert_eq!(Item::parse(&[TAG_REPLY, REPLY_NO_GAME]), Some(Item::NoGame));
        assert_eq!(Item::parse(&[TAG_REPLY, 9]), Some(Item::Reply(9)));
        assert_eq!(Item::parse(&[0x42]), Some(Item::Unknown(0x42)));
        assert_eq!(Item::parse(&[]), None);
    }

    #[test]
    fn num_minimal_encoding() {
        assert_eq!(encode_num(0), vec![1, 0x00]);
        assert_eq!(encode_num(127), vec![1, 0x7F]);
        assert_eq!(encode_num(128), vec![2, 0x00, 0x80]);
        assert_eq!(encode_num(0x7FFF), vec![2, 0x7F, 0xFF]);
        assert_eq!(encode_num(-1), vec![1, 0xFF]);
        for n in [0i64, 1, 127, 128, 255, 0x7FFF, 0x8000, -1, -129, i64::MAX, i64::MIN] {
            let enc = encode_num(n);
            assert_eq!(decode_num(&enc).unwrap(), (n, enc.len()));
        }
    }

    #[test]
    fn num_truncated() {
        assert!(decode_num(&[]).is_err());
        assert!(decode_num(&[2, 0x01]).is_err());
        assert!(decode_num(&[0]).is_err());
    }
}
