//! Wire message model for the multiplexed bus.
//!
//! Every message is a 6-byte big-endian header (`channel:u16`, `type:u16`,
//! `size:u16`) followed by `size` body bytes. In memory the body is held as
//! a list of segments so large payloads can be sent straight out of a
//! memory map without copying.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use memmap2::Mmap;
use std::sync::Arc;

pub const HEADER_LEN: usize = 6;
pub const MAX_BODY: usize = 65_535;
pub const MAX_SEGMENTS: usize = 8;

/// The control channel pre-created on every connection.
pub const CONTROL_CHANNEL: u16 = 0xFFFF;

/// System control message types. Application types must stay below the
/// reserved range.
pub mod sys {
    /// First reserved type value; everything at or above is system traffic.
    pub const RESERVED_BASE: u16 = 0xFFF8;

    /// Process-local: a freshly accepted channel is ready for a consumer.
    /// Never valid on the wire.
    pub const NEW_CONNECTION: u16 = 0xFFF8;
    /// Process-local: a channel's connection went away. Never valid on the
    /// wire.
    pub const CHANNEL_DIED: u16 = 0xFFF9;

    /// Initiator offers its local channel id.
    pub const CHANNEL_ANNOUNCE: u16 = 0xFFFA;
    /// Responder returns (initiator id, responder id).
    pub const CHANNEL_REPLY: u16 = 0xFFFB;
    /// Orderly close of a remote channel.
    pub const CHANNEL_KILL: u16 = 0xFFFC;
    /// Liveness probe; carries no body.
    pub const CHANNEL_KEEPALIVE: u16 = 0xFFFD;
    /// Sentinel that breaks the writer out of a blocking pop; never
    /// transmitted.
    pub const WRITER_UNBLOCKER: u16 = 0xFFFE;

    pub fn is_reserved(ty: u16) -> bool {
        ty >= RESERVED_BASE
    }

    /// Types that may legitimately arrive from the peer on the control
    /// channel.
    pub fn is_wire_control(ty: u16) -> bool {
        matches!(
            ty,
            CHANNEL_ANNOUNCE | CHANNEL_REPLY | CHANNEL_KILL | CHANNEL_KEEPALIVE
        )
    }
}

/// One body segment: either owned bytes or a window into a shared memory
/// map. Dropping a mapped segment releases its reference on the map.
#[derive(Clone)]
pub enum Segment {
    Bytes(Bytes),
    Mapped {
        map: Arc<Mmap>,
        offset: usize,
        len: usize,
    },
}

impl Segment {
    pub fn len(&self) -> usize {
        match self {
            Segment::Bytes(b) => b.len(),
            Segment::Mapped { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Segment::Bytes(b) => b,
            Segment::Mapped { map, offset, len } => &map[*offset..*offset + *len],
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Segment::Mapped { offset, len, .. } => {
                write!(f, "Mapped({len} bytes at {offset})")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub channel: u16,
    pub ty: u16,
    segments: Vec<Segment>,
}

impl Message {
    pub fn new(channel: u16, ty: u16) -> Self {
        Self {
            channel,
            ty,
            segments: Vec::new(),
        }
    }

    pub fn with_body(channel: u16, ty: u16, body: Bytes) -> Result<Self> {
        let mut msg = Self::new(channel, ty);
        msg.push_segment(Segment::Bytes(body))?;
        Ok(msg)
    }

    /// Append a scatter segment, validating the 16-bit total body length
    /// before the message ever reaches a socket.
    pub fn push_segment(&mut self, segment: Segment) -> Result<()> {
        if self.segments.len() >= MAX_SEGMENTS {
            return Err(Error::generic(format!(
                "message exceeds {MAX_SEGMENTS} scatter segments"
            )));
        }
        let total = self.body_len() + segment.len();
        if total > MAX_BODY {
            return Err(Error::generic(format!(
                "message body of {total} bytes exceeds the {MAX_BODY}-byte limit"
            )));
        }
        self.segments.push(segment);
        Ok(())
    }

    pub fn body_len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Contiguous copy of the body. Cheap for the common single-`Bytes`
    /// case.
    pub fn body(&self) -> Bytes {
        match self.segments.as_slice() {
            [] => Bytes::new(),
            [Segment::Bytes(b)] => b.clone(),
            segments => {
                let mut buf = BytesMut::with_capacity(self.body_len());
                for seg in segments {
                    buf.put_slice(seg.as_slice());
                }
                buf.freeze()
            }
        }
    }

    /// The 6-byte network-order header.
    pub fn header_bytes(&self) -> [u8; HEADER_LEN] {
        let mut hdr = [0u8; HEADER_LEN];
        hdr[0..2].copy_from_slice(&self.channel.to_be_bytes());
        hdr[2..4].copy_from_slice(&self.ty.to_be_bytes());
        hdr[4..6].copy_from_slice(&(self.body_len() as u16).to_be_bytes());
        hdr
    }

    pub fn parse_header(hdr: &[u8; HEADER_LEN]) -> (u16, u16, u16) {
        let channel = u16::from_be_bytes([hdr[0], hdr[1]]);
        let ty = u16::from_be_bytes([hdr[2], hdr[3]]);
        let size = u16::from_be_bytes([hdr[4], hdr[5]]);
        (channel, ty, size)
    }

    /// Construct from already-validated wire parts; `size` fits in 16 bits
    /// by construction.
    pub(crate) fn from_wire(channel: u16, ty: u16, body: Bytes) -> Self {
        let segments = if body.is_empty() {
            Vec::new()
        } else {
            vec![Segment::Bytes(body)]
        };
        Self {
            channel,
            ty,
            segments,
        }
    }

    /// A bodyless system control message.
    pub fn control(ty: u16) -> Self {
        Self::new(CONTROL_CHANNEL, ty)
    }

    /// A system control message with a small owned body.
    pub fn control_with(ty: u16, body: Bytes) -> Self {
        Self {
            channel: CONTROL_CHANNEL,
            ty,
            segments: vec![Segment::Bytes(body)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_network_order() {
        let msg = Message::with_body(0x0010, 0x0042, Bytes::new()).unwrap();
        assert_eq!(msg.header_bytes(), [0x00, 0x10, 0x00, 0x42, 0x00, 0x00]);

        let msg = Message::with_body(0x0001, 0x0001, Bytes::from(vec![0xAB; 65_535])).unwrap();
        assert_eq!(msg.header_bytes(), [0x00, 0x01, 0x00, 0x01, 0xFF, 0xFF]);
    }

    #[test]
    fn body_length_is_capped() {
        let err = Message::with_body(1, 1, Bytes::from(vec![0u8; MAX_BODY + 1])).unwrap_err();
        assert!(err.to_string().contains("exceeds"));

        let mut msg = Message::with_body(1, 1, Bytes::from(vec![0u8; 40_000])).unwrap();
        let err = msg
            .push_segment(Segment::Bytes(Bytes::from(vec![0u8; 30_000])))
            .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn scatter_body_concatenates() {
        let mut msg = Message::new(7, 8);
        msg.push_segment(Segment::Bytes(Bytes::from_static(b"hello ")))
            .unwrap();
        msg.push_segment(Segment::Bytes(Bytes::from_static(b"world")))
            .unwrap();
        assert_eq!(msg.body_len(), 11);
        assert_eq!(&msg.body()[..], b"hello world");
    }

    #[test]
    fn reserved_type_predicates() {
        assert!(sys::is_reserved(sys::CHANNEL_ANNOUNCE));
        assert!(sys::is_reserved(sys::NEW_CONNECTION));
        assert!(!sys::is_reserved(0x000B));
        assert!(sys::is_wire_control(sys::CHANNEL_KEEPALIVE));
        assert!(!sys::is_wire_control(sys::NEW_CONNECTION));
        assert!(!sys::is_wire_control(sys::WRITER_UNBLOCKER));
    }
}
