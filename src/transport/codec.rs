//! Framing codec: incremental decode tolerating any read split, and a
//! scatter-aware writer that resumes partial writes without re-encoding.

use super::message::{Message, HEADER_LEN};
use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, IoSlice};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Incremental frame decoder. Bytes are fed in whatever chunks the socket
/// delivers; complete messages come out. State between calls is exactly the
/// unconsumed prefix of the stream.
#[derive(Default)]
pub struct Decoder {
    buf: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete message, or `None` when more bytes are needed.
    pub fn next_message(&mut self) -> Option<Message> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let hdr: [u8; HEADER_LEN] = self.buf[..HEADER_LEN].try_into().ok()?;
        let (channel, ty, size) = Message::parse_header(&hdr);
        let total = HEADER_LEN + size as usize;
        if self.buf.len() < total {
            return None;
        }
        let mut frame = self.buf.split_to(total);
        frame.advance(HEADER_LEN);
        Some(Message::from_wire(channel, ty, frame.freeze()))
    }

    /// Bytes buffered but not yet consumed as a full frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Encode a whole message into one contiguous buffer. Used for in-memory
/// delivery and tests; the socket path writes scatter segments directly.
pub fn encode(msg: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + msg.body_len());
    buf.extend_from_slice(&msg.header_bytes());
    for seg in msg.segments() {
        buf.extend_from_slice(seg.as_slice());
    }
    buf.freeze()
}

/// Position within a partially written message: which segment the writer is
/// in (0 is the header) and how many bytes of it are already out.
struct WriteCursor {
    segment: usize,
    offset: usize,
}

impl WriteCursor {
    fn fill<'a>(
        &self,
        header: &'a [u8],
        msg: &'a Message,
        slices: &mut Vec<IoSlice<'a>>,
    ) {
        let parts = std::iter::once(header)
            .chain(msg.segments().iter().map(|s| s.as_slice()));
        for (idx, part) in parts.enumerate() {
            if idx < self.segment {
                continue;
            }
            let skip = if idx == self.segment { self.offset } else { 0 };
            if skip < part.len() {
                slices.push(IoSlice::new(&part[skip..]));
            }
        }
    }

    fn advance(&mut self, mut n: usize, header: &[u8], msg: &Message) {
        let lens: Vec<usize> = std::iter::once(header.len())
            .chain(msg.segments().iter().map(|s| s.len()))
            .collect();
        while n > 0 && self.segment < lens.len() {
            let remaining = lens[self.segment] - self.offset;
            if n < remaining {
                self.offset += n;
                return;
            }
            n -= remaining;
            self.segment += 1;
            self.offset = 0;
        }
        // Skip any trailing empty segments so completion is detectable.
        while self.segment < lens.len() && lens[self.segment] == 0 {
            self.segment += 1;
        }
    }

}

/// Write a full message, converting the header to network order once and
/// resuming partial vectored writes from the exact (segment, offset) the
/// previous attempt reached.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = msg.header_bytes();
    let mut cursor = WriteCursor {
        segment: 0,
        offset: 0,
    };

    loop {
        let mut slices = Vec::with_capacity(1 + msg.segments().len());
        cursor.fill(&header, msg, &mut slices);
        if slices.is_empty() {
            return Ok(());
        }
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        cursor.advance(n, &header, msg);
        if cursor.segment > msg.segments().len() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::message::Segment;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    #[test]
    fn empty_body_round_trip() {
        let msg = Message::with_body(0x0010, 0x0042, Bytes::new()).unwrap();
        let wire = encode(&msg);
        assert_eq!(&wire[..], &[0x00, 0x10, 0x00, 0x42, 0x00, 0x00]);

        let mut dec = Decoder::new();
        dec.feed(&wire);
        let out = dec.next_message().unwrap();
        assert_eq!(out.channel, 0x0010);
        assert_eq!(out.ty, 0x0042);
        assert!(out.body().is_empty());
        assert!(dec.next_message().is_none());
    }

    #[test]
    fn boundary_body_round_trip() {
        let body = Bytes::from(vec![0xAB; 65_535]);
        let msg = Message::with_body(0x0001, 0x0001, body.clone()).unwrap();
        let wire = encode(&msg);
        assert_eq!(&wire[..HEADER_LEN], &[0x00, 0x01, 0x00, 0x01, 0xFF, 0xFF]);
        assert_eq!(wire.len(), HEADER_LEN + 65_535);

        let mut dec = Decoder::new();
        dec.feed(&wire);
        let out = dec.next_message().unwrap();
        assert_eq!(out.body(), body);
    }

    #[test]
    fn decode_survives_any_split() {
        let messages = vec![
            Message::with_body(1, 10, Bytes::from_static(b"alpha")).unwrap(),
            Message::with_body(2, 11, Bytes::new()).unwrap(),
            Message::with_body(3, 12, Bytes::from(vec![0x55; 1_000])).unwrap(),
        ];
        let mut stream = BytesMut::new();
        for m in &messages {
            stream.extend_from_slice(&encode(m));
        }
        let stream = stream.freeze();

        for chunk in [1usize, 2, 3, 5, 7, 16, 64, 1_000] {
            let mut dec = Decoder::new();
            let mut out = Vec::new();
            for piece in stream.chunks(chunk) {
                // Zero-byte feeds must be harmless too.
                dec.feed(&[]);
                dec.feed(piece);
                while let Some(m) = dec.next_message() {
                    out.push(m);
                }
            }
            assert_eq!(out.len(), messages.len(), "chunk size {chunk}");
            for (got, want) in out.iter().zip(&messages) {
                assert_eq!(got.channel, want.channel);
                assert_eq!(got.ty, want.ty);
                assert_eq!(got.body(), want.body());
            }
            assert_eq!(dec.pending(), 0);
        }
    }

    /// Writer that accepts at most `limit` bytes per call, forcing the
    /// cursor to resume mid-segment.
    struct Trickle {
        out: Vec<u8>,
        limit: usize,
    }

    impl AsyncWrite for Trickle {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let n = buf.len().min(self.limit);
            self.out.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn scatter_write_resumes_partial_writes() {
        let mut msg = Message::new(9, 8);
        msg.push_segment(Segment::Bytes(Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 64])))
            .unwrap();
        msg.push_segment(Segment::Bytes(Bytes::from(vec![0xC3; 500])))
            .unwrap();

        for limit in [1usize, 3, 10, 4096] {
            let mut w = Trickle {
                out: Vec::new(),
                limit,
            };
            write_message(&mut w, &msg).await.unwrap();
            assert_eq!(w.out, encode(&msg).to_vec(), "limit {limit}");
        }
    }

    #[tokio::test]
    async fn bodyless_message_writes_header_only() {
        let msg = Message::control(crate::transport::message::sys::CHANNEL_KEEPALIVE);
        let mut w = Trickle {
            out: Vec::new(),
            limit: 2,
        };
        write_message(&mut w, &msg).await.unwrap();
        assert_eq!(w.out.len(), HEADER_LEN);
    }
}
