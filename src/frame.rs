use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::FRAME_H_SIZE;
use crate::error::{QsError, QsResult};

/// Bitmask values for `Frame::frame_type` (`spec.md` §6.1). Any combination
/// is legal on the wire; the connection layer interprets them.
pub const HANDSHAKE: u8 = 0x01;
pub const ACK: u8 = 0x02;
pub const DATA: u8 = 0x04;
pub const CLOSE: u8 = 0x08;

/// Smallest transmission unit: a 9-byte header plus opaque payload
/// belonging to one stream. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub stream_id: u32,
    pub offset: u32,
    pub data: Bytes,
}

impl Frame {
    pub fn new(frame_type: u8, stream_id: u32, offset: u32, data: Bytes) -> Self {
        Self {
            frame_type,
            stream_id,
            offset,
            data,
        }
    }

    pub fn data_frame(stream_id: u32, offset: u32, data: Bytes) -> Self {
        Self::new(DATA, stream_id, offset, data)
    }

    pub fn close_frame(stream_id: u32, offset: u32) -> Self {
        Self::new(CLOSE, stream_id, offset, Bytes::new())
    }

    pub fn length(&self) -> usize {
        self.data.len()
    }

    /// 9-byte header + payload. Always succeeds; empty `data` yields just
    /// the header.
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.frame_type);
        out.put_u32(self.stream_id);
        out.put_u32(self.offset);
        out.put_u16(self.data.len() as u16);
        out.extend_from_slice(&self.data);
    }

    pub fn encoded(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_H_SIZE + self.data.len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes one frame from the front of `buf`, returning the frame and
    /// leaving the remaining bytes in `buf` for tail-call decoding of
    /// concatenated frames. Fails with `MalformedFrame` when the buffer is
    /// shorter than the 9-byte header or than `9 + length`.
    pub fn decode(buf: &mut Bytes) -> QsResult<Self> {
        if buf.len() < FRAME_H_SIZE {
            return Err(QsError::MalformedFrame("buffer shorter than frame header"));
        }
        let mut header = buf.slice(0..FRAME_H_SIZE);
        let frame_type = header.get_u8();
        let stream_id = header.get_u32();
        let offset = header.get_u32();
        let length = header.get_u16() as usize;

        if buf.len() < FRAME_H_SIZE + length {
            return Err(QsError::MalformedFrame("buffer shorter than declared length"));
        }

        buf.advance(FRAME_H_SIZE);
        let data = buf.split_to(length);

        Ok(Self {
            frame_type,
            stream_id,
            offset,
            data,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_frame_round_trips() {
        // S1: F = Frame(stream_id=1, data=b"", offset=0, frame_type=DATA)
        let f = Frame::data_frame(1, 0, Bytes::new());
        let encoded = f.encoded();
        assert_eq!(encoded.len(), FRAME_H_SIZE);
        assert_eq!(encoded[0], DATA);

        let mut buf = encoded;
        let decoded = Frame::decode(&mut buf).unwrap();
        assert_eq!(decoded, f);
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_with_data_round_trips() {
        // S2
        let f = Frame::data_frame(1, 0, Bytes::from_static(b"Hello, QUIC!"));
        let encoded = f.encoded();
        assert_eq!(encoded.len(), 21);

        let mut buf = encoded;
        let decoded = Frame::decode(&mut buf).unwrap();
        assert_eq!(decoded, f);
        assert!(buf.is_empty());
    }

    #[test]
    fn truncated_frame_is_malformed() {
        // Property 3: every proper prefix of an encoded frame fails to decode.
        let f = Frame::data_frame(7, 42, Bytes::from_static(b"some payload bytes"));
        let encoded = f.encoded();
        for cut in 0..encoded.len() {
            let mut buf = encoded.slice(0..cut);
            assert!(Frame::decode(&mut buf).is_err(), "prefix of len {cut} should fail");
        }
    }

    #[test]
    fn tail_call_decoding_of_concatenated_frames() {
        let a = Frame::data_frame(1, 0, Bytes::from_static(b"abc"));
        let b = Frame::close_frame(1, 3);

        let mut buf = BytesMut::new();
        a.encode(&mut buf);
        b.encode(&mut buf);
        let mut buf = buf.freeze();

        let decoded_a = Frame::decode(&mut buf).unwrap();
        assert_eq!(decoded_a, a);
        let decoded_b = Frame::decode(&mut buf).unwrap();
        assert_eq!(decoded_b, b);
        assert!(buf.is_empty());
    }

    #[test]
    fn handshake_ack_is_a_distinguished_combined_type() {
        let f = Frame::new(HANDSHAKE | ACK, 0, 0, Bytes::new());
        assert_eq!(f.frame_type, 0x03);
    }

    #[test]
    fn max_length_frame_round_trips() {
        let data = Bytes::from(vec![0xAB; 65535]);
        let f = Frame::data_frame(3, 0, data);
        let mut buf = f.encoded();
        let decoded = Frame::decode(&mut buf).unwrap();
        assert_eq!(decoded, f);
    }
}
