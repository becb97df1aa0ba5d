use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{QsError, QsResult};
use crate::frame::Frame;

/// Connection-identifying header. Long form carries both connection ids and
/// is used only during the handshake; short form carries just the
/// destination id and is used for all post-handshake traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Long { src_con_id: u32, dest_con_id: u32 },
    Short { dest_con_id: u32 },
}

impl Header {
    pub fn header_form(&self) -> u8 {
        match self {
            Header::Long { .. } => 1,
            Header::Short { .. } => 0,
        }
    }

    pub fn dest_con_id(&self) -> u32 {
        match self {
            Header::Long { dest_con_id, .. } => *dest_con_id,
            Header::Short { dest_con_id } => *dest_con_id,
        }
    }

    pub fn src_con_id(&self) -> Option<u32> {
        match self {
            Header::Long { src_con_id, .. } => Some(*src_con_id),
            Header::Short { .. } => None,
        }
    }
}

/// UDP datagram payload: a header identifying the connection, a packet
/// number, and an ordered list of frames. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub flags: u8,
    pub packet_number: u32,
    pub frames: Vec<Frame>,
}

impl Packet {
    pub fn long(
        src_con_id: u32,
        dest_con_id: u32,
        packet_number: u32,
        frames: Vec<Frame>,
    ) -> Self {
        Self {
            header: Header::Long {
                src_con_id,
                dest_con_id,
            },
            flags: 0,
            packet_number,
            frames,
        }
    }

    pub fn short(dest_con_id: u32, packet_number: u32, frames: Vec<Frame>) -> Self {
        Self {
            header: Header::Short { dest_con_id },
            flags: 0,
            packet_number,
            frames,
        }
    }

    /// Never truncates; the caller is responsible for keeping the
    /// aggregate size within `MAX_PACKET_SIZE`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        let first_byte = (self.header.header_form() << 7) | (self.flags & 0x7F);
        buf.put_u8(first_byte);

        match &self.header {
            Header::Long {
                src_con_id,
                dest_con_id,
            } => {
                buf.put_u32(*src_con_id);
                buf.put_u32(*dest_con_id);
            }
            Header::Short { dest_con_id } => {
                buf.put_u32(*dest_con_id);
            }
        }
        buf.put_u32(self.packet_number);

        for frame in &self.frames {
            frame.encode(&mut buf);
        }

        buf.freeze()
    }

    /// Reads the header form from the top bit of the first byte, applies
    /// the matching layout, then decodes frames from the remainder until
    /// exhausted. Any leftover bytes that cannot form a complete frame
    /// cause `MalformedPacket`.
    pub fn decode(bytes: Bytes) -> QsResult<Self> {
        let mut buf = bytes;
        if buf.is_empty() {
            return Err(QsError::MalformedPacket("empty datagram"));
        }

        let first_byte = buf[0];
        let header_form = first_byte >> 7;
        let flags = first_byte & 0x7F;
        buf.advance(1);

        let header = if header_form == 1 {
            if buf.len() < 8 {
                return Err(QsError::MalformedPacket("truncated long header"));
            }
            let src_con_id = buf.get_u32();
            let dest_con_id = buf.get_u32();
            Header::Long {
                src_con_id,
                dest_con_id,
            }
        } else {
            if buf.len() < 4 {
                return Err(QsError::MalformedPacket("truncated short header"));
            }
            let dest_con_id = buf.get_u32();
            Header::Short { dest_con_id }
        };

        if buf.len() < 4 {
            return Err(QsError::MalformedPacket("truncated packet number"));
        }
        let packet_number = buf.get_u32();

        let mut frames = Vec::new();
        while !buf.is_empty() {
            let frame = Frame::decode(&mut buf).map_err(|_| {
                QsError::MalformedPacket("trailing bytes do not form a complete frame")
            })?;
            frames.push(frame);
        }

        Ok(Self {
            header,
            flags,
            packet_number,
            frames,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::{ACK, DATA};

    fn sample_frame() -> Frame {
        Frame::data_frame(1, 0, Bytes::from_static(b"Hello, QUIC!"))
    }

    #[test]
    fn long_header_packet_round_trips() {
        // S3
        let p = Packet::long(
            1234,
            5678,
            1,
            vec![sample_frame(), Frame::new(ACK, 1, 13, Bytes::new())],
        );
        let encoded = p.encode();
        let decoded = Packet::decode(encoded).unwrap();
        assert_eq!(decoded, p);
        assert_eq!(decoded.header.src_con_id(), Some(1234));
        assert_eq!(decoded.header.dest_con_id(), 5678);
        assert_eq!(decoded.frames.len(), 2);
    }

    #[test]
    fn short_header_packet_round_trips_without_src_con_id() {
        // S4
        let p = Packet::short(5678, 1, vec![sample_frame()]);
        let encoded = p.encode();
        let decoded = Packet::decode(encoded).unwrap();
        assert_eq!(decoded, p);
        assert_eq!(decoded.header.src_con_id(), None);
    }

    #[test]
    fn header_byte_invariant_holds() {
        let long = Packet::long(1, 2, 0, vec![]);
        let bytes = long.encode();
        assert_eq!(bytes[0] >> 7, 1);
        assert_eq!(bytes[0] & 0x7F, 0);

        let short = Packet::short(2, 0, vec![]);
        let bytes = short.encode();
        assert_eq!(bytes[0] >> 7, 0);
    }

    #[test]
    fn packet_with_no_frames_round_trips() {
        let p = Packet::short(9, 3, vec![]);
        let decoded = Packet::decode(p.encode()).unwrap();
        assert_eq!(decoded, p);
        assert!(decoded.frames.is_empty());
    }

    #[test]
    fn trailing_partial_frame_is_malformed() {
        let p = Packet::short(9, 3, vec![sample_frame()]);
        let mut encoded = BytesMut::from(&p.encode()[..]);
        encoded.truncate(encoded.len() - 1);
        assert!(Packet::decode(encoded.freeze()).is_err());
    }

    #[test]
    fn data_frame_type_roundtrips_through_packet() {
        let p = Packet::short(9, 0, vec![sample_frame()]);
        let decoded = Packet::decode(p.encode()).unwrap();
        assert_eq!(decoded.frames[0].frame_type, DATA);
    }
}
