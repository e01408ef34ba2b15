//! Packet decoding
//!
//! A verified frame payload is one of two packet classes, told apart
//! by bit 7 of its first byte: control packets (message id + sequence
//! + big-endian 32-bit words) and stream packets (0-7 stream index +
//! bit-packed samples).

use byteorder::{BigEndian, ByteOrder};

use super::{Message, ProtocolError};

/// A decoded low-rate control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket {
    /// Message kind, resolved from the wire id
    pub message: Message,
    /// Sequence number assigned by the sender. Informational only;
    /// not used for ordering or acknowledgement.
    pub sequence_id: u8,
    /// Payload words, big-endian on the wire
    pub words: Vec<u32>,
}

/// A decoded high-rate stream packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPacket {
    /// Stream index, 0-7
    pub stream_id: u8,
    /// Unpacked sample values
    pub samples: Vec<u32>,
}

/// Whether a frame payload carries a stream packet (bit 7 of the
/// first byte) rather than a control packet.
pub fn is_stream(payload: &[u8]) -> bool {
    payload.first().is_some_and(|&b| b & 0x80 != 0)
}

/// Decode a control packet payload.
///
/// Byte 0 is the message id, byte 1 the sequence number (tolerated as
/// 0 when absent), and the rest is grouped into 4-byte big-endian
/// words with any trailing 1-3 bytes silently dropped, exactly as the
/// firmware emits them.
pub fn decode_control(payload: &[u8]) -> Result<ControlPacket, ProtocolError> {
    let Some(&id) = payload.first() else {
        return Err(ProtocolError::EmptyFrame);
    };
    let message = Message::from_id(id).ok_or(ProtocolError::UnknownMessageId(id))?;
    let sequence_id = payload.get(1).copied().unwrap_or(0);
    let words = payload
        .get(2..)
        .unwrap_or_default()
        .chunks_exact(4)
        .map(BigEndian::read_u32)
        .collect();
    Ok(ControlPacket {
        message,
        sequence_id,
        words,
    })
}

/// Decode a stream packet payload.
///
/// Bits 4-6 of byte 0 select the stream; its low nibble is folded
/// back into the bit stream as the first four bits of sample 0.
/// Samples are pulled MSB-first across byte boundaries: the first is
/// 32 bits wide, and each subsequent sample is 32 bits when five or
/// fewer payload bytes remain unconsumed at the moment it starts
/// (absorbing the remainder of the packet), 12 bits otherwise.
/// Incomplete trailing bits are discarded.
pub fn decode_stream(payload: &[u8]) -> Result<StreamPacket, ProtocolError> {
    if payload.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }
    let stream_id = (payload[0] >> 4) & 7;

    let mut samples = Vec::new();
    let mut val: u32 = 0;
    let mut val_bits: u32 = 32;
    let mut bytes_left = payload.len();

    for (i, &raw) in payload.iter().enumerate() {
        // the header byte contributes only its folded low nibble
        let (mut c, mut byte_bits) = if i == 0 {
            ((raw & 0x0F) as u32, 4u32)
        } else {
            (raw as u32, 8u32)
        };

        while byte_bits > 0 {
            if val_bits >= byte_bits {
                val = (val << byte_bits) | c;
                val_bits -= byte_bits;
                byte_bits = 0;
            } else {
                val = (val << val_bits) | (c >> (byte_bits - val_bits));
                byte_bits -= val_bits;
                c &= (1 << byte_bits) - 1;
                val_bits = 0;
            }
            if val_bits == 0 {
                samples.push(val);
                val = 0;
                val_bits = if bytes_left <= 5 { 32 } else { 12 };
            }
        }
        bytes_left -= 1;
    }

    Ok(StreamPacket { stream_id, samples })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_control_words_big_endian() {
        let pkt = decode_control(&[4, 21, 0, 0, 0, 3, 0x01, 0x02, 0x03, 0x04]).unwrap();
        assert_eq!(pkt.message, Message::Start);
        assert_eq!(pkt.sequence_id, 21);
        assert_eq!(pkt.words, vec![3, 0x01020304]);
    }

    #[test]
    fn test_control_trailing_bytes_dropped() {
        let pkt = decode_control(&[6, 1, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]).unwrap();
        assert_eq!(pkt.words, vec![0xAABBCCDD]);
    }

    #[test]
    fn test_control_no_words() {
        let pkt = decode_control(&[3, 1]).unwrap();
        assert_eq!(pkt.message, Message::Version);
        assert!(pkt.words.is_empty());
    }

    #[test]
    fn test_control_missing_sequence_tolerated() {
        let pkt = decode_control(&[8]).unwrap();
        assert_eq!(pkt.message, Message::Query);
        assert_eq!(pkt.sequence_id, 0);
    }

    #[test]
    fn test_control_bad_id() {
        let err = decode_control(&[42, 1]).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessageId(42)));
    }

    #[test]
    fn test_stream_class_bit() {
        assert!(is_stream(&[0x80]));
        assert!(is_stream(&[0xA1, 0]));
        assert!(!is_stream(&[0x13, 0]));
        assert!(!is_stream(&[]));
    }

    #[test]
    fn test_stream_worked_example() {
        // stream 2; sample 0 = 32 bits starting with the folded
        // nibble, sample 1 = 12 bits (more than 5 bytes left when it
        // starts), sample 2 = 32 bits absorbing the tail.
        let payload = [0xA1, 0x23, 0x45, 0x67, 0x8A, 0xBC, 0xDE, 0xAD, 0xBE, 0xEF];
        let pkt = decode_stream(&payload).unwrap();
        assert_eq!(pkt.stream_id, 2);
        assert_eq!(pkt.samples, vec![0x12345678, 0xABC, 0xDEADBEEF]);
    }

    #[test]
    fn test_stream_single_sample() {
        // nibble + 3 bytes + a high nibble = exactly 32 bits; the
        // stray low nibble is not enough for another sample
        let payload = [0xD1, 0x23, 0x45, 0x67, 0x89];
        let pkt = decode_stream(&payload).unwrap();
        assert_eq!(pkt.stream_id, 5);
        assert_eq!(pkt.samples, vec![0x12345678]);
    }

    #[test]
    fn test_stream_incomplete_tail_discarded() {
        // 32-bit sample then 8 stray bits, not enough for a 12-bit one
        let payload = [0xA0, 0x00, 0x00, 0x01, 0x2F, 0xFF];
        let pkt = decode_stream(&payload).unwrap();
        assert_eq!(pkt.samples, vec![0x12]);
    }

    #[test]
    fn test_stream_id_extraction() {
        for id in 0..8u8 {
            let payload = [0x80 | (id << 4), 0, 0, 0];
            assert_eq!(decode_stream(&payload).unwrap().stream_id, id);
        }
    }
}
