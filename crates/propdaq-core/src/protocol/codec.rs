//! Frame codec
//!
//! Pure functions for checksum computation, payload escaping and frame
//! assembly. The wire form of a frame is:
//!
//! ```text
//! EOP, <lead checksum slot>, <escaped payload...>, EOP, <checksum>
//! ```
//!
//! The lead slot is a quirk of the device firmware: the scanner reads
//! one byte after the opening `EOP` and discards it, so back-to-back
//! frames self-delimit (the previous frame's trailing checksum doubles
//! as the next frame's lead slot). The trailing checksum covers the
//! escaped payload bytes, escape markers included.

use byteorder::{BigEndian, ByteOrder};

use super::{EOP, ESC};

/// Rotate-left/add checksum over a byte sequence.
///
/// For each byte the 8-bit accumulator is rotated left by one bit
/// (high bit carried into bit 0), then the byte is added modulo 256.
/// Must match the device firmware bit for bit; checksum value 0 is
/// reserved to mean "unchecked".
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, &b| acc.rotate_left(1).wrapping_add(b))
}

/// Escape a payload for the wire: every `ESC` becomes `ESC ESC` and
/// every `EOP` becomes `ESC EOP`. Escaping `ESC` first keeps its own
/// escape marker from being re-escaped.
pub fn escape(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    for &b in payload {
        if b == ESC || b == EOP {
            out.push(ESC);
        }
        out.push(b);
    }
    out
}

/// Undo [`escape`]. The live scanner consumes escape state byte by
/// byte instead of calling this; it exists for frame construction
/// checks and tests.
pub fn unescape(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut escaped = false;
    for &b in bytes {
        if escaped {
            out.push(b);
            escaped = false;
        } else if b == ESC {
            escaped = true;
        } else {
            out.push(b);
        }
    }
    out
}

/// Assemble a complete wire frame for a control message.
///
/// The payload is the message id byte, the sequence byte, then four
/// big-endian bytes per word. The lead checksum slot is written as 0,
/// which the scanner treats as "unchecked".
pub fn build_frame(message_id: u8, sequence_id: u8, words: &[u32]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + words.len() * 4);
    payload.push(message_id);
    payload.push(sequence_id);
    for &w in words {
        let mut word_bytes = [0u8; 4];
        BigEndian::write_u32(&mut word_bytes, w);
        payload.extend_from_slice(&word_bytes);
    }

    let escaped = escape(&payload);
    let mut frame = Vec::with_capacity(escaped.len() + 4);
    frame.push(EOP);
    frame.push(0);
    frame.extend_from_slice(&escaped);
    frame.push(EOP);
    frame.push(checksum(&escaped));
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::Rng;

    #[test]
    fn test_checksum_known_vector() {
        // version request payload: id 3, sequence 1
        assert_eq!(checksum(&[3, 1]), 7);
    }

    #[test]
    fn test_checksum_deterministic_and_order_sensitive() {
        let data = [1u8, 2, 3, 4, 5];
        assert_eq!(checksum(&data), checksum(&data));
        assert_ne!(checksum(&[1, 2]), checksum(&[2, 1]));
    }

    #[test]
    fn test_checksum_single_bit_flip_changes_value() {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let len = rng.gen_range(1..32);
            let mut data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let original = checksum(&data);
            let byte = rng.gen_range(0..len);
            let bit = rng.gen_range(0..8);
            data[byte] ^= 1 << bit;
            assert_ne!(
                checksum(&data),
                original,
                "bit flip at {}:{} went undetected",
                byte,
                bit
            );
        }
    }

    #[test]
    fn test_escape_round_trip() {
        let cases: [&[u8]; 6] = [
            b"",
            b"plain",
            &[EOP],
            &[ESC, ESC, EOP, EOP],
            &[EOP, ESC, EOP, ESC],
            &[0, ESC, 255, EOP, 1],
        ];
        for payload in cases {
            assert_eq!(unescape(&escape(payload)), payload);
        }
    }

    #[test]
    fn test_escape_round_trip_random() {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let len = rng.gen_range(0..64);
            // bias toward marker bytes so adjacency cases show up
            let payload: Vec<u8> = (0..len)
                .map(|_| match rng.gen_range(0..4) {
                    0 => EOP,
                    1 => ESC,
                    _ => rng.gen(),
                })
                .collect();
            assert_eq!(unescape(&escape(&payload)), payload);
        }
    }

    #[test]
    fn test_build_frame_start_vector() {
        // send("start", 3) with the sequence counter at 21
        let frame = build_frame(4, 21, &[3]);
        assert_eq!(frame, vec![EOP, 0, 4, 21, 0, 0, 0, 3, EOP, 212]);
    }

    #[test]
    fn test_build_frame_escapes_payload() {
        // a word whose bytes include both marker values
        let frame = build_frame(6, 1, &[u32::from_be_bytes([0, ESC, EOP, 9])]);
        let escaped = &frame[2..frame.len() - 2];
        assert_eq!(escaped, &[6, 1, 0, ESC, ESC, ESC, EOP, 9]);
        assert_eq!(*frame.last().unwrap(), checksum(escaped));
    }
}
