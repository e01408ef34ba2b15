//! Incremental frame scanner
//!
//! Extracts verified frame payloads from an arbitrarily fragmented
//! byte buffer. The scanner is restartable: feeding the returned
//! remainder plus newly arrived bytes yields the same frames as a
//! single pass over the concatenation, so the reader loop can call it
//! whenever a byte that might terminate a frame shows up.
//!
//! A fresh session buffer must be primed with `[EOP, 0]` so the first
//! real frame has an opening marker and a lead checksum slot to
//! consume; every completed frame leaves its own terminator in the
//! remainder to prime the next one.

use tracing::warn;

use super::{ProtocolError, EOP, ESC};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Discard bytes until an `EOP` marker
    SeekStart,
    /// One byte: the lead checksum slot, never verified
    ReadLeadChecksum,
    /// Accumulate unescaped payload bytes until an unescaped `EOP`
    Collecting,
    /// One byte: the trailing checksum
    ReadTrailChecksum,
}

/// Scan `input` for complete frames.
///
/// Returns the verified payloads (unescaped, checksum stripped) and
/// the unconsumed remainder. A frame is dropped with a warning when
/// its payload is empty or its checksum fails (checksum 0 always
/// passes, and `verify_checksum = false` disables the check
/// entirely); scanning then resumes at the failed frame's terminator.
/// Truncated input is never an error, it simply stays in the
/// remainder until more bytes arrive.
pub fn scan(input: &[u8], verify_checksum: bool) -> (Vec<Vec<u8>>, Vec<u8>) {
    let mut frames = Vec::new();
    let mut buf = input;

    loop {
        let mut state = State::SeekStart;
        let mut escaped = false;
        let mut computed: u8 = 0;
        let mut sent: u8 = 0;
        let mut payload: Vec<u8> = Vec::new();
        let mut end: Option<usize> = None;

        for (n, &c) in buf.iter().enumerate() {
            match state {
                State::SeekStart => {
                    if c == EOP {
                        state = State::ReadLeadChecksum;
                    }
                }
                State::ReadLeadChecksum => {
                    computed = 0;
                    state = State::Collecting;
                }
                State::Collecting => {
                    if !escaped && c == EOP {
                        state = State::ReadTrailChecksum;
                    } else if escaped || c != ESC {
                        payload.push(c);
                        computed = computed.rotate_left(1).wrapping_add(c);
                    }
                    // escape markers are folded into the running
                    // checksum but not into the payload
                    if c == ESC && !escaped {
                        escaped = true;
                        computed = computed.rotate_left(1).wrapping_add(c);
                    } else {
                        escaped = false;
                    }
                }
                State::ReadTrailChecksum => {
                    sent = c;
                    end = Some(n + 1);
                    break;
                }
            }
        }

        let Some(end) = end else {
            // no terminator yet; wait for more bytes
            return (frames, buf.to_vec());
        };

        match check_frame(&payload, sent, computed, verify_checksum) {
            Ok(()) => frames.push(payload),
            Err(e) => warn!("dropping frame: {}", e),
        }

        // keep the terminator EOP + checksum as the next frame's
        // opening marker and lead slot
        buf = &buf[end - 2..];
    }
}

fn check_frame(
    payload: &[u8],
    sent: u8,
    computed: u8,
    verify_checksum: bool,
) -> Result<(), ProtocolError> {
    if payload.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }
    if sent != computed && sent != 0 && verify_checksum {
        return Err(ProtocolError::BadChecksum {
            sent,
            calculated: computed,
        });
    }
    Ok(())
}

/// Prime a session buffer so the scanner sees an opening marker and a
/// lead checksum slot before the first real frame.
pub fn primed_buffer() -> Vec<u8> {
    vec![EOP, 0]
}

/// Wrap an already-received chunk (e.g. a discovery probe response) in
/// a primed buffer.
pub fn primed_with(bytes: &[u8]) -> Vec<u8> {
    let mut buf = primed_buffer();
    buf.extend_from_slice(bytes);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::build_frame;
    use pretty_assertions::assert_eq;

    fn scan_primed(bytes: &[u8]) -> (Vec<Vec<u8>>, Vec<u8>) {
        scan(&primed_with(bytes), true)
    }

    #[test]
    fn test_single_frame() {
        let frame = build_frame(4, 21, &[3]);
        let (frames, rest) = scan_primed(&frame);
        assert_eq!(frames, vec![vec![4, 21, 0, 0, 0, 3]]);
        // the terminator stays behind to prime the next frame
        assert_eq!(rest, vec![EOP, 212]);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut bytes = build_frame(3, 1, &[]);
        bytes.extend(build_frame(4, 2, &[7]));
        let (frames, _) = scan_primed(&bytes);
        assert_eq!(frames, vec![vec![3, 1], vec![4, 2, 0, 0, 0, 7]]);
    }

    #[test]
    fn test_escaped_payload_bytes() {
        let word = u32::from_be_bytes([ESC, EOP, ESC, EOP]);
        let frame = build_frame(6, 9, &[word]);
        let (frames, _) = scan_primed(&frame);
        assert_eq!(frames, vec![vec![6, 9, ESC, EOP, ESC, EOP]]);
    }

    #[test]
    fn test_restartable_at_every_split() {
        let mut bytes = primed_with(&build_frame(4, 21, &[3]));
        bytes.extend(build_frame(13, 22, &[0x01020304, 5]));
        bytes.extend(build_frame(3, 23, &[]));
        let (whole, whole_rest) = scan(&bytes, true);

        for split in 0..=bytes.len() {
            let (mut frames, rest) = scan(&bytes[..split], true);
            let mut buf = rest;
            buf.extend_from_slice(&bytes[split..]);
            let (more, rest) = scan(&buf, true);
            frames.extend(more);
            assert_eq!(frames, whole, "split at {}", split);
            assert_eq!(rest, whole_rest, "split at {}", split);
        }
    }

    #[test]
    fn test_truncated_frame_stays_in_remainder() {
        let frame = build_frame(4, 21, &[3]);
        let cut = &frame[..frame.len() - 2];
        let (frames, rest) = scan_primed(cut);
        assert!(frames.is_empty());
        assert_eq!(rest, primed_with(cut));

        // arrival of the missing bytes completes the frame
        let mut buf = rest;
        buf.extend_from_slice(&frame[frame.len() - 2..]);
        let (frames, _) = scan(&buf, true);
        assert_eq!(frames, vec![vec![4, 21, 0, 0, 0, 3]]);
    }

    #[test]
    fn test_bad_checksum_dropped_scanning_continues() {
        let mut bad = build_frame(4, 21, &[3]);
        let last = bad.len() - 1;
        bad[last] ^= 0x55;
        bad.extend(build_frame(3, 22, &[]));
        let (frames, _) = scan_primed(&bad);
        assert_eq!(frames, vec![vec![3, 22]]);
    }

    #[test]
    fn test_zero_checksum_always_accepted() {
        let mut frame = build_frame(4, 21, &[3]);
        let last = frame.len() - 1;
        frame[last] = 0;
        let (frames, _) = scan_primed(&frame);
        assert_eq!(frames, vec![vec![4, 21, 0, 0, 0, 3]]);
    }

    #[test]
    fn test_verification_disabled() {
        let mut frame = build_frame(4, 21, &[3]);
        let last = frame.len() - 1;
        frame[last] ^= 0x55;
        let (frames, _) = scan(&primed_with(&frame), false);
        assert_eq!(frames, vec![vec![4, 21, 0, 0, 0, 3]]);
    }

    #[test]
    fn test_empty_payload_dropped() {
        // EOP, lead slot, immediate EOP terminator, checksum
        let bytes = [EOP, 0, EOP, 0, EOP, 0];
        let (frames, _) = scan(&bytes, true);
        assert!(frames.is_empty());
    }

    #[test]
    fn test_garbage_before_frame() {
        let mut bytes = vec![0xDE, 0xAD, 0xBE];
        bytes.extend(primed_with(&build_frame(3, 1, &[])));
        let (frames, _) = scan(&bytes, true);
        assert_eq!(frames, vec![vec![3, 1]]);
    }

    #[test]
    fn test_never_panics_on_noise() {
        for seed in 0..=255u8 {
            let noise: Vec<u8> = (0..64).map(|i| seed.wrapping_mul(31).wrapping_add(i)).collect();
            let _ = scan(&noise, true);
        }
    }
}
