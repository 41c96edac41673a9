//! Keyed line codec for the control channel.
//!
//! Every message after connect is length-framed (u32 big-endian) and XOR'd
//! with a keystream derived from the session's shared key. This is an
//! origin-authentication / obfuscation mechanism only: a peer that does not
//! hold the key cannot produce frames that decode to valid commands, but the
//! encoding offers no confidentiality guarantee and must never be treated as
//! encryption.

use std::io::{Read, Write};

use crate::error::SyncError;

/// Upper bound on one frame; the `collection` payload is the largest message.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// XOR `data` with the keystream for `key`. Symmetric: applying twice is the
/// identity, so the same routine encodes and decodes.
fn apply_keystream(key: &[u8], data: &mut [u8]) {
    debug_assert!(!key.is_empty());
    for (i, b) in data.iter_mut().enumerate() {
        let k = key[i % key.len()];
        let round = (i / key.len()) as u8;
        *b ^= k.wrapping_add(round).rotate_left((i % 7) as u32);
    }
}

/// Write one keyed frame.
pub fn write_frame(out: &mut dyn Write, key: &[u8], payload: &[u8]) -> Result<(), SyncError> {
    if key.is_empty() {
        return Err(SyncError::Protocol("empty session key".into()));
    }
    if payload.len() > MAX_FRAME_SIZE {
        return Err(SyncError::Protocol(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }
    let mut buf = payload.to_vec();
    apply_keystream(key, &mut buf);
    out.write_all(&(buf.len() as u32).to_be_bytes())?;
    out.write_all(&buf)?;
    out.flush()?;
    Ok(())
}

/// Read one keyed frame.
pub fn read_frame(input: &mut dyn Read, key: &[u8]) -> Result<Vec<u8>, SyncError> {
    if key.is_empty() {
        return Err(SyncError::Protocol("empty session key".into()));
    }
    let mut hdr = [0u8; 4];
    input.read_exact(&mut hdr)?;
    let len = u32::from_be_bytes(hdr) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(SyncError::Protocol(format!("frame too large: {} bytes", len)));
    }
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    apply_keystream(key, &mut buf);
    Ok(buf)
}

/// Write one keyed text message.
pub fn write_line(out: &mut dyn Write, key: &[u8], text: &str) -> Result<(), SyncError> {
    write_frame(out, key, text.as_bytes())
}

/// Read one keyed text message. A frame that does not decode to UTF-8 means
/// the peer is speaking with a different key.
pub fn read_line(input: &mut dyn Read, key: &[u8]) -> Result<String, SyncError> {
    let buf = read_frame(input, key)?;
    String::from_utf8(buf)
        .map_err(|_| SyncError::Protocol("message does not decode with session key".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip_text() {
        let key = b"s3cret";
        let mut wire = Vec::new();
        write_line(&mut wire, key, "space /var/media").unwrap();
        let mut cur = Cursor::new(wire);
        assert_eq!(read_line(&mut cur, key).unwrap(), "space /var/media");
    }

    #[test]
    fn round_trip_binary() {
        let key = b"k";
        let payload: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();
        let mut wire = Vec::new();
        write_frame(&mut wire, key, &payload).unwrap();
        let mut cur = Cursor::new(wire);
        assert_eq!(read_frame(&mut cur, key).unwrap(), payload);
    }

    #[test]
    fn encoded_bytes_differ_from_plaintext() {
        let mut wire = Vec::new();
        write_line(&mut wire, b"subscriberkey", "HELO").unwrap();
        assert!(!wire.windows(4).any(|w| w == b"HELO"));
    }

    #[test]
    fn wrong_key_does_not_decode() {
        let mut wire = Vec::new();
        write_line(&mut wire, b"rightkey", "HELO").unwrap();
        let mut cur = Cursor::new(wire);
        match read_line(&mut cur, b"wrongkey") {
            Ok(s) => assert_ne!(s, "HELO"),
            Err(SyncError::Protocol(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn empty_key_rejected() {
        let mut wire = Vec::new();
        assert!(write_line(&mut wire, b"", "HELO").is_err());
    }

    #[test]
    fn oversized_frame_rejected() {
        // Hand-build a header claiming more than the cap; reader must bail
        // before allocating.
        let mut wire = Vec::new();
        wire.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());
        let mut cur = Cursor::new(wire);
        assert!(read_frame(&mut cur, b"key").is_err());
    }
}
