//! Full key-space snapshots.
//!
//! A snapshot is a `u64` entry count followed by one framed SET command
//! per entry, so loading a snapshot is the same code path as decoding the
//! replication stream. The format is owned here; the transfer layer only
//! ever sees opaque bytes.

use crate::error::{ProtocolError, Result};
use crate::protocol::{decode_frame, encode_frame, Command};
use crate::storage::Dict;
use bytes::{BufMut, Bytes, BytesMut};
use std::fs;
use std::path::Path;
use tracing::info;

/// Default snapshot file name inside the data directory.
pub const DUMP_FILE_NAME: &str = "dump.bin";

/// Serialize entries into snapshot bytes.
pub fn encode_entries(entries: &[(Bytes, Bytes)]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u64_le(entries.len() as u64);
    for (key, value) in entries {
        buf.extend_from_slice(&encode_frame(&Command::set(key.clone(), value.clone())));
    }
    buf.freeze()
}

/// Replace the dict's contents with the entries in `bytes`.
///
/// The dict is cleared first; a decode failure therefore leaves it holding
/// exactly the entries applied so far, and the caller must treat the
/// snapshot as unusable.
pub fn decode_into(bytes: &[u8], dict: &mut Dict) -> Result<usize> {
    if bytes.len() < 8 {
        return Err(ProtocolError::Truncated {
            need: 8,
            have: bytes.len(),
        }
        .into());
    }
    let count = u64::from_le_bytes(bytes[..8].try_into().expect("8-byte slice")) as usize;
    let mut buf = BytesMut::from(&bytes[8..]);

    dict.clear(None);
    let mut applied = 0;
    while applied < count {
        let cmd = decode_frame(&mut buf)?.ok_or_else(|| {
            crate::error::Error::Internal(format!(
                "snapshot truncated: {applied} of {count} entries present"
            ))
        })?;
        dict.insert(cmd.key, cmd.value);
        applied += 1;
    }
    Ok(applied)
}

/// Write a snapshot of `entries` to `path`, returning the byte length.
pub fn dump_to(path: &Path, entries: &[(Bytes, Bytes)]) -> Result<u64> {
    let bytes = encode_entries(entries);
    fs::write(path, &bytes)?;
    info!(path = %path.display(), entries = entries.len(), bytes = bytes.len(), "snapshot dumped");
    Ok(bytes.len() as u64)
}

/// Bulk-load a snapshot file into the dict, replacing its contents.
pub fn load_from(path: &Path, dict: &mut Dict) -> Result<usize> {
    let bytes = fs::read(path)?;
    let applied = decode_into(&bytes, dict)?;
    info!(path = %path.display(), entries = applied, "snapshot loaded");
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let entries = vec![(b("a"), b("1")), (b("b"), b("2")), (b("c"), b("3"))];
        let bytes = encode_entries(&entries);

        let mut dict = Dict::with_base_exp(2);
        dict.insert(b("stale"), b("gone"));
        let applied = decode_into(&bytes, &mut dict).unwrap();

        assert_eq!(applied, 3);
        assert_eq!(dict.len(), 3);
        assert_eq!(dict.find(b"a"), Some(&b("1")));
        assert_eq!(dict.find(b"stale"), None, "load must replace, not merge");
    }

    #[test]
    fn test_empty_snapshot() {
        let bytes = encode_entries(&[]);
        let mut dict = Dict::with_base_exp(2);
        dict.insert(b("x"), b("y"));
        assert_eq!(decode_into(&bytes, &mut dict).unwrap(), 0);
        assert!(dict.is_empty());
    }

    #[test]
    fn test_truncated_snapshot_rejected() {
        let entries = vec![(b("a"), b("1")), (b("b"), b("2"))];
        let bytes = encode_entries(&entries);
        let mut dict = Dict::with_base_exp(2);
        assert!(decode_into(&bytes[..bytes.len() - 4], &mut dict).is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DUMP_FILE_NAME);

        let entries: Vec<_> = (0..100)
            .map(|i| (b(&format!("key-{i}")), b(&format!("val-{i}"))))
            .collect();
        let written = dump_to(&path, &entries).unwrap();
        assert_eq!(written, fs::metadata(&path).unwrap().len());

        let mut dict = Dict::with_base_exp(2);
        let applied = load_from(&path, &mut dict).unwrap();
        assert_eq!(applied, 100);
        assert_eq!(dict.find(b"key-42"), Some(&b("val-42")));
    }
}
