//! CBOR snapshot files.
//!
//! ```text
//!   SnapshotFile { format, digest = blake3(body), body = CBOR(state) }
//! ```
//!
//! The body digest is verified on every read so a truncated or edited
//! snapshot is rejected instead of resuming runs from corrupt state.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::digest;
use crate::error::{Result, StoreError};

/// Current snapshot layout version.
pub const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    format: u32,
    digest: String,
    body: Vec<u8>,
}

/// Serialize `value` to CBOR and write it to `path` atomically.
pub fn write_snapshot<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let mut body = Vec::new();
    ciborium::ser::into_writer(value, &mut body)
        .map_err(|e| StoreError::Snapshot(format!("CBOR serialization: {e}")))?;

    let file = SnapshotFile { format: SNAPSHOT_FORMAT, digest: digest::blake3_hex(&body), body };
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&file, &mut buf)
        .map_err(|e| StoreError::Snapshot(format!("CBOR serialization: {e}")))?;

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &buf)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a snapshot written by [`write_snapshot`], verifying its digest.
pub fn read_snapshot<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read(path)?;
    let file: SnapshotFile = ciborium::de::from_reader(&data[..])
        .map_err(|e| StoreError::Snapshot(format!("CBOR deserialization: {e}")))?;
    if file.format != SNAPSHOT_FORMAT {
        return Err(StoreError::Snapshot(format!(
            "unsupported snapshot format {} (expected {SNAPSHOT_FORMAT})",
            file.format
        )));
    }
    digest::verify_blake3(&file.body, &file.digest)?;
    ciborium::de::from_reader(&file.body[..])
        .map_err(|e| StoreError::Snapshot(format!("CBOR deserialization: {e}")))
}

/// Pretty-print as JSON (useful for debugging / inspection).
pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| StoreError::Snapshot(format!("JSON serialization: {e}")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        counts: BTreeMap<u32, Vec<f64>>,
    }

    fn sample() -> Sample {
        Sample { name: "modelOne".into(), counts: BTreeMap::from([(1, vec![0.5, 1.5])]) }
    }

    #[test]
    fn cbor_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.cbor");

        write_snapshot(&sample(), &path).unwrap();
        let loaded: Sample = read_snapshot(&path).unwrap();
        assert_eq!(loaded, sample());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn corrupt_body_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.cbor");
        write_snapshot(&sample(), &path).unwrap();

        let mut file: SnapshotFile =
            ciborium::de::from_reader(&std::fs::read(&path).unwrap()[..]).unwrap();
        file.digest = "0".repeat(64);
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&file, &mut buf).unwrap();
        std::fs::write(&path, buf).unwrap();

        let err = read_snapshot::<Sample>(&path).unwrap_err();
        assert!(matches!(err, StoreError::IntegrityMismatch { .. }));
    }

    #[test]
    fn json_export() {
        let json = to_json(&sample()).unwrap();
        assert!(json.contains("\"name\": \"modelOne\""));
    }
}
