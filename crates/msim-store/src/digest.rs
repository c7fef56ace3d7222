//! BLAKE3 content digests of run output and snapshot files.

use std::collections::BTreeMap;

use crate::error::{Result, StoreError};
use crate::records::ExpressionRow;

/// Return the raw BLAKE3 hash of `data` as a hex string (64 lowercase chars).
pub fn blake3_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Digest of one output table: name, then every expression in id order.
pub fn table_digest(table_name: &str, rows: &[ExpressionRow]) -> String {
    let mut rows: Vec<&ExpressionRow> = rows.iter().collect();
    rows.sort_by_key(|r| r.expr_id);

    let mut hasher = blake3::Hasher::new();
    hasher.update(table_name.as_bytes());
    for row in rows {
        hasher.update(&row.expr_id.to_le_bytes());
        for v in &row.values {
            hasher.update(&v.to_le_bytes());
        }
    }
    hasher.finalize().to_hex().to_string()
}

/// Digest of a whole run from its table digests.
pub fn run_digest(table_digests: &BTreeMap<String, String>) -> String {
    let mut hasher = blake3::Hasher::new();
    for (name, digest) in table_digests {
        hasher.update(name.as_bytes());
        hasher.update(digest.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Verify that `data` matches the expected BLAKE3 hex hash.
pub fn verify_blake3(data: &[u8], expected_hex: &str) -> Result<()> {
    let actual = blake3_hex(data);
    if actual != expected_hex {
        return Err(StoreError::IntegrityMismatch {
            expected: expected_hex.to_string(),
            actual,
        });
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn row(expr_id: u32, values: Vec<f64>) -> ExpressionRow {
        ExpressionRow { table_id: 1, expr_id, values }
    }

    #[test]
    fn table_digest_ignores_row_order() {
        let a = table_digest("salary", &[row(0, vec![1.0]), row(1, vec![2.0])]);
        let b = table_digest("salary", &[row(1, vec![2.0]), row(0, vec![1.0])]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn table_digest_depends_on_values_and_name() {
        let a = table_digest("salary", &[row(0, vec![1.0])]);
        assert_ne!(a, table_digest("salary", &[row(0, vec![1.5])]));
        assert_ne!(a, table_digest("age", &[row(0, vec![1.0])]));
    }

    #[test]
    fn verify_blake3_good_and_bad() {
        let data = b"integrity test data";
        verify_blake3(data, &blake3_hex(data)).unwrap();
        let err = verify_blake3(data, &"0".repeat(64)).unwrap_err();
        assert!(matches!(err, StoreError::IntegrityMismatch { .. }));
    }
}
