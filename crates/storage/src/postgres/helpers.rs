//! Shared helper functions for PostgreSQL row conversion.

use lantern_core::error::{StorageError, StorageResult};

/// Convert an unsigned domain value to a `BIGINT` column value.
///
/// Returns an error if the value does not fit in an `i64`.
pub fn to_bigint(value: u64, field_name: &str) -> StorageResult<i64> {
    i64::try_from(value).map_err(|_| {
        StorageError::SerializationError(format!(
            "{} is out of range for BIGINT: {}",
            field_name, value
        ))
    })
}

/// Convert a `BIGINT` column value back to an unsigned domain value.
///
/// Negative values can only come from a corrupt row.
pub fn from_bigint(value: i64, field_name: &str) -> StorageResult<u64> {
    u64::try_from(value).map_err(|_| {
        StorageError::SerializationError(format!(
            "{} is negative ({}), which indicates data corruption",
            field_name, value
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bigint_bounds() {
        assert_eq!(to_bigint(i64::MAX as u64, "block.number").unwrap(), i64::MAX);
        assert!(to_bigint(i64::MAX as u64 + 1, "block.number").is_err());
        assert_eq!(from_bigint(0, "block.number").unwrap(), 0);
    }

    #[test]
    fn test_negative_is_rejected() {
        let err = from_bigint(-1, "transaction.nonce").unwrap_err().to_string();
        assert!(err.contains("transaction.nonce"));
        assert!(err.contains("corruption"));
    }
}
