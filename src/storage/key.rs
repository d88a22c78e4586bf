//! Database encryption key material.
//!
//! The key is supplied by the caller's key-derivation layer and handed to
//! SQLCipher exactly once. Every buffer that holds key bytes or their hex
//! encoding is wiped on drop.

use std::fmt;

use zeroize::Zeroizing;

use super::StorageError;

/// SQLCipher raw keys are 256 bits.
pub const DB_KEY_SIZE: usize = 32;

pub struct DbKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl DbKey {
    /// Take ownership of raw key bytes. The vector is moved, not copied, so
    /// no un-wiped duplicate is left behind.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, StorageError> {
        let bytes = Zeroizing::new(bytes);
        if bytes.len() != DB_KEY_SIZE {
            return Err(StorageError::InvalidKey(format!(
                "expected {DB_KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, StorageError> {
        let decoded = hex::decode(hex_key.trim())
            .map_err(|_| StorageError::InvalidKey("key is not valid hex".to_string()))?;
        Self::from_bytes(decoded)
    }

    /// The `PRAGMA key` statement using SQLCipher's raw-key syntax, so no
    /// passphrase derivation is applied on top of the caller's key.
    pub(crate) fn pragma_statement(&self) -> Zeroizing<String> {
        let hex_key = Zeroizing::new(hex::encode(self.bytes.as_slice()));
        Zeroizing::new(format!("PRAGMA key = \"x'{}'\";", hex_key.as_str()))
    }
}

impl fmt::Debug for DbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DbKey(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_length_enforced() {
        assert!(DbKey::from_bytes(vec![7u8; DB_KEY_SIZE]).is_ok());
        assert!(matches!(
            DbKey::from_bytes(vec![7u8; 16]),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            DbKey::from_hex("not hex"),
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_pragma_uses_raw_key_syntax() {
        let key = DbKey::from_bytes(vec![0xAB; DB_KEY_SIZE]).unwrap();
        let stmt = key.pragma_statement();
        assert!(stmt.starts_with("PRAGMA key = \"x'abab"));
        assert!(stmt.ends_with("'\";"));
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = DbKey::from_bytes(vec![0x11; DB_KEY_SIZE]).unwrap();
        assert_eq!(format!("{key:?}"), "DbKey(<redacted>)");
    }
}
