//! Peer identifiers.

use serde::{Deserialize, Serialize};

/// Unique peer identifier (double-BLAKE3 hash of the Ed25519 verifying key).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the identifier for a signing key.
    ///
    /// hash₁ = BLAKE3(verifying_key), hash₂ = BLAKE3(hash₁), PeerId = hash₂
    pub fn from_signing_key(verifying_key: &[u8; 32]) -> Self {
        let hash1 = blake3::hash(verifying_key);
        let hash2 = blake3::hash(hash1.as_bytes());
        Self(*hash2.as_bytes())
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}...", &self.to_hex()[..8])
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let key = [7u8; 32];
        assert_eq!(PeerId::from_signing_key(&key), PeerId::from_signing_key(&key));
        assert_ne!(PeerId::from_signing_key(&key), PeerId::from_signing_key(&[8u8; 32]));
    }

    #[test]
    fn derivation_is_double_hash() {
        let key = [1u8; 32];
        let single = blake3::hash(&key);
        assert_ne!(PeerId::from_signing_key(&key).0, *single.as_bytes());
    }

    #[test]
    fn hex_roundtrip() {
        let id = PeerId::from_bytes([0xab; 32]);
        assert_eq!(PeerId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(PeerId::from_hex("abcd").is_err());
    }

    #[test]
    fn display_is_abbreviated() {
        let id = PeerId::from_bytes([0x12; 32]);
        assert_eq!(id.to_string(), "12121212...");
    }
}
