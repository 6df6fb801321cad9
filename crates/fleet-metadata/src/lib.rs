//! Fleet node metadata.
//!
//! Every node in the fleet announces itself with a small self-signed record:
//! its public keys, the endpoint it serves on, the certificate it presents
//! there, and the time it signed the announcement. This crate owns that
//! record and its wire form.
//!
//! # Identity
//!
//! A node's [`PeerId`] is the double-BLAKE3 hash of its Ed25519 verifying key.
//! Nothing else about a node can change its identifier, so a node that moves
//! to a new endpoint keeps its identity and simply signs a newer record.
//!
//! # Trust is never transmitted
//!
//! [`PeerRecord`] carries runtime fields (trust level, last seen, certificate
//! handle) next to the signed metadata. The codec only ever writes the signed
//! part; a decoded record always starts out [`TrustLevel::Unvalidated`] and
//! has to earn its trust again locally.
//!
//! # Conflict Resolution
//!
//! Two records for the same identifier are ordered by `signed_at`, the
//! timestamp inside the signed payload. The newer self-signature wins.

pub mod codec;
mod identity;
mod peer_id;
mod record;

pub use codec::{decode, encode, from_hex, to_hex, DecodeError, MAX_METADATA_LEN, METADATA_VERSION};
pub use identity::{verify_challenge, verify_self_signature, MetadataError, NodeIdentity};
pub use peer_id::PeerId;
pub use record::{
    Certificate, CertificateRef, NetworkAddress, NodeMetadata, PeerRecord, PublicKeys, TrustLevel,
};

/// Current unix time in milliseconds, the unit of `signed_at`.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
