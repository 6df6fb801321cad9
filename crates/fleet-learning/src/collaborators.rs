//! Boundaries to the world outside the learning core.
//!
//! | Trait | Used by | Production implementation |
//! |-------|---------|---------------------------|
//! | [`MetadataValidator`] | verification stage 1 | [`SignatureValidator`] |
//! | [`NetworkVerifier`] | verification stage 2 | node transport |
//! | [`StakeLedger`] | verification stage 3 | chain client |
//! | [`CertificateStore`] | stage 2, gossip fetcher | node storage, [`MemoryCertificateStore`] |
//! | [`GossipTransport`] | gossip fetcher | node transport |
//!
//! Every trait is object-safe and `Send + Sync`; the pipeline holds them as
//! `Arc<dyn ...>` so tests can swap in deterministic fakes.

use std::collections::HashMap;

use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use fleet_metadata::{
    verify_self_signature, Certificate, MetadataError, NetworkAddress, NodeMetadata, PeerId,
    PeerRecord,
};
use parking_lot::RwLock;

use crate::error::{CertificateStoreError, LedgerError, TransportError, VerificationError};
use crate::registry::FleetChecksum;

/// Non-interactive metadata check.
pub trait MetadataValidator: Send + Sync {
    fn validate(&self, metadata: &NodeMetadata) -> Result<(), MetadataError>;
}

/// Checks identifier derivation and the Ed25519 self-signature.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureValidator;

impl MetadataValidator for SignatureValidator {
    fn validate(&self, metadata: &NodeMetadata) -> Result<(), MetadataError> {
        verify_self_signature(metadata)
    }
}

/// Interactive proof that a peer controls its declared endpoint.
#[async_trait]
pub trait NetworkVerifier: Send + Sync {
    /// Challenge `peer` at its declared address.
    ///
    /// Returns the certificate the endpoint proved control of, or
    /// `Unreachable` / `CertificateMismatch`.
    async fn verify(&self, peer: &Peer) -> Result<Certificate, VerificationError>;
}

/// Read access to bonded stake.
#[async_trait]
pub trait StakeLedger: Send + Sync {
    async fn stake_of(&self, peer: &PeerId) -> Result<u128, LedgerError>;
}

/// Certificates of verified peers.
pub trait CertificateStore: Send + Sync {
    fn get(&self, peer: &PeerId) -> Result<Certificate, CertificateStoreError>;
    fn put(&self, peer: &PeerId, certificate: &Certificate) -> Result<(), CertificateStoreError>;
}

/// What a teacher answered to "give me your known peers".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipResponse {
    /// The teacher's fleet checksum equals ours.
    Unchanged,
    /// Encoded records, plus the teacher's checksum when it reports one.
    Nodes {
        checksum: Option<FleetChecksum>,
        nodes: Vec<Vec<u8>>,
    },
}

/// Request/response exchange with a teacher.
#[async_trait]
pub trait GossipTransport: Send + Sync {
    async fn known_nodes(
        &self,
        teacher: &Peer,
        certificate: &Certificate,
        our_checksum: &FleetChecksum,
    ) -> Result<GossipResponse, TransportError>;
}

/// A peer materialized for interactive work: parsed keys and endpoint.
///
/// Records stay as cheap shared metadata in the registry; only peers the loop
/// actually talks to are turned into `Peer`s.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub verifying_key: VerifyingKey,
    pub encrypting_key: [u8; 32],
    pub address: NetworkAddress,
    /// Certificate the peer declared in its metadata.
    pub declared_certificate: Certificate,
}

impl Peer {
    /// Parse the keys of `record`.
    pub fn materialize(record: &PeerRecord) -> Result<Self, VerificationError> {
        let verifying_key = VerifyingKey::from_bytes(&record.public_keys().signing)
            .map_err(|_| MetadataError::InvalidKey(record.id()))?;
        Ok(Self {
            id: record.id(),
            verifying_key,
            encrypting_key: record.public_keys().encrypting,
            address: record.address().clone(),
            declared_certificate: record.certificate().clone(),
        })
    }
}

/// Process-local certificate store.
#[derive(Debug, Default)]
pub struct MemoryCertificateStore {
    certificates: RwLock<HashMap<PeerId, Certificate>>,
}

impl MemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.certificates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.read().is_empty()
    }
}

impl CertificateStore for MemoryCertificateStore {
    fn get(&self, peer: &PeerId) -> Result<Certificate, CertificateStoreError> {
        self.certificates
            .read()
            .get(peer)
            .cloned()
            .ok_or(CertificateStoreError::NotFound(*peer))
    }

    fn put(&self, peer: &PeerId, certificate: &Certificate) -> Result<(), CertificateStoreError> {
        self.certificates.write().insert(*peer, certificate.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_metadata::NodeIdentity;

    #[test]
    fn signature_validator_accepts_signed_metadata() {
        let identity = NodeIdentity::from_seed([4u8; 32]);
        let address = NetworkAddress::new("127.0.0.1", 9000);
        let record = identity.sign_metadata(address.clone(), identity.self_issued_certificate(&address), 1);
        assert!(SignatureValidator.validate(record.metadata()).is_ok());
    }

    #[test]
    fn materialize_parses_keys_and_endpoint() {
        let identity = NodeIdentity::from_seed([6u8; 32]);
        let address = NetworkAddress::new("10.1.2.3", 9151);
        let record = identity.sign_metadata(address.clone(), identity.self_issued_certificate(&address), 7);

        let peer = Peer::materialize(&record).unwrap();
        assert_eq!(peer.id, identity.peer_id());
        assert_eq!(peer.verifying_key.to_bytes(), identity.public_keys().signing);
        assert_eq!(peer.address, address);
        assert_eq!(&peer.declared_certificate, record.certificate());
    }

    #[test]
    fn memory_store_get_put() {
        let store = MemoryCertificateStore::new();
        let peer = PeerId::from_bytes([1u8; 32]);
        assert_eq!(store.get(&peer), Err(CertificateStoreError::NotFound(peer)));

        store.put(&peer, &Certificate::new(vec![1])).unwrap();
        assert_eq!(store.get(&peer).unwrap(), Certificate::new(vec![1]));
        assert_eq!(store.len(), 1);
    }
}
