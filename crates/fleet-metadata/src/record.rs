//! Peer records: signed metadata plus locally derived trust.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::PeerId;

/// Graded confidence in a peer.
///
/// Levels are ordered; a peer only ever moves up within one process lifetime
/// unless its identity is replaced by a newer signature or it is evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrustLevel {
    /// Decoded, nothing checked yet.
    Unvalidated,
    /// Self-signature and identifier check out.
    MetadataValid,
    /// Proved control of its declared endpoint.
    NetworkVerified,
    /// Holds sufficient bonded stake.
    StakeVerified,
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unvalidated => write!(f, "Unvalidated"),
            Self::MetadataValid => write!(f, "MetadataValid"),
            Self::NetworkVerified => write!(f, "NetworkVerified"),
            Self::StakeVerified => write!(f, "StakeVerified"),
        }
    }
}

/// Declared network endpoint of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub host: String,
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Public key material of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKeys {
    /// Ed25519 verifying key.
    pub signing: [u8; 32],
    /// Re-encryption public key (opaque to the learning core).
    pub encrypting: [u8; 32],
}

/// Certificate a peer presents at its endpoint (DER bytes, opaque here).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Certificate(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl Certificate {
    pub fn new(der: Vec<u8>) -> Self {
        Self(der)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Handle under which the certificate store keeps this certificate.
    pub fn fingerprint(&self) -> CertificateRef {
        CertificateRef(*blake3::hash(&self.0).as_bytes())
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Certificate({} bytes, {})", self.0.len(), self.fingerprint())
    }
}

/// Opaque handle into the certificate store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CertificateRef(pub [u8; 32]);

impl CertificateRef {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for CertificateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}...", &self.to_hex()[..8])
    }
}

impl std::fmt::Debug for CertificateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CertificateRef({})", &self.to_hex()[..16])
    }
}

/// The signed, immutable part of a peer's announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMetadata {
    /// Identifier the peer claims; checked against `public_keys` on validation.
    pub id: PeerId,
    pub public_keys: PublicKeys,
    pub address: NetworkAddress,
    pub certificate: Certificate,
    /// Unix millis at signing time.
    pub signed_at: u64,
    /// Ed25519 signature over the canonical payload.
    pub signature: [u8; 64],
}

/// A known peer: signed metadata plus trust derived in this process.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    metadata: Arc<NodeMetadata>,

    /// Current trust in this peer.
    pub trust_level: TrustLevel,

    /// Set once the certificate was stored after network verification.
    pub certificate_ref: Option<CertificateRef>,

    /// Last successful gossip or verification touch.
    pub last_seen: Instant,

    /// A security event (certificate mismatch) was recorded for this peer.
    pub flagged: bool,

    /// When the staking ledger last reported insufficient stake.
    pub stake_rejected_at: Option<Instant>,
}

impl PeerRecord {
    /// Wrap freshly decoded or freshly signed metadata.
    pub fn new(metadata: NodeMetadata) -> Self {
        Self::from_shared(Arc::new(metadata))
    }

    fn from_shared(metadata: Arc<NodeMetadata>) -> Self {
        Self {
            metadata,
            trust_level: TrustLevel::Unvalidated,
            certificate_ref: None,
            last_seen: Instant::now(),
            flagged: false,
            stake_rejected_at: None,
        }
    }

    /// Same metadata with every runtime field reset.
    pub fn reset(&self) -> Self {
        Self::from_shared(Arc::clone(&self.metadata))
    }

    pub fn metadata(&self) -> &NodeMetadata {
        &self.metadata
    }

    pub fn id(&self) -> PeerId {
        self.metadata.id
    }

    pub fn public_keys(&self) -> &PublicKeys {
        &self.metadata.public_keys
    }

    pub fn address(&self) -> &NetworkAddress {
        &self.metadata.address
    }

    pub fn certificate(&self) -> &Certificate {
        &self.metadata.certificate
    }

    pub fn signed_at(&self) -> u64 {
        self.metadata.signed_at
    }

    pub fn signature(&self) -> &[u8; 64] {
        &self.metadata.signature
    }

    /// Check if this record carries a strictly newer self-signature.
    pub fn is_newer_than(&self, other: &PeerRecord) -> bool {
        self.metadata.signed_at > other.metadata.signed_at
    }

    /// Check if both records carry the same signed announcement.
    pub fn same_announcement(&self, other: &PeerRecord) -> bool {
        Arc::ptr_eq(&self.metadata, &other.metadata) || self.metadata == other.metadata
    }

    /// Builder-style trust override, used for seeds and tests.
    #[must_use]
    pub fn with_trust(mut self, level: TrustLevel) -> Self {
        self.trust_level = level;
        self
    }
}
