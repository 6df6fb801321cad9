//! Node identity: signing our own announcement and checking everyone else's.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

use crate::codec::signing_payload;
use crate::{Certificate, NetworkAddress, NodeMetadata, PeerId, PeerRecord, PublicKeys};

const ENCRYPTING_KEY_CONTEXT: &str = "fleet 2024-06 encrypting key";
const CERTIFICATE_DOMAIN: &[u8] = b"fleet/self-issued-certificate/v1";
const CHALLENGE_DOMAIN: &[u8] = b"fleet/identify/v1";

/// Reasons a record's metadata fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("{claimed} does not match its signing key (derived {derived})")]
    IdentifierMismatch { claimed: PeerId, derived: PeerId },

    #[error("{0} announced a malformed signing key")]
    InvalidKey(PeerId),

    #[error("{0} carries an invalid self-signature")]
    InvalidSignature(PeerId),
}

/// Check that `metadata` is self-consistent: the identifier derives from the
/// signing key and the signature covers the canonical payload.
pub fn verify_self_signature(metadata: &NodeMetadata) -> Result<(), MetadataError> {
    let derived = PeerId::from_signing_key(&metadata.public_keys.signing);
    if derived != metadata.id {
        return Err(MetadataError::IdentifierMismatch {
            claimed: metadata.id,
            derived,
        });
    }

    let key = VerifyingKey::from_bytes(&metadata.public_keys.signing)
        .map_err(|_| MetadataError::InvalidKey(metadata.id))?;
    let signature = Signature::from_bytes(&metadata.signature);
    key.verify(&signing_payload(metadata), &signature)
        .map_err(|_| MetadataError::InvalidSignature(metadata.id))
}

fn challenge_message(nonce: &[u8; 32], certificate: &Certificate) -> Vec<u8> {
    let mut message = CHALLENGE_DOMAIN.to_vec();
    message.extend_from_slice(nonce);
    message.extend_from_slice(certificate.as_bytes());
    message
}

/// Check a peer's answer to an identify challenge.
pub fn verify_challenge(
    signing_key: &[u8; 32],
    nonce: &[u8; 32],
    certificate: &Certificate,
    signature: &[u8; 64],
) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(signing_key) else {
        return false;
    };
    key.verify(
        &challenge_message(nonce, certificate),
        &Signature::from_bytes(signature),
    )
    .is_ok()
}

/// This node's long-lived key material.
pub struct NodeIdentity {
    signing_key: SigningKey,
    encrypting_key: [u8; 32],
}

impl NodeIdentity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Deterministic identity from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    /// Wrap a persisted signing key. The encrypting key is derived from it.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let encrypting_key = blake3::derive_key(ENCRYPTING_KEY_CONTEXT, signing_key.as_bytes());
        Self {
            signing_key,
            encrypting_key,
        }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_signing_key(self.signing_key.verifying_key().as_bytes())
    }

    pub fn public_keys(&self) -> PublicKeys {
        PublicKeys {
            signing: self.signing_key.verifying_key().to_bytes(),
            encrypting: self.encrypting_key,
        }
    }

    /// A certificate binding our signing key to `address`.
    ///
    /// Stands in for a TLS certificate when the node runs without one.
    pub fn self_issued_certificate(&self, address: &NetworkAddress) -> Certificate {
        let mut body = CERTIFICATE_DOMAIN.to_vec();
        body.extend_from_slice(self.signing_key.verifying_key().as_bytes());
        body.extend_from_slice(address.to_string().as_bytes());
        let signature = self.signing_key.sign(&body);
        body.extend_from_slice(&signature.to_bytes());
        Certificate::new(body)
    }

    /// Sign an announcement of ourselves.
    pub fn sign_metadata(
        &self,
        address: NetworkAddress,
        certificate: Certificate,
        signed_at: u64,
    ) -> PeerRecord {
        let mut metadata = NodeMetadata {
            id: self.peer_id(),
            public_keys: self.public_keys(),
            address,
            certificate,
            signed_at,
            signature: [0u8; 64],
        };
        metadata.signature = self.signing_key.sign(&signing_payload(&metadata)).to_bytes();
        PeerRecord::new(metadata)
    }

    /// Prove control of our endpoint to a verifier that sent `nonce`.
    pub fn answer_challenge(&self, nonce: &[u8; 32], certificate: &Certificate) -> [u8; 64] {
        self.signing_key
            .sign(&challenge_message(nonce, certificate))
            .to_bytes()
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}
