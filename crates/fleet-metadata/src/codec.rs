//! Node metadata codec.
//!
//! Wire form: one version byte followed by the bincode encoding (fixed-width
//! little-endian integers, length-prefixed buffers) of the signed fields and
//! the signature. Decoding is bounded by [`MAX_METADATA_LEN`] before anything
//! is allocated and rejects trailing bytes, so hostile gossip can only ever
//! produce a [`DecodeError`].
//!
//! Decoding does NOT check the signature. That is the job of metadata
//! validation, which runs later and can be skipped for records that never
//! matter to this node.

use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Certificate, NetworkAddress, NodeMetadata, PeerId, PeerRecord, PublicKeys};

/// Current wire version.
pub const METADATA_VERSION: u8 = 1;

/// Upper bound on an encoded record, version byte included.
pub const MAX_METADATA_LEN: usize = 16 * 1024;

/// Domain separator for the signed payload.
const SIGNING_DOMAIN: &[u8] = b"fleet/node-metadata/v1";

/// Errors from decoding a metadata blob.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty metadata blob")]
    Empty,

    #[error("metadata blob is {0} bytes, limit is {MAX_METADATA_LEN}")]
    TooLarge(usize),

    #[error("unsupported metadata version {0}")]
    UnsupportedVersion(u8),

    #[error("malformed metadata: {0}")]
    Malformed(#[from] bincode::Error),

    #[error("invalid {field} length: expected {expected}, got {actual}")]
    FieldLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

#[derive(Serialize, Deserialize)]
struct WireMetadata {
    id: [u8; 32],
    signing_key: [u8; 32],
    encrypting_key: [u8; 32],
    host: String,
    port: u16,
    #[serde(with = "serde_bytes")]
    certificate: Vec<u8>,
    signed_at: u64,
    #[serde(with = "serde_bytes")]
    signature: Vec<u8>,
}

/// The fields covered by the self-signature, borrowed in wire order.
#[derive(Serialize)]
struct SignedFields<'a> {
    id: &'a [u8; 32],
    signing_key: &'a [u8; 32],
    encrypting_key: &'a [u8; 32],
    host: &'a str,
    port: u16,
    #[serde(with = "serde_bytes")]
    certificate: &'a [u8],
    signed_at: u64,
}

fn wire_options() -> impl Options {
    bincode::options()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_METADATA_LEN as u64)
        .reject_trailing_bytes()
}

/// Canonical bytes a node signs over when announcing `metadata`.
pub fn signing_payload(metadata: &NodeMetadata) -> Vec<u8> {
    let fields = SignedFields {
        id: metadata.id.as_bytes(),
        signing_key: &metadata.public_keys.signing,
        encrypting_key: &metadata.public_keys.encrypting,
        host: &metadata.address.host,
        port: metadata.address.port,
        certificate: metadata.certificate.as_bytes(),
        signed_at: metadata.signed_at,
    };

    let mut payload = SIGNING_DOMAIN.to_vec();
    // Serializing borrowed fixed-size fields into a Vec cannot fail short of the limit.
    payload.extend(wire_options().serialize(&fields).unwrap_or_default());
    payload
}

/// Encode a record's signed metadata for gossip.
pub fn encode(record: &PeerRecord) -> Vec<u8> {
    let metadata = record.metadata();
    let wire = WireMetadata {
        id: metadata.id.0,
        signing_key: metadata.public_keys.signing,
        encrypting_key: metadata.public_keys.encrypting,
        host: metadata.address.host.clone(),
        port: metadata.address.port,
        certificate: metadata.certificate.0.clone(),
        signed_at: metadata.signed_at,
        signature: metadata.signature.to_vec(),
    };

    let mut out = vec![METADATA_VERSION];
    out.extend(wire_options().serialize(&wire).unwrap_or_default());
    out
}

/// Decode a gossip blob into an unvalidated record.
pub fn decode(bytes: &[u8]) -> Result<PeerRecord, DecodeError> {
    let (&version, body) = bytes.split_first().ok_or(DecodeError::Empty)?;
    if bytes.len() > MAX_METADATA_LEN {
        return Err(DecodeError::TooLarge(bytes.len()));
    }
    if version != METADATA_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let wire: WireMetadata = wire_options().deserialize(body)?;
    let signature: [u8; 64] =
        wire.signature
            .as_slice()
            .try_into()
            .map_err(|_| DecodeError::FieldLength {
                field: "signature",
                expected: 64,
                actual: wire.signature.len(),
            })?;

    Ok(PeerRecord::new(NodeMetadata {
        id: PeerId(wire.id),
        public_keys: PublicKeys {
            signing: wire.signing_key,
            encrypting: wire.encrypting_key,
        },
        address: NetworkAddress {
            host: wire.host,
            port: wire.port,
        },
        certificate: Certificate(wire.certificate),
        signed_at: wire.signed_at,
        signature,
    }))
}

/// Hex form used by metadata files.
pub fn to_hex(record: &PeerRecord) -> String {
    hex::encode(encode(record))
}

/// Parse a metadata file's contents.
pub fn from_hex(s: &str) -> Result<PeerRecord, DecodeError> {
    let bytes = hex::decode(s.trim())?;
    decode(&bytes)
}
