//! Error types for fleet-learning.

use fleet_metadata::{MetadataError, PeerId, TrustLevel};
use thiserror::Error;

/// Result type for learning loop operations.
pub type Result<T> = std::result::Result<T, LearningError>;

/// Failures of a single verification stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    /// Signature or identifier check failed; the candidate is discarded.
    #[error("invalid metadata: {0}")]
    InvalidSignature(#[from] MetadataError),

    /// The declared endpoint did not answer in time.
    #[error("{peer} unreachable: {reason}")]
    Unreachable { peer: PeerId, reason: String },

    /// The endpoint answered with a different certificate or a bad proof.
    #[error("certificate mismatch for {0}")]
    CertificateMismatch(PeerId),

    /// Bonded stake below the policy minimum.
    #[error("{peer} holds stake {stake}, below the minimum of {required}")]
    InsufficientStake {
        peer: PeerId,
        stake: u128,
        required: u128,
    },

    /// The staking ledger could not be read.
    #[error("staking ledger unavailable: {0}")]
    ChainUnavailable(String),

    /// No staking ledger is configured (federated operation).
    #[error("no staking ledger configured")]
    NoLedger,

    /// A stage was requested out of order.
    #[error("{peer} is {actual}, stage requires {required}")]
    Prerequisite {
        peer: PeerId,
        actual: TrustLevel,
        required: TrustLevel,
    },

    #[error("{0} is not a known node")]
    UnknownPeer(PeerId),

    /// An earlier security event excludes this peer from verification.
    #[error("{0} is flagged after a security event")]
    Flagged(PeerId),

    /// The peer re-announced itself while we were verifying the old record.
    #[error("{0} was re-announced during verification")]
    Superseded(PeerId),

    #[error("certificate store: {0}")]
    CertificateStore(String),
}

impl VerificationError {
    /// Whether the same stage may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. }
                | Self::ChainUnavailable(_)
                | Self::Superseded(_)
                | Self::CertificateStore(_)
        )
    }
}

/// Failures fetching gossip from a teacher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("teacher {teacher} unreachable: {reason}")]
    TeacherUnreachable { teacher: PeerId, reason: String },

    #[error("malformed response from teacher {teacher}: {reason}")]
    MalformedResponse { teacher: PeerId, reason: String },
}

impl FetchError {
    pub fn teacher(&self) -> PeerId {
        match self {
            Self::TeacherUnreachable { teacher, .. } | Self::MalformedResponse { teacher, .. } => {
                *teacher
            }
        }
    }
}

/// Errors surfaced by the gossip transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timed out")]
    Timeout,

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Errors from the staking ledger collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("chain unavailable: {0}")]
    ChainUnavailable(String),
}

/// Errors from the certificate store collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CertificateStoreError {
    #[error("no certificate stored for {0}")]
    NotFound(PeerId),

    #[error("certificate backend: {0}")]
    Backend(String),
}

/// Errors that end a learning loop or a learning call.
#[derive(Debug, Error)]
pub enum LearningError {
    /// `abort_on_learning_error` escalated repeated teacher failures.
    #[error("learning aborted after {failures} consecutive teacher failures: {last}")]
    Aborted { failures: u32, last: FetchError },

    #[error("learning loop is already running")]
    AlreadyRunning,

    #[error("learning loop has been stopped")]
    Stopped,

    #[error("learning worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Verification(#[from] VerificationError),
}
