//! Fleet learning: discovering peers and earning trust in them.
//!
//! A node starts from a handful of seed teachers and pulls their peer lists
//! over gossip. Every gossiped record is cheap to accept: it is decoded,
//! its self-signature is checked and it is merged into the [`KnownNodes`]
//! registry. Nothing more happens to it until somebody needs it.
//!
//! # Trust levels
//!
//! ```text
//! Unvalidated -> MetadataValid -> NetworkVerified -> StakeVerified
//!               (signature)      (endpoint proof)    (bonded stake)
//! ```
//!
//! The [`VerificationPipeline`] runs each stage on demand. The [`Learner`]
//! only asks for interactive stages for a small sample per cycle, for its
//! seeds, and for explicit [`Learner::require_verified`] calls, so learning
//! about thousands of peers stays cheap.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use fleet_learning::{
//!     GossipTransport, KnownNodes, LearnMode, Learner, LearningConfig,
//!     MemoryCertificateStore, NetworkVerifier, VerificationPipeline,
//! };
//!
//! # async fn demo(
//! #     network: Arc<dyn NetworkVerifier>,
//! #     transport: Arc<dyn GossipTransport>,
//! # ) -> fleet_learning::Result<()> {
//! let config = LearningConfig::default();
//! let known = Arc::new(KnownNodes::new());
//! let pipeline = VerificationPipeline::new(
//!     known,
//!     network,
//!     Arc::new(MemoryCertificateStore::new()),
//!     &config,
//! );
//! let learner = Arc::new(Learner::new(config, Arc::new(pipeline), transport));
//! learner.start()?;
//! learner
//!     .block_until_number_of_known_nodes_is(8, Duration::from_secs(60), LearnMode::Background)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod config;
pub mod error;
pub mod gossip;
pub mod learner;
pub mod registry;
pub mod teachers;
pub mod verification;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

#[cfg(test)]
mod discovery_test;

pub use collaborators::{
    CertificateStore, GossipResponse, GossipTransport, MemoryCertificateStore, MetadataValidator,
    NetworkVerifier, Peer, SignatureValidator, StakeLedger,
};
pub use config::LearningConfig;
pub use error::{
    CertificateStoreError, FetchError, LearningError, LedgerError, Result, TransportError,
    VerificationError,
};
pub use gossip::{GossipBatch, GossipFetcher};
pub use learner::{CycleReport, FleetStatus, LearnMode, Learner, LoopState};
pub use registry::{FleetChecksum, FleetState, KnownNodes, MergeOutcome, MergeSummary, RegistryStats};
pub use teachers::TeacherRotation;
pub use verification::{VerificationCounts, VerificationPipeline, VerificationStats};
