//! Deterministic fake collaborators and record builders.
//!
//! Available to this crate's tests and, with the `test-util` feature, to
//! downstream crates.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use fleet_metadata::{
    codec, Certificate, NetworkAddress, NodeIdentity, NodeMetadata, PeerId, PeerRecord,
    PublicKeys,
};
use parking_lot::Mutex;

use crate::collaborators::{
    GossipResponse, GossipTransport, MemoryCertificateStore, MetadataValidator, NetworkVerifier,
    Peer, StakeLedger,
};
use crate::config::LearningConfig;
use crate::error::{LedgerError, TransportError, VerificationError};
use crate::learner::Learner;
use crate::registry::{FleetChecksum, KnownNodes};
use crate::verification::VerificationPipeline;

/// Identity derived from a one-byte seed.
pub fn identity(seed: u8) -> NodeIdentity {
    NodeIdentity::from_seed([seed; 32])
}

/// Address used by [`signed_record`] for `seed`.
pub fn address(seed: u8) -> NetworkAddress {
    NetworkAddress::new(format!("10.0.0.{seed}"), 9151)
}

/// A properly self-signed record for the identity behind `seed`.
pub fn signed_record(seed: u8, signed_at: u64) -> PeerRecord {
    let identity = identity(seed);
    let address = address(seed);
    let certificate = identity.self_issued_certificate(&address);
    identity.sign_metadata(address, certificate, signed_at)
}

/// A cheap unsigned record with a unique identifier.
///
/// Carries a real verifying key so it can be materialized, but no valid
/// signature; only [`PermissiveValidator`] admits it.
pub fn bulk_record(n: u32) -> PeerRecord {
    static SHARED_KEYS: OnceLock<PublicKeys> = OnceLock::new();
    let public_keys = *SHARED_KEYS.get_or_init(|| identity(0xFE).public_keys());
    let [_, a, b, c] = n.to_be_bytes();
    let address = NetworkAddress::new(format!("10.{a}.{b}.{c}"), 9151);
    PeerRecord::new(NodeMetadata {
        id: PeerId::from_bytes(*blake3::hash(&n.to_le_bytes()).as_bytes()),
        public_keys,
        certificate: Certificate::new(n.to_be_bytes().to_vec()),
        address,
        signed_at: 1,
        signature: [0u8; 64],
    })
}

/// Encoded [`bulk_record`]s `0..count`.
pub fn bulk_blobs(count: u32) -> Vec<Vec<u8>> {
    (0..count).map(|n| codec::encode(&bulk_record(n))).collect()
}

/// Byte strings that never decode: truncated bodies and unknown versions.
pub fn malformed_blobs(count: u32) -> Vec<Vec<u8>> {
    (0..count)
        .map(|n| {
            let version = if n % 2 == 0 {
                fleet_metadata::METADATA_VERSION
            } else {
                0xEE
            };
            let mut blob = vec![version];
            blob.extend_from_slice(&n.to_le_bytes());
            blob
        })
        .collect()
}

/// Accepts every record without looking at it.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveValidator;

impl MetadataValidator for PermissiveValidator {
    fn validate(&self, _metadata: &NodeMetadata) -> Result<(), fleet_metadata::MetadataError> {
        Ok(())
    }
}

/// Network verifier answering from in-memory rules.
///
/// By default every peer proves its declared certificate.
#[derive(Debug, Default)]
pub struct FakeNetwork {
    unreachable: Mutex<HashSet<PeerId>>,
    impostors: Mutex<HashSet<PeerId>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, id: PeerId) {
        self.unreachable.lock().insert(id);
    }

    pub fn set_reachable(&self, id: PeerId) {
        self.unreachable.lock().remove(&id);
    }

    /// The endpoint answers with somebody else's certificate.
    pub fn set_impostor(&self, id: PeerId) {
        self.impostors.lock().insert(id);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Challenges issued so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkVerifier for FakeNetwork {
    async fn verify(&self, peer: &Peer) -> Result<Certificate, VerificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.lock().contains(&peer.id) {
            return Err(VerificationError::Unreachable {
                peer: peer.id,
                reason: "connection refused".into(),
            });
        }
        if self.impostors.lock().contains(&peer.id) {
            return Ok(Certificate::new(b"somebody else".to_vec()));
        }
        Ok(peer.declared_certificate.clone())
    }
}

/// Staking ledger backed by a map. Unknown peers hold zero stake.
#[derive(Debug, Default)]
pub struct FakeLedger {
    stakes: Mutex<HashMap<PeerId, u128>>,
    unavailable: AtomicBool,
    calls: AtomicUsize,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stake(&self, id: PeerId, stake: u128) {
        self.stakes.lock().insert(id, stake);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StakeLedger for FakeLedger {
    async fn stake_of(&self, peer: &PeerId) -> Result<u128, LedgerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::ChainUnavailable("rpc endpoint offline".into()));
        }
        Ok(self.stakes.lock().get(peer).copied().unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
enum Lesson {
    Nodes {
        checksum: FleetChecksum,
        nodes: Arc<Vec<Vec<u8>>>,
    },
    Fail(TransportError),
}

/// Gossip transport with canned answers per teacher.
///
/// A teacher answers `Unchanged` when the caller's checksum matches the set
/// of identifiers it would have sent.
#[derive(Debug, Default)]
pub struct FakeGossip {
    lessons: Mutex<HashMap<PeerId, Lesson>>,
    calls: AtomicUsize,
}

impl FakeGossip {
    pub fn new() -> Self {
        Self::default()
    }

    /// `teacher` will answer with `nodes`.
    pub fn teach(&self, teacher: PeerId, nodes: Vec<Vec<u8>>) {
        let mut ids: Vec<PeerId> = nodes
            .iter()
            .filter_map(|blob| codec::decode(blob).ok())
            .map(|record| record.id())
            .chain(std::iter::once(teacher))
            .collect();
        ids.sort();
        ids.dedup();
        let lesson = Lesson::Nodes {
            checksum: FleetChecksum::of(&ids),
            nodes: Arc::new(nodes),
        };
        self.lessons.lock().insert(teacher, lesson);
    }

    /// `teacher` will fail every request with `error`.
    pub fn fail(&self, teacher: PeerId, error: TransportError) {
        self.lessons.lock().insert(teacher, Lesson::Fail(error));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GossipTransport for FakeGossip {
    async fn known_nodes(
        &self,
        teacher: &Peer,
        _certificate: &Certificate,
        our_checksum: &FleetChecksum,
    ) -> Result<GossipResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let lesson = self.lessons.lock().get(&teacher.id).cloned();
        match lesson {
            Some(Lesson::Nodes { checksum, .. }) if checksum == *our_checksum => {
                Ok(GossipResponse::Unchanged)
            }
            Some(Lesson::Nodes { checksum, nodes }) => Ok(GossipResponse::Nodes {
                checksum: Some(checksum),
                nodes: nodes.as_ref().clone(),
            }),
            Some(Lesson::Fail(error)) => Err(error),
            None => Err(TransportError::ConnectionFailed(format!(
                "{} is not listening",
                teacher.address
            ))),
        }
    }
}

/// A learner wired to fakes.
pub struct Harness {
    pub known: Arc<KnownNodes>,
    pub network: Arc<FakeNetwork>,
    pub ledger: Arc<FakeLedger>,
    pub gossip: Arc<FakeGossip>,
    pub certificates: Arc<MemoryCertificateStore>,
    pub learner: Arc<Learner>,
}

impl Harness {
    /// Signature-checking pipeline with a staking ledger.
    pub fn new(config: LearningConfig) -> Self {
        Self::build(config, false)
    }

    /// Pipeline that admits every record, for [`bulk_record`] fleets.
    pub fn permissive(config: LearningConfig) -> Self {
        Self::build(config, true)
    }

    fn build(config: LearningConfig, permissive: bool) -> Self {
        let known = Arc::new(KnownNodes::new());
        let network = Arc::new(FakeNetwork::new());
        let ledger = Arc::new(FakeLedger::new());
        let gossip = Arc::new(FakeGossip::new());
        let certificates = Arc::new(MemoryCertificateStore::new());

        let mut pipeline = VerificationPipeline::new(
            Arc::clone(&known),
            network.clone(),
            certificates.clone(),
            &config,
        )
        .with_ledger(ledger.clone());
        if permissive {
            pipeline = pipeline.with_validator(Arc::new(PermissiveValidator));
        }

        let learner = Arc::new(Learner::new(config, Arc::new(pipeline), gossip.clone()));
        Self {
            known,
            network,
            ledger,
            gossip,
            certificates,
            learner,
        }
    }
}
