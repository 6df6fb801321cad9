//! Verification pipeline.
//!
//! Three stages, each invokable on its own and each idempotent:
//!
//! 1. **Metadata validation** is pure and runs for every gossiped candidate
//!    before it may enter the registry.
//! 2. **Network verification** challenges the declared endpoint. It is the
//!    expensive step and only runs when somebody asks for it.
//! 3. **Stake verification** reads the staking ledger. Disabled when no
//!    ledger is configured.
//!
//! A record already at or above a stage's level is returned as-is and no
//! counter moves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_metadata::{PeerId, PeerRecord, TrustLevel};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::collaborators::{
    CertificateStore, MetadataValidator, NetworkVerifier, Peer, SignatureValidator, StakeLedger,
};
use crate::config::LearningConfig;
use crate::error::{LedgerError, VerificationError};
use crate::registry::KnownNodes;

/// Counters for the pipeline's work.
#[derive(Debug, Default)]
pub struct VerificationStats {
    metadata_validations: AtomicU64,
    network_verifications: AtomicU64,
    stake_verifications: AtomicU64,
    materialized: AtomicU64,
    invalid_metadata: AtomicU64,
    unreachable: AtomicU64,
    certificate_mismatches: AtomicU64,
    insufficient_stake: AtomicU64,
    chain_unavailable: AtomicU64,
}

/// Point-in-time copy of [`VerificationStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerificationCounts {
    pub metadata_validations: u64,
    pub network_verifications: u64,
    pub stake_verifications: u64,
    pub materialized: u64,
    pub invalid_metadata: u64,
    pub unreachable: u64,
    pub certificate_mismatches: u64,
    pub insufficient_stake: u64,
    pub chain_unavailable: u64,
}

impl VerificationStats {
    pub fn snapshot(&self) -> VerificationCounts {
        VerificationCounts {
            metadata_validations: self.metadata_validations.load(Ordering::Relaxed),
            network_verifications: self.network_verifications.load(Ordering::Relaxed),
            stake_verifications: self.stake_verifications.load(Ordering::Relaxed),
            materialized: self.materialized.load(Ordering::Relaxed),
            invalid_metadata: self.invalid_metadata.load(Ordering::Relaxed),
            unreachable: self.unreachable.load(Ordering::Relaxed),
            certificate_mismatches: self.certificate_mismatches.load(Ordering::Relaxed),
            insufficient_stake: self.insufficient_stake.load(Ordering::Relaxed),
            chain_unavailable: self.chain_unavailable.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, err: &VerificationError) {
        match err {
            VerificationError::InvalidSignature(_) => Self::bump(&self.invalid_metadata),
            VerificationError::Unreachable { .. } => Self::bump(&self.unreachable),
            VerificationError::CertificateMismatch(_) => Self::bump(&self.certificate_mismatches),
            VerificationError::InsufficientStake { .. } => Self::bump(&self.insufficient_stake),
            VerificationError::ChainUnavailable(_) => Self::bump(&self.chain_unavailable),
            _ => {}
        }
    }
}

/// The three verification stages over one shared registry.
pub struct VerificationPipeline {
    known: Arc<KnownNodes>,
    validator: Arc<dyn MetadataValidator>,
    network: Arc<dyn NetworkVerifier>,
    ledger: Option<Arc<dyn StakeLedger>>,
    certificates: Arc<dyn CertificateStore>,
    network_timeout: Duration,
    stake_timeout: Duration,
    stake_recheck_ttl: Duration,
    min_stake: u128,
    /// Stake observed at the last insufficient-stake verdict.
    rejected_stake: Mutex<HashMap<PeerId, u128>>,
    stats: Arc<VerificationStats>,
}

impl VerificationPipeline {
    /// Pipeline with signature validation and no staking ledger.
    pub fn new(
        known: Arc<KnownNodes>,
        network: Arc<dyn NetworkVerifier>,
        certificates: Arc<dyn CertificateStore>,
        config: &LearningConfig,
    ) -> Self {
        Self {
            known,
            validator: Arc::new(SignatureValidator),
            network,
            ledger: None,
            certificates,
            network_timeout: config.network_timeout,
            stake_timeout: config.stake_timeout,
            stake_recheck_ttl: config.stake_recheck_ttl,
            min_stake: config.min_stake,
            rejected_stake: Mutex::new(HashMap::new()),
            stats: Arc::new(VerificationStats::default()),
        }
    }

    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn MetadataValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Enable stage 3.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn StakeLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn known(&self) -> &Arc<KnownNodes> {
        &self.known
    }

    pub fn certificates(&self) -> &Arc<dyn CertificateStore> {
        &self.certificates
    }

    pub fn stats(&self) -> &Arc<VerificationStats> {
        &self.stats
    }

    /// Whether stake verification is disabled.
    pub fn is_federated(&self) -> bool {
        self.ledger.is_none()
    }

    /// Drop cached verdicts for a peer that left the registry.
    pub fn forget(&self, id: &PeerId) {
        self.rejected_stake.lock().remove(id);
    }

    /// Stage 1 on a candidate that is not in the registry yet.
    ///
    /// Returns the candidate raised to `MetadataValid`; a rejected candidate
    /// is simply dropped by the caller.
    pub fn admit(&self, record: PeerRecord) -> Result<PeerRecord, VerificationError> {
        if record.trust_level >= TrustLevel::MetadataValid {
            return Ok(record);
        }
        VerificationStats::bump(&self.stats.metadata_validations);
        match self.validator.validate(record.metadata()) {
            Ok(()) => Ok(record.with_trust(TrustLevel::MetadataValid)),
            Err(err) => {
                let err = VerificationError::from(err);
                self.stats.record_failure(&err);
                debug!(peer = %record.id(), error = %err, "rejected candidate");
                Err(err)
            }
        }
    }

    /// Stage 1 on a record already in the registry. Invalid records are evicted.
    pub fn validate_metadata(&self, id: &PeerId) -> Result<TrustLevel, VerificationError> {
        let record = self.known.get(id).ok_or(VerificationError::UnknownPeer(*id))?;
        if record.trust_level >= TrustLevel::MetadataValid {
            return Ok(record.trust_level);
        }
        match self.admit(record.clone()) {
            Ok(_) => {
                self.known
                    .promote_verified(&record, TrustLevel::MetadataValid, None);
                Ok(TrustLevel::MetadataValid)
            }
            Err(err) => {
                self.known.evict(id);
                Err(err)
            }
        }
    }

    /// Stage 2: prove the peer controls its declared endpoint.
    pub async fn verify_network(&self, id: &PeerId) -> Result<TrustLevel, VerificationError> {
        let mut record = self.known.get(id).ok_or(VerificationError::UnknownPeer(*id))?;
        if record.flagged {
            return Err(VerificationError::Flagged(*id));
        }
        if record.trust_level >= TrustLevel::NetworkVerified {
            return Ok(record.trust_level);
        }
        if record.trust_level < TrustLevel::MetadataValid {
            self.validate_metadata(id)?;
            record = record.with_trust(TrustLevel::MetadataValid);
        }

        let peer = Peer::materialize(&record).inspect_err(|err| self.stats.record_failure(err))?;
        VerificationStats::bump(&self.stats.materialized);
        VerificationStats::bump(&self.stats.network_verifications);

        let answer = tokio::time::timeout(self.network_timeout, self.network.verify(&peer)).await;
        let certificate = match answer {
            Ok(Ok(certificate)) => certificate,
            Ok(Err(VerificationError::CertificateMismatch(_))) => {
                return Err(self.security_event(&record));
            }
            Ok(Err(err)) => {
                self.stats.record_failure(&err);
                debug!(peer = %id, address = %peer.address, error = %err, "network verification failed");
                return Err(err);
            }
            Err(_) => {
                let err = VerificationError::Unreachable {
                    peer: *id,
                    reason: format!("no answer within {:?}", self.network_timeout),
                };
                self.stats.record_failure(&err);
                debug!(peer = %id, address = %peer.address, "network verification timed out");
                return Err(err);
            }
        };

        if &certificate != record.certificate() {
            return Err(self.security_event(&record));
        }

        self.certificates
            .put(id, &certificate)
            .map_err(|e| VerificationError::CertificateStore(e.to_string()))?;

        if self.known.promote_verified(
            &record,
            TrustLevel::NetworkVerified,
            Some(certificate.fingerprint()),
        ) {
            debug!(peer = %id, address = %peer.address, "network verified");
            return Ok(TrustLevel::NetworkVerified);
        }

        // Lost a race: either someone else promoted the same record or the
        // peer re-announced itself meanwhile.
        match self.known.get(id) {
            Some(current) if current.same_announcement(&record) => Ok(current.trust_level),
            _ => Err(VerificationError::Superseded(*id)),
        }
    }

    fn security_event(&self, record: &PeerRecord) -> VerificationError {
        let id = record.id();
        let err = VerificationError::CertificateMismatch(id);
        self.stats.record_failure(&err);
        self.known.flag(&id);
        warn!(peer = %id, address = %record.address(), "certificate mismatch, peer flagged");
        err
    }

    /// Stage 3: check bonded stake against the policy minimum.
    pub async fn verify_stake(&self, id: &PeerId) -> Result<TrustLevel, VerificationError> {
        let ledger = self.ledger.as_ref().ok_or(VerificationError::NoLedger)?;
        let record = self.known.get(id).ok_or(VerificationError::UnknownPeer(*id))?;
        if record.flagged {
            return Err(VerificationError::Flagged(*id));
        }
        if record.trust_level >= TrustLevel::StakeVerified {
            return Ok(record.trust_level);
        }
        if record.trust_level < TrustLevel::NetworkVerified {
            return Err(VerificationError::Prerequisite {
                peer: *id,
                actual: record.trust_level,
                required: TrustLevel::NetworkVerified,
            });
        }
        if let Some(rejected_at) = record.stake_rejected_at {
            if rejected_at.elapsed() < self.stake_recheck_ttl {
                let stake = self.rejected_stake.lock().get(id).copied().unwrap_or_default();
                return Err(VerificationError::InsufficientStake {
                    peer: *id,
                    stake,
                    required: self.min_stake,
                });
            }
        }

        VerificationStats::bump(&self.stats.stake_verifications);
        let stake = match tokio::time::timeout(self.stake_timeout, ledger.stake_of(id)).await {
            Ok(Ok(stake)) => stake,
            Ok(Err(LedgerError::ChainUnavailable(reason))) => {
                let err = VerificationError::ChainUnavailable(reason);
                self.stats.record_failure(&err);
                return Err(err);
            }
            Err(_) => {
                let err = VerificationError::ChainUnavailable(format!(
                    "no answer within {:?}",
                    self.stake_timeout
                ));
                self.stats.record_failure(&err);
                return Err(err);
            }
        };

        if stake < self.min_stake {
            self.known.mark_stake_rejected(id, Instant::now());
            self.rejected_stake.lock().insert(*id, stake);
            let err = VerificationError::InsufficientStake {
                peer: *id,
                stake,
                required: self.min_stake,
            };
            self.stats.record_failure(&err);
            debug!(peer = %id, stake, required = self.min_stake, "insufficient stake");
            return Err(err);
        }

        self.rejected_stake.lock().remove(id);
        if self
            .known
            .promote_verified(&record, TrustLevel::StakeVerified, None)
        {
            debug!(peer = %id, stake, "stake verified");
            return Ok(TrustLevel::StakeVerified);
        }
        match self.known.get(id) {
            Some(current) if current.same_announcement(&record) => Ok(current.trust_level),
            _ => Err(VerificationError::Superseded(*id)),
        }
    }
}

impl std::fmt::Debug for VerificationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationPipeline")
            .field("federated", &self.is_federated())
            .field("min_stake", &self.min_stake)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MemoryCertificateStore;
    use crate::testing::{signed_record, FakeLedger, FakeNetwork};
    use fleet_metadata::NodeIdentity;

    struct Fixture {
        known: Arc<KnownNodes>,
        network: Arc<FakeNetwork>,
        ledger: Arc<FakeLedger>,
        certificates: Arc<MemoryCertificateStore>,
        pipeline: VerificationPipeline,
    }

    fn fixture(config: LearningConfig) -> Fixture {
        let known = Arc::new(KnownNodes::new());
        let network = Arc::new(FakeNetwork::new());
        let ledger = Arc::new(FakeLedger::new());
        let certificates = Arc::new(MemoryCertificateStore::new());
        let pipeline = VerificationPipeline::new(
            Arc::clone(&known),
            network.clone(),
            certificates.clone(),
            &config,
        )
        .with_ledger(ledger.clone());
        Fixture {
            known,
            network,
            ledger,
            certificates,
            pipeline,
        }
    }

    fn admitted(f: &Fixture, seed: u8) -> PeerId {
        let record = f.pipeline.admit(signed_record(seed, 1)).unwrap();
        let id = record.id();
        f.known.merge(record);
        id
    }

    #[test]
    fn admit_accepts_valid_and_rejects_forged() {
        let f = fixture(LearningConfig::fast());
        let record = f.pipeline.admit(signed_record(1, 1)).unwrap();
        assert_eq!(record.trust_level, TrustLevel::MetadataValid);

        let mut forged = signed_record(2, 1).metadata().clone();
        forged.signed_at += 1;
        let err = f.pipeline.admit(PeerRecord::new(forged)).unwrap_err();
        assert!(matches!(err, VerificationError::InvalidSignature(_)));

        let counts = f.pipeline.stats().snapshot();
        assert_eq!(counts.metadata_validations, 2);
        assert_eq!(counts.invalid_metadata, 1);
    }

    #[test]
    fn validate_metadata_is_idempotent() {
        let f = fixture(LearningConfig::fast());
        let record = signed_record(3, 1);
        let id = record.id();
        f.known.merge(record);

        assert_eq!(f.pipeline.validate_metadata(&id), Ok(TrustLevel::MetadataValid));
        assert_eq!(f.pipeline.validate_metadata(&id), Ok(TrustLevel::MetadataValid));
        assert_eq!(f.pipeline.stats().snapshot().metadata_validations, 1);
    }

    #[test]
    fn validate_metadata_evicts_forgeries() {
        let f = fixture(LearningConfig::fast());
        let mallory = NodeIdentity::from_seed([9u8; 32]);
        let mut metadata = signed_record(4, 1).metadata().clone();
        metadata.id = mallory.peer_id();
        let id = metadata.id;
        f.known.merge(PeerRecord::new(metadata));

        assert!(f.pipeline.validate_metadata(&id).is_err());
        assert!(!f.known.contains(&id));
    }

    #[tokio::test]
    async fn network_verification_stores_certificate_and_promotes() {
        let f = fixture(LearningConfig::fast());
        let id = admitted(&f, 5);

        assert_eq!(f.pipeline.verify_network(&id).await, Ok(TrustLevel::NetworkVerified));
        let record = f.known.get(&id).unwrap();
        assert_eq!(record.certificate_ref, Some(record.certificate().fingerprint()));
        assert_eq!(f.certificates.get(&id).unwrap(), *record.certificate());

        // Already verified: no second challenge.
        assert_eq!(f.pipeline.verify_network(&id).await, Ok(TrustLevel::NetworkVerified));
        assert_eq!(f.network.calls(), 1);
        assert_eq!(f.pipeline.stats().snapshot().network_verifications, 1);
    }

    #[tokio::test]
    async fn unreachable_peer_stays_retryable() {
        let f = fixture(LearningConfig::fast());
        let id = admitted(&f, 6);
        f.network.set_unreachable(id);

        let err = f.pipeline.verify_network(&id).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.known.get(&id).unwrap().trust_level, TrustLevel::MetadataValid);

        f.network.set_reachable(id);
        assert_eq!(f.pipeline.verify_network(&id).await, Ok(TrustLevel::NetworkVerified));
    }

    #[tokio::test]
    async fn certificate_mismatch_flags_peer_for_good() {
        let f = fixture(LearningConfig::fast());
        let id = admitted(&f, 7);
        f.network.set_impostor(id);

        assert_eq!(
            f.pipeline.verify_network(&id).await,
            Err(VerificationError::CertificateMismatch(id))
        );
        assert!(f.known.get(&id).unwrap().flagged);
        assert_eq!(
            f.pipeline.verify_network(&id).await,
            Err(VerificationError::Flagged(id))
        );
        assert_eq!(f.network.calls(), 1);
        assert!(f.certificates.is_empty());
    }

    #[tokio::test]
    async fn flag_survives_newer_announcement() {
        let f = fixture(LearningConfig::fast());
        let id = admitted(&f, 7);
        f.network.set_impostor(id);
        assert_eq!(
            f.pipeline.verify_network(&id).await,
            Err(VerificationError::CertificateMismatch(id))
        );

        // Re-announcing cannot wash the flag out.
        assert_eq!(
            f.known.merge(signed_record(7, 2)),
            crate::registry::MergeOutcome::Updated
        );
        let record = f.known.get(&id).unwrap();
        assert!(record.flagged);
        assert_eq!(record.signed_at(), 2);
        assert_eq!(record.trust_level, TrustLevel::Unvalidated);

        assert_eq!(
            f.pipeline.verify_network(&id).await,
            Err(VerificationError::Flagged(id))
        );
        assert_eq!(f.network.calls(), 1);
    }

    #[tokio::test]
    async fn slow_endpoint_times_out_as_unreachable() {
        let f = fixture(LearningConfig::fast().with_network_timeout(Duration::from_millis(20)));
        let id = admitted(&f, 8);
        f.network.set_delay(Duration::from_millis(500));

        let err = f.pipeline.verify_network(&id).await.unwrap_err();
        assert!(matches!(err, VerificationError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn stake_requires_network_verification_first() {
        let f = fixture(LearningConfig::fast());
        let id = admitted(&f, 10);
        assert!(matches!(
            f.pipeline.verify_stake(&id).await,
            Err(VerificationError::Prerequisite { .. })
        ));
        assert_eq!(f.ledger.calls(), 0);
    }

    #[tokio::test]
    async fn stake_verification_promotes_and_caches_rejections() {
        let f = fixture(LearningConfig::fast().with_min_stake(100));
        let rich = admitted(&f, 11);
        let poor = admitted(&f, 12);
        f.pipeline.verify_network(&rich).await.unwrap();
        f.pipeline.verify_network(&poor).await.unwrap();
        f.ledger.set_stake(rich, 150);
        f.ledger.set_stake(poor, 10);

        assert_eq!(f.pipeline.verify_stake(&rich).await, Ok(TrustLevel::StakeVerified));
        let err = f.pipeline.verify_stake(&poor).await.unwrap_err();
        assert_eq!(
            err,
            VerificationError::InsufficientStake {
                peer: poor,
                stake: 10,
                required: 100
            }
        );
        assert!(!err.is_retryable());

        // The verdict holds until the recheck TTL elapses.
        f.ledger.set_stake(poor, 500);
        assert!(f.pipeline.verify_stake(&poor).await.is_err());
        assert_eq!(f.ledger.calls(), 2);
    }

    #[tokio::test]
    async fn stake_rejection_expires_after_ttl() {
        let f = fixture(
            LearningConfig::fast()
                .with_min_stake(100)
                .with_stake_recheck_ttl(Duration::from_millis(10)),
        );
        let id = admitted(&f, 13);
        f.pipeline.verify_network(&id).await.unwrap();
        f.ledger.set_stake(id, 1);
        assert!(f.pipeline.verify_stake(&id).await.is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        f.ledger.set_stake(id, 100);
        assert_eq!(f.pipeline.verify_stake(&id).await, Ok(TrustLevel::StakeVerified));
    }

    #[tokio::test]
    async fn forget_drops_cached_stake_rejection() {
        let f = fixture(LearningConfig::fast().with_min_stake(100));
        let id = admitted(&f, 15);
        f.pipeline.verify_network(&id).await.unwrap();
        f.ledger.set_stake(id, 1);
        assert!(f.pipeline.verify_stake(&id).await.is_err());
        assert!(f.pipeline.rejected_stake.lock().contains_key(&id));

        f.known.evict(&id);
        f.pipeline.forget(&id);
        assert!(f.pipeline.rejected_stake.lock().is_empty());
    }

    #[tokio::test]
    async fn chain_outage_is_retryable() {
        let f = fixture(LearningConfig::fast());
        let id = admitted(&f, 14);
        f.pipeline.verify_network(&id).await.unwrap();
        f.ledger.set_unavailable(true);

        let err = f.pipeline.verify_stake(&id).await.unwrap_err();
        assert!(matches!(err, VerificationError::ChainUnavailable(_)));
        assert!(err.is_retryable());
        assert_eq!(f.known.get(&id).unwrap().trust_level, TrustLevel::NetworkVerified);
    }

    #[tokio::test]
    async fn federated_pipeline_skips_stake() {
        let known = Arc::new(KnownNodes::new());
        let pipeline = VerificationPipeline::new(
            Arc::clone(&known),
            Arc::new(FakeNetwork::new()),
            Arc::new(MemoryCertificateStore::new()),
            &LearningConfig::fast(),
        );
        assert!(pipeline.is_federated());
        let id = signed_record(15, 1).id();
        assert_eq!(pipeline.verify_stake(&id).await, Err(VerificationError::NoLedger));
    }

    #[tokio::test]
    async fn replaced_identity_is_not_promoted() {
        let f = fixture(LearningConfig::fast());
        let id = admitted(&f, 16);
        f.network.set_delay(Duration::from_millis(50));

        let verify = f.pipeline.verify_network(&id);
        let replace = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            f.known.merge(signed_record(16, 2));
        };
        let (result, ()) = tokio::join!(verify, replace);

        assert_eq!(result, Err(VerificationError::Superseded(id)));
        assert_eq!(f.known.get(&id).unwrap().trust_level, TrustLevel::Unvalidated);
    }
}
