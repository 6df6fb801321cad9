//! Known-nodes registry.
//!
//! The single authoritative map from [`PeerId`] to [`PeerRecord`], kept in
//! identifier order so the fleet checksum is a straight hash over the keys.
//!
//! # Concurrency
//!
//! All mutation goes through a `parking_lot::RwLock` write guard and is
//! applied completely before the guard drops; readers copy out under the read
//! guard, so a snapshot never shows half a merge. After every effective
//! mutation the new [`FleetState`] is published on a `watch` channel, which is
//! what blocking waiters sleep on.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use fleet_metadata::{CertificateRef, PeerId, PeerRecord, TrustLevel};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, trace};

/// BLAKE3 digest over the sorted identifier set.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FleetChecksum(pub [u8; 32]);

impl FleetChecksum {
    /// Hash identifiers in the order given (callers pass them sorted).
    pub fn of<'a>(ids: impl IntoIterator<Item = &'a PeerId>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for id in ids {
            hasher.update(id.as_bytes());
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Checksum of an empty fleet.
    pub fn empty() -> Self {
        Self::of(std::iter::empty())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl std::fmt::Display for FleetChecksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}...", &self.to_hex()[..8])
    }
}

impl std::fmt::Debug for FleetChecksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FleetChecksum({})", &self.to_hex()[..16])
    }
}

impl Serialize for FleetChecksum {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// What observers see after each mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetState {
    pub checksum: FleetChecksum,
    pub population: usize,
    /// Bumped on every effective mutation.
    pub version: u64,
}

/// Result of merging one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// A strictly newer self-signature replaced the stored record.
    Updated,
    Unchanged,
}

/// Result of merging a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Identifiers whose record was replaced and has to be re-verified.
    pub replaced: Vec<PeerId>,
}

impl MergeSummary {
    fn record(&mut self, id: PeerId, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Updated => {
                self.updated += 1;
                self.replaced.push(id);
            }
            MergeOutcome::Unchanged => self.unchanged += 1,
        }
    }

    /// Whether the batch changed the registry.
    pub fn changed(&self) -> bool {
        self.inserted + self.updated > 0
    }
}

/// Peer counts by trust level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub known: usize,
    pub unvalidated: usize,
    pub metadata_valid: usize,
    pub network_verified: usize,
    pub stake_verified: usize,
    pub flagged: usize,
}

#[derive(Debug)]
struct Fleet {
    nodes: BTreeMap<PeerId, PeerRecord>,
    checksum: FleetChecksum,
    version: u64,
}

impl Fleet {
    fn state(&self) -> FleetState {
        FleetState {
            checksum: self.checksum,
            population: self.nodes.len(),
            version: self.version,
        }
    }

    fn merge(&mut self, candidate: PeerRecord) -> MergeOutcome {
        match self.nodes.entry(candidate.id()) {
            Entry::Vacant(slot) => {
                slot.insert(candidate);
                MergeOutcome::Inserted
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                if candidate.is_newer_than(existing) {
                    // Everything proved about the old record is void; an impostor stays flagged.
                    let flagged = existing.flagged;
                    *existing = candidate.reset();
                    existing.flagged = flagged;
                    MergeOutcome::Updated
                } else {
                    if candidate.same_announcement(existing) {
                        existing.last_seen = Instant::now();
                    }
                    MergeOutcome::Unchanged
                }
            }
        }
    }
}

/// The known-nodes registry.
#[derive(Debug)]
pub struct KnownNodes {
    fleet: RwLock<Fleet>,
    state_tx: watch::Sender<FleetState>,
}

impl Default for KnownNodes {
    fn default() -> Self {
        Self::new()
    }
}

impl KnownNodes {
    /// Create an empty registry.
    pub fn new() -> Self {
        let fleet = Fleet {
            nodes: BTreeMap::new(),
            checksum: FleetChecksum::empty(),
            version: 0,
        };
        let (state_tx, _) = watch::channel(fleet.state());
        Self {
            fleet: RwLock::new(fleet),
            state_tx,
        }
    }

    /// Recompute the checksum, bump the version and wake observers.
    fn publish(&self, fleet: &mut Fleet) {
        fleet.checksum = FleetChecksum::of(fleet.nodes.keys());
        fleet.version += 1;
        self.state_tx.send_replace(fleet.state());
    }

    /// Merge one candidate.
    ///
    /// Inserts when absent. When present, the stored record is replaced only
    /// by a strictly newer self-signature, and the replacement starts over at
    /// `Unvalidated`. Merging never raises trust on an existing record.
    pub fn merge(&self, candidate: PeerRecord) -> MergeOutcome {
        let id = candidate.id();
        let mut fleet = self.fleet.write();
        let outcome = fleet.merge(candidate);
        if outcome != MergeOutcome::Unchanged {
            self.publish(&mut fleet);
        }
        trace!(peer = %id, ?outcome, "merged candidate");
        outcome
    }

    /// Merge a batch with one checksum recomputation and one notification.
    pub fn merge_all(&self, candidates: impl IntoIterator<Item = PeerRecord>) -> MergeSummary {
        let mut summary = MergeSummary::default();
        let mut fleet = self.fleet.write();
        for candidate in candidates {
            let id = candidate.id();
            let outcome = fleet.merge(candidate);
            summary.record(id, outcome);
        }
        if summary.changed() {
            self.publish(&mut fleet);
        }
        summary
    }

    /// Raise `id` to `level` if that is strictly higher than its current level.
    pub fn promote(&self, id: &PeerId, level: TrustLevel) -> bool {
        let mut fleet = self.fleet.write();
        let promoted = match fleet.nodes.get_mut(id) {
            Some(record) if level > record.trust_level => {
                record.trust_level = level;
                record.last_seen = Instant::now();
                true
            }
            _ => false,
        };
        if promoted {
            self.publish(&mut fleet);
            debug!(peer = %id, %level, "promoted");
        }
        promoted
    }

    /// Promote only if the stored record is still the announcement that was
    /// verified. Guards against promoting an identity that was replaced while
    /// an interactive check was in flight.
    pub fn promote_verified(
        &self,
        verified: &PeerRecord,
        level: TrustLevel,
        certificate_ref: Option<CertificateRef>,
    ) -> bool {
        let id = verified.id();
        let mut fleet = self.fleet.write();
        let promoted = match fleet.nodes.get_mut(&id) {
            Some(record) if record.same_announcement(verified) && level > record.trust_level => {
                record.trust_level = level;
                record.last_seen = Instant::now();
                if certificate_ref.is_some() {
                    record.certificate_ref = certificate_ref;
                }
                true
            }
            _ => false,
        };
        if promoted {
            self.publish(&mut fleet);
            debug!(peer = %id, %level, "promoted after verification");
        }
        promoted
    }

    /// Consistent point-in-time copy, ordered by identifier.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.fleet.read().nodes.values().cloned().collect()
    }

    /// Records matching `predicate`, at most `limit` of them, in identifier order.
    pub fn select(&self, predicate: impl Fn(&PeerRecord) -> bool, limit: usize) -> Vec<PeerRecord> {
        self.fleet
            .read()
            .nodes
            .values()
            .filter(|record| predicate(record))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&PeerRecord) -> bool) -> usize {
        self.fleet.read().nodes.values().filter(|r| predicate(r)).count()
    }

    pub fn checksum(&self) -> FleetChecksum {
        self.fleet.read().checksum
    }

    pub fn state(&self) -> FleetState {
        self.fleet.read().state()
    }

    /// Receiver that wakes after every effective mutation.
    pub fn subscribe(&self) -> watch::Receiver<FleetState> {
        self.state_tx.subscribe()
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerRecord> {
        self.fleet.read().nodes.get(id).cloned()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.fleet.read().nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.fleet.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fleet.read().nodes.is_empty()
    }

    /// Refresh `last_seen` without changing trust.
    pub fn touch(&self, id: &PeerId) {
        if let Some(record) = self.fleet.write().nodes.get_mut(id) {
            record.last_seen = Instant::now();
        }
    }

    /// Record a security event against `id`.
    pub fn flag(&self, id: &PeerId) -> bool {
        let mut fleet = self.fleet.write();
        let flagged = match fleet.nodes.get_mut(id) {
            Some(record) if !record.flagged => {
                record.flagged = true;
                true
            }
            _ => false,
        };
        if flagged {
            self.publish(&mut fleet);
        }
        flagged
    }

    /// Remember an insufficient-stake verdict.
    pub fn mark_stake_rejected(&self, id: &PeerId, at: Instant) {
        if let Some(record) = self.fleet.write().nodes.get_mut(id) {
            record.stake_rejected_at = Some(at);
        }
    }

    /// Remove `id` entirely.
    pub fn evict(&self, id: &PeerId) -> Option<PeerRecord> {
        let mut fleet = self.fleet.write();
        let evicted = fleet.nodes.remove(id);
        if evicted.is_some() {
            self.publish(&mut fleet);
            debug!(peer = %id, "evicted");
        }
        evicted
    }

    /// Remove every peer not seen within `max_age`.
    pub fn evict_stale(&self, max_age: Duration) -> Vec<PeerId> {
        let now = Instant::now();
        let mut fleet = self.fleet.write();
        let expired: Vec<PeerId> = fleet
            .nodes
            .values()
            .filter(|record| now.duration_since(record.last_seen) > max_age)
            .map(PeerRecord::id)
            .collect();

        for id in &expired {
            fleet.nodes.remove(id);
        }
        if !expired.is_empty() {
            self.publish(&mut fleet);
            debug!(count = expired.len(), "evicted stale peers");
        }
        expired
    }

    pub fn stats(&self) -> RegistryStats {
        let fleet = self.fleet.read();
        let mut stats = RegistryStats {
            known: fleet.nodes.len(),
            ..Default::default()
        };
        for record in fleet.nodes.values() {
            match record.trust_level {
                TrustLevel::Unvalidated => stats.unvalidated += 1,
                TrustLevel::MetadataValid => stats.metadata_valid += 1,
                TrustLevel::NetworkVerified => stats.network_verified += 1,
                TrustLevel::StakeVerified => stats.stake_verified += 1,
            }
            if record.flagged {
                stats.flagged += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::signed_record;
    use fleet_metadata::{codec, NetworkAddress, NodeIdentity};

    #[test]
    fn empty_registry_has_stable_checksum() {
        assert_eq!(KnownNodes::new().checksum(), KnownNodes::new().checksum());
        assert_eq!(KnownNodes::new().state().population, 0);
    }

    #[test]
    fn merging_twice_is_idempotent() {
        let known = KnownNodes::new();
        let bytes = codec::encode(&signed_record(1, 100));

        assert_eq!(known.merge(codec::decode(&bytes).unwrap()), MergeOutcome::Inserted);
        let after_first = known.state();

        assert_eq!(known.merge(codec::decode(&bytes).unwrap()), MergeOutcome::Unchanged);
        assert_eq!(known.state(), after_first);
        assert_eq!(known.len(), 1);
    }

    #[test]
    fn checksum_tracks_membership_not_insertion_order() {
        let a = KnownNodes::new();
        let b = KnownNodes::new();
        let before = a.checksum();

        a.merge(signed_record(1, 1));
        a.merge(signed_record(2, 1));
        b.merge(signed_record(2, 1));
        b.merge(signed_record(1, 1));

        assert_ne!(a.checksum(), before);
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn newer_signature_replaces_and_resets_trust() {
        let known = KnownNodes::new();
        let old = signed_record(1, 100).with_trust(TrustLevel::MetadataValid);
        let id = old.id();
        known.merge(old);
        assert!(known.promote(&id, TrustLevel::NetworkVerified));

        let identity = NodeIdentity::from_seed([1u8; 32]);
        let moved = NetworkAddress::new("10.9.9.9", 9999);
        let newer = identity.sign_metadata(moved.clone(), identity.self_issued_certificate(&moved), 200);

        assert_eq!(known.merge(newer), MergeOutcome::Updated);
        let stored = known.get(&id).unwrap();
        assert_eq!(stored.address(), &moved);
        assert_eq!(stored.trust_level, TrustLevel::Unvalidated);
    }

    #[test]
    fn older_or_equal_signature_is_ignored() {
        let known = KnownNodes::new();
        known.merge(signed_record(1, 200).with_trust(TrustLevel::MetadataValid));
        let id = signed_record(1, 200).id();

        let identity = NodeIdentity::from_seed([1u8; 32]);
        let elsewhere = NetworkAddress::new("10.0.0.2", 1);
        let same_time = identity.sign_metadata(elsewhere.clone(), identity.self_issued_certificate(&elsewhere), 200);

        assert_eq!(known.merge(signed_record(1, 100)), MergeOutcome::Unchanged);
        assert_eq!(known.merge(same_time), MergeOutcome::Unchanged);
        assert_eq!(known.get(&id).unwrap().trust_level, TrustLevel::MetadataValid);
    }

    #[test]
    fn promote_is_compare_and_set() {
        let known = KnownNodes::new();
        let record = signed_record(3, 1);
        let id = record.id();
        known.merge(record);

        assert!(known.promote(&id, TrustLevel::NetworkVerified));
        assert!(!known.promote(&id, TrustLevel::MetadataValid));
        assert!(!known.promote(&id, TrustLevel::NetworkVerified));
        assert_eq!(known.get(&id).unwrap().trust_level, TrustLevel::NetworkVerified);
        assert!(!known.promote(&PeerId::from_bytes([0u8; 32]), TrustLevel::StakeVerified));
    }

    #[test]
    fn promote_verified_refuses_replaced_identity() {
        let known = KnownNodes::new();
        let old = signed_record(4, 100);
        known.merge(old.clone());
        known.merge(signed_record(4, 200));

        let cert = old.certificate().fingerprint();
        assert!(!known.promote_verified(&old, TrustLevel::NetworkVerified, Some(cert)));
        assert_eq!(known.get(&old.id()).unwrap().trust_level, TrustLevel::Unvalidated);
    }

    #[test]
    fn promotion_keeps_checksum_and_bumps_version() {
        let known = KnownNodes::new();
        let record = signed_record(5, 1);
        let id = record.id();
        known.merge(record);
        let before = known.state();

        known.promote(&id, TrustLevel::MetadataValid);
        let after = known.state();
        assert_eq!(after.checksum, before.checksum);
        assert!(after.version > before.version);
    }

    #[test]
    fn merge_all_notifies_once() {
        let known = KnownNodes::new();
        let rx = known.subscribe();
        let summary = known.merge_all((0..10).map(|i| signed_record(i, 1)));

        assert_eq!(summary.inserted, 10);
        assert!(summary.changed());
        assert_eq!(rx.borrow().version, 1);
        assert_eq!(rx.borrow().population, 10);
    }

    #[test]
    fn evict_and_stale_eviction() {
        let known = KnownNodes::new();
        let record = signed_record(6, 1);
        let id = record.id();
        known.merge(record);
        known.merge(signed_record(7, 1));
        let before = known.checksum();

        assert!(known.evict(&id).is_some());
        assert!(known.evict(&id).is_none());
        assert_ne!(known.checksum(), before);

        std::thread::sleep(Duration::from_millis(20));
        let expired = known.evict_stale(Duration::from_millis(5));
        assert_eq!(expired.len(), 1);
        assert!(known.is_empty());
    }

    #[test]
    fn newer_announcement_keeps_flag_but_drops_trust() {
        let known = KnownNodes::new();
        let id = signed_record(4, 1).id();
        known.merge(signed_record(4, 1).with_trust(TrustLevel::NetworkVerified));
        assert!(known.flag(&id));

        assert_eq!(known.merge(signed_record(4, 5)), MergeOutcome::Updated);
        let record = known.get(&id).unwrap();
        assert!(record.flagged);
        assert_eq!(record.trust_level, TrustLevel::Unvalidated);
        assert_eq!(record.signed_at(), 5);
    }

    #[test]
    fn stats_count_levels_and_flags() {
        let known = KnownNodes::new();
        known.merge(signed_record(1, 1));
        known.merge(signed_record(2, 1).with_trust(TrustLevel::MetadataValid));
        known.merge(signed_record(3, 1).with_trust(TrustLevel::NetworkVerified));
        known.flag(&signed_record(3, 1).id());

        let stats = known.stats();
        assert_eq!(stats.known, 3);
        assert_eq!(stats.unvalidated, 1);
        assert_eq!(stats.metadata_valid, 1);
        assert_eq!(stats.network_verified, 1);
        assert_eq!(stats.flagged, 1);
        assert_eq!(known.count(|r| r.trust_level >= TrustLevel::MetadataValid), 2);
    }

    #[test]
    fn concurrent_readers_see_whole_batches() {
        use std::sync::Arc;

        let known = Arc::new(KnownNodes::new());
        let reader = {
            let known = Arc::clone(&known);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let len = known.snapshot().len();
                    assert!(len % 10 == 0, "observed partial batch of {len}");
                }
            })
        };
        for batch in 0..20u8 {
            known.merge_all((0..10u8).map(|i| signed_record(batch * 10 + i, 1)));
        }
        reader.join().unwrap();
        assert_eq!(known.len(), 200);
    }

    proptest::proptest! {
        #[test]
        fn merge_order_does_not_matter(
            announcements in proptest::collection::vec((1u8..6, 0u64..4), 0..12)
        ) {
            let records: Vec<PeerRecord> = announcements
                .iter()
                .map(|&(seed, signed_at)| signed_record(seed, signed_at))
                .collect();

            let forward = KnownNodes::new();
            forward.merge_all(records.iter().cloned());
            let backward = KnownNodes::new();
            for record in records.iter().rev() {
                backward.merge(record.clone());
            }

            proptest::prop_assert_eq!(forward.checksum(), backward.checksum());
            for record in forward.snapshot() {
                let other = backward.get(&record.id()).unwrap();
                // The newest self-signature per identifier wins either way.
                proptest::prop_assert_eq!(record.signed_at(), other.signed_at());
            }
        }
    }
}
