//! Fleet discovery scenarios.
//!
//! Large fleets with fake collaborators, checking that learning stays lazy
//! and fast:
//!
//! - One verified seed teaches 5000 peers; finding 8 of them must not cost
//!   any network verification or materialization beyond the seed's.
//! - A teacher mixing 7 real records into 4992 garbage blobs must not crash
//!   the loop, and exactly the real records must land.

use std::time::{Duration, Instant};

use fleet_metadata::{codec, PeerId, TrustLevel};

use crate::config::LearningConfig;
use crate::learner::{LearnMode, LoopState};
use crate::registry::MergeOutcome;
use crate::testing::{bulk_blobs, malformed_blobs, signed_record, Harness};

const FLEET_SIZE: u32 = 5000;

#[tokio::test]
async fn discovering_eight_of_five_thousand_stays_lazy() {
    let h = Harness::permissive(LearningConfig::fast().abort_on_learning_error(1));
    let seed = signed_record(1, 1);
    let seed_id = seed.id();
    h.gossip.teach(seed_id, bulk_blobs(FLEET_SIZE));

    assert_eq!(h.learner.bootstrap(vec![seed]).await, 1);
    assert_eq!(h.learner.pipeline().stats().snapshot().network_verifications, 1);

    let started = Instant::now();
    let met = h
        .learner
        .block_until_number_of_known_nodes_is(8, Duration::from_secs(60), LearnMode::OnThisTask)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(met);
    assert!(h.known.len() >= 8);
    assert!(elapsed < Duration::from_secs(8), "took {elapsed:?}");

    let counts = h.learner.pipeline().stats().snapshot();
    // Only the seed was ever verified; waiting inline costs nothing more.
    assert_eq!(counts.network_verifications, 1, "{counts:?}");
    assert_eq!(counts.materialized, 1, "{counts:?}");
    assert_eq!(h.known.get(&seed_id).unwrap().trust_level, TrustLevel::NetworkVerified);
    assert_eq!(h.gossip.calls(), 1);
}

#[tokio::test]
async fn whole_fleet_is_absorbed_across_cycles() {
    let h = Harness::permissive(LearningConfig::fast().with_verification_sample(0));
    let seed = signed_record(1, 1);
    h.gossip.teach(seed.id(), bulk_blobs(FLEET_SIZE));
    h.learner.bootstrap(vec![seed]).await;

    let everyone = FLEET_SIZE as usize + 1;
    let met = h
        .learner
        .block_until_number_of_known_nodes_is(everyone, Duration::from_secs(30), LearnMode::OnThisTask)
        .await
        .unwrap();
    assert!(met);
    assert_eq!(h.known.len(), everyone);
    assert_eq!(h.network.calls(), 1);
}

#[tokio::test]
async fn malformed_flood_does_not_hide_real_peers() {
    let h = Harness::new(LearningConfig::fast());
    let seed = signed_record(1, 1);
    let seed_id = seed.id();

    // Real records last, behind every malformed blob.
    let mut lesson = malformed_blobs(4992);
    let students: Vec<PeerId> = (2..=8)
        .map(|s| {
            let record = signed_record(s, 1);
            lesson.push(codec::encode(&record));
            record.id()
        })
        .collect();
    h.gossip.teach(seed_id, lesson);

    h.learner.bootstrap(vec![seed]).await;
    let before = h.known.checksum();

    let met = h
        .learner
        .block_until_specific_nodes_are_known(&students, Duration::from_secs(30), LearnMode::OnThisTask)
        .await
        .unwrap();

    assert!(met);
    assert_eq!(h.known.len(), 8);
    assert_ne!(h.known.checksum(), before);
    assert!(h.learner.status().decode_failures >= 4992);
    assert_ne!(h.learner.state(), LoopState::Stopped);
}

#[tokio::test]
async fn merging_the_same_gossip_twice_is_idempotent() {
    let h = Harness::new(LearningConfig::fast().with_verification_sample(0));
    let record = signed_record(2, 1);
    let bytes = codec::encode(&record);

    let first = h.learner.pipeline().admit(codec::decode(&bytes).unwrap()).unwrap();
    assert_eq!(h.known.merge(first), MergeOutcome::Inserted);
    let state = h.known.state();

    let second = h.learner.pipeline().admit(codec::decode(&bytes).unwrap()).unwrap();
    assert_eq!(h.known.merge(second), MergeOutcome::Unchanged);
    assert_eq!(h.known.state(), state);
}

#[tokio::test]
async fn trust_never_decreases_without_replacement() {
    let h = Harness::new(LearningConfig::fast());
    let seed = signed_record(1, 1);
    let id = seed.id();
    h.gossip.teach(id, vec![codec::encode(&signed_record(1, 1))]);
    h.learner.bootstrap(vec![seed]).await;
    h.ledger.set_stake(id, 10);
    h.learner.pipeline().verify_stake(&id).await.unwrap();

    let mut levels = vec![h.known.get(&id).unwrap().trust_level];
    // Re-gossip of the same announcement, demotion attempts, older records.
    h.learner.learn_once().await.unwrap();
    levels.push(h.known.get(&id).unwrap().trust_level);
    h.known.promote(&id, TrustLevel::MetadataValid);
    levels.push(h.known.get(&id).unwrap().trust_level);
    h.known.merge(signed_record(1, 0));
    levels.push(h.known.get(&id).unwrap().trust_level);
    h.learner.pipeline().verify_network(&id).await.unwrap();
    levels.push(h.known.get(&id).unwrap().trust_level);

    assert!(levels.windows(2).all(|w| w[0] <= w[1]), "{levels:?}");
    assert_eq!(levels.last(), Some(&TrustLevel::StakeVerified));

    // Only a newer self-signature starts over.
    h.known.merge(signed_record(1, 2));
    assert_eq!(h.known.get(&id).unwrap().trust_level, TrustLevel::Unvalidated);
}

#[tokio::test]
async fn require_verified_stays_exact_in_a_large_fleet() {
    let h = Harness::permissive(LearningConfig::fast().with_verification_sample(0));
    let seed = signed_record(1, 1);
    h.gossip.teach(seed.id(), bulk_blobs(1000));
    h.learner.bootstrap(vec![seed]).await;
    h.learner
        .block_until_number_of_known_nodes_is(200, Duration::from_secs(10), LearnMode::OnThisTask)
        .await
        .unwrap();
    let before = h.network.calls();

    let verified = h.learner.require_verified(6, Duration::from_secs(10)).await.unwrap();
    assert_eq!(verified, 6);
    // The seed already counts toward six.
    assert_eq!(h.network.calls() - before, 5);
}
