//! Teacher rotation with exponential demotion.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use fleet_metadata::PeerId;

#[derive(Debug, Clone, Copy)]
struct Demotion {
    failures: u32,
    until: Instant,
}

/// Chooses which peer to learn from next.
///
/// Eligible teachers are queried least-recently first. A teacher that fails is
/// demoted for a period that doubles with every consecutive failure and is
/// reinstated on its next success. Seeds are the fallback when nothing else
/// is eligible.
#[derive(Debug)]
pub struct TeacherRotation {
    last_queried: HashMap<PeerId, Instant>,
    demotions: HashMap<PeerId, Demotion>,
    seeds: Vec<PeerId>,
    backoff: Duration,
    max_backoff: Duration,
}

impl TeacherRotation {
    pub fn new(backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            last_queried: HashMap::new(),
            demotions: HashMap::new(),
            seeds: Vec::new(),
            backoff,
            max_backoff: max_backoff.max(backoff),
        }
    }

    pub fn add_seed(&mut self, id: PeerId) {
        if !self.seeds.contains(&id) {
            self.seeds.push(id);
        }
    }

    pub fn seeds(&self) -> &[PeerId] {
        &self.seeds
    }

    pub fn is_demoted(&self, id: &PeerId, now: Instant) -> bool {
        self.demotions.get(id).is_some_and(|d| d.until > now)
    }

    /// Identifiers currently demoted.
    pub fn demoted(&self, now: Instant) -> HashSet<PeerId> {
        self.demotions
            .iter()
            .filter(|(_, d)| d.until > now)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Pick the next teacher among `candidates` and mark it queried.
    pub fn next(&mut self, candidates: &[PeerId], now: Instant) -> Option<PeerId> {
        let pick = self
            .least_recent(candidates.iter(), now)
            .or_else(|| self.least_recent(self.seeds.iter(), now))?;
        self.last_queried.insert(pick, now);
        Some(pick)
    }

    fn least_recent<'a>(
        &self,
        ids: impl Iterator<Item = &'a PeerId>,
        now: Instant,
    ) -> Option<PeerId> {
        ids.filter(|id| !self.is_demoted(id, now))
            // Never-queried peers sort first, then ties break on identifier.
            .min_by_key(|id| (self.last_queried.get(*id).copied(), **id))
            .copied()
    }

    /// Demote `id` after a failure. Returns the demotion period.
    pub fn demote(&mut self, id: &PeerId, now: Instant) -> Duration {
        let failures = self.demotions.get(id).map_or(0, |d| d.failures) + 1;
        let factor = 1u32 << (failures - 1).min(16);
        let period = self
            .backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);
        self.demotions.insert(
            *id,
            Demotion {
                failures,
                until: now + period,
            },
        );
        period
    }

    /// Clear the failure history of `id` after a success.
    pub fn reinstate(&mut self, id: &PeerId) {
        self.demotions.remove(id);
    }

    /// Drop everything known about `id`, including seed status.
    pub fn forget(&mut self, id: &PeerId) {
        self.last_queried.remove(id);
        self.demotions.remove(id);
        self.seeds.retain(|seed| seed != id);
    }

    /// Keep only the peers for which `keep` holds.
    pub fn retain(&mut self, mut keep: impl FnMut(&PeerId) -> bool) {
        self.last_queried.retain(|id, _| keep(id));
        self.demotions.retain(|id, _| keep(id));
        self.seeds.retain(|id| keep(id));
    }

    #[cfg(test)]
    pub(crate) fn tracks(&self, id: &PeerId) -> bool {
        self.last_queried.contains_key(id)
            || self.demotions.contains_key(id)
            || self.seeds.contains(id)
    }
}
