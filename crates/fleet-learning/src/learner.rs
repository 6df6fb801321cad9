//! Learning loop scheduler.
//!
//! # State machine
//!
//! ```text
//! Idle --start--> Running <--resume/pause--> Paused
//!                    |                          |
//!                    +----stop / abort----> Stopped
//! ```
//!
//! # One cycle
//!
//! 1. Evict stale peers when a TTL is configured
//! 2. Pick the next teacher and fetch its peer list (skipped while the backlog
//!    still holds a full cycle of work)
//! 3. Decode and admit at most `max_records_per_cycle` blobs, park the rest
//! 4. `merge_all` the admitted candidates
//! 5. Network-verify the configured sample of metadata-valid peers
//!
//! Only step 5 and explicit [`Learner::require`] calls perform interactive
//! verification; gossip alone never does. Cycles run inline by a blocking
//! wait skip step 5, so waiting for peers costs no verifications.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_metadata::{codec, PeerId, PeerRecord, TrustLevel};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::collaborators::GossipTransport;
use crate::config::LearningConfig;
use crate::error::{FetchError, LearningError, Result, VerificationError};
use crate::gossip::GossipFetcher;
use crate::registry::{FleetChecksum, KnownNodes, MergeOutcome, RegistryStats};
use crate::teachers::TeacherRotation;
use crate::verification::{VerificationCounts, VerificationPipeline};

/// Lifecycle of the background loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// How a blocking wait makes progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnMode {
    /// Run learning cycles on the calling task.
    OnThisTask,
    /// Wait for the background loop to change the registry.
    Background,
}

/// Outcome of one learning cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub teacher: Option<PeerId>,
    pub fetch_error: Option<FetchError>,
    /// The teacher's view matched ours.
    pub unchanged: bool,
    pub received: usize,
    pub malformed: usize,
    pub rejected: usize,
    pub inserted: usize,
    pub updated: usize,
    pub verified: usize,
    pub evicted: usize,
    /// Blobs dropped because the backlog was full.
    pub dropped: usize,
    /// Blobs left for later cycles.
    pub backlog: usize,
    pub duration: Duration,
}

impl CycleReport {
    /// Whether another cycle right away could learn more.
    pub fn made_progress(&self) -> bool {
        self.inserted + self.updated + self.verified > 0 || self.backlog > 0
    }
}

/// Snapshot for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub state: LoopState,
    pub known: usize,
    pub verified: usize,
    pub stake_verified: usize,
    pub checksum: FleetChecksum,
    pub version: u64,
    pub cycles: u64,
    pub last_cycle_ms: Option<u64>,
    pub backlog: usize,
    pub decode_failures: u64,
    pub registry: RegistryStats,
    pub verification: VerificationCounts,
}

#[derive(Debug, Default)]
struct LoopCounters {
    cycles: AtomicU64,
    consecutive_failures: AtomicU32,
    decode_failures: AtomicU64,
}

/// Discovers the fleet from teachers and verifies it lazily.
pub struct Learner {
    config: LearningConfig,
    known: Arc<KnownNodes>,
    pipeline: Arc<VerificationPipeline>,
    fetcher: GossipFetcher,
    teachers: Mutex<TeacherRotation>,
    backlog: Mutex<VecDeque<Vec<u8>>>,
    state_tx: watch::Sender<LoopState>,
    /// Serializes cycles between the background task and inline waiters.
    cycle_lock: tokio::sync::Mutex<()>,
    counters: LoopCounters,
    last_cycle: Mutex<Option<Duration>>,
    worker: Mutex<Option<JoinHandle<Result<()>>>>,
    local_id: Option<PeerId>,
}

impl Learner {
    pub fn new(
        config: LearningConfig,
        pipeline: Arc<VerificationPipeline>,
        transport: Arc<dyn GossipTransport>,
    ) -> Self {
        let fetcher = GossipFetcher::new(
            transport,
            Arc::clone(pipeline.certificates()),
            config.fetch_timeout,
        );
        let teachers = TeacherRotation::new(config.teacher_backoff, config.max_teacher_backoff);
        let (state_tx, _) = watch::channel(LoopState::Idle);
        Self {
            known: Arc::clone(pipeline.known()),
            pipeline,
            fetcher,
            teachers: Mutex::new(teachers),
            backlog: Mutex::new(VecDeque::new()),
            state_tx,
            cycle_lock: tokio::sync::Mutex::new(()),
            counters: LoopCounters::default(),
            last_cycle: Mutex::new(None),
            worker: Mutex::new(None),
            local_id: None,
            config,
        }
    }

    /// Ignore our own record when it comes back through gossip.
    #[must_use]
    pub fn with_local_id(mut self, id: PeerId) -> Self {
        self.local_id = Some(id);
        self
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    pub fn known(&self) -> &Arc<KnownNodes> {
        &self.known
    }

    pub fn pipeline(&self) -> &Arc<VerificationPipeline> {
        &self.pipeline
    }

    pub fn state(&self) -> LoopState {
        *self.state_tx.borrow()
    }

    /// Hand the loop a teacher. The record is validated, merged and kept as a
    /// fallback seed.
    pub fn remember(&self, record: PeerRecord) -> Result<MergeOutcome> {
        let id = record.id();
        if self.local_id == Some(id) {
            return Ok(MergeOutcome::Unchanged);
        }
        let admitted = self.pipeline.admit(record)?;
        let outcome = self.known.merge(admitted);
        if outcome == MergeOutcome::Updated {
            self.known.promote(&id, TrustLevel::MetadataValid);
        }
        self.teachers.lock().add_seed(id);
        info!(teacher = %id, ?outcome, "remembered teacher");
        Ok(outcome)
    }

    /// Remember every seed, then network-verify them concurrently.
    ///
    /// Returns how many seeds ended up verified.
    pub async fn bootstrap(&self, seeds: Vec<PeerRecord>) -> usize {
        let mut ids = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let id = seed.id();
            match self.remember(seed) {
                Ok(_) if self.local_id != Some(id) => ids.push(id),
                Ok(_) => {}
                Err(err) => warn!(teacher = %id, error = %err, "discarding seed"),
            }
        }

        let results = join_all(ids.iter().map(|id| self.pipeline.verify_network(id))).await;
        let mut verified = 0;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(level) if level >= TrustLevel::NetworkVerified => verified += 1,
                Ok(_) => {}
                Err(err) => warn!(teacher = %id, error = %err, "seed verification failed"),
            }
        }
        info!(seeds = ids.len(), verified, "bootstrap complete");
        verified
    }

    /// Run one learning cycle.
    pub async fn learn_once(&self) -> Result<CycleReport> {
        self.cycle(true).await
    }

    /// A cycle on behalf of a blocking caller: learn, but verify nothing.
    async fn inline_cycle(&self) -> Result<CycleReport> {
        self.cycle(false).await
    }

    async fn cycle(&self, sample: bool) -> Result<CycleReport> {
        if self.state() == LoopState::Stopped {
            return Err(LearningError::Stopped);
        }
        let _cycle = self.cycle_lock.lock().await;
        let started = Instant::now();
        let mut report = CycleReport::default();

        if let Some(ttl) = self.config.node_ttl {
            let evicted = self.known.evict_stale(ttl);
            for id in &evicted {
                self.forget(id);
            }
            report.evicted = evicted.len();
        }
        // Peers evicted straight from the registry leave rotation state behind.
        self.teachers.lock().retain(|id| self.known.contains(id));

        let pending = self.backlog.lock().len();
        if pending >= self.config.max_records_per_cycle {
            trace!(pending, "backlog holds a full cycle, not fetching");
        } else if let Some(teacher) = self.next_teacher() {
            report.teacher = Some(teacher.id());
            self.learn_from(&teacher, &mut report).await?;
        } else {
            debug!("no eligible teacher");
        }

        self.absorb(&mut report);
        if sample {
            report.verified = self.verify_sample().await;
        }
        report.backlog = self.backlog.lock().len();
        report.duration = started.elapsed();

        *self.last_cycle.lock() = Some(report.duration);
        self.counters.cycles.fetch_add(1, Ordering::Relaxed);
        debug!(
            teacher = ?report.teacher,
            inserted = report.inserted,
            updated = report.updated,
            malformed = report.malformed,
            verified = report.verified,
            backlog = report.backlog,
            known = self.known.len(),
            elapsed_ms = report.duration.as_millis() as u64,
            "learning cycle complete"
        );
        Ok(report)
    }

    fn next_teacher(&self) -> Option<PeerRecord> {
        let candidates: Vec<PeerId> = self
            .known
            .select(
                |r| r.trust_level >= TrustLevel::NetworkVerified && !r.flagged,
                usize::MAX,
            )
            .iter()
            .map(PeerRecord::id)
            .collect();
        let id = self.teachers.lock().next(&candidates, Instant::now())?;
        self.known.get(&id).filter(|r| !r.flagged)
    }

    async fn learn_from(&self, teacher: &PeerRecord, report: &mut CycleReport) -> Result<()> {
        let id = teacher.id();
        match self.fetcher.fetch_peer_list(teacher, self.known.checksum()).await {
            Ok(batch) => {
                self.counters.consecutive_failures.store(0, Ordering::Relaxed);
                self.teachers.lock().reinstate(&id);
                self.known.touch(&id);
                report.unchanged = batch.unchanged;
                report.received = batch.nodes.len();
                report.dropped = self.enqueue(batch.nodes);
                Ok(())
            }
            Err(err) => {
                let backoff = self.teachers.lock().demote(&id, Instant::now());
                let failures = self.counters.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(teacher = %id, failures, ?backoff, error = %err, "learning from teacher failed");

                if self.config.abort_on_learning_error
                    && failures >= self.config.max_consecutive_failures
                {
                    self.state_tx.send_replace(LoopState::Stopped);
                    error!(failures, "aborting learning loop");
                    return Err(LearningError::Aborted { failures, last: err });
                }
                report.fetch_error = Some(err);
                Ok(())
            }
        }
    }

    /// Park blobs for processing. Returns how many old blobs were dropped.
    fn enqueue(&self, blobs: Vec<Vec<u8>>) -> usize {
        let mut backlog = self.backlog.lock();
        backlog.extend(blobs);
        let excess = backlog.len().saturating_sub(self.config.max_backlog);
        backlog.drain(..excess);
        if excess > 0 {
            warn!(dropped = excess, "gossip backlog full, dropped oldest records");
        }
        excess
    }

    /// Decode, admit and merge up to one cycle's worth of parked blobs.
    fn absorb(&self, report: &mut CycleReport) {
        let blobs: Vec<Vec<u8>> = {
            let mut backlog = self.backlog.lock();
            let take = backlog.len().min(self.config.max_records_per_cycle);
            backlog.drain(..take).collect()
        };
        if blobs.is_empty() {
            return;
        }

        let mut candidates = Vec::with_capacity(blobs.len());
        let mut first_error = None;
        for blob in &blobs {
            let record = match codec::decode(blob) {
                Ok(record) => record,
                Err(err) => {
                    report.malformed += 1;
                    first_error.get_or_insert(err);
                    continue;
                }
            };
            let id = record.id();
            if self.local_id == Some(id) {
                continue;
            }
            // Already hold this announcement or a newer one: nothing to validate.
            if let Some(existing) = self.known.get(&id) {
                if !record.is_newer_than(&existing) {
                    if record.same_announcement(&existing) {
                        self.known.touch(&id);
                    }
                    continue;
                }
            }
            match self.pipeline.admit(record) {
                Ok(admitted) => candidates.push(admitted),
                Err(_) => report.rejected += 1,
            }
        }

        if let Some(err) = first_error {
            warn!(count = report.malformed, error = %err, "dropped malformed gossip records");
            self.counters
                .decode_failures
                .fetch_add(report.malformed as u64, Ordering::Relaxed);
        }

        let summary = self.known.merge_all(candidates);
        // Replacements were validated before the merge reset them.
        for id in &summary.replaced {
            self.known.promote(id, TrustLevel::MetadataValid);
        }
        report.inserted += summary.inserted;
        report.updated += summary.updated;
    }

    /// Network-verify up to `verification_sample` metadata-valid peers.
    async fn verify_sample(&self) -> usize {
        let sample = self.config.verification_sample;
        if sample == 0 {
            return 0;
        }
        let demoted = self.teachers.lock().demoted(Instant::now());
        let ids: Vec<PeerId> = self
            .known
            .select(
                |r| {
                    r.trust_level == TrustLevel::MetadataValid
                        && !r.flagged
                        && !demoted.contains(&r.id())
                },
                sample,
            )
            .iter()
            .map(PeerRecord::id)
            .collect();
        if ids.is_empty() {
            return 0;
        }

        let deadline = tokio::time::Instant::now() + self.config.cycle_budget;
        let mut work: FuturesUnordered<_> = ids
            .iter()
            .map(|id| async move { (*id, self.pipeline.verify_network(id).await) })
            .collect();
        let mut unanswered: HashSet<PeerId> = ids.iter().copied().collect();

        let mut verified = 0;
        loop {
            match tokio::time::timeout_at(deadline, work.next()).await {
                Ok(Some((id, result))) => {
                    unanswered.remove(&id);
                    match result {
                        Ok(_) => verified += 1,
                        Err(err) => {
                            // Keep failing peers out of the next samples for a while.
                            self.teachers.lock().demote(&id, Instant::now());
                            debug!(peer = %id, error = %err, "sampled verification failed");
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        budget = ?self.config.cycle_budget,
                        unfinished = unanswered.len(),
                        "verification sample exceeded cycle budget"
                    );
                    let now = Instant::now();
                    let mut teachers = self.teachers.lock();
                    for id in &unanswered {
                        teachers.demote(id, now);
                    }
                    break;
                }
            }
        }
        verified
    }

    /// Remove `id` from the registry and drop every per-peer state the loop
    /// and the pipeline keep for it.
    pub fn evict(&self, id: &PeerId) -> Option<PeerRecord> {
        let evicted = self.known.evict(id);
        self.forget(id);
        evicted
    }

    fn forget(&self, id: &PeerId) {
        self.teachers.lock().forget(id);
        self.pipeline.forget(id);
    }

    /// Ensure at least `k` peers are network-verified.
    ///
    /// Verifies exactly as many peers as are missing, learning more of the
    /// fleet when there are too few candidates. Returns the number of
    /// verified peers, which is below `k` only if `timeout` ran out.
    pub async fn require_verified(&self, k: usize, timeout: Duration) -> Result<usize> {
        self.require(k, TrustLevel::NetworkVerified, timeout).await
    }

    /// Ensure at least `k` peers have reached `level`.
    pub async fn require(&self, k: usize, level: TrustLevel, timeout: Duration) -> Result<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut changes = self.known.subscribe();
        let mut failed: HashSet<PeerId> = HashSet::new();

        loop {
            changes.borrow_and_update();
            let have = self.known.count(|r| r.trust_level >= level && !r.flagged);
            if have >= k {
                return Ok(have);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(have);
            }

            let candidates: Vec<PeerId> = self
                .known
                .select(
                    |r| {
                        r.trust_level >= TrustLevel::MetadataValid
                            && r.trust_level < level
                            && !r.flagged
                            && !failed.contains(&r.id())
                    },
                    k - have,
                )
                .iter()
                .map(PeerRecord::id)
                .collect();

            if !candidates.is_empty() {
                let work = join_all(candidates.iter().map(|id| self.raise(*id, level)));
                let Ok(results) = tokio::time::timeout_at(deadline, work).await else {
                    continue;
                };
                for (id, result) in candidates.iter().zip(results) {
                    if let Err(err) = result {
                        debug!(peer = %id, error = %err, "required verification failed");
                        failed.insert(*id);
                    }
                }
                continue;
            }

            // Nobody left to verify: learn more of the fleet, or wait for it.
            let progressed = match self.state() {
                LoopState::Stopped => false,
                _ => match tokio::time::timeout_at(deadline, self.inline_cycle()).await {
                    Ok(Ok(report)) => report.made_progress(),
                    Ok(Err(LearningError::Stopped)) | Err(_) => false,
                    Ok(Err(err)) => return Err(err),
                },
            };
            if !progressed {
                self.wait_for_change(&mut changes, deadline).await;
            }
        }
    }

    async fn raise(&self, id: PeerId, level: TrustLevel) -> std::result::Result<TrustLevel, VerificationError> {
        let reached = self.pipeline.verify_network(&id).await?;
        if level >= TrustLevel::StakeVerified && reached < TrustLevel::StakeVerified {
            return self.pipeline.verify_stake(&id).await;
        }
        Ok(reached)
    }

    /// Sleep until the registry changes, one interval passes or `deadline`.
    async fn wait_for_change(
        &self,
        changes: &mut watch::Receiver<crate::registry::FleetState>,
        deadline: tokio::time::Instant,
    ) {
        let wake = deadline.min(tokio::time::Instant::now() + self.config.interval);
        let _ = tokio::time::timeout_at(wake, changes.changed()).await;
    }

    /// Wait until `predicate` holds for the registry or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout. Only an aborted loop is an error.
    pub async fn block_until<F>(&self, predicate: F, timeout: Duration, mode: LearnMode) -> Result<bool>
    where
        F: Fn(&KnownNodes) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut changes = self.known.subscribe();

        match mode {
            LearnMode::OnThisTask => {
                let mut cycles = 0;
                loop {
                    changes.borrow_and_update();
                    if predicate(&*self.known) {
                        return Ok(true);
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Ok(false);
                    }
                    if cycles < self.config.max_inline_cycles && self.state() != LoopState::Stopped {
                        cycles += 1;
                        match tokio::time::timeout_at(deadline, self.inline_cycle()).await {
                            Ok(Ok(report)) if report.made_progress() => continue,
                            Ok(Ok(_)) | Ok(Err(LearningError::Stopped)) => {}
                            Ok(Err(err)) => return Err(err),
                            Err(_) => return Ok(predicate(&*self.known)),
                        }
                    }
                    self.wait_for_change(&mut changes, deadline).await;
                }
            }
            LearnMode::Background => loop {
                changes.borrow_and_update();
                if predicate(&*self.known) {
                    return Ok(true);
                }
                match tokio::time::timeout_at(deadline, changes.changed()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        tokio::time::sleep_until(deadline).await;
                        return Ok(predicate(&*self.known));
                    }
                    Err(_) => return Ok(predicate(&*self.known)),
                }
            },
        }
    }

    /// Wait until at least `n` peers are known.
    pub async fn block_until_number_of_known_nodes_is(
        &self,
        n: usize,
        timeout: Duration,
        mode: LearnMode,
    ) -> Result<bool> {
        self.block_until(|known| known.len() >= n, timeout, mode).await
    }

    /// Wait until every identifier in `ids` is known.
    pub async fn block_until_specific_nodes_are_known(
        &self,
        ids: &[PeerId],
        timeout: Duration,
        mode: LearnMode,
    ) -> Result<bool> {
        self.block_until(|known| ids.iter().all(|id| known.contains(id)), timeout, mode)
            .await
    }

    /// Spawn the background loop.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker.lock();
        match self.state() {
            LoopState::Stopped => return Err(LearningError::Stopped),
            LoopState::Running | LoopState::Paused if worker.is_some() => {
                return Err(LearningError::AlreadyRunning)
            }
            _ => {}
        }
        self.state_tx.send_replace(LoopState::Running);
        let learner = Arc::clone(self);
        *worker = Some(tokio::spawn(async move { learner.run().await }));
        info!(interval = ?self.config.interval, "learning loop started");
        Ok(())
    }

    async fn run(self: Arc<Self>) -> Result<()> {
        let mut state = self.state_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let current = *state.borrow_and_update();
            match current {
                LoopState::Stopped => break,
                LoopState::Idle | LoopState::Paused => {
                    if state.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                LoopState::Running => {}
            }

            tokio::select! {
                _ = ticker.tick() => {
                    match self.learn_once().await {
                        Ok(_) | Err(LearningError::Stopped) => {}
                        Err(err) => {
                            error!(error = %err, "learning loop terminated");
                            return Err(err);
                        }
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("learning loop stopped");
        Ok(())
    }

    pub fn pause(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == LoopState::Running {
                *state = LoopState::Paused;
                true
            } else {
                false
            }
        });
    }

    pub fn resume(&self) {
        self.state_tx.send_if_modified(|state| {
            if *state == LoopState::Paused {
                *state = LoopState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Request a stop. Honored between cycles.
    pub fn stop(&self) {
        self.state_tx.send_replace(LoopState::Stopped);
    }

    /// Stop and wait for the background task to finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop();
        let handle = self.worker.lock().take();
        match handle {
            Some(handle) => handle
                .await
                .map_err(|e| LearningError::Worker(e.to_string()))?,
            None => Ok(()),
        }
    }

    pub fn status(&self) -> FleetStatus {
        let registry = self.known.stats();
        let state = self.known.state();
        FleetStatus {
            state: self.state(),
            known: registry.known,
            verified: registry.network_verified + registry.stake_verified,
            stake_verified: registry.stake_verified,
            checksum: state.checksum,
            version: state.version,
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            last_cycle_ms: self.last_cycle.lock().map(|d| d.as_millis() as u64),
            backlog: self.backlog.lock().len(),
            decode_failures: self.counters.decode_failures.load(Ordering::Relaxed),
            registry,
            verification: self.pipeline.stats().snapshot(),
        }
    }
}

impl std::fmt::Debug for Learner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Learner")
            .field("state", &self.state())
            .field("known", &self.known.len())
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}
