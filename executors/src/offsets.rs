use std::collections::{BTreeMap, HashMap, HashSet};

use relayer_core::broker::OffsetCommitter;
use relayer_core::error::OrchestratorError;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    Tracked,
    /// The job is already tracked at another offset: an at-least-once
    /// duplicate the caller should drop instead of reprocessing.
    DuplicateJob,
}

#[derive(Debug)]
struct OffsetEntry {
    job_uuid: Uuid,
    done: bool,
    /// Escalation children that must finish before this offset can commit.
    open_children: HashSet<Uuid>,
}

impl OffsetEntry {
    fn is_complete(&self) -> bool {
        self.done && self.open_children.is_empty()
    }
}

#[derive(Default)]
struct LedgerInner {
    partitions: HashMap<i32, BTreeMap<i64, OffsetEntry>>,
    /// Offsets carrying each job. A job redelivered at a second offset is
    /// tracked at both until the commit walk passes them.
    entry_index: HashMap<Uuid, Vec<(i32, i64)>>,
    /// Parent offsets each escalation child is holding open.
    child_index: HashMap<Uuid, Vec<(i32, i64)>>,
}

/// Per-partition completion ledger. Jobs finish out of order; the broker
/// commit still only ever advances over a contiguous prefix of done offsets,
/// so a crash-restart re-delivers every job that had not finished.
pub struct CompletionCommitter<K: OffsetCommitter> {
    committer: K,
    inner: Mutex<LedgerInner>,
}

impl<K: OffsetCommitter> CompletionCommitter<K> {
    pub fn new(committer: K) -> Self {
        Self {
            committer,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    /// Record an inbound message in the ledger before any processing starts.
    pub async fn track(&self, partition: i32, offset: i64, job_uuid: Uuid) -> TrackOutcome {
        let mut inner = self.inner.lock().await;

        let known_elsewhere = inner
            .entry_index
            .get(&job_uuid)
            .is_some_and(|locs| locs.iter().any(|&(p, o)| p != partition || o != offset));

        let ledger = inner.partitions.entry(partition).or_default();
        if !ledger.contains_key(&offset) {
            ledger.insert(
                offset,
                OffsetEntry {
                    job_uuid,
                    done: false,
                    open_children: HashSet::new(),
                },
            );
            let locs = inner.entry_index.entry(job_uuid).or_default();
            if !locs.contains(&(partition, offset)) {
                locs.push((partition, offset));
            }
        }

        if known_elsewhere {
            tracing::debug!(%job_uuid, partition, offset, "duplicate delivery tracked");
            TrackOutcome::DuplicateJob
        } else {
            TrackOutcome::Tracked
        }
    }

    /// Tie an escalation child to every offset its parent is holding open.
    /// Returns false when the parent is not in the ledger.
    pub async fn register_child(&self, parent_uuid: Uuid, child_uuid: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(locs) = inner.entry_index.get(&parent_uuid).cloned() else {
            return false;
        };
        for &(partition, offset) in &locs {
            if let Some(entry) = inner
                .partitions
                .get_mut(&partition)
                .and_then(|ledger| ledger.get_mut(&offset))
            {
                entry.open_children.insert(child_uuid);
            }
        }
        let child_locs = inner.child_index.entry(child_uuid).or_default();
        for loc in locs {
            if !child_locs.contains(&loc) {
                child_locs.push(loc);
            }
        }
        true
    }

    /// Mark every ledger appearance of `job_uuid` done (both its own offsets
    /// and any parent offsets it holds open as a child), then walk each
    /// touched partition forward committing the contiguous done-prefix.
    /// Returns the offsets committed by this call.
    pub async fn complete(&self, job_uuid: Uuid) -> Result<Vec<(i32, i64)>, OrchestratorError> {
        let mut inner = self.inner.lock().await;
        let mut touched: HashSet<i32> = HashSet::new();

        if let Some(locs) = inner.entry_index.get(&job_uuid).cloned() {
            for (partition, offset) in locs {
                if let Some(entry) = inner
                    .partitions
                    .get_mut(&partition)
                    .and_then(|ledger| ledger.get_mut(&offset))
                {
                    entry.done = true;
                    touched.insert(partition);
                }
            }
        }

        if let Some(locs) = inner.child_index.remove(&job_uuid) {
            for (partition, offset) in locs {
                if let Some(entry) = inner
                    .partitions
                    .get_mut(&partition)
                    .and_then(|ledger| ledger.get_mut(&offset))
                {
                    entry.open_children.remove(&job_uuid);
                    touched.insert(partition);
                }
            }
        }

        if touched.is_empty() {
            tracing::debug!(%job_uuid, "completion for untracked job, nothing to commit");
            return Ok(Vec::new());
        }

        let mut committed = Vec::new();
        for partition in touched {
            self.walk_partition(&mut inner, partition, &mut committed)
                .await?;
        }
        Ok(committed)
    }

    /// Mark a single delivery done without touching the job's other ledger
    /// appearances. Used for duplicate deliveries that carry no new work.
    pub async fn complete_delivery(
        &self,
        partition: i32,
        offset: i64,
    ) -> Result<Vec<(i32, i64)>, OrchestratorError> {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner
            .partitions
            .get_mut(&partition)
            .and_then(|ledger| ledger.get_mut(&offset))
        else {
            return Ok(Vec::new());
        };
        entry.done = true;

        let mut committed = Vec::new();
        self.walk_partition(&mut inner, partition, &mut committed)
            .await?;
        Ok(committed)
    }

    /// Offsets still open in a partition.
    pub async fn outstanding(&self, partition: i32) -> usize {
        let inner = self.inner.lock().await;
        inner
            .partitions
            .get(&partition)
            .map(|ledger| ledger.len())
            .unwrap_or(0)
    }

    async fn walk_partition(
        &self,
        inner: &mut LedgerInner,
        partition: i32,
        committed: &mut Vec<(i32, i64)>,
    ) -> Result<(), OrchestratorError> {
        loop {
            let Some(ledger) = inner.partitions.get_mut(&partition) else {
                return Ok(());
            };
            let Some((&offset, entry)) = ledger.first_key_value() else {
                return Ok(());
            };
            if !entry.is_complete() {
                return Ok(());
            }
            let job_uuid = entry.job_uuid;

            // Commit before dropping the entry: on error the entry stays and
            // the next completion retries the walk from here.
            self.committer.commit(partition, offset).await?;

            if let Some(ledger) = inner.partitions.get_mut(&partition) {
                ledger.pop_first();
            }
            if let Some(locs) = inner.entry_index.get_mut(&job_uuid) {
                locs.retain(|&loc| loc != (partition, offset));
                if locs.is_empty() {
                    inner.entry_index.remove(&job_uuid);
                }
            }
            committed.push((partition, offset));
            tracing::trace!(partition, offset, %job_uuid, "offset committed");
        }
    }
}
