pub mod gas;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use relayer_core::api::{JobUpdate, NotificationSink, OrchestrationClient};
use relayer_core::broker::OffsetCommitter;
use relayer_core::error::OrchestratorError;
use relayer_core::job::{Job, JobStatus};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::metrics::OrchestratorMetrics;
use crate::offsets::CompletionCommitter;
use crate::pending::{PendingJobRecord, PendingJobStore};

use gas::{apply_escalation, escalation_applies, escalation_multiplier_bps, to_basis_points};

/// What a retry-session firing does for a stalled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-broadcast `target`'s payload verbatim.
    Resend { target: Uuid },
    /// Spawn a new child job with the cumulative multiplier applied.
    Escalate { multiplier_bps: u64 },
    /// The resend budget is exhausted; the job never mined.
    Fail,
}

/// Pick the next move for a job whose receipt has not appeared by the time
/// its timer fired. Raw transactions and jobs without a gas-increment policy
/// only ever resend in place; escalation stops once the cumulative multiplier
/// reaches the configured limit and falls back to resending the last
/// (highest-gas) job in the chain.
pub fn decide(job: &Job, children: &[Uuid]) -> RetryDecision {
    if job.resend_count() >= job.internal_data.max_resends {
        return RetryDecision::Fail;
    }

    let increment = to_basis_points(job.internal_data.gas_price_increment);
    let limit = to_basis_points(job.internal_data.gas_price_limit);
    if job.is_raw() || increment == 0 {
        return RetryDecision::Resend { target: job.uuid };
    }

    let count = children.len() as u64;
    if escalation_applies(count, increment, limit) {
        RetryDecision::Escalate {
            multiplier_bps: escalation_multiplier_bps(count, increment, limit),
        }
    } else {
        RetryDecision::Resend {
            target: children.last().copied().unwrap_or(job.uuid),
        }
    }
}

struct SessionHandle {
    chain_uuid: Uuid,
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

/// Per-job timer sessions deciding when to nudge a stalled transaction.
///
/// Each session is an independently cancellable task; a timer that fires
/// after its job completed finds no pending record and exits as a no-op.
pub struct RetrySessionManager<P, A, K, T>
where
    P: PendingJobStore + 'static,
    A: OrchestrationClient + 'static,
    K: OffsetCommitter + 'static,
    T: NotificationSink + 'static,
{
    pending: Arc<P>,
    api: Arc<A>,
    committer: Arc<CompletionCommitter<K>>,
    notifier: Arc<T>,
    metrics: Arc<OrchestratorMetrics>,
    sessions: StdMutex<HashMap<Uuid, SessionHandle>>,
}

impl<P, A, K, T> RetrySessionManager<P, A, K, T>
where
    P: PendingJobStore + 'static,
    A: OrchestrationClient + 'static,
    K: OffsetCommitter + 'static,
    T: NotificationSink + 'static,
{
    pub fn new(
        pending: Arc<P>,
        api: Arc<A>,
        committer: Arc<CompletionCommitter<K>>,
        notifier: Arc<T>,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        Self {
            pending,
            api,
            committer,
            notifier,
            metrics,
            sessions: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, SessionHandle>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Arm (or keep) the timer session for this job. A live session keeps
    /// running against whatever record the store currently holds.
    pub fn start_session(self: &Arc<Self>, job: &Job, chain_label: &str) {
        let mut sessions = self.lock_sessions();
        if let Some(existing) = sessions.get(&job.uuid) {
            if !existing.join.is_finished() {
                return;
            }
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let manager = Arc::clone(self);
        let job_uuid = job.uuid;
        let interval = job.internal_data.retry_interval;
        let label = chain_label.to_string();

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match manager.fire(job_uuid, &label).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        tracing::warn!(
                            %job_uuid,
                            error = %err,
                            "retry session firing failed, retrying next interval"
                        );
                    }
                }
            }
        });

        sessions.insert(
            job_uuid,
            SessionHandle {
                chain_uuid: job.chain_uuid,
                shutdown_tx,
                join,
            },
        );
    }

    /// One timer firing: look the job up fresh and act on the decision.
    /// Returns false when the session should end.
    #[tracing::instrument(skip(self), fields(job_uuid = %job_uuid))]
    async fn fire(&self, job_uuid: Uuid, chain_label: &str) -> Result<bool, OrchestratorError> {
        let Some(mut record) = self.pending.get(job_uuid).await? else {
            return Ok(false);
        };
        if record.job.status.is_terminal() {
            return Ok(false);
        }

        match decide(&record.job, &record.children) {
            RetryDecision::Fail => {
                self.fail_never_mined(record, chain_label).await?;
                Ok(false)
            }
            RetryDecision::Resend { target } => {
                self.api.resend_job_tx(target).await?;
                self.api
                    .update_job(
                        target,
                        JobUpdate::status(
                            JobStatus::Resending,
                            "transaction stalled, resending with the same payload",
                        ),
                    )
                    .await?;
                record.job.record_status(
                    JobStatus::Resending,
                    format!("resend requested for job {target}"),
                );
                self.pending.update(record).await?;
                self.metrics
                    .jobs_resent
                    .with_label_values(&[chain_label])
                    .inc();
                Ok(true)
            }
            RetryDecision::Escalate { multiplier_bps } => {
                let mut child = record.job.spawn_escalation_child();
                apply_escalation(&mut child.transaction, multiplier_bps);
                let child = self.api.create_job(child).await?;

                // The ledger must see the child before it can possibly
                // complete, or the parent offset could commit early.
                self.committer
                    .register_child(record.job.uuid, child.uuid)
                    .await;
                self.pending.add_child(record.job.uuid, child.uuid).await?;
                self.api.start_job(child.uuid).await?;

                record.job.record_status(
                    JobStatus::Resending,
                    format!(
                        "spawned gas-escalated child {} at +{} bps",
                        child.uuid, multiplier_bps
                    ),
                );
                self.pending.update(record).await?;
                self.metrics
                    .jobs_escalated
                    .with_label_values(&[chain_label])
                    .inc();
                tracing::info!(
                    child_uuid = %child.uuid,
                    multiplier_bps,
                    "gas-escalated child started"
                );
                Ok(true)
            }
        }
    }

    async fn fail_never_mined(
        &self,
        record: PendingJobRecord,
        chain_label: &str,
    ) -> Result<(), OrchestratorError> {
        let job_uuid = record.job_uuid();
        tracing::warn!(%job_uuid, "resend budget exhausted without a receipt");

        self.api
            .update_job(
                job_uuid,
                JobUpdate::status(
                    JobStatus::NeverMined,
                    "resend budget exhausted without a confirmation",
                ),
            )
            .await?;
        self.pending.remove(job_uuid).await?;
        self.metrics
            .jobs_failed
            .with_label_values(&[chain_label])
            .inc();

        let mut job = record.job;
        job.record_status(
            JobStatus::NeverMined,
            "resend budget exhausted without a confirmation",
        );
        self.notifier.notify(&job, None).await?;
        self.committer.complete(job_uuid).await?;
        Ok(())
    }

    /// Tear down the session for a completed or externally removed job.
    pub fn cancel(&self, job_uuid: Uuid) {
        if let Some(handle) = self.lock_sessions().remove(&job_uuid) {
            let _ = handle.shutdown_tx.send(());
        }
    }

    /// Tear down every session watching a deregistered chain.
    pub fn cancel_chain(&self, chain_uuid: Uuid) {
        let mut sessions = self.lock_sessions();
        let stale: Vec<Uuid> = sessions
            .iter()
            .filter(|(_, handle)| handle.chain_uuid == chain_uuid)
            .map(|(uuid, _)| *uuid)
            .collect();
        for uuid in stale {
            if let Some(handle) = sessions.remove(&uuid) {
                let _ = handle.shutdown_tx.send(());
            }
        }
    }

    /// Cancel all sessions. Pending records stay in the store, so sessions
    /// are re-derived on the next startup.
    pub fn shutdown(&self) {
        let mut sessions = self.lock_sessions();
        for (_, handle) in sessions.drain() {
            let _ = handle.shutdown_tx.send(());
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.lock_sessions()
            .values()
            .filter(|handle| !handle.join.is_finished())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayer_core::job::JobType;

    fn escalating_job(increment: f64, limit: f64) -> Job {
        let mut job = Job::new(Uuid::new_v4(), "tenant", JobType::Transaction);
        job.internal_data.gas_price_increment = increment;
        job.internal_data.gas_price_limit = limit;
        job.transaction.gas_price = Some(1_000_000_000);
        job
    }

    #[test]
    fn test_raw_jobs_only_resend() {
        let job = Job::new(Uuid::new_v4(), "tenant", JobType::RawTransaction);
        assert_eq!(
            decide(&job, &[Uuid::new_v4()]),
            RetryDecision::Resend { target: job.uuid }
        );
    }

    #[test]
    fn test_no_increment_means_resend() {
        let job = escalating_job(0.0, 0.12);
        assert_eq!(
            decide(&job, &[]),
            RetryDecision::Resend { target: job.uuid }
        );
    }

    #[test]
    fn test_escalation_progression_then_fallback() {
        let job = escalating_job(0.06, 0.12);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(
            decide(&job, &[]),
            RetryDecision::Escalate { multiplier_bps: 600 }
        );
        assert_eq!(
            decide(&job, &[first]),
            RetryDecision::Escalate {
                multiplier_bps: 1200
            }
        );
        // Cap reached: resend the highest-gas job in the chain.
        assert_eq!(
            decide(&job, &[first, second]),
            RetryDecision::Resend { target: second }
        );
    }

    #[test]
    fn test_exhausted_budget_fails() {
        let mut job = escalating_job(0.06, 0.12);
        job.internal_data.max_resends = 2;
        job.record_status(JobStatus::Resending, "first");
        job.record_status(JobStatus::Resending, "second");
        assert_eq!(decide(&job, &[]), RetryDecision::Fail);
    }
}
