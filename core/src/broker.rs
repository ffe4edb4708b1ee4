use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::job::Job;

/// One inbound broker message: a job bound to its partition and offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDelivery {
    pub job: Job,
    pub partition: i32,
    pub offset: i64,
}

/// The single broker write the engine performs. Commits are issued only by
/// the completion committer, strictly in increasing offset order per
/// partition.
pub trait OffsetCommitter: Send + Sync {
    fn commit(
        &self,
        partition: i32,
        offset: i64,
    ) -> impl Future<Output = Result<(), OrchestratorError>> + Send;
}

/// Pull interface over the partitioned intake topic. `None` means the
/// consumer has been closed upstream.
pub trait JobConsumer: Send {
    fn next(
        &mut self,
    ) -> impl Future<Output = Result<Option<JobDelivery>, OrchestratorError>> + Send;
}
