//! Per-attempt job execution.

use tracing::warn;
use uuid::Uuid;

use super::job::{JobProgress, JobRecord, ProgressStage};
use super::queue::JobQueue;
use crate::dispatch::{DispatchOutput, Dispatcher};
use crate::error::DispatchError;

/// Runs one attempt of a job: reports progress around a single dispatch.
///
/// The executor does not decide whether a failed attempt is retried; the
/// error goes back to the scheduler, which applies the attempt budget.
#[derive(Clone)]
pub struct JobExecutor {
    dispatcher: Dispatcher,
    queue: JobQueue,
}

impl JobExecutor {
    pub fn new(dispatcher: Dispatcher, queue: JobQueue) -> Self {
        Self { dispatcher, queue }
    }

    /// Executes one attempt.
    ///
    /// Progress moves to `processing`, then to `completed` with the worker
    /// that answered or to `failed`. Progress write failures are logged and
    /// never change the outcome.
    pub async fn execute(&self, job: &JobRecord) -> Result<DispatchOutput, DispatchError> {
        let preferred = job.payload.preferred_worker;
        self.report(job.id, ProgressStage::Processing, preferred).await;

        match self.dispatcher.dispatch(&job.payload.prompt).await {
            Ok(output) => {
                self.report(job.id, ProgressStage::Completed, Some(output.used_worker))
                    .await;
                Ok(output)
            }
            Err(e) => {
                self.report(job.id, ProgressStage::Failed, preferred).await;
                Err(e)
            }
        }
    }

    /// Writes progress, logging instead of failing.
    pub(crate) async fn report(&self, id: Uuid, stage: ProgressStage, worker: Option<usize>) {
        let progress = JobProgress::new(stage, worker);
        if let Err(e) = self.queue.update_progress(id, progress).await {
            warn!(job_id = %id, error = %e, "Failed to update job progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerTimeouts;
    use crate::scheduler::queue::QueueSettings;
    use crate::workers::mock::{busy, search_ok, ScriptedTransport};
    use crate::workers::WorkerClient;
    use std::sync::Arc;

    fn setup(transport: &Arc<ScriptedTransport>) -> (JobExecutor, JobQueue) {
        let client = WorkerClient::new(transport.clone(), WorkerTimeouts::default());
        let queue = JobQueue::in_memory(QueueSettings::new(client.worker_count()));
        (JobExecutor::new(Dispatcher::new(client), queue.clone()), queue)
    }

    #[tokio::test]
    async fn test_success_reports_used_worker() {
        let transport = Arc::new(ScriptedTransport::new(2));
        transport.push(1, busy());
        transport.push(2, search_ok("{\"found\":true}", None));
        let (executor, queue) = setup(&transport);

        let id = queue.enqueue("prompt", Some(1)).await.unwrap();
        let job = queue.claim_next().await.unwrap().unwrap();
        let output = executor.execute(&job).await.unwrap();

        assert_eq!(output.used_worker, 2);
        let view = queue.get_status(id).await.unwrap();
        assert_eq!(
            view.progress,
            Some(JobProgress::new(ProgressStage::Completed, Some(2)))
        );
    }

    #[tokio::test]
    async fn test_failure_reports_preferred_worker() {
        let transport = Arc::new(ScriptedTransport::new(2));
        transport.set_default(1, busy());
        transport.set_default(2, busy());
        let (executor, queue) = setup(&transport);

        let id = queue.enqueue("prompt", Some(2)).await.unwrap();
        let job = queue.claim_next().await.unwrap().unwrap();
        let err = executor.execute(&job).await.unwrap_err();

        assert!(matches!(err, DispatchError::AllWorkersExhausted { tried: 2, .. }));
        let view = queue.get_status(id).await.unwrap();
        assert_eq!(
            view.progress,
            Some(JobProgress::new(ProgressStage::Failed, Some(2)))
        );
        // The executor leaves the lifecycle to the scheduler
        assert_eq!(view.status, crate::scheduler::JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_progress_failure_does_not_change_outcome() {
        let transport = Arc::new(ScriptedTransport::new(1));
        transport.push(1, search_ok("{\"x\":1}", None));
        let (executor, _queue) = setup(&transport);

        // A job the queue has never seen: every progress write fails
        let job = JobRecord::new(
            crate::scheduler::job::JobPayload::new("orphan"),
            &crate::scheduler::job::RetryPolicy::default(),
            std::time::Duration::from_secs(5),
        );
        let output = executor.execute(&job).await.unwrap();
        assert_eq!(output.used_worker, 1);
    }
}
