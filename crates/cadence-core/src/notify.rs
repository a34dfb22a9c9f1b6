// Notification and Pull-Request Seams
// Delivery (chat, toasts) and PR creation live outside the core; these traits
// are the interfaces the executor calls, best-effort, after a run settles.

use async_trait::async_trait;

use cadence_types::PipelineState;

/// Receives run lifecycle events. Implementations must not fail the run;
/// anything that can error should swallow and log it.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn run_completed(&self, state: &PipelineState);
    async fn run_failed(&self, state: &PipelineState);
    async fn pull_request_created(&self, state: &PipelineState, url: &str);
}

/// Default notifier: structured log lines only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn run_completed(&self, state: &PipelineState) {
        let counts = state.counts();
        tracing::info!(
            run_id = %state.run_id,
            pipeline = %state.pipeline_config.name,
            succeeded = counts.succeeded,
            skipped = counts.skipped,
            "pipeline run completed"
        );
    }

    async fn run_failed(&self, state: &PipelineState) {
        let counts = state.counts();
        tracing::warn!(
            run_id = %state.run_id,
            pipeline = %state.pipeline_config.name,
            failed = counts.failed,
            cancelled = counts.cancelled,
            "pipeline run did not complete"
        );
    }

    async fn pull_request_created(&self, state: &PipelineState, url: &str) {
        tracing::info!(run_id = %state.run_id, url = %url, "pull request created");
    }
}

/// Creates a pull request for the run branch and returns its URL.
#[async_trait]
pub trait PullRequestCreator: Send + Sync {
    async fn create(&self, branch: &str, state: &PipelineState) -> anyhow::Result<String>;
}
