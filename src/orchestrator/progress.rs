//! Provisioning progress broadcast.
//!
//! Steps are announced before they run and again when they finish. Nothing
//! here is persisted; subscribers that join late only see later steps.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// How a step ended, or that it started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum StepOutcome {
    Started,
    Succeeded,
    Failed(String),
    /// Best-effort step that did not run or did not complete.
    Skipped(String),
    /// A line of streamed script output.
    Output(String),
}

/// One progress record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningStep {
    pub sandbox_id: Uuid,
    pub label: String,
    pub outcome: StepOutcome,
}

impl ProvisioningStep {
    pub fn new(sandbox_id: Uuid, label: impl Into<String>, outcome: StepOutcome) -> Self {
        Self {
            sandbox_id,
            label: label.into(),
            outcome,
        }
    }

    /// Human-readable line for log-style consumers.
    pub fn message(&self) -> String {
        match &self.outcome {
            StepOutcome::Started => format!("{}...", self.label),
            StepOutcome::Succeeded => format!("{} done", self.label),
            StepOutcome::Failed(reason) => format!("{} failed: {}", self.label, reason),
            StepOutcome::Skipped(reason) => format!("{} skipped: {}", self.label, reason),
            StepOutcome::Output(text) => text.clone(),
        }
    }
}

/// Topic a sandbox's progress is published on.
pub fn topic(sandbox_id: Uuid) -> String {
    format!("sandbox:{}", sandbox_id)
}

/// Receives progress. Publishing never blocks and never fails.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, topic: &str, step: ProvisioningStep);
}

/// Fan-out over a tokio broadcast channel.
pub struct BroadcastProgress {
    tx: broadcast::Sender<(String, ProvisioningStep)>,
}

impl BroadcastProgress {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, ProvisioningStep)> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastProgress {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ProgressSink for BroadcastProgress {
    fn publish(&self, topic: &str, step: ProvisioningStep) {
        tracing::trace!(topic = %topic, "{}", step.message());
        // No subscribers is fine.
        let _ = self.tx.send((topic.to_string(), step));
    }
}

/// Progress sink that only logs.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn publish(&self, topic: &str, step: ProvisioningStep) {
        match &step.outcome {
            StepOutcome::Failed(_) => tracing::error!(topic = %topic, "{}", step.message()),
            StepOutcome::Skipped(_) => tracing::warn!(topic = %topic, "{}", step.message()),
            StepOutcome::Output(_) => tracing::debug!(topic = %topic, "{}", step.message()),
            _ => tracing::info!(topic = %topic, "{}", step.message()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let progress = BroadcastProgress::new(8);
        let mut rx = progress.subscribe();
        let id = Uuid::new_v4();

        progress.publish(
            &topic(id),
            ProvisioningStep::new(id, "Creating network", StepOutcome::Started),
        );

        let (t, step) = rx.recv().await.unwrap();
        assert_eq!(t, format!("sandbox:{}", id));
        assert_eq!(step.message(), "Creating network...");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let progress = BroadcastProgress::new(1);
        let id = Uuid::new_v4();
        progress.publish(
            &topic(id),
            ProvisioningStep::new(id, "x", StepOutcome::Failed("boom".to_string())),
        );
    }

    #[test]
    fn test_step_serializes_with_outcome_tag() {
        let id = Uuid::nil();
        let step = ProvisioningStep::new(id, "Pull", StepOutcome::Skipped("offline".to_string()));
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["outcome"]["outcome"], "skipped");
        assert_eq!(json["outcome"]["detail"], "offline");
    }
}
