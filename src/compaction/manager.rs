//! Compaction execution: summarize-or-truncate.

use tracing::{info, warn};
use uuid::Uuid;

use super::tracker::{CompactionPolicy, CompactionReason};
use crate::control::StopSignal;
use crate::events::{EngineEvent, EventBus};
use crate::inference::{InferenceRequest, InferenceService, ModelConfig, RetryPolicy, infer_with_retry};
use crate::state::{ConversationMessage, ConversationState};

const SUMMARY_INSTRUCTION: &str = "Produce a narrative summary of the conversation so far: \
the user's goals, decisions taken, files produced, outstanding problems, and anything a \
continuation of this build must not forget. Respond with the summary text only.";

/// What a compaction pass did.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub reason: CompactionReason,
    /// Archive id tagged onto the synthetic summary message; empty when
    /// the pass fell back to truncation.
    pub archive_id: String,
    /// Messages removed from the working history.
    pub summarized: usize,
    pub fell_back_to_truncation: bool,
}

/// Performs compaction when the policy's thresholds are exceeded.
#[derive(Clone)]
pub struct Compactor {
    policy: CompactionPolicy,
    model: ModelConfig,
    retry: RetryPolicy,
}

impl Compactor {
    pub fn new(policy: CompactionPolicy, model: ModelConfig) -> Self {
        Self {
            policy,
            model,
            retry: RetryPolicy::default(),
        }
    }

    pub fn policy(&self) -> &CompactionPolicy {
        &self.policy
    }

    /// Check the thresholds and compact the working history in place.
    /// Returns `None` when no compaction was needed. Summarization
    /// failures degrade to truncation; they never propagate.
    pub async fn compact_if_needed(
        &self,
        inference: &dyn InferenceService,
        conversation: &mut ConversationState,
        events: &EventBus,
    ) -> Option<CompactionOutcome> {
        let reason = self.policy.should_compact(conversation)?;

        let Some(boundary) = self.policy.boundary(&conversation.running) else {
            return Some(self.truncate(conversation, reason));
        };

        let head: Vec<ConversationMessage> = conversation.running[..boundary].to_vec();
        let request = InferenceRequest::new("conversation_compaction", head, self.model.clone())
            .with_system(SUMMARY_INSTRUCTION);

        match infer_with_retry(inference, request, &self.retry, &StopSignal::new()).await {
            Ok(response) => {
                let archive_id = format!("archive-{}", Uuid::new_v4());
                let summary =
                    ConversationMessage::summary(archive_id.clone(), response.message.content);

                let tail = conversation.running.split_off(boundary);
                conversation.running = std::iter::once(summary.clone()).chain(tail).collect();
                // The audit table keeps everything and gains the summary.
                conversation.full.push(summary);

                info!(target: "crucible::compaction", %archive_id, summarized = boundary,
                    reason = ?reason, "compacted working history");
                events.publish(EngineEvent::ConversationCompacted {
                    archive_id: archive_id.clone(),
                    summarized: boundary,
                });
                Some(CompactionOutcome {
                    reason,
                    archive_id,
                    summarized: boundary,
                    fell_back_to_truncation: false,
                })
            }
            Err(e) => {
                warn!(target: "crucible::compaction", error = %e,
                    "summarization failed, falling back to truncation");
                Some(self.truncate(conversation, reason))
            }
        }
    }

    /// Keep only the last `3 x tail` messages. Bounds the history without
    /// losing it wholesale when no summary is available.
    fn truncate(&self, conversation: &mut ConversationState, reason: CompactionReason) -> CompactionOutcome {
        let keep = self.policy.truncation_len();
        let len = conversation.running.len();
        let dropped = len.saturating_sub(keep);
        if dropped > 0 {
            conversation.running.drain(..dropped);
        }
        CompactionOutcome {
            reason,
            archive_id: String::new(),
            summarized: dropped,
            fell_back_to_truncation: true,
        }
    }
}
