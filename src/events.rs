//! Typed engine events broadcast to external consumers.
//!
//! Fire-and-forget: there is no acknowledgment or backpressure contract,
//! and consumers must tolerate duplicates and reordering across
//! reconnects. Publishing never fails — events sent with no subscriber
//! are dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default channel capacity; slow subscribers lag and lose old events.
const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    PhaseStarted {
        name: String,
    },
    PhaseGenerated {
        name: String,
        description: String,
    },
    PhaseImplemented {
        name: String,
        file_count: usize,
    },
    DeploymentStarted {
        attempt: u32,
    },
    DeploymentCompleted {
        session_id: String,
        preview_url: String,
    },
    DeploymentFailed {
        message: String,
    },
    ToolCallStarted {
        call_id: String,
        tool: String,
    },
    ToolCallSucceeded {
        call_id: String,
        tool: String,
        duration_ms: u64,
    },
    ToolCallFailed {
        call_id: String,
        tool: String,
        message: String,
    },
    ConversationUpdated {
        message_id: String,
        role: String,
    },
    ConversationCompacted {
        archive_id: String,
        summarized: usize,
    },
    /// Review found outstanding issues and offers a deep-debug pass.
    ReviewPrompt {
        message: String,
    },
    MvpCompleted {
        project_name: String,
    },
    GenerationError {
        message: String,
    },
}

/// Broadcast bus the orchestrator and its components publish to.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
