//! Generation strategies driving the end-to-end build.
//!
//! Two strategies exist: the deterministic *phasic* state machine and the
//! reactive *agentic* loop. One is selected at actor startup from
//! persisted state and held behind the `GenerationBehavior` trait —
//! single dispatch per project, no hierarchy.

mod agentic;
mod phasic;

pub use agentic::AgenticBehavior;
pub use phasic::{PhasicBehavior, PhasicState};

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::compaction::Compactor;
use crate::config::EngineConfig;
use crate::control::StopSignal;
use crate::dag::ToolRegistry;
use crate::deploy::DeploymentManager;
use crate::events::{EngineEvent, EventBus};
use crate::inference::InferenceService;
use crate::sandbox::SandboxService;
use crate::state::{BehaviorKind, ConversationMessage, ConversationState, ProjectState, ProjectStore};

/// Tuning for the phasic state machine.
#[derive(Debug, Clone)]
pub struct PhasicConfig {
    /// Upper bound on generated phases for one build.
    pub phase_budget: u32,
}

impl Default for PhasicConfig {
    fn default() -> Self {
        Self { phase_budget: 10 }
    }
}

/// Tuning for the agentic loop.
#[derive(Debug, Clone)]
pub struct AgenticConfig {
    /// Maximum tool-calling depth within one builder pass.
    pub max_tool_depth: usize,
    /// Bound on builder passes per run.
    pub max_passes: usize,
    /// The compactor is checked every K completed tool calls.
    pub compaction_check_interval: usize,
}

impl Default for AgenticConfig {
    fn default() -> Self {
        Self {
            max_tool_depth: 24,
            max_passes: 32,
            compaction_check_interval: 5,
        }
    }
}

/// Dependencies and shared handles a strategy runs against. The state
/// handles live behind short-held locks; every mutation is committed as a
/// whole-state replace so outside observers only see full snapshots.
#[derive(Clone)]
pub struct BehaviorContext {
    pub config: EngineConfig,
    pub inference: Arc<dyn InferenceService>,
    pub sandbox: Arc<dyn SandboxService>,
    pub store: Arc<dyn ProjectStore>,
    pub events: EventBus,
    pub deploy: Arc<DeploymentManager>,
    pub registry: Arc<ToolRegistry>,
    pub compactor: Compactor,
    pub state: Arc<Mutex<ProjectState>>,
    pub conversation: Arc<Mutex<ConversationState>>,
    /// Cancellation for this generation run; observed after each unit of
    /// work.
    pub cancel: StopSignal,
    /// Raised when new user input arrives mid-run.
    pub input_signal: StopSignal,
}

impl BehaviorContext {
    pub async fn snapshot(&self) -> ProjectState {
        self.state.lock().await.clone()
    }

    /// Mutate the state and persist the whole record before returning.
    pub async fn commit<F, R>(&self, mutate: F) -> Result<R>
    where
        F: FnOnce(&mut ProjectState) -> R,
    {
        let (snapshot, value) = {
            let mut state = self.state.lock().await;
            let value = mutate(&mut state);
            (state.clone(), value)
        };
        self.store.save_state(&snapshot).await?;
        Ok(value)
    }

    /// Upsert a message into both conversation tables, persist them, and
    /// broadcast the update.
    pub async fn push_message(&self, message: ConversationMessage) -> Result<()> {
        let conversation_id = self.state.lock().await.conversation_id.clone();
        let snapshot = {
            let mut conversation = self.conversation.lock().await;
            conversation.upsert(message.clone());
            conversation.clone()
        };
        self.store.save_conversation(&conversation_id, &snapshot).await?;
        self.events.publish(EngineEvent::ConversationUpdated {
            message_id: message.id,
            role: format!("{:?}", message.role).to_lowercase(),
        });
        Ok(())
    }

    /// Persist the conversation tables after in-place edits (compaction).
    pub async fn save_conversation(&self) -> Result<()> {
        let conversation_id = self.state.lock().await.conversation_id.clone();
        let snapshot = self.conversation.lock().await.clone();
        self.store.save_conversation(&conversation_id, &snapshot).await
    }
}

/// How one step of a strategy ended when it didn't succeed. Cancellation
/// stays separate from failure so it is never reported as an error.
pub(crate) enum StepError {
    Cancelled,
    Failed(anyhow::Error),
}

impl From<crate::errors::InferenceError> for StepError {
    fn from(e: crate::errors::InferenceError) -> Self {
        if e.is_cancellation() {
            Self::Cancelled
        } else {
            Self::Failed(e.into())
        }
    }
}

impl From<anyhow::Error> for StepError {
    fn from(e: anyhow::Error) -> Self {
        Self::Failed(e)
    }
}

/// Collapse a drained input queue (texts and images) into one synthetic
/// user message.
pub(crate) fn synthesize_user_message(inputs: &[crate::state::UserInput]) -> ConversationMessage {
    let text = inputs
        .iter()
        .map(|i| i.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let mut message = ConversationMessage::user(text);
    message.images = inputs.iter().flat_map(|i| i.images.iter().cloned()).collect();
    message
}

/// A generation strategy. `run` drives the build until it goes idle; the
/// orchestrator re-enters it whenever new user input arrives while idle.
#[async_trait]
pub trait GenerationBehavior: Send + Sync {
    fn kind(&self) -> BehaviorKind;

    async fn run(&self, ctx: &BehaviorContext) -> Result<()>;
}

/// Select the strategy for a project. Called once at actor startup from
/// persisted state.
pub fn select_behavior(kind: BehaviorKind) -> Arc<dyn GenerationBehavior> {
    match kind {
        BehaviorKind::Phasic => Arc::new(PhasicBehavior::new()),
        BehaviorKind::Agentic => Arc::new(AgenticBehavior::new()),
    }
}
