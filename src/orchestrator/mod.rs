//! The project orchestrator: single-owner actor over `ProjectState`.
//!
//! One orchestrator exists per project. It holds the only handles to the
//! project's state and conversation, selects the generation strategy once
//! at startup from persisted state, and exposes the external triggers:
//! generate, resume, user message, cancel. A generation run executes on
//! one tracked task — a second trigger while one is in flight joins it
//! instead of starting a duplicate. User input arriving mid-run is queued
//! onto the state and signalled cooperatively; the running behavior
//! observes the signal after each unit of work.
//!
//! Every state mutation goes through a commit helper that persists the
//! whole record, so a restart resumes from exactly what was last
//! committed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::behavior::{BehaviorContext, GenerationBehavior, select_behavior};
use crate::compaction::Compactor;
use crate::config::EngineConfig;
use crate::control::StopSignal;
use crate::dag::ToolRegistry;
use crate::deploy::DeploymentManager;
use crate::events::{EngineEvent, EventBus};
use crate::inference::InferenceService;
use crate::sandbox::SandboxService;
use crate::state::{
    BehaviorKind, ConversationState, ProjectState, ProjectStore, STATE_SCHEMA_VERSION, UserInput,
};

/// External collaborators handed to the orchestrator at startup.
pub struct OrchestratorDeps {
    pub inference: Arc<dyn InferenceService>,
    pub sandbox: Arc<dyn SandboxService>,
    pub store: Arc<dyn ProjectStore>,
    pub registry: Arc<ToolRegistry>,
}

pub struct ProjectOrchestrator {
    ctx: BehaviorContext,
    behavior: Arc<dyn GenerationBehavior>,
    /// The in-flight generation run; a second trigger joins it.
    current_run: Mutex<Option<JoinHandle<()>>>,
}

impl ProjectOrchestrator {
    /// Initialize the actor for a project: load persisted state with
    /// best-effort recovery (corrupt or missing records fall back to
    /// defaults) and select the behavior from the persisted kind.
    pub async fn init(
        project_name: &str,
        query: &str,
        default_kind: BehaviorKind,
        config: EngineConfig,
        deps: OrchestratorDeps,
    ) -> Result<Arc<Self>> {
        let events = EventBus::new();

        let state = match deps.store.load_state(project_name).await? {
            Some(mut state) => {
                migrate_state(&mut state);
                info!(target: "crucible::orchestrator", project = project_name,
                    phases = state.phases.len(), behavior = ?state.behavior, "resuming project");
                state
            }
            None => {
                info!(target: "crucible::orchestrator", project = project_name,
                    behavior = ?default_kind, "initializing project");
                ProjectState::new(project_name, query, default_kind)
            }
        };
        deps.store.save_state(&state).await?;

        let conversation = deps
            .store
            .load_conversation(&state.conversation_id)
            .await
            .unwrap_or_else(|e| {
                warn!(target: "crucible::orchestrator", error = %e,
                    "conversation load failed, starting empty");
                ConversationState::default()
            });

        let kind = state.behavior;
        let deploy = Arc::new(
            DeploymentManager::new(
                Arc::clone(&deps.sandbox),
                config.deploy.clone(),
                events.clone(),
            )
            .with_validator(crate::bootstrap::SetupCommandValidator::with_cap(
                config.bootstrap_cap,
            )),
        );
        let ctx = BehaviorContext {
            compactor: Compactor::new(config.compaction.clone(), config.model.clone()),
            config,
            inference: deps.inference,
            sandbox: deps.sandbox,
            store: deps.store,
            events,
            deploy,
            registry: deps.registry,
            state: Arc::new(Mutex::new(state)),
            conversation: Arc::new(Mutex::new(conversation)),
            cancel: StopSignal::new(),
            input_signal: StopSignal::new(),
        };

        Ok(Arc::new(Self {
            ctx,
            behavior: select_behavior(kind),
            current_run: Mutex::new(None),
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.ctx.events.subscribe()
    }

    pub async fn snapshot(&self) -> ProjectState {
        self.ctx.snapshot().await
    }

    /// Start a generation run, or join the one already in flight.
    pub async fn generate(&self) {
        self.spawn_if_idle().await;
    }

    /// Resume after a restart. The behavior inspects persisted phases to
    /// pick its entry point, so this is the same trigger as `generate`.
    pub async fn resume(&self) {
        self.spawn_if_idle().await;
    }

    /// Queue user input. A running behavior observes the signal after its
    /// current unit of work; an idle machine is re-entered immediately.
    pub async fn push_user_input(&self, text: impl Into<String>, images: Vec<String>) -> Result<()> {
        let mut input = UserInput::text(text);
        input.images = images;
        self.ctx
            .commit(|state| state.pending_inputs.push(input))
            .await?;
        self.ctx.input_signal.raise();
        self.spawn_if_idle().await;
        Ok(())
    }

    /// Cooperatively cancel the in-flight run. Partial results stay.
    pub async fn cancel_run(&self) {
        self.ctx.cancel.raise();
    }

    /// Wait for the current run (if any) to go idle.
    pub async fn wait_idle(&self) {
        loop {
            let finished = match self.current_run.lock().await.as_ref() {
                None => true,
                Some(handle) => handle.is_finished(),
            };
            if finished {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Cancel any run, stop the health loop, and wait out the teardown.
    pub async fn shutdown(&self) {
        self.cancel_run().await;
        self.wait_idle().await;
        self.ctx.deploy.shutdown().await;
    }

    async fn spawn_if_idle(&self) {
        let mut current = self.current_run.lock().await;
        if let Some(handle) = current.as_ref() {
            if !handle.is_finished() {
                debug!(target: "crucible::orchestrator", "generation in progress, joining");
                return;
            }
        }

        self.ctx.cancel.clear();
        let ctx = self.ctx.clone();
        let behavior = Arc::clone(&self.behavior);
        *current = Some(tokio::spawn(async move {
            if let Err(e) = behavior.run(&ctx).await {
                warn!(target: "crucible::orchestrator", error = %e, "generation run failed");
                ctx.events.publish(EngineEvent::GenerationError {
                    message: format!("{e:#}"),
                });
            }
        }));
    }
}

/// Best-effort migration of older persisted layouts. Unknown versions are
/// stamped rather than rejected; missing fields already deserialize to
/// their defaults.
fn migrate_state(state: &mut ProjectState) {
    if state.schema_version != STATE_SCHEMA_VERSION {
        warn!(target: "crucible::orchestrator", from = state.schema_version,
            to = STATE_SCHEMA_VERSION, "migrating persisted state");
        state.schema_version = STATE_SCHEMA_VERSION;
    }
}
