//! Agentic generation: the reactive tool-calling loop.
//!
//! One bounded outer loop repeats "run one builder pass" until the
//! MVP-completion flag is set and the input queue is empty. A pass drains
//! queued user inputs (texts and images) into one synthetic message,
//! loads the running history, and runs an autonomous tool-calling chain
//! bounded by a maximum depth. A completion hook syncs every assistant
//! message and every completed tool call into the conversation tables and
//! checks the compactor every K tool calls. New user input arriving
//! mid-pass makes the hook request a graceful stop: the chain ends, the
//! results already produced are kept, and the loop re-enters with the new
//! input.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{BehaviorContext, GenerationBehavior, StepError, synthesize_user_message};
use crate::dag::{BatchExecutor, HookOutcome, ToolCall, ToolCallOutcome, ToolLifecycleHooks};
use crate::errors::ToolError;
use crate::events::EngineEvent;
use crate::inference::{InferenceRequest, infer_with_retry};
use crate::state::{BehaviorKind, ConversationMessage};

/// The model marks the build complete by emitting this tag.
pub const MVP_PROMISE_TAG: &str = "<promise>MVP_COMPLETE</promise>";

const AGENTIC_INSTRUCTION: &str = "You are building the project autonomously. Use the available \
tools to create and refine files, then deploy. When the MVP fully works, output \
<promise>MVP_COMPLETE</promise>.";

pub struct AgenticBehavior;

impl AgenticBehavior {
    pub fn new() -> Self {
        Self
    }

    /// One builder pass: a tool-calling chain of bounded depth.
    async fn run_pass(&self, ctx: &BehaviorContext, hooks: &SyncHooks) -> Result<(), StepError> {
        for depth in 0..ctx.config.agentic.max_tool_depth {
            if ctx.cancel.is_raised() {
                return Err(StepError::Cancelled);
            }

            let history = ctx.conversation.lock().await.running.clone();
            let request = InferenceRequest::new("agentic_builder", history, ctx.config.model.clone())
                .with_system(AGENTIC_INSTRUCTION)
                .with_tools(ctx.registry.schemas());
            let response =
                infer_with_retry(ctx.inference.as_ref(), request, &ctx.config.retry, &ctx.cancel)
                    .await?;

            ctx.push_message(response.message.clone()).await?;

            if response.message.content.contains(MVP_PROMISE_TAG) {
                let project_name = ctx
                    .commit(|state| {
                        state.mvp_reached = true;
                        state.project_name.clone()
                    })
                    .await?;
                info!(target: "crucible::agentic", project = %project_name, "MVP completion flagged");
                ctx.events.publish(EngineEvent::MvpCompleted { project_name });
            }

            if response.tool_calls.is_empty() {
                return Ok(());
            }

            let calls: Vec<ToolCall> = response.tool_calls.into_iter().map(ToolCall::from).collect();
            let executor = BatchExecutor::new(ctx.registry.as_ref(), &ctx.events, ctx.cancel.clone());
            let batch = match executor.execute(calls, hooks).await {
                Ok(batch) => batch,
                Err(ToolError::Cancelled) => return Err(StepError::Cancelled),
                Err(e) => return Err(StepError::Failed(e.into())),
            };

            if hooks.take_compaction_due() {
                let outcome = {
                    let mut conversation = ctx.conversation.lock().await;
                    ctx.compactor
                        .compact_if_needed(ctx.inference.as_ref(), &mut conversation, &ctx.events)
                        .await
                };
                if outcome.is_some() {
                    let _ = ctx.save_conversation().await;
                }
            }

            if batch.stopped_early {
                debug!(target: "crucible::agentic", depth,
                    "chain stopped for new user input, partial results kept");
                return Ok(());
            }
        }
        warn!(target: "crucible::agentic", "builder pass hit maximum tool depth");
        Ok(())
    }
}

impl Default for AgenticBehavior {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationBehavior for AgenticBehavior {
    fn kind(&self) -> BehaviorKind {
        BehaviorKind::Agentic
    }

    async fn run(&self, ctx: &BehaviorContext) -> anyhow::Result<()> {
        let hooks = SyncHooks::new(ctx.clone());

        for pass in 0..ctx.config.agentic.max_passes {
            if ctx.cancel.is_raised() {
                break;
            }
            let snapshot = ctx.snapshot().await;
            if snapshot.mvp_reached && snapshot.pending_inputs.is_empty() {
                break;
            }

            ctx.input_signal.clear();
            let inputs = ctx.commit(|state| state.drain_inputs()).await?;
            if !inputs.is_empty() {
                ctx.push_message(synthesize_user_message(&inputs)).await?;
            }

            debug!(target: "crucible::agentic", pass, "starting builder pass");
            match self.run_pass(ctx, &hooks).await {
                Ok(()) => {}
                Err(StepError::Cancelled) => break,
                Err(StepError::Failed(e)) => {
                    // Caught at the pass boundary; the loop self-heals on
                    // its next iteration.
                    warn!(target: "crucible::agentic", pass, error = %e, "builder pass failed");
                    ctx.events.publish(EngineEvent::GenerationError {
                        message: format!("builder pass: {e:#}"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Completion hook: syncs finished tool calls into the conversation,
/// counts them toward the compaction check, and turns mid-pass user input
/// into a cooperative stop request.
struct SyncHooks {
    ctx: BehaviorContext,
    completed_calls: AtomicUsize,
    compaction_due: AtomicBool,
}

impl SyncHooks {
    fn new(ctx: BehaviorContext) -> Self {
        Self {
            ctx,
            completed_calls: AtomicUsize::new(0),
            compaction_due: AtomicBool::new(false),
        }
    }

    fn take_compaction_due(&self) -> bool {
        self.compaction_due.swap(false, Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolLifecycleHooks for SyncHooks {
    async fn after_call(&self, call: &ToolCall, outcome: &ToolCallOutcome) -> HookOutcome {
        let content = match outcome {
            ToolCallOutcome::Success { result, .. } => result.to_string(),
            ToolCallOutcome::Failure { message, .. } => format!("error: {message}"),
        };
        if let Err(e) = self
            .ctx
            .push_message(ConversationMessage::tool_result(call.id.clone(), content))
            .await
        {
            warn!(target: "crucible::agentic", call_id = %call.id, error = %e,
                "failed to sync tool result");
        }

        let completed = self.completed_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let interval = self.ctx.config.agentic.compaction_check_interval;
        if completed % interval == 0 {
            self.compaction_due.store(true, Ordering::SeqCst);
        }

        if self.ctx.input_signal.is_raised() {
            debug!(target: "crucible::agentic", call_id = %call.id,
                "new user input mid-pass, requesting stop");
            return HookOutcome::Stop;
        }
        HookOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::Compactor;
    use crate::config::EngineConfig;
    use crate::control::StopSignal;
    use crate::dag::{ResourceAccess, ToolDefinition, ToolRegistry};
    use crate::deploy::{DeployConfig, DeploymentManager};
    use crate::errors::{InferenceError, SandboxError};
    use crate::events::EventBus;
    use crate::inference::{InferenceResponse, InferenceService, ToolCallRequest};
    use crate::sandbox::{
        AnalysisIssue, CommandResult, CreatedInstance, InstanceHealth, InstanceStatus, SandboxFile,
        SandboxService,
    };
    use crate::state::{
        ConversationState, JsonProjectStore, ProjectState, Role, UserInput,
    };
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct ScriptedBuilder {
        responses: StdMutex<Vec<InferenceResponse>>,
        builder_calls: AtomicUsize,
    }

    impl ScriptedBuilder {
        fn new(responses: Vec<InferenceResponse>) -> Self {
            Self {
                responses: StdMutex::new(responses),
                builder_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl InferenceService for ScriptedBuilder {
        async fn infer(
            &self,
            request: InferenceRequest,
        ) -> Result<InferenceResponse, InferenceError> {
            match request.action.as_str() {
                "agentic_builder" => {
                    self.builder_calls.fetch_add(1, Ordering::SeqCst);
                    let mut responses = self.responses.lock().unwrap();
                    if responses.is_empty() {
                        Ok(InferenceResponse {
                            message: ConversationMessage::assistant(MVP_PROMISE_TAG),
                            tool_calls: Vec::new(),
                        })
                    } else {
                        Ok(responses.remove(0))
                    }
                }
                "conversation_compaction" => Ok(InferenceResponse {
                    message: ConversationMessage::assistant("summary of earlier work"),
                    tool_calls: Vec::new(),
                }),
                other => panic!("unexpected action: {other}"),
            }
        }
    }

    struct OkSandbox;

    #[async_trait]
    impl SandboxService for OkSandbox {
        async fn create_instance(
            &self,
            _: &[SandboxFile],
            _: &str,
            _: Option<&str>,
            _: &HashMap<String, String>,
        ) -> Result<CreatedInstance, SandboxError> {
            Ok(CreatedInstance {
                instance_id: "i-1".into(),
                preview_url: "https://demo.preview.test".into(),
            })
        }
        async fn write_files(&self, _: &str, _: &[SandboxFile]) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn execute_commands(
            &self,
            _: &str,
            _: &[String],
            _: Duration,
        ) -> Result<Vec<CommandResult>, SandboxError> {
            Ok(Vec::new())
        }
        async fn get_instance_status(&self, _: &str) -> Result<InstanceStatus, SandboxError> {
            Ok(InstanceStatus {
                health: InstanceHealth::Healthy,
                detail: None,
            })
        }
        async fn get_logs(&self, _: &str) -> Result<String, SandboxError> {
            Ok(String::new())
        }
        async fn run_static_analysis(
            &self,
            _: &str,
            _: &[String],
        ) -> Result<Vec<AnalysisIssue>, SandboxError> {
            Ok(Vec::new())
        }
    }

    fn tool_call(id: &str, name: &str, depends_on: Vec<String>) -> ToolCallRequest {
        ToolCallRequest {
            id: id.into(),
            name: name.into(),
            arguments: "{}".into(),
            depends_on,
            conflicts_with: Vec::new(),
        }
    }

    fn response(content: &str, tool_calls: Vec<ToolCallRequest>) -> InferenceResponse {
        InferenceResponse {
            message: ConversationMessage::assistant(content),
            tool_calls,
        }
    }

    fn test_ctx(
        inference: Arc<dyn InferenceService>,
        registry: ToolRegistry,
        state: Arc<Mutex<ProjectState>>,
        input_signal: StopSignal,
        store_dir: &std::path::Path,
    ) -> BehaviorContext {
        let mut config = EngineConfig::default();
        config.deploy = DeployConfig {
            attempt_timeout: Duration::from_millis(500),
            master_timeout: Duration::from_secs(2),
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(2),
            failures_per_reset: 3,
            health_interval: Duration::from_millis(500),
            command_timeout: Duration::from_millis(500),
            init_command: None,
            env_vars: HashMap::new(),
        };
        config.retry.base_delay = Duration::from_millis(1);
        config.agentic.max_passes = 8;
        config.agentic.max_tool_depth = 8;

        let sandbox: Arc<dyn SandboxService> = Arc::new(OkSandbox);
        let events = EventBus::new();
        let deploy = Arc::new(DeploymentManager::new(
            sandbox.clone(),
            config.deploy.clone(),
            events.clone(),
        ));
        BehaviorContext {
            compactor: Compactor::new(config.compaction.clone(), config.model.clone()),
            config,
            inference,
            sandbox,
            store: Arc::new(JsonProjectStore::new(store_dir)),
            events,
            deploy,
            registry: Arc::new(registry),
            state,
            conversation: Arc::new(Mutex::new(ConversationState::default())),
            cancel: StopSignal::new(),
            input_signal,
        }
    }

    fn echo_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(ToolDefinition::new(
            "echo",
            "Echo",
            json!({}),
            |_| ResourceAccess::default(),
            |args| async move { Ok(args) },
        ));
        registry
    }

    fn agentic_state() -> Arc<Mutex<ProjectState>> {
        Arc::new(Mutex::new(ProjectState::new(
            "demo",
            "build a todo app",
            BehaviorKind::Agentic,
        )))
    }

    #[tokio::test]
    async fn test_loop_runs_until_mvp_and_syncs_tool_calls() {
        let dir = tempfile::tempdir().unwrap();
        let inference = Arc::new(ScriptedBuilder::new(vec![
            response(
                "building",
                vec![
                    tool_call("c1", "echo", vec![]),
                    tool_call("c2", "echo", vec![]),
                ],
            ),
            response(MVP_PROMISE_TAG, vec![]),
        ]));
        let ctx = test_ctx(
            inference.clone(),
            echo_registry(),
            agentic_state(),
            StopSignal::new(),
            dir.path(),
        );

        AgenticBehavior::new().run(&ctx).await.unwrap();

        let state = ctx.snapshot().await;
        assert!(state.mvp_reached);

        let conversation = ctx.conversation.lock().await;
        let tool_messages = conversation
            .running
            .iter()
            .filter(|m| m.role == Role::Tool)
            .count();
        assert_eq!(tool_messages, 2, "every completed tool call synced");
        assert!(
            conversation
                .running
                .iter()
                .any(|m| m.content.contains(MVP_PROMISE_TAG))
        );
        ctx.deploy.shutdown().await;
    }

    #[tokio::test]
    async fn test_mid_pass_input_stops_chain_and_reenters() {
        let dir = tempfile::tempdir().unwrap();
        // first chain: two dependent calls; the first one simulates user
        // input arriving mid-pass, so the second group must never run
        let inference = Arc::new(ScriptedBuilder::new(vec![
            response(
                "building",
                vec![
                    tool_call("c1", "nudge", vec![]),
                    tool_call("c2", "echo", vec!["c1".into()]),
                ],
            ),
            response(MVP_PROMISE_TAG, vec![]),
        ]));

        let state = agentic_state();
        let input_signal = StopSignal::new();
        let mut registry = echo_registry();
        let state_for_tool = Arc::clone(&state);
        let signal_for_tool = input_signal.clone();
        registry.register(ToolDefinition::new(
            "nudge",
            "Simulates user input arriving while the chain runs",
            json!({}),
            |_| ResourceAccess::default(),
            move |_args| {
                let state = Arc::clone(&state_for_tool);
                let signal = signal_for_tool.clone();
                async move {
                    state.lock().await.pending_inputs.push(UserInput::text("make it blue"));
                    signal.raise();
                    Ok(json!({"queued": true}))
                }
            },
        ));

        let ctx = test_ctx(inference.clone(), registry, state, input_signal, dir.path());
        AgenticBehavior::new().run(&ctx).await.unwrap();

        let state = ctx.snapshot().await;
        assert!(state.mvp_reached);
        assert!(state.pending_inputs.is_empty(), "queued input was drained");

        let conversation = ctx.conversation.lock().await;
        let tool_messages: Vec<_> = conversation
            .running
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(tool_messages.len(), 1, "second group never ran after stop");
        assert!(
            conversation
                .running
                .iter()
                .any(|m| m.role == Role::User && m.content.contains("make it blue")),
            "drained input became a synthetic user message"
        );
        ctx.deploy.shutdown().await;
    }

    #[tokio::test]
    async fn test_compactor_checked_every_k_tool_calls() {
        let dir = tempfile::tempdir().unwrap();
        let inference = Arc::new(ScriptedBuilder::new(vec![
            response("building", vec![tool_call("c1", "echo", vec![])]),
            response(MVP_PROMISE_TAG, vec![]),
        ]));
        let state = agentic_state();
        let ctx = {
            let mut ctx = test_ctx(
                inference.clone(),
                echo_registry(),
                state,
                StopSignal::new(),
                dir.path(),
            );
            ctx.config.agentic.compaction_check_interval = 1;
            ctx
        };

        // exceed the turn threshold so the checked compactor actually runs
        {
            let mut conversation = ctx.conversation.lock().await;
            for i in 0..45 {
                conversation.upsert(ConversationMessage::user(format!("request {i}")));
                conversation.upsert(ConversationMessage::assistant(format!("response {i}")));
            }
        }

        AgenticBehavior::new().run(&ctx).await.unwrap();

        let conversation = ctx.conversation.lock().await;
        assert!(
            conversation.running.iter().any(|m| m.role == Role::Summary),
            "compaction produced a summary message"
        );
        ctx.deploy.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_when_mvp_reached_and_queue_empty() {
        let dir = tempfile::tempdir().unwrap();
        let inference = Arc::new(ScriptedBuilder::new(vec![]));
        let state = agentic_state();
        state.lock().await.mvp_reached = true;
        let ctx = test_ctx(
            inference.clone(),
            echo_registry(),
            state,
            StopSignal::new(),
            dir.path(),
        );

        AgenticBehavior::new().run(&ctx).await.unwrap();
        assert_eq!(inference.builder_calls.load(Ordering::SeqCst), 0);
        ctx.deploy.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_ends_run_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let inference = Arc::new(ScriptedBuilder::new(vec![]));
        let ctx = test_ctx(
            inference.clone(),
            echo_registry(),
            agentic_state(),
            StopSignal::new(),
            dir.path(),
        );
        ctx.cancel.raise();

        AgenticBehavior::new().run(&ctx).await.unwrap();
        assert_eq!(inference.builder_calls.load(Ordering::SeqCst), 0);
        ctx.deploy.shutdown().await;
    }
}
