//! Group-ordered execution of a planned tool batch.
//!
//! Groups run strictly in order; the calls inside one group run
//! concurrently. Per-call failures become structured results so sibling
//! calls are unaffected — cancellation is the sole error propagated
//! upward, and it stops the whole batch. Lifecycle hooks wrap every call;
//! the completion hook can ask for a graceful stop (new user input
//! arrived), which ends the batch after the current group while keeping
//! every result already produced.

use std::time::Instant;

use futures::future::join_all;
use serde_json::Value;
use tracing::debug;

use super::builder::{CallGraphBuilder, ToolCall};
use super::registry::ToolRegistry;
use super::scheduler::plan;
use crate::control::StopSignal;
use crate::errors::ToolError;
use crate::events::{EngineEvent, EventBus};

/// Verdict of the completion hook after each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Continue,
    /// End the batch gracefully after the current group.
    Stop,
}

/// Lifecycle hooks wrapped around every call in a batch.
#[async_trait::async_trait]
pub trait ToolLifecycleHooks: Send + Sync {
    async fn before_call(&self, _call: &ToolCall) {}

    /// Runs after every completed call, success or failure. Returning
    /// `Stop` is a cooperative signal — never an exception across the
    /// executor boundary.
    async fn after_call(&self, _call: &ToolCall, _outcome: &ToolCallOutcome) -> HookOutcome {
        HookOutcome::Continue
    }
}

/// Hooks that do nothing; used for plain batches.
pub struct NoopHooks;

#[async_trait::async_trait]
impl ToolLifecycleHooks for NoopHooks {}

/// Structured per-call result.
#[derive(Debug, Clone)]
pub enum ToolCallOutcome {
    Success {
        call_id: String,
        tool: String,
        result: Value,
        duration_ms: u64,
    },
    Failure {
        call_id: String,
        tool: String,
        message: String,
    },
}

impl ToolCallOutcome {
    pub fn call_id(&self) -> &str {
        match self {
            Self::Success { call_id, .. } | Self::Failure { call_id, .. } => call_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// What a batch produced, including partial results of a stopped batch.
#[derive(Debug)]
pub struct BatchResult {
    pub outcomes: Vec<ToolCallOutcome>,
    /// The completion hook requested a stop before all groups ran.
    pub stopped_early: bool,
    pub group_count: usize,
}

/// Executes tool batches against a registry.
pub struct BatchExecutor<'a> {
    registry: &'a ToolRegistry,
    events: &'a EventBus,
    cancel: StopSignal,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(registry: &'a ToolRegistry, events: &'a EventBus, cancel: StopSignal) -> Self {
        Self {
            registry,
            events,
            cancel,
        }
    }

    /// Plan and run one batch. The only error returned is cancellation;
    /// everything else is captured per call.
    pub async fn execute(
        &self,
        calls: Vec<ToolCall>,
        hooks: &dyn ToolLifecycleHooks,
    ) -> Result<BatchResult, ToolError> {
        let graph = CallGraphBuilder::new(self.registry).build(calls);
        let execution_plan = plan(&graph);
        let group_count = execution_plan.group_count();
        debug!(target: "crucible::dag", calls = graph.len(), groups = group_count, "executing tool batch");

        let mut outcomes: Vec<ToolCallOutcome> = Vec::with_capacity(graph.len());
        let mut stopped_early = false;

        'groups: for group in &execution_plan.groups {
            if self.cancel.is_raised() {
                return Err(ToolError::Cancelled);
            }

            let futures = group.iter().map(|&index| {
                let call = graph.call(index);
                self.run_one(call, hooks)
            });
            let group_outcomes = join_all(futures).await;

            for result in group_outcomes {
                let (outcome, hook_outcome) = result?;
                outcomes.push(outcome);
                if hook_outcome == HookOutcome::Stop {
                    stopped_early = true;
                }
            }

            if stopped_early {
                debug!(target: "crucible::dag", "completion hook requested stop, ending batch");
                break 'groups;
            }
        }

        Ok(BatchResult {
            outcomes,
            stopped_early,
            group_count,
        })
    }

    async fn run_one(
        &self,
        call: &ToolCall,
        hooks: &dyn ToolLifecycleHooks,
    ) -> Result<(ToolCallOutcome, HookOutcome), ToolError> {
        hooks.before_call(call).await;
        self.events.publish(EngineEvent::ToolCallStarted {
            call_id: call.id.clone(),
            tool: call.name.clone(),
        });

        let started = Instant::now();
        let outcome = match self.invoke(call).await {
            Ok(result) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.events.publish(EngineEvent::ToolCallSucceeded {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    duration_ms,
                });
                ToolCallOutcome::Success {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    result,
                    duration_ms,
                }
            }
            // Cancellation is the sole error that crosses the batch
            // boundary.
            Err(ToolError::Cancelled) => return Err(ToolError::Cancelled),
            Err(e) => {
                self.events.publish(EngineEvent::ToolCallFailed {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    message: e.to_string(),
                });
                ToolCallOutcome::Failure {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    message: e.to_string(),
                }
            }
        };

        let hook_outcome = hooks.after_call(call, &outcome).await;
        Ok((outcome, hook_outcome))
    }

    async fn invoke(&self, call: &ToolCall) -> Result<Value, ToolError> {
        let definition = self
            .registry
            .get(&call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;
        definition.invoke(call.arguments.clone()).await
    }
}
