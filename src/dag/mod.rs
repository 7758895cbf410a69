//! Tool execution planner: dependency-aware parallel tool invocation.
//!
//! A batch of tool calls requested by the model is turned into a
//! dependency graph (declared resource access plus explicit
//! declarations), layered into ordered parallel groups, and executed
//! group by group with per-call failure isolation.
//!
//! ## Components
//!
//! 1. **Registry** - tool definitions: schema, resource-access function,
//!    handler
//! 2. **Builder** - conflict-graph construction over one batch
//! 3. **Scheduler** - Kahn-style layering with a cycle fallback
//! 4. **Executor** - ordered group execution with lifecycle hooks

mod builder;
mod executor;
mod registry;
mod scheduler;

pub use builder::{CallGraph, CallGraphBuilder, CallIndex, ToolCall};
pub use executor::{
    BatchExecutor, BatchResult, HookOutcome, NoopHooks, ToolCallOutcome, ToolLifecycleHooks,
};
pub use registry::{ResourceAccess, ToolDefinition, ToolRegistry};
pub use scheduler::{ExecutionPlan, plan};
