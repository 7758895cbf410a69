//! Conflict-graph construction over a batch of tool calls.
//!
//! The builder parses each call's arguments, asks the registered tool
//! definition for its declared resource access, and adds an edge from an
//! earlier call to a later one whenever their accesses conflict or the
//! later call explicitly declares a dependency. Malformed arguments and
//! unknown tools degrade to an empty access declaration — never a
//! failure.

use serde_json::Value;
use tracing::warn;

use super::registry::{ResourceAccess, ToolRegistry};
use crate::inference::ToolCallRequest;

/// Index into the batch.
pub type CallIndex = usize;

/// One call in a planned batch.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Parsed arguments; `Null` when parsing failed.
    pub arguments: Value,
    pub depends_on: Vec<String>,
    pub conflicts_with: Vec<String>,
}

impl From<ToolCallRequest> for ToolCall {
    fn from(request: ToolCallRequest) -> Self {
        let arguments = match serde_json::from_str(&request.arguments) {
            Ok(value) => value,
            Err(e) => {
                warn!(target: "crucible::dag", call_id = %request.id, tool = %request.name,
                    error = %e, "malformed tool arguments, treating as empty");
                Value::Null
            }
        };
        Self {
            id: request.id,
            name: request.name,
            arguments,
            depends_on: request.depends_on,
            conflicts_with: request.conflicts_with,
        }
    }
}

/// A batch of calls plus the dependency edges between them.
#[derive(Debug)]
pub struct CallGraph {
    calls: Vec<ToolCall>,
    /// dependencies\[i\] lists the earlier calls that must be scheduled
    /// before call i.
    dependencies: Vec<Vec<CallIndex>>,
}

impl CallGraph {
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn call(&self, index: CallIndex) -> &ToolCall {
        &self.calls[index]
    }

    pub fn calls(&self) -> &[ToolCall] {
        &self.calls
    }

    pub fn dependencies(&self, index: CallIndex) -> &[CallIndex] {
        &self.dependencies[index]
    }

    pub fn into_calls(self) -> Vec<ToolCall> {
        self.calls
    }
}

/// Builds the conflict graph for a batch against a registry.
pub struct CallGraphBuilder<'r> {
    registry: &'r ToolRegistry,
}

impl<'r> CallGraphBuilder<'r> {
    pub fn new(registry: &'r ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn build(&self, calls: Vec<ToolCall>) -> CallGraph {
        let access: Vec<ResourceAccess> = calls.iter().map(|c| self.declared_access(c)).collect();

        let mut dependencies: Vec<Vec<CallIndex>> = vec![Vec::new(); calls.len()];
        for later in 0..calls.len() {
            for earlier in 0..later {
                if access[later].conflicts_with(&access[earlier])
                    || declares_edge(&calls[later], &calls[earlier])
                {
                    dependencies[later].push(earlier);
                }
            }
        }

        CallGraph { calls, dependencies }
    }

    fn declared_access(&self, call: &ToolCall) -> ResourceAccess {
        let Some(definition) = self.registry.get(&call.name) else {
            warn!(target: "crucible::dag", call_id = %call.id, tool = %call.name,
                "unknown tool, treating as no declared resources");
            return ResourceAccess::default();
        };
        if call.arguments.is_null() {
            // Parse already failed and was logged; no resources declared.
            return ResourceAccess::default();
        }
        definition.declared_access(&call.arguments)
    }
}

/// An explicit dependency or conflict declaration from the later call
/// naming the earlier one.
fn declares_edge(later: &ToolCall, earlier: &ToolCall) -> bool {
    later.depends_on.iter().any(|id| *id == earlier.id)
        || later.conflicts_with.iter().any(|id| *id == earlier.id)
}
