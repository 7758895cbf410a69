//! Tool definitions and the registry the planner consults.
//!
//! A tool declares its resource access as a function of its parsed
//! arguments; the planner uses the declaration to order conflicting calls
//! and the executor invokes the handler.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::errors::ToolError;
use crate::inference::ToolSchema;

/// Declared read/write sets over named resources (usually file paths).
#[derive(Debug, Clone, Default)]
pub struct ResourceAccess {
    pub reads: Vec<String>,
    pub writes: Vec<String>,
}

impl ResourceAccess {
    pub fn reads(reads: Vec<String>) -> Self {
        Self {
            reads,
            writes: Vec::new(),
        }
    }

    pub fn writes(writes: Vec<String>) -> Self {
        Self {
            reads: Vec::new(),
            writes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    /// Write/write or read/write overlap in either direction forces
    /// sequential ordering.
    pub fn conflicts_with(&self, other: &ResourceAccess) -> bool {
        overlaps(&self.writes, &other.writes)
            || overlaps(&self.writes, &other.reads)
            || overlaps(&self.reads, &other.writes)
    }
}

fn overlaps(a: &[String], b: &[String]) -> bool {
    a.iter().any(|x| b.contains(x))
}

type AccessFn = dyn Fn(&Value) -> ResourceAccess + Send + Sync;
type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>>;
type HandlerFn = dyn Fn(Value) -> HandlerFuture + Send + Sync;

/// A registered tool: schema for the model, access declaration for the
/// planner, handler for the executor.
pub struct ToolDefinition {
    name: String,
    description: String,
    parameters: Value,
    access: Box<AccessFn>,
    handler: Box<HandlerFn>,
}

impl ToolDefinition {
    pub fn new<A, H, F>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        access: A,
        handler: H,
    ) -> Self
    where
        A: Fn(&Value) -> ResourceAccess + Send + Sync + 'static,
        H: Fn(Value) -> F + Send + Sync + 'static,
        F: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            access: Box::new(access),
            handler: Box::new(move |args| Box::pin(handler(args))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared_access(&self, arguments: &Value) -> ResourceAccess {
        (self.access)(arguments)
    }

    pub async fn invoke(&self, arguments: Value) -> Result<Value, ToolError> {
        (self.handler)(arguments).await
    }

    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// Name-keyed set of tool definitions.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDefinition>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: ToolDefinition) {
        self.tools.insert(definition.name.clone(), Arc::new(definition));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolDefinition>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas for every registered tool, for inclusion in agentic
    /// inference requests.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|t| t.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}
