//! Contract with the remote sandbox execution service.
//!
//! The sandbox is where generated code is installed, executed, and
//! inspected for errors. All calls are request/response and every one of
//! them is treated as transient-failable by the deployment manager; the
//! trait keeps the manager testable without a network. `http` provides the
//! production client.

mod http;

pub use http::HttpSandboxClient;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::SandboxError;

/// A file materialized into the sandbox filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxFile {
    pub path: String,
    pub contents: String,
}

/// Result of provisioning a fresh instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedInstance {
    pub instance_id: String,
    pub preview_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub health: InstanceHealth,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Outcome of one command executed inside an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// One finding from static analysis of generated code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisIssue {
    pub file: String,
    #[serde(default)]
    pub line: Option<u32>,
    pub message: String,
}

#[async_trait]
pub trait SandboxService: Send + Sync {
    async fn create_instance(
        &self,
        files: &[SandboxFile],
        project_name: &str,
        init_command: Option<&str>,
        env_vars: &HashMap<String, String>,
    ) -> Result<CreatedInstance, SandboxError>;

    async fn write_files(&self, instance_id: &str, files: &[SandboxFile]) -> Result<(), SandboxError>;

    async fn execute_commands(
        &self,
        instance_id: &str,
        commands: &[String],
        timeout: Duration,
    ) -> Result<Vec<CommandResult>, SandboxError>;

    async fn get_instance_status(&self, instance_id: &str) -> Result<InstanceStatus, SandboxError>;

    async fn get_logs(&self, instance_id: &str) -> Result<String, SandboxError>;

    async fn run_static_analysis(
        &self,
        instance_id: &str,
        files: &[String],
    ) -> Result<Vec<AnalysisIssue>, SandboxError>;
}
