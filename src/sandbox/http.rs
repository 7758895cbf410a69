//! HTTP client for the sandbox service.
//!
//! Thin request/response adapter; transport failures map onto the
//! `SandboxError` signatures the deployment manager's reset policy keys
//! on (connect/timeout → lost connection, 404 → instance gone).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    AnalysisIssue, CommandResult, CreatedInstance, InstanceStatus, SandboxError, SandboxFile,
    SandboxService,
};

pub struct HttpSandboxClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpSandboxClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        instance_id: Option<&str>,
    ) -> Result<T, SandboxError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SandboxError::InstanceNotFound {
                instance_id: instance_id.unwrap_or("unknown").to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SandboxError::Request(format!("{status}: {body}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| SandboxError::Request(format!("invalid response body: {e}")))
    }
}

fn map_transport_error(e: reqwest::Error) -> SandboxError {
    if e.is_connect() || e.is_timeout() {
        SandboxError::ConnectionLost(e.to_string())
    } else {
        SandboxError::Request(e.to_string())
    }
}

#[derive(Serialize)]
struct CreateInstanceBody<'a> {
    files: &'a [SandboxFile],
    project_name: &'a str,
    init_command: Option<&'a str>,
    env_vars: &'a HashMap<String, String>,
}

#[derive(Serialize)]
struct WriteFilesBody<'a> {
    files: &'a [SandboxFile],
}

#[derive(Serialize)]
struct ExecuteBody<'a> {
    commands: &'a [String],
    timeout_secs: u64,
}

#[derive(Serialize)]
struct AnalyzeBody<'a> {
    files: &'a [String],
}

#[derive(Deserialize)]
struct LogsResponse {
    logs: String,
}

#[async_trait]
impl SandboxService for HttpSandboxClient {
    async fn create_instance(
        &self,
        files: &[SandboxFile],
        project_name: &str,
        init_command: Option<&str>,
        env_vars: &HashMap<String, String>,
    ) -> Result<CreatedInstance, SandboxError> {
        let response = self
            .http
            .post(self.url("/instances"))
            .json(&CreateInstanceBody {
                files,
                project_name,
                init_command,
                env_vars,
            })
            .send()
            .await
            .map_err(map_transport_error)?;
        Self::decode(response, None).await
    }

    async fn write_files(&self, instance_id: &str, files: &[SandboxFile]) -> Result<(), SandboxError> {
        let response = self
            .http
            .post(self.url(&format!("/instances/{instance_id}/files")))
            .json(&WriteFilesBody { files })
            .send()
            .await
            .map_err(map_transport_error)?;
        Self::decode::<serde_json::Value>(response, Some(instance_id)).await?;
        Ok(())
    }

    async fn execute_commands(
        &self,
        instance_id: &str,
        commands: &[String],
        timeout: Duration,
    ) -> Result<Vec<CommandResult>, SandboxError> {
        let response = self
            .http
            .post(self.url(&format!("/instances/{instance_id}/exec")))
            .json(&ExecuteBody {
                commands,
                timeout_secs: timeout.as_secs(),
            })
            .timeout(timeout + Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SandboxError::CommandTimeout {
                        seconds: timeout.as_secs(),
                    }
                } else {
                    map_transport_error(e)
                }
            })?;
        Self::decode(response, Some(instance_id)).await
    }

    async fn get_instance_status(&self, instance_id: &str) -> Result<InstanceStatus, SandboxError> {
        let response = self
            .http
            .get(self.url(&format!("/instances/{instance_id}/status")))
            .send()
            .await
            .map_err(map_transport_error)?;
        Self::decode(response, Some(instance_id)).await
    }

    async fn get_logs(&self, instance_id: &str) -> Result<String, SandboxError> {
        let response = self
            .http
            .get(self.url(&format!("/instances/{instance_id}/logs")))
            .send()
            .await
            .map_err(map_transport_error)?;
        let body: LogsResponse = Self::decode(response, Some(instance_id)).await?;
        Ok(body.logs)
    }

    async fn run_static_analysis(
        &self,
        instance_id: &str,
        files: &[String],
    ) -> Result<Vec<AnalysisIssue>, SandboxError> {
        let response = self
            .http
            .post(self.url(&format!("/instances/{instance_id}/analyze")))
            .json(&AnalyzeBody { files })
            .send()
            .await
            .map_err(map_transport_error)?;
        Self::decode(response, Some(instance_id)).await
    }
}
