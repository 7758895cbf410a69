//! End-to-end tests over the public engine surface: orchestrator init,
//! a full phasic build against fake inference/sandbox services, event
//! emission, and resume-after-restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crucible::config::EngineConfig;
use crucible::errors::{InferenceError, SandboxError};
use crucible::events::EngineEvent;
use crucible::inference::{InferenceRequest, InferenceResponse, InferenceService};
use crucible::orchestrator::{OrchestratorDeps, ProjectOrchestrator};
use crucible::sandbox::{
    AnalysisIssue, CommandResult, CreatedInstance, InstanceHealth, InstanceStatus, SandboxFile,
    SandboxService,
};
use crucible::state::{BehaviorKind, ConversationMessage, JsonProjectStore, Phase};

/// Scripted phasic inference: a fixed list of phases, then empty.
struct PhaseScriptInference {
    phases: std::sync::Mutex<Vec<Phase>>,
    implement_calls: AtomicUsize,
}

impl PhaseScriptInference {
    fn new(phases: Vec<Phase>) -> Self {
        Self {
            phases: std::sync::Mutex::new(phases),
            implement_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl InferenceService for PhaseScriptInference {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let content = match request.action.as_str() {
            "phase_generation" => {
                let mut phases = self.phases.lock().unwrap();
                if phases.is_empty() {
                    String::new()
                } else {
                    serde_json::to_string(&phases.remove(0)).unwrap()
                }
            }
            "phase_implementation" => {
                let n = self.implement_calls.fetch_add(1, Ordering::SeqCst) + 1;
                format!(
                    r#"{{"files":[{{"path":"src/mod{n}.js","contents":"export const part = {n}","purpose":"phase output"}}],"commands":["npm add lodash"]}}"#
                )
            }
            _ => String::new(),
        };
        Ok(InferenceResponse {
            message: ConversationMessage::assistant(content),
            tool_calls: Vec::new(),
        })
    }
}

/// Sandbox double that can fail its next N calls with a transient
/// signature, then succeed; records instance creations and executed
/// commands.
struct RecordingSandbox {
    failures_left: AtomicU32,
    create_calls: AtomicUsize,
    executed: std::sync::Mutex<Vec<String>>,
}

impl RecordingSandbox {
    fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            create_calls: AtomicUsize::new(0),
            executed: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SandboxService for RecordingSandbox {
    async fn create_instance(
        &self,
        _files: &[SandboxFile],
        project_name: &str,
        _init_command: Option<&str>,
        _env_vars: &HashMap<String, String>,
    ) -> Result<CreatedInstance, SandboxError> {
        if self.take_failure() {
            return Err(SandboxError::ConnectionLost("simulated outage".into()));
        }
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CreatedInstance {
            instance_id: format!("i-{n}"),
            preview_url: format!("https://{project_name}-{n}.preview.test"),
        })
    }

    async fn write_files(&self, _: &str, _: &[SandboxFile]) -> Result<(), SandboxError> {
        if self.take_failure() {
            return Err(SandboxError::ConnectionLost("simulated outage".into()));
        }
        Ok(())
    }

    async fn execute_commands(
        &self,
        _: &str,
        commands: &[String],
        _: Duration,
    ) -> Result<Vec<CommandResult>, SandboxError> {
        self.executed.lock().unwrap().extend_from_slice(commands);
        Ok(commands
            .iter()
            .map(|c| CommandResult {
                command: c.clone(),
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
            .collect())
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

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.deploy.attempt_timeout = Duration::from_millis(500);
    config.deploy.master_timeout = Duration::from_secs(3);
    config.deploy.backoff_base = Duration::from_millis(1);
    config.deploy.backoff_cap = Duration::from_millis(5);
    config.deploy.health_interval = Duration::from_millis(500);
    config.retry.base_delay = Duration::from_millis(1);
    config
}

#[tokio::test]
async fn full_phasic_build_reaches_idle_with_deployed_files() {
    let dir = tempfile::tempdir().unwrap();
    let inference = Arc::new(PhaseScriptInference::new(vec![
        Phase::new("scaffold", "project scaffold"),
        Phase::new("core", "core features"),
    ]));
    let sandbox = Arc::new(RecordingSandbox::new(0));

    let orchestrator = ProjectOrchestrator::init(
        "demo",
        "build a todo app",
        BehaviorKind::Phasic,
        fast_config(),
        OrchestratorDeps {
            inference: inference.clone(),
            sandbox: sandbox.clone(),
            store: Arc::new(JsonProjectStore::new(dir.path())),
            registry: Arc::new(crucible::dag::ToolRegistry::new()),
        },
    )
    .await
    .unwrap();

    let mut events = orchestrator.subscribe();
    orchestrator.generate().await;
    orchestrator.wait_idle().await;

    let state = orchestrator.snapshot().await;
    assert!(state.finalized && state.reviewed);
    assert_eq!(state.phases.len(), 2);
    assert!(state.phases.iter().all(|p| p.completed));
    assert!(state.files.contains_key("src/mod1.js"));
    assert!(state.files.contains_key("src/mod2.js"));
    assert!(state.session_id.is_some());
    assert!(state.instance_id.is_some());

    // validated setup commands reached the sandbox, deduplicated
    let executed = sandbox.executed.lock().unwrap().clone();
    assert!(executed.iter().all(|c| c == "npm add lodash"));
    assert!(!executed.is_empty());

    // the event stream saw the build
    let mut saw_generated = false;
    let mut saw_implemented = false;
    let mut saw_deployed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::PhaseGenerated { .. } => saw_generated = true,
            EngineEvent::PhaseImplemented { .. } => saw_implemented = true,
            EngineEvent::DeploymentCompleted { .. } => saw_deployed = true,
            _ => {}
        }
    }
    assert!(saw_generated && saw_implemented && saw_deployed);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn transient_sandbox_outage_heals_within_one_build() {
    let dir = tempfile::tempdir().unwrap();
    let inference = Arc::new(PhaseScriptInference::new(vec![Phase::new(
        "scaffold",
        "project scaffold",
    )]));
    // the first two sandbox calls fail with a reset signature
    let sandbox = Arc::new(RecordingSandbox::new(2));

    let orchestrator = ProjectOrchestrator::init(
        "demo",
        "build a todo app",
        BehaviorKind::Phasic,
        fast_config(),
        OrchestratorDeps {
            inference,
            sandbox: sandbox.clone(),
            store: Arc::new(JsonProjectStore::new(dir.path())),
            registry: Arc::new(crucible::dag::ToolRegistry::new()),
        },
    )
    .await
    .unwrap();

    orchestrator.generate().await;
    orchestrator.wait_idle().await;

    let state = orchestrator.snapshot().await;
    assert!(
        state.session_id.is_some(),
        "deployment retried through the outage"
    );
    assert_eq!(sandbox.create_calls.load(Ordering::SeqCst), 1);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn restart_resumes_and_does_not_refinalize() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonProjectStore::new(dir.path()));

    {
        let inference = Arc::new(PhaseScriptInference::new(vec![Phase::new(
            "scaffold",
            "project scaffold",
        )]));
        let orchestrator = ProjectOrchestrator::init(
            "demo",
            "build a todo app",
            BehaviorKind::Phasic,
            fast_config(),
            OrchestratorDeps {
                inference,
                sandbox: Arc::new(RecordingSandbox::new(0)),
                store: store.clone(),
                registry: Arc::new(crucible::dag::ToolRegistry::new()),
            },
        )
        .await
        .unwrap();
        orchestrator.generate().await;
        orchestrator.wait_idle().await;
        orchestrator.shutdown().await;
    }

    // second lifetime of the same project
    let inference = Arc::new(PhaseScriptInference::new(Vec::new()));
    let orchestrator = ProjectOrchestrator::init(
        "demo",
        "ignored on resume",
        BehaviorKind::Phasic,
        fast_config(),
        OrchestratorDeps {
            inference: inference.clone(),
            sandbox: Arc::new(RecordingSandbox::new(0)),
            store,
            registry: Arc::new(crucible::dag::ToolRegistry::new()),
        },
    )
    .await
    .unwrap();

    let before = orchestrator.snapshot().await;
    assert!(before.finalized, "persisted finalization flag survived restart");

    orchestrator.resume().await;
    orchestrator.wait_idle().await;

    assert_eq!(
        inference.implement_calls.load(Ordering::SeqCst),
        0,
        "resume of a finalized build implements nothing new"
    );
    orchestrator.shutdown().await;
}

/// Emits a scaffold phase once, and a dark-mode phase only when the
/// generation prompt carries the queued user request.
struct GatedInference {
    scaffold_issued: std::sync::atomic::AtomicBool,
    dark_mode_issued: std::sync::atomic::AtomicBool,
    implement_calls: AtomicUsize,
}

impl GatedInference {
    fn new() -> Self {
        Self {
            scaffold_issued: std::sync::atomic::AtomicBool::new(false),
            dark_mode_issued: std::sync::atomic::AtomicBool::new(false),
            implement_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl InferenceService for GatedInference {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let content = match request.action.as_str() {
            "phase_generation" => {
                let prompt = request
                    .messages
                    .first()
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                if prompt.contains("add dark mode")
                    && !self.dark_mode_issued.swap(true, Ordering::SeqCst)
                {
                    serde_json::to_string(&Phase::new("dark-mode", "user-requested dark mode"))
                        .unwrap()
                } else if !self.scaffold_issued.swap(true, Ordering::SeqCst) {
                    serde_json::to_string(&Phase::new("scaffold", "project scaffold")).unwrap()
                } else {
                    String::new()
                }
            }
            "phase_implementation" => {
                let n = self.implement_calls.fetch_add(1, Ordering::SeqCst) + 1;
                format!(
                    r#"{{"files":[{{"path":"src/mod{n}.js","contents":"export const part = {n}","purpose":"phase output"}}],"commands":[]}}"#
                )
            }
            _ => String::new(),
        };
        Ok(InferenceResponse {
            message: ConversationMessage::assistant(content),
            tool_calls: Vec::new(),
        })
    }
}

#[tokio::test]
async fn user_message_during_idle_triggers_new_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let inference = Arc::new(GatedInference::new());

    let orchestrator = ProjectOrchestrator::init(
        "demo",
        "build a todo app",
        BehaviorKind::Phasic,
        fast_config(),
        OrchestratorDeps {
            inference: inference.clone(),
            sandbox: Arc::new(RecordingSandbox::new(0)),
            store: Arc::new(JsonProjectStore::new(dir.path())),
            registry: Arc::new(crucible::dag::ToolRegistry::new()),
        },
    )
    .await
    .unwrap();

    orchestrator.generate().await;
    orchestrator.wait_idle().await;
    let implemented_before = inference.implement_calls.load(Ordering::SeqCst);

    orchestrator
        .push_user_input("add dark mode please", Vec::new())
        .await
        .unwrap();
    orchestrator.wait_idle().await;

    assert!(
        inference.implement_calls.load(Ordering::SeqCst) > implemented_before,
        "queued user input produced another implemented phase"
    );
    orchestrator.shutdown().await;
}
