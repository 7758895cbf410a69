//! Deployment manager: one logical sandbox session per project.
//!
//! `deploy_to_sandbox` is idempotent under concurrency — callers arriving
//! while a deployment is in flight await the same underlying operation,
//! each with its own wait-timeout, instead of starting a duplicate.
//! Attempts retry with capped exponential backoff; a per-attempt timeout
//! bounds each try and a master timeout bounds the whole sequence, after
//! which waiters receive `None`. Timing out a wait abandons the work, it
//! never cancels it: at-least-once side effects are accepted.
//!
//! The cached session (instance id + client handle) is invalidated on
//! specific transient-error signatures and on every Nth consecutive
//! failure, forcing a fresh instance on the next attempt. On success a
//! fixed-interval health-check loop is (re)started; an unhealthy instance
//! triggers an automatic redeploy.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bootstrap::SetupCommandValidator;
use crate::events::{EngineEvent, EventBus};
use crate::sandbox::{CommandResult, InstanceHealth, SandboxFile, SandboxService};

#[derive(Debug, Clone)]
pub struct DeployConfig {
    /// Bound on a single deployment attempt.
    pub attempt_timeout: Duration,
    /// Bound on the whole retry sequence.
    pub master_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Every Nth consecutive failure resets the session.
    pub failures_per_reset: u32,
    pub health_interval: Duration,
    /// Bound on setup-command execution inside the instance.
    pub command_timeout: Duration,
    pub init_command: Option<String>,
    pub env_vars: HashMap<String, String>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(60),
            master_timeout: Duration::from_secs(300),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            failures_per_reset: 3,
            health_interval: Duration::from_secs(15),
            command_timeout: Duration::from_secs(120),
            init_command: None,
            env_vars: HashMap::new(),
        }
    }
}

/// The logical identity binding a project to a live sandbox instance.
/// Resettable independent of project data.
#[derive(Debug, Clone)]
pub struct DeploymentSession {
    pub session_id: String,
    pub instance_id: String,
    pub preview_url: String,
}

/// What a successful deployment hands back to callers.
#[derive(Debug, Clone)]
pub struct PreviewInfo {
    pub session_id: String,
    pub instance_id: String,
    pub preview_url: String,
}

/// Everything needed to repeat a deployment; kept for the health loop's
/// automatic redeploys.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub files: Vec<SandboxFile>,
    pub project_name: String,
    pub setup_commands: Vec<String>,
}

#[derive(Debug, Clone)]
enum DeployProgress {
    Pending,
    Done(Option<PreviewInfo>),
}

/// Runs after setup commands complete, e.g. to resynchronize dependency
/// manifests with what actually got installed.
pub type PostSetupCallback = Arc<dyn Fn(&[CommandResult]) + Send + Sync>;

pub struct DeploymentManager {
    config: DeployConfig,
    sandbox: Arc<dyn SandboxService>,
    validator: SetupCommandValidator,
    events: EventBus,
    session: Mutex<Option<DeploymentSession>>,
    in_flight: Mutex<Option<watch::Receiver<DeployProgress>>>,
    consecutive_failures: AtomicU32,
    health_task: Mutex<Option<JoinHandle<()>>>,
    last_request: Mutex<Option<DeployRequest>>,
    post_setup: Option<PostSetupCallback>,
}

impl DeploymentManager {
    pub fn new(sandbox: Arc<dyn SandboxService>, config: DeployConfig, events: EventBus) -> Self {
        Self {
            config,
            sandbox,
            validator: SetupCommandValidator::new(),
            events,
            session: Mutex::new(None),
            in_flight: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            health_task: Mutex::new(None),
            last_request: Mutex::new(None),
            post_setup: None,
        }
    }

    /// Register the post-setup callback. Construction-time wiring; the
    /// callback observes every completed setup run.
    pub fn with_post_setup(mut self, callback: PostSetupCallback) -> Self {
        self.post_setup = Some(callback);
        self
    }

    /// Replace the default command validator, e.g. with a different cap.
    pub fn with_validator(mut self, validator: SetupCommandValidator) -> Self {
        self.validator = validator;
        self
    }

    pub async fn current_session(&self) -> Option<DeploymentSession> {
        self.session.lock().await.clone()
    }

    /// Deploy the project into the sandbox, joining any deployment already
    /// in flight. Returns `None` if this caller's wait timed out or the
    /// retry sequence exhausted its master timeout; the underlying work is
    /// abandoned, not cancelled.
    pub async fn deploy_to_sandbox(
        self: Arc<Self>,
        request: DeployRequest,
        wait_timeout: Duration,
    ) -> Option<PreviewInfo> {
        let mut rx = {
            let mut in_flight = self.in_flight.lock().await;
            let joinable = in_flight
                .as_ref()
                .filter(|rx| matches!(*rx.borrow(), DeployProgress::Pending))
                .cloned();
            match joinable {
                Some(rx) => {
                    debug!(target: "crucible::deploy", "joining deployment already in flight");
                    rx
                }
                None => {
                    let (tx, rx) = watch::channel(DeployProgress::Pending);
                    *in_flight = Some(rx.clone());
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move { manager.run_attempts(request, tx).await });
                    rx
                }
            }
        };

        let waited = tokio::time::timeout(wait_timeout, async {
            loop {
                if let DeployProgress::Done(result) = &*rx.borrow() {
                    return result.clone();
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => {
                warn!(target: "crucible::deploy", "caller abandoned deployment wait");
                None
            }
        }
    }

    /// Invalidate the cached sandbox client and instance id. The next
    /// attempt provisions a fresh instance; generated files are untouched.
    pub async fn reset_session(&self) {
        if let Some(old) = self.session.lock().await.take() {
            info!(target: "crucible::deploy", session_id = %old.session_id,
                instance_id = %old.instance_id, "deployment session reset");
        }
    }

    /// Stop the health loop. Called on orchestrator shutdown.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.health_task.lock().await.take() {
            handle.abort();
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.config.backoff_base.saturating_mul(1u32 << exp);
        delay.min(self.config.backoff_cap)
    }

    async fn run_attempts(self: Arc<Self>, request: DeployRequest, tx: watch::Sender<DeployProgress>) {
        *self.last_request.lock().await = Some(request.clone());

        let started = Instant::now();
        let mut attempt: u32 = 0;
        let mut outcome: Option<PreviewInfo> = None;

        loop {
            if started.elapsed() >= self.config.master_timeout {
                warn!(target: "crucible::deploy", attempts = attempt,
                    "master timeout exceeded, reporting deployment failure");
                self.events.publish(EngineEvent::DeploymentFailed {
                    message: format!("deployment timed out after {attempt} attempts"),
                });
                break;
            }

            attempt += 1;
            self.events.publish(EngineEvent::DeploymentStarted { attempt });

            match tokio::time::timeout(self.config.attempt_timeout, self.attempt_deploy(&request)).await {
                Ok(Ok(preview)) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    outcome = Some(preview);
                    break;
                }
                Ok(Err(e)) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(target: "crucible::deploy", attempt, failures, error = %e,
                        "deployment attempt failed");
                    if e.resets_session() || failures % self.config.failures_per_reset == 0 {
                        self.reset_session().await;
                    }
                    self.events.publish(EngineEvent::DeploymentFailed {
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(target: "crucible::deploy", attempt, failures, "deployment attempt timed out");
                    if failures % self.config.failures_per_reset == 0 {
                        self.reset_session().await;
                    }
                    self.events.publish(EngineEvent::DeploymentFailed {
                        message: format!("attempt {attempt} exceeded its timeout"),
                    });
                }
            }

            tokio::time::sleep(self.backoff_delay(attempt)).await;
        }

        if let Some(preview) = &outcome {
            *self.session.lock().await = Some(DeploymentSession {
                session_id: preview.session_id.clone(),
                instance_id: preview.instance_id.clone(),
                preview_url: preview.preview_url.clone(),
            });
            self.run_setup(&preview.instance_id, &request.setup_commands).await;
            Arc::clone(&self).spawn_health_loop().await;
            info!(target: "crucible::deploy", session_id = %preview.session_id,
                instance_id = %preview.instance_id, attempts = attempt, "deployment completed");
            self.events.publish(EngineEvent::DeploymentCompleted {
                session_id: preview.session_id.clone(),
                preview_url: preview.preview_url.clone(),
            });
        }

        // Waiters observe the result through the watch channel. The stored
        // receiver now reads `Done`, which the join check treats as "no
        // deployment in flight" — no clearing needed, and a deployment
        // started meanwhile is never clobbered.
        let _ = tx.send(DeployProgress::Done(outcome));
    }

    /// One attempt: refresh files on the live instance when a session
    /// exists, otherwise provision a fresh one under a new session id.
    async fn attempt_deploy(&self, request: &DeployRequest) -> Result<PreviewInfo, crate::errors::SandboxError> {
        let existing = self.session.lock().await.clone();
        if let Some(session) = existing {
            self.sandbox.write_files(&session.instance_id, &request.files).await?;
            return Ok(PreviewInfo {
                session_id: session.session_id,
                instance_id: session.instance_id,
                preview_url: session.preview_url,
            });
        }

        let created = self
            .sandbox
            .create_instance(
                &request.files,
                &request.project_name,
                self.config.init_command.as_deref(),
                &self.config.env_vars,
            )
            .await?;
        Ok(PreviewInfo {
            session_id: Uuid::new_v4().to_string(),
            instance_id: created.instance_id,
            preview_url: created.preview_url,
        })
    }

    /// Replay setup commands through the validator, then hand the results
    /// to the post-setup callback.
    async fn run_setup(&self, instance_id: &str, commands: &[String]) {
        let sanitized = self.validator.sanitize(commands);
        if sanitized.is_empty() {
            return;
        }
        match self
            .sandbox
            .execute_commands(instance_id, &sanitized, self.config.command_timeout)
            .await
        {
            Ok(results) => {
                for failed in results.iter().filter(|r| !r.succeeded()) {
                    warn!(target: "crucible::deploy", command = %failed.command,
                        exit_code = failed.exit_code, "setup command failed");
                }
                if let Some(callback) = &self.post_setup {
                    callback(&results);
                }
            }
            Err(e) => {
                warn!(target: "crucible::deploy", error = %e, "setup command execution failed");
            }
        }
    }

    /// (Re)start the fixed-interval health loop. The previous loop is
    /// aborted first so a redeploy never leaves two timers running.
    async fn spawn_health_loop(self: Arc<Self>) {
        let mut guard = self.health_task.lock().await;
        if let Some(previous) = guard.take() {
            previous.abort();
        }

        let weak = Arc::downgrade(&self);
        let interval = self.config.health_interval;
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { return };
                manager.health_check_once().await;
            }
        }));
    }

    async fn health_check_once(self: Arc<Self>) {
        let Some(session) = self.current_session().await else {
            return;
        };
        let unhealthy = match self.sandbox.get_instance_status(&session.instance_id).await {
            Ok(status) => status.health == InstanceHealth::Unhealthy,
            Err(e) => {
                debug!(target: "crucible::deploy", error = %e, "health check failed");
                e.resets_session()
            }
        };
        if !unhealthy {
            return;
        }

        warn!(target: "crucible::deploy", instance_id = %session.instance_id,
            "instance unhealthy, triggering automatic redeploy");
        self.reset_session().await;
        let request = self.last_request.lock().await.clone();
        if let Some(request) = request {
            let manager = Arc::clone(&self);
            let wait = manager.config.master_timeout;
            // Route the recursive redeploy through a non-async boxed-future
            // helper. Spawning `deploy_to_sandbox` directly here would require
            // the compiler to prove that opaque future `Send` from within its
            // own auto-trait inference cycle (health loop -> deploy -> health
            // loop), which it cannot. Erasing to `Pin<Box<dyn Future + Send>>`
            // in a free fn breaks the cycle without changing behavior.
            tokio::spawn(redeploy(manager, request, wait));
        }
    }
}

/// Boxed, type-erased wrapper around `deploy_to_sandbox` used by the health
/// loop's automatic redeploy. Non-`async` on purpose: returning a concrete
/// `Pin<Box<dyn Future + Send>>` breaks the `Send` auto-trait inference cycle
/// between the health loop and `deploy_to_sandbox`.
fn redeploy(
    manager: Arc<DeploymentManager>,
    request: DeployRequest,
    wait: Duration,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        let _ = manager.deploy_to_sandbox(request, wait).await;
    })
}
