//! Phasic generation: the deterministic state machine.
//!
//! `PHASE_GENERATING → PHASE_IMPLEMENTING → ... → FINALIZING → REVIEWING
//! → IDLE`. Phase generation asks the inference service for the next
//! phase (folding in queued user input and outstanding issues); an empty
//! result finalizes. Implementation generates the phase's files, replays
//! install commands through the command validator (inside the deployment
//! manager), applies a pre-deploy gate, deploys, and decrements the
//! remaining-phase counter. Finalization runs exactly once and forces one
//! more generate/implement pair; review runs once per build and offers a
//! deep-debug pass when issues remain.
//!
//! Failures inside a step are caught at the step boundary, broadcast as a
//! user-visible error event, and end the run cleanly — the next trigger
//! re-enters the machine and resumes from persisted phases.

use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{BehaviorContext, GenerationBehavior, StepError, synthesize_user_message};
use crate::deploy::DeployRequest;
use crate::events::EngineEvent;
use crate::inference::{InferenceRequest, infer_with_retry};
use crate::sandbox::SandboxFile;
use crate::state::{
    BehaviorKind, ConversationMessage, GeneratedFile, Phase, ProjectState, UserInput,
};

const PHASE_GENERATION_INSTRUCTION: &str = "Plan the next implementation phase for this project. \
Respond with a JSON object {\"name\", \"description\", \"file_concepts\": [{\"path\", \"purpose\"}], \
\"last\"} describing one phase, or an empty response when the project needs no further phases.";

const PHASE_IMPLEMENTATION_INSTRUCTION: &str = "Implement the given phase. Respond with a JSON \
object {\"files\": [{\"path\", \"contents\", \"purpose\"}], \"commands\": [\"<package manager \
install commands>\"]}.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhasicState {
    PhaseGenerating,
    PhaseImplementing,
    Reviewing,
    Finalizing,
    Idle,
}

/// Structured output of a phase-implementation call.
#[derive(Debug, Default, Deserialize)]
struct PhasePayload {
    #[serde(default)]
    files: Vec<GeneratedFile>,
    #[serde(default)]
    commands: Vec<String>,
}

pub struct PhasicBehavior {
    /// Issues collected during this build; folded into later generation
    /// prompts and inspected by the review step. Session-scoped cache,
    /// cleared when a fresh build starts.
    issues: StdMutex<Vec<String>>,
}

impl PhasicBehavior {
    pub fn new() -> Self {
        Self {
            issues: StdMutex::new(Vec::new()),
        }
    }

    /// Where a (re)started machine enters: an incomplete phase restarts
    /// implementation; otherwise generation — covering both "phases exist,
    /// all complete" and a fresh project.
    pub fn resume_point(state: &ProjectState) -> PhasicState {
        if state.incomplete_phase().is_some() {
            PhasicState::PhaseImplementing
        } else {
            PhasicState::PhaseGenerating
        }
    }

    /// Run the machine to idle, returning the visited states in order.
    pub async fn drive(&self, ctx: &BehaviorContext) -> anyhow::Result<Vec<PhasicState>> {
        let snapshot = ctx.snapshot().await;
        let mut remaining = ctx
            .config
            .phasic
            .phase_budget
            .saturating_sub(snapshot.completed_phase_count() as u32)
            .max(1);
        let mut machine = Self::resume_point(&snapshot);
        let mut visited = vec![machine];
        info!(target: "crucible::phasic", project = %snapshot.project_name,
            entry = ?machine, remaining, "entering phasic state machine");

        loop {
            if ctx.cancel.is_raised() {
                info!(target: "crucible::phasic", "run cancelled, leaving machine");
                break;
            }
            machine = match machine {
                PhasicState::PhaseGenerating => self.on_generate(ctx).await,
                PhasicState::PhaseImplementing => self.on_implement(ctx, &mut remaining).await,
                PhasicState::Finalizing => self.on_finalize(ctx).await,
                PhasicState::Reviewing => self.on_review(ctx).await,
                PhasicState::Idle => break,
            };
            visited.push(machine);
        }
        Ok(visited)
    }

    fn record_issue(&self, issue: impl Into<String>) {
        self.issues.lock().unwrap().push(issue.into());
    }

    fn fail_step(&self, ctx: &BehaviorContext, step: &str, error: StepError) -> PhasicState {
        match error {
            StepError::Cancelled => PhasicState::Idle,
            StepError::Failed(e) => {
                warn!(target: "crucible::phasic", step, error = %e, "generation step failed");
                ctx.events.publish(EngineEvent::GenerationError {
                    message: format!("{step}: {e:#}"),
                });
                PhasicState::Idle
            }
        }
    }

    async fn on_generate(&self, ctx: &BehaviorContext) -> PhasicState {
        match self.generate_next_phase(ctx, false).await {
            Ok(Some(phase)) => match self.accept_phase(ctx, phase).await {
                Ok(()) => PhasicState::PhaseImplementing,
                Err(e) => self.fail_step(ctx, "phase_generation", e),
            },
            Ok(None) => PhasicState::Finalizing,
            Err(e) => self.fail_step(ctx, "phase_generation", e),
        }
    }

    async fn accept_phase(&self, ctx: &BehaviorContext, phase: Phase) -> Result<(), StepError> {
        ctx.events.publish(EngineEvent::PhaseGenerated {
            name: phase.name.clone(),
            description: phase.description.clone(),
        });
        ctx.commit(|state| {
            state.phase_in_flight = Some(phase.name.clone());
            state.phases.push(phase);
        })
        .await?;
        Ok(())
    }

    async fn on_implement(&self, ctx: &BehaviorContext, remaining: &mut u32) -> PhasicState {
        let snapshot = ctx.snapshot().await;
        let Some(phase) = snapshot.incomplete_phase().cloned() else {
            // Nothing left to implement (resume found stale in-flight
            // marker); fall back to generation.
            return PhasicState::PhaseGenerating;
        };

        ctx.events.publish(EngineEvent::PhaseStarted {
            name: phase.name.clone(),
        });

        match self.implement_phase(ctx, &phase).await {
            Ok(file_count) => {
                ctx.events.publish(EngineEvent::PhaseImplemented {
                    name: phase.name.clone(),
                    file_count,
                });
            }
            Err(StepError::Cancelled) => return PhasicState::Idle,
            Err(StepError::Failed(e)) => {
                // Record and move on; the machine self-heals across
                // iterations instead of terminating the actor.
                warn!(target: "crucible::phasic", phase = %phase.name, error = %e,
                    "phase implementation failed");
                self.record_issue(format!("phase '{}' failed: {e:#}", phase.name));
                ctx.events.publish(EngineEvent::GenerationError {
                    message: format!("phase '{}': {e:#}", phase.name),
                });
            }
        }

        if ctx
            .commit(|state| state.mark_phase_completed(&phase.name))
            .await
            .is_err()
        {
            return PhasicState::Idle;
        }

        *remaining = remaining.saturating_sub(1);
        let pending_empty = ctx.snapshot().await.pending_inputs.is_empty();
        if (*remaining == 0 || phase.last) && pending_empty {
            PhasicState::Finalizing
        } else {
            PhasicState::PhaseGenerating
        }
    }

    async fn on_finalize(&self, ctx: &BehaviorContext) -> PhasicState {
        let snapshot = ctx.snapshot().await;
        if snapshot.finalized {
            // Finalization runs exactly once per build.
            debug!(target: "crucible::phasic", "finalize already ran, skipping");
            return PhasicState::Reviewing;
        }
        if ctx.commit(|state| state.finalized = true).await.is_err() {
            return PhasicState::Idle;
        }

        // One forced generate/implement pair before review.
        match self.generate_next_phase(ctx, true).await {
            Ok(Some(phase)) => {
                if self.accept_phase(ctx, phase).await.is_err() {
                    return PhasicState::Reviewing;
                }
                let snapshot = ctx.snapshot().await;
                let Some(phase) = snapshot.incomplete_phase().cloned() else {
                    return PhasicState::Reviewing;
                };
                ctx.events.publish(EngineEvent::PhaseStarted {
                    name: phase.name.clone(),
                });
                match self.implement_phase(ctx, &phase).await {
                    Ok(file_count) => {
                        ctx.events.publish(EngineEvent::PhaseImplemented {
                            name: phase.name.clone(),
                            file_count,
                        });
                    }
                    Err(StepError::Cancelled) => return PhasicState::Idle,
                    Err(StepError::Failed(e)) => {
                        self.record_issue(format!("finalization phase failed: {e:#}"));
                    }
                }
                let _ = ctx.commit(|state| state.mark_phase_completed(&phase.name)).await;
            }
            Ok(None) => {}
            Err(StepError::Cancelled) => return PhasicState::Idle,
            Err(StepError::Failed(e)) => {
                warn!(target: "crucible::phasic", error = %e, "finalization generation failed");
            }
        }
        PhasicState::Reviewing
    }

    async fn on_review(&self, ctx: &BehaviorContext) -> PhasicState {
        let snapshot = ctx.snapshot().await;
        if snapshot.reviewed {
            return PhasicState::Idle;
        }
        if ctx.commit(|state| state.reviewed = true).await.is_err() {
            return PhasicState::Idle;
        }

        let mut issues = self.issues.lock().unwrap().clone();
        if let Some(session) = ctx.deploy.current_session().await {
            let paths: Vec<String> = snapshot.files.keys().cloned().collect();
            match ctx.sandbox.run_static_analysis(&session.instance_id, &paths).await {
                Ok(found) => {
                    issues.extend(found.into_iter().map(|i| format!("{}: {}", i.file, i.message)));
                }
                Err(e) => {
                    debug!(target: "crucible::phasic", error = %e, "static analysis unavailable");
                }
            }
            match ctx.sandbox.get_logs(&session.instance_id).await {
                Ok(logs) => issues.extend(runtime_error_lines(&logs)),
                Err(e) => {
                    debug!(target: "crucible::phasic", error = %e, "instance logs unavailable");
                }
            }
        }

        if !issues.is_empty() {
            let message = format!(
                "The build finished with {} outstanding issue(s). Want me to run a deep-debug pass over the deployed app?",
                issues.len()
            );
            let _ = ctx.push_message(ConversationMessage::assistant(message.clone())).await;
            ctx.events.publish(EngineEvent::ReviewPrompt { message });
        }
        PhasicState::Idle
    }

    /// Ask the inference service for the next phase, folding queued user
    /// input and outstanding issues into the request. `None` means the
    /// project is done.
    async fn generate_next_phase(
        &self,
        ctx: &BehaviorContext,
        finalizing: bool,
    ) -> Result<Option<Phase>, StepError> {
        let inputs = ctx.commit(|state| state.drain_inputs()).await?;
        ctx.input_signal.clear();
        if !inputs.is_empty() {
            let _ = ctx.push_message(synthesize_user_message(&inputs)).await;
        }

        let snapshot = ctx.snapshot().await;
        let issues = self.issues.lock().unwrap().clone();
        let prompt = phase_generation_prompt(&snapshot, &inputs, &issues, finalizing);
        let request = InferenceRequest::new(
            "phase_generation",
            vec![ConversationMessage::user(prompt)],
            ctx.config.model.clone(),
        )
        .with_system(PHASE_GENERATION_INSTRUCTION);

        let response =
            infer_with_retry(ctx.inference.as_ref(), request, &ctx.config.retry, &ctx.cancel).await?;
        Ok(parse_phase_plan(&response.message.content))
    }

    /// Generate the phase's files, gate them, and deploy.
    async fn implement_phase(&self, ctx: &BehaviorContext, phase: &Phase) -> Result<usize, StepError> {
        let snapshot = ctx.snapshot().await;
        let prompt = phase_implementation_prompt(&snapshot, phase);
        let request = InferenceRequest::new(
            "phase_implementation",
            vec![ConversationMessage::user(prompt)],
            ctx.config.model.clone(),
        )
        .with_system(PHASE_IMPLEMENTATION_INSTRUCTION);

        let response =
            infer_with_retry(ctx.inference.as_ref(), request, &ctx.config.retry, &ctx.cancel).await?;

        let payload = match serde_json::from_str::<PhasePayload>(&response.message.content) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(target: "crucible::phasic", phase = %phase.name, error = %e,
                    "unparseable implementation payload");
                self.record_issue(format!("phase '{}' produced no parseable files", phase.name));
                PhasePayload::default()
            }
        };

        let (files, rejected) = apply_predeploy_gate(payload.files);
        if rejected > 0 {
            self.record_issue(format!(
                "pre-deploy gate rejected {rejected} file(s) in phase '{}'",
                phase.name
            ));
        }

        let file_count = files.len();
        ctx.commit(|state| {
            for file in files {
                state.upsert_file(file);
            }
        })
        .await?;

        let snapshot = ctx.snapshot().await;
        let deploy_request = DeployRequest {
            files: snapshot
                .files
                .values()
                .map(|f| SandboxFile {
                    path: f.path.clone(),
                    contents: f.contents.clone(),
                })
                .collect(),
            project_name: snapshot.project_name.clone(),
            setup_commands: payload.commands,
        };
        let wait = ctx.config.deploy.master_timeout;
        match ctx.deploy.clone().deploy_to_sandbox(deploy_request, wait).await {
            Some(preview) => {
                ctx.commit(|state| {
                    state.session_id = Some(preview.session_id.clone());
                    state.instance_id = Some(preview.instance_id.clone());
                })
                .await?;
            }
            None => {
                self.record_issue(format!("deployment did not complete for phase '{}'", phase.name));
            }
        }

        Ok(file_count)
    }
}

impl Default for PhasicBehavior {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationBehavior for PhasicBehavior {
    fn kind(&self) -> BehaviorKind {
        BehaviorKind::Phasic
    }

    async fn run(&self, ctx: &BehaviorContext) -> anyhow::Result<()> {
        self.drive(ctx).await.map(|_| ())
    }
}

fn phase_generation_prompt(
    state: &ProjectState,
    inputs: &[UserInput],
    issues: &[String],
    finalizing: bool,
) -> String {
    let mut prompt = format!("Project request: {}\n", state.query);
    if let Some(blueprint) = &state.blueprint {
        prompt.push_str(&format!("Blueprint: {blueprint}\n"));
    }
    if !state.phases.is_empty() {
        prompt.push_str("Phases so far:\n");
        for phase in &state.phases {
            prompt.push_str(&format!(
                "- {} ({})\n",
                phase.name,
                if phase.completed { "completed" } else { "incomplete" }
            ));
        }
    }
    for input in inputs {
        prompt.push_str(&format!("User request: {}\n", input.text));
    }
    for issue in issues {
        prompt.push_str(&format!("Known issue: {issue}\n"));
    }
    if finalizing {
        prompt.push_str("This is the final polish pass before review.\n");
    }
    prompt
}

fn phase_implementation_prompt(state: &ProjectState, phase: &Phase) -> String {
    let mut prompt = format!(
        "Phase: {}\nDescription: {}\n",
        phase.name, phase.description
    );
    for concept in &phase.file_concepts {
        prompt.push_str(&format!("- {}: {}\n", concept.path, concept.purpose));
    }
    if !state.files.is_empty() {
        prompt.push_str("Existing files:\n");
        for path in state.files.keys() {
            prompt.push_str(&format!("- {path}\n"));
        }
    }
    prompt
}

/// Parse the generation response. Empty or unparseable content means "no
/// further phases".
fn parse_phase_plan(content: &str) -> Option<Phase> {
    let trimmed = content.trim();
    if trimmed.is_empty() || trimmed == "null" || trimmed == "{}" {
        return None;
    }
    match serde_json::from_str::<Phase>(trimmed) {
        Ok(mut phase) => {
            phase.completed = false;
            Some(phase)
        }
        Err(e) => {
            warn!(target: "crucible::phasic", error = %e, "unparseable phase plan, treating as done");
            None
        }
    }
}

/// Pull error lines out of instance logs for the review step. Capped so a
/// crash-looping app cannot flood the review.
fn runtime_error_lines(logs: &str) -> Vec<String> {
    logs.lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.contains("error") || lower.contains("unhandled") || lower.contains("panic")
        })
        .take(3)
        .map(|line| format!("runtime: {}", line.trim()))
        .collect()
}

/// The pre-deploy safety gate: drop artifacts that must never reach the
/// sandbox filesystem. Returns the surviving files and the rejected count.
fn apply_predeploy_gate(files: Vec<GeneratedFile>) -> (Vec<GeneratedFile>, usize) {
    let total = files.len();
    let kept: Vec<GeneratedFile> = files
        .into_iter()
        .filter(|f| {
            !f.path.is_empty()
                && !f.path.starts_with('/')
                && !f.path.split('/').any(|part| part == "..")
                && !f.contents.is_empty()
        })
        .collect();
    let rejected = total - kept.len();
    (kept, rejected)
}
