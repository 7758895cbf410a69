//! Project and conversation state owned by the orchestrator.
//!
//! `ProjectState` is the single mutable record per project. It is owned
//! exclusively by the orchestrator; every mutation is committed as a
//! whole-state replace through a `ProjectStore`, so external observers only
//! ever see complete snapshots. `ConversationState` holds the two message
//! tables: `running` (working set, compactable) and `full` (append-only
//! audit).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Bumped when the persisted layout changes; loads of older versions are
/// migrated best-effort rather than rejected.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Which generation strategy drives this project. Selected once at actor
/// startup from persisted state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorKind {
    #[default]
    Phasic,
    Agentic,
}

/// A file the upcoming phase intends to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConcept {
    pub path: String,
    pub purpose: String,
}

/// A named unit of generation work spanning one or more files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub file_concepts: Vec<FileConcept>,
    #[serde(default)]
    pub completed: bool,
    /// Marks the phase the planner considers final.
    #[serde(default)]
    pub last: bool,
}

impl Phase {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            file_concepts: Vec::new(),
            completed: false,
            last: false,
        }
    }
}

/// A generated source file, keyed by path in `ProjectState::files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub contents: String,
    #[serde(default)]
    pub purpose: String,
}

/// User input queued while a run is in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInput {
    pub text: String,
    #[serde(default)]
    pub images: Vec<String>,
    pub received_at: DateTime<Utc>,
}

impl UserInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: Vec::new(),
            received_at: Utc::now(),
        }
    }
}

/// The single mutable record for one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    pub schema_version: u32,
    pub project_name: String,
    /// The original user query the build started from.
    pub query: String,
    pub blueprint: Option<String>,
    pub template: Option<String>,
    pub behavior: BehaviorKind,
    pub files: BTreeMap<String, GeneratedFile>,
    /// Phases in generation order.
    pub phases: Vec<Phase>,
    /// At most one phase is in flight; tracked separately from the list so
    /// a resumed run cannot double-dispatch it.
    pub phase_in_flight: Option<String>,
    pub pending_inputs: Vec<UserInput>,
    pub session_id: Option<String>,
    pub instance_id: Option<String>,
    pub mvp_reached: bool,
    /// Finalization ran (idempotent guard).
    pub finalized: bool,
    /// Review ran for this build.
    pub reviewed: bool,
    /// Key for the two conversation tables in the store.
    pub conversation_id: String,
}

impl ProjectState {
    pub fn new(project_name: impl Into<String>, query: impl Into<String>, behavior: BehaviorKind) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            project_name: project_name.into(),
            query: query.into(),
            blueprint: None,
            template: None,
            behavior,
            files: BTreeMap::new(),
            phases: Vec::new(),
            phase_in_flight: None,
            pending_inputs: Vec::new(),
            session_id: None,
            instance_id: None,
            mvp_reached: false,
            finalized: false,
            reviewed: false,
            conversation_id: Uuid::new_v4().to_string(),
        }
    }

    /// The earliest phase that has not completed, if any.
    pub fn incomplete_phase(&self) -> Option<&Phase> {
        self.phases.iter().find(|p| !p.completed)
    }

    pub fn completed_phase_count(&self) -> usize {
        self.phases.iter().filter(|p| p.completed).count()
    }

    pub fn upsert_file(&mut self, file: GeneratedFile) {
        self.files.insert(file.path.clone(), file);
    }

    pub fn mark_phase_completed(&mut self, name: &str) {
        if let Some(phase) = self.phases.iter_mut().find(|p| p.name == name) {
            phase.completed = true;
        }
        if self.phase_in_flight.as_deref() == Some(name) {
            self.phase_in_flight = None;
        }
    }

    /// Take all queued user inputs, oldest first.
    pub fn drain_inputs(&mut self) -> Vec<UserInput> {
        std::mem::take(&mut self.pending_inputs)
    }
}

// ── Conversation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    /// Synthetic message produced by compaction, tagged with an archive id.
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Correlation id; a duplicate id overwrites in place rather than
    /// appending.
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            images: Vec::new(),
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// The compaction summary message; its id is the archive id.
    pub fn summary(archive_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Summary, content);
        msg.id = archive_id.into();
        msg
    }

    pub fn char_count(&self) -> usize {
        self.content.chars().count()
    }
}

/// Working plus audit history for one conversation session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    /// Working set used for prompting; compacted in place, never deleted
    /// wholesale.
    pub running: Vec<ConversationMessage>,
    /// Append-only audit trail.
    pub full: Vec<ConversationMessage>,
}

impl ConversationState {
    /// Insert into both tables. A message with an already-known id
    /// overwrites the existing entry in place.
    pub fn upsert(&mut self, message: ConversationMessage) {
        upsert_into(&mut self.running, message.clone());
        upsert_into(&mut self.full, message);
    }

    /// Count of user-originated turns in the working set.
    pub fn user_turns(&self) -> usize {
        self.running.iter().filter(|m| m.role == Role::User).count()
    }
}

fn upsert_into(table: &mut Vec<ConversationMessage>, message: ConversationMessage) {
    match table.iter_mut().find(|m| m.id == message.id) {
        Some(existing) => *existing = message,
        None => table.push(message),
    }
}

// ── Persistence ──────────────────────────────────────────────────────

/// Whole-state replace for `ProjectState`; append/merge for the
/// conversation tables, keyed by conversation session id.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn save_state(&self, state: &ProjectState) -> Result<()>;
    /// Best-effort load: a missing or corrupt record yields `None` so the
    /// caller can fall back to defaults rather than failing hard.
    async fn load_state(&self, project_name: &str) -> Result<Option<ProjectState>>;
    async fn save_conversation(&self, conversation_id: &str, conversation: &ConversationState) -> Result<()>;
    async fn load_conversation(&self, conversation_id: &str) -> Result<ConversationState>;
}

/// JSON-file store, one file per record under a root directory.
pub struct JsonProjectStore {
    root: PathBuf,
}

impl JsonProjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn state_path(&self, project_name: &str) -> PathBuf {
        self.root.join(format!("{project_name}.state.json"))
    }

    fn conversation_path(&self, conversation_id: &str) -> PathBuf {
        self.root.join(format!("{conversation_id}.conversation.json"))
    }

    fn write_json<T: Serialize>(&self, path: &PathBuf, value: &T) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create store root {}", self.root.display()))?;
        let body = serde_json::to_string_pretty(value).context("Failed to serialize record")?;
        std::fs::write(path, body).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for JsonProjectStore {
    async fn save_state(&self, state: &ProjectState) -> Result<()> {
        self.write_json(&self.state_path(&state.project_name), state)
    }

    async fn load_state(&self, project_name: &str) -> Result<Option<ProjectState>> {
        let path = self.state_path(project_name);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        match serde_json::from_str::<ProjectState>(&content) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                // Corrupt state falls back to defaults instead of killing the
                // project.
                tracing::warn!(target: "crucible::state", project = project_name, error = %e,
                    "state file corrupt, recovering with defaults");
                Ok(None)
            }
        }
    }

    async fn save_conversation(&self, conversation_id: &str, conversation: &ConversationState) -> Result<()> {
        self.write_json(&self.conversation_path(conversation_id), conversation)
    }

    async fn load_conversation(&self, conversation_id: &str) -> Result<ConversationState> {
        let path = self.conversation_path(conversation_id);
        if !path.exists() {
            return Ok(ConversationState::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        match serde_json::from_str(&content) {
            Ok(conversation) => Ok(conversation),
            Err(e) => {
                tracing::warn!(target: "crucible::state", conversation = conversation_id, error = %e,
                    "conversation file corrupt, starting empty");
                Ok(ConversationState::default())
            }
        }
    }
}
