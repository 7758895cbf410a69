//! Crucible — code-generation orchestration engine.
//!
//! A resumable state machine that drives an AI system through iterative
//! phases of planning, implementation, and validation of a software
//! project, while coordinating sandboxed execution, dependency-aware
//! parallel tool invocation, and long-running conversational context.
//!
//! ## Module map
//!
//! ```text
//! orchestrator  single-owner actor: triggers, run joining, persistence
//!     └─ behavior     phasic state machine / agentic loop (strategy)
//!          ├─ inference    LLM contract: model config, retry policy
//!          ├─ dag          tool batches: conflict graph -> parallel groups
//!          ├─ deploy       sandbox session lifecycle, retries, health
//!          │    ├─ sandbox     remote execution service contract
//!          │    └─ bootstrap   setup-command whitelist
//!          ├─ compaction   conversation summarization thresholds
//!          └─ state        ProjectState + conversation tables + store
//! ```
//!
//! The web UI, REST schemas, authentication, database mappings, and the
//! inference transport live outside this crate; they consume the typed
//! events and implement the `InferenceService` / `SandboxService` /
//! `ProjectStore` traits.

pub mod behavior;
pub mod bootstrap;
pub mod compaction;
pub mod config;
pub mod control;
pub mod dag;
pub mod deploy;
pub mod errors;
pub mod events;
pub mod inference;
pub mod orchestrator;
pub mod sandbox;
pub mod state;

/// Tracing setup for binaries embedding the engine.
pub mod telemetry {
    use tracing_subscriber::EnvFilter;

    /// Initialize a fmt subscriber honoring `RUST_LOG`; defaults to
    /// `info` for the crate. Safe to call more than once.
    pub fn init() {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,crucible=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    }
}
