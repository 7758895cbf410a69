//! Engine configuration.
//!
//! Defaults cover every knob; a `crucible.toml` in the project directory
//! overlays individual fields. Loading a missing file yields defaults,
//! loading a malformed file is an error.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::behavior::{AgenticConfig, PhasicConfig};
use crate::bootstrap::DEFAULT_MAX_COMMANDS;
use crate::compaction::CompactionPolicy;
use crate::deploy::DeployConfig;
use crate::inference::{ModelConfig, ModelOverride, RetryPolicy};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub deploy: DeployConfig,
    pub compaction: CompactionPolicy,
    pub retry: RetryPolicy,
    pub model: ModelConfig,
    pub phasic: PhasicConfig,
    pub agentic: AgenticConfig,
    /// Cap on retained bootstrap commands.
    pub bootstrap_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deploy: DeployConfig::default(),
            compaction: CompactionPolicy::default(),
            retry: RetryPolicy::default(),
            model: ModelConfig::default(),
            phasic: PhasicConfig::default(),
            agentic: AgenticConfig::default(),
            bootstrap_cap: DEFAULT_MAX_COMMANDS,
        }
    }
}

/// Raw TOML structure for `crucible.toml`.
#[derive(Debug, Deserialize)]
struct EngineToml {
    deploy: Option<DeploySection>,
    compaction: Option<CompactionSection>,
    model: Option<ModelSection>,
    phasic: Option<PhasicSection>,
    agentic: Option<AgenticSection>,
    bootstrap: Option<BootstrapSection>,
}

#[derive(Debug, Deserialize)]
struct DeploySection {
    attempt_timeout_secs: Option<u64>,
    master_timeout_secs: Option<u64>,
    backoff_base_ms: Option<u64>,
    backoff_cap_secs: Option<u64>,
    failures_per_reset: Option<u32>,
    health_interval_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
    init_command: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompactionSection {
    max_user_turns: Option<usize>,
    max_estimated_tokens: Option<usize>,
    preserved_tail: Option<usize>,
    image_token_surcharge: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ModelSection {
    model: Option<String>,
    temperature: Option<f32>,
    max_output_tokens: Option<u32>,
    fallback_model: Option<String>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PhasicSection {
    phase_budget: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct AgenticSection {
    max_tool_depth: Option<usize>,
    max_passes: Option<usize>,
    compaction_check_interval: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct BootstrapSection {
    max_commands: Option<usize>,
}

impl EngineConfig {
    /// Load config from `crucible.toml` in the project directory.
    /// Returns defaults if the file doesn't exist.
    pub fn load(project_path: &Path) -> Result<Self> {
        let config_path = project_path.join("crucible.toml");
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let toml: EngineToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let mut config = Self::default();
        if let Some(section) = toml.deploy {
            if let Some(secs) = section.attempt_timeout_secs {
                config.deploy.attempt_timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = section.master_timeout_secs {
                config.deploy.master_timeout = Duration::from_secs(secs);
            }
            if let Some(ms) = section.backoff_base_ms {
                config.deploy.backoff_base = Duration::from_millis(ms);
            }
            if let Some(secs) = section.backoff_cap_secs {
                config.deploy.backoff_cap = Duration::from_secs(secs);
            }
            if let Some(n) = section.failures_per_reset {
                config.deploy.failures_per_reset = n.max(1);
            }
            if let Some(secs) = section.health_interval_secs {
                config.deploy.health_interval = Duration::from_secs(secs);
            }
            if let Some(secs) = section.command_timeout_secs {
                config.deploy.command_timeout = Duration::from_secs(secs);
            }
            if let Some(cmd) = section.init_command {
                config.deploy.init_command = Some(cmd);
            }
        }
        if let Some(section) = toml.compaction {
            if let Some(n) = section.max_user_turns {
                config.compaction.max_user_turns = n;
            }
            if let Some(n) = section.max_estimated_tokens {
                config.compaction.max_estimated_tokens = n;
            }
            if let Some(n) = section.preserved_tail {
                config.compaction.preserved_tail = n.max(1);
            }
            if let Some(n) = section.image_token_surcharge {
                config.compaction.image_token_surcharge = n;
            }
        }
        if let Some(section) = toml.model {
            // The model section is a user override; merge it field by
            // field with constraint validation.
            let user = ModelOverride {
                model: section.model,
                temperature: section.temperature,
                max_output_tokens: section.max_output_tokens,
            };
            config.model = config.model.with_override(&user);
            if let Some(fallback) = section.fallback_model {
                config.model.fallback_model = Some(fallback);
            }
            if let Some(n) = section.max_attempts {
                config.retry.max_attempts = n.max(1);
            }
        }
        if let Some(section) = toml.phasic {
            if let Some(n) = section.phase_budget {
                config.phasic.phase_budget = n.max(1);
            }
        }
        if let Some(section) = toml.agentic {
            if let Some(n) = section.max_tool_depth {
                config.agentic.max_tool_depth = n.max(1);
            }
            if let Some(n) = section.max_passes {
                config.agentic.max_passes = n.max(1);
            }
            if let Some(n) = section.compaction_check_interval {
                config.agentic.compaction_check_interval = n.max(1);
            }
        }
        if let Some(section) = toml.bootstrap {
            if let Some(n) = section.max_commands {
                config.bootstrap_cap = n;
            }
        }

        Ok(config)
    }
}
