use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use relay_types::{AgentRole, CommandTemplate, Provider};

/// Codex reasoning-effort levels accepted from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ReasoningEffort {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "minimal" => Some(Self::Minimal),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "xhigh" => Some(Self::Xhigh),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Xhigh => "xhigh",
        }
    }
}

/// Non-interactive CLI templates per provider and role.
#[derive(Debug, Clone)]
pub struct ProviderCatalog {
    entries: HashMap<(Provider, AgentRole), Vec<String>>,
}

impl Default for ProviderCatalog {
    fn default() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            (Provider::Claude, AgentRole::Implementer),
            args(&["-p", "--dangerously-skip-permissions"]),
        );
        entries.insert((Provider::Claude, AgentRole::Reviewer), args(&["-p"]));
        entries.insert(
            (Provider::Codex, AgentRole::Implementer),
            args(&["exec", "--full-auto"]),
        );
        entries.insert(
            (Provider::Codex, AgentRole::Reviewer),
            args(&["exec", "--sandbox", "read-only"]),
        );
        entries.insert((Provider::Gemini, AgentRole::Implementer), args(&["--yolo"]));
        entries.insert((Provider::Gemini, AgentRole::Reviewer), args(&["--plan"]));
        entries.insert((Provider::Opencode, AgentRole::Implementer), args(&["run"]));
        entries.insert((Provider::Opencode, AgentRole::Reviewer), args(&["run"]));
        Self { entries }
    }
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl ProviderCatalog {
    /// Whether the catalog carries a non-empty entry for this pair.
    pub fn supports(&self, provider: Provider, role: AgentRole) -> bool {
        self.entries
            .get(&(provider, role))
            .map(|args| !args.is_empty())
            .unwrap_or(false)
    }

    /// Replace (or clear) the template for a provider/role pair.
    pub fn set(&mut self, provider: Provider, role: AgentRole, arguments: Vec<String>) {
        self.entries.insert((provider, role), arguments);
    }

    /// Compose the full CLI invocation: base template plus `--model` and,
    /// for codex only, the reasoning-effort config flag.
    pub fn build_command(
        &self,
        provider: Provider,
        role: AgentRole,
        model: Option<&str>,
        reasoning: Option<ReasoningEffort>,
    ) -> Option<CommandTemplate> {
        let base = self.entries.get(&(provider, role))?;
        if base.is_empty() {
            return None;
        }
        let mut arguments = base.clone();
        if let Some(model) = model {
            arguments.push("--model".to_string());
            arguments.push(model.to_string());
        }
        if provider == Provider::Codex {
            if let Some(effort) = reasoning {
                arguments.push("-c".to_string());
                arguments.push(format!("model_reasoning_effort={}", effort.as_str()));
            }
        }
        let display = std::iter::once(provider.as_str().to_string())
            .chain(arguments.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        Some(CommandTemplate {
            command: provider.as_str().to_string(),
            args: arguments,
            display,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_covers_every_provider_role_pair() {
        let catalog = ProviderCatalog::default();
        for provider in [
            Provider::Claude,
            Provider::Codex,
            Provider::Gemini,
            Provider::Opencode,
        ] {
            for role in [AgentRole::Implementer, AgentRole::Reviewer] {
                assert!(catalog.supports(provider, role), "{provider} {role}");
            }
        }
    }

    #[test]
    fn model_flag_is_appended() {
        let catalog = ProviderCatalog::default();
        let command = catalog
            .build_command(
                Provider::Claude,
                AgentRole::Implementer,
                Some("opus"),
                None,
            )
            .unwrap();
        assert_eq!(command.command, "claude");
        assert!(command
            .args
            .windows(2)
            .any(|w| w[0] == "--model" && w[1] == "opus"));
        assert!(command.display.starts_with("claude -p"));
    }

    #[test]
    fn reasoning_effort_applies_to_codex_only() {
        let catalog = ProviderCatalog::default();
        let codex = catalog
            .build_command(
                Provider::Codex,
                AgentRole::Reviewer,
                None,
                Some(ReasoningEffort::High),
            )
            .unwrap();
        assert!(codex
            .args
            .windows(2)
            .any(|w| w[0] == "-c" && w[1] == "model_reasoning_effort=high"));

        let claude = catalog
            .build_command(
                Provider::Claude,
                AgentRole::Implementer,
                None,
                Some(ReasoningEffort::High),
            )
            .unwrap();
        assert!(!claude.args.iter().any(|a| a.contains("reasoning")));
    }

    #[test]
    fn cleared_entry_is_unsupported() {
        let mut catalog = ProviderCatalog::default();
        catalog.set(Provider::Gemini, AgentRole::Reviewer, Vec::new());
        assert!(!catalog.supports(Provider::Gemini, AgentRole::Reviewer));
        assert!(catalog
            .build_command(Provider::Gemini, AgentRole::Reviewer, None, None)
            .is_none());
    }

    #[test]
    fn reasoning_effort_parses_the_closed_set() {
        assert_eq!(ReasoningEffort::parse("xhigh"), Some(ReasoningEffort::Xhigh));
        assert_eq!(ReasoningEffort::parse("HIGH"), Some(ReasoningEffort::High));
        assert_eq!(ReasoningEffort::parse("extreme"), None);
    }
}
