use std::collections::HashMap;

use thiserror::Error;

use relay_types::{AgentRole, ComplexityTier, Provider};

use crate::catalog::ReasoningEffort;

pub const ENV_DISCIPLINE: &str = "SPEC_CONTEXT_DISCIPLINE";
pub const ENV_IMPLEMENTER: &str = "SPEC_CONTEXT_IMPLEMENTER";
pub const ENV_REVIEWER: &str = "SPEC_CONTEXT_REVIEWER";
pub const ENV_DISPATCH_RUNTIME_V2: &str = "SPEC_CONTEXT_DISPATCH_RUNTIME_V2";

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("unknown provider \"{name}\" in {variable}")]
    UnknownProvider { variable: String, name: String },

    #[error("no provider configured for role {role} at or above tier {tier}")]
    NoProviderForRole { role: AgentRole, tier: ComplexityTier },
}

/// Context discipline controls how much guide text rides each prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextDiscipline {
    #[default]
    Full,
    Standard,
    Minimal,
}

impl ContextDiscipline {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "full" => Some(Self::Full),
            "standard" => Some(Self::Standard),
            "minimal" => Some(Self::Minimal),
            _ => None,
        }
    }
}

/// `1`, `true`, `yes`, `on` (case-insensitive) are truthy.
pub fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// A role-level provider override: a known alias, or a raw CLI line used
/// verbatim as the command.
#[derive(Debug, Clone, PartialEq)]
pub enum RoleOverride {
    Provider(Provider),
    RawCli(String),
}

fn role_env_name(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Implementer => ENV_IMPLEMENTER,
        AgentRole::Reviewer => ENV_REVIEWER,
    }
}

fn role_upper(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Implementer => "IMPLEMENTER",
        AgentRole::Reviewer => "REVIEWER",
    }
}

fn tier_upper(tier: ComplexityTier) -> &'static str {
    match tier {
        ComplexityTier::Simple => "SIMPLE",
        ComplexityTier::Moderate => "MODERATE",
        ComplexityTier::Complex => "COMPLEX",
    }
}

const ALL_ROLES: [AgentRole; 2] = [AgentRole::Implementer, AgentRole::Reviewer];
const ALL_TIERS: [ComplexityTier; 3] = [
    ComplexityTier::Simple,
    ComplexityTier::Moderate,
    ComplexityTier::Complex,
];

/// Environment-derived provider configuration, parsed once at startup.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub discipline: ContextDiscipline,
    pub role_overrides: HashMap<AgentRole, RoleOverride>,
    pub models: HashMap<(AgentRole, ComplexityTier), String>,
    pub reasoning: HashMap<AgentRole, ReasoningEffort>,
    pub reasoning_by_tier: HashMap<(AgentRole, ComplexityTier), ReasoningEffort>,
    pub route_overrides: HashMap<ComplexityTier, Provider>,
    pub dispatch_runtime_v2: bool,
}

impl EnvConfig {
    /// Parse from an environment map. Unknown route providers are fatal;
    /// an invalid discipline or reasoning value warns and falls back.
    pub fn from_env(env: &HashMap<String, String>) -> Result<Self, ProviderError> {
        let mut config = EnvConfig::default();

        if let Some(raw) = env.get(ENV_DISCIPLINE) {
            match ContextDiscipline::parse(raw) {
                Some(discipline) => config.discipline = discipline,
                None => {
                    tracing::warn!(value = %raw, "invalid {ENV_DISCIPLINE}; defaulting to full");
                }
            }
        }

        for role in ALL_ROLES {
            if let Some(raw) = env.get(role_env_name(role)) {
                let value = raw.trim();
                if value.is_empty() {
                    continue;
                }
                let parsed = match Provider::parse_alias(value) {
                    Some(provider) => RoleOverride::Provider(provider),
                    None => RoleOverride::RawCli(value.to_string()),
                };
                config.role_overrides.insert(role, parsed);
            }

            let effort_var = format!("SPEC_CONTEXT_{}_REASONING_EFFORT", role_upper(role));
            if let Some(raw) = env.get(&effort_var) {
                match ReasoningEffort::parse(raw) {
                    Some(effort) => {
                        config.reasoning.insert(role, effort);
                    }
                    None => tracing::warn!(value = %raw, variable = %effort_var, "invalid reasoning effort; ignoring"),
                }
            }

            for tier in ALL_TIERS {
                let model_var = format!(
                    "SPEC_CONTEXT_{}_MODEL_{}",
                    role_upper(role),
                    tier_upper(tier)
                );
                if let Some(raw) = env.get(&model_var) {
                    if !raw.trim().is_empty() {
                        config.models.insert((role, tier), raw.trim().to_string());
                    }
                }

                let tier_effort_var = format!(
                    "SPEC_CONTEXT_{}_REASONING_EFFORT_{}",
                    role_upper(role),
                    tier_upper(tier)
                );
                if let Some(raw) = env.get(&tier_effort_var) {
                    match ReasoningEffort::parse(raw) {
                        Some(effort) => {
                            config.reasoning_by_tier.insert((role, tier), effort);
                        }
                        None => tracing::warn!(value = %raw, variable = %tier_effort_var, "invalid reasoning effort; ignoring"),
                    }
                }
            }
        }

        for tier in ALL_TIERS {
            let route_var = format!("SPEC_CONTEXT_ROUTE_{}", tier_upper(tier));
            if let Some(raw) = env.get(&route_var) {
                let value = raw.trim();
                if value.is_empty() {
                    continue;
                }
                let provider = Provider::parse_alias(value).ok_or_else(|| {
                    ProviderError::UnknownProvider {
                        variable: route_var.clone(),
                        name: value.to_string(),
                    }
                })?;
                config.route_overrides.insert(tier, provider);
            }
        }

        if let Some(raw) = env.get(ENV_DISPATCH_RUNTIME_V2) {
            config.dispatch_runtime_v2 = is_truthy(raw);
        }

        Ok(config)
    }

    /// Model for a role, honoring the tier-specific entry.
    pub fn model_for(&self, role: AgentRole, tier: ComplexityTier) -> Option<&str> {
        self.models.get(&(role, tier)).map(String::as_str)
    }

    /// Reasoning effort for a role: the tier-specific value wins over the
    /// role-wide one.
    pub fn reasoning_for(&self, role: AgentRole, tier: ComplexityTier) -> Option<ReasoningEffort> {
        self.reasoning_by_tier
            .get(&(role, tier))
            .or_else(|| self.reasoning.get(&role))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn discipline_defaults_and_falls_back_on_invalid() {
        let config = EnvConfig::from_env(&env(&[])).unwrap();
        assert_eq!(config.discipline, ContextDiscipline::Full);

        let config = EnvConfig::from_env(&env(&[(ENV_DISCIPLINE, "sparse")])).unwrap();
        assert_eq!(config.discipline, ContextDiscipline::Full);

        let config = EnvConfig::from_env(&env(&[(ENV_DISCIPLINE, "minimal")])).unwrap();
        assert_eq!(config.discipline, ContextDiscipline::Minimal);
    }

    #[test]
    fn role_aliases_resolve_and_raw_cli_passes_through() {
        let config = EnvConfig::from_env(&env(&[
            (ENV_IMPLEMENTER, "claude-code-cli"),
            (ENV_REVIEWER, "/usr/local/bin/my-reviewer --json"),
        ]))
        .unwrap();
        assert_eq!(
            config.role_overrides.get(&AgentRole::Implementer),
            Some(&RoleOverride::Provider(Provider::Claude))
        );
        assert_eq!(
            config.role_overrides.get(&AgentRole::Reviewer),
            Some(&RoleOverride::RawCli(
                "/usr/local/bin/my-reviewer --json".to_string()
            ))
        );
    }

    #[test]
    fn per_tier_models_and_reasoning_resolve() {
        let config = EnvConfig::from_env(&env(&[
            ("SPEC_CONTEXT_IMPLEMENTER_MODEL_SIMPLE", "fast-1"),
            ("SPEC_CONTEXT_IMPLEMENTER_MODEL_COMPLEX", "smart-1"),
            ("SPEC_CONTEXT_IMPLEMENTER_REASONING_EFFORT", "medium"),
            ("SPEC_CONTEXT_IMPLEMENTER_REASONING_EFFORT_COMPLEX", "xhigh"),
        ]))
        .unwrap();
        assert_eq!(
            config.model_for(AgentRole::Implementer, ComplexityTier::Simple),
            Some("fast-1")
        );
        assert_eq!(
            config.model_for(AgentRole::Implementer, ComplexityTier::Moderate),
            None
        );
        assert_eq!(
            config.reasoning_for(AgentRole::Implementer, ComplexityTier::Simple),
            Some(ReasoningEffort::Medium)
        );
        assert_eq!(
            config.reasoning_for(AgentRole::Implementer, ComplexityTier::Complex),
            Some(ReasoningEffort::Xhigh)
        );
    }

    #[test]
    fn unknown_route_provider_is_fatal() {
        let err = EnvConfig::from_env(&env(&[("SPEC_CONTEXT_ROUTE_SIMPLE", "mystery")]))
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnknownProvider { .. }));
        assert!(err.to_string().contains("SPEC_CONTEXT_ROUTE_SIMPLE"));
    }

    #[test]
    fn route_overrides_parse_aliases() {
        let config =
            EnvConfig::from_env(&env(&[("SPEC_CONTEXT_ROUTE_MODERATE", "gemini-cli")])).unwrap();
        assert_eq!(
            config.route_overrides.get(&ComplexityTier::Moderate),
            Some(&Provider::Gemini)
        );
    }

    #[test]
    fn truthy_parsing_accepts_the_documented_forms() {
        for value in ["1", "true", "YES", "on"] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["0", "false", "off", ""] {
            assert!(!is_truthy(value), "{value}");
        }
        let config =
            EnvConfig::from_env(&env(&[(ENV_DISPATCH_RUNTIME_V2, "yes")])).unwrap();
        assert!(config.dispatch_runtime_v2);
    }

    #[test]
    fn invalid_reasoning_effort_is_ignored() {
        let config = EnvConfig::from_env(&env(&[(
            "SPEC_CONTEXT_REVIEWER_REASONING_EFFORT",
            "extreme",
        )]))
        .unwrap();
        assert!(config
            .reasoning_for(AgentRole::Reviewer, ComplexityTier::Simple)
            .is_none());
    }
}
