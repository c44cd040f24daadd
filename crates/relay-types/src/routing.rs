use serde::{Deserialize, Serialize};

/// The closed set of provider CLIs the runtime dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Claude,
    Codex,
    Gemini,
    Opencode,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Codex => "codex",
            Provider::Gemini => "gemini",
            Provider::Opencode => "opencode",
        }
    }

    /// Parse a provider name or CLI alias (`claude-code-cli`, `codex-cli`, ...).
    pub fn parse_alias(raw: &str) -> Option<Provider> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "claude" | "claude-code" | "claude-code-cli" => Some(Provider::Claude),
            "codex" | "codex-cli" => Some(Provider::Codex),
            "gemini" | "gemini-cli" => Some(Provider::Gemini),
            "opencode" | "opencode-cli" => Some(Provider::Opencode),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Implementer,
    Reviewer,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Implementer => "implementer",
            AgentRole::Reviewer => "reviewer",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing tiers. The classifier emits `simple`/`complex`; `moderate`
/// exists as an escalation step between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityTier {
    Simple,
    Moderate,
    Complex,
}

impl ComplexityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ComplexityTier::Simple => "simple",
            ComplexityTier::Moderate => "moderate",
            ComplexityTier::Complex => "complex",
        }
    }
}

impl std::fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ComplexityTier {
    /// Escalation order: simple → moderate → complex.
    pub fn escalation_from(self) -> &'static [ComplexityTier] {
        const ORDER: [ComplexityTier; 3] = [
            ComplexityTier::Simple,
            ComplexityTier::Moderate,
            ComplexityTier::Complex,
        ];
        let start = match self {
            ComplexityTier::Simple => 0,
            ComplexityTier::Moderate => 1,
            ComplexityTier::Complex => 2,
        };
        &ORDER[start..]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Simple,
    Complex,
}

impl ComplexityLevel {
    pub fn tier(self) -> ComplexityTier {
        match self {
            ComplexityLevel::Simple => ComplexityTier::Simple,
            ComplexityLevel::Complex => ComplexityTier::Complex,
        }
    }
}

/// Output of the heuristic task classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub level: ComplexityLevel,
    pub confidence: f64,
    pub matched_features: Vec<String>,
    pub classifier_id: String,
}

/// A resolved CLI invocation for one provider/role pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub command: String,
    pub args: Vec<String>,
    pub display: String,
}
