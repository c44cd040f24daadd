use std::collections::HashMap;

use relay_types::{AgentRole, ComplexityTier, Provider};

use crate::catalog::ProviderCatalog;
use crate::env::{EnvConfig, ProviderError};

/// Complexity tier → provider mapping with upward escalation.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    by_tier: HashMap<ComplexityTier, Provider>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        let mut by_tier = HashMap::new();
        by_tier.insert(ComplexityTier::Simple, Provider::Codex);
        by_tier.insert(ComplexityTier::Moderate, Provider::Claude);
        by_tier.insert(ComplexityTier::Complex, Provider::Claude);
        Self { by_tier }
    }
}

impl RoutingTable {
    /// Defaults plus any `SPEC_CONTEXT_ROUTE_*` overrides.
    pub fn from_env(config: &EnvConfig) -> Self {
        let mut table = Self::default();
        for (tier, provider) in &config.route_overrides {
            table.by_tier.insert(*tier, *provider);
        }
        table
    }

    pub fn provider_for(&self, tier: ComplexityTier) -> Option<Provider> {
        self.by_tier.get(&tier).copied()
    }

    /// Walk the escalation order from `tier` until a provider with a
    /// non-empty catalog entry for `role` is found.
    pub fn resolve(
        &self,
        tier: ComplexityTier,
        role: AgentRole,
        catalog: &ProviderCatalog,
    ) -> Result<(ComplexityTier, Provider), ProviderError> {
        for candidate in tier.escalation_from() {
            if let Some(provider) = self.provider_for(*candidate) {
                if catalog.supports(provider, role) {
                    return Ok((*candidate, provider));
                }
            }
        }
        Err(ProviderError::NoProviderForRole { role, tier })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdMap;

    #[test]
    fn defaults_route_simple_to_codex_and_complex_to_claude() {
        let table = RoutingTable::default();
        assert_eq!(table.provider_for(ComplexityTier::Simple), Some(Provider::Codex));
        assert_eq!(
            table.provider_for(ComplexityTier::Complex),
            Some(Provider::Claude)
        );
    }

    #[test]
    fn env_overrides_replace_tier_entries() {
        let env: StdMap<String, String> = [(
            "SPEC_CONTEXT_ROUTE_SIMPLE".to_string(),
            "gemini".to_string(),
        )]
        .into_iter()
        .collect();
        let config = EnvConfig::from_env(&env).unwrap();
        let table = RoutingTable::from_env(&config);
        assert_eq!(
            table.provider_for(ComplexityTier::Simple),
            Some(Provider::Gemini)
        );
        assert_eq!(
            table.provider_for(ComplexityTier::Moderate),
            Some(Provider::Claude)
        );
    }

    #[test]
    fn resolve_escalates_past_unsupported_tiers() {
        let table = RoutingTable::default();
        let mut catalog = ProviderCatalog::default();
        // Simple routes to codex; clearing codex's reviewer entry forces
        // escalation to moderate (claude).
        catalog.set(Provider::Codex, AgentRole::Reviewer, Vec::new());
        let (tier, provider) = table
            .resolve(ComplexityTier::Simple, AgentRole::Reviewer, &catalog)
            .unwrap();
        assert_eq!(tier, ComplexityTier::Moderate);
        assert_eq!(provider, Provider::Claude);
    }

    #[test]
    fn resolve_fails_when_no_tier_supports_the_role() {
        let table = RoutingTable::default();
        let mut catalog = ProviderCatalog::default();
        catalog.set(Provider::Codex, AgentRole::Reviewer, Vec::new());
        catalog.set(Provider::Claude, AgentRole::Reviewer, Vec::new());
        let err = table
            .resolve(ComplexityTier::Simple, AgentRole::Reviewer, &catalog)
            .unwrap_err();
        assert!(matches!(err, ProviderError::NoProviderForRole { .. }));
    }

    #[test]
    fn complex_tier_does_not_de_escalate() {
        let table = RoutingTable::default();
        let mut catalog = ProviderCatalog::default();
        catalog.set(Provider::Claude, AgentRole::Implementer, Vec::new());
        // Complex maps to claude only; simple/moderate are not consulted.
        assert!(table
            .resolve(ComplexityTier::Complex, AgentRole::Implementer, &catalog)
            .is_err());
    }
}
