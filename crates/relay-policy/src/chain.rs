use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    OnIngress,
    OnSendPreCacheKey,
    OnSendPostRoute,
}

impl Hook {
    pub fn as_str(self) -> &'static str {
        match self {
            Hook::OnIngress => "on_ingress",
            Hook::OnSendPreCacheKey => "on_send_pre_cache_key",
            Hook::OnSendPostRoute => "on_send_post_route",
        }
    }

    /// Mutation is permitted everywhere except after routing.
    pub fn allows_mutation(self) -> bool {
        !matches!(self, Hook::OnSendPostRoute)
    }
}

impl std::fmt::Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Critical,
    BestEffort,
}

/// Decision returned by an interceptor hook.
#[derive(Debug, Clone)]
pub enum HookDecision {
    Allow {
        reason_code: Option<String>,
    },
    /// Merge `fields` into the request object. Rejected at
    /// `on_send_post_route`.
    Mutate {
        fields: Map<String, Value>,
        reason_code: Option<String>,
    },
    Drop {
        reason_code: String,
    },
}

/// Trait for request interceptors. All hook methods default to `Allow`;
/// implement only the hooks you care about.
#[async_trait::async_trait]
pub trait Interceptor: Send + Sync {
    fn id(&self) -> &str;

    fn criticality(&self) -> Criticality {
        Criticality::BestEffort
    }

    async fn on_ingress(&self, _request: &Value) -> Result<HookDecision, String> {
        Ok(HookDecision::Allow { reason_code: None })
    }

    async fn on_send_pre_cache_key(&self, _request: &Value) -> Result<HookDecision, String> {
        Ok(HookDecision::Allow { reason_code: None })
    }

    async fn on_send_post_route(&self, _request: &Value) -> Result<HookDecision, String> {
        Ok(HookDecision::Allow { reason_code: None })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InterceptorReport {
    pub interceptor_id: String,
    pub criticality: Criticality,
    pub hook: Hook,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mutated_fields: Vec<String>,
    pub duration_ms: f64,
}

#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub request: Value,
    pub reports: Vec<InterceptorReport>,
    pub dropped: bool,
    pub drop_reason_code: Option<String>,
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("critical interceptor \"{id}\" failed on {hook}: {message}")]
    CriticalFailure {
        id: String,
        hook: Hook,
        message: String,
    },

    #[error("forbidden mutation: interceptor \"{id}\" attempted to mutate at {hook}")]
    ForbiddenMutation { id: String, hook: Hook },
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub total_budget_ms: u64,
    pub per_hook_budget_ms: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            total_budget_ms: 20,
            per_hook_budget_ms: 5,
        }
    }
}

/// Run one hook across the interceptors in registration order.
pub async fn run_chain(
    hook: Hook,
    request: &Value,
    interceptors: &[Arc<dyn Interceptor>],
    config: &ChainConfig,
) -> Result<ChainOutcome, ChainError> {
    let chain_start = Instant::now();
    let mut mutated: Option<Value> = None;
    let mut reports = Vec::with_capacity(interceptors.len());

    for interceptor in interceptors {
        let id = interceptor.id().to_string();
        let criticality = interceptor.criticality();

        if chain_start.elapsed().as_millis() as u64 > config.total_budget_ms {
            reports.push(InterceptorReport {
                interceptor_id: id,
                criticality,
                hook,
                action: "skipped".to_string(),
                reason_code: Some("chain_budget_exceeded".to_string()),
                mutated_fields: Vec::new(),
                duration_ms: 0.0,
            });
            continue;
        }

        let effective = mutated.as_ref().unwrap_or(request);
        let hook_start = Instant::now();
        let result = match hook {
            Hook::OnIngress => interceptor.on_ingress(effective).await,
            Hook::OnSendPreCacheKey => interceptor.on_send_pre_cache_key(effective).await,
            Hook::OnSendPostRoute => interceptor.on_send_post_route(effective).await,
        };
        let duration_ms = hook_start.elapsed().as_secs_f64() * 1000.0;
        let over_hook_budget = duration_ms > config.per_hook_budget_ms as f64;

        let decision = match result {
            Ok(decision) => decision,
            Err(message) => {
                if criticality == Criticality::Critical {
                    return Err(ChainError::CriticalFailure { id, hook, message });
                }
                tracing::warn!(interceptor = %id, hook = %hook, error = %message, "best-effort interceptor failed");
                reports.push(InterceptorReport {
                    interceptor_id: id,
                    criticality,
                    hook,
                    action: "allow".to_string(),
                    reason_code: Some("interceptor_error".to_string()),
                    mutated_fields: Vec::new(),
                    duration_ms,
                });
                continue;
            }
        };

        match decision {
            HookDecision::Drop { reason_code } => {
                reports.push(InterceptorReport {
                    interceptor_id: id,
                    criticality,
                    hook,
                    action: "drop".to_string(),
                    reason_code: Some(reason_code.clone()),
                    mutated_fields: Vec::new(),
                    duration_ms,
                });
                return Ok(ChainOutcome {
                    request: mutated.unwrap_or_else(|| request.clone()),
                    reports,
                    dropped: true,
                    drop_reason_code: Some(reason_code),
                });
            }
            HookDecision::Mutate {
                fields,
                reason_code,
            } => {
                if !hook.allows_mutation() {
                    return Err(ChainError::ForbiddenMutation { id, hook });
                }
                if over_hook_budget {
                    // Over-budget hooks are reported but their mutation is
                    // discarded.
                    reports.push(InterceptorReport {
                        interceptor_id: id,
                        criticality,
                        hook,
                        action: "allow".to_string(),
                        reason_code: Some("hook_budget_exceeded".to_string()),
                        mutated_fields: Vec::new(),
                        duration_ms,
                    });
                    continue;
                }
                let target = mutated.get_or_insert_with(|| request.clone());
                let mut mutated_fields: Vec<String> = Vec::with_capacity(fields.len());
                if let Some(object) = target.as_object_mut() {
                    for (key, value) in fields {
                        mutated_fields.push(key.clone());
                        object.insert(key, value);
                    }
                }
                reports.push(InterceptorReport {
                    interceptor_id: id,
                    criticality,
                    hook,
                    action: "mutate".to_string(),
                    reason_code,
                    mutated_fields,
                    duration_ms,
                });
            }
            HookDecision::Allow { reason_code } => {
                let reason_code = if over_hook_budget {
                    Some("hook_budget_exceeded".to_string())
                } else {
                    reason_code.or_else(|| Some("allow".to_string()))
                };
                reports.push(InterceptorReport {
                    interceptor_id: id,
                    criticality,
                    hook,
                    action: "allow".to_string(),
                    reason_code,
                    mutated_fields: Vec::new(),
                    duration_ms,
                });
            }
        }
    }

    Ok(ChainOutcome {
        request: mutated.unwrap_or_else(|| request.clone()),
        reports,
        dropped: false,
        drop_reason_code: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct AllowAll {
        name: String,
    }

    #[async_trait::async_trait]
    impl Interceptor for AllowAll {
        fn id(&self) -> &str {
            &self.name
        }
    }

    struct TagInjector;

    #[async_trait::async_trait]
    impl Interceptor for TagInjector {
        fn id(&self) -> &str {
            "tag-injector"
        }

        async fn on_ingress(&self, _request: &Value) -> Result<HookDecision, String> {
            let mut fields = Map::new();
            fields.insert("injected".to_string(), json!(true));
            Ok(HookDecision::Mutate {
                fields,
                reason_code: Some("tagged".to_string()),
            })
        }

        async fn on_send_post_route(&self, _request: &Value) -> Result<HookDecision, String> {
            let mut fields = Map::new();
            fields.insert("late".to_string(), json!(true));
            Ok(HookDecision::Mutate {
                fields,
                reason_code: None,
            })
        }
    }

    struct Dropper;

    #[async_trait::async_trait]
    impl Interceptor for Dropper {
        fn id(&self) -> &str {
            "dropper"
        }

        async fn on_ingress(&self, _request: &Value) -> Result<HookDecision, String> {
            Ok(HookDecision::Drop {
                reason_code: "policy_block".to_string(),
            })
        }
    }

    struct Failing {
        critical: bool,
    }

    #[async_trait::async_trait]
    impl Interceptor for Failing {
        fn id(&self) -> &str {
            "failing"
        }

        fn criticality(&self) -> Criticality {
            if self.critical {
                Criticality::Critical
            } else {
                Criticality::BestEffort
            }
        }

        async fn on_ingress(&self, _request: &Value) -> Result<HookDecision, String> {
            Err("backend unavailable".to_string())
        }
    }

    fn chain(items: Vec<Arc<dyn Interceptor>>) -> Vec<Arc<dyn Interceptor>> {
        items
    }

    #[tokio::test]
    async fn mutation_clones_request_and_reports_fields() {
        let request = json!({"model": "m1"});
        let interceptors = chain(vec![Arc::new(TagInjector) as Arc<dyn Interceptor>]);
        let outcome = run_chain(
            Hook::OnIngress,
            &request,
            &interceptors,
            &ChainConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.request["injected"], json!(true));
        // The original request value is untouched.
        assert!(request.get("injected").is_none());
        assert_eq!(outcome.reports[0].action, "mutate");
        assert_eq!(outcome.reports[0].mutated_fields, vec!["injected"]);
    }

    #[tokio::test]
    async fn post_route_mutation_is_forbidden() {
        let request = json!({"model": "m1"});
        let interceptors = chain(vec![Arc::new(TagInjector) as Arc<dyn Interceptor>]);
        let err = run_chain(
            Hook::OnSendPostRoute,
            &request,
            &interceptors,
            &ChainConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChainError::ForbiddenMutation { .. }));
        assert!(err.to_string().contains("forbidden mutation"));
    }

    #[tokio::test]
    async fn drop_short_circuits_remaining_interceptors() {
        let request = json!({});
        let interceptors = chain(vec![
            Arc::new(Dropper) as Arc<dyn Interceptor>,
            Arc::new(AllowAll {
                name: "after".to_string(),
            }),
        ]);
        let outcome = run_chain(
            Hook::OnIngress,
            &request,
            &interceptors,
            &ChainConfig::default(),
        )
        .await
        .unwrap();
        assert!(outcome.dropped);
        assert_eq!(outcome.drop_reason_code.as_deref(), Some("policy_block"));
        assert_eq!(outcome.reports.len(), 1);
    }

    #[tokio::test]
    async fn critical_failure_aborts_with_annotated_error() {
        let request = json!({});
        let interceptors = chain(vec![Arc::new(Failing { critical: true }) as Arc<dyn Interceptor>]);
        let err = run_chain(
            Hook::OnIngress,
            &request,
            &interceptors,
            &ChainConfig::default(),
        )
        .await
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("critical interceptor \"failing\" failed on on_ingress"));
    }

    #[tokio::test]
    async fn best_effort_failure_records_and_continues() {
        let request = json!({});
        let interceptors = chain(vec![
            Arc::new(Failing { critical: false }) as Arc<dyn Interceptor>,
            Arc::new(AllowAll {
                name: "after".to_string(),
            }),
        ]);
        let outcome = run_chain(
            Hook::OnIngress,
            &request,
            &interceptors,
            &ChainConfig::default(),
        )
        .await
        .unwrap();
        assert!(!outcome.dropped);
        assert_eq!(outcome.reports.len(), 2);
        assert_eq!(
            outcome.reports[0].reason_code.as_deref(),
            Some("interceptor_error")
        );
        assert_eq!(outcome.reports[1].action, "allow");
    }

    #[tokio::test]
    async fn exhausted_chain_budget_skips_remaining_interceptors() {
        struct Slow;

        #[async_trait::async_trait]
        impl Interceptor for Slow {
            fn id(&self) -> &str {
                "slow"
            }

            async fn on_ingress(&self, _request: &Value) -> Result<HookDecision, String> {
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                Ok(HookDecision::Allow { reason_code: None })
            }
        }

        let request = json!({});
        let interceptors = chain(vec![
            Arc::new(Slow) as Arc<dyn Interceptor>,
            Arc::new(AllowAll {
                name: "starved".to_string(),
            }),
        ]);
        let outcome = run_chain(
            Hook::OnIngress,
            &request,
            &interceptors,
            &ChainConfig {
                total_budget_ms: 20,
                per_hook_budget_ms: 5,
            },
        )
        .await
        .unwrap();
        // The slow hook ran over its per-hook budget and the second one
        // was skipped once the chain budget was gone.
        assert_eq!(
            outcome.reports[0].reason_code.as_deref(),
            Some("hook_budget_exceeded")
        );
        assert_eq!(outcome.reports[1].action, "skipped");
        assert_eq!(
            outcome.reports[1].reason_code.as_deref(),
            Some("chain_budget_exceeded")
        );
    }

    #[tokio::test]
    async fn over_budget_mutation_is_discarded() {
        struct SlowMutator;

        #[async_trait::async_trait]
        impl Interceptor for SlowMutator {
            fn id(&self) -> &str {
                "slow-mutator"
            }

            async fn on_ingress(&self, _request: &Value) -> Result<HookDecision, String> {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                let mut fields = Map::new();
                fields.insert("late".to_string(), json!(true));
                Ok(HookDecision::Mutate {
                    fields,
                    reason_code: None,
                })
            }
        }

        let request = json!({});
        let interceptors = chain(vec![Arc::new(SlowMutator) as Arc<dyn Interceptor>]);
        let outcome = run_chain(
            Hook::OnIngress,
            &request,
            &interceptors,
            &ChainConfig {
                total_budget_ms: 100,
                per_hook_budget_ms: 5,
            },
        )
        .await
        .unwrap();
        assert!(outcome.request.get("late").is_none());
        assert_eq!(
            outcome.reports[0].reason_code.as_deref(),
            Some("hook_budget_exceeded")
        );
    }
}
