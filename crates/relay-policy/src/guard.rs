use relay_types::{BudgetDecision, BudgetPolicy, BudgetRequest, BudgetVerdict, ModelCandidate};

/// Reason codes emitted by the guard.
pub mod reason {
    pub const MISSING_REQUIRED_TAG: &str = "missing_required_tag";
    pub const DENIED_TAG: &str = "denied_tag";
    pub const MODEL_BUDGET_EXCEEDED: &str = "model_budget_exceeded";
    pub const PROVIDER_BUDGET_EXCEEDED: &str = "provider_budget_exceeded";
    pub const EMERGENCY_BUDGET_EXCEEDED: &str = "emergency_budget_exceeded";
    pub const NON_INTERACTIVE_QUEUE: &str = "non_interactive_queue";
    pub const WITHIN_BUDGET: &str = "within_budget";
    pub const EMERGENCY_MODEL_ALLOWED: &str = "emergency_model_allowed";
}

const DEFAULT_QUEUE_RETRY_S: u64 = 900;
const DEFAULT_DENY_RETRY_S: u64 = 3600;

fn estimate_cost(request: &BudgetRequest, candidate: &ModelCandidate) -> f64 {
    (request.input_tokens as f64 / 1000.0) * candidate.input_cost_per_1k
        + (request.output_tokens as f64 / 1000.0) * candidate.output_cost_per_1k
}

fn push_reason(reasons: &mut Vec<String>, code: &str) {
    if !reasons.iter().any(|r| r == code) {
        reasons.push(code.to_string());
    }
}

/// Filter candidates against the policy and decide allow / degrade /
/// queue / deny.
pub fn filter_candidates(
    request: &BudgetRequest,
    candidates: &[ModelCandidate],
    policy: &BudgetPolicy,
    preferred_model: Option<&str>,
) -> BudgetDecision {
    let candidates_before = candidates.len();
    let mut reasons: Vec<String> = Vec::new();
    let mut survivors: Vec<&ModelCandidate> = Vec::new();

    for candidate in candidates {
        if !policy.allowed_tags.is_empty()
            && !policy
                .allowed_tags
                .iter()
                .all(|tag| candidate.tags.contains(tag))
        {
            push_reason(&mut reasons, reason::MISSING_REQUIRED_TAG);
            continue;
        }
        if candidate
            .tags
            .iter()
            .any(|tag| policy.denied_tags.contains(tag))
        {
            push_reason(&mut reasons, reason::DENIED_TAG);
            continue;
        }

        let cost = estimate_cost(request, candidate);
        if let Some(cap) = policy.per_model_caps.get(&candidate.model_id) {
            if cost > *cap {
                push_reason(&mut reasons, reason::MODEL_BUDGET_EXCEEDED);
                continue;
            }
        }
        if let Some(cap) = policy.per_request_cap {
            if cost > cap {
                push_reason(&mut reasons, reason::PROVIDER_BUDGET_EXCEEDED);
                continue;
            }
        }
        survivors.push(candidate);
    }

    if !survivors.is_empty() {
        push_reason(&mut reasons, reason::WITHIN_BUDGET);
        let selected = preferred_model
            .and_then(|preferred| {
                survivors
                    .iter()
                    .find(|c| c.model_id == preferred)
                    .map(|c| c.model_id.clone())
            })
            .unwrap_or_else(|| survivors[0].model_id.clone());
        return BudgetDecision {
            verdict: BudgetVerdict::Allow,
            reason_codes: reasons,
            candidates_before,
            candidates_after: survivors.len(),
            selected_model: Some(selected),
            degraded_model: None,
            retry_after_s: None,
        };
    }

    // Emergency degrade path: interactive callers only, and the emergency
    // model must exist in the unfiltered input.
    if policy.allow_emergency_degrade && request.interactive {
        if let Some(emergency_id) = &policy.emergency_model_id {
            if let Some(emergency) = candidates.iter().find(|c| &c.model_id == emergency_id) {
                let cost = estimate_cost(request, emergency);
                let cap = policy.emergency_cap.unwrap_or(f64::INFINITY);
                if cost <= cap {
                    push_reason(&mut reasons, reason::EMERGENCY_MODEL_ALLOWED);
                    return BudgetDecision {
                        verdict: BudgetVerdict::Degrade,
                        reason_codes: reasons,
                        candidates_before,
                        candidates_after: 0,
                        selected_model: Some(emergency.model_id.clone()),
                        degraded_model: Some(emergency.model_id.clone()),
                        retry_after_s: None,
                    };
                }
                push_reason(&mut reasons, reason::EMERGENCY_BUDGET_EXCEEDED);
            }
        }
    }

    if !request.interactive {
        push_reason(&mut reasons, reason::NON_INTERACTIVE_QUEUE);
        return BudgetDecision {
            verdict: BudgetVerdict::Queue,
            reason_codes: reasons,
            candidates_before,
            candidates_after: 0,
            selected_model: None,
            degraded_model: None,
            retry_after_s: Some(policy.retry_after_seconds.unwrap_or(DEFAULT_QUEUE_RETRY_S)),
        };
    }

    BudgetDecision {
        verdict: BudgetVerdict::Deny,
        reason_codes: reasons,
        candidates_before,
        candidates_after: 0,
        selected_model: None,
        degraded_model: None,
        retry_after_s: Some(DEFAULT_DENY_RETRY_S),
    }
}
