use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use relay_types::{FactRole, FactTag, ImplementerResult, ReviewerResult, SessionFact};

static CONVENTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)convention|pattern|naming|style|camelCase|snake_case|pascalcase|format")
        .expect("convention regex")
});

/// Deterministic fact id: stable hash over subject, relation, object.
pub fn fact_id(subject: &str, relation: &str, object: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(subject.as_bytes());
    hasher.update(b"|");
    hasher.update(relation.as_bytes());
    hasher.update(b"|");
    hasher.update(object.as_bytes());
    let digest = hasher.finalize();
    format!("{digest:x}")[..16].to_string()
}

/// Clip to at most `max` bytes on a char boundary.
pub fn clip(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}

fn fact(
    subject: &str,
    relation: &str,
    object: &str,
    tag: FactTag,
    task_id: &str,
    role: FactRole,
    confidence: f64,
) -> SessionFact {
    SessionFact {
        id: fact_id(subject, relation, object),
        subject: subject.to_string(),
        relation: relation.to_string(),
        object: object.to_string(),
        tags: vec![tag],
        valid_from: Utc::now(),
        valid_to: None,
        source_task_id: task_id.to_string(),
        source_role: role,
        confidence,
    }
}

type Rule<'a> = Box<dyn Fn() -> Vec<SessionFact> + 'a>;

/// Run rules independently so one misbehaving rule cannot abort the rest.
fn run_rules(rules: Vec<Rule<'_>>, role: FactRole) -> Vec<SessionFact> {
    let mut facts = Vec::new();
    for (index, rule) in rules.into_iter().enumerate() {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(rule)) {
            Ok(extracted) => facts.extend(extracted),
            Err(_) => {
                tracing::warn!(rule = index, role = %role_name(role), "fact extraction rule failed; skipping");
            }
        }
    }
    facts
}

fn role_name(role: FactRole) -> &'static str {
    match role {
        FactRole::Implementer => "implementer",
        FactRole::Reviewer => "reviewer",
    }
}

/// Extract carryover facts from an implementer result.
pub fn extract_from_implementer(result: &ImplementerResult, task_id: &str) -> Vec<SessionFact> {
    let task_subject = format!("task:{task_id}");
    let role = FactRole::Implementer;

    let rules: Vec<Rule<'_>> = vec![
        Box::new({
            let task_subject = task_subject.clone();
            move || {
                vec![fact(
                    &task_subject,
                    "completed_with",
                    result.status.as_str(),
                    FactTag::Decision,
                    task_id,
                    role,
                    0.9,
                )]
            }
        }),
        Box::new({
            let task_subject = task_subject.clone();
            move || {
                vec![fact(
                    &task_subject,
                    "summary",
                    &clip(&result.summary, 120),
                    FactTag::Decision,
                    task_id,
                    role,
                    0.9,
                )]
            }
        }),
        Box::new({
            let task_subject = task_subject.clone();
            move || {
                result
                    .files_changed
                    .iter()
                    .map(|file| {
                        fact(
                            file,
                            "modified_by",
                            &task_subject,
                            FactTag::FileChange,
                            task_id,
                            role,
                            0.95,
                        )
                    })
                    .collect()
            }
        }),
        Box::new({
            let task_subject = task_subject.clone();
            move || {
                result
                    .follow_up_actions
                    .iter()
                    .filter(|action| !action.trim().is_empty())
                    .map(|action| {
                        fact(
                            &task_subject,
                            "requires",
                            &clip(action, 120),
                            FactTag::Dependency,
                            task_id,
                            role,
                            0.8,
                        )
                    })
                    .collect()
            }
        }),
    ];

    run_rules(rules, role)
}

/// Extract carryover facts from a reviewer result.
pub fn extract_from_reviewer(result: &ReviewerResult, task_id: &str) -> Vec<SessionFact> {
    let task_subject = format!("task:{task_id}");
    let role = FactRole::Reviewer;

    let rules: Vec<Rule<'_>> = vec![
        Box::new({
            let task_subject = task_subject.clone();
            move || {
                vec![fact(
                    &task_subject,
                    "reviewed_as",
                    result.assessment.as_str(),
                    FactTag::Decision,
                    task_id,
                    role,
                    0.9,
                )]
            }
        }),
        Box::new({
            let task_subject = task_subject.clone();
            move || {
                result
                    .issues
                    .iter()
                    .map(|issue| {
                        let subject = issue.file.as_deref().unwrap_or(&task_subject);
                        fact(
                            subject,
                            "issue",
                            &clip(&issue.message, 120),
                            FactTag::Error,
                            task_id,
                            role,
                            0.85,
                        )
                    })
                    .collect()
            }
        }),
        Box::new({
            let task_subject = task_subject.clone();
            move || {
                result
                    .required_fixes
                    .iter()
                    .map(|fix| {
                        fact(
                            &task_subject,
                            "must_fix",
                            &clip(fix, 120),
                            FactTag::Convention,
                            task_id,
                            role,
                            0.85,
                        )
                    })
                    .collect()
            }
        }),
        Box::new({
            let task_subject = task_subject.clone();
            move || {
                result
                    .issues
                    .iter()
                    .filter(|issue| {
                        CONVENTION_RE.is_match(&issue.message) || CONVENTION_RE.is_match(&issue.fix)
                    })
                    .map(|issue| {
                        let subject = issue.file.as_deref().unwrap_or(&task_subject);
                        fact(
                            subject,
                            "convention",
                            &clip(&issue.message, 120),
                            FactTag::Convention,
                            task_id,
                            role,
                            0.7,
                        )
                    })
                    .collect()
            }
        }),
    ];

    run_rules(rules, role)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::{IssueSeverity, ReviewAssessment, ReviewIssue, TaskStatus, TestOutcome};

    fn implementer_result() -> ImplementerResult {
        ImplementerResult {
            task_id: "1".to_string(),
            status: TaskStatus::Completed,
            summary: "implemented the cache".to_string(),
            files_changed: vec!["src/cache.rs".to_string(), "src/lib.rs".to_string()],
            tests: vec![TestOutcome {
                command: "cargo test".to_string(),
                passed: true,
                failures: None,
            }],
            follow_up_actions: vec!["wire telemetry".to_string(), "  ".to_string()],
        }
    }

    #[test]
    fn implementer_facts_cover_status_summary_files_and_followups() {
        let facts = extract_from_implementer(&implementer_result(), "1");
        assert!(facts.iter().any(|f| {
            f.subject == "task:1" && f.relation == "completed_with" && f.object == "completed"
        }));
        assert!(facts
            .iter()
            .any(|f| f.relation == "summary" && f.object == "implemented the cache"));
        assert_eq!(
            facts
                .iter()
                .filter(|f| f.relation == "modified_by" && f.object == "task:1")
                .count(),
            2
        );
        // The blank follow-up action is skipped.
        assert_eq!(facts.iter().filter(|f| f.relation == "requires").count(), 1);
    }

    #[test]
    fn long_summary_is_clipped_to_120() {
        let mut result = implementer_result();
        result.summary = "s".repeat(400);
        let facts = extract_from_implementer(&result, "1");
        let summary = facts.iter().find(|f| f.relation == "summary").unwrap();
        assert_eq!(summary.object.len(), 120);
    }

    #[test]
    fn reviewer_facts_cover_assessment_issues_and_fixes() {
        let result = ReviewerResult {
            task_id: "1".to_string(),
            assessment: ReviewAssessment::NeedsChanges,
            strengths: vec![],
            issues: vec![
                ReviewIssue {
                    severity: IssueSeverity::Critical,
                    file: Some("src/cache.rs".to_string()),
                    message: "race on eviction".to_string(),
                    fix: "lock the map".to_string(),
                },
                ReviewIssue {
                    severity: IssueSeverity::Minor,
                    file: None,
                    message: "use snake_case naming here".to_string(),
                    fix: "rename".to_string(),
                },
            ],
            required_fixes: vec!["lock the map".to_string()],
        };
        let facts = extract_from_reviewer(&result, "1");

        assert!(facts
            .iter()
            .any(|f| f.relation == "reviewed_as" && f.object == "needs_changes"));
        assert!(facts
            .iter()
            .any(|f| f.subject == "src/cache.rs" && f.relation == "issue"));
        // Issue without a file falls back to the task subject.
        assert!(facts
            .iter()
            .any(|f| f.subject == "task:1" && f.relation == "issue"));
        assert!(facts
            .iter()
            .any(|f| f.relation == "must_fix" && f.tags == vec![FactTag::Convention]));
        // The snake_case issue matches the convention rule.
        assert!(facts
            .iter()
            .any(|f| f.relation == "convention" && f.object.contains("snake_case")));
        // The race issue does not.
        assert!(!facts
            .iter()
            .any(|f| f.relation == "convention" && f.object.contains("race")));
    }

    #[test]
    fn clip_bounds_length_on_char_boundary() {
        let long = "é".repeat(100);
        let clipped = clip(&long, 121);
        assert!(clipped.len() <= 121);
        assert_eq!(clip("short", 120), "short");
    }

    #[test]
    fn fact_ids_are_deterministic_and_distinct() {
        assert_eq!(fact_id("s", "r", "o"), fact_id("s", "r", "o"));
        assert_ne!(fact_id("s", "r", "o1"), fact_id("s", "r", "o2"));
        assert_eq!(fact_id("s", "r", "o").len(), 16);
    }
}
