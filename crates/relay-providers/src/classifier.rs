use std::collections::HashMap;

use relay_types::{Classification, ComplexityLevel};

pub const CLASSIFIER_ID: &str = "heuristic-v1";

const SIMPLE_KEYWORDS: &[&str] = &[
    "test stub",
    "rename",
    "doc update",
    "fix typo",
    "move file",
    "update import",
];

const COMPLEX_KEYWORDS: &[&str] = &[
    "refactor",
    "architect",
    "redesign",
    "new interface",
    "cross-module",
    "implement",
    "integrate",
];

const SIMPLE_FIRST_WORDS: &[&str] = &["add", "fix", "move", "rename", "update"];
const COMPLEX_FIRST_WORDS: &[&str] = &["implement", "design", "refactor", "integrate"];

#[derive(Debug, Clone, Default)]
pub struct ClassifierInput {
    pub description: String,
    pub file_count: Option<usize>,
    pub scope_hint: Option<String>,
    pub hints: HashMap<String, String>,
}

impl ClassifierInput {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }
}

/// Deterministic heuristic complexity classifier. Same input, same output.
pub fn classify(input: &ClassifierInput) -> Classification {
    let description = input.description.trim();
    if description.is_empty() {
        return Classification {
            level: ComplexityLevel::Complex,
            confidence: 0.0,
            matched_features: Vec::new(),
            classifier_id: CLASSIFIER_ID.to_string(),
        };
    }

    let lowered = description.to_lowercase();
    let mut score = 0.0f64;
    let mut matched = Vec::new();

    for keyword in SIMPLE_KEYWORDS {
        if lowered.contains(keyword) {
            score -= 0.45;
            matched.push(format!("keyword_simple:{keyword}"));
        }
    }
    for keyword in COMPLEX_KEYWORDS {
        if lowered.contains(keyword) {
            score += 0.55;
            matched.push(format!("keyword_complex:{keyword}"));
        }
    }

    if let Some(file_count) = input.file_count {
        if file_count <= 1 {
            score -= 0.25;
            matched.push("file_count:low".to_string());
        } else if file_count >= 3 {
            score += 0.35;
            matched.push("file_count:high".to_string());
        }
    }

    match input.scope_hint.as_deref() {
        Some("single-file") => {
            score -= 0.3;
            matched.push("scope:single-file".to_string());
        }
        Some("cross-module") => {
            score += 0.35;
            matched.push("scope:cross-module".to_string());
        }
        _ => {}
    }

    if description.len() < 100 {
        score -= 0.05;
        matched.push("length:short".to_string());
    } else if description.len() > 500 {
        score += 0.2;
        matched.push("length:long".to_string());
    }

    if let Some(first_word) = lowered.split_whitespace().next() {
        if SIMPLE_FIRST_WORDS.contains(&first_word) {
            score -= 0.25;
            matched.push(format!("first_word_simple:{first_word}"));
        } else if COMPLEX_FIRST_WORDS.contains(&first_word) {
            score += 0.3;
            matched.push(format!("first_word_complex:{first_word}"));
        }
    }

    // Sorted for determinism regardless of map iteration order.
    let mut hint_keys: Vec<&String> = input.hints.keys().collect();
    hint_keys.sort();
    for key in hint_keys {
        match input.hints[key].as_str() {
            "simple" => {
                score -= 0.4;
                matched.push(format!("hint_simple:{key}"));
            }
            "complex" => {
                score += 0.4;
                matched.push(format!("hint_complex:{key}"));
            }
            _ => {}
        }
    }

    let level = if score >= -0.3 {
        ComplexityLevel::Complex
    } else {
        ComplexityLevel::Simple
    };
    let confidence = (0.35 + 0.45 * score.abs().min(1.0) + (0.06 * matched.len() as f64).min(0.3))
        .min(1.0);

    Classification {
        level,
        confidence,
        matched_features: matched,
        classifier_id: CLASSIFIER_ID.to_string(),
    }
}
