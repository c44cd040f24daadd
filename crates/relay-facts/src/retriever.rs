use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use relay_types::{FactTag, SessionFact};

use crate::store::SessionFactStore;

static TOKEN_SPLIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s/\-_.,:;()\[\]{}]+").expect("token split regex"));

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "if", "then", "else", "for", "to", "of", "in", "on",
    "at", "by", "with", "from", "as", "is", "are", "was", "were", "be", "been", "being", "it",
    "its", "this", "that", "these", "those", "will", "would", "should", "could", "can", "may",
    "might", "must", "do", "does", "did", "not", "no", "into", "over", "under", "about", "after",
    "before", "between", "during", "through", "up", "down", "out", "off", "all", "any", "both",
    "each", "few", "more", "most", "other", "some", "such", "only", "own", "same", "so", "than",
    "too", "very", "we", "you", "they", "there", "here", "what", "which", "when", "where", "how",
];

#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub description: String,
    /// Facts sourced from this task are never returned.
    pub task_id: String,
    pub tags: Option<Vec<FactTag>>,
    pub max_facts: usize,
    pub max_tokens: usize,
    pub chars_per_token: usize,
}

impl RetrievalQuery {
    pub fn new(description: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            task_id: task_id.into(),
            tags: None,
            max_facts: 10,
            max_tokens: 600,
            chars_per_token: 4,
        }
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    TOKEN_SPLIT_RE
        .split(&text.to_lowercase())
        .filter(|t| !t.is_empty())
        .filter(|t| !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

fn fact_tokens(fact: &SessionFact) -> HashSet<String> {
    tokenize(&format!(
        "{} {} {}",
        fact.subject, fact.relation, fact.object
    ))
}

fn estimate_fact_tokens(fact: &SessionFact, chars_per_token: usize) -> usize {
    let chars = fact.subject.len() + fact.relation.len() + fact.object.len();
    chars.div_ceil(chars_per_token.max(1))
}

/// Retrieve facts relevant to a task description, self-excluded and
/// bounded by both a fact count and a token budget. Returns empty on any
/// internal failure.
pub fn retrieve(store: &SessionFactStore, query: &RetrievalQuery) -> Vec<SessionFact> {
    let query_tokens = tokenize(&query.description);
    if query_tokens.is_empty() {
        return Vec::new();
    }

    let source = match &query.tags {
        Some(tags) => store.get_valid_by_tags(tags),
        None => store.get_valid(),
    };

    let mut scored: Vec<(f64, SessionFact)> = source
        .into_iter()
        .filter(|fact| fact.source_task_id != query.task_id)
        .map(|fact| {
            let overlap = fact_tokens(&fact)
                .intersection(&query_tokens)
                .count() as f64;
            (overlap / query_tokens.len() as f64, fact)
        })
        .collect();

    // Highest score first; ties broken newest first.
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.1.valid_from.cmp(&a.1.valid_from))
    });
    scored.truncate(query.max_facts);

    let mut selected = Vec::new();
    let mut used_tokens = 0usize;
    for (_, fact) in scored {
        let cost = estimate_fact_tokens(&fact, query.chars_per_token);
        if used_tokens + cost > query.max_tokens {
            break;
        }
        used_tokens += cost;
        selected.push(fact);
    }
    selected
}
