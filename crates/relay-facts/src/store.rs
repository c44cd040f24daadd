use std::collections::HashMap;

use chrono::Utc;

use relay_types::{FactTag, SessionFact};

#[derive(Debug, Clone)]
pub struct FactStoreConfig {
    /// Valid facts retained before compaction kicks in.
    pub max_valid_facts: usize,
}

impl Default for FactStoreConfig {
    fn default() -> Self {
        Self {
            max_valid_facts: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionOutcome {
    pub invalidated_removed: usize,
    pub valid_dropped: usize,
}

/// Bounded in-memory fact arena with a secondary subject index.
///
/// Adding a fact auto-invalidates prior valid facts with the same
/// (subject, relation). Invalid inputs are skipped silently.
pub struct SessionFactStore {
    facts: HashMap<String, SessionFact>,
    /// Insertion order of fact ids, oldest first.
    order: Vec<String>,
    subject_index: HashMap<String, Vec<String>>,
    config: FactStoreConfig,
}

impl SessionFactStore {
    pub fn new(config: FactStoreConfig) -> Self {
        Self {
            facts: HashMap::new(),
            order: Vec::new(),
            subject_index: HashMap::new(),
            config,
        }
    }

    /// Add facts, skipping invalid ones. Returns the number accepted.
    pub fn add(&mut self, incoming: Vec<SessionFact>) -> usize {
        let mut accepted = 0;
        for fact in incoming {
            if !is_acceptable(&fact) {
                tracing::debug!(subject = %fact.subject, relation = %fact.relation, "skipping invalid session fact");
                continue;
            }
            self.invalidate(&fact.subject, &fact.relation);
            self.insert(fact);
            accepted += 1;
        }
        if self.count() > self.config.max_valid_facts {
            self.compact(self.config.max_valid_facts);
        }
        accepted
    }

    fn insert(&mut self, fact: SessionFact) {
        let id = fact.id.clone();
        let subject = fact.subject.clone();
        if self.facts.insert(id.clone(), fact).is_none() {
            self.order.push(id.clone());
            self.subject_index.entry(subject).or_default().push(id);
        }
    }

    /// Mark matching valid facts invalid as of now.
    pub fn invalidate(&mut self, subject: &str, relation: &str) -> usize {
        let now = Utc::now();
        let mut invalidated = 0;
        let Some(ids) = self.subject_index.get(subject) else {
            return 0;
        };
        for id in ids.clone() {
            if let Some(fact) = self.facts.get_mut(&id) {
                if fact.is_valid() && fact.relation == relation {
                    fact.valid_to = Some(now);
                    invalidated += 1;
                }
            }
        }
        invalidated
    }

    pub fn get_valid(&self) -> Vec<SessionFact> {
        self.order
            .iter()
            .filter_map(|id| self.facts.get(id))
            .filter(|fact| fact.is_valid())
            .cloned()
            .collect()
    }

    /// Any-tag match over valid facts.
    pub fn get_valid_by_tags(&self, tags: &[FactTag]) -> Vec<SessionFact> {
        self.get_valid()
            .into_iter()
            .filter(|fact| fact.tags.iter().any(|t| tags.contains(t)))
            .collect()
    }

    /// Number of currently valid facts.
    pub fn count(&self) -> usize {
        self.order
            .iter()
            .filter_map(|id| self.facts.get(id))
            .filter(|fact| fact.is_valid())
            .count()
    }

    /// Drop invalidated facts first, then the oldest valid facts, until at
    /// most `max_facts` valid facts remain.
    pub fn compact(&mut self, max_facts: usize) -> CompactionOutcome {
        let mut outcome = CompactionOutcome::default();

        let invalidated: Vec<String> = self
            .order
            .iter()
            .filter(|id| {
                self.facts
                    .get(*id)
                    .map(|f| !f.is_valid())
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        for id in invalidated {
            self.remove(&id);
            outcome.invalidated_removed += 1;
        }

        while self.count() > max_facts {
            let Some(oldest) = self.oldest_valid_id() else {
                break;
            };
            self.remove(&oldest);
            outcome.valid_dropped += 1;
        }

        if outcome.invalidated_removed > 0 || outcome.valid_dropped > 0 {
            tracing::debug!(
                invalidated_removed = outcome.invalidated_removed,
                valid_dropped = outcome.valid_dropped,
                "compacted session fact store"
            );
        }
        outcome
    }

    fn oldest_valid_id(&self) -> Option<String> {
        self.order
            .iter()
            .filter(|id| self.facts.get(*id).map(|f| f.is_valid()).unwrap_or(false))
            .min_by_key(|id| self.facts.get(*id).map(|f| f.valid_from))
            .cloned()
    }

    fn remove(&mut self, id: &str) {
        if let Some(fact) = self.facts.remove(id) {
            self.order.retain(|entry| entry != id);
            if let Some(ids) = self.subject_index.get_mut(&fact.subject) {
                ids.retain(|entry| entry != id);
                if ids.is_empty() {
                    self.subject_index.remove(&fact.subject);
                }
            }
        }
    }
}

impl Default for SessionFactStore {
    fn default() -> Self {
        Self::new(FactStoreConfig::default())
    }
}

fn is_acceptable(fact: &SessionFact) -> bool {
    if fact.id.trim().is_empty()
        || fact.subject.trim().is_empty()
        || fact.relation.trim().is_empty()
        || fact.object.trim().is_empty()
        || fact.source_task_id.trim().is_empty()
    {
        return false;
    }
    if fact.tags.is_empty() {
        return false;
    }
    if let Some(valid_to) = fact.valid_to {
        if valid_to < fact.valid_from {
            return false;
        }
    }
    fact.confidence.is_finite()
}
