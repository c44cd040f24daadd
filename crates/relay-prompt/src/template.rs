use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PromptError {
    #[error("template \"{0}\" version \"{1}\" is not registered")]
    UnknownTemplate(String, String),
}

/// Canonical segment kinds. Compilation orders tools → system → examples →
/// dynamic; `custom` sorts last, preserving registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Tools,
    System,
    Examples,
    Dynamic,
    Custom,
}

impl SegmentKind {
    fn order(self) -> u8 {
        match self {
            SegmentKind::Tools => 0,
            SegmentKind::System => 1,
            SegmentKind::Examples => 2,
            SegmentKind::Dynamic => 3,
            SegmentKind::Custom => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSegment {
    pub kind: SegmentKind,
    /// Stable segments feed `stable_prefix_hash`; non-stable segments only
    /// affect the full prompt.
    pub stable: bool,
    pub text: String,
}

impl PromptSegment {
    pub fn stable(kind: SegmentKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            stable: true,
            text: text.into(),
        }
    }

    pub fn volatile(kind: SegmentKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            stable: false,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub template_id: String,
    pub version: String,
    pub segments: Vec<PromptSegment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPrompt {
    pub text: String,
    pub stable_prefix: String,
    pub stable_prefix_hash: String,
    pub full_prompt_hash: String,
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:064x}", hasher.finalize())
}

fn ordered(segments: &[PromptSegment]) -> Vec<&PromptSegment> {
    let mut refs: Vec<(usize, &PromptSegment)> = segments.iter().enumerate().collect();
    // Stable sort: equal kinds keep registration order.
    refs.sort_by_key(|(index, seg)| (seg.kind.order(), *index));
    refs.into_iter().map(|(_, seg)| seg).collect()
}

fn join(segments: &[&PromptSegment]) -> String {
    segments
        .iter()
        .map(|s| s.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
        .trim()
        .to_string()
}

impl PromptTemplate {
    /// Compile with an optional dynamic tail. The tail joins the segment
    /// list as a non-stable `dynamic` segment when non-empty.
    pub fn compile(&self, dynamic_tail: &str) -> CompiledPrompt {
        let mut segments = self.segments.clone();
        if !dynamic_tail.is_empty() {
            segments.push(PromptSegment::volatile(SegmentKind::Dynamic, dynamic_tail));
        }

        let sorted = ordered(&segments);
        let text = join(&sorted);
        let stable_only: Vec<&PromptSegment> =
            sorted.iter().copied().filter(|s| s.stable).collect();
        let stable_prefix = join(&stable_only);

        CompiledPrompt {
            stable_prefix_hash: sha256_hex(&stable_prefix),
            full_prompt_hash: sha256_hex(&text),
            text,
            stable_prefix,
        }
    }
}

/// Templates registered by `(template_id, version)`.
#[derive(Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<(String, String), PromptTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, template: PromptTemplate) {
        self.templates.insert(
            (template.template_id.clone(), template.version.clone()),
            template,
        );
    }

    pub fn get(&self, template_id: &str, version: &str) -> Option<&PromptTemplate> {
        self.templates
            .get(&(template_id.to_string(), version.to_string()))
    }

    pub fn compile(
        &self,
        template_id: &str,
        version: &str,
        dynamic_tail: &str,
    ) -> Result<CompiledPrompt, PromptError> {
        let template = self.get(template_id, version).ok_or_else(|| {
            PromptError::UnknownTemplate(template_id.to_string(), version.to_string())
        })?;
        Ok(template.compile(dynamic_tail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn template() -> PromptTemplate {
        PromptTemplate {
            template_id: "dispatch.implementer".to_string(),
            version: "v1".to_string(),
            segments: vec![
                PromptSegment::volatile(SegmentKind::Examples, "example: rename a symbol"),
                PromptSegment::stable(SegmentKind::System, "You are an implementer."),
                PromptSegment::stable(SegmentKind::Tools, "tools: fs, shell"),
            ],
        }
    }

    #[test]
    fn segments_compile_in_canonical_kind_order() {
        let compiled = template().compile("");
        assert_eq!(
            compiled.text,
            "tools: fs, shell\n\nYou are an implementer.\n\nexample: rename a symbol"
        );
    }

    #[test]
    fn custom_kind_sorts_last_preserving_registration_order() {
        let mut t = template();
        t.segments
            .push(PromptSegment::stable(SegmentKind::Custom, "custom-a"));
        t.segments
            .push(PromptSegment::stable(SegmentKind::Custom, "custom-b"));
        let compiled = t.compile("tail");
        assert!(compiled.text.ends_with("tail\n\ncustom-a\n\ncustom-b"));
    }

    #[test]
    fn stable_prefix_covers_stable_segments_only() {
        let compiled = template().compile("dynamic tail");
        assert_eq!(
            compiled.stable_prefix,
            "tools: fs, shell\n\nYou are an implementer."
        );
        assert!(compiled.text.contains("dynamic tail"));
        assert!(!compiled.stable_prefix.contains("dynamic tail"));
    }

    #[test]
    fn empty_tail_is_not_appended() {
        let with_empty = template().compile("");
        let with_tail = template().compile("x");
        assert_ne!(with_empty.text, with_tail.text);
        assert!(!with_empty.text.ends_with("\n\n"));
    }

    #[test]
    fn registry_resolves_by_id_and_version() {
        let mut registry = TemplateRegistry::new();
        registry.register(template());
        assert!(registry.compile("dispatch.implementer", "v1", "").is_ok());
        assert!(matches!(
            registry.compile("dispatch.implementer", "v2", ""),
            Err(PromptError::UnknownTemplate(_, _))
        ));
    }

    proptest! {
        #[test]
        fn stable_prefix_hash_is_invariant_under_dynamic_tail(tail in ".{0,200}") {
            let baseline = template().compile("");
            let varied = template().compile(&tail);
            prop_assert_eq!(&baseline.stable_prefix_hash, &varied.stable_prefix_hash);
            if !tail.trim().is_empty() {
                prop_assert_ne!(&baseline.full_prompt_hash, &varied.full_prompt_hash);
            }
        }
    }
}
