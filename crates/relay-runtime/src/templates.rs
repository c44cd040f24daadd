use relay_prompt::{PromptSegment, PromptTemplate, SegmentKind, TemplateRegistry};
use relay_types::AgentRole;

pub const IMPLEMENTER_TEMPLATE_ID: &str = "dispatch.implementer";
pub const REVIEWER_TEMPLATE_ID: &str = "dispatch.reviewer";
pub const TEMPLATE_VERSION: &str = "v1";

pub const BEGIN_MARKER: &str = "BEGIN_DISPATCH_RESULT";
pub const END_MARKER: &str = "END_DISPATCH_RESULT";

pub fn template_id_for(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Implementer => IMPLEMENTER_TEMPLATE_ID,
        AgentRole::Reviewer => REVIEWER_TEMPLATE_ID,
    }
}

const IMPLEMENTER_TOOLS: &str = "\
You are operating inside a project workspace with full read/write access \
to its files and permission to run its build and test commands.";

const IMPLEMENTER_SYSTEM: &str = "\
You are the implementer agent for one task of a coding workflow.

Apply the requested change directly in the workspace. Keep edits minimal \
and consistent with the surrounding code. Run the project's tests when a \
test command is available.

When you are done, print a result block. The block must start with a line \
containing exactly BEGIN_DISPATCH_RESULT, then a single JSON object, then \
a line containing exactly END_DISPATCH_RESULT. The JSON object must have \
exactly these keys: task_id (string), status (completed|blocked|failed), \
summary (string), files_changed (string array), tests (array of objects \
with command, passed, and optional failures), follow_up_actions (string \
array). Print nothing else inside the block.";

const IMPLEMENTER_EXAMPLES: &str = "\
Example result block:
BEGIN_DISPATCH_RESULT
{\"task_id\":\"3\",\"status\":\"completed\",\"summary\":\"renamed the loader\",\
\"files_changed\":[\"src/loader.rs\"],\"tests\":[{\"command\":\"cargo test\",\
\"passed\":true}],\"follow_up_actions\":[]}
END_DISPATCH_RESULT";

const REVIEWER_TOOLS: &str = "\
You are operating inside a project workspace with read access to its \
files. Do not modify anything.";

const REVIEWER_SYSTEM: &str = "\
You are the reviewer agent for one task of a coding workflow.

Inspect the implementer's changes for correctness, completeness, and \
consistency with the codebase conventions.

When you are done, print a result block. The block must start with a line \
containing exactly BEGIN_DISPATCH_RESULT, then a single JSON object, then \
a line containing exactly END_DISPATCH_RESULT. The JSON object must have \
exactly these keys: task_id (string), assessment \
(approved|needs_changes|blocked), strengths (string array), issues (array \
of objects with severity critical|important|minor, optional file, message, \
fix), required_fixes (string array). Print nothing else inside the block.";

const REVIEWER_EXAMPLES: &str = "\
Example result block:
BEGIN_DISPATCH_RESULT
{\"task_id\":\"3\",\"assessment\":\"approved\",\"strengths\":[\"tight diff\"],\
\"issues\":[],\"required_fixes\":[]}
END_DISPATCH_RESULT";

/// Full guide text issued once per (run, role); later prompts carry only
/// the cache pointer.
pub fn guide_text(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Implementer => {
            "Workflow guide: work on exactly one task per dispatch. Use the \
             DELTA packet for prior-task context and required fixes from \
             review. Never invent files outside the workspace. Keep the \
             result block as the last thing you print."
        }
        AgentRole::Reviewer => {
            "Workflow guide: review exactly one task per dispatch. The DELTA \
             packet carries the implementer's summary. Assess only the \
             changes for this task. Keep the result block as the last thing \
             you print."
        }
    }
}

/// Registry with both built-in dispatch templates. Tools and system
/// segments are stable; examples are not, so compaction can drop them
/// without perturbing the stable prefix hash.
pub fn default_template_registry() -> TemplateRegistry {
    let mut registry = TemplateRegistry::new();
    registry.register(PromptTemplate {
        template_id: IMPLEMENTER_TEMPLATE_ID.to_string(),
        version: TEMPLATE_VERSION.to_string(),
        segments: vec![
            PromptSegment::stable(SegmentKind::Tools, IMPLEMENTER_TOOLS),
            PromptSegment::stable(SegmentKind::System, IMPLEMENTER_SYSTEM),
            PromptSegment::volatile(SegmentKind::Examples, IMPLEMENTER_EXAMPLES),
        ],
    });
    registry.register(PromptTemplate {
        template_id: REVIEWER_TEMPLATE_ID.to_string(),
        version: TEMPLATE_VERSION.to_string(),
        segments: vec![
            PromptSegment::stable(SegmentKind::Tools, REVIEWER_TOOLS),
            PromptSegment::stable(SegmentKind::System, REVIEWER_SYSTEM),
            PromptSegment::volatile(SegmentKind::Examples, REVIEWER_EXAMPLES),
        ],
    });
    registry
}
