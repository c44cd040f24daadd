//! The dispatch runtime: a single-process orchestrator for multi-agent
//! coding workflows.
//!
//! A task flows classify → route → compile → execute → ingest → project.
//! Every observable step is an event on the run's partition; the snapshot
//! store carries the projected image. The [`DispatchRuntime`] exposes the
//! whole machine behind one action entry point.

mod actions;
mod config;
mod error;
mod manager;
mod paths;
mod telemetry;
mod templates;

pub use actions::{
    error_code, ActionRequest, ActionResponse, CompactionStage, CompileOutcome, DeltaFact,
    DeltaPacket, GuideMode, NextAction,
};
pub use config::{estimate_tokens, RuntimeConfig, RuntimePolicy};
pub use error::{Result, RuntimeError};
pub use manager::DispatchRuntime;
pub use paths::{
    resolve_global_dir, PathMapping, ENV_CONTAINER_PATH_PREFIX, ENV_HOST_PATH_PREFIX,
    ENV_WORKFLOW_HOME, EVENTS_LOG_FILE, MERKLE_DIR, PROJECT_REGISTRY_FILE, SNAPSHOTS_FILE,
};
pub use telemetry::{aggregate, RunTelemetry};
pub use templates::{
    default_template_registry, guide_text, template_id_for, BEGIN_MARKER, END_MARKER,
    IMPLEMENTER_TEMPLATE_ID, REVIEWER_TEMPLATE_ID, TEMPLATE_VERSION,
};
