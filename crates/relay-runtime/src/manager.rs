use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use relay_cache::{FileCacheConfig, FileContentCache};
use relay_dispatch::{execute, DispatchInput, DispatchResult};
use relay_observability::{digest_text, emit_runtime_event, ProcessKind, RuntimeEventRecord};
use relay_events::{
    project, EventStream, EventStreamConfig, SnapshotStore, SnapshotStoreConfig, SnapshotUpdate,
};
use relay_facts::{
    extract_from_implementer, extract_from_reviewer, retrieve, FactStoreConfig, RetrievalQuery,
    SessionFactStore,
};
use relay_policy::{filter_candidates, run_chain, ChainOutcome, Hook, Interceptor};
use relay_prompt::{compute_cache_key, Message, SegmentKind, TemplateRegistry};
use relay_providers::{
    cache_adapter_for, classify, CacheRequest, CacheTelemetry, ClassifierInput, ContextDiscipline,
    EnvConfig, ProviderCatalog, RoleOverride, RoutingTable,
};
use relay_schema::{default_registry, SchemaRegistry, IMPLEMENTER_RESULT_TYPE, REVIEWER_RESULT_TYPE};
use relay_types::{
    AgentRole, AppliedOffset, BudgetRequest, BudgetVerdict, CommandTemplate, EventDraft,
    EventType, ImplementerResult, ReviewAssessment, ReviewerResult, RunFact, RunSnapshot,
    RunStatus, SessionFact, TaskStatus, TokenBudget,
};

use crate::actions::{
    error_code, ActionRequest, ActionResponse, CompactionStage, CompileOutcome, DeltaFact,
    DeltaPacket, GuideMode, NextAction,
};
use crate::config::{estimate_tokens, RuntimeConfig, RuntimePolicy};
use crate::error::Result;
use crate::paths::{EVENTS_LOG_FILE, SNAPSHOTS_FILE};
use crate::telemetry::{aggregate, RunTelemetry};
use crate::templates::{
    default_template_registry, guide_text, template_id_for, BEGIN_MARKER, END_MARKER,
    TEMPLATE_VERSION,
};

#[derive(Default)]
struct RunLedger {
    task_prompts: HashMap<String, String>,
    guide_issued: HashSet<AgentRole>,
    last_implementer: HashMap<String, ImplementerResult>,
    last_reviewer: HashMap<String, ReviewerResult>,
    /// Reviewer `needs_changes` cycles per task.
    review_loops: HashMap<String, u32>,
    /// Schema-valid implementer attempts per task.
    implementer_attempts: HashMap<String, u32>,
    provider_cache: Option<CacheTelemetry>,
}

/// The central state machine: compiles prompts, runs provider CLIs,
/// validates their contracts, and projects outcomes into snapshots.
pub struct DispatchRuntime {
    stream: EventStream,
    snapshots: SnapshotStore,
    templates: TemplateRegistry,
    schemas: SchemaRegistry,
    catalog: ProviderCatalog,
    routing: RoutingTable,
    env: EnvConfig,
    policy: RuntimePolicy,
    file_cache: FileContentCache,
    interceptors: Vec<Arc<dyn Interceptor>>,
    ledgers: Mutex<HashMap<String, RunLedger>>,
    facts: Mutex<HashMap<String, SessionFactStore>>,
    project_path: PathBuf,
    global_dir: PathBuf,
}

impl DispatchRuntime {
    pub async fn new(config: RuntimeConfig) -> Result<Self> {
        let stream = EventStream::open(
            config.global_dir.join(EVENTS_LOG_FILE),
            EventStreamConfig {
                retention_per_partition: config.policy.event_retention,
                idempotency_cap: config.policy.idempotency_cap,
            },
        )
        .await?;
        let snapshots = SnapshotStore::open(
            config.global_dir.join(SNAPSHOTS_FILE),
            SnapshotStoreConfig {
                debounce: config.policy.snapshot_debounce,
            },
        )
        .await?;

        Ok(Self {
            stream,
            snapshots,
            templates: default_template_registry(),
            schemas: default_registry(),
            catalog: ProviderCatalog::default(),
            routing: RoutingTable::from_env(&config.env),
            file_cache: FileContentCache::new(FileCacheConfig {
                max_entries: config.policy.file_cache_max_entries,
                legacy_error_mode: false,
            }),
            interceptors: config.interceptors,
            ledgers: Mutex::new(HashMap::new()),
            facts: Mutex::new(HashMap::new()),
            project_path: config.project_path,
            global_dir: config.global_dir,
            env: config.env,
            policy: config.policy,
        })
    }

    /// Single entry point used by the CLI and by embedders.
    pub async fn handle(&self, request: ActionRequest) -> ActionResponse {
        match request {
            ActionRequest::InitRun {
                run_id,
                spec_name,
                task_id,
            } => self.init_run(&run_id, &spec_name, &task_id).await,
            ActionRequest::CompilePrompt {
                run_id,
                role,
                task_id,
                task_prompt,
                max_output_tokens,
                compaction_auto,
            } => {
                self.compile_prompt(
                    &run_id,
                    role,
                    &task_id,
                    task_prompt.as_deref(),
                    max_output_tokens,
                    compaction_auto,
                )
                .await
            }
            ActionRequest::IngestOutput {
                run_id,
                role,
                task_id,
                output_content,
                output_file_path,
                max_output_tokens,
            } => {
                self.ingest_output(
                    &run_id,
                    role,
                    &task_id,
                    output_content.as_deref(),
                    output_file_path.as_deref(),
                    max_output_tokens,
                )
                .await
            }
            ActionRequest::DispatchAndIngest {
                run_id,
                role,
                task_id,
                task_prompt,
                max_output_tokens,
                compaction_auto,
            } => {
                self.dispatch_and_ingest(
                    &run_id,
                    role,
                    &task_id,
                    task_prompt.as_deref(),
                    max_output_tokens,
                    compaction_auto,
                )
                .await
            }
            ActionRequest::GetSnapshot { run_id } => self.get_snapshot(&run_id).await,
            ActionRequest::GetTelemetry { run_id } => self.get_telemetry(&run_id).await,
        }
    }

    // ------------------------------------------------------------------
    // init_run
    // ------------------------------------------------------------------

    pub async fn init_run(&self, run_id: &str, spec_name: &str, task_id: &str) -> ActionResponse {
        if let Some(existing) = self.snapshots.get(run_id).await {
            return ActionResponse::ok(
                "run already initialized",
                json!({"snapshot": existing, "created": false}),
            );
        }

        let update = SnapshotUpdate {
            run_id: run_id.to_string(),
            status: RunStatus::Running,
            goal: format!("{spec_name}:{task_id}"),
            facts: Vec::new(),
            pending_writes: Vec::new(),
            token_budget: TokenBudget::default(),
            applied_offset: AppliedOffset {
                partition_key: run_id.to_string(),
                sequence: 0,
            },
            projector_version: relay_events::PROJECTOR_VERSION.to_string(),
        };
        let snapshot = match self.snapshots.upsert(update).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                return ActionResponse::fail(err.to_string(), error_code::INTERNAL_ERROR, json!({}))
            }
        };

        let draft = EventDraft {
            idempotency_key: format!("init:{run_id}"),
            partition_key: run_id.to_string(),
            parent_event_id: None,
            run_id: run_id.to_string(),
            step_id: task_id.to_string(),
            agent_id: "runtime".to_string(),
            event_type: EventType::StateDelta,
            payload: json!({"action": "init_run", "spec_name": spec_name, "task_id": task_id}),
        };
        if let Err(err) = self.apply_event(draft, |_| {}).await {
            return ActionResponse::fail(err.to_string(), error_code::INTERNAL_ERROR, json!({}));
        }

        tracing::info!(run_id, goal = %snapshot.goal, "run initialized");
        ActionResponse::ok(
            "run initialized",
            json!({"snapshot": snapshot, "created": true}),
        )
    }

    // ------------------------------------------------------------------
    // compile_prompt
    // ------------------------------------------------------------------

    pub async fn compile_prompt(
        &self,
        run_id: &str,
        role: AgentRole,
        task_id: &str,
        task_prompt: Option<&str>,
        max_output_tokens: u64,
        compaction_auto: bool,
    ) -> ActionResponse {
        match self
            .compile_inner(run_id, role, task_id, task_prompt, max_output_tokens, compaction_auto)
            .await
        {
            Ok(outcome) => {
                let data = serde_json::to_value(&outcome).unwrap_or_else(|_| json!({}));
                ActionResponse::ok("prompt compiled", data)
            }
            Err(response) => response,
        }
    }

    async fn compile_inner(
        &self,
        run_id: &str,
        role: AgentRole,
        task_id: &str,
        task_prompt: Option<&str>,
        max_output_tokens: u64,
        compaction_auto: bool,
    ) -> std::result::Result<CompileOutcome, ActionResponse> {
        if self.snapshots.get(run_id).await.is_none() {
            return Err(ActionResponse::fail(
                format!("run {run_id} not found"),
                error_code::RUN_NOT_FOUND,
                json!({}),
            ));
        }

        // Resolve the task prompt: caller-supplied wins and is remembered;
        // otherwise fall back to the ledger.
        let (prompt_text, guide_mode) = {
            let mut ledgers = self.ledgers.lock().await;
            let ledger = ledgers.entry(run_id.to_string()).or_default();
            let prompt_text = match task_prompt {
                Some(text) if !text.trim().is_empty() => {
                    ledger
                        .task_prompts
                        .insert(task_id.to_string(), text.to_string());
                    text.to_string()
                }
                _ => match ledger.task_prompts.get(task_id) {
                    Some(stored) => stored.clone(),
                    None => {
                        return Err(ActionResponse::fail(
                            format!("no task prompt available for task {task_id}"),
                            error_code::MISSING_TASK_PROMPT,
                            json!({}),
                        ))
                    }
                },
            };
            let guide_mode = if ledger.guide_issued.contains(&role) {
                GuideMode::Compact
            } else {
                ledger.guide_issued.insert(role);
                GuideMode::Full
            };
            (prompt_text, guide_mode)
        };

        let delta = self.build_delta_packet(run_id, role, task_id, &prompt_text).await;

        let template = self
            .templates
            .get(template_id_for(role), TEMPLATE_VERSION)
            .cloned()
            .ok_or_else(|| {
                ActionResponse::fail(
                    "dispatch template missing",
                    error_code::INTERNAL_ERROR,
                    json!({}),
                )
            })?;
        let guide_cache_key = template.compile("").stable_prefix_hash;

        let budget = self.policy.prompt_token_budget;
        let mut stage = CompactionStage::None;
        let mut compiled = template.compile(&self.build_tail(
            task_id,
            max_output_tokens,
            &delta,
            &guide_cache_key,
            role,
            guide_mode,
            &prompt_text,
        ));
        let tokens_before = estimate_tokens(&compiled.text);
        let mut tokens_after = tokens_before;

        if tokens_after > budget && compaction_auto {
            let mut trimmed_template = template.clone();
            trimmed_template
                .segments
                .retain(|s| s.kind != SegmentKind::Examples);
            let mut trimmed_prompt = prompt_text.clone();
            let mut reduced_delta = delta.clone();

            for candidate_stage in [
                CompactionStage::ExamplesDropped,
                CompactionStage::TaskTrimmed,
                CompactionStage::DeltaReduced,
            ] {
                match candidate_stage {
                    CompactionStage::TaskTrimmed => {
                        trimmed_prompt = clip_chars(&trimmed_prompt, self.policy.task_trim_chars);
                    }
                    CompactionStage::DeltaReduced => {
                        reduced_delta.facts.clear();
                        reduced_delta.previous_summary = None;
                    }
                    _ => {}
                }
                stage = candidate_stage;
                compiled = trimmed_template.compile(&self.build_tail(
                    task_id,
                    max_output_tokens,
                    &reduced_delta,
                    &guide_cache_key,
                    role,
                    guide_mode,
                    &trimmed_prompt,
                ));
                tokens_after = estimate_tokens(&compiled.text);
                if tokens_after <= budget {
                    break;
                }
            }
            if tokens_after > budget {
                stage = CompactionStage::FloorReached;
            }
        }

        let outcome = CompileOutcome {
            prompt: compiled.text.clone(),
            stable_prefix_hash: compiled.stable_prefix_hash.clone(),
            full_prompt_hash: compiled.full_prompt_hash.clone(),
            guide_mode,
            guide_cache_key,
            delta_packet: delta,
            compaction_applied: stage != CompactionStage::None,
            compaction_stage: stage,
            prompt_tokens_before: tokens_before,
            prompt_tokens_after: tokens_after,
            prompt_token_budget: budget,
        };

        let mut draft = EventDraft::new(
            run_id,
            EventType::LlmRequest,
            json!({
                "role": role,
                "task_id": task_id,
                "stable_prefix_hash": outcome.stable_prefix_hash,
                "full_prompt_hash": outcome.full_prompt_hash,
                "guide_mode": outcome.guide_mode,
                "compaction_applied": outcome.compaction_applied,
                "compaction_stage": outcome.compaction_stage,
                "prompt_tokens_before": outcome.prompt_tokens_before,
                "prompt_tokens_after": outcome.prompt_tokens_after,
                "max_output_tokens": max_output_tokens,
            }),
        );
        draft.step_id = task_id.to_string();
        draft.agent_id = role.as_str().to_string();
        self.apply_event(draft, |_| {}).await.map_err(|err| {
            ActionResponse::fail(err.to_string(), error_code::INTERNAL_ERROR, json!({}))
        })?;

        tracing::debug!(
            run_id,
            task_id,
            role = %role,
            prompt = %digest_text(&outcome.prompt),
            tokens = outcome.prompt_tokens_after,
            "prompt compiled"
        );
        Ok(outcome)
    }

    async fn build_delta_packet(
        &self,
        run_id: &str,
        role: AgentRole,
        task_id: &str,
        description: &str,
    ) -> DeltaPacket {
        let mut delta = DeltaPacket::default();

        {
            let ledgers = self.ledgers.lock().await;
            if let Some(ledger) = ledgers.get(run_id) {
                match role {
                    AgentRole::Reviewer => {
                        delta.previous_summary = ledger
                            .last_implementer
                            .get(task_id)
                            .map(|result| result.summary.clone());
                    }
                    AgentRole::Implementer => {
                        if let Some(review) = ledger.last_reviewer.get(task_id) {
                            delta.required_fixes = review.required_fixes.clone();
                        }
                    }
                }
            }
        }

        // Context discipline bounds how much carryover rides the prompt:
        // minimal skips retrieval entirely, standard halves the fact cap.
        if self.env.discipline == ContextDiscipline::Minimal {
            return delta;
        }
        let facts = self.facts.lock().await;
        if let Some(store) = facts.get(run_id) {
            let mut query = RetrievalQuery::new(description, task_id);
            query.max_facts = match self.env.discipline {
                ContextDiscipline::Standard => (self.policy.retriever_max_facts / 2).max(1),
                _ => self.policy.retriever_max_facts,
            };
            query.max_tokens = self.policy.retriever_max_tokens;
            query.chars_per_token = self.policy.chars_per_token;
            delta.facts = retrieve(store, &query)
                .into_iter()
                .map(|fact| DeltaFact {
                    subject: fact.subject,
                    relation: fact.relation,
                    object: fact.object,
                })
                .collect();
        }

        delta
    }

    #[allow(clippy::too_many_arguments)]
    fn build_tail(
        &self,
        task_id: &str,
        max_output_tokens: u64,
        delta: &DeltaPacket,
        guide_cache_key: &str,
        role: AgentRole,
        guide_mode: GuideMode,
        task_prompt: &str,
    ) -> String {
        let delta_json = serde_json::to_string(delta).unwrap_or_else(|_| "{}".to_string());
        let guide_line = match guide_mode {
            GuideMode::Full => format!("GUIDE: {}", guide_text(role)),
            GuideMode::Compact => format!("GUIDE: cached:{guide_cache_key}"),
        };
        let mut tail = format!(
            "TASK: {task_id}\nMAX_OUTPUT_TOKENS: {max_output_tokens}\nDELTA: {delta_json}\nGUIDE_CACHE_KEY: {guide_cache_key}\n{guide_line}\n"
        );
        if !delta.facts.is_empty() {
            tail.push_str("CONTEXT:\n");
            for fact in &delta.facts {
                tail.push_str(&format!(
                    "- {} {} {}\n",
                    fact.subject, fact.relation, fact.object
                ));
            }
        }
        tail.push_str("PROMPT:\n");
        tail.push_str(task_prompt);
        tail
    }

    // ------------------------------------------------------------------
    // ingest_output
    // ------------------------------------------------------------------

    pub async fn ingest_output(
        &self,
        run_id: &str,
        role: AgentRole,
        task_id: &str,
        output_content: Option<&str>,
        output_file_path: Option<&str>,
        max_output_tokens: Option<u64>,
    ) -> ActionResponse {
        let Some(snapshot) = self.snapshots.get(run_id).await else {
            return ActionResponse::fail(
                format!("run {run_id} not found"),
                error_code::RUN_NOT_FOUND,
                json!({}),
            );
        };

        let raw = match self.resolve_output(output_content, output_file_path).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                return ActionResponse::fail(
                    "no dispatch output provided",
                    error_code::DISPATCH_OUTPUT_MISSING,
                    json!({}),
                )
            }
            Err(response) => return response,
        };

        let Some(contract_text) = extract_contract(&raw) else {
            return ActionResponse::fail(
                "dispatch result markers not found",
                error_code::DISPATCH_OUTPUT_MISSING,
                json!({}),
            );
        };

        let parsed: Option<Value> = serde_json::from_str(&contract_text).ok();
        let schema_type = match role {
            AgentRole::Implementer => IMPLEMENTER_RESULT_TYPE,
            AgentRole::Reviewer => REVIEWER_RESULT_TYPE,
        };
        let schema_ok = parsed
            .as_ref()
            .map(|value| self.schemas.validate(schema_type, value, None))
            .unwrap_or(false);

        if !schema_ok {
            return self
                .handle_schema_failure(run_id, role, task_id, &snapshot)
                .await;
        }
        let payload = parsed.expect("schema_ok implies parsed");

        if let Some(budget) = max_output_tokens {
            let tokens = estimate_tokens(&contract_text) as u64;
            if tokens > budget {
                return ActionResponse::fail(
                    format!("output is {tokens} tokens; budget is {budget}"),
                    error_code::OUTPUT_TOKEN_BUDGET_EXCEEDED,
                    json!({"output_tokens": tokens, "max_output_tokens": budget}),
                );
            }
        }

        match role {
            AgentRole::Implementer => {
                self.ingest_implementer(run_id, task_id, payload).await
            }
            AgentRole::Reviewer => self.ingest_reviewer(run_id, task_id, payload).await,
        }
    }

    async fn resolve_output(
        &self,
        output_content: Option<&str>,
        output_file_path: Option<&str>,
    ) -> std::result::Result<Option<String>, ActionResponse> {
        if let Some(content) = output_content {
            if !content.trim().is_empty() {
                return Ok(Some(content.to_string()));
            }
        }
        let Some(path) = output_file_path else {
            return Ok(None);
        };
        let resolved = {
            let candidate = PathBuf::from(path);
            if candidate.is_absolute() {
                candidate
            } else {
                self.project_path.join(candidate)
            }
        };
        match self.file_cache.get(&resolved, Some("ingest")).await {
            Ok(content) => Ok(content),
            Err(err) => Err(ActionResponse::fail(
                err.to_string(),
                error_code::IO_ERROR,
                json!({}),
            )),
        }
    }

    async fn handle_schema_failure(
        &self,
        run_id: &str,
        role: AgentRole,
        task_id: &str,
        snapshot: &RunSnapshot,
    ) -> ActionResponse {
        let retry_key = format!("schema_invalid_retries:{}:{}", role.as_str(), task_id);
        let prior: u32 = snapshot
            .fact(&retry_key)
            .and_then(|fact| fact.v.parse().ok())
            .unwrap_or(0);
        let count = prior + 1;
        let terminal = count >= 2;

        let mut draft = EventDraft::new(
            run_id,
            if terminal {
                EventType::Error
            } else {
                EventType::StateDelta
            },
            json!({
                "error": "schema_invalid",
                "role": role,
                "task_id": task_id,
                "retry": count,
            }),
        );
        draft.step_id = task_id.to_string();
        draft.agent_id = role.as_str().to_string();
        let retry_fact = RunFact {
            k: retry_key,
            v: count.to_string(),
            confidence: 1.0,
        };
        let applied = self
            .apply_event(draft, move |update| update.facts.push(retry_fact))
            .await;
        if let Err(err) = applied {
            return ActionResponse::fail(err.to_string(), error_code::INTERNAL_ERROR, json!({}));
        }

        let next_action = if terminal {
            NextAction::HaltSchemaInvalidTerminal
        } else {
            NextAction::RetryOnceSchemaInvalid
        };
        ActionResponse::fail(
            "dispatch output failed contract validation",
            error_code::SCHEMA_INVALID,
            json!({"next_action": next_action, "retry_count": count}),
        )
    }

    async fn ingest_implementer(
        &self,
        run_id: &str,
        task_id: &str,
        payload: Value,
    ) -> ActionResponse {
        let result: ImplementerResult = match serde_json::from_value(payload.clone()) {
            Ok(result) => result,
            Err(err) => {
                return ActionResponse::fail(err.to_string(), error_code::SCHEMA_INVALID, json!({}))
            }
        };

        let stalled = {
            let mut ledgers = self.ledgers.lock().await;
            let ledger = ledgers.entry(run_id.to_string()).or_default();
            ledger
                .last_implementer
                .insert(task_id.to_string(), result.clone());
            let attempts = ledger
                .implementer_attempts
                .entry(task_id.to_string())
                .or_insert(0);
            *attempts += 1;
            *attempts > self.policy.stalled_threshold
        };

        self.add_session_facts(run_id, extract_from_implementer(&result, task_id))
            .await;

        let (status, mut next_action) = match result.status {
            TaskStatus::Completed => {
                if self.policy.reviewer_enabled {
                    (RunStatus::Running, NextAction::DispatchReviewer)
                } else {
                    (RunStatus::Done, NextAction::FinalizeTask)
                }
            }
            TaskStatus::Blocked => (
                RunStatus::Blocked,
                NextAction::RetryImplementerWithConstraints,
            ),
            TaskStatus::Failed => (RunStatus::Running, NextAction::RetryImplementer),
        };
        if stalled {
            next_action = NextAction::HaltStalled;
        }

        let mut draft = EventDraft::new(run_id, EventType::LlmResponse, payload);
        draft.step_id = task_id.to_string();
        draft.agent_id = AgentRole::Implementer.as_str().to_string();
        let snapshot = match self
            .apply_event(draft, move |update| update.status = status)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                return ActionResponse::fail(err.to_string(), error_code::INTERNAL_ERROR, json!({}))
            }
        };

        emit_runtime_event(
            tracing::Level::INFO,
            ProcessKind::Engine,
            RuntimeEventRecord {
                event: "implementer_ingested",
                component: "dispatch_runtime",
                run_id: Some(run_id),
                partition: Some(run_id),
                sequence: Some(snapshot.applied_offset(run_id)),
                role: Some("implementer"),
                task_id: Some(task_id),
                provider: None,
                decision: Some(result.status.as_str()),
                error_code: None,
                detail: None,
            },
        );
        ActionResponse::ok(
            "implementer output ingested",
            json!({
                "next_action": next_action,
                "run_status": snapshot.status,
                "revision": snapshot.revision,
                "task_status": result.status,
            }),
        )
    }

    async fn ingest_reviewer(&self, run_id: &str, task_id: &str, payload: Value) -> ActionResponse {
        let result: ReviewerResult = match serde_json::from_value(payload.clone()) {
            Ok(result) => result,
            Err(err) => {
                return ActionResponse::fail(err.to_string(), error_code::SCHEMA_INVALID, json!({}))
            }
        };

        let loops = {
            let mut ledgers = self.ledgers.lock().await;
            let ledger = ledgers.entry(run_id.to_string()).or_default();
            ledger
                .last_reviewer
                .insert(task_id.to_string(), result.clone());
            match result.assessment {
                ReviewAssessment::NeedsChanges => {
                    let counter = ledger.review_loops.entry(task_id.to_string()).or_insert(0);
                    *counter += 1;
                    *counter
                }
                ReviewAssessment::Approved => {
                    ledger.review_loops.remove(task_id);
                    ledger.implementer_attempts.remove(task_id);
                    0
                }
                ReviewAssessment::Blocked => {
                    ledger.review_loops.get(task_id).copied().unwrap_or(0)
                }
            }
        };

        self.add_session_facts(run_id, extract_from_reviewer(&result, task_id))
            .await;

        let loop_halted = result.assessment == ReviewAssessment::NeedsChanges
            && loops > self.policy.review_loop_threshold;
        let (status, next_action) = if loop_halted {
            (RunStatus::Failed, NextAction::HaltReviewLoop)
        } else {
            match result.assessment {
                ReviewAssessment::Approved => (RunStatus::Done, NextAction::FinalizeTask),
                ReviewAssessment::NeedsChanges => {
                    (RunStatus::Blocked, NextAction::DispatchImplementerFixes)
                }
                ReviewAssessment::Blocked => (RunStatus::Blocked, NextAction::HaltReviewerBlocked),
            }
        };

        let mut draft = EventDraft::new(run_id, EventType::LlmResponse, payload);
        draft.step_id = task_id.to_string();
        draft.agent_id = AgentRole::Reviewer.as_str().to_string();
        let snapshot = match self
            .apply_event(draft, move |update| update.status = status)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                return ActionResponse::fail(err.to_string(), error_code::INTERNAL_ERROR, json!({}))
            }
        };

        emit_runtime_event(
            tracing::Level::INFO,
            ProcessKind::Engine,
            RuntimeEventRecord {
                event: "reviewer_ingested",
                component: "dispatch_runtime",
                run_id: Some(run_id),
                partition: Some(run_id),
                sequence: Some(snapshot.applied_offset(run_id)),
                role: Some("reviewer"),
                task_id: Some(task_id),
                provider: None,
                decision: Some(result.assessment.as_str()),
                error_code: None,
                detail: None,
            },
        );
        ActionResponse::ok(
            "reviewer output ingested",
            json!({
                "next_action": next_action,
                "run_status": snapshot.status,
                "revision": snapshot.revision,
                "assessment": result.assessment,
                "review_loops": loops,
            }),
        )
    }

    // ------------------------------------------------------------------
    // dispatch_and_ingest
    // ------------------------------------------------------------------

    pub async fn dispatch_and_ingest(
        &self,
        run_id: &str,
        role: AgentRole,
        task_id: &str,
        task_prompt: Option<&str>,
        max_output_tokens: u64,
        compaction_auto: bool,
    ) -> ActionResponse {
        // Ingress hook point: the action itself can be vetoed before any
        // compilation work happens.
        let ingress_request = json!({
            "run_id": run_id,
            "role": role,
            "task_id": task_id,
            "max_output_tokens": max_output_tokens,
        });
        match run_chain(
            Hook::OnIngress,
            &ingress_request,
            &self.interceptors,
            &self.policy.chain,
        )
        .await
        {
            Ok(chain_outcome) => {
                if let Some(response) = self
                    .record_chain(run_id, task_id, role, Hook::OnIngress, &chain_outcome)
                    .await
                {
                    return response;
                }
            }
            Err(err) => {
                return ActionResponse::fail(err.to_string(), error_code::INTERNAL_ERROR, json!({}))
            }
        }

        let outcome = match self
            .compile_inner(run_id, role, task_id, task_prompt, max_output_tokens, compaction_auto)
            .await
        {
            Ok(outcome) => outcome,
            Err(response) => return response,
        };

        let prompt_text = {
            let ledgers = self.ledgers.lock().await;
            ledgers
                .get(run_id)
                .and_then(|ledger| ledger.task_prompts.get(task_id))
                .cloned()
                .unwrap_or_default()
        };

        let classification = classify(&ClassifierInput::new(&prompt_text));
        let tier = classification.level.tier();

        // Role-level overrides beat the routing table; a raw CLI override
        // bypasses the catalog entirely.
        let (provider, mut command) = match self.env.role_overrides.get(&role) {
            Some(RoleOverride::RawCli(raw)) => {
                let mut parts = raw.split_whitespace().map(str::to_string);
                let Some(program) = parts.next() else {
                    return ActionResponse::fail(
                        "empty raw CLI override",
                        error_code::PROVIDER_NOT_CONFIGURED,
                        json!({}),
                    );
                };
                let args: Vec<String> = parts.collect();
                let display = raw.clone();
                (
                    None,
                    CommandTemplate {
                        command: program,
                        args,
                        display,
                    },
                )
            }
            Some(RoleOverride::Provider(provider)) => {
                let provider = *provider;
                let model = self.env.model_for(role, tier);
                let reasoning = self.env.reasoning_for(role, tier);
                match self.catalog.build_command(provider, role, model, reasoning) {
                    Some(command) => (Some(provider), command),
                    None => {
                        return ActionResponse::fail(
                            format!("provider {provider} has no {role} command"),
                            error_code::PROVIDER_NOT_CONFIGURED,
                            json!({}),
                        )
                    }
                }
            }
            None => {
                let (resolved_tier, provider) =
                    match self.routing.resolve(tier, role, &self.catalog) {
                        Ok(resolved) => resolved,
                        Err(err) => {
                            return ActionResponse::fail(
                                err.to_string(),
                                error_code::PROVIDER_NOT_CONFIGURED,
                                json!({}),
                            )
                        }
                    };
                let model = self.env.model_for(role, resolved_tier);
                let reasoning = self.env.reasoning_for(role, resolved_tier);
                match self.catalog.build_command(provider, role, model, reasoning) {
                    Some(command) => (Some(provider), command),
                    None => {
                        return ActionResponse::fail(
                            format!("provider {provider} has no {role} command"),
                            error_code::PROVIDER_NOT_CONFIGURED,
                            json!({}),
                        )
                    }
                }
            }
        };

        // Interception: mutations are legal before the cache key is
        // computed, observe-only after routing.
        let mut request = json!({
            "run_id": run_id,
            "role": role,
            "task_id": task_id,
            "provider": provider.map(|p| p.as_str()),
            "classification": classification,
            "stable_prefix_hash": outcome.stable_prefix_hash,
            "prompt_tokens": outcome.prompt_tokens_after,
        });
        for hook in [Hook::OnSendPreCacheKey, Hook::OnSendPostRoute] {
            match run_chain(hook, &request, &self.interceptors, &self.policy.chain).await {
                Ok(chain_outcome) => {
                    if let Some(response) = self
                        .record_chain(run_id, task_id, role, hook, &chain_outcome)
                        .await
                    {
                        return response;
                    }
                    request = chain_outcome.request;
                }
                Err(err) => {
                    return ActionResponse::fail(
                        err.to_string(),
                        error_code::INTERNAL_ERROR,
                        json!({}),
                    )
                }
            }
        }

        // Provider prompt-cache hints. The cache key combines the stable
        // prefix hash (head) with the full prompt hash (tail), so two
        // dispatches sharing a prefix share the head side of the key.
        if let Some(provider) = provider {
            let adapter = cache_adapter_for(provider);
            let model_name = self
                .env
                .model_for(role, tier)
                .unwrap_or(provider.as_str())
                .to_string();
            let prompt_cache_key = compute_cache_key(
                &model_name,
                false,
                &[Message {
                    role: "system".to_string(),
                    content: outcome.stable_prefix_hash.clone(),
                    pair_id: None,
                    pair_side: None,
                }],
                &[Message {
                    role: "user".to_string(),
                    content: outcome.full_prompt_hash.clone(),
                    pair_id: None,
                    pair_side: None,
                }],
            );
            let cache_request = CacheRequest {
                cache_key: &prompt_cache_key.cache_key,
                retention: self.policy.cache_retention.as_deref(),
            };
            let mutation = adapter.apply(&cache_request);
            if !mutation.is_empty() {
                if let Some(object) = request.as_object_mut() {
                    for (key, value) in mutation.fields {
                        object.insert(key, value);
                    }
                }
            }
            let telemetry = adapter.extract_telemetry(&json!({}), &cache_request);
            let mut ledgers = self.ledgers.lock().await;
            ledgers.entry(run_id.to_string()).or_default().provider_cache = Some(telemetry);
        }

        // Budget guard, when candidates are configured.
        if !self.policy.candidates.is_empty() {
            let budget_request = BudgetRequest {
                input_tokens: outcome.prompt_tokens_after as u64,
                output_tokens: max_output_tokens,
                interactive: false,
            };
            let preferred = self.env.model_for(role, tier);
            let decision = filter_candidates(
                &budget_request,
                &self.policy.candidates,
                &self.policy.budget_policy,
                preferred,
            );
            let mut draft = EventDraft::new(
                run_id,
                EventType::BudgetDecision,
                json!({
                    "decision": decision.verdict,
                    "reason_codes": decision.reason_codes.clone(),
                    "selected_model": decision.selected_model.clone(),
                    "retry_after_s": decision.retry_after_s,
                }),
            );
            draft.step_id = task_id.to_string();
            draft.agent_id = role.as_str().to_string();
            if let Err(err) = self.apply_event(draft, |_| {}).await {
                return ActionResponse::fail(err.to_string(), error_code::INTERNAL_ERROR, json!({}));
            }
            match decision.verdict {
                BudgetVerdict::Deny => {
                    return ActionResponse::fail(
                        "budget guard denied the dispatch",
                        error_code::BUDGET_DENIED,
                        json!({"decision": decision}),
                    )
                }
                BudgetVerdict::Queue => {
                    return ActionResponse::fail(
                        "budget guard queued the dispatch",
                        error_code::BUDGET_QUEUED,
                        json!({"decision": decision}),
                    )
                }
                BudgetVerdict::Degrade => {
                    if let (Some(provider), Some(degraded)) = (provider, &decision.degraded_model) {
                        if let Some(rebuilt) = self.catalog.build_command(
                            provider,
                            role,
                            Some(degraded),
                            self.env.reasoning_for(role, tier),
                        ) {
                            command = rebuilt;
                        }
                    }
                }
                BudgetVerdict::Allow => {}
            }
        }

        let contract_path = self
            .global_dir
            .join("dispatch")
            .join(run_id)
            .join(format!("{task_id}-{}.contract.txt", role.as_str()));
        let debug_path = self
            .global_dir
            .join("dispatch")
            .join(run_id)
            .join(format!("{task_id}-{}.debug.txt", role.as_str()));

        let execution = match execute(DispatchInput {
            run_id: run_id.to_string(),
            role,
            task_id: task_id.to_string(),
            project_path: self.project_path.clone(),
            prompt: outcome.prompt.clone(),
            command,
            contract_output_path: contract_path.clone(),
            debug_output_path: debug_path.clone(),
        })
        .await
        {
            Ok(result) => result,
            Err(err) => {
                return ActionResponse::fail(
                    err.to_string(),
                    error_code::DISPATCH_EXECUTION_FAILED,
                    json!({"next_action": NextAction::DispatchExecutionFailed}),
                )
            }
        };
        let execution_block = execution_json(&execution);

        if !execution.succeeded() {
            return ActionResponse::fail(
                "provider process exited non-zero",
                error_code::DISPATCH_EXECUTION_FAILED,
                json!({
                    "next_action": NextAction::DispatchExecutionFailed,
                    "execution": execution_block,
                }),
            );
        }

        let contract_raw = tokio::fs::read_to_string(&contract_path)
            .await
            .unwrap_or_default();
        if contract_raw.trim().is_empty() {
            return ActionResponse::fail(
                "provider wrote no contract output",
                error_code::DISPATCH_OUTPUT_MISSING,
                json!({"execution": execution_block}),
            );
        }

        let mut response = self
            .ingest_output(
                run_id,
                role,
                task_id,
                None,
                Some(&contract_path.to_string_lossy()),
                Some(max_output_tokens),
            )
            .await;
        if response.data.is_object() {
            response.data["execution"] = execution_block;
        }
        response
    }

    /// Record chain reports as an event; returns a terminal response when
    /// the request was dropped.
    async fn record_chain(
        &self,
        run_id: &str,
        task_id: &str,
        role: AgentRole,
        hook: Hook,
        outcome: &ChainOutcome,
    ) -> Option<ActionResponse> {
        if !outcome.reports.is_empty() {
            let mut draft = EventDraft::new(
                run_id,
                EventType::InterceptorDecision,
                json!({
                    "hook": hook,
                    "dropped": outcome.dropped,
                    "drop_reason_code": outcome.drop_reason_code,
                    "reports": outcome.reports,
                }),
            );
            draft.step_id = task_id.to_string();
            draft.agent_id = role.as_str().to_string();
            if let Err(err) = self.apply_event(draft, |_| {}).await {
                return Some(ActionResponse::fail(
                    err.to_string(),
                    error_code::INTERNAL_ERROR,
                    json!({}),
                ));
            }
        }
        if outcome.dropped {
            return Some(ActionResponse::fail(
                "request dropped by interceptor",
                error_code::INTERCEPTOR_DROPPED,
                json!({
                    "drop_reason_code": outcome.drop_reason_code,
                    "reports": outcome.reports,
                }),
            ));
        }
        None
    }

    // ------------------------------------------------------------------
    // Read-only actions
    // ------------------------------------------------------------------

    pub async fn get_snapshot(&self, run_id: &str) -> ActionResponse {
        match self.snapshots.get(run_id).await {
            Some(snapshot) => {
                let facts = self.session_facts(run_id).await;
                ActionResponse::ok(
                    "snapshot",
                    json!({"snapshot": snapshot, "session_facts": facts}),
                )
            }
            None => ActionResponse::fail(
                format!("run {run_id} not found"),
                error_code::RUN_NOT_FOUND,
                json!({}),
            ),
        }
    }

    pub async fn get_telemetry(&self, run_id: &str) -> ActionResponse {
        let events = self.stream.read_partition(run_id, 0).await;
        let mut telemetry: RunTelemetry = aggregate(&events);
        telemetry.file_cache = self.file_cache.get_telemetry().await;
        telemetry.provider_cache = {
            let ledgers = self.ledgers.lock().await;
            ledgers.get(run_id).and_then(|l| l.provider_cache.clone())
        };
        ActionResponse::ok(
            "telemetry",
            serde_json::to_value(&telemetry).unwrap_or_else(|_| json!({})),
        )
    }

    pub async fn list_runs(&self) -> Vec<RunSnapshot> {
        self.snapshots.list_runs().await
    }

    pub async fn session_facts(&self, run_id: &str) -> Vec<SessionFact> {
        let facts = self.facts.lock().await;
        facts
            .get(run_id)
            .map(|store| store.get_valid())
            .unwrap_or_default()
    }

    /// Force both durable stores to disk.
    pub async fn flush(&self) -> Result<()> {
        self.stream.flush().await?;
        self.snapshots.flush().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn add_session_facts(&self, run_id: &str, extracted: Vec<SessionFact>) {
        let mut facts = self.facts.lock().await;
        let store = facts.entry(run_id.to_string()).or_insert_with(|| {
            SessionFactStore::new(FactStoreConfig {
                max_valid_facts: self.policy.max_session_facts,
            })
        });
        store.add(extracted);
    }

    /// Publish an event and fold it into the run snapshot. Events whose
    /// sequence is already covered by the snapshot are no-ops.
    async fn apply_event<F>(&self, draft: EventDraft, adjust: F) -> Result<RunSnapshot>
    where
        F: FnOnce(&mut SnapshotUpdate),
    {
        let envelope = self.stream.publish(draft).await?;
        let previous = self.snapshots.get(&envelope.run_id).await;
        if let Some(prev) = &previous {
            if envelope.sequence <= prev.applied_offset(&envelope.partition_key) {
                return Ok(prev.clone());
            }
        }
        let mut update = project(previous.as_ref(), &envelope);
        adjust(&mut update);
        Ok(self.snapshots.upsert(update).await?)
    }
}

fn execution_json(result: &DispatchResult) -> Value {
    json!({
        "exit_code": result.exit_code,
        "signal": result.signal,
        "duration_ms": result.duration_ms,
        "contract_output_path": result.contract_output_path.to_string_lossy(),
        "debug_output_path": result.debug_output_path.to_string_lossy(),
    })
}

/// Extract the payload strictly between the marker lines.
fn extract_contract(raw: &str) -> Option<String> {
    let mut inside = false;
    let mut collected: Vec<&str> = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if !inside {
            if line == BEGIN_MARKER {
                inside = true;
            }
            continue;
        }
        if line == END_MARKER {
            return Some(collected.join("\n"));
        }
        collected.push(line);
    }
    None
}

fn clip_chars(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}
