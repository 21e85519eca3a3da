//! Workflow Orchestrator
//!
//! Drives one execution through the pipeline activities. After each activity
//! the new `current_activity` and the full [`PipelineState`] are persisted
//! together before the next activity starts, so a restarted process picks up
//! at `current_activity + 1` and never repeats a completed activity.
//!
//! Status changes go through the store's compare-and-set transition, using
//! the table on [`WorkflowStatus`].

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kex_core::{
    Activity, ActivityStatus, DocumentVersion, ExtractionScope, KexError, ProgressSignal,
    ProgressStatus, Result, SourceDocument, StatusPatch, WorkflowConfig, WorkflowExecution,
    WorkflowStatus,
};
use kex_extractor::RetryPolicy;
use kex_ontology::{OntologyContext, OntologyRegistry};
use kex_store::{NewExecution, Store};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::pipeline::{Pipeline, PipelineState, WorkflowInput, WORKFLOW_TYPE};
use crate::signals::SignalHub;

// ============================================================================
// Run options and outcomes
// ============================================================================

/// Per-call run settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Stop after this activity's checkpoint, leaving the execution `running`
    pub suspend_after: Option<Activity>,
}

impl RunOptions {
    pub fn suspend_after(activity: Activity) -> Self {
        Self {
            suspend_after: Some(activity),
        }
    }
}

/// How a call to run or resume ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(WorkflowExecution),
    Failed(WorkflowExecution),
    Cancelled(WorkflowExecution),
    /// Stopped at a checkpoint by [`RunOptions::suspend_after`]
    Suspended(WorkflowExecution),
}

impl RunOutcome {
    fn from_execution(execution: WorkflowExecution) -> Self {
        match execution.status {
            WorkflowStatus::Completed => Self::Completed(execution),
            WorkflowStatus::Failed => Self::Failed(execution),
            WorkflowStatus::Cancelled => Self::Cancelled(execution),
            WorkflowStatus::Queued | WorkflowStatus::Running => Self::Suspended(execution),
        }
    }

    pub fn execution(&self) -> &WorkflowExecution {
        match self {
            Self::Completed(e) | Self::Failed(e) | Self::Cancelled(e) | Self::Suspended(e) => e,
        }
    }

    pub fn into_execution(self) -> WorkflowExecution {
        match self {
            Self::Completed(e) | Self::Failed(e) | Self::Cancelled(e) | Self::Suspended(e) => e,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

enum Progress {
    Finished(PipelineState),
    Suspended,
}

/// Removes an execution from the in-process run table
struct RunGuard<'a> {
    running: &'a DashMap<Uuid, CancellationToken>,
    id: Uuid,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.id);
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Runs, resumes, and cancels extraction workflow executions
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    store: Arc<dyn Store>,
    registry: OntologyRegistry,
    signals: SignalHub,
    retry: RetryPolicy,
    workflow_version: i32,
    running: DashMap<Uuid, CancellationToken>,
}

impl Orchestrator {
    pub fn new(pipeline: Pipeline, registry: OntologyRegistry) -> Self {
        let store = Arc::clone(pipeline.store());
        let defaults = WorkflowConfig::default();
        Self {
            pipeline: Arc::new(pipeline),
            store,
            registry,
            signals: SignalHub::default(),
            retry: RetryPolicy::new(
                defaults.activity_max_attempts,
                defaults.activity_backoff_ms,
                defaults.activity_max_backoff_ms,
            ),
            workflow_version: defaults.workflow_version,
            running: DashMap::new(),
        }
    }

    /// Activity retry budget and workflow version
    pub fn with_settings(mut self, config: &WorkflowConfig) -> Self {
        self.retry = RetryPolicy::new(
            config.activity_max_attempts,
            config.activity_backoff_ms,
            config.activity_max_backoff_ms,
        );
        self.workflow_version = config.workflow_version;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_signals(mut self, signals: SignalHub) -> Self {
        self.signals = signals;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &OntologyRegistry {
        &self.registry
    }

    pub fn signals(&self) -> &SignalHub {
        &self.signals
    }

    pub fn workflow_version(&self) -> i32 {
        self.workflow_version
    }

    /// Whether this process is currently driving the execution
    pub fn is_running(&self, id: Uuid) -> bool {
        self.running.contains_key(&id)
    }

    // ------------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------------

    /// Build the input for extracting `version` with the current registry
    /// content of `ontology_id`
    pub async fn prepare(&self, version: &DocumentVersion, ontology_id: &str) -> Result<WorkflowInput> {
        let ontology = self.registry.load(ontology_id).await?;
        Ok(WorkflowInput {
            organization_id: version.organization_id,
            document_id: version.document_id,
            document_version_id: version.id,
            ontology_id: ontology_id.to_string(),
            ontology_hash: ontology.content_hash().to_string(),
        })
    }

    /// Create a `queued` execution, or return the existing one for the same
    /// version, ontology, and workflow version
    pub async fn start(&self, input: WorkflowInput) -> Result<WorkflowExecution> {
        let (execution, created) = self
            .store
            .create_execution(NewExecution {
                organization_id: input.organization_id,
                workflow_type: WORKFLOW_TYPE.to_string(),
                version: self.workflow_version,
                input: serde_json::to_value(&input)?,
                dedupe_key: input.dedupe_key(self.workflow_version),
            })
            .await?;
        if created {
            info!(
                execution = %execution.id,
                version = %input.document_version_id,
                "Workflow execution queued"
            );
        } else {
            debug!(
                execution = %execution.id,
                status = %execution.status,
                "Reusing existing workflow execution"
            );
        }
        Ok(execution)
    }

    /// Materialize a source document and extract it to a settled state
    ///
    /// Submitting the same source again reuses its document, version, and
    /// execution; a completed execution is returned without running anything.
    pub async fn extract(&self, source: &SourceDocument, ontology_id: &str) -> Result<RunOutcome> {
        let materialized = self.store.materialize(source).await?;
        let input = self.prepare(&materialized.version, ontology_id).await?;
        let execution = self.start(input).await?;
        self.advance(execution, RunOptions::default()).await
    }

    /// Take an execution from whatever status it is in toward completion
    pub async fn advance(&self, execution: WorkflowExecution, options: RunOptions) -> Result<RunOutcome> {
        match execution.status {
            WorkflowStatus::Queued => self.run(execution.id, options).await,
            WorkflowStatus::Completed => Ok(RunOutcome::Completed(execution)),
            _ => self.resume(execution.id, options).await,
        }
    }

    /// Run a `queued` execution
    pub async fn run(&self, id: Uuid, options: RunOptions) -> Result<RunOutcome> {
        let execution = self
            .store
            .transition_status(id, WorkflowStatus::Queued, WorkflowStatus::Running, StatusPatch::started())
            .await?;
        self.drive(execution, options).await
    }

    /// Continue an execution from its last checkpoint
    ///
    /// `failed` and `cancelled` executions move back to `running`. A
    /// `running` execution not driven by this process is treated as
    /// interrupted and continued as is.
    pub async fn resume(&self, id: Uuid, options: RunOptions) -> Result<RunOutcome> {
        let execution = self.load(id).await?;
        let execution = match execution.status {
            WorkflowStatus::Queued => return self.run(id, options).await,
            WorkflowStatus::Running => {
                info!(
                    execution = %id,
                    current_activity = ?execution.current_activity,
                    "Resuming interrupted execution"
                );
                execution
            }
            from => {
                let resumed = self
                    .store
                    .transition_status(id, from, WorkflowStatus::Running, StatusPatch::started())
                    .await?;
                info!(
                    execution = %id,
                    from = %from,
                    current_activity = ?resumed.current_activity,
                    "Resuming execution"
                );
                resumed
            }
        };
        self.drive(execution, options).await
    }

    /// Cancel an execution
    ///
    /// An execution running in this process has its in-flight activity
    /// cancelled; the checkpoint stays at the last completed activity and the
    /// runner records the `cancelled` status. Otherwise the status is moved
    /// to `cancelled` directly.
    pub async fn cancel(&self, id: Uuid) -> Result<WorkflowExecution> {
        let token = self.running.get(&id).map(|t| t.value().clone());
        if let Some(token) = token {
            token.cancel();
            info!(execution = %id, "Cancellation requested");
            return self.load(id).await;
        }

        let execution = self.load(id).await?;
        let cancelled = self
            .store
            .transition_status(id, execution.status, WorkflowStatus::Cancelled, StatusPatch::default())
            .await?;
        self.signals.close(id);
        info!(execution = %id, from = %execution.status, "Execution cancelled");
        Ok(cancelled)
    }

    /// Resume executions left `running` by a process that died
    pub async fn recover_incomplete(&self) -> Result<Vec<RunOutcome>> {
        let stranded = self.store.list_executions(Some(WorkflowStatus::Running)).await?;
        let mut outcomes = Vec::new();
        for execution in stranded {
            if execution.workflow_type != WORKFLOW_TYPE || self.is_running(execution.id) {
                continue;
            }
            match self.resume(execution.id, RunOptions::default()).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(execution = %execution.id, error = %e, "Failed to recover execution"),
            }
        }
        info!(recovered = outcomes.len(), "Recovery pass finished");
        Ok(outcomes)
    }

    pub async fn status(&self, id: Uuid) -> Result<WorkflowExecution> {
        self.load(id).await
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    async fn load(&self, id: Uuid) -> Result<WorkflowExecution> {
        self.store
            .get_execution(id)
            .await?
            .ok_or_else(|| KexError::NotFound(format!("workflow execution {id}")))
    }

    async fn drive(&self, execution: WorkflowExecution, options: RunOptions) -> Result<RunOutcome> {
        let id = execution.id;
        let token = CancellationToken::new();
        match self.running.entry(id) {
            Entry::Occupied(_) => {
                return Err(KexError::Validation(format!(
                    "execution {id} is already running in this process"
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }
        let _guard = RunGuard {
            running: &self.running,
            id,
        };

        let outcome = match self.execute(&execution, &token, options).await {
            Ok(Progress::Finished(state)) => {
                let summary = state.summary();
                let done = self
                    .settle(id, WorkflowStatus::Completed, StatusPatch::completed(serde_json::to_value(&summary)?))
                    .await?;
                info!(
                    execution = %id,
                    entities = summary.entities,
                    relations = summary.relations,
                    rejected = summary.rejected_relations,
                    skipped_chunks = summary.skipped_chunks,
                    "Workflow execution completed"
                );
                RunOutcome::from_execution(done)
            }
            Ok(Progress::Suspended) => return Ok(RunOutcome::Suspended(self.load(id).await?)),
            Err(KexError::Cancelled) => {
                self.emit_stopped(id, ProgressStatus::Cancelled).await;
                let cancelled = self
                    .settle(id, WorkflowStatus::Cancelled, StatusPatch::default())
                    .await?;
                info!(execution = %id, "Workflow execution cancelled");
                RunOutcome::from_execution(cancelled)
            }
            Err(error) => {
                self.emit_stopped(id, ProgressStatus::Failed).await;
                let failed = self
                    .settle(id, WorkflowStatus::Failed, StatusPatch::failed(error.to_string()))
                    .await?;
                warn!(execution = %id, error = %error, "Workflow execution failed");
                RunOutcome::from_execution(failed)
            }
        };
        self.signals.close(id);
        Ok(outcome)
    }

    /// Move a running execution to a settled status
    ///
    /// If another writer already moved it, the stored execution wins.
    async fn settle(&self, id: Uuid, to: WorkflowStatus, patch: StatusPatch) -> Result<WorkflowExecution> {
        match self
            .store
            .transition_status(id, WorkflowStatus::Running, to, patch)
            .await
        {
            Ok(execution) => Ok(execution),
            Err(KexError::InvalidTransition { from, .. }) => {
                debug!(execution = %id, stored = %from, wanted = %to, "Execution settled elsewhere");
                self.load(id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn execute(
        &self,
        execution: &WorkflowExecution,
        token: &CancellationToken,
        options: RunOptions,
    ) -> Result<Progress> {
        let input: WorkflowInput = serde_json::from_value(execution.input.clone())?;
        let ontology = self.registry.load(&input.ontology_id).await?;
        if ontology.content_hash() != input.ontology_hash {
            return Err(KexError::Validation(format!(
                "ontology '{}' changed since the execution started (pinned {}, found {})",
                input.ontology_id,
                input.ontology_hash,
                ontology.content_hash()
            )));
        }

        let mut state: PipelineState = match &execution.checkpoint {
            Some(checkpoint) => serde_json::from_value(checkpoint.clone())?,
            None => PipelineState::default(),
        };
        let scope = Arc::new(input.scope(execution.id));

        for &activity in Activity::remaining_after(execution.current_activity) {
            if token.is_cancelled() {
                return Err(KexError::Cancelled);
            }
            state = self
                .run_activity(execution.id, activity, &scope, &ontology, &state, token)
                .await?;
            self.store
                .complete_activity(execution.id, activity, serde_json::to_value(&state)?)
                .await?;
            self.emit(ProgressSignal {
                workflow_execution_id: execution.id,
                stage: activity,
                status: ProgressStatus::Completed,
                progress: activity.progress(),
            })
            .await;

            if options.suspend_after == Some(activity) && activity.next().is_some() {
                info!(execution = %execution.id, activity = %activity, "Execution suspended at checkpoint");
                return Ok(Progress::Suspended);
            }
        }
        Ok(Progress::Finished(state))
    }

    /// Run one activity with retries, logging every attempt
    ///
    /// Each attempt works on a copy of `state`, so a failed or cancelled
    /// attempt leaves nothing behind.
    async fn run_activity(
        &self,
        execution_id: Uuid,
        activity: Activity,
        scope: &Arc<ExtractionScope>,
        ontology: &OntologyContext,
        state: &PipelineState,
        token: &CancellationToken,
    ) -> Result<PipelineState> {
        let input = json!({
            "documentVersionId": scope.document_version_id,
            "chunks": state.chunks.len(),
        });
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let record = self
                .store
                .start_activity(execution_id, activity, attempt as i32, input.clone())
                .await?;
            debug!(execution = %execution_id, activity = %activity, attempt, "Activity started");

            let mut working = state.clone();
            let span = info_span!("kex.activity", execution = %execution_id, activity = %activity, attempt);
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(KexError::Cancelled),
                result = self
                    .pipeline
                    .execute(activity, scope, ontology, &mut working)
                    .instrument(span) => result,
            };

            let error = match result {
                Ok(output) => {
                    self.store
                        .finish_activity(record.id, ActivityStatus::Completed, Some(output), None)
                        .await?;
                    info!(execution = %execution_id, activity = %activity, attempt, "Activity completed");
                    return Ok(working);
                }
                Err(error) => error,
            };

            self.store
                .finish_activity(record.id, ActivityStatus::Failed, None, Some(error.to_string()))
                .await?;
            if matches!(error, KexError::Cancelled) {
                return Err(error);
            }
            if !error.is_retryable() || attempt >= self.retry.max_attempts() {
                warn!(
                    execution = %execution_id,
                    activity = %activity,
                    attempts = attempt,
                    retryable = error.is_retryable(),
                    error = %error,
                    "Activity failed"
                );
                return Err(KexError::ActivityFailure {
                    activity: activity.to_string(),
                    attempts: attempt,
                    message: error.to_string(),
                });
            }

            let backoff = self.retry.backoff_for(attempt);
            warn!(
                execution = %execution_id,
                activity = %activity,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Activity failed, retrying"
            );
            tokio::select! {
                _ = token.cancelled() => return Err(KexError::Cancelled),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    // ------------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------------

    /// Persist and broadcast a progress signal; failures are only logged
    async fn emit(&self, signal: ProgressSignal) {
        match serde_json::to_value(&signal) {
            Ok(payload) => {
                if let Err(e) = self
                    .store
                    .record_signal(signal.workflow_execution_id, ProgressSignal::NAME, payload)
                    .await
                {
                    warn!(
                        execution = %signal.workflow_execution_id,
                        error = %e,
                        "Failed to record progress signal"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize progress signal"),
        }
        let delivered = self.signals.publish(&signal);
        debug!(
            execution = %signal.workflow_execution_id,
            stage = %signal.stage,
            delivered,
            "Progress signal published"
        );
    }

    /// Signal that the activity after the last checkpoint did not complete
    async fn emit_stopped(&self, id: Uuid, status: ProgressStatus) {
        let completed = match self.store.get_execution(id).await {
            Ok(Some(execution)) => execution.current_activity,
            Ok(None) => None,
            Err(e) => {
                warn!(execution = %id, error = %e, "Failed to load execution for progress signal");
                return;
            }
        };
        let stage = match completed {
            Some(activity) => activity.next().unwrap_or(activity),
            None => Activity::Chunk,
        };
        self.emit(ProgressSignal {
            workflow_execution_id: id,
            stage,
            status,
            progress: completed.map_or(0.0, |a| a.progress()),
        })
        .await;
    }
}
