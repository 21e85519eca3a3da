//! Batch Orchestrator
//!
//! Fans a set of documents out to per-document workflow executions with a
//! bounded number in flight. Every item change goes through the store's
//! compare-and-set `transition_item`, so recovering or retrying a batch
//! never starts the same item twice. Items left `processing` by a stopped
//! process are picked up by [`BatchOrchestrator::recover`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use kex_core::{
    Batch, BatchEvent, BatchItem, BatchSettings, BatchState, BatchSummary, KexError, Result,
    SourceDocument, WorkflowExecution, WorkflowStatus,
};
use kex_store::{ItemPatch, Store};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::orchestrator::{Orchestrator, RunOptions, RunOutcome};
use crate::pipeline::WorkflowInput;

/// Result of [`BatchOrchestrator::retry_failed`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryReport {
    /// Items moved to `retry` and started again
    pub retried: usize,
    /// Items that ran out of attempts
    pub abandoned: usize,
}

/// Runs batches of documents through the [`Orchestrator`]
pub struct BatchOrchestrator {
    orchestrator: Arc<Orchestrator>,
    concurrency: usize,
    max_attempts: i32,
    permits: DashMap<Uuid, Arc<Semaphore>>,
    /// Item tasks started by this process, keyed by batch
    tasks: DashMap<Uuid, Vec<(Uuid, JoinHandle<()>)>>,
}

impl BatchOrchestrator {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let defaults = BatchSettings::default();
        Self {
            orchestrator,
            concurrency: defaults.concurrency.max(1),
            max_attempts: defaults.max_attempts,
            permits: DashMap::new(),
            tasks: DashMap::new(),
        }
    }

    pub fn with_settings(mut self, settings: &BatchSettings) -> Self {
        self.concurrency = settings.concurrency.max(1);
        self.max_attempts = settings.max_attempts;
        self
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Materialize `sources` and queue one item per document
    ///
    /// Items start processing immediately in the background; use
    /// [`wait`](Self::wait) to block until they settle.
    pub async fn queue_batch(
        &self,
        organization_id: Uuid,
        ontology_id: &str,
        sources: &[SourceDocument],
    ) -> Result<Uuid> {
        if sources.is_empty() {
            return Err(KexError::Validation("batch has no documents".to_string()));
        }
        if let Some(foreign) = sources.iter().find(|s| s.key.organization_id != organization_id) {
            return Err(KexError::Validation(format!(
                "document '{}' belongs to organization {}, not {}",
                foreign.key.source_id, foreign.key.organization_id, organization_id
            )));
        }

        let ontology = self.orchestrator.registry().load(ontology_id).await?;
        let store = self.orchestrator.store();
        let now = Utc::now();
        let batch = Batch {
            id: Uuid::new_v4(),
            organization_id,
            ontology_id: ontology_id.to_string(),
            ontology_hash: ontology.content_hash().to_string(),
            created_at: now,
        };

        let mut items = Vec::with_capacity(sources.len());
        let mut versions = HashSet::new();
        for source in sources {
            let materialized = store.materialize(source).await?;
            // One execution per version; a repeated document would race itself
            if !versions.insert(materialized.version.id) {
                debug!(source = %source.key.source_id, "Skipping duplicate document in batch");
                continue;
            }
            items.push(BatchItem {
                id: Uuid::new_v4(),
                batch_id: batch.id,
                document_id: materialized.document.id,
                document_version_id: materialized.version.id,
                workflow_execution_id: None,
                state: BatchState::Queued,
                attempts: 0,
                last_error: None,
                updated_at: now,
            });
        }
        store.create_batch(&batch, &items).await?;
        info!(batch = %batch.id, items = items.len(), ontology = %ontology_id, "Batch queued");

        for item in items {
            self.spawn_item(&batch, item);
        }
        Ok(batch.id)
    }

    /// Wait for every item task started by this process, then summarize
    pub async fn wait(&self, batch_id: Uuid) -> Result<BatchSummary> {
        // Retries may add handles while earlier ones are joined
        while let Some((_, handles)) = self.tasks.remove(&batch_id) {
            let handles = handles.into_iter().map(|(_, handle)| handle);
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    warn!(batch = %batch_id, error = %e, "Batch item task panicked");
                }
            }
        }
        self.permits
            .remove_if(&batch_id, |_, _| !self.tasks.contains_key(&batch_id));
        self.summary(batch_id).await
    }

    pub async fn summary(&self, batch_id: Uuid) -> Result<BatchSummary> {
        let store = self.orchestrator.store();
        if store.get_batch(batch_id).await?.is_none() {
            return Err(KexError::NotFound(format!("batch {batch_id}")));
        }
        let items = store.list_items(batch_id).await?;
        Ok(BatchSummary::from_items(batch_id, &items))
    }

    /// Move `failed` items to `retry` and start them again
    ///
    /// Items that already used `max_attempts` are abandoned instead. Only
    /// items still `failed` in the store are touched, so calling this twice
    /// does not start an item twice.
    pub async fn retry_failed(&self, batch_id: Uuid) -> Result<RetryReport> {
        let batch = self.load_batch(batch_id).await?;
        let store = self.orchestrator.store();
        let mut report = RetryReport::default();

        for item in store.list_items(batch_id).await? {
            if item.state != BatchState::Failed {
                continue;
            }
            if item.attempts >= self.max_attempts {
                match store.transition_item(item.id, BatchEvent::Abandon, ItemPatch::default()).await {
                    Ok(_) => {
                        report.abandoned += 1;
                        info!(batch = %batch_id, item = %item.id, attempts = item.attempts, "Batch item abandoned");
                    }
                    Err(KexError::InvalidTransition { .. }) => {}
                    Err(e) => return Err(e),
                }
                continue;
            }
            match store.transition_item(item.id, BatchEvent::Retry, ItemPatch::default()).await {
                Ok(item) => {
                    report.retried += 1;
                    self.spawn_item(&batch, item);
                }
                Err(KexError::InvalidTransition { .. }) => {
                    debug!(item = %item.id, "Batch item changed before retry");
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            batch = %batch_id,
            retried = report.retried,
            abandoned = report.abandoned,
            "Retry pass finished"
        );
        Ok(report)
    }

    /// Restart items a stopped process left behind
    ///
    /// `queued` and `retry` items are started. A `processing` item whose
    /// execution is not driven by this process continues that execution from
    /// its checkpoint, or settles from it if the execution already ended.
    pub async fn recover(&self, batch_id: Uuid) -> Result<usize> {
        let batch = self.load_batch(batch_id).await?;
        let store = Arc::clone(self.orchestrator.store());
        let mut count = 0;

        for item in store.list_items(batch_id).await? {
            if self.is_active(batch_id, item.id) {
                continue;
            }
            match (item.state, item.workflow_execution_id) {
                (BatchState::Queued | BatchState::Retry, _) => {
                    self.spawn_item(&batch, item);
                    count += 1;
                }
                (BatchState::Processing, Some(execution_id)) => {
                    if self.orchestrator.is_running(execution_id) {
                        continue;
                    }
                    self.spawn_resume(&batch, item.id, execution_id);
                    count += 1;
                }
                (BatchState::Processing, None) => {
                    settle_item(&*store, item.id, Err("item has no workflow execution".to_string())).await;
                    count += 1;
                }
                _ => {}
            }
        }
        info!(batch = %batch_id, items = count, "Batch recovery started");
        Ok(count)
    }

    /// Give up on one failed item
    pub async fn abandon(&self, batch_id: Uuid, item_id: Uuid) -> Result<BatchItem> {
        let store = self.orchestrator.store();
        let item = store
            .get_item(item_id)
            .await?
            .filter(|i| i.batch_id == batch_id)
            .ok_or_else(|| KexError::NotFound(format!("batch item {item_id} in batch {batch_id}")))?;
        store.transition_item(item.id, BatchEvent::Abandon, ItemPatch::default()).await
    }

    async fn load_batch(&self, batch_id: Uuid) -> Result<Batch> {
        self.orchestrator
            .store()
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| KexError::NotFound(format!("batch {batch_id}")))
    }

    /// An item task of this process has not finished yet
    fn is_active(&self, batch_id: Uuid, item_id: Uuid) -> bool {
        self.tasks.get(&batch_id).is_some_and(|handles| {
            handles
                .iter()
                .any(|(id, handle)| *id == item_id && !handle.is_finished())
        })
    }

    fn permits(&self, batch_id: Uuid) -> Arc<Semaphore> {
        Arc::clone(
            self.permits
                .entry(batch_id)
                .or_insert_with(|| Arc::new(Semaphore::new(self.concurrency)))
                .value(),
        )
    }

    fn spawn_item(&self, batch: &Batch, item: BatchItem) {
        let permits = self.permits(batch.id);
        let orchestrator = Arc::clone(&self.orchestrator);
        let item_id = item.id;
        let span = info_span!("kex.batch_item", batch = %batch.id, item = %item_id);
        let handle = tokio::spawn(process_item(orchestrator, batch.clone(), item, permits).instrument(span));
        self.tasks.entry(batch.id).or_default().push((item_id, handle));
    }

    fn spawn_resume(&self, batch: &Batch, item_id: Uuid, execution_id: Uuid) {
        let permits = self.permits(batch.id);
        let orchestrator = Arc::clone(&self.orchestrator);
        let span = info_span!("kex.batch_item", batch = %batch.id, item = %item_id, execution = %execution_id);
        let handle = tokio::spawn(resume_item(orchestrator, item_id, execution_id, permits).instrument(span));
        self.tasks.entry(batch.id).or_default().push((item_id, handle));
    }
}

/// Run one item to a settled state
async fn process_item(orchestrator: Arc<Orchestrator>, batch: Batch, item: BatchItem, permits: Arc<Semaphore>) {
    let _permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Batch permits closed before the item started");
            return;
        }
    };

    let input = WorkflowInput {
        organization_id: batch.organization_id,
        document_id: item.document_id,
        document_version_id: item.document_version_id,
        ontology_id: batch.ontology_id.clone(),
        ontology_hash: batch.ontology_hash.clone(),
    };
    let store = Arc::clone(orchestrator.store());

    let execution = match orchestrator.start(input).await {
        Ok(execution) => execution,
        Err(e) => {
            warn!(error = %e, "Failed to start workflow for batch item");
            if store.transition_item(item.id, BatchEvent::Start, ItemPatch::default()).await.is_ok() {
                settle_item(&*store, item.id, Err(e.to_string())).await;
            }
            return;
        }
    };

    match store
        .transition_item(item.id, BatchEvent::Start, ItemPatch::execution(execution.id))
        .await
    {
        Ok(started) => debug!(attempt = started.attempts, execution = %execution.id, "Batch item processing"),
        Err(KexError::InvalidTransition { .. }) => {
            debug!("Batch item already taken");
            return;
        }
        Err(e) => {
            warn!(error = %e, "Failed to start batch item");
            return;
        }
    }

    let result = run_to_end(&orchestrator, execution).await;
    settle_item(&*store, item.id, result).await;
}

/// Continue a `processing` item's execution after a restart
async fn resume_item(orchestrator: Arc<Orchestrator>, item_id: Uuid, execution_id: Uuid, permits: Arc<Semaphore>) {
    let _permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Batch permits closed before the item resumed");
            return;
        }
    };

    let result = match orchestrator.status(execution_id).await {
        // Ended before the item was settled; resuming would be an unrecorded retry
        Ok(execution) if matches!(execution.status, WorkflowStatus::Failed | WorkflowStatus::Cancelled) => {
            Err(ended(execution))
        }
        Ok(execution) => {
            info!(status = %execution.status, "Resuming batch item execution");
            run_to_end(&orchestrator, execution).await
        }
        Err(e) => Err(e.to_string()),
    };
    settle_item(&**orchestrator.store(), item_id, result).await;
}

async fn run_to_end(orchestrator: &Orchestrator, execution: WorkflowExecution) -> std::result::Result<(), String> {
    match orchestrator.advance(execution, RunOptions::default()).await {
        Ok(RunOutcome::Completed(_)) => Ok(()),
        Ok(outcome) => Err(ended(outcome.into_execution())),
        Err(e) => Err(e.to_string()),
    }
}

fn ended(execution: WorkflowExecution) -> String {
    execution
        .error
        .unwrap_or_else(|| format!("execution ended {}", execution.status))
}

async fn settle_item(store: &dyn Store, item_id: Uuid, result: std::result::Result<(), String>) {
    let (event, patch) = match result {
        Ok(()) => (
            BatchEvent::Complete,
            ItemPatch {
                error: Some(None),
                ..Default::default()
            },
        ),
        Err(message) => (BatchEvent::Fail, ItemPatch::error(message)),
    };
    match store.transition_item(item_id, event, patch).await {
        Ok(item) => info!(item = %item_id, state = %item.state, attempts = item.attempts, "Batch item settled"),
        Err(e) => warn!(item = %item_id, error = %e, "Failed to settle batch item"),
    }
}
