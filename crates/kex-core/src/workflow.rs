//! Workflow and batch state machines
//!
//! Both machines are explicit enums with transition tables; persistence
//! layers compare-and-set on the current state so a transition is applied at
//! most once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{KexError, Result};

// ============================================================================
// Activities
// ============================================================================

static ORDER: [Activity; 8] = Activity::ALL;

/// Checkpointed pipeline activities, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Chunk,
    Mentions,
    Entities,
    Relations,
    Ground,
    Assemble,
    Persist,
    Index,
}

impl Activity {
    pub const ALL: [Activity; 8] = [
        Self::Chunk,
        Self::Mentions,
        Self::Entities,
        Self::Relations,
        Self::Ground,
        Self::Assemble,
        Self::Persist,
        Self::Index,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::Mentions => "mentions",
            Self::Entities => "entities",
            Self::Relations => "relations",
            Self::Ground => "ground",
            Self::Assemble => "assemble",
            Self::Persist => "persist",
            Self::Index => "index",
        }
    }

    /// 1-based position, as stored in `workflow_execution.current_activity`
    pub fn sequence(&self) -> i32 {
        *self as i32 + 1
    }

    pub fn from_sequence(seq: i32) -> Option<Self> {
        usize::try_from(seq - 1)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    /// The activity that follows this one, if any
    pub fn next(&self) -> Option<Self> {
        Self::from_sequence(self.sequence() + 1)
    }

    /// Activities still to run after `completed`
    pub fn remaining_after(completed: Option<Activity>) -> &'static [Activity] {
        match completed {
            None => &ORDER,
            Some(a) => &ORDER[a.sequence() as usize..],
        }
    }

    /// Fraction of the pipeline done once this activity completes
    pub fn progress(&self) -> f32 {
        self.sequence() as f32 / Self::ALL.len() as f32
    }
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Activity {
    type Err = KexError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| KexError::Validation(format!("unknown activity: {s}")))
    }
}

// ============================================================================
// Workflow Status
// ============================================================================

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Statuses reachable from `self`
    ///
    /// `failed` and `cancelled` return to `running` only through an explicit
    /// resume; `completed` is terminal.
    pub fn allowed_transitions(&self) -> &'static [WorkflowStatus] {
        use WorkflowStatus::*;
        match self {
            Queued => &[Running, Cancelled],
            Running => &[Completed, Failed, Cancelled],
            Failed => &[Running],
            Cancelled => &[Running],
            Completed => &[],
        }
    }

    pub fn can_transition_to(&self, to: WorkflowStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn validate_transition(&self, to: WorkflowStatus) -> Result<()> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(KexError::InvalidTransition {
                machine: "workflow",
                from: self.to_string(),
                event: to.to_string(),
            })
        }
    }

    /// Whether no process is expected to be driving the execution
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = KexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(KexError::Validation(format!("unknown workflow status: {s}"))),
        }
    }
}

/// Durable record of one pipeline run over one document version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub workflow_type: String,
    pub version: i32,
    pub status: WorkflowStatus,
    /// Last completed activity
    pub current_activity: Option<Activity>,
    /// Serialized pipeline state as of `current_activity`
    pub checkpoint: Option<serde_json::Value>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub dedupe_key: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values to apply alongside a status transition
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub output: Option<serde_json::Value>,
    /// `Some(None)` clears a previous error
    pub error: Option<Option<String>>,
    pub mark_started: bool,
    pub mark_completed: bool,
}

impl StatusPatch {
    pub fn started() -> Self {
        Self {
            error: Some(None),
            mark_started: true,
            ..Default::default()
        }
    }

    pub fn completed(output: serde_json::Value) -> Self {
        Self {
            output: Some(output),
            mark_completed: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(Some(error.into())),
            ..Default::default()
        }
    }
}

/// Status of one activity attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Running,
    Completed,
    Failed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ActivityStatus {
    type Err = KexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(KexError::Validation(format!("unknown activity status: {s}"))),
        }
    }
}

/// One attempted activity execution (the audit trail)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub workflow_execution_id: Uuid,
    pub activity: Activity,
    pub status: ActivityStatus,
    pub attempt_number: i32,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persisted signal emitted by a workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: Uuid,
    pub workflow_execution_id: Uuid,
    pub signal_name: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Status carried by a progress signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Completed,
    Failed,
    Cancelled,
}

/// `{workflowExecutionId, stage, status, progress}` progress event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSignal {
    pub workflow_execution_id: Uuid,
    pub stage: Activity,
    pub status: ProgressStatus,
    /// Fraction of activities completed, in `[0, 1]`
    pub progress: f32,
}

impl ProgressSignal {
    pub const NAME: &'static str = "progress";
}

// ============================================================================
// Batch State Machine
// ============================================================================

/// Per-document state within a batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    Queued,
    Processing,
    Completed,
    Failed,
    Retry,
    Abandoned,
}

/// Events driving `BatchState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchEvent {
    Start,
    Complete,
    Fail,
    Retry,
    Abandon,
}

impl BatchEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail => "fail",
            Self::Retry => "retry",
            Self::Abandon => "abandon",
        }
    }
}

impl std::fmt::Display for BatchEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retry => "retry",
            Self::Abandoned => "abandoned",
        }
    }

    /// Next state for `event`, or `None` if the table has no entry
    pub fn next(&self, event: BatchEvent) -> Option<BatchState> {
        use BatchEvent as E;
        use BatchState as S;
        match (self, event) {
            (S::Queued, E::Start) => Some(S::Processing),
            (S::Processing, E::Complete) => Some(S::Completed),
            (S::Processing, E::Fail) => Some(S::Failed),
            (S::Failed, E::Retry) => Some(S::Retry),
            (S::Failed, E::Abandon) => Some(S::Abandoned),
            (S::Retry, E::Start) => Some(S::Processing),
            _ => None,
        }
    }

    /// Apply `event`, rejecting transitions outside the table
    pub fn apply(&self, event: BatchEvent) -> Result<BatchState> {
        self.next(event).ok_or_else(|| KexError::InvalidTransition {
            machine: "batch",
            from: self.to_string(),
            event: event.to_string(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned)
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchState {
    type Err = KexError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retry" => Ok(Self::Retry),
            "abandoned" => Ok(Self::Abandoned),
            _ => Err(KexError::Validation(format!("unknown batch state: {s}"))),
        }
    }
}

/// A batch run over many documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub ontology_id: String,
    pub ontology_hash: String,
    pub created_at: DateTime<Utc>,
}

/// One document within a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub document_id: Uuid,
    pub document_version_id: Uuid,
    pub workflow_execution_id: Option<Uuid>,
    pub state: BatchState,
    /// Number of times the item entered `processing`
    pub attempts: i32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Per-state item counts for a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub total: usize,
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub retry: usize,
    pub abandoned: usize,
}

impl BatchSummary {
    pub fn from_items(batch_id: Uuid, items: &[BatchItem]) -> Self {
        let mut summary = Self {
            batch_id,
            total: items.len(),
            ..Default::default()
        };
        for item in items {
            match item.state {
                BatchState::Queued => summary.queued += 1,
                BatchState::Processing => summary.processing += 1,
                BatchState::Completed => summary.completed += 1,
                BatchState::Failed => summary.failed += 1,
                BatchState::Retry => summary.retry += 1,
                BatchState::Abandoned => summary.abandoned += 1,
            }
        }
        summary
    }

    /// No item is queued, processing, or awaiting retry
    pub fn is_settled(&self) -> bool {
        self.queued == 0 && self.processing == 0 && self.retry == 0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_order() {
        assert_eq!(Activity::Chunk.sequence(), 1);
        assert_eq!(Activity::Index.sequence(), 8);
        assert_eq!(Activity::Chunk.next(), Some(Activity::Mentions));
        assert_eq!(Activity::Index.next(), None);
        assert_eq!(Activity::from_sequence(0), None);
        assert_eq!(Activity::from_sequence(4), Some(Activity::Relations));
        assert!(Activity::Mentions < Activity::Assemble);
    }

    #[test]
    fn test_remaining_after() {
        assert_eq!(Activity::remaining_after(None).len(), 8);
        assert_eq!(
            Activity::remaining_after(Some(Activity::Relations))[0],
            Activity::Ground
        );
        assert!(Activity::remaining_after(Some(Activity::Index)).is_empty());
    }

    #[test]
    fn test_activity_parse() {
        assert_eq!("assemble".parse::<Activity>().unwrap(), Activity::Assemble);
        assert!("merge".parse::<Activity>().is_err());
    }

    #[test]
    fn test_workflow_transitions() {
        use WorkflowStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Queued.can_transition_to(Completed));
        assert!(Completed.validate_transition(Failed).is_err());
    }

    #[test]
    fn test_batch_transition_table() {
        use BatchEvent as E;
        use BatchState as S;
        assert_eq!(S::Queued.apply(E::Start).unwrap(), S::Processing);
        assert_eq!(S::Processing.apply(E::Complete).unwrap(), S::Completed);
        assert_eq!(S::Processing.apply(E::Fail).unwrap(), S::Failed);
        assert_eq!(S::Failed.apply(E::Retry).unwrap(), S::Retry);
        assert_eq!(S::Failed.apply(E::Abandon).unwrap(), S::Abandoned);
        assert_eq!(S::Retry.apply(E::Start).unwrap(), S::Processing);
    }

    #[test]
    fn test_batch_rejects_unlisted_transitions() {
        use BatchEvent as E;
        use BatchState as S;
        assert!(S::Completed.apply(E::Retry).is_err());
        assert!(S::Processing.apply(E::Retry).is_err());
        assert!(S::Queued.apply(E::Complete).is_err());
        assert!(S::Abandoned.apply(E::Start).is_err());
        assert!(S::Retry.apply(E::Retry).is_err());
    }

    #[test]
    fn test_batch_summary() {
        let batch_id = Uuid::new_v4();
        let item = |state| BatchItem {
            id: Uuid::new_v4(),
            batch_id,
            document_id: Uuid::new_v4(),
            document_version_id: Uuid::new_v4(),
            workflow_execution_id: None,
            state,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        };
        let items = vec![
            item(BatchState::Completed),
            item(BatchState::Completed),
            item(BatchState::Failed),
        ];
        let summary = BatchSummary::from_items(batch_id, &items);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary.is_settled());
    }

    #[test]
    fn test_progress_signal_wire_format() {
        let signal = ProgressSignal {
            workflow_execution_id: Uuid::nil(),
            stage: Activity::Relations,
            status: ProgressStatus::Completed,
            progress: Activity::Relations.progress(),
        };
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["stage"], "relations");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["progress"], 0.5);
        assert!(json.get("workflowExecutionId").is_some());
    }
}
