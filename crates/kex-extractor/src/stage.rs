//! Extraction stage abstraction and per-chunk batch execution
//!
//! A stage turns one chunk's input into one chunk's output. Chunks are
//! independent, so a batch runs them concurrently with a bounded window;
//! one chunk's failure is recorded without discarding the others.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use kex_core::{Chunk, Entity, ExtractionScope, KexError, Mention, Relation, Result};
use kex_ontology::OntologyContext;
use tracing::{debug, warn};

use crate::retry::{Exhausted, RetryPolicy};

pub const MENTIONS: &str = "mentions";
pub const ENTITIES: &str = "entities";
pub const RELATIONS: &str = "relations";

// ============================================================================
// Inputs
// ============================================================================

/// Stage input tied to one chunk of one extraction
pub trait ChunkScoped {
    fn scope(&self) -> &ExtractionScope;
    fn chunk(&self) -> &Chunk;
}

#[derive(Debug, Clone)]
pub struct MentionInput {
    pub scope: Arc<ExtractionScope>,
    pub chunk: Chunk,
}

#[derive(Debug, Clone)]
pub struct EntityInput {
    pub scope: Arc<ExtractionScope>,
    pub chunk: Chunk,
    pub mentions: Vec<Mention>,
}

#[derive(Debug, Clone)]
pub struct RelationInput {
    pub scope: Arc<ExtractionScope>,
    pub chunk: Chunk,
    pub entities: Vec<Entity>,
    /// Mentions backing `entities`, for span lookup
    pub mentions: Vec<Mention>,
}

macro_rules! chunk_scoped {
    ($($ty:ty),*) => {
        $(impl ChunkScoped for $ty {
            fn scope(&self) -> &ExtractionScope {
                &self.scope
            }

            fn chunk(&self) -> &Chunk {
                &self.chunk
            }
        })*
    };
}

chunk_scoped!(MentionInput, EntityInput, RelationInput);

// ============================================================================
// Stage trait
// ============================================================================

/// One ontology-constrained extraction step over a single chunk
#[async_trait]
pub trait ExtractionStage: Send + Sync {
    type Input: ChunkScoped + Send + Sync;
    type Output: Send;

    /// Stage name, used in errors and logs
    fn name(&self) -> &'static str;

    async fn extract(&self, input: &Self::Input, ontology: &OntologyContext)
        -> Result<Self::Output>;
}

pub type MentionStage = dyn ExtractionStage<Input = MentionInput, Output = Vec<Mention>>;
pub type EntityStage = dyn ExtractionStage<Input = EntityInput, Output = Vec<Entity>>;
pub type RelationStage = dyn ExtractionStage<Input = RelationInput, Output = Vec<Relation>>;

// ============================================================================
// Batch execution
// ============================================================================

/// Concurrency and retry settings for [`extract_batch`]
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            retry: RetryPolicy::default(),
        }
    }
}

/// A chunk whose stage call failed after retries
#[derive(Debug)]
pub struct ChunkFailure {
    pub stage: &'static str,
    pub chunk_index: usize,
    pub attempts: u32,
    pub error: KexError,
}

/// Results of one stage across many chunks
#[derive(Debug)]
pub struct BatchOutcome<O> {
    /// Successful outputs, ordered by chunk index
    pub outputs: Vec<(usize, O)>,
    pub failures: Vec<ChunkFailure>,
}

impl<O> BatchOutcome<O> {
    /// Every chunk failed (and there was at least one)
    pub fn all_failed(&self) -> bool {
        self.outputs.is_empty() && !self.failures.is_empty()
    }

    /// Outputs, or an error when no chunk succeeded
    pub fn into_outputs(self) -> Result<Vec<(usize, O)>> {
        if self.all_failed() {
            let first = &self.failures[0];
            return Err(KexError::StageExtraction {
                stage: first.stage.to_string(),
                chunk_index: first.chunk_index,
                message: format!(
                    "all {} chunk(s) failed; first error: {}",
                    self.failures.len(),
                    first.error
                ),
            });
        }
        Ok(self.outputs)
    }
}

/// Run `stage` over every input with bounded concurrency
///
/// Each chunk is retried independently according to `options.retry`.
pub async fn extract_batch<S>(
    stage: &S,
    inputs: &[S::Input],
    ontology: &OntologyContext,
    options: &BatchOptions,
) -> BatchOutcome<S::Output>
where
    S: ExtractionStage + ?Sized,
{
    let name = stage.name();
    // Boxed up front so the stream does not borrow through a higher-ranked
    // closure, which keeps the caller's future `Send`.
    let calls: Vec<BoxFuture<'_, (usize, std::result::Result<S::Output, Exhausted>)>> = inputs
        .iter()
        .map(|input| {
            async move {
                let chunk_index = input.chunk().chunk_index;
                let result = options
                    .retry
                    .retry(name, || stage.extract(input, ontology))
                    .await;
                (chunk_index, result)
            }
            .boxed()
        })
        .collect();
    let results: Vec<_> = stream::iter(calls)
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;

    let mut outcome = BatchOutcome {
        outputs: Vec::new(),
        failures: Vec::new(),
    };
    for (chunk_index, result) in results {
        match result {
            Ok(output) => outcome.outputs.push((chunk_index, output)),
            Err(exhausted) => {
                warn!(
                    stage = name,
                    chunk_index,
                    attempts = exhausted.attempts,
                    error = %exhausted.error,
                    "Chunk extraction failed"
                );
                outcome.failures.push(ChunkFailure {
                    stage: name,
                    chunk_index,
                    attempts: exhausted.attempts,
                    error: exhausted.error,
                });
            }
        }
    }
    outcome.outputs.sort_by_key(|(i, _)| *i);
    outcome.failures.sort_by_key(|f| f.chunk_index);

    debug!(
        stage = name,
        succeeded = outcome.outputs.len(),
        failed = outcome.failures.len(),
        "Stage batch finished"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use kex_core::KexError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    const ONTOLOGY: &str = "@prefix ex: <http://example.org/> .\n\
        @prefix owl: <http://www.w3.org/2002/07/owl#> .\n\
        ex:Person a owl:Class .\n";

    struct Echo {
        fail_chunks: Vec<usize>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ExtractionStage for Echo {
        type Input = MentionInput;
        type Output = usize;

        fn name(&self) -> &'static str {
            MENTIONS
        }

        async fn extract(&self, input: &MentionInput, _ontology: &OntologyContext) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_chunks.contains(&input.chunk.chunk_index) {
                return Err(KexError::Llm("boom".into()));
            }
            Ok(input.chunk.text.len())
        }
    }

    fn inputs(n: usize) -> Vec<MentionInput> {
        let scope = Arc::new(ExtractionScope {
            organization_id: Uuid::nil(),
            document_id: Uuid::nil(),
            document_version_id: Uuid::nil(),
            ontology_hash: "h".into(),
            extraction_id: Uuid::nil(),
        });
        (0..n)
            .map(|i| MentionInput {
                scope: Arc::clone(&scope),
                chunk: Chunk {
                    text: "x".repeat(i + 1),
                    start_offset: i * 10,
                    chunk_index: i,
                },
            })
            .collect()
    }

    fn options() -> BatchOptions {
        BatchOptions {
            concurrency: 3,
            retry: RetryPolicy::new(2, 1, 1),
        }
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_batch_future_can_be_spawned() {
        let ontology = Arc::new(OntologyContext::load(ONTOLOGY).unwrap());
        let stage = Arc::new(Echo {
            fail_chunks: vec![],
            calls: AtomicU32::new(0),
        });
        let none: Vec<MentionInput> = Vec::new();
        let settings = options();
        let pending = extract_batch(stage.as_ref(), &none, &ontology, &settings);
        assert_send(&pending);
        drop(pending);

        let handle = tokio::spawn(async move {
            let outcome = extract_batch(stage.as_ref(), &inputs(2), &ontology, &options()).await;
            outcome.outputs.len()
        });
        assert_eq!(handle.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_batch_outputs_are_ordered() {
        let ontology = OntologyContext::load(ONTOLOGY).unwrap();
        let stage = Echo {
            fail_chunks: vec![],
            calls: AtomicU32::new(0),
        };
        let outcome = extract_batch(&stage, &inputs(6), &ontology, &options()).await;
        let lens: Vec<usize> = outcome.outputs.iter().map(|(_, n)| *n).collect();
        assert_eq!(lens, vec![1, 2, 3, 4, 5, 6]);
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn test_chunk_failure_is_isolated() {
        let ontology = OntologyContext::load(ONTOLOGY).unwrap();
        let stage = Echo {
            fail_chunks: vec![1],
            calls: AtomicU32::new(0),
        };
        let outcome = extract_batch(&stage, &inputs(3), &ontology, &options()).await;
        assert_eq!(outcome.outputs.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].chunk_index, 1);
        assert_eq!(outcome.failures[0].attempts, 2);
        // 2 successes + 2 attempts for the failing chunk
        assert_eq!(stage.calls.load(Ordering::SeqCst), 4);
        assert!(outcome.into_outputs().is_ok());
    }

    #[tokio::test]
    async fn test_all_chunks_failing_is_an_error() {
        let ontology = OntologyContext::load(ONTOLOGY).unwrap();
        let stage = Echo {
            fail_chunks: vec![0, 1],
            calls: AtomicU32::new(0),
        };
        let outcome = extract_batch(&stage, &inputs(2), &ontology, &options()).await;
        assert!(outcome.all_failed());
        let err = outcome.into_outputs().unwrap_err();
        assert!(matches!(err, KexError::StageExtraction { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_a_failure() {
        let ontology = OntologyContext::load(ONTOLOGY).unwrap();
        let stage = Echo {
            fail_chunks: vec![],
            calls: AtomicU32::new(0),
        };
        let outcome = extract_batch(&stage, &[], &ontology, &options()).await;
        assert!(!outcome.all_failed());
        assert!(outcome.into_outputs().unwrap().is_empty());
    }
}
