//! Ontology cache
//!
//! Parsed contexts are keyed by the SHA-256 of their source text. A hit
//! returns the same `Arc`, so every stage in a run sees one structure, and
//! concurrent loads of the same content parse it once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moka::future::Cache;
use tracing::debug;

use kex_core::{content_hash, KexError, Result};

use crate::OntologyContext;

/// Cache of parsed ontologies keyed by content hash
#[derive(Clone)]
pub struct OntologyCache {
    cache: Cache<String, Arc<OntologyContext>>,
    loads: Arc<AtomicU64>,
}

impl OntologyCache {
    /// Create a cache holding at most `max_capacity` ontologies
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(max_capacity).build(),
            loads: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Return the context for `source`, parsing it only on a miss
    pub async fn get_or_load(&self, source: &str) -> Result<Arc<OntologyContext>> {
        let key = content_hash(source);
        let loads = Arc::clone(&self.loads);
        self.cache
            .try_get_with(key.clone(), async move {
                loads.fetch_add(1, Ordering::Relaxed);
                debug!(hash = %key, "Parsing ontology");
                OntologyContext::load(source).map(Arc::new)
            })
            .await
            .map_err(|e: Arc<KexError>| match e.as_ref() {
                KexError::OntologyParse { fragment, message } => KexError::OntologyParse {
                    fragment: fragment.clone(),
                    message: message.clone(),
                },
                other => KexError::Validation(other.to_string()),
            })
    }

    /// Look up an already-parsed ontology by content hash
    pub async fn get(&self, hash: &str) -> Option<Arc<OntologyContext>> {
        self.cache.get(hash).await
    }

    /// Number of times a source was actually parsed
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}

impl Default for OntologyCache {
    fn default() -> Self {
        Self::new(64)
    }
}
