//! Scripted LLM for tests and offline demos
//!
//! Responses are keyed by the request's schema name (`mentions`,
//! `entities`, `relations`). Every request is recorded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kex_core::{KexError, LlmClient, Result, StructuredRequest};
use serde_json::Value;

type Handler = Arc<dyn Fn(&StructuredRequest) -> Result<Value> + Send + Sync>;

#[derive(Default)]
struct Script {
    handlers: HashMap<String, Handler>,
    failures: HashMap<String, u32>,
    requests: Vec<StructuredRequest>,
}

/// [`LlmClient`] that answers from a script
#[derive(Default)]
pub struct ScriptedLlm {
    script: Mutex<Script>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `schema_name` requests with `value`
    pub fn respond(self, schema_name: &str, value: Value) -> Self {
        self.respond_with(schema_name, move |_| Ok(value.clone()))
    }

    /// Answer `schema_name` requests by calling `handler`
    pub fn respond_with<F>(self, schema_name: &str, handler: F) -> Self
    where
        F: Fn(&StructuredRequest) -> Result<Value> + Send + Sync + 'static,
    {
        self.lock()
            .handlers
            .insert(schema_name.to_string(), Arc::new(handler));
        self
    }

    /// Fail the next `times` requests for `schema_name` with a transient error
    pub fn fail_next(&self, schema_name: &str, times: u32) {
        *self
            .lock()
            .failures
            .entry(schema_name.to_string())
            .or_default() += times;
    }

    pub fn requests(&self) -> Vec<StructuredRequest> {
        self.lock().requests.clone()
    }

    /// Number of requests received for `schema_name`
    pub fn calls(&self, schema_name: &str) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.schema_name == schema_name)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        // A panicking handler poisons the lock; the script itself stays usable.
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn generate_object(&self, request: &StructuredRequest) -> Result<Value> {
        let handler = {
            let mut script = self.lock();
            script.requests.push(request.clone());
            if let Some(remaining) = script.failures.get_mut(&request.schema_name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(KexError::Llm(format!(
                        "scripted failure for {}",
                        request.schema_name
                    )));
                }
            }
            script.handlers.get(&request.schema_name).cloned()
        };
        match handler {
            Some(handler) => handler(request),
            None => Err(KexError::Llm(format!(
                "no scripted response for {}",
                request.schema_name
            ))),
        }
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}
