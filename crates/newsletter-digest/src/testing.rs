//! Testing utilities: a scripted language model and reply builders.
//!
//! Useful for exercising the pipeline without calling a live model.

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::llm::{CompletionRequest, LanguageModel, ModelError};

type Responder = dyn Fn(&str) -> Result<String, ModelError> + Send + Sync;

/// A language model whose replies come from a closure over the prompt.
///
/// Every prompt is recorded so tests can assert on what was asked and how
/// often.
pub struct ScriptedModel {
    responder: Box<Responder>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedModel {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Result<String, ModelError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Prompts received so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.recorded().clone()
    }

    pub fn call_count(&self) -> usize {
        self.recorded().len()
    }

    // A poisoned lock still holds a valid list of prompts.
    fn recorded(&self) -> MutexGuard<'_, Vec<String>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelError> {
        self.recorded().push(request.prompt.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(&request.prompt)
    }
}

/// True for prompts built by the theme clusterer.
pub fn is_cluster_prompt(prompt: &str) -> bool {
    prompt.contains("<summaries>")
}

/// A well-formed summarization reply.
pub fn summary_reply(gist: &str, takeaways: &[&str], topics: &[&str]) -> String {
    json!({
        "gist": gist,
        "takeaways": takeaways,
        "topics": topics,
        "context": null,
        "importance": 5,
        "notable_links": []
    })
    .to_string()
}

/// A well-formed clustering reply; each theme is `(title, item ids)`.
pub fn cluster_reply(themes: &[(&str, &[u32])]) -> String {
    let themes: Vec<_> = themes
        .iter()
        .map(|(title, ids)| {
            json!({
                "title": title,
                "item_ids": ids,
                "rationale": format!("Several newsletters covered {}", title)
            })
        })
        .collect();
    json!({ "intro": "Here is what your newsletters talked about.", "themes": themes }).to_string()
}
