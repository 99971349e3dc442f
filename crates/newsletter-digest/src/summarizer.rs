use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::llm::{extract_json, CompletionRequest, LanguageModel, ModelError, RetryError, RetryPolicy};
use crate::models::{FailureReason, ItemFailure, ItemId, NewsletterItem, NotableLink, Summary};

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_SUMMARY_MAX_TOKENS: u32 = 1024;

const MAX_NOTABLE_LINKS: usize = 3;
const DEFAULT_IMPORTANCE: u8 = 5;

/// Partitioned outcome of summarizing a batch.
#[derive(Debug, Default)]
pub struct SummaryBatch {
    pub summaries: Vec<Summary>,
    pub failures: Vec<ItemFailure>,
}

/// Why a reply could not be turned into a [`Summary`].
#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("reply was empty")]
    Empty,

    #[error("no JSON object in reply")]
    NoJson,

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("\"gist\" is missing or empty")]
    MissingGist,

    #[error("\"takeaways\" is missing or empty")]
    MissingTakeaways,
}

#[derive(Deserialize)]
struct SummaryReply {
    #[serde(default)]
    gist: String,
    #[serde(default)]
    takeaways: Vec<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    importance: Option<i64>,
    #[serde(default)]
    notable_links: Vec<NotableLink>,
}

enum ItemError {
    Failed(FailureReason),
    Fatal(ModelError),
}

pub struct Summarizer {
    model: Arc<dyn LanguageModel>,
    concurrency: usize,
    retry: RetryPolicy,
    max_tokens: u32,
}

impl Summarizer {
    pub fn new(model: Arc<dyn LanguageModel>, concurrency: usize, retry: RetryPolicy) -> Self {
        Self {
            model,
            concurrency: concurrency.max(1),
            retry,
            max_tokens: DEFAULT_SUMMARY_MAX_TOKENS,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Summarizes every item with at most `concurrency` calls in flight.
    ///
    /// Items that fail are reported in `failures`. A fatal model error
    /// (bad credentials, unknown model) stops the batch and is returned as
    /// the error; calls still in flight are dropped. Once `deadline` passes,
    /// unfinished items fail with [`FailureReason::DeadlineExceeded`].
    pub async fn summarize_all(
        &self,
        items: &[NewsletterItem],
        deadline: Option<Instant>,
    ) -> Result<SummaryBatch, ModelError> {
        let mut outcomes = stream::iter(items)
            .map(|item| async move {
                let outcome = match deadline {
                    Some(deadline) if Instant::now() >= deadline => {
                        Err(ItemError::Failed(FailureReason::DeadlineExceeded))
                    }
                    Some(deadline) => {
                        match tokio::time::timeout_at(deadline, self.summarize_item(item)).await {
                            Ok(outcome) => outcome,
                            Err(_) => Err(ItemError::Failed(FailureReason::DeadlineExceeded)),
                        }
                    }
                    None => self.summarize_item(item).await,
                };
                (item, outcome)
            })
            .buffer_unordered(self.concurrency);

        let mut batch = SummaryBatch::default();
        while let Some((item, outcome)) = outcomes.next().await {
            match outcome {
                Ok(summary) => {
                    debug!(item_id = %item.id, gist = %summary.gist, "Summarized newsletter");
                    batch.summaries.push(summary);
                }
                Err(ItemError::Failed(reason)) => {
                    warn!(item_id = %item.id, subject = %item.subject, %reason, "Failed to summarize newsletter");
                    batch.failures.push(ItemFailure {
                        item_id: item.id,
                        content_hash: item.content_hash.clone(),
                        reason,
                    });
                }
                Err(ItemError::Fatal(e)) => {
                    error!(item_id = %item.id, error = %e, "Model service unusable, aborting run");
                    return Err(e);
                }
            }
        }

        batch.summaries.sort_by_key(|s| s.item_id);
        batch.failures.sort_by_key(|f| f.item_id);

        info!(
            summarized = batch.summaries.len(),
            failed = batch.failures.len(),
            "Summarization finished"
        );

        Ok(batch)
    }

    async fn summarize_item(&self, item: &NewsletterItem) -> Result<Summary, ItemError> {
        let prompt = summary_prompt(item);
        let reply = self.request(prompt.clone()).await?;

        match parse_summary(item.id, &reply) {
            Ok(summary) => Ok(summary),
            Err(problem) => {
                debug!(item_id = %item.id, %problem, "Unusable summary reply, asking again");
                let corrected = format!("{}\n\n{}", prompt, correction_note(&problem));
                let reply = self.request(corrected).await?;
                parse_summary(item.id, &reply).map_err(|problem| {
                    ItemError::Failed(FailureReason::Unparseable {
                        message: problem.to_string(),
                    })
                })
            }
        }
    }

    async fn request(&self, prompt: String) -> Result<String, ItemError> {
        let request = CompletionRequest {
            prompt,
            max_tokens: self.max_tokens,
        };

        match self.retry.run(|| self.model.complete(&request)).await {
            Ok(reply) => Ok(reply),
            // Goes through parsing like any other unusable reply.
            Err(RetryError {
                source: ModelError::EmptyResponse,
                ..
            }) => Ok(String::new()),
            Err(RetryError { attempts, source }) => Err(if source.is_fatal() {
                ItemError::Fatal(source)
            } else if source.is_transient() {
                ItemError::Failed(FailureReason::Transient {
                    attempts,
                    message: source.to_string(),
                })
            } else {
                ItemError::Failed(FailureReason::Rejected {
                    message: source.to_string(),
                })
            }),
        }
    }
}

fn summary_prompt(item: &NewsletterItem) -> String {
    let sender = match &item.sender_name {
        Some(name) => format!("{} <{}>", name, item.sender),
        None => item.sender.clone(),
    };

    format!(
        r#"You are a smart, well-read friend helping someone catch up on their newsletters. Summarize the newsletter below in a warm, conversational way - not like a news wire.

<newsletter>
From: {}
Subject: {}
Date: {}

{}
</newsletter>

RULES:
1. "gist": a single conversational sentence capturing the main point
2. "takeaways": 3 to 5 punchy takeaways, each 1-2 sentences, most important first
3. "topics": 2 to 4 short topic tags
4. "context": 1-2 sentences of background on why this matters, or null
5. "importance": integer from 1 to 10 for timeliness, significance and uniqueness
6. "notable_links": at most 3 genuinely valuable "read more" links from the newsletter, as {{"url": ..., "description": ...}}; skip homepage and unsubscribe links
7. Use ONLY the newsletter content - no outside knowledge

Respond ONLY with a JSON object:
{{
  "gist": "...",
  "takeaways": ["...", "..."],
  "topics": ["...", "..."],
  "context": "...",
  "importance": 5,
  "notable_links": [{{"url": "https://...", "description": "..."}}]
}}"#,
        sender,
        item.subject,
        item.received_at.format("%Y-%m-%d %H:%M UTC"),
        item.body_text
    )
}

fn correction_note(problem: &ReplyError) -> String {
    format!(
        "IMPORTANT: your previous reply could not be used ({}). Reply again with ONLY the JSON object described above, with a non-empty \"gist\" and at least one entry in \"takeaways\".",
        problem
    )
}

/// Parses a model reply into a summary of item `item_id`.
pub fn parse_summary(item_id: ItemId, reply: &str) -> Result<Summary, ReplyError> {
    if reply.trim().is_empty() {
        return Err(ReplyError::Empty);
    }
    let json = extract_json(reply).ok_or(ReplyError::NoJson)?;
    let parsed: SummaryReply = serde_json::from_str(json)?;

    let gist = parsed.gist.trim().to_string();
    if gist.is_empty() {
        return Err(ReplyError::MissingGist);
    }

    let takeaways: Vec<String> = parsed
        .takeaways
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if takeaways.is_empty() {
        return Err(ReplyError::MissingTakeaways);
    }

    let topics: BTreeSet<String> = parsed
        .topics
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    let notable_links = parsed
        .notable_links
        .into_iter()
        .filter(|link| !link.url.trim().is_empty())
        .take(MAX_NOTABLE_LINKS)
        .collect();

    Ok(Summary {
        item_id,
        gist,
        takeaways,
        topics,
        context: parsed
            .context
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty()),
        importance: parsed
            .importance
            .map(|score| score.clamp(1, 10) as u8)
            .unwrap_or(DEFAULT_IMPORTANCE),
        notable_links,
    })
}
