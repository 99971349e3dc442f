use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::assembler::DigestAssembler;
use crate::clustering::{ClusteringStatus, ThemeClusterer, DEFAULT_CLUSTER_MAX_TOKENS};
use crate::io::LoadedEmail;
use crate::llm::{LanguageModel, ModelError, RetryPolicy};
use crate::models::{Digest, ItemFailure, RawEmail, TimeWindow};
use crate::normalizer::{NormalizationError, Normalizer, DEFAULT_MAX_BODY_CHARS};
use crate::store::{DigestStore, StoreError};
use crate::summarizer::{Summarizer, DEFAULT_CONCURRENCY, DEFAULT_SUMMARY_MAX_TOKENS};

/// Tunables of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Ceiling on concurrent summarization calls.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Summarization stops starting new work once this much time has passed,
    /// and clustering still in flight at that point is abandoned.
    pub run_timeout: Option<Duration>,
    pub max_body_chars: usize,
    pub summary_max_tokens: u32,
    pub cluster_max_tokens: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            run_timeout: Some(Duration::from_secs(600)),
            max_body_chars: DEFAULT_MAX_BODY_CHARS,
            summary_max_tokens: DEFAULT_SUMMARY_MAX_TOKENS,
            cluster_max_tokens: DEFAULT_CLUSTER_MAX_TOKENS,
        }
    }
}

/// A run that produced no digest.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no usable newsletters in input ({} record(s) rejected)", rejected.len())]
    NoInput { rejected: Vec<NormalizationError> },

    #[error("model service unusable: {0}")]
    Model(#[from] ModelError),

    #[error("digest store failed: {0}")]
    Store(#[from] StoreError),
}

/// Everything the run left out of the digest, and why.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub records: usize,
    pub items: usize,
    pub duplicates: usize,
    pub rejected: Vec<String>,
    pub failures: Vec<ItemFailure>,
    pub clustering: ClusteringStatus,
    /// Content already delivered for an overlapping window.
    pub excluded_hashes: BTreeSet<String>,
}

impl RunReport {
    /// True when something was dropped or clustering did not happen as asked.
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
            || !self.rejected.is_empty()
            || matches!(self.clustering, ClusteringStatus::Degraded { .. })
    }
}

#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub digest: Digest,
    pub report: RunReport,
}

pub struct Pipeline {
    config: PipelineConfig,
    model: Arc<dyn LanguageModel>,
    store: Arc<dyn DigestStore>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        model: Arc<dyn LanguageModel>,
        store: Arc<dyn DigestStore>,
    ) -> Self {
        Self {
            config,
            model,
            store,
        }
    }

    /// Normalizes, summarizes, clusters and assembles one digest.
    ///
    /// The digest is not saved; persisting it is up to the caller.
    pub async fn run_pipeline(
        &self,
        user_id: &str,
        window: TimeWindow,
        raw_records: Vec<RawEmail>,
    ) -> Result<PipelineRun, PipelineError> {
        self.run_loaded(user_id, window, raw_records.into_iter().map(Ok).collect())
            .await
    }

    /// Same as [`Pipeline::run_pipeline`] for records read by
    /// [`load_raw_emails`](crate::io::load_raw_emails). Records that failed
    /// to load are reported as rejected.
    pub async fn run_loaded(
        &self,
        user_id: &str,
        window: TimeWindow,
        loaded: Vec<LoadedEmail>,
    ) -> Result<PipelineRun, PipelineError> {
        let deadline = self.config.run_timeout.map(|timeout| Instant::now() + timeout);
        let records = loaded.len();

        info!(user_id, %window, records, "Starting digest run");

        let normalized = Normalizer::new(self.config.max_body_chars).normalize_loaded(loaded);
        if normalized.items.is_empty() {
            warn!(user_id, rejected = normalized.rejected.len(), "No usable newsletters");
            return Err(PipelineError::NoInput {
                rejected: normalized.rejected,
            });
        }

        let summarizer = Summarizer::new(
            self.model.clone(),
            self.config.concurrency,
            self.config.retry,
        )
        .with_max_tokens(self.config.summary_max_tokens);
        let batch = summarizer.summarize_all(&normalized.items, deadline).await?;

        let clusterer = ThemeClusterer::new(self.model.clone(), self.config.retry)
            .with_max_tokens(self.config.cluster_max_tokens);
        let clustering = clusterer
            .cluster_summaries(&batch.summaries, &normalized.items, deadline)
            .await;
        let clustering_status = clustering.status.clone();

        let assembler = DigestAssembler::new(self.store.clone());
        let assembled = assembler.assemble(
            user_id,
            &window,
            clustering,
            &batch.summaries,
            &normalized.items,
        )?;

        let report = RunReport {
            records,
            items: normalized.items.len(),
            duplicates: normalized.duplicates,
            rejected: normalized.rejected.iter().map(|e| e.to_string()).collect(),
            failures: batch.failures,
            clustering: clustering_status,
            excluded_hashes: assembled.excluded_hashes,
        };

        info!(
            user_id,
            themes = assembled.digest.theme_count(),
            items = assembled.digest.item_count(),
            failures = report.failures.len(),
            degraded = report.is_degraded(),
            "Digest run finished"
        );

        Ok(PipelineRun {
            digest: assembled.digest,
            report,
        })
    }
}
