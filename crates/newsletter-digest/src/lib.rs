// Public modules
pub mod assembler;
pub mod clustering;
pub mod config;
pub mod io;
pub mod llm;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod render;
pub mod store;
pub mod summarizer;
pub mod testing;

// Re-export commonly used types
pub use assembler::{Assembled, DigestAssembler};
pub use clustering::{Clustering, ClusteringStatus, ThemeClusterer};
pub use config::Config;
pub use io::{get_default_digests_dir, load_raw_emails, save_digest_files, LoadedEmail};
pub use llm::{ClaudeClient, CompletionRequest, LanguageModel, ModelError, RetryPolicy};
pub use models::{
    Contradiction, Digest, DigestEntry, DigestItem, FailureReason, ItemFailure, ItemId,
    NewsletterItem, RawEmail, SourcePosition, Summary, ThemeGroup, TimeWindow, TopStory,
};
pub use normalizer::{NormalizationError, Normalizer};
pub use pipeline::{Pipeline, PipelineConfig, PipelineError, PipelineRun, RunReport};
pub use render::DigestRenderer;
pub use store::{DigestStore, MemoryDigestStore, SqliteDigestStore, StoredDigest, StoreError};
pub use summarizer::{SummaryBatch, Summarizer};
