use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{ItemId, NewsletterItem, RawEmail};

pub const TRUNCATION_MARKER: &str = "[Content truncated...]";

/// Roughly 3000 tokens of English text.
pub const DEFAULT_MAX_BODY_CHARS: usize = 12_000;

const HTML_WRAP_WIDTH: usize = 1_000;
const MAX_FOOTER_LINE_CHARS: usize = 500;

const HTML_MARKERS: &[&str] = &[
    "<html", "<body", "<div", "<p>", "<p ", "<table", "<a ", "<span", "<br",
];

const FOOTER_MARKERS: &[&str] = &[
    "unsubscribe",
    "view this email in your browser",
    "view in browser",
    "view in your browser",
    "manage your preferences",
    "manage preferences",
    "email preferences",
    "opt out",
    "opt-out",
    "update your subscription",
    "you're receiving this",
    "you are receiving this",
    "no longer wish to receive",
    "powered by mailchimp",
    "powered by substack",
    "powered by convertkit",
    "powered by beehiiv",
    "powered by buttondown",
];

/// A raw record that could not be turned into a newsletter item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("record {index}: missing sender")]
    MissingSender { index: usize },

    #[error("record {index}: missing body")]
    MissingBody { index: usize },

    #[error("record {index}: malformed: {reason}")]
    Malformed { index: usize, reason: String },
}

#[derive(Debug, Default)]
pub struct Normalized {
    pub items: Vec<NewsletterItem>,
    pub rejected: Vec<NormalizationError>,
    /// Records dropped because an earlier record had the same content hash.
    pub duplicates: usize,
}

pub struct Normalizer {
    max_body_chars: usize,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY_CHARS)
    }
}

impl Normalizer {
    pub fn new(max_body_chars: usize) -> Self {
        Self { max_body_chars }
    }

    /// Turns raw records into deduplicated newsletter items. Bad records are
    /// collected in `rejected`, never fatal.
    pub fn normalize(&self, records: Vec<RawEmail>) -> Normalized {
        self.normalize_loaded(records.into_iter().map(Ok))
    }

    /// Like [`Normalizer::normalize`], for records whose loading may already
    /// have failed. Failed records keep their position in the input.
    pub fn normalize_loaded<I>(&self, records: I) -> Normalized
    where
        I: IntoIterator<Item = Result<RawEmail, NormalizationError>>,
    {
        let mut normalized = Normalized::default();
        let mut seen = HashSet::new();

        for (index, record) in records.into_iter().enumerate() {
            let next_id = ItemId(normalized.items.len() as u32 + 1);
            match record.and_then(|record| self.normalize_record(index, record, next_id)) {
                Ok(item) => {
                    if seen.insert(item.content_hash.clone()) {
                        normalized.items.push(item);
                    } else {
                        debug!(index, hash = %item.content_hash, "Dropping duplicate newsletter");
                        normalized.duplicates += 1;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Skipping raw email");
                    normalized.rejected.push(e);
                }
            }
        }

        info!(
            items = normalized.items.len(),
            rejected = normalized.rejected.len(),
            duplicates = normalized.duplicates,
            "Normalized newsletters"
        );

        normalized
    }

    fn normalize_record(
        &self,
        index: usize,
        record: RawEmail,
        id: ItemId,
    ) -> Result<NewsletterItem, NormalizationError> {
        let mut sender = record
            .sender
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(NormalizationError::MissingSender { index })?;
        let mut sender_name = record
            .sender_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let raw_body = record.body.unwrap_or_default();
        let body = clean_body(&raw_body);
        if body.is_empty() {
            return Err(NormalizationError::MissingBody { index });
        }

        if let Some((name, email)) = forwarded_sender(&body) {
            debug!(index, from = %sender, to = %email, "Resolved forwarded newsletter");
            sender = email;
            sender_name = Some(name);
        }

        let subject = record
            .subject
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "(no subject)".to_string());

        let content_hash = content_hash(&subject, &body);
        let (body_text, truncated) = truncate_body(&body, self.max_body_chars);

        Ok(NewsletterItem {
            id,
            sender,
            sender_name,
            subject,
            received_at: record.received_at,
            body_text,
            content_hash,
            truncated,
        })
    }
}

/// Stable identity of a newsletter across runs.
///
/// SHA256 of the subject and body after lower-casing, dropping punctuation
/// and collapsing whitespace, so re-sent copies with cosmetic differences
/// hash the same.
pub fn content_hash(subject: &str, body: &str) -> String {
    let normalized = format!("{}\n{}", subject, body)
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Plain text of a body that may be HTML, without footer boilerplate.
pub fn clean_body(raw: &str) -> String {
    let text = if looks_like_html(raw) {
        html2text::from_read(raw.as_bytes(), HTML_WRAP_WIDTH)
    } else {
        raw.to_string()
    };

    collapse_blank_lines(&strip_footer_lines(&text))
}

fn looks_like_html(text: &str) -> bool {
    let lower = text.to_lowercase();
    HTML_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn strip_footer_lines(text: &str) -> String {
    text.lines()
        .filter(|line| {
            if line.len() > MAX_FOOTER_LINE_CHARS {
                return true;
            }
            let lower = line.to_lowercase();
            !FOOTER_MARKERS.iter().any(|marker| lower.contains(marker))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut previous_blank = false;
    for line in text.lines() {
        let line = line.trim_end();
        let blank = line.is_empty();
        if blank && previous_blank {
            continue;
        }
        out.push(line);
        previous_blank = blank;
    }
    out.join("\n").trim().to_string()
}

/// Keeps the head of an over-long body and marks the cut.
pub fn truncate_body(body: &str, max_chars: usize) -> (String, bool) {
    let end = match body.char_indices().nth(max_chars) {
        Some((end, _)) => end,
        None => return (body.to_string(), false),
    };

    (
        format!("{}\n\n{}", body[..end].trim_end(), TRUNCATION_MARKER),
        true,
    )
}

/// Original sender `(name, email)` of a forwarded newsletter.
///
/// Matches the `From:` header quoted in the forwarded body, e.g.
/// `From: **Dan Primack** <dan@axios.com>` or `From: Dan Primack <dan@axios.com>`.
pub fn forwarded_sender(body: &str) -> Option<(String, String)> {
    if !body.contains("Forwarded message") {
        return None;
    }

    body.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("From:")?;
        let open = rest.find('<')?;
        let close = rest[open..].find('>')? + open;
        let email = rest[open + 1..close].trim();
        let name = rest[..open].trim().trim_matches('*').trim();
        if name.is_empty() || !email.contains('@') {
            return None;
        }
        Some((name.to_string(), email.to_string()))
    })
}
