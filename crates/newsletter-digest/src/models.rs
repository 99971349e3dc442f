use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Run-local identifier of a newsletter item, assigned in normalized order starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u32);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An email as handed over by the email source. Every field except the
/// timestamp is optional here; the normalizer decides what is usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEmail {
    pub message_id: Option<String>,
    #[serde(alias = "sender_email")]
    pub sender: Option<String>,
    pub sender_name: Option<String>,
    pub subject: Option<String>,
    pub received_at: DateTime<Utc>,
    #[serde(alias = "html_body", alias = "plain_body")]
    pub body: Option<String>,
}

impl RawEmail {
    pub fn new(
        sender: impl Into<String>,
        subject: impl Into<String>,
        received_at: DateTime<Utc>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            message_id: None,
            sender: Some(sender.into()),
            sender_name: None,
            subject: Some(subject.into()),
            received_at,
            body: Some(body.into()),
        }
    }
}

/// Lookback window of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `hours` hours leading up to `end`.
    pub fn last_hours(end: DateTime<Utc>, hours: i64) -> Self {
        Self {
            start: end - Duration::hours(hours),
            end,
        }
    }

    /// Windows that merely touch at an endpoint do not overlap.
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} .. {}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// A normalized newsletter, immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsletterItem {
    pub id: ItemId,
    pub sender: String,
    pub sender_name: Option<String>,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub body_text: String,
    pub content_hash: String,
    pub truncated: bool,
}

impl NewsletterItem {
    /// Display name of the sender, falling back to the address.
    pub fn sender_label(&self) -> &str {
        self.sender_name.as_deref().unwrap_or(&self.sender)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotableLink {
    pub url: String,
    #[serde(default)]
    pub description: String,
}

/// Structured summary of one newsletter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub item_id: ItemId,
    pub gist: String,
    pub takeaways: Vec<String>,
    pub topics: BTreeSet<String>,
    pub context: Option<String>,
    pub importance: u8,
    pub notable_links: Vec<NotableLink>,
}

/// Items covering the same underlying story. Always has at least two members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeGroup {
    pub theme_id: String,
    pub title: String,
    pub member_item_ids: BTreeSet<ItemId>,
    pub rationale: String,
    /// A short narrative across the members' coverage. May be empty.
    #[serde(default)]
    pub synthesis: String,
    /// 1..=10, when the model rated the theme.
    #[serde(default)]
    pub importance: Option<u8>,
}

/// The story the digest leads with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopStory {
    #[serde(alias = "name")]
    pub title: String,
    pub why: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

/// One source's take on a contested topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    pub source: String,
    pub position: String,
}

/// Newsletters that disagree about the same topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contradiction {
    pub topic: String,
    pub positions: Vec<SourcePosition>,
}

/// A summarized item as it appears in a digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestItem {
    pub item_id: ItemId,
    pub sender: String,
    pub sender_name: Option<String>,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub content_hash: String,
    pub summary: Summary,
}

impl DigestItem {
    pub fn new(item: &NewsletterItem, summary: Summary) -> Self {
        Self {
            item_id: item.id,
            sender: item.sender.clone(),
            sender_name: item.sender_name.clone(),
            subject: item.subject.clone(),
            received_at: item.received_at,
            content_hash: item.content_hash.clone(),
            summary,
        }
    }

    pub fn sender_label(&self) -> &str {
        self.sender_name.as_deref().unwrap_or(&self.sender)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DigestEntry {
    Theme {
        theme: ThemeGroup,
        members: Vec<DigestItem>,
    },
    Standalone {
        item: DigestItem,
    },
}

impl DigestEntry {
    pub fn items(&self) -> Vec<&DigestItem> {
        match self {
            DigestEntry::Theme { members, .. } => members.iter().collect(),
            DigestEntry::Standalone { item } => vec![item],
        }
    }

    pub fn item_ids(&self) -> Vec<ItemId> {
        self.items().into_iter().map(|item| item.item_id).collect()
    }

    pub fn is_theme(&self) -> bool {
        matches!(self, DigestEntry::Theme { .. })
    }
}

/// The assembled result of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub user_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub intro: Option<String>,
    #[serde(default)]
    pub top_story: Option<TopStory>,
    pub entries: Vec<DigestEntry>,
    #[serde(default)]
    pub contradictions: Vec<Contradiction>,
    pub generated_at: DateTime<Utc>,
}

impl Digest {
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.window_start, self.window_end)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn theme_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_theme()).count()
    }

    pub fn item_count(&self) -> usize {
        self.entries.iter().map(|entry| entry.items().len()).sum()
    }

    /// Content hashes of every item the digest delivers.
    pub fn content_hashes(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|entry| entry.items())
            .map(|item| item.content_hash.clone())
            .collect()
    }
}

/// Why an item did not make it into the summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Transient errors persisted through every allowed attempt.
    Transient { attempts: u32, message: String },
    /// The model service refused the request outright.
    Rejected { message: String },
    /// The reply could not be parsed, even after a corrective retry.
    Unparseable { message: String },
    DeadlineExceeded,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Transient { attempts, message } => {
                write!(f, "gave up after {} attempt(s): {}", attempts, message)
            }
            FailureReason::Rejected { message } => write!(f, "rejected: {}", message),
            FailureReason::Unparseable { message } => write!(f, "unparseable reply: {}", message),
            FailureReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub item_id: ItemId,
    pub content_hash: String,
    pub reason: FailureReason,
}
