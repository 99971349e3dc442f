use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::llm::{extract_json, CompletionRequest, LanguageModel, RetryPolicy};
use crate::models::{
    Contradiction, ItemId, NewsletterItem, SourcePosition, Summary, ThemeGroup, TopStory,
};

pub const DEFAULT_CLUSTER_MAX_TOKENS: u32 = 2048;

const UNTITLED_THEME: &str = "Related coverage";

pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClusteringStatus {
    Clustered { themes: usize },
    /// Fewer than two summaries, nothing to compare.
    Skipped,
    /// The clustering call failed; every summary is standalone.
    Degraded { reason: String },
}

#[derive(Debug, Clone)]
pub struct Clustering {
    pub themes: Vec<ThemeGroup>,
    pub standalone: Vec<Summary>,
    pub intro: Option<String>,
    pub top_story: Option<TopStory>,
    pub contradictions: Vec<Contradiction>,
    pub status: ClusteringStatus,
}

impl Clustering {
    fn all_standalone(summaries: &[Summary], status: ClusteringStatus) -> Self {
        Self {
            themes: Vec::new(),
            standalone: summaries.to_vec(),
            intro: None,
            top_story: None,
            contradictions: Vec::new(),
            status,
        }
    }
}

/// A theme as proposed by the model, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct ProposedTheme {
    #[serde(default, alias = "name")]
    pub title: String,
    #[serde(default, alias = "article_indices", alias = "items")]
    pub item_ids: Vec<Value>,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub synthesis: String,
    #[serde(default)]
    pub importance: Option<Value>,
}

/// Only `themes` is required. The other parts are kept when they parse and
/// dropped on their own when they don't.
#[derive(Deserialize)]
struct ClusterReply {
    #[serde(default)]
    intro: Option<String>,
    themes: Vec<ProposedTheme>,
    #[serde(default)]
    top_story: Option<Value>,
    #[serde(default)]
    contradictions: Option<Value>,
}

#[derive(Serialize)]
struct ClusterInput<'a> {
    id: ItemId,
    sender: &'a str,
    subject: &'a str,
    gist: &'a str,
    topics: &'a BTreeSet<String>,
}

pub struct ThemeClusterer {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    max_tokens: u32,
}

impl ThemeClusterer {
    pub fn new(model: Arc<dyn LanguageModel>, retry: RetryPolicy) -> Self {
        Self {
            model,
            retry,
            max_tokens: DEFAULT_CLUSTER_MAX_TOKENS,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Groups the run's summaries into themes with one model call.
    ///
    /// Never fails: if the call or its reply is unusable, or `deadline`
    /// passes first, every summary is returned as standalone and the status
    /// says why.
    pub async fn cluster_summaries(
        &self,
        summaries: &[Summary],
        items: &[NewsletterItem],
        deadline: Option<Instant>,
    ) -> Clustering {
        if summaries.len() < 2 {
            debug!(summaries = summaries.len(), "Too few summaries to cluster");
            return Clustering::all_standalone(summaries, ClusteringStatus::Skipped);
        }

        let proposed = match deadline {
            Some(deadline) if Instant::now() >= deadline => Err(DEADLINE_EXCEEDED.to_string()),
            Some(deadline) => tokio::time::timeout_at(deadline, self.propose(summaries, items))
                .await
                .unwrap_or_else(|_| Err(DEADLINE_EXCEEDED.to_string())),
            None => self.propose(summaries, items).await,
        };

        let reply = match proposed {
            Ok(reply) => reply,
            Err(reason) => {
                warn!(%reason, "Clustering failed, keeping every newsletter standalone");
                return Clustering::all_standalone(summaries, ClusteringStatus::Degraded { reason });
            }
        };

        let known: HashSet<ItemId> = summaries.iter().map(|s| s.item_id).collect();
        let themes = resolve_themes(reply.themes, &known);

        let claimed: HashSet<ItemId> = themes
            .iter()
            .flat_map(|theme| theme.member_item_ids.iter().copied())
            .collect();
        let standalone: Vec<Summary> = summaries
            .iter()
            .filter(|s| !claimed.contains(&s.item_id))
            .cloned()
            .collect();

        info!(
            themes = themes.len(),
            standalone = standalone.len(),
            "Clustered newsletters"
        );

        Clustering {
            status: ClusteringStatus::Clustered {
                themes: themes.len(),
            },
            themes,
            standalone,
            intro: reply
                .intro
                .map(|intro| intro.trim().to_string())
                .filter(|intro| !intro.is_empty()),
            top_story: reply.top_story.and_then(parse_top_story),
            contradictions: reply
                .contradictions
                .map(parse_contradictions)
                .unwrap_or_default(),
        }
    }

    async fn propose(
        &self,
        summaries: &[Summary],
        items: &[NewsletterItem],
    ) -> Result<ClusterReply, String> {
        let by_id: HashMap<ItemId, &NewsletterItem> =
            items.iter().map(|item| (item.id, item)).collect();

        let inputs: Vec<ClusterInput> = summaries
            .iter()
            .map(|summary| {
                let item = by_id.get(&summary.item_id);
                ClusterInput {
                    id: summary.item_id,
                    sender: item.map(|i| i.sender_label()).unwrap_or(""),
                    subject: item.map(|i| i.subject.as_str()).unwrap_or(""),
                    gist: &summary.gist,
                    topics: &summary.topics,
                }
            })
            .collect();

        let summaries_json = serde_json::to_string_pretty(&inputs)
            .map_err(|e| format!("failed to encode summaries: {}", e))?;

        let request = CompletionRequest {
            prompt: cluster_prompt(&summaries_json),
            max_tokens: self.max_tokens,
        };

        let response_text = self
            .retry
            .run(|| self.model.complete(&request))
            .await
            .map_err(|e| e.to_string())?;

        let json_text = extract_json(&response_text)
            .ok_or_else(|| "no JSON object in clustering reply".to_string())?;

        serde_json::from_str(json_text)
            .map_err(|e| format!("failed to parse clustering JSON response: {}", e))
    }
}

fn cluster_prompt(summaries_json: &str) -> String {
    format!(
        r#"You are crafting a personalized news digest from the newsletter summaries below. Find the stories that MORE THAN ONE newsletter covered.

<summaries>
{}
</summaries>

GROUPING RULES:
1. A theme groups newsletters that cover the SAME underlying story or topic
2. Every theme needs at least 2 newsletters - never make a theme out of a single newsletter
3. Each newsletter id may appear in at most one theme
4. Use only the "id" values from the summaries above
5. "title": punchy and specific (not "AI News" but "Anthropic Draws a Line on Safety")
6. "rationale": one sentence on what the grouped newsletters have in common
7. "synthesis": 3-4 conversational sentences on the story across its sources - explain jargon in plain English, say why it matters and what happens next
8. "importance": integer 1-10
9. "intro": two sentences introducing the whole digest - name the big story and preview what else is inside
10. "top_story": the single most important story, with "why" in 4-5 sentences of context and stakes, and the newsletters it came from in "sources"; null when nothing stands out
11. "contradictions": topics where different newsletters take genuinely different positions; may be empty
12. It is fine to return no themes when nothing overlaps

Format your response as JSON:
{{
  "intro": "...",
  "top_story": {{
    "title": "...",
    "why": "...",
    "sources": ["..."]
  }},
  "themes": [
    {{
      "title": "...",
      "item_ids": [1, 3],
      "rationale": "...",
      "synthesis": "...",
      "importance": 7
    }}
  ],
  "contradictions": [
    {{
      "topic": "...",
      "positions": [{{"source": "...", "position": "..."}}]
    }}
  ]
}}"#,
        summaries_json
    )
}

fn parse_importance(value: &Value) -> Option<u8> {
    let rating = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    if !rating.is_finite() {
        return None;
    }
    Some(rating.round().clamp(1.0, 10.0) as u8)
}

fn trimmed(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn parse_top_story(value: Value) -> Option<TopStory> {
    let story: TopStory = match serde_json::from_value(value) {
        Ok(story) => story,
        Err(e) => {
            debug!(error = %e, "Ignoring unusable top story");
            return None;
        }
    };
    Some(TopStory {
        title: trimmed(&story.title)?,
        why: trimmed(&story.why)?,
        sources: story.sources.iter().filter_map(|s| trimmed(s)).collect(),
    })
}

/// Keeps the contradictions that still have two positions after cleanup.
fn parse_contradictions(value: Value) -> Vec<Contradiction> {
    let Value::Array(entries) = value else {
        return Vec::new();
    };

    entries
        .into_iter()
        .filter_map(|entry| serde_json::from_value::<Contradiction>(entry).ok())
        .filter_map(|contradiction| {
            let positions: Vec<SourcePosition> = contradiction
                .positions
                .iter()
                .filter_map(|p| {
                    Some(SourcePosition {
                        source: trimmed(&p.source)?,
                        position: trimmed(&p.position)?,
                    })
                })
                .collect();
            if positions.len() < 2 {
                return None;
            }
            Some(Contradiction {
                topic: trimmed(&contradiction.topic)?,
                positions,
            })
        })
        .collect()
}

fn parse_item_id(value: &Value) -> Option<ItemId> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()).map(ItemId),
        Value::String(s) => s.trim().parse().ok().map(ItemId),
        _ => None,
    }
}

/// Turns model proposals into valid, disjoint themes.
///
/// Unknown and repeated ids are dropped and groups under two members are
/// discarded. An id claimed by several groups stays with the largest one,
/// the earliest emitted on a tie. Groups that fall under two members after
/// that are discarded too.
pub fn resolve_themes(proposals: Vec<ProposedTheme>, known: &HashSet<ItemId>) -> Vec<ThemeGroup> {
    let candidates: Vec<(ProposedTheme, Vec<ItemId>)> = proposals
        .into_iter()
        .filter_map(|proposal| {
            let mut members: Vec<ItemId> = Vec::new();
            for id in proposal.item_ids.iter().filter_map(parse_item_id) {
                if known.contains(&id) && !members.contains(&id) {
                    members.push(id);
                }
            }
            if members.len() < 2 {
                debug!(title = %proposal.title, "Discarding theme with fewer than 2 known members");
                return None;
            }
            Some((proposal, members))
        })
        .collect();

    let mut owner: HashMap<ItemId, usize> = HashMap::new();
    for (index, (_, members)) in candidates.iter().enumerate() {
        for id in members {
            owner
                .entry(*id)
                .and_modify(|current| {
                    if members.len() > candidates[*current].1.len() {
                        *current = index;
                    }
                })
                .or_insert(index);
        }
    }

    candidates
        .into_iter()
        .enumerate()
        .filter_map(|(index, (proposal, members))| {
            let kept: BTreeSet<ItemId> = members
                .into_iter()
                .filter(|id| owner.get(id) == Some(&index))
                .collect();
            if kept.len() < 2 {
                debug!(title = %proposal.title, "Discarding theme that lost its members to larger themes");
                return None;
            }
            Some((proposal, kept))
        })
        .enumerate()
        .map(|(position, (proposal, kept))| {
            let title = proposal.title.trim();
            ThemeGroup {
                theme_id: format!("theme-{}", position + 1),
                title: if title.is_empty() {
                    UNTITLED_THEME.to_string()
                } else {
                    title.to_string()
                },
                member_item_ids: kept,
                rationale: proposal.rationale.trim().to_string(),
                synthesis: proposal.synthesis.trim().to_string(),
                importance: proposal.importance.as_ref().and_then(parse_importance),
            }
        })
        .collect()
}
