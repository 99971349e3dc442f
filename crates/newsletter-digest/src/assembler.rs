use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::clustering::Clustering;
use crate::models::{Digest, DigestEntry, DigestItem, ItemId, NewsletterItem, Summary, TimeWindow};
use crate::store::{DigestStore, StoreError};

/// A digest plus the hashes left out because they were already delivered.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub digest: Digest,
    pub excluded_hashes: BTreeSet<String>,
}

pub struct DigestAssembler {
    store: Arc<dyn DigestStore>,
}

impl DigestAssembler {
    pub fn new(store: Arc<dyn DigestStore>) -> Self {
        Self { store }
    }

    /// Builds the digest for `window`, leaving out content already sent to
    /// `user_id` in a digest with an overlapping window.
    ///
    /// Themes come first, biggest first; standalone items follow in arrival
    /// order. A failed store lookup is returned as the error.
    pub fn assemble(
        &self,
        user_id: &str,
        window: &TimeWindow,
        clustering: Clustering,
        summaries: &[Summary],
        items: &[NewsletterItem],
    ) -> Result<Assembled, StoreError> {
        let delivered = self
            .store
            .find_content_hashes_in_overlapping_window(user_id, window)?;

        let items_by_id: HashMap<ItemId, &NewsletterItem> =
            items.iter().map(|item| (item.id, item)).collect();
        let summaries_by_id: HashMap<ItemId, &Summary> =
            summaries.iter().map(|s| (s.item_id, s)).collect();

        let mut excluded_hashes = BTreeSet::new();
        let mut fresh = |id: &ItemId| -> Option<DigestItem> {
            let item = items_by_id.get(id)?;
            let summary = summaries_by_id.get(id)?;
            if delivered.contains(&item.content_hash) {
                debug!(item_id = %id, hash = %item.content_hash, "Already delivered, skipping");
                excluded_hashes.insert(item.content_hash.clone());
                return None;
            }
            Some(DigestItem::new(item, (*summary).clone()))
        };

        let mut themes = Vec::new();
        let mut standalone = Vec::new();

        for theme in clustering.themes {
            let mut members: Vec<DigestItem> =
                theme.member_item_ids.iter().filter_map(&mut fresh).collect();
            members.sort_by(|a, b| a.received_at.cmp(&b.received_at).then(a.item_id.cmp(&b.item_id)));

            match members.len() {
                0 => debug!(theme_id = %theme.theme_id, "Theme fully delivered before, dropping"),
                1 => {
                    debug!(theme_id = %theme.theme_id, "Theme reduced to one item, listing it standalone");
                    standalone.extend(members);
                }
                _ => {
                    let mut theme = theme;
                    theme.member_item_ids = members.iter().map(|m| m.item_id).collect();
                    themes.push((theme, members));
                }
            }
        }

        for summary in &clustering.standalone {
            if let Some(item) = fresh(&summary.item_id) {
                standalone.push(item);
            }
        }

        themes.sort_by(|(a_theme, a), (b_theme, b)| {
            b.len()
                .cmp(&a.len())
                .then(a[0].received_at.cmp(&b[0].received_at))
                .then(theme_order(&a_theme.theme_id).cmp(&theme_order(&b_theme.theme_id)))
        });
        standalone.sort_by(|a, b| a.received_at.cmp(&b.received_at).then(a.item_id.cmp(&b.item_id)));

        let mut entries: Vec<DigestEntry> = themes
            .into_iter()
            .map(|(theme, members)| DigestEntry::Theme { theme, members })
            .collect();
        entries.extend(standalone.into_iter().map(|item| DigestEntry::Standalone { item }));

        // No framing text without entries.
        let (intro, top_story, contradictions) = if entries.is_empty() {
            (None, None, Vec::new())
        } else {
            (clustering.intro, clustering.top_story, clustering.contradictions)
        };

        let digest = Digest {
            user_id: user_id.to_string(),
            window_start: window.start,
            window_end: window.end,
            intro,
            top_story,
            entries,
            contradictions,
            generated_at: Utc::now(),
        };

        info!(
            themes = digest.theme_count(),
            items = digest.item_count(),
            excluded = excluded_hashes.len(),
            "Assembled digest"
        );

        Ok(Assembled {
            digest,
            excluded_hashes,
        })
    }
}

/// Emission order of a `theme-N` id; "theme-10" sorts after "theme-9".
fn theme_order(theme_id: &str) -> (usize, &str) {
    let position = theme_id
        .rsplit('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(usize::MAX);
    (position, theme_id)
}
