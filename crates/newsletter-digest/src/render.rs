use crate::models::{Digest, DigestEntry, DigestItem};

const RULE_WIDTH: usize = 60;
const SECTION_RULE_WIDTH: usize = 40;

fn plural(count: usize, noun: &str) -> String {
    format!("{} {}{}", count, noun, if count == 1 { "" } else { "s" })
}

pub struct DigestRenderer;

impl DigestRenderer {
    /// Subject line, e.g. "Your Newsletter Digest - Feb 1 (4 newsletters, 1 theme)".
    pub fn subject(digest: &Digest) -> String {
        let mut parts = vec![plural(digest.item_count(), "newsletter")];
        let themes = digest.theme_count();
        if themes > 0 {
            parts.push(plural(themes, "theme"));
        }

        format!(
            "Your Newsletter Digest - {} ({})",
            digest.window_end.format("%b %-d"),
            parts.join(", ")
        )
    }

    pub fn plain_text(digest: &Digest) -> String {
        let mut text = String::new();

        text.push_str("NEWSLETTER DIGEST\n");
        text.push_str(&format!(
            "{} - {}\n",
            digest.window_end.format("%b %-d, %Y"),
            plural(digest.item_count(), "newsletter")
        ));
        text.push_str(&"=".repeat(RULE_WIDTH));
        text.push('\n');

        if let Some(intro) = &digest.intro {
            text.push('\n');
            text.push_str(intro);
            text.push('\n');
        }

        if digest.is_empty() {
            text.push_str("\nNothing new in your newsletters for this period.\n");
        }

        if let Some(story) = &digest.top_story {
            Self::push_section(&mut text, "TOP STORY");
            text.push_str(&format!("\n{}\n", story.title));
            text.push_str(&format!("{}\n", story.why));
            if !story.sources.is_empty() {
                text.push_str(&format!("From: {}\n", story.sources.join(", ")));
            }
        }

        let themes: Vec<&DigestEntry> = digest.entries.iter().filter(|e| e.is_theme()).collect();
        if !themes.is_empty() {
            Self::push_section(&mut text, "THEMES ACROSS YOUR NEWSLETTERS");
            for (index, entry) in themes.iter().enumerate() {
                if let DigestEntry::Theme { theme, members } = entry {
                    match theme.importance {
                        Some(importance) => text.push_str(&format!(
                            "\n{}. {} [{}/10]\n",
                            index + 1,
                            theme.title,
                            importance
                        )),
                        None => text.push_str(&format!("\n{}. {}\n", index + 1, theme.title)),
                    }
                    if !theme.rationale.is_empty() {
                        text.push_str(&format!("   {}\n", theme.rationale));
                    }
                    if !theme.synthesis.is_empty() {
                        text.push_str(&format!("\n   {}\n\n", theme.synthesis));
                    }
                    let sources: Vec<&str> = members.iter().map(|m| m.sender_label()).collect();
                    text.push_str(&format!("   Sources: {}\n", sources.join(", ")));
                    for member in members {
                        Self::push_item(&mut text, member, "   ");
                    }
                }
            }
        }

        let standalone: Vec<&DigestItem> = digest
            .entries
            .iter()
            .filter_map(|entry| match entry {
                DigestEntry::Standalone { item } => Some(item),
                DigestEntry::Theme { .. } => None,
            })
            .collect();
        if !standalone.is_empty() {
            Self::push_section(&mut text, "INDIVIDUAL NEWSLETTERS");
            for item in standalone {
                Self::push_item(&mut text, item, "");
            }
        }

        if !digest.contradictions.is_empty() {
            Self::push_section(&mut text, "WHERE NEWSLETTERS DISAGREE");
            for contradiction in &digest.contradictions {
                text.push_str(&format!("\n{}\n", contradiction.topic));
                for position in &contradiction.positions {
                    text.push_str(&format!("  {}: {}\n", position.source, position.position));
                }
            }
        }

        text.push_str("\n---\nGenerated by Newsletter Digest\n");
        text
    }

    fn push_section(text: &mut String, heading: &str) {
        text.push('\n');
        text.push_str(heading);
        text.push('\n');
        text.push_str(&"-".repeat(SECTION_RULE_WIDTH));
        text.push('\n');
    }

    fn push_item(text: &mut String, item: &DigestItem, indent: &str) {
        let summary = &item.summary;
        text.push_str(&format!(
            "\n{}{} - {}\n",
            indent,
            item.sender_label(),
            item.subject
        ));
        text.push_str(&format!("{}  {}\n", indent, summary.gist));
        for takeaway in &summary.takeaways {
            text.push_str(&format!("{}  * {}\n", indent, takeaway));
        }
        if let Some(context) = &summary.context {
            text.push_str(&format!("{}  Context: {}\n", indent, context));
        }
        for link in &summary.notable_links {
            if link.description.is_empty() {
                text.push_str(&format!("{}  > {}\n", indent, link.url));
            } else {
                text.push_str(&format!("{}  > {} ({})\n", indent, link.description, link.url));
            }
        }
    }
}
