use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::{Digest, RawEmail};
use crate::normalizer::NormalizationError;
use crate::render::DigestRenderer;

/// One element of an input file: parsed, or rejected at its position.
pub type LoadedEmail = std::result::Result<RawEmail, NormalizationError>;

/// Get the default directory for storing digest files
pub fn get_default_digests_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .context("Could not determine local data directory")?
        .join("newsletter-digest")
        .join("digests");

    fs::create_dir_all(&data_dir).context("Failed to create digests directory")?;

    Ok(data_dir)
}

/// Load raw email records from a JSON array file.
///
/// Only an unreadable file or a top level that is not an array fails the
/// load. Elements that do not parse as records come back as
/// [`NormalizationError::Malformed`] so the rest of the batch survives.
pub fn load_raw_emails(filepath: &Path) -> Result<Vec<LoadedEmail>> {
    if !filepath.exists() {
        anyhow::bail!("Input file not found: {}", filepath.display());
    }

    let content = fs::read_to_string(filepath)
        .with_context(|| format!("Failed to read input file: {}", filepath.display()))?;

    let values: Vec<serde_json::Value> = serde_json::from_str(&content).with_context(|| {
        format!(
            "Failed to parse emails from {}. Expected a JSON array of records.",
            filepath.display()
        )
    })?;

    let records = values
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            serde_json::from_value::<RawEmail>(value).map_err(|e| {
                NormalizationError::Malformed {
                    index,
                    reason: e.to_string(),
                }
            })
        })
        .collect();

    Ok(records)
}

/// Base file name for a digest: user id and window end, filesystem-safe.
pub fn digest_file_stem(digest: &Digest) -> String {
    let user: String = digest
        .user_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("digest-{}-{}", user, digest.window_end.format("%Y%m%dT%H%M%SZ"))
}

/// Save a digest as JSON plus a plain-text rendering. Returns (json, text) paths.
pub fn save_digest_files(digest: &Digest, dir: &Path) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    let stem = digest_file_stem(digest);
    let json_path = dir.join(format!("{}.json", stem));
    let text_path = dir.join(format!("{}.txt", stem));

    let json = serde_json::to_string_pretty(digest).context("Failed to serialize digest")?;
    fs::write(&json_path, json)
        .with_context(|| format!("Failed to write digest file: {}", json_path.display()))?;

    let text = format!(
        "Subject: {}\n\n{}",
        DigestRenderer::subject(digest),
        DigestRenderer::plain_text(digest)
    );
    fs::write(&text_path, text)
        .with_context(|| format!("Failed to write digest file: {}", text_path.display()))?;

    Ok((json_path, text_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("newsletter-digest-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn empty_digest(user: &str) -> Digest {
        Digest {
            user_id: user.to_string(),
            window_start: Utc.with_ymd_and_hms(2026, 1, 31, 8, 0, 0).unwrap(),
            window_end: Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap(),
            intro: None,
            top_story: None,
            entries: Vec::new(),
            contradictions: Vec::new(),
            generated_at: Utc.with_ymd_and_hms(2026, 2, 1, 8, 1, 0).unwrap(),
        }
    }

    #[test]
    fn test_load_raw_emails() {
        let dir = scratch_dir("load");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("inbox.json");
        fs::write(
            &path,
            r#"[{"sender": "a@example.com", "subject": "Hi", "received_at": "2026-02-01T08:00:00Z", "body": "Hello"},
                {"received_at": "2026-02-01T09:00:00Z"}]"#,
        )
        .unwrap();

        let records = load_raw_emails(&path).unwrap();
        assert_eq!(records.len(), 2);
        let first = records[0].as_ref().unwrap();
        assert_eq!(first.sender.as_deref(), Some("a@example.com"));
        assert!(records[1].as_ref().unwrap().body.is_none());
    }

    #[test]
    fn test_bad_records_do_not_fail_the_load() {
        let dir = scratch_dir("partial");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("inbox.json");
        fs::write(
            &path,
            r#"[{"sender": "a@example.com", "subject": "Hi", "received_at": "2026-02-01T08:00:00Z", "body": "Hello"},
                {"sender": "b@example.com", "subject": "Undated", "body": "No date here"},
                {"sender": "c@example.com", "received_at": "yesterday", "body": "Bad date"},
                "not a record"]"#,
        )
        .unwrap();

        let records = load_raw_emails(&path).unwrap();
        assert_eq!(records.len(), 4);
        assert!(records[0].is_ok());
        for (index, record) in records.iter().enumerate().skip(1) {
            match record {
                Err(NormalizationError::Malformed { index: at, .. }) => assert_eq!(*at, index),
                other => panic!("record {} should be malformed, got {:?}", index, other),
            }
        }
        assert!(matches!(
            &records[1],
            Err(NormalizationError::Malformed { reason, .. }) if reason.contains("received_at")
        ));

        let normalized = crate::normalizer::Normalizer::default().normalize_loaded(records);
        assert_eq!(normalized.items.len(), 1);
        assert_eq!(normalized.items[0].sender, "a@example.com");
        assert_eq!(normalized.rejected.len(), 3);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = load_raw_emails(Path::new("/nonexistent/inbox.json")).unwrap_err();
        assert!(err.to_string().contains("Input file not found"));
    }

    #[test]
    fn test_load_rejects_non_array() {
        let dir = scratch_dir("bad");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("inbox.json");
        fs::write(&path, r#"{"sender": "a@example.com"}"#).unwrap();

        assert!(load_raw_emails(&path).is_err());
    }

    #[test]
    fn test_file_stem_is_filesystem_safe() {
        assert_eq!(
            digest_file_stem(&empty_digest("leo@example.com")),
            "digest-leo_example_com-20260201T080000Z"
        );
    }

    #[test]
    fn test_save_digest_files() {
        let dir = scratch_dir("save");
        let digest = empty_digest("u1");

        let (json_path, text_path) = save_digest_files(&digest, &dir).unwrap();

        let saved: Digest = serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(saved, digest);
        let text = fs::read_to_string(&text_path).unwrap();
        assert!(text.starts_with("Subject: Your Newsletter Digest - Feb 1 (0 newsletters)"));
    }
}
