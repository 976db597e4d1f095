use crate::stats::StatsSnapshot;
use crate::storage::write_json_atomic;
use crate::urlmap::UrlMapper;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Where in the run an error was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    Extract,
    Taxonomy,
    Post,
    Page,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub stage: ErrorStage,
    /// Post id, slug or URL the error is about
    pub subject: String,
    pub message: String,
}

/// Record-level failures of a run, in the order they happened.
#[derive(Debug, Default)]
pub struct ErrorLog {
    entries: Vec<ErrorEntry>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: ErrorStage, subject: impl Into<String>, message: impl Into<String>) {
        self.entries.push(ErrorEntry {
            stage,
            subject: subject.into(),
            message: message.into(),
        });
    }

    pub fn entries(&self) -> &[ErrorEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Contents of `migration_report.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    pub migration_date: DateTime<Utc>,
    pub source_url: String,
    pub dry_run: bool,
    pub interrupted: bool,
    pub stats: StatsSnapshot,
    pub url_mappings_count: u64,
    pub downloaded_images: u64,
    pub errors: Vec<ErrorEntry>,
    /// Set when the run aborted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
    /// Image URLs that were rejected or unreachable, sorted
    #[serde(default)]
    pub rejected_images: Vec<String>,
    /// Shortcodes left in migrated bodies as-is
    #[serde(default)]
    pub unknown_shortcodes: Vec<String>,
}

pub fn write_report(path: &Path, report: &MigrationReport) -> Result<()> {
    write_json_atomic(path, report)?;
    info!(path = %path.display(), "Migration report written");
    Ok(())
}

/// nginx rewrite rule for one mapping. nginx matches `rewrite` against the
/// decoded `$uri`, so percent-encoded legacy paths are decoded first.
pub fn rewrite_rule(old_path: &str, new_path: &str) -> String {
    let pattern = format!("^{}$", decoded_path(old_path));
    if pattern.contains(|c: char| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '"')) {
        format!(
            "rewrite \"{}\" {new_path} permanent;",
            pattern.replace('"', "\\\"")
        )
    } else {
        format!("rewrite {pattern} {new_path} permanent;")
    }
}

/// Invalid escapes or non-UTF-8 results keep the raw path.
fn decoded_path(path: &str) -> Cow<'_, str> {
    if !path.contains('%') {
        return Cow::Borrowed(path);
    }
    urlencoding::decode(path).unwrap_or(Cow::Borrowed(path))
}

/// Writes one rewrite rule per mapping whose paths differ. Returns the rule count.
pub fn write_redirects(path: &Path, mapper: &UrlMapper) -> Result<usize> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create redirects file: {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let mut rules = 0;
    for (old_path, new_path) in mapper.iter().filter(|(old, new)| old != new) {
        writeln!(writer, "{}", rewrite_rule(old_path, new_path))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        rules += 1;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", path.display()))?;

    info!(path = %path.display(), rules, "Redirect rules written");
    Ok(rules)
}
