use crate::models::{
    Attachment, MetaMap, Post, PostKind, RelationshipMap, TaxonomyEntry, TaxonomyKind, Term,
};
use crate::sql::{clean, iter_inserts, parse_tuple};
use anyhow::{bail, Result};
use chrono::NaiveDateTime;
use rustc_hash::FxHashMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Column positions of `wp_posts`
mod posts_col {
    pub const ID: usize = 0;
    pub const AUTHOR: usize = 1;
    pub const DATE: usize = 2;
    pub const CONTENT: usize = 4;
    pub const TITLE: usize = 5;
    pub const EXCERPT: usize = 6;
    pub const STATUS: usize = 7;
    pub const NAME: usize = 11;
    pub const MODIFIED: usize = 14;
    pub const PARENT: usize = 17;
    pub const GUID: usize = 18;
    pub const TYPE: usize = 20;
    pub const MIME: usize = 21;
    pub const ARITY: usize = 23;
}

const TERMS_ARITY: usize = 3;
const TAXONOMY_ARITY: usize = 4;
const RELATIONSHIPS_ARITY: usize = 2;
const POSTMETA_ARITY: usize = 4;

const DUMP_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Everything the loader needs from one dump.
#[derive(Debug, Default)]
pub struct WpDataset {
    /// Published posts and pages with a title and content, in dump order
    pub posts: Vec<Post>,
    pub attachments: FxHashMap<u64, Attachment>,
    /// Attachment ids in dump order
    pub attachment_order: Vec<u64>,
    pub terms: FxHashMap<u64, Term>,
    /// Category and tag entries, in dump order
    pub taxonomy: Vec<TaxonomyEntry>,
    pub relationships: RelationshipMap,
    pub meta: MetaMap,
}

impl WpDataset {
    #[cfg(test)]
    pub fn taxonomy_entry(&self, id: u64) -> Option<&TaxonomyEntry> {
        self.taxonomy.iter().find(|t| t.id == id)
    }

    pub fn post_meta(&self, post_id: u64, key: &str) -> Option<&str> {
        self.meta
            .get(&post_id)
            .and_then(|m| m.get(key))
            .map(String::as_str)
    }
}

#[derive(Debug, Default, Clone)]
pub struct TableReport {
    pub tuples: u64,
    pub malformed: u64,
}

impl TableReport {
    fn malformed_pct(&self) -> f64 {
        if self.tuples == 0 {
            0.0
        } else {
            self.malformed as f64 * 100.0 / self.tuples as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct ExtractReport {
    pub tables: Vec<(String, TableReport)>,
    /// Retained posts whose `post_date` could not be parsed
    pub unparsed_dates: u64,
    /// Rows dropped by the publish/type/content filter
    pub filtered_posts: u64,
    /// One line per malformed tuple, for the run's error log
    pub issues: Vec<String>,
}

impl ExtractReport {
    pub fn malformed(&self) -> u64 {
        self.tables.iter().map(|(_, t)| t.malformed).sum()
    }
}

/// Row-level failure; the tuple is skipped.
#[derive(Debug)]
enum RowError {
    Arity { expected: usize, found: usize },
    BadNumber { column: &'static str, value: String },
    Lex(crate::sql::SqlError),
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowError::Arity { expected, found } => {
                write!(f, "expected at least {expected} columns, found {found}")
            }
            RowError::BadNumber { column, value } => {
                write!(f, "column {column} is not a number: {value:?}")
            }
            RowError::Lex(e) => write!(f, "{e}"),
        }
    }
}

pub struct Extractor {
    table_prefix: String,
    max_malformed_pct: Option<f64>,
}

impl Extractor {
    pub fn new(table_prefix: &str) -> Self {
        Self {
            table_prefix: table_prefix.to_string(),
            max_malformed_pct: None,
        }
    }

    /// Abort extraction once a table's malformed share exceeds `pct` percent.
    pub fn with_max_malformed_pct(mut self, pct: Option<f64>) -> Self {
        self.max_malformed_pct = pct;
        self
    }

    fn table(&self, name: &str) -> String {
        format!("{}{}", self.table_prefix, name)
    }

    /// Builds the record sets. Fails only when the malformed threshold is hit.
    pub fn extract(&self, text: &str) -> Result<(WpDataset, ExtractReport)> {
        let mut dataset = WpDataset::default();
        let mut report = ExtractReport::default();

        let mut unparsed_dates = 0;
        self.scan(text, "posts", posts_col::ARITY, &mut report, |row| {
            extract_post(row, &mut dataset, &mut unparsed_dates)
        })?;
        report.unparsed_dates = unparsed_dates;

        self.scan(text, "terms", TERMS_ARITY, &mut report, |row| {
            let id = parse_id(row[0], "term_id")?;
            dataset.terms.insert(
                id,
                Term {
                    id,
                    name: text_or_empty(row[1]),
                    slug: text_or_empty(row[2]),
                },
            );
            Ok(())
        })?;

        self.scan(text, "term_taxonomy", TAXONOMY_ARITY, &mut report, |row| {
            let id = parse_id(row[0], "term_taxonomy_id")?;
            let term_id = parse_id(row[1], "term_id")?;
            if let Some(kind) = TaxonomyKind::from_taxonomy(&text_or_empty(row[2])) {
                dataset.taxonomy.push(TaxonomyEntry {
                    id,
                    term_id,
                    kind,
                    description: text_or_empty(row[3]),
                });
            }
            Ok(())
        })?;

        self.scan(
            text,
            "term_relationships",
            RELATIONSHIPS_ARITY,
            &mut report,
            |row| {
                let post_id = parse_id(row[0], "object_id")?;
                let taxonomy_id = parse_id(row[1], "term_taxonomy_id")?;
                dataset
                    .relationships
                    .entry(post_id)
                    .or_default()
                    .push(taxonomy_id);
                Ok(())
            },
        )?;

        self.scan(text, "postmeta", POSTMETA_ARITY, &mut report, |row| {
            let post_id = parse_id(row[1], "post_id")?;
            if let (Some(key), Some(value)) = (clean(row[2]), clean(row[3])) {
                dataset.meta.entry(post_id).or_default().insert(key, value);
            }
            Ok(())
        })?;

        let posts_seen = report
            .tables
            .iter()
            .find(|(name, _)| name.ends_with("posts"))
            .map(|(_, t)| t.tuples - t.malformed)
            .unwrap_or(0);
        report.filtered_posts = posts_seen
            .saturating_sub(dataset.posts.len() as u64)
            .saturating_sub(dataset.attachment_order.len() as u64);

        info!(
            posts = dataset.posts.len(),
            attachments = dataset.attachments.len(),
            terms = dataset.terms.len(),
            taxonomy = dataset.taxonomy.len(),
            relationships = dataset.relationships.len(),
            meta = dataset.meta.len(),
            malformed = report.malformed(),
            "Dump extracted"
        );

        Ok((dataset, report))
    }

    fn scan<F>(
        &self,
        text: &str,
        name: &str,
        min_arity: usize,
        report: &mut ExtractReport,
        mut on_row: F,
    ) -> Result<()>
    where
        F: FnMut(&[&str]) -> std::result::Result<(), RowError>,
    {
        let table = self.table(name);
        let mut table_report = TableReport::default();

        for item in iter_inserts(text, &table) {
            table_report.tuples += 1;
            let outcome = item
                .map_err(RowError::Lex)
                .and_then(|body| parse_tuple(body).map_err(RowError::Lex))
                .and_then(|row| {
                    if row.len() < min_arity {
                        Err(RowError::Arity {
                            expected: min_arity,
                            found: row.len(),
                        })
                    } else {
                        on_row(&row)
                    }
                });

            if let Err(e) = outcome {
                table_report.malformed += 1;
                warn!(table = %table, tuple = table_report.tuples, error = %e, "Skipping malformed tuple");
                report
                    .issues
                    .push(format!("{table} tuple #{}: {e}", table_report.tuples));
            }
        }

        debug!(
            table = %table,
            tuples = table_report.tuples,
            malformed = table_report.malformed,
            "Table scanned"
        );

        if let Some(limit) = self.max_malformed_pct {
            let pct = table_report.malformed_pct();
            if pct > limit {
                bail!(
                    "{table}: {:.1}% of tuples are malformed ({} of {}), above the {limit}% limit",
                    pct,
                    table_report.malformed,
                    table_report.tuples
                );
            }
        }

        report.tables.push((table, table_report));
        Ok(())
    }
}

fn extract_post(
    row: &[&str],
    dataset: &mut WpDataset,
    unparsed_dates: &mut u64,
) -> std::result::Result<(), RowError> {
    let id = parse_id(row[posts_col::ID], "ID")?;
    let kind = PostKind::from_post_type(&text_or_empty(row[posts_col::TYPE]));
    let title = text_or_empty(row[posts_col::TITLE]);
    let guid = text_or_empty(row[posts_col::GUID]);
    let mime = text_or_empty(row[posts_col::MIME]);

    if kind == PostKind::Attachment {
        if mime.starts_with("image/") && !guid.trim().is_empty() {
            dataset.attachment_order.push(id);
            dataset.attachments.insert(
                id,
                Attachment {
                    id,
                    title: title.trim().to_string(),
                    url: guid.trim().to_string(),
                    mime,
                },
            );
        }
        return Ok(());
    }

    let status = text_or_empty(row[posts_col::STATUS]);
    let raw_content = text_or_empty(row[posts_col::CONTENT]);
    let retained = status == "publish"
        && matches!(kind, PostKind::Post | PostKind::Page)
        && !title.trim().is_empty()
        && !raw_content.trim().is_empty();
    if !retained {
        return Ok(());
    }

    let created_at = parse_date(row[posts_col::DATE]);
    if created_at.is_none() {
        *unparsed_dates += 1;
        info!(
            post_id = id,
            value = row[posts_col::DATE],
            "Unparseable post_date, publication date will fall back to the run date"
        );
    }

    dataset.posts.push(Post {
        id,
        author_id: parse_optional_id(row[posts_col::AUTHOR]),
        created_at,
        modified_at: parse_date(row[posts_col::MODIFIED]),
        raw_content,
        title: title.trim().to_string(),
        excerpt: text_or_empty(row[posts_col::EXCERPT]),
        status,
        slug: text_or_empty(row[posts_col::NAME]).trim().to_string(),
        parent_id: parse_optional_id(row[posts_col::PARENT]).filter(|p| *p != 0),
        guid,
        kind,
        mime,
    });
    Ok(())
}

fn text_or_empty(raw: &str) -> String {
    clean(raw).unwrap_or_default()
}

fn parse_id(raw: &str, column: &'static str) -> std::result::Result<u64, RowError> {
    let value = clean(raw).unwrap_or_default();
    value.trim().parse().map_err(|_| RowError::BadNumber { column, value })
}

fn parse_optional_id(raw: &str) -> Option<u64> {
    clean(raw).and_then(|v| v.trim().parse().ok())
}

/// `None` for NULL, empty, and MySQL zero dates.
pub fn parse_date(raw: &str) -> Option<NaiveDateTime> {
    let value = clean(raw)?;
    NaiveDateTime::parse_from_str(value.trim(), DUMP_DATE_FORMAT).ok()
}
