use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters collected during a migration run
#[derive(Default)]
pub struct MigrationStats {
    pub posts_imported: AtomicU64,
    pub pages_imported: AtomicU64,
    pub categories_created: AtomicU64,
    pub tags_created: AtomicU64,
    pub images_downloaded: AtomicU64,
    pub redirects_created: AtomicU64,
    pub errors: AtomicU64,
    pub url_mappings_count: AtomicU64,
    pub skipped_duplicates: AtomicU64,
}

impl MigrationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_posts(&self) {
        self.posts_imported.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pages(&self) {
        self.pages_imported.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_categories(&self) {
        self.categories_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tags(&self) {
        self.tags_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_images(&self, count: u64) {
        self.images_downloaded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_redirects(&self) {
        self.redirects_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_errors(&self, count: u64) {
        self.errors.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_url_mappings(&self, count: u64) {
        self.url_mappings_count.store(count, Ordering::Relaxed);
    }

    pub fn inc_skipped(&self) {
        self.skipped_duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn posts(&self) -> u64 {
        self.posts_imported.load(Ordering::Relaxed)
    }

    pub fn pages(&self) -> u64 {
        self.pages_imported.load(Ordering::Relaxed)
    }

    pub fn categories(&self) -> u64 {
        self.categories_created.load(Ordering::Relaxed)
    }

    pub fn tags(&self) -> u64 {
        self.tags_created.load(Ordering::Relaxed)
    }

    pub fn images(&self) -> u64 {
        self.images_downloaded.load(Ordering::Relaxed)
    }

    pub fn redirects(&self) -> u64 {
        self.redirects_created.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn url_mappings(&self) -> u64 {
        self.url_mappings_count.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped_duplicates.load(Ordering::Relaxed)
    }

    /// Point-in-time copy for the report
    pub fn snapshot(&self, execution_time_s: f64) -> StatsSnapshot {
        StatsSnapshot {
            posts_imported: self.posts(),
            pages_imported: self.pages(),
            categories_created: self.categories(),
            tags_created: self.tags(),
            images_downloaded: self.images(),
            redirects_created: self.redirects(),
            errors: self.error_count(),
            url_mappings_count: self.url_mappings(),
            skipped_duplicates: self.skipped(),
            execution_time_s,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct StatsSnapshot {
    pub posts_imported: u64,
    pub pages_imported: u64,
    pub categories_created: u64,
    pub tags_created: u64,
    pub images_downloaded: u64,
    pub redirects_created: u64,
    pub errors: u64,
    pub url_mappings_count: u64,
    pub skipped_duplicates: u64,
    pub execution_time_s: f64,
}
