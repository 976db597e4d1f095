use crate::assets::AssetDownloader;
use crate::cms::{tag_slug, Cms, DuplicateSlug};
use crate::config::{EXCERPT_MAX_CHARS, RESERVED_PAGE_SLUGS};
use crate::content::{extract_excerpt, extract_image_urls, rewrite_images, sanitize_with_report};
use crate::extract::WpDataset;
use crate::models::{
    Article, CategoryRef, ImageHandle, NewPage, PageRef, Post, PostKind, StandardPage, TagRef,
    TaxonomyKind,
};
use crate::report::{ErrorLog, ErrorStage};
use crate::seo::{build_seo, reading_time, slugify};
use crate::stats::MigrationStats;
use crate::urlmap::UrlMapper;
use anyhow::{bail, Result};
use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const THUMBNAIL_META_KEY: &str = "_thumbnail_id";
const YOAST_DESCRIPTION_META_KEY: &str = "_yoast_wpseo_metadesc";
const YOAST_FOCUS_KEYWORD_META_KEY: &str = "_yoast_wpseo_focuskw";

/// Which entity kinds a run touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    All,
    PostsOnly,
    PagesOnly,
    MediaOnly,
}

impl Scope {
    fn includes(self, kind: PostKind) -> bool {
        match self {
            Scope::All => matches!(kind, PostKind::Post | PostKind::Page),
            Scope::PostsOnly => kind == PostKind::Post,
            Scope::PagesOnly => kind == PostKind::Page,
            Scope::MediaOnly => false,
        }
    }

    fn includes_taxonomies(self) -> bool {
        matches!(self, Scope::All | Scope::PostsOnly)
    }
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub home_slug: String,
    pub blog_slug: String,
    pub site: String,
    pub dry_run: bool,
    pub scope: Scope,
    pub max_posts: Option<u64>,
    pub show_progress: bool,
    /// Publication date for posts whose own date is unusable
    pub run_date: NaiveDate,
}

/// Everything the loader writes to besides the CMS.
pub struct LoadContext<'a> {
    pub cms: &'a mut dyn Cms,
    pub downloader: &'a mut AssetDownloader,
    pub urlmap: &'a mut UrlMapper,
    pub stats: &'a MigrationStats,
    pub errors: &'a mut ErrorLog,
    pub cancel: &'a AtomicBool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    pub interrupted: bool,
    /// Posts and pages considered (created, skipped or failed)
    pub processed: u64,
    /// Shortcodes left in bodies as-is, once each, in order of first use
    pub unknown_shortcodes: Vec<String>,
}

/// Materializes a dataset in the CMS. Record-level problems are logged,
/// counted and recorded in the error log; only fatal conditions (missing
/// parents, storage failures) are returned as errors.
pub fn load(
    dataset: &WpDataset,
    config: &LoaderConfig,
    ctx: LoadContext<'_>,
) -> Result<LoadOutcome> {
    let mut loader = Loader {
        config,
        cms: ctx.cms,
        downloader: ctx.downloader,
        urlmap: ctx.urlmap,
        stats: ctx.stats,
        errors: ctx.errors,
        cancel: ctx.cancel,
        categories: FxHashMap::default(),
        tags: FxHashMap::default(),
        planned_categories: FxHashSet::default(),
        planned_tags: FxHashSet::default(),
        claimed: FxHashMap::default(),
        unknown_shortcodes: Vec::new(),
    };

    let images_before = loader.downloader.downloaded();
    let outcome = loader.run(dataset);
    let images = loader.downloader.downloaded() - images_before;
    loader.stats.add_images(images);
    let mut outcome = outcome?;
    outcome.unknown_shortcodes = loader.unknown_shortcodes;
    Ok(outcome)
}

struct Parents {
    home: PageRef,
    blog: PageRef,
}

struct Loader<'a> {
    config: &'a LoaderConfig,
    cms: &'a mut dyn Cms,
    downloader: &'a mut AssetDownloader,
    urlmap: &'a mut UrlMapper,
    stats: &'a MigrationStats,
    errors: &'a mut ErrorLog,
    cancel: &'a AtomicBool,
    /// taxonomy entry id -> category
    categories: FxHashMap<u64, CategoryRef>,
    /// taxonomy entry id -> tag
    tags: FxHashMap<u64, TagRef>,
    /// Slugs a dry run would have created
    planned_categories: FxHashSet<String>,
    planned_tags: FxHashSet<String>,
    /// (parent id, slug) -> title, for pages placed during this run
    claimed: FxHashMap<(u64, String), String>,
    unknown_shortcodes: Vec<String>,
}

/// What a post turns into before it reaches the CMS
struct Prepared {
    parent: PageRef,
    slug: String,
    legacy_path: String,
    new_path: String,
}

impl Loader<'_> {
    fn run(&mut self, dataset: &WpDataset) -> Result<LoadOutcome> {
        if self.config.scope == Scope::MediaOnly {
            return self.load_media(dataset);
        }

        let parents = self.resolve_parents()?;

        if self.config.scope.includes_taxonomies() {
            self.load_taxonomies(dataset);
            info!(
                categories = self.stats.categories(),
                tags = self.stats.tags(),
                dry_run = self.config.dry_run,
                "Taxonomies loaded"
            );
        }

        let limit = self.config.max_posts.unwrap_or(u64::MAX);
        let posts: Vec<&Post> = dataset
            .posts
            .iter()
            .filter(|p| self.config.scope.includes(p.kind))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect();

        let pb = self.progress_bar(posts.len() as u64);
        let mut outcome = LoadOutcome::default();

        for post in posts {
            if self.cancel.load(Ordering::Relaxed) {
                warn!(processed = outcome.processed, "Interrupted, stopping before the next entity");
                outcome.interrupted = true;
                break;
            }
            self.load_post(dataset, &parents, post)?;
            outcome.processed += 1;
            pb.inc(1);
        }
        pb.finish_and_clear();

        info!(
            posts = self.stats.posts(),
            pages = self.stats.pages(),
            skipped = self.stats.skipped(),
            errors = self.stats.error_count(),
            dry_run = self.config.dry_run,
            "Content loaded"
        );
        Ok(outcome)
    }

    fn progress_bar(&self, total: u64) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} Importing [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap()
                .progress_chars("=> "),
        );
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    fn resolve_parents(&self) -> Result<Parents> {
        let Some(home) = self.cms.find_parent_by_slug(&self.config.home_slug) else {
            bail!(
                "Site root page {:?} not found; seed the content store first",
                self.config.home_slug
            );
        };
        let Some(blog) = self.cms.find_parent_by_slug(&self.config.blog_slug) else {
            bail!(
                "Blog index page {:?} not found; seed the content store first",
                self.config.blog_slug
            );
        };
        debug!(home = %home.url_path, blog = %blog.url_path, "Parents resolved");
        Ok(Parents { home, blog })
    }

    fn record_error(&mut self, stage: ErrorStage, subject: &str, message: String) {
        warn!(stage = ?stage, subject, error = %message, "Record skipped");
        self.stats.inc_errors();
        self.errors.push(stage, subject, message);
    }

    // ------------------------------------------------------------------
    // Taxonomies
    // ------------------------------------------------------------------

    fn load_taxonomies(&mut self, dataset: &WpDataset) {
        // Categories first, then tags.
        for kind in [TaxonomyKind::Category, TaxonomyKind::Tag] {
            for entry in dataset.taxonomy.iter().filter(|e| e.kind == kind) {
                let Some(term) = dataset.terms.get(&entry.term_id) else {
                    self.record_error(
                        ErrorStage::Taxonomy,
                        &entry.id.to_string(),
                        format!("term {} not found", entry.term_id),
                    );
                    continue;
                };
                let name = term.name.trim();
                if name.is_empty() {
                    self.record_error(
                        ErrorStage::Taxonomy,
                        &entry.id.to_string(),
                        "term has an empty name".to_string(),
                    );
                    continue;
                }
                match kind {
                    TaxonomyKind::Category => self.load_category(entry.id, name, &term.slug),
                    TaxonomyKind::Tag => self.load_tag(entry.id, name),
                }
            }
        }
    }

    fn load_category(&mut self, taxonomy_id: u64, name: &str, slug: &str) {
        if self.config.dry_run {
            let slug = if slug.trim().is_empty() {
                slugify(name)
            } else {
                slug.trim().to_string()
            };
            let existing = self.cms.category_by_slug(&slug);
            if existing.is_none() && self.planned_categories.insert(slug.clone()) {
                self.stats.inc_categories();
            }
            let reference = existing.unwrap_or(CategoryRef { id: 0, slug });
            self.categories.insert(taxonomy_id, reference);
            return;
        }

        match self.cms.create_or_get_category(name, slug) {
            Ok((reference, created)) => {
                if created {
                    self.stats.inc_categories();
                    debug!(slug = %reference.slug, "Category created");
                }
                self.categories.insert(taxonomy_id, reference);
            }
            Err(e) => self.record_error(ErrorStage::Taxonomy, name, format!("{e:#}")),
        }
    }

    fn load_tag(&mut self, taxonomy_id: u64, name: &str) {
        if self.config.dry_run {
            let slug = tag_slug(name);
            let existing = self.cms.tag_by_name(name);
            if existing.is_none() && self.planned_tags.insert(slug.clone()) {
                self.stats.inc_tags();
            }
            let reference = existing.unwrap_or(TagRef { id: 0, slug });
            self.tags.insert(taxonomy_id, reference);
            return;
        }

        match self.cms.create_or_get_tag(name) {
            Ok((reference, created)) => {
                if created {
                    self.stats.inc_tags();
                    debug!(slug = %reference.slug, "Tag created");
                }
                self.tags.insert(taxonomy_id, reference);
            }
            Err(e) => self.record_error(ErrorStage::Taxonomy, name, format!("{e:#}")),
        }
    }

    // ------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------

    fn load_media(&mut self, dataset: &WpDataset) -> Result<LoadOutcome> {
        let mut outcome = LoadOutcome::default();
        let pb = self.progress_bar(dataset.attachment_order.len() as u64);

        for id in &dataset.attachment_order {
            if self.cancel.load(Ordering::Relaxed) {
                warn!(processed = outcome.processed, "Interrupted, stopping before the next image");
                outcome.interrupted = true;
                break;
            }
            let Some(attachment) = dataset.attachments.get(id) else {
                continue;
            };
            outcome.processed += 1;
            pb.inc(1);

            if self.config.dry_run {
                debug!(url = %attachment.url, "Dry run, image not downloaded");
                continue;
            }
            // Rejections are logged by the downloader and leave nothing to record.
            let title = Some(attachment.title.as_str()).filter(|t| !t.is_empty());
            self.downloader
                .resolve(&attachment.url, title, &mut *self.cms)?;
        }
        pb.finish_and_clear();
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Posts and pages
    // ------------------------------------------------------------------

    fn prepare(&self, parents: &Parents, post: &Post) -> Option<Prepared> {
        let raw_slug = post.slug.trim();
        let slug = if raw_slug.contains('%') {
            let decoded = urlencoding::decode(raw_slug)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| raw_slug.to_string());
            slugify(&decoded)
        } else {
            raw_slug.to_string()
        };
        let slug = match slug {
            s if !s.is_empty() => s,
            _ => match slugify(&post.title) {
                s if !s.is_empty() => s,
                _ => format!("post-{}", post.id),
            },
        };

        let parent = match post.kind {
            PostKind::Post => parents.blog.clone(),
            PostKind::Page => {
                if RESERVED_PAGE_SLUGS.contains(&slug.as_str()) {
                    info!(post_id = post.id, slug = %slug, "Reserved page slug, skipping");
                    return None;
                }
                parents.home.clone()
            }
            PostKind::Attachment | PostKind::Other => return None,
        };

        let legacy_slug = if raw_slug.is_empty() { slug.as_str() } else { raw_slug };
        let legacy_path = format!("/{legacy_slug}/");
        let new_path = format!("{}{}/", parent.url_path, slug);
        Some(Prepared {
            parent,
            slug,
            legacy_path,
            new_path,
        })
    }

    /// Title of the page already occupying the slug, if any.
    fn occupant(&self, prepared: &Prepared) -> Option<String> {
        let key = (prepared.parent.id, prepared.slug.clone());
        if let Some(title) = self.claimed.get(&key) {
            return Some(title.clone());
        }
        self.cms
            .find_child(&prepared.parent, &prepared.slug)
            .map(|page| page.title)
    }

    fn load_post(&mut self, dataset: &WpDataset, parents: &Parents, post: &Post) -> Result<()> {
        let Some(prepared) = self.prepare(parents, post) else {
            return Ok(());
        };
        let stage = match post.kind {
            PostKind::Page => ErrorStage::Page,
            _ => ErrorStage::Post,
        };

        if let Some(existing_title) = self.occupant(&prepared) {
            self.stats.inc_skipped();
            if existing_title == post.title {
                info!(
                    post_id = post.id,
                    path = %prepared.new_path,
                    "Already migrated, ensuring redirect and mapping"
                );
                self.finish_entity(&prepared, stage);
            } else {
                warn!(
                    post_id = post.id,
                    slug = %prepared.slug,
                    existing = %existing_title,
                    "SKIPPED: slug already taken"
                );
            }
            return Ok(());
        }

        let (mut body, unknown) = sanitize_with_report(&post.raw_content);
        for name in unknown {
            if !self.unknown_shortcodes.contains(&name) {
                info!(shortcode = %name, post_id = post.id, "Unknown shortcode left as-is");
                self.unknown_shortcodes.push(name);
            }
        }
        if body.trim().is_empty() {
            self.record_error(
                stage,
                &post.id.to_string(),
                "body is empty after sanitization".to_string(),
            );
            return Ok(());
        }

        if self.config.dry_run {
            let images = extract_image_urls(&body).len();
            if images > 0 {
                debug!(post_id = post.id, images, "Dry run, images not downloaded");
            }
        } else {
            let downloader = &mut *self.downloader;
            let cms = &mut *self.cms;
            let (rewritten, count) =
                rewrite_images(&body, |url| downloader.resolve(url, None, &mut *cms))?;
            if count > 0 {
                debug!(post_id = post.id, images = count, "Image sources rewritten");
            }
            body = rewritten;
        }

        let intro = if post.excerpt.trim().is_empty() {
            extract_excerpt(&body, EXCERPT_MAX_CHARS)
        } else {
            extract_excerpt(&post.excerpt, EXCERPT_MAX_CHARS)
        };

        let page: NewPage = match post.kind {
            PostKind::Post => {
                let publication_date = match post.created_at {
                    Some(created) => created.date(),
                    None => {
                        info!(
                            post_id = post.id,
                            date = %self.config.run_date,
                            "Using run date as publication date"
                        );
                        self.config.run_date
                    }
                };
                let (category_refs, tag_refs) = self.taxonomy_refs(dataset, post.id);
                let cover_asset = self.cover_asset(dataset, post)?;
                Article {
                    title: post.title.clone(),
                    slug: prepared.slug.clone(),
                    publication_date,
                    intro,
                    body,
                    category_refs,
                    tag_refs,
                    cover_asset,
                    legacy_id: post.id,
                }
                .into()
            }
            _ => {
                let seo = build_seo(
                    &post.title,
                    &body,
                    &intro,
                    dataset.post_meta(post.id, YOAST_DESCRIPTION_META_KEY),
                    dataset.post_meta(post.id, YOAST_FOCUS_KEYWORD_META_KEY),
                );
                StandardPage {
                    title: post.title.clone(),
                    slug: prepared.slug.clone(),
                    intro,
                    reading_time: reading_time(&body),
                    body,
                    seo,
                    legacy_id: post.id,
                }
                .into()
            }
        };

        if !self.config.dry_run {
            let created = match self.cms.add_child(&prepared.parent, page) {
                Ok(created) => created,
                Err(e) if e.downcast_ref::<DuplicateSlug>().is_some() => {
                    self.stats.inc_skipped();
                    warn!(post_id = post.id, error = %e, "SKIPPED: slug already taken");
                    return Ok(());
                }
                Err(e) => {
                    self.record_error(stage, &post.id.to_string(), format!("{e:#}"));
                    return Ok(());
                }
            };
            if let Err(e) = self.cms.publish(&created) {
                self.record_error(stage, &created.url_path, format!("{e:#}"));
            }
        }

        match post.kind {
            PostKind::Post => self.stats.inc_posts(),
            _ => self.stats.inc_pages(),
        }
        self.claimed.insert(
            (prepared.parent.id, prepared.slug.clone()),
            post.title.clone(),
        );
        debug!(
            post_id = post.id,
            path = %prepared.new_path,
            dry_run = self.config.dry_run,
            "Entity created"
        );

        self.finish_entity(&prepared, stage);
        Ok(())
    }

    /// Redirect (unless it would point at itself) and URL mapping.
    fn finish_entity(&mut self, prepared: &Prepared, stage: ErrorStage) {
        if prepared.legacy_path != prepared.new_path {
            if self.config.dry_run {
                if !self
                    .cms
                    .redirect_exists(&prepared.legacy_path, &self.config.site)
                    && self.urlmap.lookup(&prepared.legacy_path) != Some(prepared.new_path.as_str())
                {
                    self.stats.inc_redirects();
                }
            } else {
                match self.cms.create_redirect(
                    &prepared.legacy_path,
                    &prepared.new_path,
                    true,
                    &self.config.site,
                ) {
                    Ok(true) => self.stats.inc_redirects(),
                    Ok(false) => {
                        debug!(old = %prepared.legacy_path, "Redirect already exists")
                    }
                    Err(e) => {
                        self.record_error(stage, &prepared.legacy_path, format!("{e:#}"));
                        return;
                    }
                }
            }
        }
        self.urlmap.add(&prepared.legacy_path, &prepared.new_path);
    }

    fn taxonomy_refs(&self, dataset: &WpDataset, post_id: u64) -> (Vec<CategoryRef>, Vec<TagRef>) {
        let mut categories: Vec<CategoryRef> = Vec::new();
        let mut tags: Vec<TagRef> = Vec::new();
        let Some(taxonomy_ids) = dataset.relationships.get(&post_id) else {
            return (categories, tags);
        };
        for id in taxonomy_ids {
            if let Some(category) = self.categories.get(id) {
                if !categories.iter().any(|c| c.slug == category.slug) {
                    categories.push(category.clone());
                }
            } else if let Some(tag) = self.tags.get(id) {
                if !tags.iter().any(|t| t.slug == tag.slug) {
                    tags.push(tag.clone());
                }
            }
        }
        (categories, tags)
    }

    fn cover_asset(&mut self, dataset: &WpDataset, post: &Post) -> Result<Option<ImageHandle>> {
        if self.config.dry_run {
            return Ok(None);
        }
        let Some(attachment) = dataset
            .post_meta(post.id, THUMBNAIL_META_KEY)
            .and_then(|id| id.trim().parse::<u64>().ok())
            .and_then(|id| dataset.attachments.get(&id))
        else {
            return Ok(None);
        };
        let title = Some(attachment.title.as_str()).filter(|t| !t.is_empty());
        self.downloader
            .resolve(&attachment.url, title, &mut *self.cms)
    }
}
