use crate::assets::{AssetDownloader, AssetLimits, Fetcher};
use crate::cms::Cms;
use crate::config::{
    DEFAULT_BLOG_SLUG, DEFAULT_HOME_SLUG, DEFAULT_SITE, DEFAULT_TABLE_PREFIX, REDIRECTS_FILE,
    REPORT_FILE, URL_MAPPINGS_FILE,
};
use crate::dump::read_dump;
use crate::extract::Extractor;
use crate::import::{load, LoadContext, LoadOutcome, LoaderConfig, Scope};
use crate::report::{write_redirects, write_report, ErrorEntry, ErrorLog, ErrorStage, MigrationReport};
use crate::stats::{MigrationStats, StatsSnapshot};
use crate::urlmap::UrlMapper;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{error, info, warn};

/// Exit code when the run was interrupted by the operator
pub const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub source: PathBuf,
    pub output_dir: PathBuf,
    pub dry_run: bool,
    pub scope: Scope,
    pub create_redirects: bool,
    pub max_posts: Option<u64>,
    pub table_prefix: String,
    pub site: String,
    pub home_slug: String,
    pub blog_slug: String,
    /// Recorded in the report; defaults to the dump path
    pub source_url: Option<String>,
    pub limits: AssetLimits,
    pub max_malformed_pct: Option<f64>,
    pub show_progress: bool,
}

impl MigrationOptions {
    pub fn new(source: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output_dir: output_dir.into(),
            dry_run: false,
            scope: Scope::All,
            create_redirects: false,
            max_posts: None,
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            site: DEFAULT_SITE.to_string(),
            home_slug: DEFAULT_HOME_SLUG.to_string(),
            blog_slug: DEFAULT_BLOG_SLUG.to_string(),
            source_url: None,
            limits: AssetLimits::default(),
            max_malformed_pct: None,
            show_progress: false,
        }
    }
}

/// What a finished (or aborted) run leaves behind.
#[derive(Debug)]
pub struct RunSummary {
    pub stats: StatsSnapshot,
    pub interrupted: bool,
    /// The error that aborted the run, if any
    pub fatal: Option<String>,
    pub errors: Vec<ErrorEntry>,
    /// Files written to the output directory
    pub artifacts: Vec<PathBuf>,
}

impl RunSummary {
    /// 130 if interrupted, 1 on a fatal error or any recorded error, else 0.
    pub fn exit_code(&self) -> u8 {
        if self.interrupted {
            EXIT_INTERRUPTED
        } else if self.fatal.is_some() || self.stats.errors > 0 {
            1
        } else {
            0
        }
    }
}

/// Runs extraction and loading, then writes the artifacts whether or not the
/// run completed. Fatal failures end up in `RunSummary::fatal`; the returned
/// error is reserved for failures to read the previous URL map or to write
/// the artifacts themselves.
pub fn run_migration(
    opts: &MigrationOptions,
    cms: &mut dyn Cms,
    fetcher: Box<dyn Fetcher>,
    cancel: &AtomicBool,
) -> Result<RunSummary> {
    let start = Instant::now();
    fs::create_dir_all(&opts.output_dir).with_context(|| {
        format!(
            "Failed to create output directory: {}",
            opts.output_dir.display()
        )
    })?;

    let mappings_path = opts.output_dir.join(URL_MAPPINGS_FILE);
    let mut urlmap = UrlMapper::load(&mappings_path)?;
    if !urlmap.is_empty() {
        info!(mappings = urlmap.len(), "Extending URL mappings from a previous run");
    }

    let stats = MigrationStats::new();
    let mut errors = ErrorLog::new();
    let mut downloader = AssetDownloader::new(fetcher, opts.limits);

    info!(
        source = %opts.source.display(),
        dry_run = opts.dry_run,
        scope = ?opts.scope,
        "Starting migration"
    );

    let result = execute(
        opts,
        LoadContext {
            cms,
            downloader: &mut downloader,
            urlmap: &mut urlmap,
            stats: &stats,
            errors: &mut errors,
            cancel,
        },
    );

    let (interrupted, fatal, unknown_shortcodes) = match result {
        Ok(outcome) => (outcome.interrupted, None, outcome.unknown_shortcodes),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Migration aborted");
            (false, Some(format!("{e:#}")), Vec::new())
        }
    };

    let mut rejected_images: Vec<String> = downloader
        .references()
        .filter(|r| r.local_handle.is_none())
        .map(|r| r.original_url.clone())
        .collect();
    rejected_images.sort_unstable();
    if !rejected_images.is_empty() {
        warn!(count = rejected_images.len(), "Some images were not migrated and keep their original URL");
    }

    stats.set_url_mappings(urlmap.len() as u64);
    let snapshot = stats.snapshot(start.elapsed().as_secs_f64());

    let mut artifacts = Vec::new();
    let report_path = opts.output_dir.join(REPORT_FILE);
    write_report(
        &report_path,
        &MigrationReport {
            migration_date: Utc::now(),
            source_url: opts
                .source_url
                .clone()
                .unwrap_or_else(|| opts.source.display().to_string()),
            dry_run: opts.dry_run,
            interrupted,
            stats: snapshot.clone(),
            url_mappings_count: snapshot.url_mappings_count,
            downloaded_images: snapshot.images_downloaded,
            errors: errors.entries().to_vec(),
            fatal_error: fatal.clone(),
            rejected_images,
            unknown_shortcodes,
        },
    )?;
    artifacts.push(report_path);

    if opts.dry_run {
        info!("Dry run, URL mappings and redirects not written");
    } else {
        urlmap.dump(&mappings_path)?;
        artifacts.push(mappings_path);

        if opts.create_redirects {
            let redirects_path = opts.output_dir.join(REDIRECTS_FILE);
            write_redirects(&redirects_path, &urlmap)?;
            artifacts.push(redirects_path);
        }
    }

    if !errors.is_empty() {
        warn!(entries = errors.len(), "Record-level errors were logged, see the report");
    }
    info!(
        duration_secs = snapshot.execution_time_s,
        errors = snapshot.errors,
        interrupted,
        "Migration finished"
    );

    Ok(RunSummary {
        stats: snapshot,
        interrupted,
        fatal,
        errors: errors.entries().to_vec(),
        artifacts,
    })
}

fn execute(opts: &MigrationOptions, mut ctx: LoadContext<'_>) -> Result<LoadOutcome> {
    let text = read_dump(&opts.source)?;
    let (dataset, report) = Extractor::new(&opts.table_prefix)
        .with_max_malformed_pct(opts.max_malformed_pct)
        .extract(&text)?;
    drop(text);

    ctx.stats.add_errors(report.malformed());
    for issue in &report.issues {
        ctx.errors.push(ErrorStage::Extract, opts.source.display().to_string(), issue.as_str());
    }
    if report.unparsed_dates > 0 {
        info!(posts = report.unparsed_dates, "Posts without a usable date will use the run date");
    }
    info!(
        posts = dataset.posts.len(),
        attachments = dataset.attachments.len(),
        terms = dataset.terms.len(),
        taxonomies = dataset.taxonomy.len(),
        filtered = report.filtered_posts,
        malformed = report.malformed(),
        "Dump extracted"
    );

    if ctx.cancel.load(Ordering::Relaxed) {
        warn!("Interrupted before loading");
        return Ok(LoadOutcome {
            interrupted: true,
            ..LoadOutcome::default()
        });
    }

    let config = LoaderConfig {
        home_slug: opts.home_slug.clone(),
        blog_slug: opts.blog_slug.clone(),
        site: opts.site.clone(),
        dry_run: opts.dry_run,
        scope: opts.scope,
        max_posts: opts.max_posts,
        show_progress: opts.show_progress,
        run_date: Utc::now().date_naive(),
    };
    load(&dataset, &config, ctx)
}
