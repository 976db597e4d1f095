use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;
use wp2cms::assets::{AssetLimits, HttpFetcher};
use wp2cms::cms::ContentStore;
use wp2cms::config::{
    DEFAULT_BLOG_SLUG, DEFAULT_HOME_SLUG, DEFAULT_SITE, DEFAULT_STORE_FILE, DEFAULT_TABLE_PREFIX,
    FETCH_TIMEOUT_SECS, LOG_FILE, PROBE_TIMEOUT_SECS, SUMMARY_ERROR_LINES,
};
use wp2cms::extract::Extractor;
use wp2cms::import::Scope;
use wp2cms::models::PostKind;
use wp2cms::pipeline::{run_migration, MigrationOptions, RunSummary, EXIT_INTERRUPTED};
use wp2cms::storage::FsStorage;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const USER_AGENT: &str = concat!("wp2cms/", env!("CARGO_PKG_VERSION"));

#[derive(Parser)]
#[command(name = "wp2cms", version)]
#[command(about = "Migrate a WordPress SQL dump into a CMS content tree")]
#[command(args_conflicts_with_subcommands = true, subcommand_negates_reqs = true)]
struct Cli {
    /// Log verbosity
    #[arg(long, value_enum, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    migrate: MigrateArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the site root and blog index in the content store
    Seed(SeedArgs),
    /// Extract a dump and print what it contains, without migrating
    Inspect(InspectArgs),
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    #[value(name = "DEBUG", alias = "debug")]
    Debug,
    #[value(name = "INFO", alias = "info")]
    Info,
    #[value(name = "WARNING", aliases = ["warning", "WARN", "warn"])]
    Warning,
    #[value(name = "ERROR", alias = "error")]
    Error,
}

impl LogLevel {
    fn level(self) -> Level {
        match self {
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warning => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[derive(Args)]
struct MigrateArgs {
    /// Path to the SQL dump (.sql or .sql.bz2)
    #[arg(long, required = true)]
    source: Option<PathBuf>,

    /// Simulate the run: nothing is created, downloaded or written except the report
    #[arg(long)]
    dry_run: bool,

    /// Only migrate posts
    #[arg(long, conflicts_with_all = ["pages_only", "media_only"])]
    posts_only: bool,

    /// Only migrate pages
    #[arg(long, conflicts_with = "media_only")]
    pages_only: bool,

    /// Only download image attachments
    #[arg(long)]
    media_only: bool,

    /// Write nginx rewrite rules to redirects.txt
    #[arg(long)]
    create_redirects: bool,

    /// Stop after this many posts and pages (for debugging)
    #[arg(long)]
    max_posts: Option<u64>,

    /// Directory for the report, URL mappings, redirects and log
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// JSON file backing the content store
    #[arg(long, default_value = DEFAULT_STORE_FILE)]
    store: PathBuf,

    /// Directory where stored images are written
    #[arg(long, default_value = "media")]
    media_root: PathBuf,

    /// Public URL prefix of stored images
    #[arg(long, default_value = "/media/")]
    media_url: String,

    /// Slug of the blog index page
    #[arg(long, default_value = DEFAULT_BLOG_SLUG)]
    blog_slug: String,

    /// Slug of the site root page
    #[arg(long, default_value = DEFAULT_HOME_SLUG)]
    home_slug: String,

    /// Site the redirects belong to
    #[arg(long, default_value = DEFAULT_SITE)]
    site: String,

    /// Legacy site URL, recorded in the report
    #[arg(long)]
    source_url: Option<String>,

    /// WordPress table prefix
    #[arg(long, default_value = DEFAULT_TABLE_PREFIX)]
    table_prefix: String,

    /// User agent for image requests
    #[arg(long, default_value = USER_AGENT)]
    user_agent: String,

    /// HEAD request timeout in seconds
    #[arg(long, default_value_t = PROBE_TIMEOUT_SECS)]
    probe_timeout: u64,

    /// Image download timeout in seconds
    #[arg(long, default_value_t = FETCH_TIMEOUT_SECS)]
    fetch_timeout: u64,

    /// Abort when more than this percentage of a table's tuples are malformed
    #[arg(long)]
    max_malformed_pct: Option<f64>,

    /// Disable the progress bar
    #[arg(long)]
    no_progress: bool,
}

impl MigrateArgs {
    fn scope(&self) -> Scope {
        if self.posts_only {
            Scope::PostsOnly
        } else if self.pages_only {
            Scope::PagesOnly
        } else if self.media_only {
            Scope::MediaOnly
        } else {
            Scope::All
        }
    }
}

#[derive(Args)]
struct SeedArgs {
    /// JSON file backing the content store
    #[arg(long, default_value = DEFAULT_STORE_FILE)]
    store: PathBuf,

    #[arg(long, default_value = "media")]
    media_root: PathBuf,

    #[arg(long, default_value = "/media/")]
    media_url: String,

    #[arg(long, default_value = DEFAULT_HOME_SLUG)]
    home_slug: String,

    #[arg(long, default_value = DEFAULT_BLOG_SLUG)]
    blog_slug: String,
}

#[derive(Args)]
struct InspectArgs {
    /// Path to the SQL dump (.sql or .sql.bz2)
    #[arg(long)]
    source: PathBuf,

    #[arg(long, default_value = DEFAULT_TABLE_PREFIX)]
    table_prefix: String,
}

fn init_logging(level: Level, log_file: Option<&Path>) -> Result<()> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::from_level(level));

    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file: {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(LevelFilter::from_level(level.max(Level::INFO))),
            )
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
    Ok(())
}

/// Sets `cancel` on the first Ctrl-C; a second one exits immediately.
fn install_interrupt_handler(cancel: Arc<AtomicBool>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;

    std::thread::Builder::new()
        .name("wp2cms-signal".to_string())
        .spawn(move || {
            rt.block_on(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                warn!("Interrupt received, stopping after the current entity");
                cancel.store(true, Ordering::Relaxed);

                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Interrupted again, exiting");
                    std::process::exit(i32::from(EXIT_INTERRUPTED));
                }
            });
        })
        .context("Failed to spawn signal thread")?;
    Ok(())
}

fn open_store(path: &Path, media_root: &Path, media_url: &str) -> Result<ContentStore> {
    ContentStore::open(path, Box::new(FsStorage::new(media_root, media_url)))
}

fn run_migrate(args: MigrateArgs) -> Result<RunSummary> {
    let source = args
        .source
        .clone()
        .context("--source is required")?;

    let cancel = Arc::new(AtomicBool::new(false));
    install_interrupt_handler(Arc::clone(&cancel))?;

    let mut store = open_store(&args.store, &args.media_root, &args.media_url)?;
    let fetcher = HttpFetcher::new(&args.user_agent)?;

    let opts = MigrationOptions {
        source,
        output_dir: args.output_dir.clone(),
        dry_run: args.dry_run,
        scope: args.scope(),
        create_redirects: args.create_redirects,
        max_posts: args.max_posts,
        table_prefix: args.table_prefix.clone(),
        site: args.site.clone(),
        home_slug: args.home_slug.clone(),
        blog_slug: args.blog_slug.clone(),
        source_url: args.source_url.clone(),
        limits: AssetLimits {
            probe_timeout: Duration::from_secs(args.probe_timeout),
            fetch_timeout: Duration::from_secs(args.fetch_timeout),
            ..AssetLimits::default()
        },
        max_malformed_pct: args.max_malformed_pct,
        show_progress: !args.no_progress,
    };

    let summary = run_migration(&opts, &mut store, Box::new(fetcher), &cancel)?;

    if !opts.dry_run {
        store.save()?;
    }
    print_summary(&summary, &args.store, opts.dry_run);
    Ok(summary)
}

fn print_summary(summary: &RunSummary, store_path: &Path, dry_run: bool) {
    let stats = &summary.stats;
    println!();
    println!("=== Summary ===");
    if dry_run {
        println!("Mode:                DRY RUN (nothing was written to the CMS)");
    }
    println!("Posts imported:      {}", stats.posts_imported);
    println!("Pages imported:      {}", stats.pages_imported);
    println!("Categories created:  {}", stats.categories_created);
    println!("Tags created:        {}", stats.tags_created);
    println!("Images downloaded:   {}", stats.images_downloaded);
    println!("Redirects created:   {}", stats.redirects_created);
    println!("URL mappings:        {}", stats.url_mappings_count);
    println!("Skipped duplicates:  {}", stats.skipped_duplicates);
    println!("Errors:              {}", stats.errors);
    println!("Total time:          {:.2}s", stats.execution_time_s);

    if summary.interrupted {
        println!();
        println!("Run interrupted; re-run to continue where it stopped.");
    }
    if let Some(fatal) = &summary.fatal {
        println!();
        println!("Aborted: {fatal}");
    }

    if !summary.errors.is_empty() {
        println!();
        println!(
            "Errors (showing {} of {}):",
            summary.errors.len().min(SUMMARY_ERROR_LINES),
            summary.errors.len()
        );
        for entry in summary.errors.iter().take(SUMMARY_ERROR_LINES) {
            println!("  [{:?}] {}: {}", entry.stage, entry.subject, entry.message);
        }
    }

    println!();
    println!("Artifacts:");
    for path in &summary.artifacts {
        println!("  {}", path.display());
    }
    if !dry_run {
        println!("  {}", store_path.display());
    }
}

fn run_seed(args: SeedArgs) -> Result<()> {
    let mut store = open_store(&args.store, &args.media_root, &args.media_url)?;
    let (home, blog) = store.seed_site(&args.home_slug, &args.blog_slug)?;
    store.save()?;

    println!("Site root:   {} ({})", home.url_path, home.slug);
    println!("Blog index:  {} ({})", blog.url_path, blog.slug);
    println!("Store:       {}", args.store.display());
    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    let text = wp2cms::dump::read_dump(&args.source)?;
    let (dataset, report) = Extractor::new(&args.table_prefix).extract(&text)?;

    let posts = dataset
        .posts
        .iter()
        .filter(|p| p.kind == PostKind::Post)
        .count();
    let pages = dataset
        .posts
        .iter()
        .filter(|p| p.kind == PostKind::Page)
        .count();

    println!();
    println!("=== Dump ===");
    for (table, table_report) in &report.tables {
        println!(
            "{:<24} {:>8} tuples  {:>6} malformed",
            table, table_report.tuples, table_report.malformed
        );
    }
    println!();
    println!("Posts:               {posts}");
    println!("Pages:               {pages}");
    println!("Filtered rows:       {}", report.filtered_posts);
    println!("Image attachments:   {}", dataset.attachments.len());
    println!("Terms:               {}", dataset.terms.len());
    println!("Taxonomy entries:    {}", dataset.taxonomy.len());
    println!("Posts with meta:     {}", dataset.meta.len());
    println!("Unparsed dates:      {}", report.unparsed_dates);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = cli.log_level.level();

    let log_file = match &cli.command {
        None => {
            if let Err(e) = fs::create_dir_all(&cli.migrate.output_dir) {
                eprintln!(
                    "Error: Failed to create output directory {}: {e}",
                    cli.migrate.output_dir.display()
                );
                return ExitCode::FAILURE;
            }
            Some(cli.migrate.output_dir.join(LOG_FILE))
        }
        Some(_) => None,
    };

    if let Err(e) = init_logging(level, log_file.as_deref()) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Some(Commands::Seed(args)) => run_seed(args).map(|()| 0),
        Some(Commands::Inspect(args)) => run_inspect(args).map(|()| 0),
        None => run_migrate(cli.migrate).map(|summary| summary.exit_code()),
    };

    match result {
        Ok(0) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
