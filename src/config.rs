/// Smallest accepted image, in bytes
pub const MIN_ASSET_BYTES: u64 = 1024;

/// Largest accepted image, in bytes (10 MiB)
pub const MAX_ASSET_BYTES: u64 = 10 * 1024 * 1024;

/// HEAD request timeout in seconds
pub const PROBE_TIMEOUT_SECS: u64 = 10;

/// GET request timeout in seconds
pub const FETCH_TIMEOUT_SECS: u64 = 30;

/// Maximum redirects followed by the HTTP client
pub const MAX_HTTP_REDIRECTS: usize = 10;

pub const ALLOWED_IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp", ".svg"];

pub const ALLOWED_IMAGE_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/svg+xml",
];

/// Storage prefix for every migrated image
pub const IMAGE_STORAGE_PREFIX: &str = "migrated_images";

/// Page slugs that are never imported as standard pages
pub const RESERVED_PAGE_SLUGS: &[&str] = &["home", "index", "pagina-inicial"];

pub const DEFAULT_TABLE_PREFIX: &str = "wp_";
pub const DEFAULT_BLOG_SLUG: &str = "blog";
pub const DEFAULT_HOME_SLUG: &str = "home";
pub const DEFAULT_SITE: &str = "default";

pub const URL_MAPPINGS_FILE: &str = "url_mappings.json";
pub const REPORT_FILE: &str = "migration_report.json";
pub const REDIRECTS_FILE: &str = "redirects.txt";
pub const LOG_FILE: &str = "migration.log";
pub const DEFAULT_STORE_FILE: &str = "cms_store.json";

/// Intro/excerpt length in characters
pub const EXCERPT_MAX_CHARS: usize = 250;

/// Meta description length in characters
pub const META_DESCRIPTION_MAX_CHARS: usize = 160;

pub const META_KEYWORDS_MAX: usize = 10;
pub const KEYWORD_MIN_CHARS: usize = 4;

pub const READING_WORDS_PER_MINUTE: usize = 200;
pub const READING_TIME_MIN: u32 = 1;
pub const READING_TIME_MAX: u32 = 60;

/// How many error entries the end-of-run summary prints
pub const SUMMARY_ERROR_LINES: usize = 10;
