//! End-to-end tests for the migration pipeline.
//!
//! Every test builds a small WordPress dump with `format_insert`, writes it to a
//! TempDir and runs `run_migration` against an in-memory `ContentStore` and a
//! stub fetcher that serves images from a fixed table (no network).
//!
//! # Sample Data
//!
//! `sample_dump()` contains:
//! - 1 post "Hello" (`hello`) in category "News" and tag "Rust", with a captioned
//!   image and a featured image (`_thumbnail_id`)
//! - 1 page "About" (`about`) with a Yoast meta description
//! - 1 page "Home" (`home`), which is reserved and never imported
//! - 1 draft post, which is filtered out
//! - 1 image attachment used as the cover

use bzip2::write::BzEncoder;
use bzip2::Compression;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tempfile::TempDir;
use wp2cms::assets::{Fetcher, RemoteHead};
use wp2cms::cms::ContentStore;
use wp2cms::config::{REDIRECTS_FILE, REPORT_FILE, URL_MAPPINGS_FILE};
use wp2cms::import::Scope;
use wp2cms::models::PageContent;
use wp2cms::pipeline::{run_migration, MigrationOptions, RunSummary};
use wp2cms::sql::{format_insert, SqlValue};
use wp2cms::storage::MemoryStorage;
use wp2cms::urlmap::UrlMapper;

const INLINE_IMAGE: &str = "http://ex.example/uploads/a.jpg";
const COVER_IMAGE: &str = "http://ex.example/uploads/cover.png";
const HUGE_IMAGE: &str = "http://ex.example/uploads/huge.png";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct StubFetcher {
    images: HashMap<String, (RemoteHead, Vec<u8>)>,
}

impl StubFetcher {
    fn new() -> Self {
        let mut images = HashMap::new();
        images.insert(INLINE_IMAGE.to_string(), image("image/jpeg", jpeg_bytes()));
        images.insert(COVER_IMAGE.to_string(), image("image/png", png_bytes()));
        images.insert(
            HUGE_IMAGE.to_string(),
            (
                RemoteHead {
                    content_type: Some("image/png".to_string()),
                    content_length: Some(20 * 1024 * 1024),
                },
                png_bytes(),
            ),
        );
        Self { images }
    }
}

impl Fetcher for StubFetcher {
    fn head(&self, url: &str, _timeout: Duration) -> anyhow::Result<RemoteHead> {
        match self.images.get(url) {
            Some((head, _)) => Ok(head.clone()),
            None => anyhow::bail!("404 for {url}"),
        }
    }

    fn get(&self, url: &str, _timeout: Duration, _max_bytes: u64) -> anyhow::Result<Vec<u8>> {
        match self.images.get(url) {
            Some((_, body)) => Ok(body.clone()),
            None => anyhow::bail!("404 for {url}"),
        }
    }
}

fn image(mime: &str, body: Vec<u8>) -> (RemoteHead, Vec<u8>) {
    (
        RemoteHead {
            content_type: Some(mime.to_string()),
            content_length: Some(body.len() as u64),
        },
        body,
    )
}

fn jpeg_bytes() -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
    bytes.resize(4096, 0);
    bytes
}

fn png_bytes() -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.resize(4096, 0);
    bytes
}

#[allow(clippy::too_many_arguments)]
fn post_row(
    id: i64,
    content: &str,
    title: &str,
    excerpt: &str,
    status: &str,
    slug: &str,
    post_type: &str,
    guid: &str,
    mime: &str,
) -> Vec<SqlValue> {
    let date = "2023-03-09 12:00:00";
    vec![
        SqlValue::Int(id),
        SqlValue::Int(1),
        date.into(),
        date.into(),
        content.into(),
        title.into(),
        excerpt.into(),
        status.into(),
        "open".into(),
        "open".into(),
        "".into(),
        slug.into(),
        "".into(),
        "".into(),
        date.into(),
        date.into(),
        "".into(),
        SqlValue::Int(0),
        guid.into(),
        SqlValue::Int(0),
        post_type.into(),
        mime.into(),
        SqlValue::Int(0),
    ]
}

fn post(id: i64, content: &str, title: &str, slug: &str, post_type: &str) -> Vec<SqlValue> {
    let guid = format!("http://old.example/?p={id}");
    post_row(id, content, title, "", "publish", slug, post_type, &guid, "")
}

fn sample_dump() -> String {
    let body = format!(
        r#"<p>Intro text</p>[caption id="1"]<img src="{INLINE_IMAGE}"/> c[/caption]<script>alert(1)</script>"#
    );
    let mut dump = String::from("-- MySQL dump\nSET NAMES utf8mb4;\n");
    dump += &format_insert(
        "wp_posts",
        &[
            post(1, &body, "Hello", "hello", "post"),
            post(2, "<p>Who we are.</p>", "About", "about", "page"),
            post(3, "<p>Welcome</p>", "Home", "home", "page"),
            post_row(
                4,
                "<p>Not yet</p>",
                "Draft",
                "",
                "draft",
                "draft",
                "post",
                "",
                "",
            ),
            post_row(
                9,
                "",
                "Cover",
                "",
                "inherit",
                "cover",
                "attachment",
                COVER_IMAGE,
                "image/png",
            ),
        ],
    );
    dump += &format_insert(
        "wp_terms",
        &[
            vec![SqlValue::Int(5), "News".into(), "news".into(), SqlValue::Int(0)],
            vec![SqlValue::Int(6), "Rust".into(), "rust".into(), SqlValue::Int(0)],
        ],
    );
    dump += &format_insert(
        "wp_term_taxonomy",
        &[
            vec![
                SqlValue::Int(50),
                SqlValue::Int(5),
                "category".into(),
                "".into(),
                SqlValue::Int(0),
                SqlValue::Int(1),
            ],
            vec![
                SqlValue::Int(60),
                SqlValue::Int(6),
                "post_tag".into(),
                "".into(),
                SqlValue::Int(0),
                SqlValue::Int(1),
            ],
        ],
    );
    dump += &format_insert(
        "wp_term_relationships",
        &[
            vec![SqlValue::Int(1), SqlValue::Int(50), SqlValue::Int(0)],
            vec![SqlValue::Int(1), SqlValue::Int(60), SqlValue::Int(0)],
        ],
    );
    dump += &format_insert(
        "wp_postmeta",
        &[
            vec![
                SqlValue::Int(100),
                SqlValue::Int(1),
                "_thumbnail_id".into(),
                "9".into(),
            ],
            vec![
                SqlValue::Int(101),
                SqlValue::Int(2),
                "_yoast_wpseo_metadesc".into(),
                "All about the team".into(),
            ],
        ],
    );
    dump
}

fn seeded_store() -> ContentStore {
    let mut store = ContentStore::in_memory(Box::new(MemoryStorage::new("/media/")));
    store.seed_site("home", "blog").unwrap();
    store
}

fn write_dump(dir: &Path, dump: &str) -> std::path::PathBuf {
    let path = dir.join("dump.sql");
    fs::write(&path, dump).unwrap();
    path
}

fn migrate(opts: &MigrationOptions, store: &mut ContentStore) -> RunSummary {
    let cancel = AtomicBool::new(false);
    run_migration(opts, store, Box::new(StubFetcher::new()), &cancel).unwrap()
}

fn article<'a>(store: &'a ContentStore, path: &str) -> &'a wp2cms::models::Article {
    match &store.page_by_path(path).unwrap().content {
        PageContent::Article(article) => article,
        other => panic!("expected an article at {path}, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_minimal_post() {
    let dir = TempDir::new().unwrap();
    let dump = format_insert(
        "wp_posts",
        &[post(1, "<p>Hi</p>", "Hello", "hello", "post")],
    ) + &format_insert(
        "wp_terms",
        &[vec![SqlValue::Int(5), "News".into(), "news".into(), SqlValue::Int(0)]],
    ) + &format_insert(
        "wp_term_taxonomy",
        &[vec![
            SqlValue::Int(50),
            SqlValue::Int(5),
            "category".into(),
            "".into(),
            SqlValue::Int(0),
            SqlValue::Int(1),
        ]],
    ) + &format_insert(
        "wp_term_relationships",
        &[vec![SqlValue::Int(1), SqlValue::Int(50), SqlValue::Int(0)]],
    );
    let opts = MigrationOptions::new(write_dump(dir.path(), &dump), dir.path());
    let mut store = seeded_store();

    let summary = migrate(&opts, &mut store);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.stats.posts_imported, 1);
    assert_eq!(summary.stats.categories_created, 1);
    assert_eq!(summary.stats.redirects_created, 1);

    let hello = store.page_by_path("/blog/hello/").unwrap();
    assert!(hello.live);
    assert_eq!(article(&store, "/blog/hello/").body, "<p>Hi</p>");

    assert_eq!(store.categories().len(), 1);
    assert_eq!(store.categories()[0].name, "News");
    assert_eq!(store.redirects().len(), 1);
    assert_eq!(store.redirects()[0].old_path, "/hello/");
    assert_eq!(store.redirects()[0].new_path, "/blog/hello/");
    assert!(store.redirects()[0].is_permanent);
}

#[test]
fn test_duplicate_slug_is_skipped() {
    let dir = TempDir::new().unwrap();
    let dump = format_insert(
        "wp_posts",
        &[
            post(1, "<p>First</p>", "Foo", "foo", "post"),
            post(2, "<p>Second</p>", "Another foo", "foo", "post"),
        ],
    );
    let opts = MigrationOptions::new(write_dump(dir.path(), &dump), dir.path());
    let mut store = seeded_store();

    let summary = migrate(&opts, &mut store);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.stats.posts_imported, 1);
    assert_eq!(summary.stats.skipped_duplicates, 1);
    assert_eq!(article(&store, "/blog/foo/").title, "Foo");

    let report: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(dir.path().join(REPORT_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(report["stats"]["skipped_duplicates"], 1);
    assert_eq!(report["stats"]["errors"], 0);
}

#[test]
fn test_full_dump_migration() {
    let dir = TempDir::new().unwrap();
    let mut opts = MigrationOptions::new(write_dump(dir.path(), &sample_dump()), dir.path());
    opts.create_redirects = true;
    opts.source_url = Some("https://old.example".to_string());
    let mut store = seeded_store();

    let summary = migrate(&opts, &mut store);
    assert_eq!(summary.exit_code(), 0, "errors: {:?}", summary.errors);
    assert_eq!(summary.stats.posts_imported, 1);
    assert_eq!(summary.stats.pages_imported, 1);
    assert_eq!(summary.stats.categories_created, 1);
    assert_eq!(summary.stats.tags_created, 1);
    assert_eq!(summary.stats.images_downloaded, 2);
    assert_eq!(summary.stats.redirects_created, 1);
    assert_eq!(summary.stats.url_mappings_count, 2);

    // Caption expanded, script stripped, image re-hosted.
    let hello = article(&store, "/blog/hello/");
    assert!(!hello.body.contains("[caption"));
    assert!(!hello.body.contains("<script"));
    assert!(!hello.body.contains(INLINE_IMAGE));
    assert!(hello.body.contains(r#"src="/media/migrated_images/wp_"#));
    assert!(hello.body.contains(" c"));
    assert_eq!(hello.intro, "Intro text c");
    assert_eq!(hello.category_refs.len(), 1);
    assert_eq!(hello.category_refs[0].slug, "news");
    assert_eq!(hello.tag_refs[0].slug, "rust");
    assert_eq!(hello.cover_asset.as_ref().unwrap().title, "Cover");
    assert_eq!(hello.legacy_id, 1);

    // Pages live under the site root; the reserved home page is not imported.
    match &store.page_by_path("/about/").unwrap().content {
        PageContent::StandardPage(page) => {
            assert_eq!(page.seo.description, "All about the team");
            assert_eq!(page.reading_time, 1);
        }
        other => panic!("expected a standard page, got {other:?}"),
    }
    assert!(store.page_by_path("/home/").is_none());
    assert_eq!(store.images().len(), 2);

    // Artifacts
    let mapper = UrlMapper::load(&dir.path().join(URL_MAPPINGS_FILE)).unwrap();
    assert_eq!(mapper.lookup("/hello/"), Some("/blog/hello/"));
    assert_eq!(mapper.lookup("/about/"), Some("/about/"));
    for (old, new) in mapper.iter() {
        assert_eq!(mapper.reverse(new), Some(old));
    }

    assert_eq!(
        fs::read_to_string(dir.path().join(REDIRECTS_FILE)).unwrap(),
        "rewrite ^/hello/$ /blog/hello/ permanent;\n"
    );

    let report: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(dir.path().join(REPORT_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(report["source_url"], "https://old.example");
    assert_eq!(report["dry_run"], false);
    assert_eq!(report["downloaded_images"], 2);
    assert_eq!(report["url_mappings_count"], 2);
    assert!(report["migration_date"].is_string());
    assert_eq!(summary.artifacts.len(), 3);
}

#[test]
fn test_oversized_image_keeps_original_src() {
    let dir = TempDir::new().unwrap();
    let body = format!(r#"<p>Big</p><img src="{HUGE_IMAGE}">"#);
    let dump = format_insert("wp_posts", &[post(1, &body, "Big", "big", "post")]);
    let opts = MigrationOptions::new(write_dump(dir.path(), &dump), dir.path());
    let mut store = seeded_store();

    let summary = migrate(&opts, &mut store);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.stats.images_downloaded, 0);
    assert!(article(&store, "/blog/big/").body.contains(HUGE_IMAGE));
    assert!(store.images().is_empty());

    let report: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(dir.path().join(REPORT_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(report["rejected_images"], serde_json::json!([HUGE_IMAGE]));
}

#[test]
fn test_percent_encoded_slug_redirect_is_decoded() {
    let dir = TempDir::new().unwrap();
    let dump = format_insert(
        "wp_posts",
        &[post(1, "<p>Oi</p>", "Olá", "ol%c3%a1", "post")],
    );
    let mut opts = MigrationOptions::new(write_dump(dir.path(), &dump), dir.path());
    opts.create_redirects = true;
    let mut store = seeded_store();

    let summary = migrate(&opts, &mut store);
    assert_eq!(summary.exit_code(), 0);
    assert!(store.page_by_path("/blog/ola/").is_some());

    let mapper = UrlMapper::load(&dir.path().join(URL_MAPPINGS_FILE)).unwrap();
    assert_eq!(mapper.lookup("/ol%c3%a1/"), Some("/blog/ola/"));
    assert_eq!(
        fs::read_to_string(dir.path().join(REDIRECTS_FILE)).unwrap(),
        "rewrite ^/olá/$ /blog/ola/ permanent;\n"
    );
}

#[test]
fn test_dry_run_matches_real_run_without_side_effects() {
    let dry_dir = TempDir::new().unwrap();
    let mut dry_opts =
        MigrationOptions::new(write_dump(dry_dir.path(), &sample_dump()), dry_dir.path());
    dry_opts.dry_run = true;
    dry_opts.create_redirects = true;
    let mut dry_store = seeded_store();
    let dry = migrate(&dry_opts, &mut dry_store);

    let real_dir = TempDir::new().unwrap();
    let real_opts =
        MigrationOptions::new(write_dump(real_dir.path(), &sample_dump()), real_dir.path());
    let mut real_store = seeded_store();
    let real = migrate(&real_opts, &mut real_store);

    assert_eq!(dry.exit_code(), 0);
    assert_eq!(dry.stats.posts_imported, real.stats.posts_imported);
    assert_eq!(dry.stats.pages_imported, real.stats.pages_imported);
    assert_eq!(dry.stats.categories_created, real.stats.categories_created);
    assert_eq!(dry.stats.tags_created, real.stats.tags_created);
    assert_eq!(dry.stats.redirects_created, real.stats.redirects_created);
    assert_eq!(dry.stats.images_downloaded, 0);
    assert!(real.stats.images_downloaded > 0);

    assert_eq!(dry_store.entity_count(), 0);
    assert!(dry_store.page_by_path("/blog/hello/").is_none());

    assert!(dry_dir.path().join(REPORT_FILE).exists());
    assert!(!dry_dir.path().join(URL_MAPPINGS_FILE).exists());
    assert!(!dry_dir.path().join(REDIRECTS_FILE).exists());
}

#[test]
fn test_rerun_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let opts = MigrationOptions::new(write_dump(dir.path(), &sample_dump()), dir.path());
    let mut store = seeded_store();

    let first = migrate(&opts, &mut store);
    let entities = store.entity_count();
    let mappings = fs::read_to_string(dir.path().join(URL_MAPPINGS_FILE)).unwrap();

    let second = migrate(&opts, &mut store);
    assert_eq!(second.exit_code(), 0);
    assert_eq!(second.stats.posts_imported, 0);
    assert_eq!(second.stats.pages_imported, 0);
    assert_eq!(second.stats.categories_created, 0);
    assert_eq!(second.stats.tags_created, 0);
    assert_eq!(second.stats.redirects_created, 0);
    assert_eq!(second.stats.images_downloaded, 0);
    assert_eq!(
        second.stats.skipped_duplicates,
        first.stats.posts_imported + first.stats.pages_imported
    );
    assert_eq!(second.stats.url_mappings_count, first.stats.url_mappings_count);
    assert_eq!(store.entity_count(), entities);

    let first_map: serde_json::Value = serde_json::from_str(&mappings).unwrap();
    let second_map: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(dir.path().join(URL_MAPPINGS_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(first_map["mappings"], second_map["mappings"]);
}

#[test]
fn test_interrupted_run_is_completed_by_rerun() {
    let dir = TempDir::new().unwrap();
    let dump = format_insert(
        "wp_posts",
        &[
            post(1, "<p>One</p>", "One", "one", "post"),
            post(2, "<p>Two</p>", "Two", "two", "post"),
        ],
    );
    let mut opts = MigrationOptions::new(write_dump(dir.path(), &dump), dir.path());
    opts.max_posts = Some(1);
    let mut store = seeded_store();
    let partial = migrate(&opts, &mut store);
    assert_eq!(partial.stats.posts_imported, 1);

    opts.max_posts = None;
    let rest = migrate(&opts, &mut store);
    assert_eq!(rest.stats.posts_imported, 1);
    assert_eq!(rest.stats.skipped_duplicates, 1);

    let mapper = UrlMapper::load(&dir.path().join(URL_MAPPINGS_FILE)).unwrap();
    assert_eq!(mapper.len(), 2);
    assert_eq!(mapper.lookup("/one/"), Some("/blog/one/"));
    assert_eq!(mapper.lookup("/two/"), Some("/blog/two/"));
}

#[test]
fn test_media_only_downloads_attachments() {
    let dir = TempDir::new().unwrap();
    let mut opts = MigrationOptions::new(write_dump(dir.path(), &sample_dump()), dir.path());
    opts.scope = Scope::MediaOnly;
    let mut store = seeded_store();

    let summary = migrate(&opts, &mut store);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.stats.images_downloaded, 1);
    assert_eq!(summary.stats.posts_imported, 0);
    assert_eq!(store.images()[0].title, "Cover");
    assert!(store.page_by_path("/blog/hello/").is_none());
}

#[test]
fn test_bz2_dump_with_table_prefix() {
    let dir = TempDir::new().unwrap();
    let dump = format_insert(
        "blog_posts",
        &[post(1, "<p>Hi</p>", "Hello", "hello", "post")],
    );
    let mut encoder = BzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(dump.as_bytes()).unwrap();
    let path = dir.path().join("dump.sql.bz2");
    fs::write(&path, encoder.finish().unwrap()).unwrap();

    let mut opts = MigrationOptions::new(&path, dir.path());
    opts.table_prefix = "blog_".to_string();
    let mut store = seeded_store();

    let summary = migrate(&opts, &mut store);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.stats.posts_imported, 1);
    assert!(store.page_by_path("/blog/hello/").is_some());
}

#[test]
fn test_unseeded_store_is_fatal() {
    let dir = TempDir::new().unwrap();
    let dump = format_insert("wp_posts", &[post(1, "<p>Hi</p>", "Hello", "hello", "post")]);
    let opts = MigrationOptions::new(write_dump(dir.path(), &dump), dir.path());
    let mut store = ContentStore::in_memory(Box::new(MemoryStorage::new("/media/")));

    let summary = migrate(&opts, &mut store);
    assert_eq!(summary.exit_code(), 1);
    assert!(summary.fatal.as_deref().unwrap().contains("Site root"));
    assert_eq!(summary.stats.posts_imported, 0);

    let report: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(dir.path().join(REPORT_FILE)).unwrap(),
    )
    .unwrap();
    assert!(report["fatal_error"].as_str().unwrap().contains("Site root"));
}

#[test]
fn test_malformed_tuples_count_as_errors() {
    let dir = TempDir::new().unwrap();
    let dump = format_insert(
        "wp_posts",
        &[
            post(1, "<p>Hi</p>", "Hello", "hello", "post"),
            vec![SqlValue::Int(2), "short".into()],
        ],
    );
    let opts = MigrationOptions::new(write_dump(dir.path(), &dump), dir.path());
    let mut store = seeded_store();

    let summary = migrate(&opts, &mut store);
    assert_eq!(summary.stats.posts_imported, 1);
    assert_eq!(summary.stats.errors, 1);
    assert_eq!(summary.exit_code(), 1);
    assert_eq!(summary.errors.len(), 1);
}
