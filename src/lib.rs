//! wp2cms: WordPress SQL dump to CMS content tree migration pipeline
//!
//! This crate migrates a WordPress site, given only its `mysqldump` output, into a
//! page-tree CMS. A run goes through these passes:
//!
//! 1. **Extraction Pass** -- Lex the `INSERT INTO` statements of the posts, terms,
//!    taxonomy, relationship and meta tables into typed records
//! 2. **Taxonomy Pass** -- Create (or reuse) categories and tags before any post
//!    references them
//! 3. **Content Pass** -- Sanitize bodies, rewrite shortcodes, download and re-host
//!    images, derive intro/SEO fields and create articles and pages in dump order
//! 4. **Redirect Pass** -- Register `legacy path -> new path` redirects and record
//!    every mapping in a persistent bidirectional URL map
//!
//! # Architecture
//!
//! - **Byte scanner, not a SQL grammar** -- memchr-driven statement and tuple splitting
//!   that survives WordPress's dump style, including both quote styles and multi-row
//!   inserts
//! - **Sequential by design** -- One worker, dump order, blocking HTTP with bounded
//!   timeouts
//! - **Narrow seams** -- The CMS, the image storage and the HTTP fetcher are traits,
//!   so the whole pipeline runs against in-memory fakes in tests
//! - **Idempotent re-runs** -- Existing slugs, taxonomies and redirects are reused,
//!   and an interrupted run is completed by running it again
//! - **Atomic artifacts** -- JSON outputs are written to a temp file and renamed
//!
//! # Key Modules
//!
//! - [`sql`] -- `INSERT` statement scanner, tuple splitter and value cleaner
//! - [`extract`] -- Column mapping for the five WordPress tables
//! - [`content`] -- HTML sanitizer, shortcode rewriter, excerpts and image `src` rewriting
//! - [`seo`] -- Slugs, reading time, meta description and keywords
//! - [`assets`] -- Image validation, HEAD probe, download and MIME sniffing
//! - [`cms`] -- CMS capabilities and the JSON-backed content store
//! - [`import`] -- Turns records into CMS entities, with dry-run support
//! - [`pipeline`] -- Run lifecycle, cancellation and artifact emission
//! - [`urlmap`] -- Bidirectional legacy/new URL map
//! - [`report`] -- Error log, migration report and nginx rewrite rules
//! - [`stats`] -- Atomic run counters
//! - [`config`] -- Limits, allowed types and defaults
//!
//! # Example Usage
//!
//! ```bash
//! # Create the site root and blog index once
//! wp2cms seed --store cms_store.json
//!
//! # See what a dump contains
//! wp2cms inspect --source backup.sql.bz2
//!
//! # Rehearse, then migrate with nginx rules
//! wp2cms --source backup.sql.bz2 --dry-run
//! wp2cms --source backup.sql.bz2 --create-redirects --output-dir out/
//! ```

pub mod assets;
pub mod cms;
pub mod config;
pub mod content;
pub mod dump;
pub mod extract;
pub mod import;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod seo;
pub mod sql;
pub mod stats;
pub mod storage;
pub mod urlmap;
