use crate::cms::Cms;
use crate::config::{
    ALLOWED_IMAGE_EXTENSIONS, ALLOWED_IMAGE_MIME_TYPES, FETCH_TIMEOUT_SECS, MAX_ASSET_BYTES,
    MAX_HTTP_REDIRECTS, MIN_ASSET_BYTES, PROBE_TIMEOUT_SECS,
};
use crate::models::{AssetReference, ImageHandle};
use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Headers of interest from a HEAD request.
#[derive(Debug, Clone, Default)]
pub struct RemoteHead {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

/// Network seam of the downloader.
pub trait Fetcher {
    fn head(&self, url: &str, timeout: Duration) -> Result<RemoteHead>;

    /// Reads at most `max_bytes + 1` bytes so oversized bodies are detectable
    /// without buffering them whole.
    fn get(&self, url: &str, timeout: Duration, max_bytes: u64) -> Result<Vec<u8>>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(MAX_HTTP_REDIRECTS))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn head(&self, url: &str, timeout: Duration) -> Result<RemoteHead> {
        let response = self
            .client
            .head(url)
            .timeout(timeout)
            .send()
            .with_context(|| format!("HEAD {url} failed"))?
            .error_for_status()
            .with_context(|| format!("HEAD {url} returned an error status"))?;

        let headers = response.headers();
        // Read the header directly; the body of a HEAD response is always empty.
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(RemoteHead {
            content_type,
            content_length,
        })
    }

    fn get(&self, url: &str, timeout: Duration, max_bytes: u64) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .with_context(|| format!("GET {url} failed"))?
            .error_for_status()
            .with_context(|| format!("GET {url} returned an error status"))?;

        let mut bytes = Vec::new();
        response
            .take(max_bytes.saturating_add(1))
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read body of {url}"))?;
        Ok(bytes)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AssetLimits {
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub probe_timeout: Duration,
    pub fetch_timeout: Duration,
}

impl Default for AssetLimits {
    fn default() -> Self {
        Self {
            min_bytes: MIN_ASSET_BYTES,
            max_bytes: MAX_ASSET_BYTES,
            probe_timeout: Duration::from_secs(PROBE_TIMEOUT_SECS),
            fetch_timeout: Duration::from_secs(FETCH_TIMEOUT_SECS),
        }
    }
}

/// A URL that passed the HEAD probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetInfo {
    pub url: String,
    pub filename: String,
    pub title: String,
    pub declared_mime: Option<String>,
    pub declared_size: Option<u64>,
}

/// http(s) with a host and a path ending in an allowed image extension.
pub fn is_valid_url(url: &str) -> bool {
    let url = url.trim();
    if url.is_empty() {
        return false;
    }
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return false;
    }
    let path = parsed.path().to_ascii_lowercase();
    ALLOWED_IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// MIME type without parameters, lowercased.
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

fn is_allowed_mime(mime: &str) -> bool {
    ALLOWED_IMAGE_MIME_TYPES.contains(&mime)
}

fn url_hash(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex::encode(digest)[..8].to_string()
}

fn sanitize_basename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `(filename, title)` for a URL: `wp_<hash>_<basename>`, or
/// `wp_<hash>_image_<hash>.jpg` when the URL has no usable basename.
pub fn asset_filename(url: &str) -> (String, String) {
    let hash = url_hash(url);
    let decoded = Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .map(|segment| match urlencoding::decode(&segment) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => segment,
        })
        .unwrap_or_default();

    match decoded.rsplit_once('.') {
        Some((stem, ext)) if !stem.trim().is_empty() && !ext.is_empty() => (
            format!("wp_{hash}_{}", sanitize_basename(&decoded)),
            stem.trim().to_string(),
        ),
        _ => (
            format!("wp_{hash}_image_{hash}.jpg"),
            format!("image_{hash}"),
        ),
    }
}

/// Content-sniffed MIME type of an image body.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some("image/png");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }

    let head = &bytes[..bytes.len().min(1024)];
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start_matches('\u{feff}').trim_start();
    if (text.starts_with("<?xml") || text.starts_with("<svg") || text.starts_with("<!DOCTYPE svg"))
        && text.contains("<svg")
    {
        return Some("image/svg+xml");
    }
    None
}

/// Validates, fetches and stores remote images, one request at a time.
/// Results (including failures) are cached per URL for the whole run.
pub struct AssetDownloader {
    fetcher: Box<dyn Fetcher>,
    limits: AssetLimits,
    cache: FxHashMap<String, AssetReference>,
    downloaded: u64,
}

impl AssetDownloader {
    pub fn new(fetcher: Box<dyn Fetcher>, limits: AssetLimits) -> Self {
        Self {
            fetcher,
            limits,
            cache: FxHashMap::default(),
            downloaded: 0,
        }
    }

    /// Number of images stored by this downloader.
    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    /// Every URL attempted so far, successful or not.
    pub fn references(&self) -> impl Iterator<Item = &AssetReference> {
        self.cache.values()
    }

    pub fn probe(&self, url: &str) -> Option<AssetInfo> {
        let head = match self.fetcher.head(url, self.limits.probe_timeout) {
            Ok(head) => head,
            Err(e) => {
                warn!(url, error = %format!("{e:#}"), "Image probe failed");
                return None;
            }
        };

        let declared_mime = head.content_type.as_deref().map(essence);
        match declared_mime.as_deref() {
            Some(mime) if is_allowed_mime(mime) => {}
            other => {
                warn!(url, content_type = ?other, "Image rejected: content type not allowed");
                return None;
            }
        }

        if let Some(size) = head.content_length {
            if size < self.limits.min_bytes || size > self.limits.max_bytes {
                warn!(
                    url,
                    size,
                    min = self.limits.min_bytes,
                    max = self.limits.max_bytes,
                    "Image rejected: declared size out of range"
                );
                return None;
            }
        }

        let (filename, title) = asset_filename(url);
        Some(AssetInfo {
            url: url.to_string(),
            filename,
            title,
            declared_mime,
            declared_size: head.content_length,
        })
    }

    /// Downloads a probed asset and stores it in the CMS. Rejections yield
    /// `Ok(None)`; only CMS/storage failures are errors.
    pub fn fetch(&mut self, info: &AssetInfo, cms: &mut dyn Cms) -> Result<Option<ImageHandle>> {
        if let Some(cached) = self.cache.get(&info.url) {
            return Ok(cached.local_handle.clone());
        }
        let (handle, reference) = self.download(info, cms)?;
        self.cache.insert(info.url.clone(), reference);
        Ok(handle)
    }

    fn download(
        &mut self,
        info: &AssetInfo,
        cms: &mut dyn Cms,
    ) -> Result<(Option<ImageHandle>, AssetReference)> {
        let mut reference = AssetReference {
            original_url: info.url.clone(),
            local_handle: None,
            declared_mime: info.declared_mime.clone(),
            sniffed_mime: None,
            size_bytes: None,
        };

        let bytes = match self
            .fetcher
            .get(&info.url, self.limits.fetch_timeout, self.limits.max_bytes)
        {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(url = %info.url, error = %format!("{e:#}"), "Image download failed");
                return Ok((None, reference));
            }
        };

        let size = bytes.len() as u64;
        reference.size_bytes = Some(size);
        if size < self.limits.min_bytes || size > self.limits.max_bytes {
            warn!(url = %info.url, size, "Image rejected: size out of range");
            return Ok((None, reference));
        }

        let sniffed = sniff_mime(&bytes);
        reference.sniffed_mime = sniffed.map(str::to_string);
        if !sniffed.is_some_and(is_allowed_mime) {
            warn!(url = %info.url, sniffed = ?sniffed, "Image rejected: content is not an allowed image type");
            return Ok((None, reference));
        }

        let handle = cms
            .create_image(&bytes, &info.filename, &info.title)
            .with_context(|| format!("Failed to store image from {}", info.url))?;
        self.downloaded += 1;
        info!(url = %info.url, path = %handle.path, size, "Image downloaded");

        reference.local_handle = Some(handle.clone());
        Ok((Some(handle), reference))
    }

    /// Validate, probe and fetch in one step, consulting the cache first.
    /// `title` overrides the title derived from the URL.
    pub fn resolve(
        &mut self,
        url: &str,
        title: Option<&str>,
        cms: &mut dyn Cms,
    ) -> Result<Option<ImageHandle>> {
        let url = url.trim();
        if let Some(cached) = self.cache.get(url) {
            return Ok(cached.local_handle.clone());
        }
        if !is_valid_url(url) {
            debug!(url, "Skipping image with unsupported URL");
            return Ok(None);
        }

        let Some(mut info) = self.probe(url) else {
            self.cache.insert(
                url.to_string(),
                AssetReference {
                    original_url: url.to_string(),
                    local_handle: None,
                    declared_mime: None,
                    sniffed_mime: None,
                    size_bytes: None,
                },
            );
            return Ok(None);
        };
        if let Some(title) = title.map(str::trim).filter(|t| !t.is_empty()) {
            info.title = title.to_string();
        }
        self.fetch(&info, cms)
    }
}
