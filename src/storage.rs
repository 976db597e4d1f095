use anyhow::{bail, Context, Result};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};

/// Serializes `value` as pretty JSON to `<path>.tmp`, then renames over `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let file = File::create(&tmp_path)
        .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush {}", tmp_path.display()))?;
    drop(writer);

    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to rename temp file to {}", path.display()))?;
    Ok(())
}

/// Byte store behind the CMS image table.
pub trait Storage {
    /// Persists `bytes` at `relative_path` (or a free variant of it) and
    /// returns the final relative path.
    fn save(&mut self, relative_path: &str, bytes: &[u8]) -> Result<String>;

    /// Public URL of a stored path.
    fn url(&self, path: &str) -> String;
}

/// Rejects absolute paths and `..` components.
fn check_relative(relative_path: &str) -> Result<()> {
    let path = Path::new(relative_path);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if relative_path.is_empty() || escapes {
        bail!("Invalid storage path: {relative_path:?}");
    }
    Ok(())
}

/// `dir/name.ext` -> `dir/name_<n>.ext`
fn numbered_variant(relative_path: &str, n: u32) -> String {
    let (dir, file) = match relative_path.rsplit_once('/') {
        Some((dir, file)) => (format!("{dir}/"), file),
        None => (String::new(), relative_path),
    };
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{dir}{stem}_{n}.{ext}"),
        _ => format!("{dir}{file}_{n}"),
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Files under a media root, served from `base_url`.
pub struct FsStorage {
    root: PathBuf,
    base_url: String,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>, base_url: &str) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.to_string(),
        }
    }
}

impl Storage for FsStorage {
    fn save(&mut self, relative_path: &str, bytes: &[u8]) -> Result<String> {
        check_relative(relative_path)?;

        let mut final_path = relative_path.to_string();
        let mut n = 1;
        while self.root.join(&final_path).exists() {
            final_path = numbered_variant(relative_path, n);
            n += 1;
        }

        let full = self.root.join(&final_path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let tmp = full.with_extension("tmp");
        fs::write(&tmp, bytes).with_context(|| format!("Failed to write: {}", tmp.display()))?;
        fs::rename(&tmp, &full)
            .with_context(|| format!("Failed to move image into place: {}", full.display()))?;

        Ok(final_path)
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

/// Keeps bytes in memory. Used by dry runs and tests.
#[derive(Default)]
pub struct MemoryStorage {
    files: FxHashMap<String, Vec<u8>>,
    base_url: String,
}

impl MemoryStorage {
    pub fn new(base_url: &str) -> Self {
        Self {
            files: FxHashMap::default(),
            base_url: base_url.to_string(),
        }
    }

    #[cfg(test)]
    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.files.len()
    }
}

impl Storage for MemoryStorage {
    fn save(&mut self, relative_path: &str, bytes: &[u8]) -> Result<String> {
        check_relative(relative_path)?;
        let mut final_path = relative_path.to_string();
        let mut n = 1;
        while self.files.contains_key(&final_path) {
            final_path = numbered_variant(relative_path, n);
            n += 1;
        }
        self.files.insert(final_path.clone(), bytes.to_vec());
        Ok(final_path)
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}
