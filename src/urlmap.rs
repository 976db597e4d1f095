use crate::storage::write_json_atomic;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Legacy path <-> new path. Both directions stay functions: adding a pair
/// evicts whatever the old key or the new value was previously paired with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlMapper {
    #[serde(default)]
    mappings: BTreeMap<String, String>,
    #[serde(default)]
    reverse_mappings: BTreeMap<String, String>,
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    created_at: DateTime<Utc>,
}

/// RFC 3339, or an offset-less ISO 8601 timestamp taken as UTC. Anything
/// else (including null) becomes the load time.
fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

impl Default for UrlMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlMapper {
    pub fn new() -> Self {
        Self {
            mappings: BTreeMap::new(),
            reverse_mappings: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn add(&mut self, old_path: &str, new_path: &str) {
        if let Some(previous_new) = self.mappings.remove(old_path) {
            self.reverse_mappings.remove(&previous_new);
        }
        if let Some(previous_old) = self.reverse_mappings.remove(new_path) {
            self.mappings.remove(&previous_old);
        }
        self.mappings
            .insert(old_path.to_string(), new_path.to_string());
        self.reverse_mappings
            .insert(new_path.to_string(), old_path.to_string());
    }

    pub fn lookup(&self, old_path: &str) -> Option<&str> {
        self.mappings.get(old_path).map(String::as_str)
    }

    pub fn reverse(&self, new_path: &str) -> Option<&str> {
        self.reverse_mappings.get(new_path).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.mappings.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn dump(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)?;
        info!(path = %path.display(), mappings = self.len(), "URL mappings written");
        Ok(())
    }

    /// Reads a mapping file. A missing file yields an empty mapper; a file
    /// whose two directions disagree (or that lacks `reverse_mappings`) is
    /// repaired from `mappings`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read URL mappings: {}", path.display()))?;
        let loaded: UrlMapper = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse URL mappings: {}", path.display()))?;

        if loaded.is_consistent() {
            return Ok(loaded);
        }

        warn!(path = %path.display(), "URL mappings are inconsistent, rebuilding reverse map");
        let mut repaired = UrlMapper {
            mappings: BTreeMap::new(),
            reverse_mappings: BTreeMap::new(),
            created_at: loaded.created_at,
        };
        for (old_path, new_path) in &loaded.mappings {
            repaired.add(old_path, new_path);
        }
        Ok(repaired)
    }

    fn is_consistent(&self) -> bool {
        self.mappings.len() == self.reverse_mappings.len()
            && self
                .mappings
                .iter()
                .all(|(old, new)| self.reverse_mappings.get(new) == Some(old))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lookup_and_reverse() {
        let mut map = UrlMapper::new();
        map.add("/hello/", "/blog/hello/");
        assert_eq!(map.lookup("/hello/"), Some("/blog/hello/"));
        assert_eq!(map.reverse("/blog/hello/"), Some("/hello/"));
        assert_eq!(map.lookup("/missing/"), None);
    }

    #[test]
    fn last_write_wins_in_both_directions() {
        let mut map = UrlMapper::new();
        map.add("/a/", "/blog/a/");
        map.add("/a/", "/blog/a-2/");
        assert_eq!(map.lookup("/a/"), Some("/blog/a-2/"));
        assert_eq!(map.reverse("/blog/a/"), None);

        map.add("/b/", "/blog/a-2/");
        assert_eq!(map.lookup("/a/"), None);
        assert_eq!(map.reverse("/blog/a-2/"), Some("/b/"));
        assert_eq!(map.len(), 1);

        for (old, _) in map.iter() {
            let new = map.lookup(old).unwrap();
            assert_eq!(map.reverse(new), Some(old));
        }
    }

    #[test]
    fn dump_then_load_is_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("url_mappings.json");
        let mut map = UrlMapper::new();
        map.add("/hello/", "/blog/hello/");
        map.add("/about/", "/about-us/");
        map.dump(&path).unwrap();

        let loaded = UrlMapper::load(&path).unwrap();
        assert_eq!(loaded, map);

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["mappings"]["/hello/"], "/blog/hello/");
        assert_eq!(json["reverse_mappings"]["/blog/hello/"], "/hello/");
        assert!(json["created_at"].is_string());
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let map = UrlMapper::load(&dir.path().join("nope.json")).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn inconsistent_file_is_repaired() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("url_mappings.json");
        fs::write(
            &path,
            r#"{"mappings":{"/a/":"/x/","/b/":"/y/"},"reverse_mappings":{"/x/":"/a/"},"created_at":"2024-01-15T10:30:00Z"}"#,
        )
        .unwrap();
        let map = UrlMapper::load(&path).unwrap();
        assert_eq!(map.reverse("/y/"), Some("/b/"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn offset_less_timestamp_is_read_as_utc() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("url_mappings.json");
        fs::write(
            &path,
            r#"{"mappings":{"/a/":"/blog/a/"},"reverse_mappings":{"/blog/a/":"/a/"},"created_at":"2024-01-15T10:30:00.123456"}"#,
        )
        .unwrap();
        let map = UrlMapper::load(&path).unwrap();
        assert_eq!(map.lookup("/a/"), Some("/blog/a/"));
        assert_eq!(
            map.created_at.to_rfc3339(),
            "2024-01-15T10:30:00.123456+00:00"
        );
    }

    #[test]
    fn missing_reverse_mappings_are_rebuilt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("url_mappings.json");
        fs::write(
            &path,
            r#"{"mappings":{"/a/":"/blog/a/"},"created_at":"2024-01-15T10:30:00"}"#,
        )
        .unwrap();
        let map = UrlMapper::load(&path).unwrap();
        assert_eq!(map.reverse("/blog/a/"), Some("/a/"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn unreadable_timestamp_falls_back_to_now() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("url_mappings.json");
        fs::write(&path, r#"{"mappings":{},"created_at":"last tuesday"}"#).unwrap();
        let before = Utc::now();
        let map = UrlMapper::load(&path).unwrap();
        assert!(map.is_empty());
        assert!(map.created_at >= before);

        fs::write(&path, r#"{"mappings":{"/x/":"/y/"}}"#).unwrap();
        assert_eq!(UrlMapper::load(&path).unwrap().lookup("/x/"), Some("/y/"));
    }
}
