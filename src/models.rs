use chrono::{NaiveDate, NaiveDateTime};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Records extracted from the dump
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostKind {
    Post,
    Page,
    Attachment,
    Other,
}

impl PostKind {
    pub fn from_post_type(value: &str) -> Self {
        match value {
            "post" => PostKind::Post,
            "page" => PostKind::Page,
            "attachment" => PostKind::Attachment,
            _ => PostKind::Other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Post {
    pub id: u64,
    pub author_id: Option<u64>,
    pub created_at: Option<NaiveDateTime>,
    pub modified_at: Option<NaiveDateTime>,
    pub raw_content: String,
    pub title: String,
    pub excerpt: String,
    pub status: String,
    pub slug: String,
    pub parent_id: Option<u64>,
    pub guid: String,
    pub kind: PostKind,
    pub mime: String,
}

/// An uploaded media row (`post_type = 'attachment'`). Only image attachments
/// are kept; their `guid` is the file URL.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub id: u64,
    pub title: String,
    pub url: String,
    pub mime: String,
}

#[derive(Debug, Clone)]
pub struct Term {
    pub id: u64,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaxonomyKind {
    Category,
    Tag,
}

impl TaxonomyKind {
    /// `None` for taxonomies that are not migrated (nav menus, formats, ...).
    pub fn from_taxonomy(value: &str) -> Option<Self> {
        match value {
            "category" => Some(TaxonomyKind::Category),
            "post_tag" => Some(TaxonomyKind::Tag),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaxonomyEntry {
    pub id: u64,
    pub term_id: u64,
    pub kind: TaxonomyKind,
    pub description: String,
}

/// Flattened `wp_postmeta`: post id -> key -> value (last write wins).
pub type MetaMap = FxHashMap<u64, FxHashMap<String, String>>;

/// `wp_term_relationships`: post id -> taxonomy entry ids, in dump order.
pub type RelationshipMap = FxHashMap<u64, Vec<u64>>;

/// The outcome of downloading one referenced URL.
#[derive(Debug, Clone, Serialize)]
pub struct AssetReference {
    pub original_url: String,
    pub local_handle: Option<ImageHandle>,
    pub declared_mime: Option<String>,
    pub sniffed_mime: Option<String>,
    pub size_bytes: Option<u64>,
}

// ---------------------------------------------------------------------------
// Entities materialized in the CMS
// ---------------------------------------------------------------------------

/// A stored image as the CMS returns it; `url` is what bodies link to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHandle {
    pub id: u64,
    pub title: String,
    pub path: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRef {
    pub id: u64,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRef {
    pub id: u64,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: u64,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: u64,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub old_path: String,
    pub new_path: String,
    pub is_permanent: bool,
    pub site: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SeoMeta {
    pub description: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub title: String,
    pub slug: String,
    pub publication_date: NaiveDate,
    pub intro: String,
    pub body: String,
    pub category_refs: Vec<CategoryRef>,
    pub tag_refs: Vec<TagRef>,
    pub cover_asset: Option<ImageHandle>,
    pub legacy_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardPage {
    pub title: String,
    pub slug: String,
    pub intro: String,
    pub body: String,
    pub seo: SeoMeta,
    pub reading_time: u32,
    pub legacy_id: u64,
}

/// Anything that can be placed in the page tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PageContent {
    /// Pre-seeded containers (site root, blog index)
    Index { intro: String },
    Article(Article),
    StandardPage(StandardPage),
}

impl PageContent {
    pub fn title(&self) -> Option<&str> {
        match self {
            PageContent::Index { .. } => None,
            PageContent::Article(a) => Some(&a.title),
            PageContent::StandardPage(p) => Some(&p.title),
        }
    }
}

/// A new child page: tree position data plus content.
#[derive(Debug, Clone)]
pub struct NewPage {
    pub title: String,
    pub slug: String,
    pub content: PageContent,
}

impl From<Article> for NewPage {
    fn from(article: Article) -> Self {
        NewPage {
            title: article.title.clone(),
            slug: article.slug.clone(),
            content: PageContent::Article(article),
        }
    }
}

impl From<StandardPage> for NewPage {
    fn from(page: StandardPage) -> Self {
        NewPage {
            title: page.title.clone(),
            slug: page.slug.clone(),
            content: PageContent::StandardPage(page),
        }
    }
}

/// Reference to a page in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRef {
    pub id: u64,
    pub slug: String,
    pub title: String,
    pub url_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_kind_from_post_type() {
        assert_eq!(PostKind::from_post_type("post"), PostKind::Post);
        assert_eq!(PostKind::from_post_type("page"), PostKind::Page);
        assert_eq!(PostKind::from_post_type("attachment"), PostKind::Attachment);
        assert_eq!(PostKind::from_post_type("nav_menu_item"), PostKind::Other);
        assert_eq!(PostKind::from_post_type("revision"), PostKind::Other);
    }

    #[test]
    fn taxonomy_kind_filters_unknown() {
        assert_eq!(
            TaxonomyKind::from_taxonomy("category"),
            Some(TaxonomyKind::Category)
        );
        assert_eq!(TaxonomyKind::from_taxonomy("post_tag"), Some(TaxonomyKind::Tag));
        assert_eq!(TaxonomyKind::from_taxonomy("nav_menu"), None);
    }

    #[test]
    fn page_content_serializes_with_type_tag() {
        let content = PageContent::Index {
            intro: "Blog".to_string(),
        };
        let json = serde_json::to_string(&content).unwrap();
        assert_eq!(json, r#"{"type":"index","intro":"Blog"}"#);
    }
}
