use crate::config::IMAGE_STORAGE_PREFIX;
use crate::models::{
    Category, CategoryRef, ImageHandle, NewPage, PageContent, PageRef, Redirect, Tag, TagRef,
};
use crate::seo::slugify;
use crate::storage::{write_json_atomic, Storage};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// `add_child` on a slug that is already taken under the same parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateSlug {
    pub parent_path: String,
    pub slug: String,
}

impl fmt::Display for DuplicateSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slug {:?} already exists under {}",
            self.slug, self.parent_path
        )
    }
}

impl std::error::Error for DuplicateSlug {}

/// Capabilities the migrator needs from the target CMS.
pub trait Cms {
    fn find_parent_by_slug(&self, slug: &str) -> Option<PageRef>;

    fn find_child(&self, parent: &PageRef, slug: &str) -> Option<PageRef>;

    /// Fails with [`DuplicateSlug`] when `page.slug` is taken under `parent`.
    fn add_child(&mut self, parent: &PageRef, page: NewPage) -> Result<PageRef>;

    fn publish(&mut self, page: &PageRef) -> Result<()>;

    fn create_image(&mut self, bytes: &[u8], filename: &str, title: &str) -> Result<ImageHandle>;

    /// Returns the category and whether it was created by this call.
    fn create_or_get_category(&mut self, name: &str, slug: &str) -> Result<(CategoryRef, bool)>;

    fn create_or_get_tag(&mut self, name: &str) -> Result<(TagRef, bool)>;

    /// Idempotent on `(old_path, site)`; returns false if a redirect existed.
    fn create_redirect(
        &mut self,
        old_path: &str,
        new_path: &str,
        permanent: bool,
        site: &str,
    ) -> Result<bool>;

    fn category_by_slug(&self, slug: &str) -> Option<CategoryRef>;

    fn tag_by_name(&self, name: &str) -> Option<TagRef>;

    fn redirect_exists(&self, old_path: &str, site: &str) -> bool;
}

/// Tag slug derived from its name.
pub fn tag_slug(name: &str) -> String {
    let slug = slugify(name);
    if slug.is_empty() {
        name.trim().to_lowercase()
    } else {
        slug
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPage {
    pub id: u64,
    pub parent_id: Option<u64>,
    pub slug: String,
    pub title: String,
    pub url_path: String,
    pub live: bool,
    pub created_at: DateTime<Utc>,
    pub content: PageContent,
}

impl StoredPage {
    fn to_ref(&self) -> PageRef {
        PageRef {
            id: self.id,
            slug: self.slug.clone(),
            title: self.title.clone(),
            url_path: self.url_path.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    next_id: u64,
    pages: Vec<StoredPage>,
    images: Vec<ImageHandle>,
    categories: Vec<Category>,
    tags: Vec<Tag>,
    redirects: Vec<Redirect>,
}

impl StoreState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// A page tree with images, taxonomies and a redirect table, persisted as a
/// single JSON document.
pub struct ContentStore {
    state: StoreState,
    storage: Box<dyn Storage>,
    path: Option<PathBuf>,
}

impl ContentStore {
    /// Loads the store at `path`, or starts an empty one if the file does not exist.
    pub fn open(path: &Path, storage: Box<dyn Storage>) -> Result<Self> {
        let state = if path.exists() {
            let data = fs::read_to_string(path)
                .with_context(|| format!("Failed to read content store: {}", path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("Failed to parse content store: {}", path.display()))?
        } else {
            StoreState::default()
        };

        info!(
            path = %path.display(),
            pages = state.pages.len(),
            images = state.images.len(),
            redirects = state.redirects.len(),
            "Content store opened"
        );

        Ok(Self {
            state,
            storage,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn in_memory(storage: Box<dyn Storage>) -> Self {
        Self {
            state: StoreState::default(),
            storage,
            path: None,
        }
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_json_atomic(path, &self.state)?;
        debug!(path = %path.display(), pages = self.state.pages.len(), "Content store saved");
        Ok(())
    }

    /// Creates the site root (`/`) and the blog index beneath it if missing.
    pub fn seed_site(&mut self, home_slug: &str, blog_slug: &str) -> Result<(PageRef, PageRef)> {
        let home = match self.find_parent_by_slug(home_slug) {
            Some(home) => home,
            None => {
                let id = self.state.allocate_id();
                self.state.pages.push(StoredPage {
                    id,
                    parent_id: None,
                    slug: home_slug.to_string(),
                    title: "Home".to_string(),
                    url_path: "/".to_string(),
                    live: true,
                    created_at: Utc::now(),
                    content: PageContent::Index {
                        intro: String::new(),
                    },
                });
                info!(slug = home_slug, "Seeded site root");
                self.page_ref(id)?
            }
        };

        let blog = match self.find_child(&home, blog_slug) {
            Some(blog) => blog,
            None => {
                let id = self.state.allocate_id();
                self.state.pages.push(StoredPage {
                    id,
                    parent_id: Some(home.id),
                    slug: blog_slug.to_string(),
                    title: "Blog".to_string(),
                    url_path: format!("{}{}/", home.url_path, blog_slug),
                    live: true,
                    created_at: Utc::now(),
                    content: PageContent::Index {
                        intro: String::new(),
                    },
                });
                info!(slug = blog_slug, "Seeded blog index");
                self.page_ref(id)?
            }
        };

        Ok((home, blog))
    }

    fn page(&self, id: u64) -> Option<&StoredPage> {
        self.state.pages.iter().find(|p| p.id == id)
    }

    fn page_ref(&self, id: u64) -> Result<PageRef> {
        match self.page(id) {
            Some(page) => Ok(page.to_ref()),
            None => bail!("Unknown page id {id}"),
        }
    }

    pub fn pages(&self) -> &[StoredPage] {
        &self.state.pages
    }

    pub fn page_by_path(&self, url_path: &str) -> Option<&StoredPage> {
        self.state.pages.iter().find(|p| p.url_path == url_path)
    }

    #[cfg(test)]
    pub fn children(&self, parent: &PageRef) -> impl Iterator<Item = &StoredPage> {
        let parent_id = parent.id;
        self.state
            .pages
            .iter()
            .filter(move |p| p.parent_id == Some(parent_id))
    }

    pub fn images(&self) -> &[ImageHandle] {
        &self.state.images
    }

    pub fn categories(&self) -> &[Category] {
        &self.state.categories
    }

    pub fn tags(&self) -> &[Tag] {
        &self.state.tags
    }

    pub fn redirects(&self) -> &[Redirect] {
        &self.state.redirects
    }

    /// Pages other than the seeded indexes, plus images, taxonomies and redirects.
    pub fn entity_count(&self) -> usize {
        let content_pages = self
            .state
            .pages
            .iter()
            .filter(|p| !matches!(p.content, PageContent::Index { .. }))
            .count();
        content_pages
            + self.state.images.len()
            + self.state.categories.len()
            + self.state.tags.len()
            + self.state.redirects.len()
    }
}

fn validate_new_page(page: &NewPage) -> Result<()> {
    if page.slug.trim().is_empty() {
        bail!("Page {:?} has an empty slug", page.title);
    }
    if page.title.trim().is_empty() {
        bail!("Page {:?} has an empty title", page.slug);
    }
    let body = match &page.content {
        PageContent::Article(a) => a.body.as_str(),
        PageContent::StandardPage(p) => p.body.as_str(),
        PageContent::Index { .. } => return Ok(()),
    };
    if body.trim().is_empty() {
        bail!("Page {:?} has an empty body", page.slug);
    }
    Ok(())
}

impl Cms for ContentStore {
    fn find_parent_by_slug(&self, slug: &str) -> Option<PageRef> {
        self.state
            .pages
            .iter()
            .find(|p| p.slug == slug)
            .map(StoredPage::to_ref)
    }

    fn find_child(&self, parent: &PageRef, slug: &str) -> Option<PageRef> {
        self.state
            .pages
            .iter()
            .find(|p| p.parent_id == Some(parent.id) && p.slug == slug)
            .map(StoredPage::to_ref)
    }

    fn add_child(&mut self, parent: &PageRef, page: NewPage) -> Result<PageRef> {
        if self.page(parent.id).is_none() {
            bail!("Parent page {} does not exist", parent.url_path);
        }
        validate_new_page(&page)?;
        if self.find_child(parent, &page.slug).is_some() {
            return Err(DuplicateSlug {
                parent_path: parent.url_path.clone(),
                slug: page.slug,
            }
            .into());
        }

        let id = self.state.allocate_id();
        let url_path = format!("{}{}/", parent.url_path, page.slug);
        self.state.pages.push(StoredPage {
            id,
            parent_id: Some(parent.id),
            slug: page.slug,
            title: page.title,
            url_path,
            live: false,
            created_at: Utc::now(),
            content: page.content,
        });
        self.page_ref(id)
    }

    fn publish(&mut self, page: &PageRef) -> Result<()> {
        match self.state.pages.iter_mut().find(|p| p.id == page.id) {
            Some(stored) => {
                stored.live = true;
                Ok(())
            }
            None => bail!("Cannot publish unknown page {}", page.url_path),
        }
    }

    fn create_image(&mut self, bytes: &[u8], filename: &str, title: &str) -> Result<ImageHandle> {
        let relative = format!("{IMAGE_STORAGE_PREFIX}/{filename}");
        let path = self
            .storage
            .save(&relative, bytes)
            .with_context(|| format!("Failed to store image {relative}"))?;
        let handle = ImageHandle {
            id: self.state.allocate_id(),
            title: title.to_string(),
            url: self.storage.url(&path),
            path,
        };
        self.state.images.push(handle.clone());
        Ok(handle)
    }

    fn create_or_get_category(&mut self, name: &str, slug: &str) -> Result<(CategoryRef, bool)> {
        let slug = if slug.trim().is_empty() {
            slugify(name)
        } else {
            slug.trim().to_string()
        };
        if slug.is_empty() {
            bail!("Category {name:?} has no usable slug");
        }
        if let Some(existing) = self.category_by_slug(&slug) {
            return Ok((existing, false));
        }

        let id = self.state.allocate_id();
        self.state.categories.push(Category {
            id,
            name: name.trim().to_string(),
            slug: slug.clone(),
        });
        Ok((CategoryRef { id, slug }, true))
    }

    fn create_or_get_tag(&mut self, name: &str) -> Result<(TagRef, bool)> {
        let slug = tag_slug(name);
        if slug.is_empty() {
            bail!("Tag name is empty");
        }
        if let Some(existing) = self.tag_by_name(name) {
            return Ok((existing, false));
        }

        let id = self.state.allocate_id();
        self.state.tags.push(Tag {
            id,
            name: name.trim().to_string(),
            slug: slug.clone(),
        });
        Ok((TagRef { id, slug }, true))
    }

    fn create_redirect(
        &mut self,
        old_path: &str,
        new_path: &str,
        permanent: bool,
        site: &str,
    ) -> Result<bool> {
        if old_path.is_empty() || new_path.is_empty() {
            bail!("Redirect paths must not be empty");
        }
        if self.redirect_exists(old_path, site) {
            return Ok(false);
        }
        self.state.redirects.push(Redirect {
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
            is_permanent: permanent,
            site: site.to_string(),
        });
        Ok(true)
    }

    fn category_by_slug(&self, slug: &str) -> Option<CategoryRef> {
        self.state
            .categories
            .iter()
            .find(|c| c.slug == slug)
            .map(|c| CategoryRef {
                id: c.id,
                slug: c.slug.clone(),
            })
    }

    fn tag_by_name(&self, name: &str) -> Option<TagRef> {
        let slug = tag_slug(name);
        self.state
            .tags
            .iter()
            .find(|t| t.slug == slug)
            .map(|t| TagRef {
                id: t.id,
                slug: t.slug.clone(),
            })
    }

    fn redirect_exists(&self, old_path: &str, site: &str) -> bool {
        self.state
            .redirects
            .iter()
            .any(|r| r.old_path == old_path && r.site == site)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Article, SeoMeta, StandardPage};
    use crate::storage::{FsStorage, MemoryStorage};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn store() -> ContentStore {
        let mut store = ContentStore::in_memory(Box::new(MemoryStorage::new("/media/")));
        store.seed_site("home", "blog").unwrap();
        store
    }

    fn article(slug: &str, body: &str) -> NewPage {
        Article {
            title: format!("Title {slug}"),
            slug: slug.to_string(),
            publication_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            intro: String::new(),
            body: body.to_string(),
            category_refs: Vec::new(),
            tag_refs: Vec::new(),
            cover_asset: None,
            legacy_id: 1,
        }
        .into()
    }

    #[test]
    fn seeding_is_idempotent() {
        let mut store = store();
        let (home, blog) = store.seed_site("home", "blog").unwrap();
        assert_eq!(home.url_path, "/");
        assert_eq!(blog.url_path, "/blog/");
        assert_eq!(store.pages().len(), 2);
        assert_eq!(store.entity_count(), 0);
    }

    #[test]
    fn add_child_builds_url_and_rejects_duplicates() {
        let mut store = store();
        let blog = store.find_parent_by_slug("blog").unwrap();
        let page = store.add_child(&blog, article("hello", "<p>Hi</p>")).unwrap();
        assert_eq!(page.url_path, "/blog/hello/");
        assert!(!store.page_by_path("/blog/hello/").unwrap().live);
        store.publish(&page).unwrap();
        assert!(store.page_by_path("/blog/hello/").unwrap().live);

        let err = store
            .add_child(&blog, article("hello", "<p>Other</p>"))
            .unwrap_err();
        let dup = err.downcast_ref::<DuplicateSlug>().unwrap();
        assert_eq!(dup.slug, "hello");
        assert_eq!(store.children(&blog).count(), 1);
    }

    #[test]
    fn same_slug_under_different_parents_is_allowed() {
        let mut store = store();
        let home = store.find_parent_by_slug("home").unwrap();
        let blog = store.find_parent_by_slug("blog").unwrap();
        store.add_child(&blog, article("about", "<p>a</p>")).unwrap();
        let page = NewPage::from(StandardPage {
            title: "About".to_string(),
            slug: "about".to_string(),
            intro: String::new(),
            body: "<p>b</p>".to_string(),
            seo: SeoMeta::default(),
            reading_time: 1,
            legacy_id: 2,
        });
        let page = store.add_child(&home, page).unwrap();
        assert_eq!(page.url_path, "/about/");
    }

    #[test]
    fn empty_body_is_rejected() {
        let mut store = store();
        let blog = store.find_parent_by_slug("blog").unwrap();
        assert!(store.add_child(&blog, article("empty", "  ")).is_err());
    }

    #[test]
    fn taxonomies_are_deduplicated_by_slug() {
        let mut store = store();
        let (news, created) = store.create_or_get_category("News", "news").unwrap();
        assert!(created);
        let (again, created) = store.create_or_get_category("News!", "news").unwrap();
        assert!(!created);
        assert_eq!(news, again);

        let (_, created) = store.create_or_get_category("Marketing Digital", "").unwrap();
        assert!(created);
        assert!(store.category_by_slug("marketing-digital").is_some());

        let (rust, created) = store.create_or_get_tag("Rust Lang").unwrap();
        assert!(created);
        assert_eq!(rust.slug, "rust-lang");
        let (_, created) = store.create_or_get_tag("rust lang").unwrap();
        assert!(!created);
        assert_eq!(store.tags().len(), 1);
    }

    #[test]
    fn redirects_are_idempotent_per_site() {
        let mut store = store();
        assert!(store.create_redirect("/a/", "/blog/a/", true, "default").unwrap());
        assert!(!store.create_redirect("/a/", "/blog/b/", true, "default").unwrap());
        assert!(store.create_redirect("/a/", "/blog/a/", true, "other").unwrap());
        assert_eq!(store.redirects().len(), 2);
        assert_eq!(store.redirects()[0].new_path, "/blog/a/");
    }

    #[test]
    fn images_go_through_storage() {
        let dir = TempDir::new().unwrap();
        let mut store =
            ContentStore::in_memory(Box::new(FsStorage::new(dir.path(), "/media/")));
        let handle = store.create_image(b"bytes", "wp_1234abcd_a.png", "a").unwrap();
        assert_eq!(handle.path, "migrated_images/wp_1234abcd_a.png");
        assert_eq!(handle.url, "/media/migrated_images/wp_1234abcd_a.png");
        assert!(dir.path().join(&handle.path).exists());
    }

    #[test]
    fn store_survives_save_and_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        {
            let mut store =
                ContentStore::open(&path, Box::new(MemoryStorage::new("/media/"))).unwrap();
            let (_, blog) = store.seed_site("home", "blog").unwrap();
            let page = store.add_child(&blog, article("kept", "<p>k</p>")).unwrap();
            store.publish(&page).unwrap();
            store.create_redirect("/kept/", "/blog/kept/", true, "default").unwrap();
            store.save().unwrap();
        }

        let store = ContentStore::open(&path, Box::new(MemoryStorage::new("/media/"))).unwrap();
        let blog = store.find_parent_by_slug("blog").unwrap();
        let kept = store.find_child(&blog, "kept").unwrap();
        assert_eq!(kept.url_path, "/blog/kept/");
        assert!(store.redirect_exists("/kept/", "default"));
        assert_eq!(store.pages().len(), 3);
    }
}
