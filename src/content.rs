use crate::models::ImageHandle;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use rustc_hash::FxHashSet;

static SCRIPT_BLOCK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").unwrap());

static STYLE_BLOCK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>").unwrap());

/// Unbalanced leftovers of the two blocks above
static STRAY_SCRIPT_TAG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</?(?:script|style)\b[^>]*>").unwrap());

static GALLERY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[gallery\b[^\]]*\]").unwrap());

static CAPTION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\[caption\b[^\]]*\](.*?)\[/caption\]").unwrap());

static EMBED_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\[embed\b[^\]]*\](.*?)\[/embed\]").unwrap());

static VIDEO_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\[video\b[^\]]*\](.*?)\[/video\]").unwrap());

static AUDIO_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\[audio\b[^\]]*\](.*?)\[/audio\]").unwrap());

static STRAY_SHORTCODE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[/?(?:caption|gallery)\b[^\]]*\]").unwrap());

static SHORTCODE_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([A-Za-z][A-Za-z0-9_-]*)(?:\s[^\]]*)?\]").unwrap());

static WP_ATTRIBUTE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\s+(?:class|id)\s*=\s*(?:"[^"]*wp-[^"]*"|'[^']*wp-[^']*')"#).unwrap()
});

static EMPTY_P_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<p\b[^>]*>\s*</p\s*>").unwrap());

static EMPTY_DIV_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<div\b[^>]*>\s*</div\s*>").unwrap());

static BLANK_LINES_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t\r]*(?:\n[ \t\r]*)+").unwrap());

static IMG_TAG_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<img\b[^>]*>").unwrap());

static SRC_ATTR_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bsrc\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap());

static ALT_ATTR_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\balt\s*=").unwrap());

static TAG_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

static ENTITY_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(?:nbsp|amp|quot|lt|gt|#39|#8217|#8216|#8220|#8221|#8211|#8212|hellip);").unwrap());

/// Shortcodes the sanitizer knows how to expand or drop
const HANDLED_SHORTCODES: &[&str] = &["gallery", "caption", "embed", "video", "audio"];

/// Cleans WordPress HTML for the target rich-text store.
pub fn sanitize(html: &str) -> String {
    sanitize_with_report(html).0
}

/// Like [`sanitize`], also returning the names of shortcodes that were left
/// untouched, once each, in order of first appearance.
pub fn sanitize_with_report(html: &str) -> (String, Vec<String>) {
    let text = strip_scripts(html);
    let unknown = unknown_shortcodes(&text);
    let text = expand_shortcodes(&text);
    let text = WP_ATTRIBUTE_REGEX.replace_all(&text, "");
    let text = remove_empty_blocks(&text);
    let text = BLANK_LINES_REGEX.replace_all(&text, "\n\n");
    (text.trim().to_string(), unknown)
}

fn strip_scripts(html: &str) -> String {
    let text = SCRIPT_BLOCK_REGEX.replace_all(html, "");
    let text = STYLE_BLOCK_REGEX.replace_all(&text, "");
    STRAY_SCRIPT_TAG_REGEX.replace_all(&text, "").into_owned()
}

fn expand_shortcodes(text: &str) -> String {
    let text = GALLERY_REGEX.replace_all(text, "");
    let text = CAPTION_REGEX.replace_all(&text, "$1");
    let text = EMBED_REGEX.replace_all(&text, "$1");
    let text = VIDEO_REGEX.replace_all(&text, "<video controls>$1</video>");
    let text = AUDIO_REGEX.replace_all(&text, "<audio controls>$1</audio>");
    STRAY_SHORTCODE_REGEX.replace_all(&text, "").into_owned()
}

fn unknown_shortcodes(text: &str) -> Vec<String> {
    let mut seen = FxHashSet::default();
    let mut names = Vec::new();
    for caps in SHORTCODE_NAME_REGEX.captures_iter(text) {
        let name = caps[1].to_ascii_lowercase();
        if HANDLED_SHORTCODES.contains(&name.as_str()) {
            continue;
        }
        if seen.insert(name.clone()) {
            names.push(name);
        }
    }
    names
}

/// Removing `<p></p>` can empty its parent `<div>`, so iterate to a fixed point.
fn remove_empty_blocks(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let next = EMPTY_P_REGEX.replace_all(&current, "");
        let next = EMPTY_DIV_REGEX.replace_all(&next, "").into_owned();
        if next == current {
            return current;
        }
        current = next;
    }
}

/// `src` values of every `<img>` tag, deduplicated, in document order.
pub fn extract_image_urls(html: &str) -> Vec<String> {
    let mut seen = FxHashSet::default();
    IMG_TAG_REGEX
        .find_iter(html)
        .filter_map(|tag| src_value(tag.as_str()))
        .map(|src| src.trim().to_string())
        .filter(|src| !src.is_empty() && seen.insert(src.clone()))
        .collect()
}

fn src_value(tag: &str) -> Option<&str> {
    SRC_ATTR_REGEX
        .captures(tag)
        .and_then(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str())
}

/// Plain text: tags removed, common entities decoded, whitespace collapsed.
pub fn strip_html(html: &str) -> String {
    let text = TAG_REGEX.replace_all(html, " ");
    let text = ENTITY_REGEX.replace_all(&text, |caps: &Captures| {
        match &caps[0] {
            "&nbsp;" => " ",
            "&amp;" => "&",
            "&quot;" | "&#8220;" | "&#8221;" => "\"",
            "&lt;" => "<",
            "&gt;" => ">",
            "&#39;" | "&#8217;" | "&#8216;" => "'",
            "&#8211;" | "&#8212;" => "-",
            "&hellip;" => "...",
            _ => "",
        }
        .to_string()
    });
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Plain-text excerpt of at most `max_len` characters plus an ellipsis,
/// cut at a word boundary when one exists.
pub fn extract_excerpt(html: &str, max_len: usize) -> String {
    let text = strip_html(html);
    if text.chars().count() <= max_len {
        return text;
    }

    let cut = text
        .char_indices()
        .nth(max_len)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let head = &text[..cut];
    let head = match head.rfind(' ') {
        Some(space) if space > 0 => &head[..space],
        _ => head,
    };
    format!("{}...", head.trim_end())
}

/// Rewrites `<img>` tags whose `src` the resolver maps to a stored image.
/// Tags the resolver declines keep their original `src`. Resolver errors abort
/// the rewrite. Returns the new HTML and the number of tags rewritten.
pub fn rewrite_images<F>(html: &str, mut resolve: F) -> Result<(String, usize)>
where
    F: FnMut(&str) -> Result<Option<ImageHandle>>,
{
    let mut out = String::with_capacity(html.len());
    let mut last = 0;
    let mut rewritten = 0;

    for tag in IMG_TAG_REGEX.find_iter(html) {
        out.push_str(&html[last..tag.start()]);
        last = tag.end();

        let original = tag.as_str();
        let handle = match src_value(original) {
            Some(src) => resolve(src.trim())?,
            None => None,
        };
        match handle {
            Some(handle) => {
                out.push_str(&rewrite_tag(original, &handle));
                rewritten += 1;
            }
            None => out.push_str(original),
        }
    }
    out.push_str(&html[last..]);
    Ok((out, rewritten))
}

fn rewrite_tag(tag: &str, handle: &ImageHandle) -> String {
    let src = format!("src=\"{}\"", escape_attribute(&handle.url));
    let mut tag = SRC_ATTR_REGEX
        .replace(tag, regex::NoExpand(&src))
        .into_owned();

    if !ALT_ATTR_REGEX.is_match(&tag) {
        let alt = format!(" alt=\"{}\"", escape_attribute(&handle.title));
        let head = tag.strip_suffix('>').unwrap_or(tag.as_str()).trim_end();
        let head = head.strip_suffix('/').unwrap_or(head).trim_end();
        let insert_at = head.len();
        tag.insert_str(insert_at, &alt);
    }
    tag
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(url: &str, title: &str) -> ImageHandle {
        ImageHandle {
            id: 1,
            title: title.to_string(),
            path: "migrated_images/a.jpg".to_string(),
            url: url.to_string(),
        }
    }

    #[test]
    fn strips_script_and_style() {
        assert_eq!(
            sanitize("<p>x</p><script>alert(1)</script><p>y</p>"),
            "<p>x</p><p>y</p>"
        );
        assert_eq!(
            sanitize("<STYLE type=\"text/css\">\np { color: red }\n</STYLE><p>ok</p>"),
            "<p>ok</p>"
        );
        let out = sanitize("<p>a</p><script src=\"x.js\">");
        assert!(!out.to_lowercase().contains("<script"));
    }

    #[test]
    fn expands_caption_and_removes_gallery() {
        let out = sanitize(r#"[caption id="1"]<img src="http://ex/a.jpg"/> c[/caption][gallery ids="1,2"]"#);
        assert_eq!(out, r#"<img src="http://ex/a.jpg"/> c"#);
        assert!(!out.contains("[caption"));
        assert!(!out.contains("[gallery"));
    }

    #[test]
    fn stray_caption_tokens_are_removed() {
        let out = sanitize("<p>[caption id=\"x\"]text</p>");
        assert_eq!(out, "<p>text</p>");
    }

    #[test]
    fn expands_media_shortcodes() {
        assert_eq!(
            sanitize("[embed]https://youtu.be/abc[/embed]"),
            "https://youtu.be/abc"
        );
        assert_eq!(
            sanitize(r#"[video width="640"]http://ex/v.mp4[/video]"#),
            "<video controls>http://ex/v.mp4</video>"
        );
        assert_eq!(
            sanitize("[audio]http://ex/a.mp3[/audio]"),
            "<audio controls>http://ex/a.mp3</audio>"
        );
    }

    #[test]
    fn reports_unknown_shortcodes_once() {
        let (out, unknown) =
            sanitize_with_report("[contact-form-7 id=\"3\"] [su_button]x[/su_button] [contact-form-7]");
        assert_eq!(unknown, vec!["contact-form-7", "su_button"]);
        assert!(out.contains("[contact-form-7 id=\"3\"]"));
    }

    #[test]
    fn strips_wordpress_attributes() {
        let out = sanitize(r#"<img class="wp-image-12 size-full" src="a.jpg"><p id="wp-block-1" class="lead">t</p>"#);
        assert_eq!(out, r#"<img src="a.jpg"><p class="lead">t</p>"#);
    }

    #[test]
    fn removes_nested_empty_blocks() {
        assert_eq!(sanitize("<div class=\"x\"><p> </p>\n</div><p>a</p>"), "<p>a</p>");
    }

    #[test]
    fn collapses_blank_lines() {
        assert_eq!(sanitize("<p>a</p>\n\n\n\n<p>b</p>\n"), "<p>a</p>\n\n<p>b</p>");
    }

    #[test]
    fn image_urls_in_order_without_duplicates() {
        let html = r#"<img src="http://ex/a.jpg"><p><IMG alt='x' SRC='http://ex/b.png' /></p><img src="http://ex/a.jpg">"#;
        assert_eq!(
            extract_image_urls(html),
            vec!["http://ex/a.jpg", "http://ex/b.png"]
        );
    }

    #[test]
    fn excerpt_truncates_at_word_boundary() {
        let html = "<p>The quick   brown</p>\n<p>fox jumps</p>";
        assert_eq!(extract_excerpt(html, 100), "The quick brown fox jumps");
        assert_eq!(extract_excerpt(html, 12), "The quick...");
    }

    #[test]
    fn excerpt_decodes_entities() {
        assert_eq!(extract_excerpt("<p>Tom&nbsp;&amp;&nbsp;Jerry</p>", 250), "Tom & Jerry");
    }

    #[test]
    fn excerpt_counts_characters_not_bytes() {
        let html = "ação ação ação";
        assert_eq!(extract_excerpt(html, 9), "ação...");
    }

    #[test]
    fn rewrite_replaces_src_and_adds_alt() {
        let html = r#"<p><img src="http://ex/a.jpg"/> c</p>"#;
        let (out, n) = rewrite_images(html, |url| {
            assert_eq!(url, "http://ex/a.jpg");
            Ok(Some(handle("/media/migrated_images/a.jpg", "a")))
        })
        .unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            out,
            r#"<p><img src="/media/migrated_images/a.jpg" alt="a"/> c</p>"#
        );
    }

    #[test]
    fn alt_goes_before_a_spaced_self_closing_slash() {
        let (out, _) = rewrite_images(r#"<img src="http://ex/a.jpg" / >"#, |_| {
            Ok(Some(handle("/m/a.jpg", "t")))
        })
        .unwrap();
        assert_eq!(out, r#"<img src="/m/a.jpg" alt="t" / >"#);

        let (out, _) = rewrite_images(r#"<img src="http://ex/a.jpg" />"#, |_| {
            Ok(Some(handle("/m/a.jpg", "t")))
        })
        .unwrap();
        assert_eq!(out, r#"<img src="/m/a.jpg" alt="t" />"#);
    }

    #[test]
    fn rewrite_keeps_existing_alt() {
        let html = r#"<img alt="Kept" src='http://ex/a.jpg'>"#;
        let (out, _) =
            rewrite_images(html, |_| Ok(Some(handle("/m/a.jpg", "Title")))).unwrap();
        assert_eq!(out, r#"<img alt="Kept" src="/m/a.jpg">"#);
    }

    #[test]
    fn rewrite_leaves_declined_images_untouched() {
        let html = r#"<img src="http://ex/huge.png"><img src="http://ex/ok.png">"#;
        let (out, n) = rewrite_images(html, |url| {
            Ok(url
                .ends_with("ok.png")
                .then(|| handle("/m/ok.png", "ok \"quoted\"")))
        })
        .unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            out,
            r#"<img src="http://ex/huge.png"><img src="/m/ok.png" alt="ok &quot;quoted&quot;">"#
        );
    }

    #[test]
    fn rewrite_propagates_resolver_errors() {
        let result = rewrite_images("<img src=\"http://ex/a.jpg\">", |_| {
            anyhow::bail!("disk full")
        });
        assert!(result.is_err());
    }
}
