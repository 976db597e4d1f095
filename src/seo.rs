use crate::config::{
    KEYWORD_MIN_CHARS, META_DESCRIPTION_MAX_CHARS, META_KEYWORDS_MAX, READING_TIME_MAX,
    READING_TIME_MIN, READING_WORDS_PER_MINUTE,
};
use crate::content::strip_html;
use crate::models::SeoMeta;
use rustc_hash::FxHashMap;

/// Portuguese and English function words never used as keywords
const STOP_WORDS: &[&str] = &[
    // pt
    "para", "como", "mais", "mas", "pelo", "pela", "pelos", "pelas", "sobre", "entre", "quando",
    "onde", "porque", "qual", "quais", "quem", "isso", "isto", "esse", "essa", "esses", "essas",
    "este", "esta", "estes", "estas", "aquele", "aquela", "seus", "suas", "dele", "dela", "deles",
    "delas", "nosso", "nossa", "nossos", "nossas", "voce", "você", "vocês", "eles", "elas", "muito",
    "muita", "muitos", "muitas", "também", "tambem", "ainda", "apenas", "sempre", "nunca", "todo",
    "toda", "todos", "todas", "cada", "outro", "outra", "outros", "outras", "mesmo", "mesma",
    "depois", "antes", "desde", "até", "após", "pode", "podem", "será", "serão", "sendo", "foram",
    "está", "estão", "estar", "seja", "sejam", "fazer", "feito", "tem", "têm", "temos", "tinha",
    "havia", "aqui", "assim", "então", "já", "não", "sim", "nem", "num", "numa", "uma", "umas",
    "uns", "dos", "das", "nas", "nos", "com", "sem", "por", "que", "ser", "são", "foi", "era",
    // en
    "the", "and", "that", "this", "with", "from", "have", "has", "had", "were", "was", "will",
    "would", "could", "should", "there", "their", "them", "they", "then", "than", "what", "when",
    "where", "which", "while", "who", "whom", "your", "yours", "about", "into", "over", "under",
    "also", "just", "only", "some", "such", "very", "more", "most", "other", "been", "being",
    "does", "done", "each", "here", "these", "those", "upon", "after", "before", "because",
    "through", "between",
];

/// URL-safe slug: Latin accents transliterated, lowercase ASCII letters,
/// digits and single hyphens, no leading or trailing hyphen.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_hyphen = false;

    let mut push = |c: char| {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() || c == '_' {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c);
        } else if c.is_whitespace() || c == '-' {
            pending_hyphen = true;
        }
    };

    for c in text.chars() {
        if c.is_ascii() {
            push(c);
        } else {
            transliterate(c).chars().for_each(&mut push);
        }
    }
    slug.trim_matches(|c| c == '-' || c == '_').to_string()
}

/// ASCII replacement for a non-ASCII character; empty when there is none.
fn transliterate(c: char) -> &'static str {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ª' => "a",
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => "A",
        'ç' => "c",
        'Ç' => "C",
        'è' | 'é' | 'ê' | 'ë' => "e",
        'È' | 'É' | 'Ê' | 'Ë' => "E",
        'ì' | 'í' | 'î' | 'ï' => "i",
        'Ì' | 'Í' | 'Î' | 'Ï' => "I",
        'ñ' => "n",
        'Ñ' => "N",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'º' => "o",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => "O",
        'ù' | 'ú' | 'û' | 'ü' => "u",
        'Ù' | 'Ú' | 'Û' | 'Ü' => "U",
        'ý' | 'ÿ' => "y",
        'Ý' => "Y",
        'æ' => "ae",
        'Æ' => "AE",
        'ß' => "ss",
        'œ' => "oe",
        'Œ' => "OE",
        '\u{a0}' => " ",
        '–' | '—' => "-",
        _ => "",
    }
}

pub fn word_count(html: &str) -> usize {
    strip_html(html).split_whitespace().count()
}

/// Minutes at 200 words per minute, clamped to 1..=60.
pub fn reading_time(html: &str) -> u32 {
    let words = word_count(html);
    let minutes = words.div_ceil(READING_WORDS_PER_MINUTE);
    (minutes.min(READING_TIME_MAX as usize) as u32).max(READING_TIME_MIN)
}

/// First 160 characters of the intro.
pub fn meta_description(intro: &str) -> String {
    truncate_chars(intro.trim(), META_DESCRIPTION_MAX_CHARS)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].trim_end().to_string(),
        None => text.to_string(),
    }
}

/// Most frequent words of at least four characters, stop words excluded,
/// ties broken by first occurrence.
pub fn meta_keywords(title: &str, body_html: &str) -> Vec<String> {
    let text = format!("{} {}", title, strip_html(body_html)).to_lowercase();

    // word -> (count, first position)
    let mut counts: FxHashMap<&str, (usize, usize)> = FxHashMap::default();
    for (position, word) in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| is_keyword_candidate(w))
        .enumerate()
    {
        counts.entry(word).or_insert((0, position)).0 += 1;
    }

    let mut ranked: Vec<_> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    ranked
        .into_iter()
        .take(META_KEYWORDS_MAX)
        .map(|(word, _)| word.to_string())
        .collect()
}

fn is_keyword_candidate(word: &str) -> bool {
    word.chars().count() >= KEYWORD_MIN_CHARS
        && !word.chars().all(|c| c.is_ascii_digit())
        && !STOP_WORDS.contains(&word)
}

/// SEO block for a standard page. Yoast values, when present, win over the
/// derived description and lead the keyword list.
pub fn build_seo(
    title: &str,
    body_html: &str,
    intro: &str,
    yoast_description: Option<&str>,
    yoast_focus_keyword: Option<&str>,
) -> SeoMeta {
    let description = match yoast_description.map(str::trim).filter(|d| !d.is_empty()) {
        Some(desc) => truncate_chars(desc, META_DESCRIPTION_MAX_CHARS),
        None => meta_description(intro),
    };

    let mut keywords = Vec::with_capacity(META_KEYWORDS_MAX);
    if let Some(focus) = yoast_focus_keyword.map(str::trim).filter(|f| !f.is_empty()) {
        keywords.push(focus.to_lowercase());
    }
    for word in meta_keywords(title, body_html) {
        if keywords.len() == META_KEYWORDS_MAX {
            break;
        }
        if !keywords.contains(&word) {
            keywords.push(word);
        }
    }

    SeoMeta {
        description,
        keywords,
    }
}
