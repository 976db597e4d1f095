//! SQL dump lexer and value parser.
//!
//! This is not a SQL grammar. It understands exactly what `mysqldump` emits for
//! data tables: `INSERT INTO `table` [(`col`, ...)] VALUES (...),(...);` with
//! single- or double-quoted strings and backslash escapes. Everything between
//! statements (`CREATE TABLE`, comments, `LOCK TABLES`) is skipped, and every
//! statement, including those of other tables, is scanned quote-aware so that
//! SQL text embedded in post content never starts a false match.

use memchr::memmem;
use std::fmt;

const INSERT_KEYWORD: &[u8] = b"INSERT INTO";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlErrorKind {
    UnterminatedString,
    UnbalancedParens,
    ExpectedValues,
    ExpectedTuple,
}

/// Lexer failure with the byte offset (into the scanned text) where the bad
/// construct starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlError {
    pub kind: SqlErrorKind,
    pub offset: usize,
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            SqlErrorKind::UnterminatedString => "unterminated string",
            SqlErrorKind::UnbalancedParens => "unbalanced parentheses",
            SqlErrorKind::ExpectedValues => "expected VALUES keyword",
            SqlErrorKind::ExpectedTuple => "expected '(' to open a value tuple",
        };
        write!(f, "{what} at byte {}", self.offset)
    }
}

impl std::error::Error for SqlError {}

/// A literal as written in a dump.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

enum State {
    Searching,
    InValues,
    Done,
}

/// Iterator over the tuple bodies of every `INSERT INTO <table>` statement.
pub struct InsertTuples<'a> {
    text: &'a str,
    table: &'a str,
    finder: memmem::Finder<'static>,
    pos: usize,
    state: State,
}

/// Yields the body (without the enclosing parentheses) of each value tuple of
/// each `INSERT INTO <table>` statement, in dump order.
pub fn iter_inserts<'a>(text: &'a str, table: &'a str) -> InsertTuples<'a> {
    InsertTuples {
        text,
        table,
        finder: memmem::Finder::new(INSERT_KEYWORD),
        pos: 0,
        state: State::Searching,
    }
}

impl<'a> Iterator for InsertTuples<'a> {
    type Item = Result<&'a str, SqlError>;

    fn next(&mut self) -> Option<Self::Item> {
        let bytes = self.text.as_bytes();
        loop {
            match self.state {
                State::Done => return None,
                State::Searching => {
                    let Some(found) = self.finder.find(&bytes[self.pos..]) else {
                        self.state = State::Done;
                        return None;
                    };
                    let stmt_start = self.pos + found;
                    let mut p = stmt_start + INSERT_KEYWORD.len();
                    let name = read_table_name(bytes, &mut p);

                    if name != Some(self.table) {
                        self.pos = skip_statement(bytes, p);
                        continue;
                    }

                    p = skip_ws(bytes, p);
                    if bytes.get(p) == Some(&b'(') {
                        match scan_group(bytes, p) {
                            Ok(end) => p = end,
                            Err(e) => {
                                self.pos = p + 1;
                                return Some(Err(e));
                            }
                        }
                    }

                    p = skip_ws(bytes, p);
                    match match_keyword(bytes, p) {
                        Some(after) => {
                            self.pos = after;
                            self.state = State::InValues;
                        }
                        None => {
                            self.pos = skip_statement(bytes, p);
                            return Some(Err(SqlError {
                                kind: SqlErrorKind::ExpectedValues,
                                offset: p,
                            }));
                        }
                    }
                }
                State::InValues => {
                    let p = skip_ws(bytes, self.pos);
                    if bytes.get(p) != Some(&b'(') {
                        self.state = State::Searching;
                        self.pos = skip_statement(bytes, p);
                        return Some(Err(SqlError {
                            kind: SqlErrorKind::ExpectedTuple,
                            offset: p,
                        }));
                    }

                    match scan_group(bytes, p) {
                        Ok(end) => {
                            let body = &self.text[p + 1..end - 1];
                            let after = skip_ws(bytes, end);
                            match bytes.get(after) {
                                Some(b',') => self.pos = after + 1,
                                Some(b';') => {
                                    self.pos = after + 1;
                                    self.state = State::Searching;
                                }
                                _ => {
                                    self.pos = after;
                                    self.state = State::Searching;
                                }
                            }
                            return Some(Ok(body));
                        }
                        Err(e) => {
                            // The rest of this statement cannot be trusted; resync on
                            // the next INSERT keyword after the broken tuple.
                            self.pos = p + 1;
                            self.state = State::Searching;
                            return Some(Err(e));
                        }
                    }
                }
            }
        }
    }
}

fn skip_ws(bytes: &[u8], mut p: usize) -> usize {
    while p < bytes.len() && bytes[p].is_ascii_whitespace() {
        p += 1;
    }
    p
}

/// Reads a possibly qualified, possibly quoted table name. Returns the last
/// component (`db`.`wp_posts` yields `wp_posts`).
fn read_table_name<'a>(bytes: &'a [u8], p: &mut usize) -> Option<&'a str> {
    let mut last = None;
    loop {
        *p = skip_ws(bytes, *p);
        let start;
        let end;
        match bytes.get(*p) {
            Some(&q) if q == b'`' || q == b'"' => {
                start = *p + 1;
                let close = memchr::memchr(q, &bytes[start..])?;
                end = start + close;
                *p = end + 1;
            }
            Some(_) => {
                start = *p;
                while *p < bytes.len()
                    && (bytes[*p].is_ascii_alphanumeric() || bytes[*p] == b'_' || bytes[*p] == b'$')
                {
                    *p += 1;
                }
                end = *p;
                if start == end {
                    return last;
                }
            }
            None => return last,
        }
        last = std::str::from_utf8(&bytes[start..end]).ok();
        if bytes.get(*p) == Some(&b'.') {
            *p += 1;
        } else {
            return last;
        }
    }
}

fn match_keyword(bytes: &[u8], p: usize) -> Option<usize> {
    for kw in [&b"VALUES"[..], &b"VALUE"[..]] {
        if bytes.len() >= p + kw.len() && bytes[p..p + kw.len()].eq_ignore_ascii_case(kw) {
            return Some(p + kw.len());
        }
    }
    None
}

/// Given `bytes[start] == b'('`, returns the index just past the matching `)`.
fn scan_group(bytes: &[u8], start: usize) -> Result<usize, SqlError> {
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = start;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 2;
                    continue;
                }
                if b == q {
                    if bytes.get(i + 1) == Some(&q) {
                        i += 2;
                        continue;
                    }
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' | b'`' => quote = Some(b),
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(i + 1);
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }

    let kind = if quote.is_some() {
        SqlErrorKind::UnterminatedString
    } else {
        SqlErrorKind::UnbalancedParens
    };
    Err(SqlError {
        kind,
        offset: start,
    })
}

/// Index just past the `;` terminating the statement that contains `p`, or
/// the end of text. Unterminated strings run to the end of text.
fn skip_statement(bytes: &[u8], mut p: usize) -> usize {
    let mut quote: Option<u8> = None;
    while p < bytes.len() {
        let b = bytes[p];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    p += 2;
                    continue;
                }
                if b == q {
                    if bytes.get(p + 1) == Some(&q) {
                        p += 2;
                        continue;
                    }
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' | b'`' => quote = Some(b),
                b';' => return p + 1,
                _ => {}
            },
        }
        p += 1;
    }
    bytes.len()
}

/// Splits a tuple body on top-level commas. Quoted strings (either quote
/// style, backslash or doubled-quote escapes) and nested parentheses never
/// split. Values are returned trimmed and still in their raw, quoted form.
pub fn parse_tuple(body: &str) -> Result<Vec<&str>, SqlError> {
    let bytes = body.as_bytes();
    let mut values = Vec::new();
    let mut quote: Option<u8> = None;
    let mut depth = 0usize;
    let mut value_start = 0;
    let mut string_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 2;
                    continue;
                }
                if b == q {
                    if bytes.get(i + 1) == Some(&q) {
                        i += 2;
                        continue;
                    }
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' => {
                    quote = Some(b);
                    string_start = i;
                }
                b'(' => depth += 1,
                b')' => {
                    if depth == 0 {
                        return Err(SqlError {
                            kind: SqlErrorKind::UnbalancedParens,
                            offset: i,
                        });
                    }
                    depth -= 1;
                }
                b',' if depth == 0 => {
                    values.push(body[value_start..i].trim());
                    value_start = i + 1;
                }
                _ => {}
            },
        }
        i += 1;
    }

    if quote.is_some() {
        return Err(SqlError {
            kind: SqlErrorKind::UnterminatedString,
            offset: string_start,
        });
    }
    if depth != 0 {
        return Err(SqlError {
            kind: SqlErrorKind::UnbalancedParens,
            offset: value_start,
        });
    }

    let last = body[value_start..].trim();
    if !last.is_empty() || !values.is_empty() {
        values.push(last);
    }
    Ok(values)
}

/// Decodes one raw value. `NULL` (any case) becomes `None`; quoted strings
/// are unquoted and unescaped; anything else (numbers, bare words) is
/// returned as written for the caller to coerce.
pub fn clean(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("NULL") {
        return None;
    }

    let literal = strip_introducer(raw);
    let bytes = literal.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        if (first == b'\'' || first == b'"') && bytes[bytes.len() - 1] == first {
            return Some(unescape(&literal[1..literal.len() - 1], first as char));
        }
    }
    Some(raw.to_string())
}

/// Drops a charset introducer such as `_binary 'abc'` or `_utf8mb4'abc'`.
fn strip_introducer(raw: &str) -> &str {
    if !raw.starts_with('_') {
        return raw;
    }
    match raw.find(['\'', '"']) {
        Some(q)
            if raw[1..q]
                .trim_end()
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_') =>
        {
            &raw[q..]
        }
        _ => raw,
    }
}

fn unescape(inner: &str, quote: char) -> String {
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some('0') => out.push('\0'),
                Some('Z') => out.push('\x1a'),
                Some('b') => out.push('\x08'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else if c == quote && chars.peek() == Some(&quote) {
            chars.next();
            out.push(quote);
        } else {
            out.push(c);
        }
    }
    out
}

/// Quotes a string the way `mysqldump` does.
pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            '\x1a' => out.push_str("\\Z"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Renders a tuple body (without parentheses).
pub fn format_tuple(values: &[SqlValue]) -> String {
    values
        .iter()
        .map(|v| match v {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Int(i) => i.to_string(),
            SqlValue::Float(f) => f.to_string(),
            SqlValue::Text(s) => quote_string(s),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Renders a complete extended `INSERT` statement.
pub fn format_insert(table: &str, rows: &[Vec<SqlValue>]) -> String {
    let tuples = rows
        .iter()
        .map(|r| format!("({})", format_tuple(r)))
        .collect::<Vec<_>>()
        .join(",");
    format!("INSERT INTO `{table}` VALUES {tuples};\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bodies<'a>(text: &'a str, table: &'a str) -> Vec<&'a str> {
        iter_inserts(text, table).filter_map(Result::ok).collect()
    }

    #[test]
    fn single_insert_multiple_tuples() {
        let dump = "INSERT INTO `wp_terms` VALUES (1,'News','news',0),(2,'Tips','tips',0);";
        assert_eq!(
            bodies(dump, "wp_terms"),
            vec!["1,'News','news',0", "2,'Tips','tips',0"]
        );
    }

    #[test]
    fn multiple_statements_same_table() {
        let dump = "INSERT INTO `wp_terms` VALUES (1,'A','a',0);\n\
                    INSERT INTO `wp_posts` VALUES (9,'x');\n\
                    INSERT INTO `wp_terms` VALUES (2,'B','b',0),\n(3,'C','c',0);";
        assert_eq!(
            bodies(dump, "wp_terms"),
            vec!["1,'A','a',0", "2,'B','b',0", "3,'C','c',0"]
        );
        assert_eq!(bodies(dump, "wp_posts"), vec!["9,'x'"]);
    }

    #[test]
    fn complete_insert_column_list_is_skipped() {
        let dump = "INSERT INTO `wp_terms` (`term_id`, `name`, `slug`, `term_group`) VALUES (1,'A','a',0);";
        assert_eq!(bodies(dump, "wp_terms"), vec!["1,'A','a',0"]);
    }

    #[test]
    fn qualified_and_unquoted_table_names() {
        let dump = "INSERT INTO `site`.`wp_terms` VALUES (1,'A','a',0);\nINSERT INTO wp_terms VALUES (2,'B','b',0);";
        assert_eq!(bodies(dump, "wp_terms"), vec!["1,'A','a',0", "2,'B','b',0"]);
    }

    #[test]
    fn table_name_must_match_exactly() {
        let dump = "INSERT INTO `wp_termsmeta` VALUES (1,'A');";
        assert!(bodies(dump, "wp_terms").is_empty());
    }

    #[test]
    fn insert_text_inside_string_is_not_a_statement() {
        let dump = "INSERT INTO `wp_posts` VALUES (1,'see INSERT INTO `wp_terms` VALUES (99,\\'x\\',\\'x\\',0);');\n\
                    INSERT INTO `wp_terms` VALUES (1,'A','a',0);";
        assert_eq!(bodies(dump, "wp_terms"), vec!["1,'A','a',0"]);
    }

    #[test]
    fn parentheses_and_semicolons_inside_strings() {
        let dump = "INSERT INTO `t` VALUES (1,'a (b); c)'),(2,\"it's\");";
        assert_eq!(bodies(dump, "t"), vec!["1,'a (b); c)'", "2,\"it's\""]);
    }

    #[test]
    fn unterminated_string_yields_error_and_resyncs() {
        let dump = "INSERT INTO `t` VALUES (1,'oops);\nINSERT INTO `t` VALUES (2,'ok');";
        let items: Vec<_> = iter_inserts(dump, "t").collect();
        assert!(items.iter().any(|r| r.is_err()));
        let err = items.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(err.kind, SqlErrorKind::UnterminatedString);
    }

    #[test]
    fn missing_values_keyword_is_reported() {
        let dump = "INSERT INTO `t` SELECT * FROM other;\nINSERT INTO `t` VALUES (1);";
        let items: Vec<_> = iter_inserts(dump, "t").collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap_err().kind, SqlErrorKind::ExpectedValues);
        assert_eq!(items[1].as_ref().unwrap(), &"1");
    }

    #[test]
    fn parse_tuple_respects_quotes() {
        let values = parse_tuple("1, 'a,b', \"c,'d'\", NULL, 'it\\'s'").unwrap();
        assert_eq!(values, vec!["1", "'a,b'", "\"c,'d'\"", "NULL", "'it\\'s'"]);
    }

    #[test]
    fn parse_tuple_escaped_backslash_before_quote() {
        // 'a\\' is a complete string ending in a backslash.
        let values = parse_tuple("'a\\\\','b'").unwrap();
        assert_eq!(values, vec!["'a\\\\'", "'b'"]);
        assert_eq!(clean(values[0]).as_deref(), Some("a\\"));
    }

    #[test]
    fn parse_tuple_nested_parens() {
        let values = parse_tuple("1,CONCAT('a','b'),3").unwrap();
        assert_eq!(values, vec!["1", "CONCAT('a','b')", "3"]);
    }

    #[test]
    fn parse_tuple_unterminated() {
        let err = parse_tuple("1,'abc").unwrap_err();
        assert_eq!(err.kind, SqlErrorKind::UnterminatedString);
        assert_eq!(err.offset, 2);
    }

    #[test]
    fn parse_tuple_empty_values() {
        assert!(parse_tuple("").unwrap().is_empty());
        assert_eq!(parse_tuple("1,,3").unwrap(), vec!["1", "", "3"]);
    }

    #[test]
    fn clean_null_any_case() {
        assert_eq!(clean("NULL"), None);
        assert_eq!(clean("null"), None);
        assert_eq!(clean(" Null "), None);
    }

    #[test]
    fn clean_numbers_stay_strings() {
        assert_eq!(clean("42").as_deref(), Some("42"));
        assert_eq!(clean("-3.5").as_deref(), Some("-3.5"));
    }

    #[test]
    fn clean_decodes_escapes() {
        assert_eq!(clean(r"'it\'s'").as_deref(), Some("it's"));
        assert_eq!(clean(r#"'say \"hi\"'"#).as_deref(), Some("say \"hi\""));
        assert_eq!(clean(r"'a\\b'").as_deref(), Some("a\\b"));
        assert_eq!(clean(r"'line\nbreak'").as_deref(), Some("line\nbreak"));
        assert_eq!(clean("'it''s'").as_deref(), Some("it's"));
        assert_eq!(clean(r#""double""#).as_deref(), Some("double"));
    }

    #[test]
    fn clean_strips_charset_introducer() {
        assert_eq!(clean("_binary 'abc'").as_deref(), Some("abc"));
        assert_eq!(clean("_utf8mb4'x'").as_deref(), Some("x"));
    }

    #[test]
    fn clean_of_formatted_tuple_returns_original_values() {
        let values = vec![
            SqlValue::Text("<p class=\"x\">it's a \\ test\nline</p>".to_string()),
            SqlValue::Null,
            SqlValue::Int(-17),
            SqlValue::Text(String::new()),
            SqlValue::Text("tab\there, 'quoted', (parens)".to_string()),
        ];
        let body = format_tuple(&values);
        let raw = parse_tuple(&body).unwrap();
        assert_eq!(raw.len(), values.len());

        let cleaned: Vec<Option<String>> = raw.iter().map(|r| clean(r)).collect();
        assert_eq!(
            cleaned[0].as_deref(),
            Some("<p class=\"x\">it's a \\ test\nline</p>")
        );
        assert_eq!(cleaned[1], None);
        assert_eq!(cleaned[2].as_deref(), Some("-17"));
        assert_eq!(cleaned[3].as_deref(), Some(""));
        assert_eq!(cleaned[4].as_deref(), Some("tab\there, 'quoted', (parens)"));
    }

    #[test]
    fn format_insert_is_readable_by_iter_inserts() {
        let stmt = format_insert(
            "wp_terms",
            &[
                vec![SqlValue::Int(1), "News".into(), "news".into(), SqlValue::Int(0)],
                vec![SqlValue::Int(2), "Tips; (new)".into(), "tips".into(), SqlValue::Int(0)],
            ],
        );
        let found = bodies(&stmt, "wp_terms");
        assert_eq!(found.len(), 2);
        assert_eq!(clean(parse_tuple(found[1]).unwrap()[1]).as_deref(), Some("Tips; (new)"));
    }
}
