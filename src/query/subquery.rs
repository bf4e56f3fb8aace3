//! FROM-clause subqueries.
//!
//! Detection works on raw text with parenthesis-depth counting so nested
//! parentheses inside the inner statement (function calls, IN lists) do not
//! end the subquery early. Quoted strings are skipped while counting.

use bson::{Bson, Document};
use regex::Regex;
use std::ops::Range;
use std::sync::OnceLock;

use super::builder::QueryBuilder;
use super::parser::Compiler;
use super::plan::{ExecutionPlan, QueryPlan};

/// Alias used when a wrapped subquery has none
pub const DEFAULT_SUBQUERY_ALIAS: &str = "subquery_result";

/// Words that may follow a subquery's close paren but are never its alias
const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "LIMIT", "OFFSET", "HAVING", "JOIN", "INNER", "LEFT", "RIGHT",
    "FULL", "CROSS", "OUTER", "ON", "UNION", "EXCEPT", "INTERSECT", "WINDOW", "FETCH",
];

/// A `( SELECT ... ) [AS] alias` fragment located inside some text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedSubquery {
    /// Inner statement text, without the parentheses
    pub inner: String,
    pub alias: Option<String>,
    /// Byte range from the open paren through the alias (or close paren)
    pub span: Range<usize>,
}

impl WrappedSubquery {
    pub fn alias_or_default(&self) -> &str {
        self.alias.as_deref().unwrap_or(DEFAULT_SUBQUERY_ALIAS)
    }

    /// Replace the subquery fragment in `sql` with a table reference
    pub fn rewrite_outer(&self, sql: &str, table: &str) -> String {
        let mut out = String::with_capacity(sql.len());
        out.push_str(&sql[..self.span.start]);
        out.push_str(table);
        out.push_str(&sql[self.span.end..]);
        out
    }
}

/// Index of the paren closing the one at `open`, skipping quoted text
fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' | b'`' => quote = Some(b),
            b'(' => depth += 1,
            b')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn contains_select(text: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bSELECT\b").expect("valid select regex"))
        .is_match(text)
}

/// Read the alias after a close paren; returns the alias and the end offset consumed
fn read_alias(text: &str, from: usize) -> (Option<String>, usize) {
    let rest = &text[from..];
    let trimmed_start = rest.len() - rest.trim_start().len();
    let mut cursor = from + trimmed_start;

    let word = |start: usize| -> Option<(String, usize)> {
        let tail = &text[start..];
        if let Some(stripped) = tail.strip_prefix('"') {
            let end = stripped.find('"')?;
            return Some((stripped[..end].to_string(), start + end + 2));
        }
        let len = tail
            .char_indices()
            .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
            .map(|(i, _)| i)
            .unwrap_or(tail.len());
        if len == 0 {
            None
        } else {
            Some((tail[..len].to_string(), start + len))
        }
    };

    let Some((first, after_first)) = word(cursor) else {
        return (None, from);
    };

    let (candidate, end) = if first.eq_ignore_ascii_case("AS") {
        let tail = &text[after_first..];
        cursor = after_first + (tail.len() - tail.trim_start().len());
        match word(cursor) {
            Some(found) => found,
            None => return (None, from),
        }
    } else {
        (first, after_first)
    };

    if CLAUSE_KEYWORDS
        .iter()
        .any(|k| k.eq_ignore_ascii_case(&candidate))
    {
        (None, from)
    } else {
        (Some(candidate), end)
    }
}

/// Detect a wrapped subquery: after trimming, `text` starts with `(` and
/// contains `SELECT` before the matching close paren.
pub fn find_wrapped_subquery(text: &str) -> Option<WrappedSubquery> {
    let leading = text.len() - text.trim_start().len();
    if !text[leading..].starts_with('(') {
        return None;
    }
    let close = matching_paren(text, leading)?;
    let inner = &text[leading + 1..close];
    if !contains_select(inner) {
        return None;
    }
    let (alias, end) = read_alias(text, close + 1);
    Some(WrappedSubquery {
        inner: respace_keywords(inner.trim()),
        alias,
        span: leading..end,
    })
}

/// Locate `FROM ( SELECT ... ) [AS] alias` in a full statement, at paren depth 0
pub fn detect_from_subquery(sql: &str) -> Option<WrappedSubquery> {
    let bytes = sql.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' | b'`' => quote = Some(b),
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b'f' | b'F' if depth == 0 && is_keyword_at(sql, i, "FROM") => {
                let after = i + 4;
                if let Some(found) = find_wrapped_subquery(&sql[after..]) {
                    return Some(WrappedSubquery {
                        span: found.span.start + after..found.span.end + after,
                        ..found
                    });
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn is_keyword_at(text: &str, at: usize, keyword: &str) -> bool {
    let end = at + keyword.len();
    if end > text.len() || !text.is_char_boundary(end) {
        return false;
    }
    let before_ok = at == 0
        || !text[..at]
            .chars()
            .next_back()
            .map(|c| c.is_alphanumeric() || c == '_')
            .unwrap_or(false);
    let after_ok = !text[end..]
        .chars()
        .next()
        .map(|c| c.is_alphanumeric() || c == '_')
        .unwrap_or(false);
    before_ok && after_ok && text[at..end].eq_ignore_ascii_case(keyword)
}

fn keyword_repairs() -> &'static [(Regex, &'static str); 2] {
    static RE: OnceLock<[(Regex, &'static str); 2]> = OnceLock::new();
    RE.get_or_init(|| {
        let keywords = "SELECT|FROM|WHERE|AND|OR|NOT|IN|LIKE|BETWEEN|GROUP|ORDER|BY|LIMIT|OFFSET|AS|IS";
        [
            (
                Regex::new(&format!(r"(?i)([)\]'])({})\b", keywords)).expect("valid repair regex"),
                "$1 $2",
            ),
            (
                Regex::new(&format!(r"(?i)\b({})([('])", keywords)).expect("valid repair regex"),
                "$1 $2",
            ),
        ]
    })
}

/// Re-space keywords glued to punctuation (`'x'AND`, `WHERE(a`) and collapse
/// whitespace runs. Text inside quotes is not touched.
pub fn respace_keywords(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut segment = String::new();
    let mut chars = text.chars();

    let flush = |segment: &mut String, out: &mut String| {
        // previous output char gives the regexes their left context
        let context = out.chars().next_back();
        let mut repaired = String::with_capacity(segment.len() + 1);
        repaired.extend(context);
        repaired.push_str(segment);
        for (re, replacement) in keyword_repairs() {
            repaired = re.replace_all(&repaired, *replacement).into_owned();
        }
        let body = match context {
            Some(c) => &repaired[c.len_utf8()..],
            None => repaired.as_str(),
        };
        let mut last_space = out.ends_with(' ');
        for c in body.chars() {
            if c.is_whitespace() {
                if !last_space {
                    out.push(' ');
                }
                last_space = true;
            } else {
                out.push(c);
                last_space = false;
            }
        }
        segment.clear();
    };

    while let Some(c) = chars.next() {
        if c == '\'' || c == '"' {
            segment.push(c);
            flush(&mut segment, &mut out);
            // the quote itself was flushed; copy the quoted body verbatim
            for inner in chars.by_ref() {
                out.push(inner);
                if inner == c {
                    break;
                }
            }
        } else {
            segment.push(c);
        }
    }
    flush(&mut segment, &mut out);
    out.trim().to_string()
}

fn strip_prefix_key(key: &str, prefix: &str) -> String {
    key.strip_prefix(prefix).unwrap_or(key).to_string()
}

/// Strip `alias.` from filter keys, recursing through operator arrays and sub-documents
pub fn strip_filter_prefix(filter: &Document, alias: &str) -> Document {
    let prefix = format!("{}.", alias);
    let mut out = Document::new();
    for (key, value) in filter {
        out.insert(strip_prefix_key(key, &prefix), strip_value_prefix(value, alias));
    }
    out
}

fn strip_value_prefix(value: &Bson, alias: &str) -> Bson {
    match value {
        Bson::Document(doc) => Bson::Document(strip_filter_prefix(doc, alias)),
        Bson::Array(items) => Bson::Array(items.iter().map(|v| strip_value_prefix(v, alias)).collect()),
        other => other.clone(),
    }
}

/// Strip `alias.` from every field reference staged in a query builder
pub fn strip_alias_prefix(builder: &mut QueryBuilder, alias: &str) {
    let prefix = format!("{}.", alias);

    let projection = std::mem::take(&mut builder.projection);
    for (key, value) in projection {
        builder.projection.insert(strip_prefix_key(&key, &prefix), value);
    }

    for column in builder.column_aliases.iter_mut() {
        let unaliased = column.field == column.alias;
        column.field = strip_prefix_key(&column.field, &prefix);
        if unaliased {
            column.alias = column.field.clone();
        }
    }

    builder.projection_functions = std::mem::take(&mut builder.projection_functions)
        .into_iter()
        .map(|(output, mut call)| {
            call.field = strip_prefix_key(&call.field, &prefix);
            (strip_prefix_key(&output, &prefix), call)
        })
        .collect();

    for key in builder.sort.iter_mut() {
        key.field = strip_prefix_key(&key.field, &prefix);
    }

    builder.filter = strip_filter_prefix(&builder.filter, alias);
}

/// Fold an inner plan into the outer builder
fn apply_inner(builder: &mut QueryBuilder, inner: QueryPlan, alias: Option<String>) {
    if let Some(alias) = alias.as_deref() {
        strip_alias_prefix(builder, alias);
    }

    // The inner window has to cut rows before the outer WHERE/ORDER BY sees them
    let inner_windowed = inner.limit().is_some() || inner.skip().is_some();
    let outer_reshapes = !builder.filter.is_empty() || !builder.sort.is_empty();
    if inner_windowed && outer_reshapes && !inner.is_aggregate() {
        tracing::debug!(
            collection = %inner.collection(),
            "inner LIMIT/OFFSET precedes outer clauses; staging subquery"
        );
        builder.collection = Some(inner.collection().to_string());
        builder.subquery_alias = alias;
        builder.subquery_plan = Some(Box::new(inner));
        builder.staged_subquery = true;
        return;
    }

    if !inner.filter().is_empty() {
        builder.filter = if builder.filter.is_empty() {
            inner.filter().clone()
        } else {
            let outer = std::mem::take(&mut builder.filter);
            bson::doc! { "$and": [inner.filter().clone(), outer] }
        };
    }

    if builder.projection.is_empty() && builder.projection_functions.is_empty() {
        builder.projection = inner.projection().clone();
        builder.column_aliases = inner.column_aliases().to_vec();
        builder.projection_functions = inner.projection_functions().clone();
    }

    if builder.sort.is_empty() {
        builder.sort = inner.sort().to_vec();
    }

    let outer_skip = builder.skip.unwrap_or(0);
    let inner_skip = inner.skip().unwrap_or(0);
    if inner.skip().is_some() {
        builder.skip = Some(inner_skip + outer_skip);
    }
    if let Some(inner_limit) = inner.limit() {
        let remaining = inner_limit.saturating_sub(outer_skip);
        builder.limit = Some(builder.limit.map_or(remaining, |l| l.min(remaining)));
    }

    builder.collection = Some(inner.collection().to_string());
    builder.subquery_alias = alias;
    builder.subquery_plan = Some(Box::new(inner));
}

/// Resolve a FROM-clause subquery into the outer builder.
///
/// Returns false when `from_text` is not a wrapped subquery. When the inner
/// statement cannot be compiled the raw text becomes the collection name and
/// a warning is logged.
pub fn resolve(from_text: &str, builder: &mut QueryBuilder, compiler: &Compiler) -> bool {
    let Some(wrapped) = find_wrapped_subquery(from_text) else {
        return false;
    };

    match compiler.compile(&wrapped.inner) {
        Ok(ExecutionPlan::Query(inner)) => {
            tracing::debug!(
                inner = %wrapped.inner,
                alias = ?wrapped.alias,
                collection = %inner.collection(),
                "resolved FROM subquery"
            );
            apply_inner(builder, inner, wrapped.alias);
        }
        Ok(other) => {
            tracing::warn!(
                kind = other.kind(),
                "FROM subquery is not a SELECT; using raw text as collection"
            );
            builder.collection = Some(from_text.trim().to_string());
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse FROM subquery; using raw text as collection");
            builder.collection = Some(from_text.trim().to_string());
        }
    }
    true
}
