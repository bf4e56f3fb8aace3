use bson::{doc, Bson};
use regex::Regex;
use std::sync::OnceLock;

/// Typed scalar produced from raw token text
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Quoted string with the quotes stripped
    Str(String),
    Placeholder(Placeholder),
    /// Anything unrecognized, returned as-is (often a field reference)
    Verbatim(String),
}

/// Bind marker inside a statement
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Placeholder {
    /// `?`
    Positional,
    /// `:name`
    Named(String),
}

/// Key of the reserved document that stands for a bind marker inside a plan
pub const PLACEHOLDER_KEY: &str = "$placeholder";
/// Set on a marker whose bound value is a LIKE pattern
pub const LIKE_PATTERN_KEY: &str = "$like";

impl Placeholder {
    /// Marker text as written in SQL
    pub fn marker(&self) -> String {
        match self {
            Placeholder::Positional => "?".to_string(),
            Placeholder::Named(name) => format!(":{}", name),
        }
    }

    /// `{"$placeholder": "?"}`. A quoted `'?'` stays a plain string, so only
    /// real bind markers take this form.
    pub fn to_bson(&self) -> Bson {
        Bson::Document(doc! { PLACEHOLDER_KEY: self.marker() })
    }

    /// Marker whose bound value is converted from LIKE syntax to a regex
    pub fn to_like_bson(&self) -> Bson {
        Bson::Document(doc! { PLACEHOLDER_KEY: self.marker(), LIKE_PATTERN_KEY: true })
    }
}

fn integer_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[+-]?\d+$").expect("valid integer regex"))
}

fn decimal_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[+-]?(\d+\.\d*|\.\d+|\d+)([eE][+-]?\d+)?$").expect("valid decimal regex")
    })
}

fn named_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^:([A-Za-z_][A-Za-z0-9_]*)$").expect("valid placeholder regex"))
}

/// Parse raw token text into a typed literal.
///
/// Never fails: text that matches no rule comes back as [`Literal::Verbatim`].
pub fn parse_literal(text: &str) -> Literal {
    let text = text.trim();
    let upper = text.to_ascii_uppercase();

    match upper.as_str() {
        "NULL" => return Literal::Null,
        "TRUE" => return Literal::Bool(true),
        "FALSE" => return Literal::Bool(false),
        _ => {}
    }

    if let Some(inner) = strip_quotes(text) {
        return Literal::Str(inner.to_string());
    }

    if integer_pattern().is_match(text) {
        if let Ok(i) = text.parse::<i64>() {
            return Literal::Int(i);
        }
        // Out of i64 range: keep the magnitude as a float
        if let Ok(f) = text.parse::<f64>() {
            return Literal::Float(f);
        }
    }

    if decimal_pattern().is_match(text) {
        if let Ok(f) = text.parse::<f64>() {
            return Literal::Float(f);
        }
    }

    if let Some(placeholder) = placeholder_of(text) {
        return Literal::Placeholder(placeholder);
    }

    Literal::Verbatim(text.to_string())
}

fn strip_quotes(text: &str) -> Option<&str> {
    if text.len() < 2 {
        return None;
    }
    let first = text.as_bytes()[0];
    let last = text.as_bytes()[text.len() - 1];
    if (first == b'\'' || first == b'"') && first == last {
        Some(&text[1..text.len() - 1])
    } else {
        None
    }
}

/// Recognize a placeholder marker string
pub fn placeholder_of(text: &str) -> Option<Placeholder> {
    if text == "?" {
        return Some(Placeholder::Positional);
    }
    named_pattern()
        .captures(text)
        .map(|caps| Placeholder::Named(caps[1].to_string()))
}

/// Placeholder carried by a filter-document value, if any
pub fn placeholder_in(value: &Bson) -> Option<Placeholder> {
    let Bson::Document(marker) = value else {
        return None;
    };
    if !marker.keys().all(|k| k == PLACEHOLDER_KEY || k == LIKE_PATTERN_KEY) {
        return None;
    }
    marker.get_str(PLACEHOLDER_KEY).ok().and_then(placeholder_of)
}

/// True for a marker produced by [`Placeholder::to_like_bson`]
pub fn is_like_placeholder(value: &Bson) -> bool {
    match value {
        Bson::Document(marker) => {
            placeholder_in(value).is_some() && marker.get_bool(LIKE_PATTERN_KEY).unwrap_or(false)
        }
        _ => false,
    }
}

impl Literal {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Literal::Placeholder(_))
    }

    /// Convert into a filter-document value; integers narrow to Int32 when they fit
    pub fn into_bson(self) -> Bson {
        match self {
            Literal::Null => Bson::Null,
            Literal::Bool(b) => Bson::Boolean(b),
            Literal::Int(i) => int_to_bson(i),
            Literal::Float(f) => Bson::Double(f),
            Literal::Str(s) | Literal::Verbatim(s) => Bson::String(s),
            Literal::Placeholder(p) => p.to_bson(),
        }
    }
}

pub fn int_to_bson(i: i64) -> Bson {
    match i32::try_from(i) {
        Ok(small) => Bson::Int32(small),
        Err(_) => Bson::Int64(i),
    }
}
