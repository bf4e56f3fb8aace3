//! Evaluation of native filter documents against stored documents.
//!
//! Covers the operator subset the translator emits, plus `$exists`, `$not`
//! and `$size`. An array field matches a condition when the array itself or
//! any of its elements does.

use bson::{Bson, Document, Regex as BsonRegex};
use regex::{Regex, RegexBuilder};

use crate::data::value::{as_f64, is_null, lookup_path, to_display_string, values_equal};
use crate::data::compare;

/// True when `doc` satisfies every condition in `filter`
pub fn matches(filter: &Document, doc: &Document) -> Result<bool, MatchError> {
    for (key, condition) in filter {
        let ok = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(key, condition)? {
                    if !matches(clause, doc)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let mut any = false;
                for clause in clauses(key, condition)? {
                    if matches(clause, doc)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for clause in clauses(key, condition)? {
                    if matches(clause, doc)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            "$text" => text_matches(condition, doc)?,
            op if op.starts_with('$') => return Err(MatchError::UnsupportedOperator(op.to_string())),
            path => field_matches(lookup_path(doc, path), condition)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(op: &str, value: &'a Bson) -> Result<Vec<&'a Document>, MatchError> {
    let Bson::Array(items) = value else {
        return Err(MatchError::Malformed(format!("{} expects an array", op)));
    };
    items
        .iter()
        .map(|item| match item {
            Bson::Document(d) => Ok(d),
            other => Err(MatchError::Malformed(format!(
                "{} entries must be documents, got {}",
                op, other
            ))),
        })
        .collect()
}

fn is_operator_doc(condition: &Bson) -> Option<&Document> {
    match condition {
        Bson::Document(d) if d.keys().next().is_some_and(|k| k.starts_with('$')) => Some(d),
        _ => None,
    }
}

fn field_matches(value: Option<&Bson>, condition: &Bson) -> Result<bool, MatchError> {
    let Some(ops) = is_operator_doc(condition) else {
        return equals(value, condition);
    };

    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => equals(value, operand)?,
            "$ne" => !equals(value, operand)?,
            "$gt" => ordered(value, operand, |o| o.is_gt()),
            "$gte" => ordered(value, operand, |o| o.is_ge()),
            "$lt" => ordered(value, operand, |o| o.is_lt()),
            "$lte" => ordered(value, operand, |o| o.is_le()),
            "$in" => in_list(value, operand)?,
            "$nin" => !in_list(value, operand)?,
            "$exists" => {
                let wanted = !matches!(operand, Bson::Boolean(false) | Bson::Int32(0) | Bson::Int64(0));
                value.is_some() == wanted
            }
            "$regex" => {
                let options = ops.get_str("$options").unwrap_or_default();
                let re = match operand {
                    Bson::String(pattern) => build_regex(pattern, options)?,
                    Bson::RegularExpression(BsonRegex { pattern, options: o }) => {
                        build_regex(pattern, &format!("{}{}", o, options))?
                    }
                    other => {
                        return Err(MatchError::Malformed(format!(
                            "$regex expects a string, got {}",
                            other
                        )))
                    }
                };
                candidates(value).any(|v| matches!(v, Bson::String(s) if re.is_match(s)))
            }
            "$options" => true,
            "$not" => !field_matches(value, operand)?,
            "$size" => match (value, as_f64(operand)) {
                (Some(Bson::Array(items)), Some(n)) => items.len() as f64 == n,
                _ => false,
            },
            other => return Err(MatchError::UnsupportedOperator(other.to_string())),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// The value itself, followed by its elements when it is an array
fn candidates(value: Option<&Bson>) -> impl Iterator<Item = &Bson> {
    let elements = match value {
        Some(Bson::Array(items)) => items.iter(),
        _ => [].iter(),
    };
    value.into_iter().chain(elements)
}

fn equals(value: Option<&Bson>, operand: &Bson) -> Result<bool, MatchError> {
    if let Bson::RegularExpression(BsonRegex { pattern, options }) = operand {
        let re = build_regex(pattern, options)?;
        return Ok(candidates(value).any(|v| matches!(v, Bson::String(s) if re.is_match(s))));
    }
    match value {
        None => Ok(is_null(operand)),
        Some(_) => Ok(candidates(value).any(|v| values_equal(v, operand))),
    }
}

fn ordered(value: Option<&Bson>, operand: &Bson, accept: impl Fn(std::cmp::Ordering) -> bool) -> bool {
    candidates(value)
        .filter(|v| comparable(v, operand))
        .any(|v| accept(compare(v, operand)))
}

/// Range operators only compare values of the same kind
fn comparable(a: &Bson, b: &Bson) -> bool {
    (as_f64(a).is_some() && as_f64(b).is_some())
        || std::mem::discriminant(a) == std::mem::discriminant(b)
}

fn in_list(value: Option<&Bson>, operand: &Bson) -> Result<bool, MatchError> {
    let Bson::Array(options) = operand else {
        return Err(MatchError::Malformed(format!("$in/$nin expects an array, got {}", operand)));
    };
    for option in options {
        if equals(value, option)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn build_regex(pattern: &str, options: &str) -> Result<Regex, MatchError> {
    RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| MatchError::InvalidRegex(e.to_string()))
}

/// Case-insensitive match of any search term against any string in the document
fn text_matches(condition: &Bson, doc: &Document) -> Result<bool, MatchError> {
    let search = match condition {
        Bson::Document(d) => d
            .get_str("$search")
            .map_err(|_| MatchError::Malformed("$text requires a $search string".into()))?,
        _ => return Err(MatchError::Malformed("$text expects a document".into())),
    };
    let terms: Vec<String> = search.split_whitespace().map(str::to_lowercase).collect();
    if terms.is_empty() {
        return Ok(false);
    }

    let mut haystack = String::new();
    collect_text(&Bson::Document(doc.clone()), &mut haystack);
    let haystack = haystack.to_lowercase();
    Ok(terms.iter().any(|t| haystack.contains(t.as_str())))
}

fn collect_text(value: &Bson, out: &mut String) {
    match value {
        Bson::Document(d) => d.values().for_each(|v| collect_text(v, out)),
        Bson::Array(items) => items.iter().for_each(|v| collect_text(v, out)),
        Bson::String(_) => {
            out.push_str(&to_display_string(value));
            out.push('\n');
        }
        _ => {}
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MatchError {
    #[error("Unsupported filter operator: {0}")]
    UnsupportedOperator(String),

    #[error("Invalid regular expression: {0}")]
    InvalidRegex(String),

    #[error("Malformed filter: {0}")]
    Malformed(String),
}
