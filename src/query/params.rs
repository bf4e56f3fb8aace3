//! Placeholder substitution.
//!
//! Plans carry placeholders as reserved `{"$placeholder": "?"}` documents
//! (see [`Placeholder::to_bson`]), so quoted strings that merely look like
//! markers are never bound. A [`Substitution`] walks one or more structures
//! depth-first, in key order, replacing markers with bound values. The
//! positional cursor lives on the `Substitution`, so structures substituted
//! one after another share a single left-to-right numbering.

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::translator::like_to_regex;
use crate::data::value::to_display_string;
use crate::data::{is_like_placeholder, placeholder_in, Placeholder};

/// Bound parameter values supplied at execution time
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Parameters {
    #[default]
    None,
    Positional(Vec<Bson>),
    Named(HashMap<String, Bson>),
}

impl Parameters {
    pub fn positional<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bson>,
    {
        Parameters::Positional(values.into_iter().map(Into::into).collect())
    }

    pub fn named<I, K, T>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, T)>,
        K: Into<String>,
        T: Into<Bson>,
    {
        Parameters::Named(
            values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Parameters::None => true,
            Parameters::Positional(values) => values.is_empty(),
            Parameters::Named(values) => values.is_empty(),
        }
    }
}

/// Placeholder style used by a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterStyle {
    /// `?`
    Qmark,
    /// `:name`
    Named,
}

impl ParameterStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterStyle::Qmark => "qmark",
            ParameterStyle::Named => "named",
        }
    }
}

/// Placeholder census of a statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaceholderScan {
    pub style: Option<ParameterStyle>,
    pub count: usize,
}

/// Scan structures for placeholder markers; mixing styles is an error
pub fn detect_style<'a, I>(values: I) -> Result<PlaceholderScan, ParameterError>
where
    I: IntoIterator<Item = &'a Bson>,
{
    let mut scan = PlaceholderScan::default();
    for value in values {
        scan_value(value, &mut scan)?;
    }
    Ok(scan)
}

/// [`detect_style`] over whole documents
pub fn detect_style_in(documents: &[&Document]) -> Result<PlaceholderScan, ParameterError> {
    let mut scan = PlaceholderScan::default();
    for document in documents {
        for (_, value) in document.iter() {
            scan_value(value, &mut scan)?;
        }
    }
    Ok(scan)
}

fn scan_value(value: &Bson, scan: &mut PlaceholderScan) -> Result<(), ParameterError> {
    if let Some(placeholder) = placeholder_in(value) {
        let style = match placeholder {
            Placeholder::Positional => ParameterStyle::Qmark,
            Placeholder::Named(_) => ParameterStyle::Named,
        };
        match scan.style {
            Some(existing) if existing != style => return Err(ParameterError::MixedStyles),
            _ => scan.style = Some(style),
        }
        scan.count += 1;
        return Ok(());
    }
    match value {
        Bson::Document(doc) => {
            for (_, v) in doc.iter() {
                scan_value(v, scan)?;
            }
        }
        Bson::Array(items) => {
            for v in items {
                scan_value(v, scan)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// One ordered substitution pass over a statement's structures
pub struct Substitution<'p> {
    params: &'p Parameters,
    position: usize,
}

impl<'p> Substitution<'p> {
    pub fn new(params: &'p Parameters) -> Self {
        Self {
            params,
            position: 0,
        }
    }

    /// Number of positional values consumed so far
    pub fn consumed(&self) -> usize {
        self.position
    }

    pub fn apply(&mut self, value: &Bson) -> Result<Bson, ParameterError> {
        if let Some(placeholder) = placeholder_in(value) {
            let bound = self.bind(&placeholder)?;
            if !is_like_placeholder(value) {
                return Ok(bound);
            }
            let pattern = match &bound {
                Bson::String(text) => like_to_regex(text),
                other => like_to_regex(&to_display_string(other)),
            };
            return Ok(Bson::String(pattern));
        }
        match value {
            Bson::Document(doc) => Ok(Bson::Document(self.apply_document(doc)?)),
            Bson::Array(items) => items
                .iter()
                .map(|item| self.apply(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Bson::Array),
            other => Ok(other.clone()),
        }
    }

    pub fn apply_document(&mut self, doc: &Document) -> Result<Document, ParameterError> {
        let mut out = Document::new();
        for (key, value) in doc.iter() {
            out.insert(key.clone(), self.apply(value)?);
        }
        Ok(out)
    }

    fn bind(&mut self, placeholder: &Placeholder) -> Result<Bson, ParameterError> {
        match (placeholder, self.params) {
            (Placeholder::Positional, Parameters::Positional(values)) => {
                let value = values.get(self.position).cloned().ok_or(ParameterError::Count {
                    expected_at_least: self.position + 1,
                    supplied: values.len(),
                })?;
                self.position += 1;
                Ok(value)
            }
            (Placeholder::Positional, Parameters::None) => Err(ParameterError::Count {
                expected_at_least: self.position + 1,
                supplied: 0,
            }),
            (Placeholder::Named(name), Parameters::Named(values)) => values
                .get(name)
                .cloned()
                .ok_or_else(|| ParameterError::Missing(name.clone())),
            (Placeholder::Named(name), Parameters::None) => {
                Err(ParameterError::Missing(name.clone()))
            }
            (Placeholder::Positional, Parameters::Named(_)) => Err(ParameterError::StyleMismatch {
                statement: ParameterStyle::Qmark,
            }),
            (Placeholder::Named(_), Parameters::Positional(_)) => {
                Err(ParameterError::StyleMismatch {
                    statement: ParameterStyle::Named,
                })
            }
        }
    }
}

/// Substitute a single document
pub fn substitute(doc: &Document, params: &Parameters) -> Result<Document, ParameterError> {
    Substitution::new(params).apply_document(doc)
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParameterError {
    #[error("Not enough parameters: statement needs at least {expected_at_least}, {supplied} supplied")]
    Count { expected_at_least: usize, supplied: usize },

    #[error("Missing named parameter: {0}")]
    Missing(String),

    #[error("Statement uses {} placeholders but parameters of the other style were supplied", .statement.as_str())]
    StyleMismatch { statement: ParameterStyle },

    #[error("Cannot mix positional (?) and named (:name) placeholders in one statement")]
    MixedStyles,
}
