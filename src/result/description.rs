use serde::Serialize;

use crate::data::TypeTag;

/// DB-API column metadata. Only `name` and `type_code` are ever known;
/// the size fields stay `None` the way document drivers report them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDescription {
    pub name: String,
    pub type_code: TypeTag,
    pub display_size: Option<usize>,
    pub internal_size: Option<usize>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub null_ok: Option<bool>,
}

impl ColumnDescription {
    pub fn new(name: impl Into<String>, type_code: TypeTag) -> Self {
        Self {
            name: name.into(),
            type_code,
            display_size: None,
            internal_size: None,
            precision: None,
            scale: None,
            null_ok: None,
        }
    }
}

/// Columns discovered while rows flow through a cursor.
/// Order is first appearance; a tag is fixed by the first non-null value.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ColumnTracker {
    columns: Vec<(String, Option<TypeTag>)>,
}

impl ColumnTracker {
    /// Register a column up front; a `Some` tag is never overridden by rows
    pub fn declare(&mut self, name: &str, tag: Option<TypeTag>) {
        match self.columns.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => {
                if tag.is_some() {
                    *existing = tag;
                }
            }
            None => self.columns.push((name.to_string(), tag)),
        }
    }

    pub fn observe(&mut self, row: &bson::Document) {
        for (key, value) in row {
            let tag = (!matches!(value, bson::Bson::Null)).then(|| TypeTag::of(value));
            match self.columns.iter_mut().find(|(n, _)| n == key) {
                Some((_, existing @ None)) => *existing = tag,
                Some(_) => {}
                None => self.columns.push((key.clone(), tag)),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn describe(&self) -> Vec<ColumnDescription> {
        self.columns
            .iter()
            .map(|(name, tag)| ColumnDescription::new(name.clone(), tag.unwrap_or(TypeTag::Null)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_first_non_null_wins() {
        let mut tracker = ColumnTracker::default();
        tracker.observe(&doc! { "a": bson::Bson::Null, "b": "x" });
        tracker.observe(&doc! { "a": 3, "b": 4.5, "c": true });

        let described = tracker.describe();
        let tags: Vec<_> = described.iter().map(|d| (d.name.as_str(), d.type_code)).collect();
        assert_eq!(
            tags,
            vec![("a", TypeTag::Int), ("b", TypeTag::String), ("c", TypeTag::Bool)]
        );
    }

    #[test]
    fn test_declared_tag_is_kept() {
        let mut tracker = ColumnTracker::default();
        tracker.declare("when", Some(TypeTag::Date));
        tracker.observe(&doc! { "when": "2024-01-01" });
        assert_eq!(tracker.describe()[0].type_code, TypeTag::Date);
    }

    #[test]
    fn test_all_null_column() {
        let mut tracker = ColumnTracker::default();
        tracker.declare("gone", None);
        tracker.observe(&doc! { "gone": bson::Bson::Null });
        let column = &tracker.describe()[0];
        assert_eq!(column.type_code, TypeTag::Null);
        assert_eq!(column.display_size, None);
        assert_eq!(column.null_ok, None);
    }
}
