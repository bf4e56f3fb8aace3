use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Column type tag carried in result descriptions and used by the relational bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    Null,
    Bool,
    Int,
    Long,
    Double,
    Decimal,
    String,
    Date,
    Timestamp,
    ObjectId,
    Binary,
    Document,
    Array,
    Unknown,
}

impl TypeTag {
    pub fn of(value: &Bson) -> Self {
        match value {
            Bson::Null | Bson::Undefined => TypeTag::Null,
            Bson::Boolean(_) => TypeTag::Bool,
            Bson::Int32(_) => TypeTag::Int,
            Bson::Int64(_) => TypeTag::Long,
            Bson::Double(_) => TypeTag::Double,
            Bson::Decimal128(_) => TypeTag::Decimal,
            Bson::String(_) | Bson::Symbol(_) => TypeTag::String,
            Bson::DateTime(_) => TypeTag::Date,
            Bson::Timestamp(_) => TypeTag::Timestamp,
            Bson::ObjectId(_) => TypeTag::ObjectId,
            Bson::Binary(_) => TypeTag::Binary,
            Bson::Document(_) => TypeTag::Document,
            Bson::Array(_) => TypeTag::Array,
            _ => TypeTag::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TypeTag::Null => "null",
            TypeTag::Bool => "bool",
            TypeTag::Int => "int",
            TypeTag::Long => "long",
            TypeTag::Double => "double",
            TypeTag::Decimal => "decimal",
            TypeTag::String => "string",
            TypeTag::Date => "date",
            TypeTag::Timestamp => "timestamp",
            TypeTag::ObjectId => "objectId",
            TypeTag::Binary => "binData",
            TypeTag::Document => "object",
            TypeTag::Array => "array",
            TypeTag::Unknown => "unknown",
        }
    }

    /// Inverse of [`TypeTag::as_str`]; unrecognized names yield `Unknown`
    pub fn parse(name: &str) -> Self {
        match name {
            "null" => TypeTag::Null,
            "bool" => TypeTag::Bool,
            "int" => TypeTag::Int,
            "long" => TypeTag::Long,
            "double" => TypeTag::Double,
            "decimal" => TypeTag::Decimal,
            "string" => TypeTag::String,
            "date" => TypeTag::Date,
            "timestamp" => TypeTag::Timestamp,
            "objectId" => TypeTag::ObjectId,
            "binData" => TypeTag::Binary,
            "object" => TypeTag::Document,
            "array" => TypeTag::Array,
            _ => TypeTag::Unknown,
        }
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric view of a value, across the BSON number types
pub fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        Bson::Double(v) => Some(*v),
        _ => None,
    }
}

pub fn is_null(value: &Bson) -> bool {
    matches!(value, Bson::Null | Bson::Undefined)
}

/// Sort rank of a type, following the document store's cross-type ordering
fn type_order(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::MaxKey => 13,
        _ => 12,
    }
}

/// Total ordering over BSON values; numbers compare across types
pub fn compare(a: &Bson, b: &Bson) -> Ordering {
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::Int32(x), Bson::Int32(y)) => x.cmp(y),
        (Bson::Int64(x), Bson::Int64(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            (x.time, x.increment).cmp(&(y.time, y.increment))
        }
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Binary(x), Bson::Binary(y)) => x.bytes.cmp(&y.bytes),
        (Bson::Array(x), Bson::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let ord = compare(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Document(x), Bson::Document(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => type_order(a).cmp(&type_order(b)),
        },
    }
}

/// Equality with numeric cross-type comparison (`1 == 1.0`)
pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    if is_null(a) && is_null(b) {
        return true;
    }
    if type_order(a) != type_order(b) {
        return false;
    }
    compare(a, b) == Ordering::Equal
}

/// Resolve a dotted path (`profile.name`, `items.0.sku`) inside a document
pub fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;

    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner.get(segment)?,
            Bson::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }

    Some(current)
}

/// Set a dotted path, creating intermediate documents as needed
pub fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            let child = doc
                .entry(head.to_string())
                .or_insert_with(|| Bson::Document(Document::new()));
            match child {
                Bson::Document(inner) => set_path(inner, rest, value),
                Bson::Array(items) => {
                    let (index, tail) = match rest.split_once('.') {
                        Some((i, t)) => (i, Some(t)),
                        None => (rest, None),
                    };
                    if let Ok(index) = index.parse::<usize>() {
                        if let Some(slot) = items.get_mut(index) {
                            match (tail, slot) {
                                (None, slot) => *slot = value,
                                (Some(tail), Bson::Document(inner)) => set_path(inner, tail, value),
                                _ => {}
                            }
                        }
                    }
                }
                other => {
                    let mut inner = Document::new();
                    set_path(&mut inner, rest, value);
                    *other = Bson::Document(inner);
                }
            }
        }
    }
}

/// Human-readable rendering used for text search and string functions
pub fn to_display_string(value: &Bson) -> String {
    match value {
        Bson::String(s) => s.clone(),
        Bson::Null | Bson::Undefined => String::new(),
        Bson::DateTime(dt) => dt.to_chrono().to_rfc3339(),
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::Document(_) | Bson::Array(_) => value.clone().into_relaxed_extjson().to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_type_tags() {
        assert_eq!(TypeTag::of(&Bson::Int32(1)), TypeTag::Int);
        assert_eq!(TypeTag::of(&Bson::Int64(1)), TypeTag::Long);
        assert_eq!(TypeTag::of(&Bson::String("x".into())), TypeTag::String);
        assert_eq!(TypeTag::parse(TypeTag::Timestamp.as_str()), TypeTag::Timestamp);
        assert_eq!(TypeTag::parse("geometry"), TypeTag::Unknown);
    }

    #[test]
    fn test_value_ordering() {
        assert_eq!(compare(&Bson::Int32(1), &Bson::Double(2.5)), Ordering::Less);
        assert_eq!(compare(&Bson::Null, &Bson::Int32(0)), Ordering::Less);
        assert_eq!(
            compare(&Bson::String("a".into()), &Bson::String("b".into())),
            Ordering::Less
        );
        // numbers sort before strings
        assert_eq!(compare(&Bson::String("1".into()), &Bson::Int32(5)), Ordering::Greater);
    }

    #[test]
    fn test_numeric_equality_across_types() {
        assert!(values_equal(&Bson::Int32(3), &Bson::Double(3.0)));
        assert!(values_equal(&Bson::Int64(3), &Bson::Int32(3)));
        assert!(!values_equal(&Bson::String("3".into()), &Bson::Int32(3)));
    }

    #[test]
    fn test_lookup_path() {
        let doc = doc! { "profile": { "name": "ada" }, "items": [ { "sku": "a1" }, { "sku": "b2" } ] };
        assert_eq!(lookup_path(&doc, "profile.name"), Some(&Bson::String("ada".into())));
        assert_eq!(lookup_path(&doc, "items.1.sku"), Some(&Bson::String("b2".into())));
        assert_eq!(lookup_path(&doc, "items.5.sku"), None);
        assert_eq!(lookup_path(&doc, "missing"), None);
    }

    #[test]
    fn test_set_path_creates_documents() {
        let mut doc = doc! { "a": 1 };
        set_path(&mut doc, "b.c", Bson::Int32(2));
        assert_eq!(doc, doc! { "a": 1, "b": { "c": 2 } });

        let mut doc = doc! { "items": [ { "qty": 1 } ] };
        set_path(&mut doc, "items.0.qty", Bson::Int32(9));
        assert_eq!(doc, doc! { "items": [ { "qty": 9 } ] });
    }
}
