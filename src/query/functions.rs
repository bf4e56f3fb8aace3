//! Value and projection function registry.
//!
//! Value functions run at compile time inside WHERE clauses
//! (`created_at > DATE('2024-01-01')`) and produce a filter value.
//! Projection functions run per row after fetch (`SELECT UPPER(name) FROM users`).

use bson::Bson;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::data::value::{as_f64, to_display_string};
use crate::data::TypeTag;

/// Value function callable from a WHERE clause
pub type ValueFn = Arc<dyn Fn(&[Bson]) -> Result<Bson, FunctionError> + Send + Sync>;

/// Formats tried, in order, when no explicit format parses
const COMMON_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

const COMMON_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d-%m-%Y", "%m/%d/%Y"];

/// Parse a date or datetime string as UTC, trying RFC 3339, then `format`, then common layouts
pub fn parse_datetime(text: &str, format: Option<&str>) -> Option<DateTime<Utc>> {
    let text = text.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Some(format) = format {
        if let Some(dt) = parse_with_format(text, format) {
            return Some(dt);
        }
    }

    COMMON_DATETIME_FORMATS
        .iter()
        .chain(COMMON_DATE_FORMATS.iter())
        .find_map(|fmt| parse_with_format(text, fmt))
}

fn parse_with_format(text: &str, format: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
        return Some(Utc.from_utc_datetime(&naive));
    }
    NaiveDate::parse_from_str(text, format)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn string_and_format(name: &str, args: &[Bson]) -> Result<(String, Option<String>), FunctionError> {
    let text = match args.first() {
        Some(Bson::String(s)) => s.clone(),
        Some(other) => {
            return Err(FunctionError::InvalidArgument {
                function: name.to_string(),
                message: format!("expected a string, got {}", TypeTag::of(other)),
            })
        }
        None => {
            return Err(FunctionError::InvalidArgument {
                function: name.to_string(),
                message: "missing value argument".into(),
            })
        }
    };
    let format = match args.get(1) {
        Some(Bson::String(f)) => Some(f.clone()),
        _ => None,
    };
    Ok((text, format))
}

fn datetime_function(name: &'static str) -> ValueFn {
    Arc::new(move |args: &[Bson]| {
        let (text, format) = string_and_format(name, args)?;
        parse_datetime(&text, format.as_deref())
            .map(|dt| Bson::DateTime(bson::DateTime::from_chrono(dt)))
            .ok_or_else(|| FunctionError::Unparseable {
                function: name.to_string(),
                value: text,
            })
    })
}

fn timestamp_function(name: &'static str) -> ValueFn {
    Arc::new(move |args: &[Bson]| {
        let (text, format) = string_and_format(name, args)?;
        let dt = parse_datetime(&text, format.as_deref()).ok_or_else(|| {
            FunctionError::Unparseable {
                function: name.to_string(),
                value: text.clone(),
            }
        })?;
        let time = u32::try_from(dt.timestamp()).map_err(|_| FunctionError::Unparseable {
            function: name.to_string(),
            value: text,
        })?;
        Ok(Bson::Timestamp(bson::Timestamp { time, increment: 1 }))
    })
}

/// Builtin row-level conversions for SELECT items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionFunction {
    Date,
    Datetime,
    Timestamp,
    Number,
    Bool,
    Substr,
    Replace,
    Trim,
    Upper,
    Lower,
}

impl ProjectionFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        let f = match name.to_ascii_uppercase().as_str() {
            "DATE" => ProjectionFunction::Date,
            "DATETIME" => ProjectionFunction::Datetime,
            "TIMESTAMP" => ProjectionFunction::Timestamp,
            "NUMBER" => ProjectionFunction::Number,
            "BOOL" => ProjectionFunction::Bool,
            "SUBSTR" | "SUBSTRING" => ProjectionFunction::Substr,
            "REPLACE" => ProjectionFunction::Replace,
            "TRIM" => ProjectionFunction::Trim,
            "UPPER" => ProjectionFunction::Upper,
            "LOWER" => ProjectionFunction::Lower,
            _ => return None,
        };
        Some(f)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProjectionFunction::Date => "DATE",
            ProjectionFunction::Datetime => "DATETIME",
            ProjectionFunction::Timestamp => "TIMESTAMP",
            ProjectionFunction::Number => "NUMBER",
            ProjectionFunction::Bool => "BOOL",
            ProjectionFunction::Substr => "SUBSTR",
            ProjectionFunction::Replace => "REPLACE",
            ProjectionFunction::Trim => "TRIM",
            ProjectionFunction::Upper => "UPPER",
            ProjectionFunction::Lower => "LOWER",
        }
    }

    /// Column type reported in the result description
    pub fn type_tag(&self) -> TypeTag {
        match self {
            ProjectionFunction::Date | ProjectionFunction::Datetime => TypeTag::Date,
            ProjectionFunction::Timestamp => TypeTag::Timestamp,
            ProjectionFunction::Number => TypeTag::Double,
            ProjectionFunction::Bool => TypeTag::Bool,
            _ => TypeTag::String,
        }
    }

    /// Convert one row value. Values that cannot be converted come back unchanged.
    pub fn apply(&self, value: &Bson, args: &[Bson]) -> Bson {
        if crate::data::value::is_null(value) {
            return Bson::Null;
        }
        let format = match args.first() {
            Some(Bson::String(f)) => Some(f.as_str()),
            _ => None,
        };

        match self {
            ProjectionFunction::Date | ProjectionFunction::Datetime => match value {
                Bson::DateTime(dt) if *self == ProjectionFunction::Date => {
                    let day = dt.to_chrono().date_naive();
                    day.and_hms_opt(0, 0, 0)
                        .map(|n| Bson::DateTime(bson::DateTime::from_chrono(Utc.from_utc_datetime(&n))))
                        .unwrap_or_else(|| value.clone())
                }
                Bson::String(s) => parse_datetime(s, format)
                    .map(|dt| {
                        let dt = if *self == ProjectionFunction::Date {
                            dt.date_naive()
                                .and_hms_opt(0, 0, 0)
                                .map(|n| Utc.from_utc_datetime(&n))
                                .unwrap_or(dt)
                        } else {
                            dt
                        };
                        Bson::DateTime(bson::DateTime::from_chrono(dt))
                    })
                    .unwrap_or_else(|| value.clone()),
                _ => value.clone(),
            },
            ProjectionFunction::Timestamp => match value {
                Bson::Timestamp(_) => value.clone(),
                Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => as_f64(value)
                    .and_then(|secs| u32::try_from(secs as i64).ok())
                    .map(|time| Bson::Timestamp(bson::Timestamp { time, increment: 0 }))
                    .unwrap_or_else(|| value.clone()),
                Bson::DateTime(dt) => u32::try_from(dt.timestamp_millis() / 1000)
                    .map(|time| Bson::Timestamp(bson::Timestamp { time, increment: 0 }))
                    .unwrap_or_else(|_| value.clone()),
                Bson::String(s) => parse_datetime(s, format)
                    .and_then(|dt| u32::try_from(dt.timestamp()).ok())
                    .map(|time| Bson::Timestamp(bson::Timestamp { time, increment: 0 }))
                    .unwrap_or_else(|| value.clone()),
                _ => value.clone(),
            },
            ProjectionFunction::Number => match value {
                Bson::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Bson::Double)
                    .unwrap_or_else(|_| value.clone()),
                Bson::Boolean(b) => Bson::Double(if *b { 1.0 } else { 0.0 }),
                other => as_f64(other).map(Bson::Double).unwrap_or_else(|| value.clone()),
            },
            ProjectionFunction::Bool => match value {
                Bson::Boolean(_) => value.clone(),
                Bson::String(s) => Bson::Boolean(matches!(
                    s.trim().to_ascii_lowercase().as_str(),
                    "true" | "1" | "yes" | "on"
                )),
                other => match as_f64(other) {
                    Some(n) => Bson::Boolean(n != 0.0),
                    None => Bson::Boolean(true),
                },
            },
            ProjectionFunction::Substr => match value {
                Bson::String(s) => substr(s, args).unwrap_or_else(|| value.clone()),
                _ => value.clone(),
            },
            ProjectionFunction::Replace => match (value, args.first(), args.get(1)) {
                (Bson::String(s), Some(Bson::String(from)), Some(Bson::String(to))) => {
                    Bson::String(s.replace(from.as_str(), to))
                }
                _ => value.clone(),
            },
            ProjectionFunction::Trim => match value {
                Bson::String(s) => Bson::String(s.trim().to_string()),
                _ => value.clone(),
            },
            ProjectionFunction::Upper => match value {
                Bson::String(s) => Bson::String(s.to_uppercase()),
                other => Bson::String(to_display_string(other).to_uppercase()),
            },
            ProjectionFunction::Lower => match value {
                Bson::String(s) => Bson::String(s.to_lowercase()),
                other => Bson::String(to_display_string(other).to_lowercase()),
            },
        }
    }
}

/// SQL `SUBSTR(s, start[, length])` with a 1-based start
fn substr(s: &str, args: &[Bson]) -> Option<Bson> {
    let start = args.first().and_then(as_f64)? as i64;
    let length = match args.get(1) {
        Some(v) => Some(as_f64(v)? as i64),
        None => None,
    };
    let start = usize::try_from((start - 1).max(0)).ok()?;
    let chars = s.chars().skip(start);
    let out: String = match length {
        Some(len) => chars.take(usize::try_from(len.max(0)).ok()?).collect(),
        None => chars.collect(),
    };
    Some(Bson::String(out))
}

/// Projection function bound to a source field, as recorded in a query plan
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ProjectionCall {
    pub function: ProjectionFunction,
    /// Source field the function reads
    pub field: String,
    /// Extra literal arguments after the field
    #[serde(skip)]
    pub args: Vec<Bson>,
}

impl serde::Serialize for ProjectionFunction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Explicit registry of value and projection functions.
///
/// `Default` yields the builtin set; callers can add their own value
/// functions before handing the registry to a compiler.
pub struct FunctionRegistry {
    value_functions: RwLock<HashMap<String, ValueFn>>,
}

impl FunctionRegistry {
    /// Registry with no value functions
    pub fn empty() -> Self {
        Self {
            value_functions: RwLock::new(HashMap::new()),
        }
    }

    /// Register a value function. Names are case-insensitive; an existing entry is replaced.
    pub fn register<F>(&self, name: &str, function: F)
    where
        F: Fn(&[Bson]) -> Result<Bson, FunctionError> + Send + Sync + 'static,
    {
        self.value_functions
            .write()
            .insert(name.to_ascii_lowercase(), Arc::new(function));
    }

    /// Remove a value function, returning whether it was present
    pub fn unregister(&self, name: &str) -> bool {
        self.value_functions
            .write()
            .remove(&name.to_ascii_lowercase())
            .is_some()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.value_functions
            .read()
            .contains_key(&name.to_ascii_lowercase())
    }

    /// Registered value function names, sorted
    pub fn list_functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.value_functions.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn execute(&self, name: &str, args: &[Bson]) -> Result<Bson, FunctionError> {
        let function = self
            .value_functions
            .read()
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| FunctionError::NotFound(name.to_string()))?;
        function(args)
    }

    pub fn projection_function(&self, name: &str) -> Option<ProjectionFunction> {
        ProjectionFunction::from_name(name)
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        let registry = Self::empty();
        {
            let mut functions = registry.value_functions.write();
            functions.insert("date".into(), datetime_function("date"));
            functions.insert("datetime".into(), datetime_function("datetime"));
            functions.insert("str_to_datetime".into(), datetime_function("str_to_datetime"));
            functions.insert("timestamp".into(), timestamp_function("timestamp"));
            functions.insert("str_to_timestamp".into(), timestamp_function("str_to_timestamp"));
        }
        registry
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("value_functions", &self.list_functions())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FunctionError {
    #[error("Unknown function: {0}")]
    NotFound(String),

    #[error("Invalid argument to {function}: {message}")]
    InvalidArgument { function: String, message: String },

    #[error("{function} could not parse '{value}'")]
    Unparseable { function: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_value_functions() {
        let registry = FunctionRegistry::default();
        assert!(registry.has_function("DATE"));
        assert!(registry.has_function("str_to_timestamp"));

        let value = registry
            .execute("date", &[Bson::String("2024-01-15".into())])
            .unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        assert_eq!(value, Bson::DateTime(bson::DateTime::from_chrono(expected)));
    }

    #[test]
    fn test_custom_format() {
        let registry = FunctionRegistry::default();
        let value = registry
            .execute(
                "DATETIME",
                &[Bson::String("15/01/2024 10:30".into()), Bson::String("%d/%m/%Y %H:%M".into())],
            )
            .unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        assert_eq!(value, Bson::DateTime(bson::DateTime::from_chrono(expected)));
    }

    #[test]
    fn test_timestamp_function() {
        let registry = FunctionRegistry::default();
        let value = registry
            .execute("str_to_timestamp", &[Bson::String("1970-01-02T00:00:00Z".into())])
            .unwrap();
        assert_eq!(value, Bson::Timestamp(bson::Timestamp { time: 86400, increment: 1 }));
    }

    #[test]
    fn test_unparseable_and_unknown() {
        let registry = FunctionRegistry::default();
        assert!(matches!(
            registry.execute("date", &[Bson::String("not a date".into())]),
            Err(FunctionError::Unparseable { .. })
        ));
        assert!(matches!(
            registry.execute("nope", &[]),
            Err(FunctionError::NotFound(_))
        ));
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = FunctionRegistry::empty();
        registry.register("Double", |args| {
            Ok(Bson::Double(args.first().and_then(as_f64).unwrap_or(0.0) * 2.0))
        });
        assert_eq!(registry.list_functions(), vec!["double".to_string()]);
        assert_eq!(registry.execute("DOUBLE", &[Bson::Int32(4)]).unwrap(), Bson::Double(8.0));
        assert!(registry.unregister("double"));
        assert!(!registry.has_function("double"));
    }

    #[test]
    fn test_projection_functions() {
        let upper = ProjectionFunction::from_name("upper").unwrap();
        assert_eq!(upper.apply(&Bson::String("ada".into()), &[]), Bson::String("ADA".into()));

        let substr = ProjectionFunction::from_name("SUBSTRING").unwrap();
        assert_eq!(
            substr.apply(&Bson::String("abcdef".into()), &[Bson::Int32(2), Bson::Int32(3)]),
            Bson::String("bcd".into())
        );

        let number = ProjectionFunction::Number;
        assert_eq!(number.apply(&Bson::String("2.5".into()), &[]), Bson::Double(2.5));
        assert_eq!(number.apply(&Bson::String("n/a".into()), &[]), Bson::String("n/a".into()));

        let boolean = ProjectionFunction::Bool;
        assert_eq!(boolean.apply(&Bson::String("Yes".into()), &[]), Bson::Boolean(true));
        assert_eq!(boolean.apply(&Bson::Int32(0), &[]), Bson::Boolean(false));

        assert_eq!(ProjectionFunction::Trim.apply(&Bson::Null, &[]), Bson::Null);
        assert_eq!(ProjectionFunction::Timestamp.type_tag(), TypeTag::Timestamp);
    }

    #[test]
    fn test_date_projection_truncates() {
        let value = ProjectionFunction::Date.apply(&Bson::String("2024-03-05 17:45:00".into()), &[]);
        let expected = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();
        assert_eq!(value, Bson::DateTime(bson::DateTime::from_chrono(expected)));
    }
}
