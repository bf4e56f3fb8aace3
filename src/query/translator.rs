use bson::{doc, Bson, Document};
use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::functions::{parse_datetime, FunctionError, FunctionRegistry};
use crate::data::literal::{int_to_bson, parse_literal, placeholder_in, Literal};

/// Result of translating a WHERE expression
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    /// Native filter document
    pub filter: Document,
    /// Field paths referenced by the predicate
    pub fields: BTreeSet<String>,
    /// Set when the predicate fell back to full-text search
    pub degraded: bool,
}

/// A predicate that could not be translated structurally
#[derive(Debug)]
pub struct DegradedFilter {
    pub source: String,
    pub reason: TranslateError,
}

impl DegradedFilter {
    /// Full-text search over the untranslated source text
    pub fn fallback(&self) -> Translation {
        Translation {
            filter: doc! { "$text": { "$search": self.source.as_str() } },
            fields: BTreeSet::new(),
            degraded: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    fn key(&self) -> &'static str {
        match self {
            LogicalOp::And => "$and",
            LogicalOp::Or => "$or",
        }
    }
}

/// Structural classification of a predicate node
enum Shape<'a> {
    Logical(LogicalOp, Vec<&'a Expr>),
    Negation(&'a Expr),
    Comparison(&'a Expr, &'a BinaryOperator, &'a Expr),
    Pattern { expr: &'a Expr, pattern: &'a Expr, negated: bool },
    Range { expr: &'a Expr, low: &'a Expr, high: &'a Expr, negated: bool },
    Membership { expr: &'a Expr, list: &'a [Expr], negated: bool },
    NullCheck { expr: &'a Expr, is_null: bool },
    Truth { expr: &'a Expr, value: bool },
    Grouping(&'a Expr),
    Unsupported,
}

fn classify(expr: &Expr) -> Shape<'_> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And => Shape::Logical(LogicalOp::And, flatten(expr, &BinaryOperator::And)),
            BinaryOperator::Or => Shape::Logical(LogicalOp::Or, flatten(expr, &BinaryOperator::Or)),
            BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq => Shape::Comparison(left, op, right),
            _ => Shape::Unsupported,
        },
        Expr::UnaryOp { op: UnaryOperator::Not, expr } => Shape::Negation(expr),
        Expr::Like { negated, expr, pattern, .. } | Expr::ILike { negated, expr, pattern, .. } => {
            Shape::Pattern { expr, pattern, negated: *negated }
        }
        Expr::Between { expr, negated, low, high } => Shape::Range {
            expr,
            low,
            high,
            negated: *negated,
        },
        Expr::InList { expr, list, negated } => Shape::Membership {
            expr,
            list,
            negated: *negated,
        },
        Expr::IsNull(expr) => Shape::NullCheck { expr, is_null: true },
        Expr::IsNotNull(expr) => Shape::NullCheck { expr, is_null: false },
        Expr::IsTrue(expr) => Shape::Truth { expr, value: true },
        Expr::IsFalse(expr) => Shape::Truth { expr, value: false },
        Expr::Nested(inner) => Shape::Grouping(inner),
        _ => Shape::Unsupported,
    }
}

/// Collect operands of a left- or right-associated chain of the same logical operator
fn flatten<'a>(expr: &'a Expr, target: &BinaryOperator) -> Vec<&'a Expr> {
    match expr {
        Expr::BinaryOp { left, op, right } if op == target => {
            let mut operands = flatten(left, target);
            operands.extend(flatten(right, target));
            operands
        }
        other => vec![other],
    }
}

/// Translates WHERE-clause expressions into native filter documents
#[derive(Debug, Clone)]
pub struct ExpressionTranslator {
    registry: Arc<FunctionRegistry>,
    strict: bool,
}

impl ExpressionTranslator {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self {
            registry,
            strict: false,
        }
    }

    /// In strict mode, untranslatable predicates are errors instead of text searches
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Translate, degrading to full-text search on failure
    pub fn translate(&self, expr: &Expr) -> Translation {
        match self.try_translate(expr) {
            Ok(translation) => translation,
            Err(degraded) => {
                tracing::warn!(
                    predicate = %degraded.source,
                    reason = %degraded.reason,
                    "predicate degraded to full-text search"
                );
                degraded.fallback()
            }
        }
    }

    pub fn try_translate(&self, expr: &Expr) -> Result<Translation, DegradedFilter> {
        let mut fields = BTreeSet::new();
        match self.translate_node(expr, &mut fields) {
            Ok(filter) => Ok(Translation {
                filter,
                fields,
                degraded: false,
            }),
            Err(reason) => Err(DegradedFilter {
                source: expr.to_string(),
                reason,
            }),
        }
    }

    /// Honors the strict flag: strict returns the error, lenient degrades
    pub fn translate_checked(&self, expr: &Expr) -> Result<Translation, TranslateError> {
        if self.strict {
            self.try_translate(expr).map_err(|d| d.reason)
        } else {
            Ok(self.translate(expr))
        }
    }

    /// Parse a standalone predicate (`age > 5 AND name LIKE 'a%'`) and translate it
    pub fn translate_sql(&self, text: &str) -> Result<Translation, TranslateError> {
        let normalized = normalize_index_access(text);
        let dialect = GenericDialect {};
        let expr = Parser::new(&dialect)
            .try_with_sql(&normalized)
            .and_then(|mut p| p.parse_expr());
        match expr {
            Ok(expr) => self.translate_checked(&expr),
            Err(e) if self.strict => Err(TranslateError::Syntax(e.to_string())),
            Err(e) => {
                let degraded = DegradedFilter {
                    source: text.trim().to_string(),
                    reason: TranslateError::Syntax(e.to_string()),
                };
                tracing::warn!(predicate = %degraded.source, reason = %degraded.reason, "predicate degraded to full-text search");
                Ok(degraded.fallback())
            }
        }
    }

    fn translate_node(
        &self,
        expr: &Expr,
        fields: &mut BTreeSet<String>,
    ) -> Result<Document, TranslateError> {
        match classify(expr) {
            Shape::Logical(op, operands) => {
                let mut parts = Vec::with_capacity(operands.len());
                for operand in operands {
                    parts.push(Bson::Document(self.translate_node(operand, fields)?));
                }
                if parts.len() == 1 {
                    if let Some(Bson::Document(only)) = parts.pop() {
                        return Ok(only);
                    }
                }
                Ok(doc! { op.key(): parts })
            }
            Shape::Negation(inner) => {
                let inner = self.translate_node(inner, fields)?;
                Ok(doc! { "$nor": [inner] })
            }
            Shape::Grouping(inner) => self.translate_node(inner, fields),
            Shape::Comparison(left, op, right) => {
                let (field, value, op) = match (field_path(left), field_path(right)) {
                    (Some(field), _) => (field, self.value_of(right)?, op.clone()),
                    (None, Some(field)) => (field, self.value_of(left)?, flip(op)),
                    (None, None) => {
                        return Err(TranslateError::ExpectedField(left.to_string()))
                    }
                };
                fields.insert(field.clone());
                let condition = match op {
                    BinaryOperator::Eq => value,
                    BinaryOperator::NotEq => Bson::Document(doc! { "$ne": value }),
                    BinaryOperator::Lt => Bson::Document(doc! { "$lt": value }),
                    BinaryOperator::LtEq => Bson::Document(doc! { "$lte": value }),
                    BinaryOperator::Gt => Bson::Document(doc! { "$gt": value }),
                    BinaryOperator::GtEq => Bson::Document(doc! { "$gte": value }),
                    other => return Err(TranslateError::UnsupportedOperator(other.to_string())),
                };
                Ok(doc! { field: condition })
            }
            Shape::Pattern { expr, pattern, negated } => {
                let field = self.require_field(expr, fields)?;
                let regex = match self.value_of(pattern)? {
                    Bson::String(p) => Bson::String(like_to_regex(&p)),
                    other => match placeholder_in(&other) {
                        Some(placeholder) => placeholder.to_like_bson(),
                        None => {
                            return Err(TranslateError::UnsupportedValue(format!(
                                "LIKE pattern must be a string, got {}",
                                other
                            )))
                        }
                    },
                };
                let matcher = doc! { "$regex": regex, "$options": "i" };
                if negated {
                    Ok(doc! { field: { "$not": matcher } })
                } else {
                    Ok(doc! { field: matcher })
                }
            }
            Shape::Range { expr, low, high, negated } => {
                let field = self.require_field(expr, fields)?;
                let low = self.value_of(low)?;
                let high = self.value_of(high)?;
                if negated {
                    Ok(doc! { "$or": [
                        { field.as_str(): { "$lt": low } },
                        { field.as_str(): { "$gt": high } },
                    ] })
                } else {
                    Ok(doc! { field: { "$gte": low, "$lte": high } })
                }
            }
            Shape::Membership { expr, list, negated } => {
                let field = self.require_field(expr, fields)?;
                let values = list
                    .iter()
                    .map(|item| self.value_of(item))
                    .collect::<Result<Vec<_>, _>>()?;
                let op = if negated { "$nin" } else { "$in" };
                Ok(doc! { field: { op: values } })
            }
            Shape::NullCheck { expr, is_null } => {
                let field = self.require_field(expr, fields)?;
                if is_null {
                    Ok(doc! { field: Bson::Null })
                } else {
                    Ok(doc! { field: { "$ne": Bson::Null } })
                }
            }
            Shape::Truth { expr, value } => {
                let field = self.require_field(expr, fields)?;
                Ok(doc! { field: value })
            }
            Shape::Unsupported => Err(TranslateError::UnsupportedExpression(expr.to_string())),
        }
    }

    fn require_field(
        &self,
        expr: &Expr,
        fields: &mut BTreeSet<String>,
    ) -> Result<String, TranslateError> {
        let field = field_path(expr).ok_or_else(|| TranslateError::ExpectedField(expr.to_string()))?;
        fields.insert(field.clone());
        Ok(field)
    }

    /// Convert an operand in value position into a filter value
    pub fn value_of(&self, expr: &Expr) -> Result<Bson, TranslateError> {
        match expr {
            Expr::Value(v) => sql_value_to_bson(v),
            Expr::UnaryOp { op: UnaryOperator::Minus, expr } => match self.value_of(expr)? {
                Bson::Int32(i) => Ok(int_to_bson(-(i as i64))),
                Bson::Int64(i) => Ok(int_to_bson(-i)),
                Bson::Double(f) => Ok(Bson::Double(-f)),
                other => Err(TranslateError::UnsupportedValue(format!("-{}", other))),
            },
            Expr::UnaryOp { op: UnaryOperator::Plus, expr } => self.value_of(expr),
            Expr::Nested(inner) => self.value_of(inner),
            Expr::Identifier(ident) => {
                if ident.quote_style.is_some() {
                    Ok(Bson::String(ident.value.clone()))
                } else {
                    Ok(parse_literal(&ident.value).into_bson())
                }
            }
            Expr::TypedString { value, .. } => parse_datetime(value, None)
                .map(|dt| Bson::DateTime(bson::DateTime::from_chrono(dt)))
                .ok_or_else(|| TranslateError::UnsupportedValue(expr.to_string())),
            Expr::Function(function) => {
                let name = function.name.to_string();
                if !self.registry.has_function(&name) {
                    return Err(TranslateError::UnknownFunction(name));
                }
                let mut args = Vec::with_capacity(function.args.len());
                for arg in &function.args {
                    match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                        | FunctionArg::Named { arg: FunctionArgExpr::Expr(e), .. } => {
                            args.push(self.value_of(e)?)
                        }
                        other => {
                            return Err(TranslateError::UnsupportedValue(other.to_string()))
                        }
                    }
                }
                Ok(self.registry.execute(&name, &args)?)
            }
            other => Err(TranslateError::UnsupportedValue(other.to_string())),
        }
    }
}

impl Default for ExpressionTranslator {
    fn default() -> Self {
        Self::new(Arc::new(FunctionRegistry::default()))
    }
}

/// Mirror a comparison so the field ends up on the left (`5 < a` becomes `a > 5`)
fn flip(op: &BinaryOperator) -> BinaryOperator {
    match op {
        BinaryOperator::Lt => BinaryOperator::Gt,
        BinaryOperator::LtEq => BinaryOperator::GtEq,
        BinaryOperator::Gt => BinaryOperator::Lt,
        BinaryOperator::GtEq => BinaryOperator::LtEq,
        other => other.clone(),
    }
}

/// Dotted field path for an identifier expression
pub fn field_path(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(idents) => Some(
            idents
                .iter()
                .map(|i| i.value.as_str())
                .collect::<Vec<_>>()
                .join("."),
        ),
        Expr::Nested(inner) => field_path(inner),
        _ => None,
    }
}

pub fn sql_value_to_bson(value: &SqlValue) -> Result<Bson, TranslateError> {
    match value {
        SqlValue::Number(n, _) => match parse_literal(n) {
            lit @ (Literal::Int(_) | Literal::Float(_)) => Ok(lit.into_bson()),
            _ => Err(TranslateError::UnsupportedValue(n.clone())),
        },
        SqlValue::SingleQuotedString(s)
        | SqlValue::DoubleQuotedString(s)
        | SqlValue::EscapedStringLiteral(s)
        | SqlValue::NationalStringLiteral(s) => Ok(Bson::String(s.clone())),
        SqlValue::Boolean(b) => Ok(Bson::Boolean(*b)),
        SqlValue::Null => Ok(Bson::Null),
        SqlValue::Placeholder(p) => match parse_literal(p) {
            lit @ Literal::Placeholder(_) => Ok(lit.into_bson()),
            _ => Err(TranslateError::UnsupportedValue(p.clone())),
        },
        other => Err(TranslateError::UnsupportedValue(other.to_string())),
    }
}

/// Convert a SQL LIKE pattern into an anchored regular expression
pub fn like_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 4);
    regex.push('^');
    for c in pattern.chars() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    regex
}

/// Rewrite bracket index access `items[0].name` to the quoted-segment form
/// `items."0".name`, which the SQL grammar reads as a compound identifier.
/// String literals are left untouched.
pub fn normalize_index_access(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut chars = sql.char_indices().peekable();
    let mut prev: Option<char> = None;

    while let Some((_, c)) = chars.next() {
        match c {
            '\'' => {
                out.push(c);
                for (_, inner) in chars.by_ref() {
                    out.push(inner);
                    if inner == '\'' {
                        break;
                    }
                }
                prev = Some('\'');
            }
            '[' if matches!(prev, Some(p) if p.is_ascii_alphanumeric() || p == '_' || p == '"') => {
                let mut digits = String::new();
                let mut lookahead = chars.clone();
                while let Some(&(_, d)) = lookahead.peek() {
                    if d.is_ascii_digit() {
                        digits.push(d);
                        lookahead.next();
                    } else {
                        break;
                    }
                }
                if !digits.is_empty() && matches!(lookahead.peek(), Some(&(_, ']'))) {
                    lookahead.next();
                    chars = lookahead;
                    out.push_str(".\"");
                    out.push_str(&digits);
                    out.push('"');
                    prev = Some('"');
                } else {
                    out.push(c);
                    prev = Some(c);
                }
            }
            _ => {
                out.push(c);
                prev = Some(c);
            }
        }
    }

    out
}

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("Syntax error in predicate: {0}")]
    Syntax(String),

    #[error("Unsupported expression: {0}")]
    UnsupportedExpression(String),

    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("Unsupported value: {0}")]
    UnsupportedValue(String),

    #[error("Expected field reference, found {0}")]
    ExpectedField(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Function error: {0}")]
    Function(#[from] FunctionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Placeholder;
    use regex::Regex;

    fn translate(sql: &str) -> Document {
        ExpressionTranslator::default().translate_sql(sql).unwrap().filter
    }

    #[test]
    fn test_operator_mapping() {
        assert_eq!(translate("age = 5"), doc! { "age": 5 });
        assert_eq!(translate("age > 5"), doc! { "age": { "$gt": 5 } });
        assert_eq!(translate("age >= 5"), doc! { "age": { "$gte": 5 } });
        assert_eq!(translate("age < 5"), doc! { "age": { "$lt": 5 } });
        assert_eq!(translate("age <= 5"), doc! { "age": { "$lte": 5 } });
        assert_eq!(translate("age != 5"), doc! { "age": { "$ne": 5 } });
        assert_eq!(translate("age <> 5"), doc! { "age": { "$ne": 5 } });
    }

    #[test]
    fn test_literal_on_left_flips() {
        assert_eq!(translate("5 < age"), doc! { "age": { "$gt": 5 } });
    }

    #[test]
    fn test_and_chain_is_flat() {
        assert_eq!(
            translate("a > 1 AND b = 2"),
            doc! { "$and": [ { "a": { "$gt": 1 } }, { "b": 2 } ] }
        );
        assert_eq!(
            translate("a > 1 AND b = 2 AND c = 3"),
            doc! { "$and": [ { "a": { "$gt": 1 } }, { "b": 2 }, { "c": 3 } ] }
        );
    }

    #[test]
    fn test_or_and_grouping() {
        assert_eq!(
            translate("(a = 1 OR a = 2) AND b = 'x'"),
            doc! { "$and": [ { "$or": [ { "a": 1 }, { "a": 2 } ] }, { "b": "x" } ] }
        );
    }

    #[test]
    fn test_not() {
        assert_eq!(translate("NOT a = 1"), doc! { "$nor": [ { "a": 1 } ] });
    }

    #[test]
    fn test_like_matches_prefix() {
        let filter = translate("name LIKE 'John%'");
        let spec = filter.get_document("name").unwrap();
        assert_eq!(spec.get_str("$options").unwrap(), "i");
        let re = Regex::new(&format!("(?i){}", spec.get_str("$regex").unwrap())).unwrap();
        assert!(re.is_match("John"));
        assert!(re.is_match("Johnny Cash"));
        assert!(!re.is_match("Mr John"));
        assert!(!re.is_match("Jon"));
    }

    #[test]
    fn test_like_escapes_regex_chars() {
        assert_eq!(like_to_regex("a.b_%"), "^a\\.b..*$");
    }

    #[test]
    fn test_not_like() {
        let filter = translate("name NOT LIKE '%bot'");
        assert_eq!(
            filter,
            doc! { "name": { "$not": { "$regex": "^.*bot$", "$options": "i" } } }
        );
    }

    #[test]
    fn test_in_and_not_in() {
        assert_eq!(translate("status IN ('a', 'b')"), doc! { "status": { "$in": ["a", "b"] } });
        assert_eq!(translate("n NOT IN (1, 2)"), doc! { "n": { "$nin": [1, 2] } });
    }

    #[test]
    fn test_null_checks() {
        assert_eq!(translate("email IS NULL"), doc! { "email": Bson::Null });
        assert_eq!(translate("email IS NOT NULL"), doc! { "email": { "$ne": Bson::Null } });
    }

    #[test]
    fn test_between() {
        assert_eq!(
            translate("age BETWEEN 18 AND 65"),
            doc! { "age": { "$gte": 18, "$lte": 65 } }
        );
        assert_eq!(
            translate("age NOT BETWEEN 18 AND 65"),
            doc! { "$or": [ { "age": { "$lt": 18 } }, { "age": { "$gt": 65 } } ] }
        );
    }

    #[test]
    fn test_nested_paths_and_indexes() {
        assert_eq!(translate("profile.name = 'ada'"), doc! { "profile.name": "ada" });
        assert_eq!(translate("items[1].name = 'x'"), doc! { "items.1.name": "x" });
        assert_eq!(translate("\"first name\" = 'ada'"), doc! { "first name": "ada" });
    }

    #[test]
    fn test_placeholders_become_markers() {
        assert_eq!(translate("id = ?"), doc! { "id": { "$placeholder": "?" } });
        assert_eq!(translate("id = :id"), doc! { "id": { "$placeholder": ":id" } });
        // quoted marker text is an ordinary string
        assert_eq!(translate("q = '?'"), doc! { "q": "?" });
        assert_eq!(translate("q = ':id'"), doc! { "q": ":id" });
    }

    #[test]
    fn test_like_placeholder_is_flagged() {
        assert_eq!(
            translate("name LIKE ?"),
            doc! { "name": { "$regex": Placeholder::Positional.to_like_bson(), "$options": "i" } }
        );
        assert_eq!(translate("name LIKE '?'"), doc! { "name": { "$regex": "^.$", "$options": "i" } });
    }

    #[test]
    fn test_value_functions() {
        let filter = translate("created_at > DATE('2024-01-01')");
        let inner = filter.get_document("created_at").unwrap();
        assert!(matches!(inner.get("$gt"), Some(Bson::DateTime(_))));
    }

    #[test]
    fn test_negative_numbers() {
        assert_eq!(translate("t > -3"), doc! { "t": { "$gt": -3 } });
        assert_eq!(translate("t > -3.5"), doc! { "t": { "$gt": -3.5 } });
    }

    #[test]
    fn test_fields_collected() {
        let translation = ExpressionTranslator::default()
            .translate_sql("a = 1 AND (b > 2 OR c IS NULL)")
            .unwrap();
        let fields: Vec<_> = translation.fields.into_iter().collect();
        assert_eq!(fields, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_degrades_to_text_search() {
        let translation = ExpressionTranslator::default()
            .translate_sql("a + 1 = b * 2")
            .unwrap();
        assert!(translation.degraded);
        assert!(translation.filter.get_document("$text").is_ok());
    }

    #[test]
    fn test_strict_mode_surfaces_errors() {
        let translator = ExpressionTranslator::default().strict(true);
        assert!(translator.translate_sql("a + 1 = b * 2").is_err());
        assert!(translator.translate_sql("a = 1").is_ok());
    }

    #[test]
    fn test_stable_under_repetition() {
        let translator = ExpressionTranslator::default();
        let first = translator.translate_sql("a > 1 AND b LIKE 'x%'").unwrap();
        let second = translator.translate_sql("a > 1 AND b LIKE 'x%'").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_normalize_index_access() {
        assert_eq!(normalize_index_access("items[0].name = 'a[1]'"), "items.\"0\".name = 'a[1]'");
        assert_eq!(normalize_index_access("x IN [1]"), "x IN [1]");
    }
}
