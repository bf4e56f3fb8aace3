use bson::{Bson, Document};
use regex::Regex;
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, Ident, ObjectName, OrderByExpr, Query, SelectItem,
    SetExpr, Statement, TableFactor, TableWithJoins, Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::sync::{Arc, OnceLock};

use super::builder::{DeleteBuilder, InsertBuilder, QueryBuilder, UpdateBuilder};
use super::functions::{FunctionRegistry, ProjectionCall, ProjectionFunction};
use super::params::{detect_style_in, ParameterError, PlaceholderScan};
use super::plan::ExecutionPlan;
use super::subquery;
use super::translator::{field_path, normalize_index_access, ExpressionTranslator, TranslateError};
use super::QueryError;
use crate::data::parse_literal;

/// Compiles SQL text into validated execution plans
#[derive(Debug, Clone)]
pub struct Compiler {
    translator: ExpressionTranslator,
    registry: Arc<FunctionRegistry>,
}

impl Compiler {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self {
            translator: ExpressionTranslator::new(registry.clone()),
            registry,
        }
    }

    /// Fail on untranslatable WHERE predicates instead of degrading to text search
    pub fn strict(mut self, strict: bool) -> Self {
        self.translator = self.translator.strict(strict);
        self
    }

    pub fn translator(&self) -> &ExpressionTranslator {
        &self.translator
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Compile one SQL statement
    pub fn compile(&self, sql: &str) -> Result<ExecutionPlan, QueryError> {
        let trimmed = sql.trim().trim_end_matches(';').trim();
        if trimmed.is_empty() {
            return Err(ParseError::EmptyQuery.into());
        }

        if let Some(plan) = self.compile_document_insert(trimmed)? {
            return Ok(plan);
        }

        let normalized = normalize_index_access(trimmed);
        let dialect = GenericDialect {};
        let statements = Parser::parse_sql(&dialect, &normalized).map_err(ParseError::from)?;

        if statements.is_empty() {
            return Err(ParseError::EmptyQuery.into());
        }
        if statements.len() > 1 {
            return Err(ParseError::MultipleStatements.into());
        }

        let plan = match &statements[0] {
            Statement::Query(query) => ExecutionPlan::Query(self.compile_select(query)?),
            Statement::Insert {
                table_name,
                columns,
                source,
                ..
            } => {
                let source = source.as_deref().ok_or_else(|| {
                    ParseError::UnsupportedQuery("INSERT without a VALUES source".to_string())
                })?;
                self.compile_insert(table_name, columns, source)?
            }
            Statement::Update {
                table,
                assignments,
                selection,
                ..
            } => {
                let collection = table_name_of(table)?;

                let mut fields = Document::new();
                for assignment in assignments {
                    let field = assignment
                        .id
                        .iter()
                        .map(|i| i.value.as_str())
                        .collect::<Vec<_>>()
                        .join(".");
                    let value = self.translator.value_of(&assignment.value).map_err(ParseError::from)?;
                    fields.insert(field, value);
                }
                let filter = match selection {
                    Some(selection) => self.where_filter(selection)?,
                    None => Document::new(),
                };

                let scan = scan_placeholders(&[&fields, &filter])?;
                let mut builder = UpdateBuilder::new();
                builder
                    .collection(&collection)
                    .update_fields(fields)
                    .filter_conditions(filter)
                    .parameter_style(scan.style);
                ExecutionPlan::Update(builder.build()?)
            }
            Statement::Delete {
                from, selection, ..
            } => {
                let table = from.first().ok_or(ParseError::MissingTable)?;
                let mut builder = DeleteBuilder::new();
                builder.collection(&table_name_of(table)?);
                let mut filter = Document::new();
                if let Some(selection) = selection {
                    filter = self.where_filter(selection)?;
                }
                let scan = scan_placeholders(&[&filter])?;
                builder.filter_conditions(filter).parameter_style(scan.style);
                ExecutionPlan::Delete(builder.build()?)
            }
            other => {
                let keyword = other.to_string();
                let keyword = keyword.split_whitespace().next().unwrap_or_default();
                return Err(ParseError::UnsupportedStatement(keyword.to_uppercase()).into());
            }
        };

        tracing::debug!(sql = %trimmed, kind = plan.kind(), collection = %plan.collection(), "compiled statement");
        Ok(plan)
    }

    fn where_filter(&self, expr: &Expr) -> Result<Document, ParseError> {
        Ok(self.translator.translate_checked(expr)?.filter)
    }

    fn compile_select(&self, query: &Query) -> Result<super::plan::QueryPlan, QueryError> {
        let select = match &*query.body {
            SetExpr::Select(select) => select,
            other => {
                return Err(ParseError::UnsupportedQuery(format!(
                    "only plain SELECT is supported, found {}",
                    other
                ))
                .into())
            }
        };

        let mut builder = QueryBuilder::new();

        self.apply_projection(&select.projection, &mut builder)?;

        if let Some(selection) = &select.selection {
            builder.filter(self.where_filter(selection)?);
        }

        builder.sort(parse_order_by(&query.order_by)?);

        if let Some(limit) = &query.limit {
            builder.limit(parse_count(limit).ok_or_else(|| ParseError::InvalidLimit(limit.to_string()))?);
        }
        if let Some(offset) = &query.offset {
            builder.skip(
                parse_count(&offset.value)
                    .ok_or_else(|| ParseError::InvalidOffset(offset.value.to_string()))?,
            );
        }

        // FROM goes last: subquery resolution rewrites the staged projection and filter
        self.apply_from(&select.from, &mut builder)?;

        match builder.subquery_plan.as_deref() {
            Some(inner) if builder.staged_subquery => {
                scan_placeholders(&[inner.filter(), &builder.filter])?;
            }
            _ => {
                scan_placeholders(&[&builder.filter])?;
            }
        }
        Ok(builder.build()?)
    }

    fn apply_projection(
        &self,
        items: &[SelectItem],
        builder: &mut QueryBuilder,
    ) -> Result<(), ParseError> {
        for item in items {
            let (expr, alias) = match item {
                SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => continue,
                SelectItem::UnnamedExpr(expr) => (expr, None),
                SelectItem::ExprWithAlias { expr, alias } => (expr, Some(alias.value.as_str())),
            };

            if let Some(field) = field_path(expr) {
                builder.project(vec![field.clone()]);
                builder.alias(&field, alias.unwrap_or(&field));
                continue;
            }

            if let Some(call) = self.projection_call(expr) {
                let output = alias.unwrap_or(&call.field).to_string();
                builder.project(vec![call.field.clone()]);
                builder.alias(&call.field, &output);
                builder.projection_function(&output, call);
                continue;
            }

            // Expressions the store cannot evaluate are carried by name and come back null
            let name = expr.to_string();
            tracing::debug!(expression = %name, "projection expression passed through by name");
            builder.project(vec![name.clone()]);
            builder.alias(&name, alias.unwrap_or(&name));
        }
        Ok(())
    }

    fn projection_call(&self, expr: &Expr) -> Option<ProjectionCall> {
        match expr {
            Expr::Function(function) => {
                let name = object_name_to_string(&function.name);
                let kind = self.registry.projection_function(&name)?;
                let mut args = function.args.iter().filter_map(|arg| match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                    | FunctionArg::Named {
                        arg: FunctionArgExpr::Expr(e),
                        ..
                    } => Some(e),
                    _ => None,
                });
                let field = field_path(args.next()?)?;
                let rest = args
                    .map(|e| self.translator.value_of(e).ok())
                    .collect::<Option<Vec<_>>>()?;
                Some(ProjectionCall {
                    function: kind,
                    field,
                    args: rest,
                })
            }
            Expr::Substring {
                expr,
                substring_from,
                substring_for,
                ..
            } => {
                let field = field_path(expr)?;
                let mut args = Vec::new();
                for part in [substring_from, substring_for].into_iter().flatten() {
                    args.push(self.translator.value_of(part).ok()?);
                }
                Some(ProjectionCall {
                    function: ProjectionFunction::Substr,
                    field,
                    args,
                })
            }
            Expr::Trim { expr, .. } => Some(ProjectionCall {
                function: ProjectionFunction::Trim,
                field: field_path(expr)?,
                args: Vec::new(),
            }),
            _ => None,
        }
    }

    fn apply_from(
        &self,
        from: &[TableWithJoins],
        builder: &mut QueryBuilder,
    ) -> Result<(), ParseError> {
        let table = match from {
            [] => return Err(ParseError::MissingTable),
            [table] => table,
            _ => return Err(ParseError::JoinsNotSupported),
        };
        if !table.joins.is_empty() {
            return Err(ParseError::JoinsNotSupported);
        }

        match &table.relation {
            TableFactor::Table {
                name,
                alias,
                args: Some(args),
                ..
            } => {
                let parts: Vec<&Ident> = name.0.iter().collect();
                let (last, prefix) = parts
                    .split_last()
                    .ok_or_else(|| ParseError::UnsupportedTableExpression(name.to_string()))?;
                if !last.value.eq_ignore_ascii_case("aggregate") {
                    return Err(ParseError::UnsupportedTableExpression(table.relation.to_string()));
                }
                let (pipeline, options) = aggregate_args(args)?;
                builder.aggregate(pipeline, options);
                if !prefix.is_empty() {
                    let collection = prefix.iter().map(|i| i.value.as_str()).collect::<Vec<_>>().join(".");
                    builder.collection(&collection);
                }
                if let Some(alias) = alias {
                    subquery::strip_alias_prefix(builder, &alias.name.value);
                }
            }
            TableFactor::Table { name, alias, .. } => {
                builder.collection(&object_name_to_string(name));
                if let Some(alias) = alias {
                    subquery::strip_alias_prefix(builder, &alias.name.value);
                }
            }
            TableFactor::Derived { .. } => {
                subquery::resolve(&table.relation.to_string(), builder, self);
            }
            other => return Err(ParseError::UnsupportedTableExpression(other.to_string())),
        }
        Ok(())
    }

    fn compile_insert(
        &self,
        table_name: &ObjectName,
        columns: &[Ident],
        source: &Query,
    ) -> Result<ExecutionPlan, QueryError> {
        let rows = match &*source.body {
            SetExpr::Values(values) => &values.rows,
            other => {
                return Err(ParseError::UnsupportedQuery(format!(
                    "INSERT source must be VALUES, found {}",
                    other
                ))
                .into())
            }
        };

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            if !columns.is_empty() && columns.len() != row.len() {
                return Err(ParseError::ColumnCountMismatch {
                    expected: columns.len(),
                    found: row.len(),
                }
                .into());
            }
            let mut document = Document::new();
            for (i, expr) in row.iter().enumerate() {
                let key = columns
                    .get(i)
                    .map(|c| c.value.clone())
                    .unwrap_or_else(|| format!("col{}", i));
                document.insert(key, self.translator.value_of(expr).map_err(ParseError::from)?);
            }
            documents.push(document);
        }

        insert_plan(&object_name_to_string(table_name), documents)
    }

    /// `INSERT INTO coll {'a': 1}` and `INSERT INTO coll << {...}, {...} >>`
    fn compile_document_insert(&self, sql: &str) -> Result<Option<ExecutionPlan>, QueryError> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r#"(?is)^INSERT\s+INTO\s+("[^"]+"|[A-Za-z_][\w.]*)\s+(\{.*\}|<<.*>>)$"#)
                .expect("valid document insert regex")
        });
        let Some(caps) = re.captures(sql) else {
            return Ok(None);
        };

        let collection = caps[1].trim_matches('"').to_string();
        let documents = match DocumentLiteral::new(&caps[2]).parse_top()? {
            Bson::Document(doc) => vec![doc],
            Bson::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Bson::Document(doc) => Ok(doc),
                    other => Err(ParseError::InvalidDocumentLiteral(format!(
                        "bag elements must be objects, found {}",
                        other
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            other => {
                return Err(ParseError::InvalidDocumentLiteral(format!(
                    "expected an object or bag, found {}",
                    other
                ))
                .into())
            }
        };

        insert_plan(&collection, documents).map(Some)
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(Arc::new(FunctionRegistry::default()))
    }
}

fn insert_plan(collection: &str, documents: Vec<Document>) -> Result<ExecutionPlan, QueryError> {
    let refs: Vec<&Document> = documents.iter().collect();
    let scan = scan_placeholders(&refs)?;
    let plan = InsertBuilder::new()
        .collection(collection)
        .insert_documents(documents)
        .parameter_style(scan.style, scan.count)
        .build()?;
    Ok(ExecutionPlan::Insert(plan))
}

fn scan_placeholders(documents: &[&Document]) -> Result<PlaceholderScan, ParseError> {
    detect_style_in(documents).map_err(|e| match e {
        ParameterError::MixedStyles => ParseError::MixedPlaceholderStyles,
        other => ParseError::UnsupportedQuery(other.to_string()),
    })
}

fn table_name_of(table: &TableWithJoins) -> Result<String, ParseError> {
    if !table.joins.is_empty() {
        return Err(ParseError::JoinsNotSupported);
    }
    match &table.relation {
        TableFactor::Table { name, .. } => Ok(object_name_to_string(name)),
        other => Err(ParseError::UnsupportedTableExpression(other.to_string())),
    }
}

pub(crate) fn object_name_to_string(name: &ObjectName) -> String {
    name.0.iter().map(|i| i.value.clone()).collect::<Vec<_>>().join(".")
}

fn parse_order_by(order_by: &[OrderByExpr]) -> Result<Vec<Document>, ParseError> {
    let mut result = Vec::with_capacity(order_by.len());
    for expr in order_by {
        let field = field_path(&expr.expr)
            .ok_or_else(|| ParseError::UnsupportedOrderByExpression(expr.expr.to_string()))?;
        let direction = if expr.asc.unwrap_or(true) { 1 } else { -1 };
        let mut entry = Document::new();
        entry.insert(field, direction);
        result.push(entry);
    }
    Ok(result)
}

/// LIMIT/OFFSET operand; negatives pass through so the builder reports them
fn parse_count(expr: &Expr) -> Option<i64> {
    match expr {
        Expr::Value(SqlValue::Number(n, _)) => n.parse().ok(),
        Expr::UnaryOp {
            op: sqlparser::ast::UnaryOperator::Minus,
            expr,
        } => parse_count(expr).map(|n| -n),
        _ => None,
    }
}

fn aggregate_args(args: &[FunctionArg]) -> Result<(String, String), ParseError> {
    let mut texts = args.iter().map(|arg| match arg {
        FunctionArg::Unnamed(FunctionArgExpr::Expr(Expr::Value(
            SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s),
        ))) => Ok(s.clone()),
        other => Err(ParseError::InvalidAggregateCall(format!(
            "arguments must be string literals, found {}",
            other
        ))),
    });

    let pipeline = texts
        .next()
        .ok_or_else(|| ParseError::InvalidAggregateCall("missing pipeline argument".into()))??;
    let options = texts.next().transpose()?.unwrap_or_else(|| "{}".to_string());
    if texts.next().is_some() {
        return Err(ParseError::InvalidAggregateCall(
            "expected at most two arguments".into(),
        ));
    }
    Ok((pipeline, options))
}

/// Reader for object, array and bag literals in document-style INSERT statements
struct DocumentLiteral<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> DocumentLiteral<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn parse_top(&mut self) -> Result<Bson, ParseError> {
        let value = self.parse_value()?;
        self.skip_ws();
        if self.pos != self.text.len() {
            return Err(self.error("trailing characters"));
        }
        Ok(value)
    }

    fn error(&self, message: &str) -> ParseError {
        ParseError::InvalidDocumentLiteral(format!("{} at offset {}", message, self.pos))
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn expect(&mut self, token: &str) -> Result<(), ParseError> {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", token)))
        }
    }

    fn parse_value(&mut self) -> Result<Bson, ParseError> {
        self.skip_ws();
        if self.rest().starts_with("<<") {
            self.pos += 2;
            let items = self.parse_sequence(">>")?;
            return Ok(Bson::Array(items));
        }
        match self.peek() {
            Some('{') => {
                self.pos += 1;
                self.parse_object().map(Bson::Document)
            }
            Some('[') => {
                self.pos += 1;
                self.parse_sequence("]").map(Bson::Array)
            }
            Some(q @ ('\'' | '"')) => self.parse_string(q).map(Bson::String),
            Some(_) => self.parse_scalar(),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn parse_sequence(&mut self, close: &str) -> Result<Vec<Bson>, ParseError> {
        let mut items = Vec::new();
        self.skip_ws();
        if self.rest().starts_with(close) {
            self.pos += close.len();
            return Ok(items);
        }
        loop {
            items.push(self.parse_value()?);
            self.skip_ws();
            if self.rest().starts_with(',') {
                self.pos += 1;
            } else {
                self.expect(close)?;
                return Ok(items);
            }
        }
    }

    fn parse_object(&mut self) -> Result<Document, ParseError> {
        let mut doc = Document::new();
        self.skip_ws();
        if self.peek() == Some('}') {
            self.pos += 1;
            return Ok(doc);
        }
        loop {
            self.skip_ws();
            let key = match self.peek() {
                Some(q @ ('\'' | '"')) => self.parse_string(q)?,
                _ => self.parse_bare_word()?,
            };
            self.expect(":")?;
            let value = self.parse_value()?;
            doc.insert(key, value);
            self.skip_ws();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some('}') => {
                    self.pos += 1;
                    return Ok(doc);
                }
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
    }

    /// Quoted string; a doubled quote or a backslash escapes the quote character
    fn parse_string(&mut self, quote: char) -> Result<String, ParseError> {
        self.pos += quote.len_utf8();
        let mut out = String::new();
        let mut chars = self.rest().char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '\\' {
                if let Some((_, escaped)) = chars.next() {
                    out.push(escaped);
                }
                continue;
            }
            if c == quote {
                if matches!(chars.peek(), Some(&(_, next)) if next == quote) {
                    out.push(quote);
                    chars.next();
                    continue;
                }
                self.pos += i + c.len_utf8();
                return Ok(out);
            }
            out.push(c);
        }
        Err(self.error("unterminated string"))
    }

    fn parse_bare_word(&mut self) -> Result<String, ParseError> {
        let rest = self.rest();
        let len = rest
            .char_indices()
            .find(|(_, c)| !(c.is_alphanumeric() || *c == '_' || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.error("expected a key"));
        }
        self.pos += len;
        Ok(rest[..len].to_string())
    }

    fn parse_scalar(&mut self) -> Result<Bson, ParseError> {
        let rest = self.rest();
        let len = rest
            .char_indices()
            .find(|(_, c)| matches!(c, ',' | '}' | ']' | '>') || c.is_whitespace())
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.error("expected a value"));
        }
        self.pos += len;
        Ok(parse_literal(&rest[..len]).into_bson())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("SQL parse error: {0}")]
    SqlParser(#[from] sqlparser::parser::ParserError),

    #[error("Empty query")]
    EmptyQuery,

    #[error("Multiple statements not supported")]
    MultipleStatements,

    #[error("Unsupported statement type: {0}")]
    UnsupportedStatement(String),

    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("Missing FROM table")]
    MissingTable,

    #[error("JOINs are not supported")]
    JoinsNotSupported,

    #[error("Unsupported table expression: {0}")]
    UnsupportedTableExpression(String),

    #[error("Unsupported ORDER BY expression: {0}")]
    UnsupportedOrderByExpression(String),

    #[error("Invalid LIMIT value: {0}")]
    InvalidLimit(String),

    #[error("Invalid OFFSET value: {0}")]
    InvalidOffset(String),

    #[error("Invalid aggregate call: {0}")]
    InvalidAggregateCall(String),

    #[error("INSERT has {expected} columns but a row has {found} values")]
    ColumnCountMismatch { expected: usize, found: usize },

    #[error("Invalid document literal: {0}")]
    InvalidDocumentLiteral(String),

    #[error("Cannot mix positional (?) and named (:name) placeholders in one statement")]
    MixedPlaceholderStyles,

    #[error("Untranslatable expression: {0}")]
    Untranslatable(#[from] TranslateError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::params::ParameterStyle;
    use crate::query::plan::{ColumnAlias, QueryPlan};
    use bson::doc;

    fn compile(sql: &str) -> ExecutionPlan {
        Compiler::default().compile(sql).unwrap()
    }

    fn query(sql: &str) -> QueryPlan {
        match compile(sql) {
            ExecutionPlan::Query(plan) => plan,
            other => panic!("expected query plan, got {:?}", other),
        }
    }

    #[test]
    fn test_simple_select() {
        let plan = query("SELECT * FROM users");
        assert_eq!(plan.collection(), "users");
        assert!(plan.projection().is_empty());
        assert!(plan.filter().is_empty());
    }

    #[test]
    fn test_select_columns_and_aliases() {
        let plan = query("SELECT name, email AS contact FROM users");
        assert_eq!(plan.projection(), &doc! { "name": 1, "email": 1 });
        assert_eq!(plan.alias_of("email"), Some("contact"));
        assert_eq!(plan.alias_of("name"), Some("name"));
    }

    #[test]
    fn test_same_field_under_two_names() {
        let plan = query("SELECT name, UPPER(name) AS shout FROM users");
        assert_eq!(plan.projection(), &doc! { "name": 1 });
        assert_eq!(
            plan.column_aliases(),
            &[ColumnAlias::new("name", "name"), ColumnAlias::new("name", "shout")]
        );
        assert!(plan.projection_functions().contains_key("shout"));
    }

    #[test]
    fn test_where_order_limit_offset() {
        let plan = query(
            "SELECT * FROM users WHERE age > 18 AND status = 'active' ORDER BY name DESC, age LIMIT 10 OFFSET 5",
        );
        assert_eq!(
            plan.filter(),
            &doc! { "$and": [ { "age": { "$gt": 18 } }, { "status": "active" } ] }
        );
        assert_eq!(plan.sort_document(), doc! { "name": -1, "age": 1 });
        assert_eq!(plan.limit(), Some(10));
        assert_eq!(plan.skip(), Some(5));
    }

    #[test]
    fn test_nested_fields() {
        let plan = query("SELECT c.a, items[1].name FROM orders WHERE items[0].qty > 2");
        assert_eq!(plan.projection(), &doc! { "c.a": 1, "items.1.name": 1 });
        assert_eq!(plan.filter(), &doc! { "items.0.qty": { "$gt": 2 } });
    }

    #[test]
    fn test_table_alias_is_stripped() {
        let plan = query("SELECT u.name FROM users u WHERE u.age > 3");
        assert_eq!(plan.projection(), &doc! { "name": 1 });
        assert_eq!(plan.filter(), &doc! { "age": { "$gt": 3 } });
    }

    #[test]
    fn test_subquery_collection_rewrite() {
        let plan = query("SELECT v.a FROM (SELECT a FROM users WHERE c = 1) v");
        assert_eq!(plan.collection(), "users");
        assert_eq!(plan.projection(), &doc! { "a": 1 });
        assert_eq!(plan.filter(), &doc! { "c": 1 });
        assert_eq!(plan.subquery_alias(), Some("v"));
        assert_eq!(plan.subquery_plan().map(|p| p.collection()), Some("users"));
    }

    #[test]
    fn test_subquery_filters_merge_inner_first() {
        let plan = query("SELECT * FROM (SELECT * FROM users WHERE c = 1) AS v WHERE v.b = 2");
        assert_eq!(plan.filter(), &doc! { "$and": [ { "c": 1 }, { "b": 2 } ] });
    }

    #[test]
    fn test_windowed_subquery_is_staged() {
        let plan = query("SELECT * FROM (SELECT name, qty FROM t LIMIT 2) v WHERE v.qty > 4");
        assert_eq!(plan.collection(), "t");
        assert_eq!(plan.filter(), &doc! { "qty": { "$gt": 4 } });
        assert_eq!(plan.limit(), None);
        let inner = plan.staged_subquery().unwrap();
        assert_eq!(inner.limit(), Some(2));
        assert!(inner.filter().is_empty());

        // without outer WHERE/ORDER BY the windows still compose
        let plan = query("SELECT * FROM (SELECT name FROM t LIMIT 5) v LIMIT 2 OFFSET 1");
        assert!(plan.staged_subquery().is_none());
        assert_eq!(plan.skip(), Some(1));
        assert_eq!(plan.limit(), Some(2));
    }

    #[test]
    fn test_staged_subquery_rejects_mixed_placeholders() {
        let result = Compiler::default()
            .compile("SELECT * FROM (SELECT * FROM t WHERE a = ? LIMIT 2) v WHERE v.b = :b");
        assert!(matches!(
            result,
            Err(QueryError::Parse(ParseError::MixedPlaceholderStyles))
        ));
    }

    #[test]
    fn test_aggregate_from() {
        let plan = query(
            r#"SELECT * FROM orders.aggregate('[{"$match": {"status": "A"}}]', '{}') WHERE total > 5"#,
        );
        assert!(plan.is_aggregate());
        assert_eq!(plan.collection(), "orders");
        assert_eq!(plan.aggregate_pipeline(), Some(r#"[{"$match": {"status": "A"}}]"#));
        assert_eq!(plan.aggregate_options(), Some("{}"));
        assert_eq!(plan.filter(), &doc! { "total": { "$gt": 5 } });

        let unqualified = query(r#"SELECT * FROM aggregate('[]', '{}')"#);
        assert!(unqualified.is_aggregate());
        assert_eq!(unqualified.collection(), "");
    }

    #[test]
    fn test_projection_functions() {
        let plan = query("SELECT UPPER(name) AS upper_name, SUBSTR(code, 1, 3) FROM users");
        let upper = &plan.projection_functions()["upper_name"];
        assert_eq!(upper.function, ProjectionFunction::Upper);
        assert_eq!(upper.field, "name");
        let substr = &plan.projection_functions()["code"];
        assert_eq!(substr.args, vec![Bson::Int32(1), Bson::Int32(3)]);
        assert_eq!(plan.projection(), &doc! { "name": 1, "code": 1 });
    }

    #[test]
    fn test_joins_rejected() {
        let result = Compiler::default().compile("SELECT * FROM a JOIN b ON a.id = b.id");
        assert!(matches!(result, Err(QueryError::Parse(ParseError::JoinsNotSupported))));
    }

    #[test]
    fn test_insert_values() {
        let plan = match compile("INSERT INTO users (id, name) VALUES (1, 'ada'), (2, 'bob')") {
            ExecutionPlan::Insert(plan) => plan,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(plan.collection(), "users");
        assert_eq!(
            plan.documents(),
            &[doc! { "id": 1, "name": "ada" }, doc! { "id": 2, "name": "bob" }]
        );
        assert_eq!(plan.parameter_style(), None);
    }

    #[test]
    fn test_insert_values_without_columns() {
        let plan = match compile("INSERT INTO users VALUES (1, 'ada')") {
            ExecutionPlan::Insert(plan) => plan,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(plan.documents(), &[doc! { "col0": 1, "col1": "ada" }]);
    }

    #[test]
    fn test_insert_document_literals() {
        let plan = match compile("INSERT INTO users {'id': 1, 'name': 'ada', 'tags': ['x', 'y'], 'meta': {'ok': true}}") {
            ExecutionPlan::Insert(plan) => plan,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            plan.documents(),
            &[doc! { "id": 1, "name": "ada", "tags": ["x", "y"], "meta": { "ok": true } }]
        );

        let plan = match compile("INSERT INTO users << {'id': 1}, {'id': 2, 'note': null} >>") {
            ExecutionPlan::Insert(plan) => plan,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(plan.documents(), &[doc! { "id": 1 }, doc! { "id": 2, "note": Bson::Null }]);
    }

    #[test]
    fn test_insert_without_values_rejected() {
        let result = Compiler::default().compile("INSERT INTO users DEFAULT VALUES");
        assert!(matches!(result, Err(QueryError::Parse(_))));
    }

    #[test]
    fn test_insert_placeholders() {
        let plan = match compile("INSERT INTO users (id, name) VALUES (?, ?)") {
            ExecutionPlan::Insert(plan) => plan,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(plan.parameter_style(), Some(ParameterStyle::Qmark));
        assert_eq!(plan.parameter_count(), 2);

        let plan = match compile("INSERT INTO users {'id': :id, 'name': :name}") {
            ExecutionPlan::Insert(plan) => plan,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(plan.parameter_style(), Some(ParameterStyle::Named));
        assert_eq!(
            plan.documents(),
            &[doc! { "id": { "$placeholder": ":id" }, "name": { "$placeholder": ":name" } }]
        );
    }

    #[test]
    fn test_mixed_placeholders_rejected() {
        let result = Compiler::default().compile("INSERT INTO users (id, name) VALUES (?, :name)");
        assert!(matches!(
            result,
            Err(QueryError::Parse(ParseError::MixedPlaceholderStyles))
        ));
    }

    #[test]
    fn test_update() {
        let plan = match compile("UPDATE users SET name = ? WHERE id = ?") {
            ExecutionPlan::Update(plan) => plan,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(plan.collection(), "users");
        assert_eq!(plan.update_fields(), &doc! { "name": { "$placeholder": "?" } });
        assert_eq!(plan.filter(), &doc! { "id": { "$placeholder": "?" } });
        assert_eq!(plan.parameter_style(), Some(ParameterStyle::Qmark));
    }

    #[test]
    fn test_delete() {
        let plan = match compile("DELETE FROM logs WHERE level = 'debug'") {
            ExecutionPlan::Delete(plan) => plan,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(plan.collection(), "logs");
        assert_eq!(plan.filter(), &doc! { "level": "debug" });

        let plan = match compile("DELETE FROM logs") {
            ExecutionPlan::Delete(plan) => plan,
            other => panic!("unexpected {:?}", other),
        };
        assert!(plan.filter().is_empty());
    }

    #[test]
    fn test_negative_limit_is_validation_error() {
        let result = Compiler::default().compile("SELECT * FROM users LIMIT -1");
        assert!(matches!(result, Err(QueryError::Build(_))));
    }

    #[test]
    fn test_unsupported_statement() {
        let result = Compiler::default().compile("CREATE TABLE t (a INT)");
        assert!(matches!(
            result,
            Err(QueryError::Parse(ParseError::UnsupportedStatement(ref k))) if k == "CREATE"
        ));
    }

    #[test]
    fn test_identical_input_identical_plan() {
        let compiler = Compiler::default();
        let sql = "SELECT a FROM t WHERE b LIKE 'x%' AND c IN (1, 2)";
        assert_eq!(compiler.compile(sql).unwrap(), compiler.compile(sql).unwrap());
    }
}
