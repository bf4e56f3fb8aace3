use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection};

use super::{quote_identifier, sql_type, BridgeError, Cell, ColumnDef, RelationalEngine, RelationalRows};

/// Placeholder column for tables built from an empty result
const EMPTY_TABLE_COLUMN: &str = "_id";

impl ToSql for Cell {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Cell::Null => ToSqlOutput::Owned(Value::Null),
            Cell::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            Cell::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            Cell::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Cell::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn cell_from_ref(value: ValueRef<'_>) -> Cell {
    match value {
        ValueRef::Null => Cell::Null,
        ValueRef::Integer(v) => Cell::Integer(v),
        ValueRef::Real(v) => Cell::Real(v),
        ValueRef::Text(bytes) => Cell::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Cell::Blob(bytes.to_vec()),
    }
}

/// SQLite engine over a private in-memory database
pub struct SqliteEngine {
    conn: Connection,
}

impl SqliteEngine {
    pub fn open_in_memory() -> Result<Self, BridgeError> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }
}

impl std::fmt::Debug for SqliteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEngine").finish_non_exhaustive()
    }
}

impl RelationalEngine for SqliteEngine {
    fn create_table(&mut self, name: &str, columns: &[ColumnDef]) -> Result<(), BridgeError> {
        let definitions = if columns.is_empty() {
            format!("{} TEXT", quote_identifier(EMPTY_TABLE_COLUMN))
        } else {
            columns
                .iter()
                .map(|c| format!("{} {}", quote_identifier(&c.name), sql_type(c.tag)))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let ddl = format!("CREATE TABLE {} ({})", quote_identifier(name), definitions);
        tracing::debug!(ddl = %ddl, "creating bridge table");
        self.conn.execute(&ddl, [])?;
        Ok(())
    }

    fn bulk_insert(
        &mut self,
        table: &str,
        columns: &[ColumnDef],
        rows: &[Vec<Cell>],
    ) -> Result<usize, BridgeError> {
        if rows.is_empty() || columns.is_empty() {
            return Ok(0);
        }

        let names = columns
            .iter()
            .map(|c| quote_identifier(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let slots = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(table),
            names,
            slots
        );

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for row in rows {
                if row.len() != columns.len() {
                    return Err(BridgeError::Engine(format!(
                        "row has {} cells, table has {} columns",
                        row.len(),
                        columns.len()
                    )));
                }
                stmt.execute(params_from_iter(row.iter()))?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    fn query(&mut self, sql: &str) -> Result<RelationalRows, BridgeError> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut rows = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut cells = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                cells.push(cell_from_ref(row.get_ref(i)?));
            }
            rows.push(cells);
        }

        Ok(RelationalRows { columns, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TypeTag;

    fn people() -> (Vec<ColumnDef>, Vec<Vec<Cell>>) {
        let columns = vec![
            ColumnDef::new("name", TypeTag::String),
            ColumnDef::new("age", TypeTag::Int),
            ColumnDef::new("score", TypeTag::Double),
        ];
        let rows = vec![
            vec![Cell::Text("ada".into()), Cell::Integer(36), Cell::Real(9.5)],
            vec![Cell::Text("bob".into()), Cell::Integer(41), Cell::Null],
            vec![Cell::Text("cy".into()), Cell::Integer(36), Cell::Real(7.0)],
        ];
        (columns, rows)
    }

    #[test]
    fn test_create_insert_query() {
        let mut engine = SqliteEngine::open_in_memory().unwrap();
        let (columns, rows) = people();
        engine.create_table("v", &columns).unwrap();
        assert_eq!(engine.bulk_insert("v", &columns, &rows).unwrap(), 3);

        let result = engine
            .query("SELECT age, COUNT(*) AS n FROM v GROUP BY age ORDER BY age")
            .unwrap();
        assert_eq!(result.columns, vec!["age", "n"]);
        assert_eq!(
            result.rows,
            vec![
                vec![Cell::Integer(36), Cell::Integer(2)],
                vec![Cell::Integer(41), Cell::Integer(1)],
            ]
        );
    }

    #[test]
    fn test_nulls_and_reals_survive() {
        let mut engine = SqliteEngine::open_in_memory().unwrap();
        let (columns, rows) = people();
        engine.create_table("v", &columns).unwrap();
        engine.bulk_insert("v", &columns, &rows).unwrap();

        let result = engine.query("SELECT score FROM v ORDER BY name").unwrap();
        assert_eq!(
            result.rows,
            vec![vec![Cell::Real(9.5)], vec![Cell::Null], vec![Cell::Real(7.0)]]
        );
    }

    #[test]
    fn test_empty_table() {
        let mut engine = SqliteEngine::open_in_memory().unwrap();
        engine.create_table("subquery_result", &[]).unwrap();
        let result = engine.query("SELECT COUNT(*) FROM subquery_result").unwrap();
        assert_eq!(result.rows, vec![vec![Cell::Integer(0)]]);
    }

    #[test]
    fn test_sql_error_surfaces() {
        let mut engine = SqliteEngine::open_in_memory().unwrap();
        assert!(matches!(
            engine.query("SELECT * FROM missing"),
            Err(BridgeError::Sqlite(_))
        ));
    }
}
