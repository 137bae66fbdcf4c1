//! Database collaborator backed by sqlite.
//!
//! Workflow steps name a database from the environment file and hand over
//! raw SQL. Only `SELECT` counts as a read; everything else is a write.

use crate::environment::Environment;
use anyhow::{bail, Context, Result};
use serde_json::{Map, Number, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlKind {
    Read,
    Write,
}

/// Classifies a statement by its leading keyword.
pub fn kind_of(sql: &str) -> SqlKind {
    let first = sql.trim_start().split_whitespace().next().unwrap_or("");
    if first.eq_ignore_ascii_case("select") {
        SqlKind::Read
    } else {
        SqlKind::Write
    }
}

/// Rejects a statement whose kind does not match the declared operation.
pub fn validate_operation(sql: &str, kind: SqlKind) -> Result<()> {
    let actual = kind_of(sql);
    if actual != kind {
        match kind {
            SqlKind::Read => bail!("read operations accept SELECT statements only"),
            SqlKind::Write => bail!("write operations must not be SELECT statements"),
        }
    }
    Ok(())
}

pub trait Database: Send + Sync {
    /// Runs a SELECT and returns one JSON object per row.
    fn execute_read(&self, db: &str, sql: &str) -> Result<Vec<Value>>;
    /// Runs a non-SELECT statement and returns the affected row count.
    fn execute_write(&self, db: &str, sql: &str) -> Result<usize>;
}

pub struct SqliteDatabase {
    env: Environment,
}

impl SqliteDatabase {
    pub fn new(env: Environment) -> Self {
        SqliteDatabase { env }
    }

    fn open(&self, db: &str) -> Result<rusqlite::Connection> {
        let path = self
            .env
            .database_path(db)
            .with_context(|| format!("database '{}' is not configured", db))?;
        rusqlite::Connection::open(path)
            .with_context(|| format!("failed to open database '{}'", db))
    }
}

impl Database for SqliteDatabase {
    fn execute_read(&self, db: &str, sql: &str) -> Result<Vec<Value>> {
        validate_operation(sql, SqlKind::Read)?;
        let conn = self.open(db)?;
        let mut stmt = conn
            .prepare(sql)
            .with_context(|| format!("failed to prepare query against '{}'", db))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt.query([])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let mut object = Map::new();
            for (idx, column) in columns.iter().enumerate() {
                let value: rusqlite::types::Value = row.get(idx)?;
                object.insert(column.clone(), sqlite_value_to_json(value));
            }
            results.push(Value::Object(object));
        }
        Ok(results)
    }

    fn execute_write(&self, db: &str, sql: &str) -> Result<usize> {
        validate_operation(sql, SqlKind::Write)?;
        let conn = self.open(db)?;
        conn.execute(sql, [])
            .with_context(|| format!("failed to execute statement against '{}'", db))
    }
}

fn sqlite_value_to_json(value: rusqlite::types::Value) -> Value {
    use rusqlite::types::Value as Sql;
    match value {
        Sql::Null => Value::Null,
        Sql::Integer(i) => Value::Number(i.into()),
        Sql::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        Sql::Text(s) => Value::String(s),
        Sql::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::DatabaseConfig;

    fn env_with_db(path: &std::path::Path) -> Environment {
        let mut env = Environment::default();
        env.databases.insert(
            "main".to_string(),
            DatabaseConfig {
                path: path.to_path_buf(),
            },
        );
        env
    }

    #[test]
    fn only_select_is_a_read() {
        assert_eq!(kind_of("  SELECT * FROM t"), SqlKind::Read);
        assert_eq!(kind_of("select 1"), SqlKind::Read);
        assert_eq!(kind_of("INSERT INTO t VALUES (1)"), SqlKind::Write);
        assert_eq!(kind_of("UPDATE t SET a = 1"), SqlKind::Write);
        assert!(validate_operation("DELETE FROM t", SqlKind::Read).is_err());
        assert!(validate_operation("SELECT 1", SqlKind::Write).is_err());
    }

    #[test]
    fn round_trips_rows_through_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let db = SqliteDatabase::new(env_with_db(&db_path));

        let affected = db
            .execute_write("main", "CREATE TABLE users (id INTEGER, name TEXT)")
            .unwrap();
        assert_eq!(affected, 0);
        db.execute_write("main", "INSERT INTO users VALUES (1, 'ada')")
            .unwrap();
        db.execute_write("main", "INSERT INTO users VALUES (2, 'grace')")
            .unwrap();

        let rows = db
            .execute_read("main", "SELECT id, name FROM users ORDER BY id")
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], "ada");
        assert_eq!(rows[1]["id"], 2);
    }

    #[test]
    fn unconfigured_database_fails() {
        let db = SqliteDatabase::new(Environment::default());
        assert!(db.execute_read("missing", "SELECT 1").is_err());
    }
}
