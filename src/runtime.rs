//! C9: the shared execution runtime. Wraps a single `rusqlite::Connection`
//! opened in WAL mode, serializes every statement through a blocking-task
//! bridge (spec.md §4.8, SPEC_FULL.md §4.9), and bridges rows to typed
//! JSON for the REST/RPC/wire layers.
//!
//! Reads and writes both serialize through the same `std::sync::Mutex`:
//! `rusqlite::Connection` is not safely shared across threads for
//! concurrent access without a pool, and a single embedded SQLite file is
//! the whole point of this design, so this favors correctness over
//! theoretical read concurrency (recorded as an Open Question resolution
//! in DESIGN.md).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::Value as JsonValue;

use crate::error::{AppError, AppResult, ErrorKind};

const BOOTSTRAP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS _columns (
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL,
    pg_type TEXT NOT NULL,
    nullable INTEGER NOT NULL,
    default_value TEXT,
    is_primary INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (table_name, column_name)
);
CREATE TABLE IF NOT EXISTS _fts_indexes (
    table_name TEXT NOT NULL,
    index_name TEXT NOT NULL,
    columns TEXT NOT NULL,
    tokenizer TEXT NOT NULL,
    pk_column TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (table_name, index_name)
);
CREATE TABLE IF NOT EXISTS _rls_tables (
    table_name TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS _rls_policies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    name TEXT NOT NULL,
    command TEXT NOT NULL,
    roles TEXT NOT NULL,
    using_expr TEXT,
    check_expr TEXT
);
CREATE TABLE IF NOT EXISTS _rpc_functions (
    name TEXT PRIMARY KEY,
    language TEXT NOT NULL,
    return_type TEXT NOT NULL,
    returns_set INTEGER NOT NULL,
    volatility TEXT NOT NULL,
    security TEXT NOT NULL,
    source_pg TEXT NOT NULL,
    source_sqlite TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS _rpc_function_args (
    function_name TEXT NOT NULL,
    name TEXT NOT NULL,
    type_name TEXT NOT NULL,
    position INTEGER NOT NULL,
    default_value TEXT,
    PRIMARY KEY (function_name, name)
);
"#;

/// Registers `regexp(pattern, value)`/`iregexp(pattern, value)` scalar
/// functions so the generator's SQLite-dialect `REGEXP`/`NOT REGEXP`
/// operator (for `match`) and `iregexp(...)` call (for `imatch`) have
/// something to dispatch to — SQLite has no built-in regex engine and
/// calls `regexp(rhs, lhs)` for its `X REGEXP Y` operator by convention.
fn register_regexp_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function("regexp", 2, FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC, |ctx| {
        let pattern: String = ctx.get(0)?;
        let text: String = ctx.get(1)?;
        let re = Regex::new(&pattern).map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
        Ok(re.is_match(&text))
    })?;
    conn.create_scalar_function("iregexp", 2, FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC, |ctx| {
        let pattern: String = ctx.get(0)?;
        let text: String = ctx.get(1)?;
        let re = RegexBuilder::new(&pattern).case_insensitive(true).build().map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
        Ok(re.is_match(&text))
    })?;
    Ok(())
}

#[derive(Clone)]
pub struct DbHandle {
    conn: Arc<StdMutex<Connection>>,
}

impl DbHandle {
    /// Opens `path` (or an in-memory database for tests), applies WAL
    /// mode, and installs the reserved metadata tables idempotently.
    pub async fn open(path: &Path) -> AppResult<Self> {
        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.execute_batch(BOOTSTRAP_SQL)?;
            register_regexp_functions(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| AppError::internal(format!("database open task panicked: {e}")))?
        .map_err(AppError::from)?;

        Ok(Self { conn: Arc::new(StdMutex::new(conn)) })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> AppResult<Self> {
        let conn = tokio::task::spawn_blocking(|| -> rusqlite::Result<Connection> {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch(BOOTSTRAP_SQL)?;
            register_regexp_functions(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| AppError::internal(format!("database open task panicked: {e}")))?
        .map_err(AppError::from)?;
        Ok(Self { conn: Arc::new(StdMutex::new(conn)) })
    }

    /// Runs `f` against the connection on a blocking thread, retrying on
    /// `SQLITE_BUSY` with exponential backoff, bounded by a 30s timeout
    /// (spec.md §4.8, SPEC_FULL.md §4.9).
    async fn with_conn<F, T>(&self, f: F) -> AppResult<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let task = tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("sqlite connection mutex poisoned");
            run_with_busy_retry(&guard, f)
        });

        match tokio::time::timeout(Duration::from_secs(30), task).await {
            Ok(Ok(result)) => result.map_err(AppError::from),
            Ok(Err(join_err)) => Err(AppError::internal(format!("blocking task panicked: {join_err}"))),
            Err(_) => Err(AppError::new(ErrorKind::Transient, "statement exceeded 30s timeout")),
        }
    }

    /// Executes a DDL/DML statement with positional parameters, returning
    /// the affected row count.
    pub async fn execute(&self, sql: String, params: Vec<JsonValue>) -> AppResult<usize> {
        self.with_conn(move |conn| {
            let values: Vec<SqlValue> = params.iter().map(json_to_sql_value).collect();
            conn.execute(&sql, rusqlite::params_from_iter(values.iter()))
        })
        .await
    }

    /// Executes a batch of `;`-separated DDL statements as one
    /// transaction (used for FTS index create/drop per spec.md §4.5).
    pub async fn execute_batch(&self, sql: String) -> AppResult<()> {
        self.with_conn(move |conn| conn.execute_batch(&sql)).await
    }

    /// Runs a read query and returns each row as a JSON object keyed by
    /// column name.
    pub async fn query_rows(&self, sql: String, params: Vec<JsonValue>) -> AppResult<Vec<JsonValue>> {
        self.with_conn(move |conn| {
            let values: Vec<SqlValue> = params.iter().map(json_to_sql_value).collect();
            let mut stmt = conn.prepare(&sql)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| row_to_json(row, &columns))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    /// Runs a read query bound to named `:arg` placeholders, used by the
    /// RPC engine (spec.md §4.6).
    pub async fn query_named(&self, sql: String, named: HashMap<String, JsonValue>) -> AppResult<Vec<JsonValue>> {
        self.with_conn(move |conn| {
            let values: Vec<(String, SqlValue)> =
                named.iter().map(|(k, v)| (format!(":{k}"), json_to_sql_value(v))).collect();
            let refs: Vec<(&str, &dyn rusqlite::ToSql)> =
                values.iter().map(|(k, v)| (k.as_str(), v as &dyn rusqlite::ToSql)).collect();
            let mut stmt = conn.prepare(&sql)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            let rows = stmt.query_map(refs.as_slice(), |row| row_to_json(row, &columns))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    pub async fn last_insert_rowid(&self) -> AppResult<i64> {
        self.with_conn(|conn| Ok(conn.last_insert_rowid())).await
    }

    /// Runs an `UPDATE ... RETURNING *` inside an explicit transaction
    /// and, if `check_expr` is given (the RLS `CHECK` predicate), evaluates
    /// it against every returned row's post-update values before
    /// committing — rolling the whole statement back on the first
    /// violation instead of leaving a row that satisfies `USING` but
    /// fails `CHECK` (spec.md §4.4, §8 RLS closure).
    pub async fn execute_update_with_check(&self, sql: String, params: Vec<JsonValue>, check_expr: Option<crate::ast::Expr>) -> AppResult<Vec<JsonValue>> {
        let conn = self.conn.clone();
        let task = tokio::task::spawn_blocking(move || run_update_with_row_check(&conn, &sql, &params, check_expr.as_ref()));
        match tokio::time::timeout(Duration::from_secs(30), task).await {
            Ok(result) => result.map_err(|e| AppError::internal(format!("blocking task panicked: {e}")))?,
            Err(_) => Err(AppError::new(ErrorKind::Transient, "statement exceeded 30s timeout")),
        }
    }

    /// `PRAGMA table_info(<table>)` — used by the wire front-end to
    /// populate the column registry after `CREATE TABLE` (spec.md §4.7).
    pub async fn table_info(&self, table: String) -> AppResult<Vec<ColumnPragmaInfo>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
            let rows = stmt.query_map([], |row| {
                Ok(ColumnPragmaInfo {
                    name: row.get::<_, String>(1)?,
                    sqlite_type: row.get::<_, String>(2)?,
                    not_null: row.get::<_, i64>(3)? != 0,
                    primary_key: row.get::<_, i64>(5)? != 0,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    pub async fn table_exists(&self, table: String) -> AppResult<bool> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1",
                [table.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map(|r| r.is_some())
        })
        .await
    }
}

/// Executes `sql` inside `BEGIN IMMEDIATE`, collects the returned rows,
/// evaluates `check_expr` (if any) against each one via SQLite itself
/// (never in Rust, per spec.md §4.4), and commits only if every row
/// passes; otherwise rolls back and returns a `PermissionDenied` error.
fn run_update_with_row_check(conn: &StdMutex<Connection>, sql: &str, params: &[JsonValue], check_expr: Option<&crate::ast::Expr>) -> AppResult<Vec<JsonValue>> {
    let guard = conn.lock().expect("sqlite connection mutex poisoned");
    let mut delay_ms = 10u64;
    for attempt in 0..5 {
        match guard.execute_batch("BEGIN IMMEDIATE") {
            Ok(()) => break,
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::DatabaseBusy && attempt < 4 => {
                std::thread::sleep(Duration::from_millis(delay_ms));
                delay_ms *= 2;
                continue;
            }
            Err(e) => return Err(AppError::from(e)),
        }
    }

    let outcome = (|| -> AppResult<Vec<JsonValue>> {
        let rows = {
            let values: Vec<SqlValue> = params.iter().map(json_to_sql_value).collect();
            let mut stmt = guard.prepare(sql).map_err(AppError::from)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| row_to_json(row, &columns))
                .map_err(AppError::from)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(AppError::from)?
        };
        if let Some(expr) = check_expr {
            for row in &rows {
                if !evaluate_check_row(&guard, expr, row).map_err(AppError::from)? {
                    return Err(AppError::permission_denied("new row violates row-level security policy"));
                }
            }
        }
        Ok(rows)
    })();

    match outcome {
        Ok(rows) => {
            guard.execute_batch("COMMIT").map_err(AppError::from)?;
            Ok(rows)
        }
        Err(e) => {
            let _ = guard.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Substitutes `row`'s literal values into `expr` (via `check_expr_for_row`)
/// and evaluates the resulting boolean expression through SQLite.
fn evaluate_check_row(conn: &Connection, expr: &crate::ast::Expr, row: &JsonValue) -> rusqlite::Result<bool> {
    let JsonValue::Object(map) = row else { return Ok(true) };
    let bound: HashMap<String, crate::ast::Expr> = map.iter().map(|(k, v)| (k.clone(), json_to_literal_expr(v))).collect();
    let substituted = crate::rls::RlsRegistry::check_expr_for_row(expr, &bound);
    let sql_expr = crate::ast::gen::generate_expr(&substituted, crate::ast::Dialect::Sqlite);
    let sql = format!("SELECT CASE WHEN ({sql_expr}) THEN 1 ELSE 0 END");
    conn.query_row(&sql, [], |r| r.get::<_, i64>(0)).map(|v| v != 0)
}

fn json_to_literal_expr(v: &JsonValue) -> crate::ast::Expr {
    use crate::ast::{Expr, Literal};
    match v {
        JsonValue::Null => Expr::Literal(Literal::Null),
        JsonValue::Bool(b) => Expr::Literal(Literal::Bool(*b)),
        JsonValue::Number(n) => Expr::Literal(Literal::Number(n.to_string())),
        JsonValue::String(s) => Expr::Literal(Literal::String(s.clone())),
        other => Expr::Literal(Literal::String(other.to_string())),
    }
}

fn run_with_busy_retry<T>(conn: &Connection, f: impl Fn(&Connection) -> rusqlite::Result<T>) -> rusqlite::Result<T> {
    let mut delay_ms = 10u64;
    for attempt in 0..5 {
        match f(conn) {
            Ok(v) => return Ok(v),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::DatabaseBusy && attempt < 4 =>
            {
                std::thread::sleep(Duration::from_millis(delay_ms));
                delay_ms *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop always returns on the final attempt")
}

#[derive(Debug, Clone)]
pub struct ColumnPragmaInfo {
    pub name: String,
    pub sqlite_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

use rusqlite::OptionalExtension;

fn json_to_sql_value(v: &JsonValue) -> SqlValue {
    match v {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(if *b { 1 } else { 0 }),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Null
            }
        }
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn row_to_json(row: &rusqlite::Row, columns: &[String]) -> rusqlite::Result<JsonValue> {
    let mut map = serde_json::Map::with_capacity(columns.len());
    for (i, name) in columns.iter().enumerate() {
        let value: SqlValue = row.get(i)?;
        map.insert(name.clone(), sql_value_to_json(value));
    }
    Ok(JsonValue::Object(map))
}

fn sql_value_to_json(v: SqlValue) -> JsonValue {
    match v {
        SqlValue::Null => JsonValue::Null,
        SqlValue::Integer(i) => JsonValue::from(i),
        SqlValue::Real(f) => serde_json::Number::from_f64(f).map(JsonValue::Number).unwrap_or(JsonValue::Null),
        SqlValue::Text(s) => JsonValue::String(s),
        SqlValue::Blob(b) => JsonValue::String(b.iter().map(|byte| format!("{byte:02x}")).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstraps_reserved_tables() {
        let db = DbHandle::open_in_memory().await.unwrap();
        assert!(db.table_exists("_columns".to_string()).await.unwrap());
        assert!(db.table_exists("_rls_policies".to_string()).await.unwrap());
        assert!(db.table_exists("_rpc_functions".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn executes_ddl_and_queries_rows_as_json() {
        let db = DbHandle::open_in_memory().await.unwrap();
        db.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT)".to_string(), vec![]).await.unwrap();
        db.execute("INSERT INTO notes (title) VALUES (?1)".to_string(), vec![JsonValue::String("hi".to_string())])
            .await
            .unwrap();
        let rows = db.query_rows("SELECT id, title FROM notes".to_string(), vec![]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], JsonValue::String("hi".to_string()));
    }

    #[tokio::test]
    async fn query_named_binds_rpc_style_placeholders() {
        let db = DbHandle::open_in_memory().await.unwrap();
        let mut named = HashMap::new();
        named.insert("n".to_string(), JsonValue::from(41));
        let rows = db.query_named("SELECT :n + 1 AS v".to_string(), named).await.unwrap();
        assert_eq!(rows[0]["v"], JsonValue::from(42));
    }

    #[tokio::test]
    async fn table_info_reports_columns_and_primary_key() {
        let db = DbHandle::open_in_memory().await.unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL)".to_string(), vec![]).await.unwrap();
        let cols = db.table_info("t".to_string()).await.unwrap();
        assert!(cols.iter().any(|c| c.name == "id" && c.primary_key));
        assert!(cols.iter().any(|c| c.name == "name" && c.not_null));
    }

    fn owner_eq_alice() -> crate::ast::Expr {
        use crate::ast::{BinaryOp, Expr, Ident, Literal};
        Expr::Binary {
            op: BinaryOp::Eq,
            left: Box::new(Expr::Ident(Ident::new("owner"))),
            right: Box::new(Expr::Literal(Literal::String("alice".to_string()))),
            pos: 0,
        }
    }

    #[tokio::test]
    async fn update_with_check_commits_when_every_row_satisfies_check() {
        let db = DbHandle::open_in_memory().await.unwrap();
        db.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, owner TEXT, title TEXT)".to_string(), vec![]).await.unwrap();
        db.execute("INSERT INTO notes (owner, title) VALUES ('alice', 'old')".to_string(), vec![]).await.unwrap();

        let rows = db
            .execute_update_with_check("UPDATE notes SET title = 'new' WHERE id = 1 RETURNING *".to_string(), vec![], Some(owner_eq_alice()))
            .await
            .unwrap();
        assert_eq!(rows[0]["title"], JsonValue::String("new".to_string()));

        let persisted = db.query_rows("SELECT title FROM notes WHERE id = 1".to_string(), vec![]).await.unwrap();
        assert_eq!(persisted[0]["title"], JsonValue::String("new".to_string()));
    }

    #[tokio::test]
    async fn update_with_check_rolls_back_when_a_row_violates_check() {
        let db = DbHandle::open_in_memory().await.unwrap();
        db.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, owner TEXT, title TEXT)".to_string(), vec![]).await.unwrap();
        db.execute("INSERT INTO notes (owner, title) VALUES ('bob', 'old')".to_string(), vec![]).await.unwrap();

        let err = db
            .execute_update_with_check("UPDATE notes SET title = 'new' WHERE id = 1 RETURNING *".to_string(), vec![], Some(owner_eq_alice()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::PermissionDenied);

        let persisted = db.query_rows("SELECT title FROM notes WHERE id = 1".to_string(), vec![]).await.unwrap();
        assert_eq!(persisted[0]["title"], JsonValue::String("old".to_string()), "rollback must undo the write");
    }
}
