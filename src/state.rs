//! Wires the core components (C3 translator, C5 RLS, C6 FTS, C7 RPC)
//! and the out-of-scope collaborators (auth/storage/mail) around a
//! single `DbHandle`, and keeps the reserved metadata tables (spec.md
//! §3) in sync with the in-memory registries the core reads on every
//! request.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

use crate::ast::CreateTable;
use crate::auth::ClaimsProvider;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::fts::{FtsIndex, Tokenizer};
use crate::mail::{MailDispatcher, MailSink};
use crate::rls::{AuthContext, Command, Policy, RlsRegistry};
use crate::rpc::{RpcFunction, RpcRegistry};
use crate::runtime::DbHandle;
use crate::storage::BlobStore;

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub pg_type: String,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub is_primary: bool,
}

/// Per-table column registry (spec.md §3 "Column registry").
#[derive(Debug, Default)]
pub struct ColumnRegistry {
    tables: HashMap<String, HashMap<String, ColumnInfo>>,
}

impl ColumnRegistry {
    pub fn columns(&self, table: &str) -> Option<&HashMap<String, ColumnInfo>> {
        self.tables.get(table)
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    fn insert(&mut self, table: &str, column: &str, info: ColumnInfo) {
        self.tables.entry(table.to_string()).or_default().insert(column.to_string(), info);
    }
}

pub struct AppState {
    pub config: Config,
    pub db: DbHandle,
    pub rls: RwLock<RlsRegistry>,
    pub rpc: RwLock<RpcRegistry>,
    pub fts: RwLock<HashMap<(String, String), FtsIndex>>,
    pub columns: RwLock<ColumnRegistry>,
    pub claims_provider: Box<dyn ClaimsProvider>,
    pub blob_store: Box<dyn BlobStore>,
    pub mail: MailDispatcher,
}

impl AppState {
    /// Opens the database and reloads every registry from the reserved
    /// metadata tables, so a restarted process comes back up with the
    /// exact policies/indexes/functions/columns it had before.
    pub async fn bootstrap(
        config: Config,
        claims_provider: Box<dyn ClaimsProvider>,
        blob_store: Box<dyn BlobStore>,
        mail_sink: Box<dyn MailSink>,
    ) -> AppResult<Arc<Self>> {
        let db = DbHandle::open(&config.db_path).await?;
        let state = Arc::new(Self {
            config,
            db,
            rls: RwLock::new(RlsRegistry::new()),
            rpc: RwLock::new(RpcRegistry::new()),
            fts: RwLock::new(HashMap::new()),
            columns: RwLock::new(ColumnRegistry::default()),
            claims_provider,
            blob_store,
            mail: MailDispatcher::spawn(mail_sink),
        });
        state.load_registries().await?;
        Ok(state)
    }

    async fn load_registries(&self) -> AppResult<()> {
        for row in self.db.query_rows("SELECT table_name, enabled FROM _rls_tables".to_string(), vec![]).await? {
            let table = text_field(&row, "table_name");
            let enabled = row["enabled"].as_i64().unwrap_or(0) != 0;
            self.rls.write().await.set_enabled(&table, enabled);
        }

        for row in self
            .db
            .query_rows("SELECT table_name, name, command, roles, using_expr, check_expr FROM _rls_policies".to_string(), vec![])
            .await?
        {
            let table = text_field(&row, "table_name");
            let command = parse_command(&text_field(&row, "command"));
            let roles: Vec<String> = text_field(&row, "roles").split(',').filter(|s| !s.is_empty()).map(str::to_string).collect();
            let using = parse_policy_expr(row.get("using_expr"))?;
            let check = parse_policy_expr(row.get("check_expr"))?;
            self.rls.write().await.add_policy(
                &table,
                Policy { name: text_field(&row, "name"), command, roles, using, check },
            );
        }

        for row in self
            .db
            .query_rows("SELECT name, return_type, returns_set, source_sqlite FROM _rpc_functions".to_string(), vec![])
            .await?
        {
            let name = text_field(&row, "name");
            let args = self.load_rpc_args(&name).await?;
            let returns = if row["returns_set"].as_i64().unwrap_or(0) != 0 {
                crate::ast::ReturnType::SetOf(text_field(&row, "return_type"))
            } else {
                crate::ast::ReturnType::Scalar(text_field(&row, "return_type"))
            };
            self.rpc.write().await.insert(RpcFunction { name, args, returns, body_sql: text_field(&row, "source_sqlite") });
        }

        for row in self
            .db
            .query_rows("SELECT table_name, index_name, columns, tokenizer, pk_column FROM _fts_indexes".to_string(), vec![])
            .await?
        {
            let table = text_field(&row, "table_name");
            let name = text_field(&row, "index_name");
            let columns = text_field(&row, "columns").split(',').map(str::to_string).collect();
            let tokenizer = Tokenizer::parse(&text_field(&row, "tokenizer"))?;
            let pk_column = text_field(&row, "pk_column");
            self.fts.write().await.insert(
                (table.clone(), name.clone()),
                FtsIndex { table, name, columns, tokenizer, pk_column },
            );
        }

        for row in self
            .db
            .query_rows("SELECT table_name, column_name, pg_type, nullable, default_value, is_primary FROM _columns".to_string(), vec![])
            .await?
        {
            let table = text_field(&row, "table_name");
            let column = text_field(&row, "column_name");
            let info = ColumnInfo {
                pg_type: text_field(&row, "pg_type"),
                nullable: row["nullable"].as_i64().unwrap_or(1) != 0,
                default_value: row.get("default_value").and_then(|v| v.as_str()).map(str::to_string),
                is_primary: row["is_primary"].as_i64().unwrap_or(0) != 0,
            };
            self.columns.write().await.insert(&table, &column, info);
        }

        Ok(())
    }

    async fn load_rpc_args(&self, function_name: &str) -> AppResult<Vec<crate::rpc::RpcArg>> {
        let rows = self
            .db
            .query_rows(
                "SELECT name, type_name, position, default_value FROM _rpc_function_args WHERE function_name = ?1 ORDER BY position".to_string(),
                vec![JsonValue::String(function_name.to_string())],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| crate::rpc::RpcArg {
                name: text_field(&row, "name"),
                type_name: text_field(&row, "type_name"),
                default: row.get("default_value").and_then(|v| v.as_str()).and_then(|s| serde_json::from_str(s).ok()),
                position: row["position"].as_i64().unwrap_or(0) as usize,
            })
            .collect())
    }

    /// Runs a `CREATE TABLE` DDL statement and records the resulting
    /// columns in the registry, both in memory and in `_columns`.
    pub async fn create_table(&self, ddl_sql: String, table: &CreateTable, stripped_uuid_defaults: &[String]) -> AppResult<()> {
        self.db.execute(ddl_sql, vec![]).await?;

        let table_name = table.name.last().value.clone();
        let info = self.db.table_info(table_name.clone()).await?;
        let mut registry = self.columns.write().await;
        for pragma_col in &info {
            let def = table.columns.iter().find(|c| c.name.value == pragma_col.name);
            let pg_type = def.map(|c| registry_pg_type(&c.type_name)).unwrap_or_else(|| "text".to_string());
            let default_value = if stripped_uuid_defaults.contains(&pragma_col.name) {
                Some("gen_random_uuid()".to_string())
            } else {
                def.and_then(|c| c.default.as_ref()).map(|e| crate::ast::gen::generate_expr(e, crate::ast::Dialect::Postgres))
            };
            let column_info = ColumnInfo {
                pg_type,
                nullable: !pragma_col.not_null,
                default_value,
                is_primary: pragma_col.primary_key,
            };
            registry.insert(&table_name, &pragma_col.name, column_info.clone());
            self.db
                .execute(
                    "INSERT OR REPLACE INTO _columns (table_name, column_name, pg_type, nullable, default_value, is_primary) VALUES (?1, ?2, ?3, ?4, ?5, ?6)".to_string(),
                    vec![
                        JsonValue::String(table_name.clone()),
                        JsonValue::String(pragma_col.name.clone()),
                        JsonValue::String(column_info.pg_type.clone()),
                        JsonValue::from(column_info.nullable),
                        column_info.default_value.clone().map(JsonValue::String).unwrap_or(JsonValue::Null),
                        JsonValue::from(column_info.is_primary),
                    ],
                )
                .await?;
        }
        Ok(())
    }

    /// Persists a policy (CLI `policy add` or an admin call), enabling
    /// RLS on the table the first time one is added.
    pub async fn add_policy(&self, table: &str, policy: Policy) -> AppResult<()> {
        self.db
            .execute(
                "INSERT OR IGNORE INTO _rls_tables (table_name, enabled) VALUES (?1, 1)".to_string(),
                vec![JsonValue::String(table.to_string())],
            )
            .await?;
        self.db
            .execute(
                "UPDATE _rls_tables SET enabled = 1 WHERE table_name = ?1".to_string(),
                vec![JsonValue::String(table.to_string())],
            )
            .await?;
        self.db
            .execute(
                "INSERT INTO _rls_policies (table_name, name, command, roles, using_expr, check_expr) VALUES (?1, ?2, ?3, ?4, ?5, ?6)".to_string(),
                vec![
                    JsonValue::String(table.to_string()),
                    JsonValue::String(policy.name.clone()),
                    JsonValue::String(command_name(policy.command).to_string()),
                    JsonValue::String(policy.roles.join(",")),
                    policy.using.as_ref().map(|e| crate::ast::gen::generate_expr(e, crate::ast::Dialect::Postgres)).map(JsonValue::String).unwrap_or(JsonValue::Null),
                    policy.check.as_ref().map(|e| crate::ast::gen::generate_expr(e, crate::ast::Dialect::Postgres)).map(JsonValue::String).unwrap_or(JsonValue::Null),
                ],
            )
            .await?;

        let mut rls = self.rls.write().await;
        rls.set_enabled(table, true);
        rls.add_policy(table, policy);
        Ok(())
    }

    /// Creates an FTS5 index and its sync triggers, persisting the
    /// metadata row alongside the physical objects in one transaction
    /// (spec.md §3 FTS index ownership invariant).
    pub async fn create_fts_index(&self, index: FtsIndex) -> AppResult<()> {
        let batch = index.create_statements().join(";\n") + ";";
        self.db.execute_batch(batch).await?;
        self.db
            .execute(
                "INSERT OR REPLACE INTO _fts_indexes (table_name, index_name, columns, tokenizer, pk_column, created_at) VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))".to_string(),
                vec![
                    JsonValue::String(index.table.clone()),
                    JsonValue::String(index.name.clone()),
                    JsonValue::String(index.columns.join(",")),
                    JsonValue::String(tokenizer_name(index.tokenizer).to_string()),
                    JsonValue::String(index.pk_column.clone()),
                ],
            )
            .await?;
        self.fts.write().await.insert((index.table.clone(), index.name.clone()), index);
        Ok(())
    }

    pub async fn drop_fts_index(&self, table: &str, name: &str) -> AppResult<()> {
        let index = self.fts.read().await.get(&(table.to_string(), name.to_string())).cloned();
        let Some(index) = index else {
            return Err(AppError::not_found(format!("no FTS index {name} on {table}")));
        };
        let batch = index.drop_statements().join(";\n") + ";";
        self.db.execute_batch(batch).await?;
        self.db
            .execute(
                "DELETE FROM _fts_indexes WHERE table_name = ?1 AND index_name = ?2".to_string(),
                vec![JsonValue::String(table.to_string()), JsonValue::String(name.to_string())],
            )
            .await?;
        self.fts.write().await.remove(&(table.to_string(), name.to_string()));
        Ok(())
    }

    /// Registers a parsed `CREATE FUNCTION` statement, persisting its
    /// definition and argument list.
    pub async fn register_function(&self, cf: &crate::ast::CreateFunction, func: RpcFunction) -> AppResult<()> {
        self.db
            .execute(
                "INSERT OR REPLACE INTO _rpc_functions (name, language, return_type, returns_set, volatility, security, source_pg, source_sqlite) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)".to_string(),
                vec![
                    JsonValue::String(func.name.clone()),
                    JsonValue::String(cf.language.clone()),
                    JsonValue::String(return_type_name(&func.returns)),
                    JsonValue::from(func.returns_set()),
                    JsonValue::String(volatility_name(cf.volatility).to_string()),
                    JsonValue::String(security_name(cf.security).to_string()),
                    JsonValue::String(cf.body.text.clone()),
                    JsonValue::String(func.body_sql.clone()),
                ],
            )
            .await?;
        self.db
            .execute(
                "DELETE FROM _rpc_function_args WHERE function_name = ?1".to_string(),
                vec![JsonValue::String(func.name.clone())],
            )
            .await?;
        for arg in &func.args {
            self.db
                .execute(
                    "INSERT INTO _rpc_function_args (function_name, name, type_name, position, default_value) VALUES (?1, ?2, ?3, ?4, ?5)".to_string(),
                    vec![
                        JsonValue::String(func.name.clone()),
                        JsonValue::String(arg.name.clone()),
                        JsonValue::String(arg.type_name.clone()),
                        JsonValue::from(arg.position as i64),
                        arg.default.clone().map(|v| JsonValue::String(v.to_string())).unwrap_or(JsonValue::Null),
                    ],
                )
                .await?;
        }
        self.rpc.write().await.insert(func);
        Ok(())
    }

    pub fn auth_context(&self, apikey: Option<&str>, bearer: Option<&str>) -> AppResult<AuthContext> {
        crate::auth::auth_context_from_headers(apikey, bearer, self.claims_provider.as_ref(), &self.config.anon_key, &self.config.service_key)
    }

    /// Fills in `DEFAULT gen_random_uuid()` columns an `INSERT` omitted,
    /// the same way the PG server would apply a column default — except
    /// the default was stripped from the DDL at translate time (spec.md
    /// §4.2), so the column registry carries it instead.
    pub async fn inject_uuid_defaults(&self, insert: &mut crate::ast::Insert) {
        let table = insert.table.last().value.clone();
        let registry = self.columns.read().await;
        let Some(columns) = registry.columns(&table) else { return };
        let missing: Vec<String> = columns
            .iter()
            .filter(|(name, info)| info.default_value.as_deref() == Some("gen_random_uuid()") && !insert.columns.iter().any(|c| &c.value == *name))
            .map(|(name, _)| name.clone())
            .collect();
        if missing.is_empty() {
            return;
        }
        let crate::ast::InsertSource::Values(rows) = &mut insert.source else { return };
        for name in &missing {
            insert.columns.push(crate::ast::Ident::new(name.as_str()));
            let expr = crate::ast::Expr::Raw(crate::ast::RawSql { text: crate::translate::uuid_gen::v4_uuid_sql(), pos: 0 });
            for row in rows.iter_mut() {
                row.push(expr.clone());
            }
        }
    }
}

fn text_field(row: &JsonValue, key: &str) -> String {
    row.get(key).and_then(|v| v.as_str()).unwrap_or_default().to_string()
}

fn parse_command(s: &str) -> Command {
    match s {
        "SELECT" => Command::Select,
        "INSERT" => Command::Insert,
        "UPDATE" => Command::Update,
        "DELETE" => Command::Delete,
        _ => Command::All,
    }
}

fn command_name(c: Command) -> &'static str {
    match c {
        Command::All => "ALL",
        Command::Select => "SELECT",
        Command::Insert => "INSERT",
        Command::Update => "UPDATE",
        Command::Delete => "DELETE",
    }
}

fn tokenizer_name(t: Tokenizer) -> &'static str {
    match t {
        Tokenizer::Unicode61 => "unicode61",
        Tokenizer::Porter => "porter",
        Tokenizer::Ascii => "ascii",
        Tokenizer::Trigram => "trigram",
    }
}

fn volatility_name(v: crate::ast::Volatility) -> &'static str {
    match v {
        crate::ast::Volatility::Volatile => "VOLATILE",
        crate::ast::Volatility::Stable => "STABLE",
        crate::ast::Volatility::Immutable => "IMMUTABLE",
    }
}

fn security_name(s: crate::ast::Security) -> &'static str {
    match s {
        crate::ast::Security::Invoker => "INVOKER",
        crate::ast::Security::Definer => "DEFINER",
    }
}

fn return_type_name(r: &crate::ast::ReturnType) -> String {
    match r {
        crate::ast::ReturnType::Scalar(t) => t.clone(),
        crate::ast::ReturnType::SetOf(t) => t.clone(),
        crate::ast::ReturnType::Table(_) => "record".to_string(),
    }
}

/// Folds a PG DDL type name onto the column registry's smaller pg_type
/// vocabulary (spec.md §3: `integer|text|numeric|boolean|uuid|timestamptz|jsonb|bytea`).
fn registry_pg_type(pg_type: &str) -> String {
    match pg_type.to_ascii_lowercase().as_str() {
        "uuid" => "uuid",
        "boolean" | "bool" => "boolean",
        "bytea" => "bytea",
        "jsonb" | "json" => "jsonb",
        "timestamptz" | "timestamp" | "timestamp with time zone" | "timestamp without time zone" | "date" | "time" | "interval" => "timestamptz",
        "integer" | "int" | "int4" | "bigint" | "int8" | "smallint" | "int2" | "serial" | "bigserial" | "smallserial" => "integer",
        "real" | "double precision" | "float4" | "float8" | "numeric" | "decimal" => "numeric",
        _ => "text",
    }
    .to_string()
}

fn parse_policy_expr(value: Option<&JsonValue>) -> AppResult<Option<crate::ast::Expr>> {
    let Some(text) = value.and_then(|v| v.as_str()) else { return Ok(None) };
    if text.is_empty() {
        return Ok(None);
    }
    let expr = crate::parser::parse_expr_standalone(text).map_err(|e| AppError::parse_error(format!("stored policy expression failed to parse: {e}")))?;
    Ok(Some(expr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::JwtClaimsProvider;
    use crate::mail::CatchMailSink;
    use crate::storage::LocalFsBlobStore;

    async fn test_state() -> Arc<AppState> {
        let dir = std::env::temp_dir().join(format!("sblite-state-test-{}", uuid::Uuid::new_v4()));
        let config = Config {
            jwt_secret: "s".to_string(),
            anon_key: "anon".to_string(),
            service_key: "service_role".to_string(),
            db_path: dir.join("db.sqlite3"),
            mail_mode: crate::config::MailMode::Catch,
            smtp: None,
            storage_backend: crate::config::StorageBackend::Local,
            storage_root: dir.join("storage"),
            listen_addr: "127.0.0.1:0".to_string(),
            wire_addr: "127.0.0.1:0".to_string(),
        };
        std::fs::create_dir_all(&dir).unwrap();
        AppState::bootstrap(
            config,
            Box::new(JwtClaimsProvider::new("s")),
            Box::new(LocalFsBlobStore::new(dir.join("storage"))),
            Box::new(CatchMailSink::new(16)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn create_table_populates_column_registry() {
        let state = test_state().await;
        let (mut stmts, warnings) = crate::parser::parse("CREATE TABLE notes (id integer primary key, title text not null)").unwrap();
        assert!(warnings.is_empty());
        let crate::ast::Stmt::CreateTable(ct) = stmts.remove(0) else { panic!("expected create table") };
        let translated = crate::translate::translate_with_fallback(crate::ast::Stmt::CreateTable(ct.clone()));
        let sql = crate::ast::gen::generate(&translated.stmt, crate::ast::Dialect::Sqlite);
        state.create_table(sql, &ct, &translated.stripped_uuid_defaults).await.unwrap();

        let columns = state.columns.read().await;
        let cols = columns.columns("notes").unwrap();
        assert!(cols.get("id").unwrap().is_primary);
        assert!(!cols.get("title").unwrap().nullable);
    }

    #[tokio::test]
    async fn add_policy_persists_and_reloads() {
        let state = test_state().await;
        state
            .add_policy(
                "notes",
                Policy { name: "own_rows".to_string(), command: Command::Select, roles: vec![], using: None, check: None },
            )
            .await
            .unwrap();
        assert!(state.rls.read().await.is_enabled("notes"));

        let rows = state.db.query_rows("SELECT * FROM _rls_policies".to_string(), vec![]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
