//! C8: the PostgreSQL wire-protocol front-end. Accepts raw TCP
//! connections speaking the frontend/backend protocol, answers catalog
//! introspection queries with stubbed data, and otherwise routes
//! statements through the C2/C3/C9 pipeline (spec.md §4.7).
//!
//! Simple Query ('Q') is fully supported. Extended Query (Parse/Bind/
//! Execute/Sync) is handled by substituting bound parameters as SQL
//! literals into the prepared text rather than keeping a real
//! server-side prepared statement — enough for drivers that default to
//! extended mode but send one statement per round trip, not true
//! cursor/portal reuse.

use std::collections::HashMap;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::ast::{Dialect, Stmt};
use crate::error::AppError;
use crate::state::AppState;
use crate::translate::translate_with_fallback;

const SSL_REQUEST: i32 = 80877103;
const GSSENC_REQUEST: i32 = 80877104;

pub async fn serve(state: Arc<AppState>) -> std::io::Result<()> {
    let listener = TcpListener::bind(&state.config.wire_addr).await?;
    tracing::info!(addr = %state.config.wire_addr, "wire protocol listening");
    loop {
        let (socket, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, state).await {
                tracing::warn!(%peer, error = %e, "wire connection ended with an error");
            }
        });
    }
}

async fn handle_connection(mut socket: TcpStream, state: Arc<AppState>) -> std::io::Result<()> {
    if !perform_startup(&mut socket).await? {
        return Ok(());
    }

    write_message(&mut socket, b'R', &0i32.to_be_bytes()).await?;
    write_parameter_status(&mut socket, "server_version", "15.0 (sblite)").await?;
    write_parameter_status(&mut socket, "server_encoding", "UTF8").await?;
    write_parameter_status(&mut socket, "client_encoding", "UTF8").await?;
    write_parameter_status(&mut socket, "DateStyle", "ISO, MDY").await?;
    write_parameter_status(&mut socket, "TimeZone", "UTC").await?;
    write_message(&mut socket, b'K', &[0, 0, 0, 1, 0, 0, 0, 1]).await?;
    write_ready_for_query(&mut socket).await?;

    let mut prepared: HashMap<String, String> = HashMap::new();
    let mut portals: HashMap<String, String> = HashMap::new();

    loop {
        let Some((msg_type, payload)) = read_message(&mut socket).await? else { break };
        match msg_type {
            b'Q' => {
                let text = cstr(&payload);
                handle_simple_query(&mut socket, &state, text).await?;
                write_ready_for_query(&mut socket).await?;
            }
            b'P' => {
                let (name, rest) = split_cstr(&payload);
                let (query, _rest) = split_cstr(rest);
                prepared.insert(name.to_string(), query.to_string());
                write_message(&mut socket, b'1', &[]).await?;
            }
            b'B' => {
                let (portal, rest) = split_cstr(&payload);
                let (stmt_name, rest) = split_cstr(rest);
                let params = parse_bind_params(rest);
                let query = prepared.get(stmt_name).cloned().unwrap_or_default();
                let substituted = substitute_params(&query, &params);
                portals.insert(portal.to_string(), substituted);
                write_message(&mut socket, b'2', &[]).await?;
            }
            b'D' => {
                write_message(&mut socket, b'n', &[]).await?;
            }
            b'E' => {
                let (portal, _rest) = split_cstr(&payload);
                let query = portals.get(portal).cloned().unwrap_or_default();
                handle_simple_query(&mut socket, &state, &query).await?;
            }
            b'S' => {
                write_ready_for_query(&mut socket).await?;
            }
            b'C' | b'H' => {}
            b'X' => break,
            _ => {}
        }
    }
    Ok(())
}

/// Reads the startup packet, answers SSL/GSSENC negotiation with a
/// plain refusal, and drains the real `StartupMessage`'s key/value
/// pairs (database name, user) without acting on them — auth is
/// trust-mode, the posture recorded as an Open Question resolution in
/// DESIGN.md.
async fn perform_startup(socket: &mut TcpStream) -> std::io::Result<bool> {
    loop {
        let len = match socket.read_i32().await {
            Ok(l) => l,
            Err(_) => return Ok(false),
        };
        let mut buf = vec![0u8; (len - 4) as usize];
        socket.read_exact(&mut buf).await?;
        let version = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if version == SSL_REQUEST || version == GSSENC_REQUEST {
            socket.write_all(b"N").await?;
            continue;
        }
        // Real StartupMessage: version + null-terminated key/value pairs, ignored.
        return Ok(true);
    }
}

async fn handle_simple_query(socket: &mut TcpStream, state: &AppState, text: &str) -> std::io::Result<()> {
    for stmt_text in split_statements(text) {
        let stmt_text = stmt_text.trim();
        if stmt_text.is_empty() {
            continue;
        }
        match run_statement(state, stmt_text).await {
            Ok(QueryOutcome::Rows { columns, col_types, rows }) => {
                write_row_description(socket, &columns, &col_types).await?;
                for row in &rows {
                    write_data_row(socket, &columns, row).await?;
                }
                write_command_complete(socket, &format!("SELECT {}", rows.len())).await?;
            }
            Ok(QueryOutcome::Affected { tag, count }) => {
                write_command_complete(socket, &format!("{tag} {count}")).await?;
            }
            Err(e) => {
                write_error_response(socket, &e).await?;
            }
        }
    }
    Ok(())
}

enum QueryOutcome {
    Rows { columns: Vec<String>, col_types: Vec<Option<String>>, rows: Vec<JsonValue> },
    Affected { tag: String, count: usize },
}

/// Resolves the single source table of a `SELECT` (if it names one,
/// un-aliased or aliased, with no joins) so its columns' `pg_type`s can
/// be looked up in the column registry for OID synthesis (spec.md §4.7).
fn single_source_table(select: &crate::ast::Select) -> Option<String> {
    match select.from.as_slice() {
        [crate::ast::From { table: crate::ast::TableRef::Named { name, .. }, joins }] if joins.is_empty() => Some(name.0.last()?.value.clone()),
        _ => None,
    }
}

async fn run_statement(state: &AppState, text: &str) -> Result<QueryOutcome, AppError> {
    if let Some(result) = intercept_catalog_query(state, text).await {
        return result;
    }

    let (mut stmts, warnings) = crate::parser::parse(text).map_err(AppError::parse_error)?;
    if stmts.is_empty() {
        return Ok(QueryOutcome::Rows { columns: vec![], col_types: vec![], rows: vec![] });
    }
    if !warnings.is_empty() && stmts.len() == 1 {
        return Err(AppError::parse_error(format!("unparsable SQL near: {}", warnings[0].tail)));
    }
    let mut stmt = stmts.remove(0);

    if let Stmt::Insert(insert) = &mut stmt {
        state.inject_uuid_defaults(insert).await;
    }

    let is_select = matches!(stmt, Stmt::Select(_));
    let is_create_table = matches!(stmt, Stmt::CreateTable(_));
    let create_table_node = if let Stmt::CreateTable(ct) = &stmt { Some(ct.clone()) } else { None };
    let select_table = if let Stmt::Select(s) = &stmt { single_source_table(s) } else { None };

    let translated = translate_with_fallback(stmt);
    if !translated.translated {
        return Err(AppError::unsupported(translated.blocker_reason.unwrap_or_default()));
    }
    let sql = crate::ast::gen::generate(&translated.stmt, Dialect::Sqlite);

    if is_create_table {
        let ct = create_table_node.expect("create table node captured above");
        state.create_table(sql, &ct, &translated.stripped_uuid_defaults).await?;
        return Ok(QueryOutcome::Affected { tag: "CREATE".to_string(), count: 0 });
    }

    if is_select {
        let rows = state.db.query_rows(sql, vec![]).await?;
        let columns = columns_of(&rows);
        let col_types = resolve_column_types(state, select_table.as_deref(), &columns).await;
        return Ok(QueryOutcome::Rows { columns, col_types, rows });
    }

    let tag = match &translated.stmt {
        Stmt::Insert(_) => "INSERT",
        Stmt::Update(_) => "UPDATE",
        Stmt::Delete(_) => "DELETE",
        _ => "OK",
    };
    let affected = state.db.execute(sql, vec![]).await?;
    Ok(QueryOutcome::Affected { tag: tag.to_string(), count: affected })
}

/// Looks up each column's `pg_type` in the column registry (spec.md §3)
/// for the resolved source table; `None` for computed/unregistered
/// columns, which fall back to the text OID.
async fn resolve_column_types(state: &AppState, table: Option<&str>, columns: &[String]) -> Vec<Option<String>> {
    let Some(table) = table else { return vec![None; columns.len()] };
    let registry = state.columns.read().await;
    let Some(table_columns) = registry.columns(table) else { return vec![None; columns.len()] };
    columns.iter().map(|c| table_columns.get(c).map(|info| info.pg_type.clone())).collect()
}

fn columns_of(rows: &[JsonValue]) -> Vec<String> {
    rows.first().and_then(|r| r.as_object()).map(|o| o.keys().cloned().collect()).unwrap_or_default()
}

static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*select\s+version\(\)\s*;?\s*$").unwrap());
static CURRENT_DB_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*select\s+current_database\(\)\s*;?\s*$").unwrap());
static SHOW_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*show\s+(\w+)\s*;?\s*$").unwrap());
static PG_CATALOG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bpg_catalog\.|pg_namespace|pg_class|pg_attribute|pg_type\b").unwrap());
static INFO_SCHEMA_TABLES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)information_schema\.tables").unwrap());

/// Stubs the catalog-introspection queries every PG client library
/// issues on connect (spec.md §4.7): version/current_database/SHOW,
/// `pg_catalog`/`pg_*` (answered empty), `information_schema.tables`
/// (mapped onto `sqlite_master`).
async fn intercept_catalog_query(state: &AppState, text: &str) -> Option<Result<QueryOutcome, AppError>> {
    if VERSION_RE.is_match(text) {
        let row = serde_json::json!({"version": "PostgreSQL 15.0 (sblite)"});
        return Some(Ok(QueryOutcome::Rows { columns: vec!["version".to_string()], col_types: vec![None], rows: vec![row] }));
    }
    if CURRENT_DB_RE.is_match(text) {
        let name = state.config.db_path.file_stem().and_then(|s| s.to_str()).unwrap_or("sblite").to_string();
        let row = serde_json::json!({"current_database": name});
        return Some(Ok(QueryOutcome::Rows { columns: vec!["current_database".to_string()], col_types: vec![None], rows: vec![row] }));
    }
    if let Some(caps) = SHOW_RE.captures(text) {
        let setting = caps[1].to_string();
        let row = serde_json::json!({ setting.clone(): "" });
        return Some(Ok(QueryOutcome::Rows { columns: vec![setting], col_types: vec![None], rows: vec![row] }));
    }
    if INFO_SCHEMA_TABLES_RE.is_match(text) {
        let rows = state.db.query_rows("SELECT name AS table_name FROM sqlite_master WHERE type = 'table'".to_string(), vec![]).await;
        return Some(rows.map(|rows| QueryOutcome::Rows { columns: vec!["table_name".to_string()], col_types: vec![None], rows }));
    }
    if PG_CATALOG_RE.is_match(text) {
        return Some(Ok(QueryOutcome::Rows { columns: vec![], col_types: vec![], rows: vec![] }));
    }
    None
}

fn split_statements(text: &str) -> Vec<String> {
    text.split(';').map(str::to_string).collect()
}

fn oid_for_pg_type(pg_type: Option<&str>) -> i32 {
    match pg_type {
        Some("integer") => 23,
        Some("boolean") => 16,
        Some("numeric") => 1700,
        Some("uuid") => 2950,
        Some("timestamptz") => 1184,
        Some("jsonb") => 3802,
        Some("bytea") => 17,
        _ => 25,
    }
}

// --- protocol framing -------------------------------------------------

async fn write_message(socket: &mut TcpStream, tag: u8, body: &[u8]) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(5 + body.len());
    buf.push(tag);
    buf.write_i32::<BigEndian>((body.len() + 4) as i32)?;
    buf.extend_from_slice(body);
    socket.write_all(&buf).await
}

async fn write_parameter_status(socket: &mut TcpStream, key: &str, value: &str) -> std::io::Result<()> {
    let mut body = Vec::new();
    body.extend_from_slice(key.as_bytes());
    body.push(0);
    body.extend_from_slice(value.as_bytes());
    body.push(0);
    write_message(socket, b'S', &body).await
}

async fn write_ready_for_query(socket: &mut TcpStream) -> std::io::Result<()> {
    write_message(socket, b'Z', b"I").await
}

async fn write_command_complete(socket: &mut TcpStream, tag: &str) -> std::io::Result<()> {
    let mut body = tag.as_bytes().to_vec();
    body.push(0);
    write_message(socket, b'C', &body).await
}

async fn write_row_description(socket: &mut TcpStream, columns: &[String], col_types: &[Option<String>]) -> std::io::Result<()> {
    let mut body = Vec::new();
    body.write_i16::<BigEndian>(columns.len() as i16)?;
    for (i, name) in columns.iter().enumerate() {
        let pg_type = col_types.get(i).and_then(|t| t.as_deref());
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body.write_i32::<BigEndian>(0)?; // table OID
        body.write_i16::<BigEndian>(0)?; // column attnum
        body.write_i32::<BigEndian>(oid_for_pg_type(pg_type))?;
        body.write_i16::<BigEndian>(-1)?; // typlen
        body.write_i32::<BigEndian>(-1)?; // typmod
        body.write_i16::<BigEndian>(0)?; // format: text
    }
    write_message(socket, b'T', &body).await
}

async fn write_data_row(socket: &mut TcpStream, columns: &[String], row: &JsonValue) -> std::io::Result<()> {
    let mut body = Vec::new();
    body.write_i16::<BigEndian>(columns.len() as i16)?;
    for col in columns {
        match row.get(col) {
            None | Some(JsonValue::Null) => {
                body.write_i32::<BigEndian>(-1)?;
            }
            Some(value) => {
                let text = json_to_text(value);
                body.write_i32::<BigEndian>(text.len() as i32)?;
                body.extend_from_slice(text.as_bytes());
            }
        }
    }
    write_message(socket, b'D', &body).await
}

fn json_to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => if *b { "t".to_string() } else { "f".to_string() },
        other => other.to_string(),
    }
}

async fn write_error_response(socket: &mut TcpStream, err: &AppError) -> std::io::Result<()> {
    let mut body = Vec::new();
    body.push(b'S');
    body.extend_from_slice(b"ERROR\0");
    body.push(b'C');
    body.extend_from_slice(err.code().as_bytes());
    body.push(0);
    body.push(b'M');
    body.extend_from_slice(err.message.as_bytes());
    body.push(0);
    body.push(0);
    write_message(socket, b'E', &body).await
}

async fn read_message(socket: &mut TcpStream) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut tag_buf = [0u8; 1];
    if socket.read_exact(&mut tag_buf).await.is_err() {
        return Ok(None);
    }
    let len = socket.read_i32().await?;
    let mut payload = vec![0u8; (len - 4).max(0) as usize];
    socket.read_exact(&mut payload).await?;
    Ok(Some((tag_buf[0], payload)))
}

fn cstr(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

fn split_cstr(buf: &[u8]) -> (&str, &[u8]) {
    match buf.iter().position(|&b| b == 0) {
        Some(idx) => (std::str::from_utf8(&buf[..idx]).unwrap_or(""), &buf[idx + 1..]),
        None => (std::str::from_utf8(buf).unwrap_or(""), &[]),
    }
}

/// Reads a Bind message's parameter section (after portal/statement
/// names): format-code array, parameter count + values, result-format
/// array. Only the parameter values are kept.
fn parse_bind_params(buf: &[u8]) -> Vec<Option<Vec<u8>>> {
    let mut cursor = buf;
    let Some(num_formats) = read_i16(&mut cursor) else { return vec![] };
    for _ in 0..num_formats.max(0) {
        read_i16(&mut cursor);
    }
    let Some(num_params) = read_i16(&mut cursor) else { return vec![] };
    let mut params = Vec::with_capacity(num_params.max(0) as usize);
    for _ in 0..num_params.max(0) {
        let Some(len) = read_i32(&mut cursor) else { break };
        if len < 0 {
            params.push(None);
            continue;
        }
        let len = len as usize;
        if cursor.len() < len {
            break;
        }
        params.push(Some(cursor[..len].to_vec()));
        cursor = &cursor[len..];
    }
    params
}

fn read_i16(cursor: &mut &[u8]) -> Option<i16> {
    if cursor.len() < 2 {
        return None;
    }
    let v = i16::from_be_bytes([cursor[0], cursor[1]]);
    *cursor = &cursor[2..];
    Some(v)
}

fn read_i32(cursor: &mut &[u8]) -> Option<i32> {
    if cursor.len() < 4 {
        return None;
    }
    let v = i32::from_be_bytes([cursor[0], cursor[1], cursor[2], cursor[3]]);
    *cursor = &cursor[4..];
    Some(v)
}

/// Substitutes `$1`, `$2`, … with SQL-literal-quoted text built from the
/// Bind message's parameter bytes (always treated as UTF-8 text, since
/// the client is told only text format is supported).
fn substitute_params(query: &str, params: &[Option<Vec<u8>>]) -> String {
    let mut out = query.to_string();
    for (i, param) in params.iter().enumerate() {
        let placeholder = format!("${}", i + 1);
        let literal = match param {
            None => "NULL".to_string(),
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
        };
        out = out.replace(&placeholder, &literal);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_positional_placeholders() {
        let out = substitute_params("SELECT * FROM t WHERE id = $1 AND name = $2", &[Some(b"5".to_vec()), Some(b"o'brien".to_vec())]);
        assert_eq!(out, "SELECT * FROM t WHERE id = '5' AND name = 'o''brien'");
    }

    #[test]
    fn version_query_is_intercepted() {
        assert!(VERSION_RE.is_match("select version()"));
        assert!(VERSION_RE.is_match("  SELECT version();"));
    }

    #[test]
    fn show_query_captures_setting_name() {
        let caps = SHOW_RE.captures("SHOW transaction_isolation;").unwrap();
        assert_eq!(&caps[1], "transaction_isolation");
    }

    #[test]
    fn oid_for_pg_type_maps_registry_types() {
        assert_eq!(oid_for_pg_type(Some("uuid")), 2950);
        assert_eq!(oid_for_pg_type(Some("integer")), 23);
        assert_eq!(oid_for_pg_type(None), 25);
        assert_eq!(oid_for_pg_type(Some("text")), 25);
    }

    #[test]
    fn single_source_table_resolves_unjoined_select() {
        let (stmts, _) = crate::parser::parse("SELECT id FROM users").unwrap();
        let Stmt::Select(select) = &stmts[0] else { panic!("expected select") };
        assert_eq!(single_source_table(select), Some("users".to_string()));
    }

    #[test]
    fn single_source_table_none_for_joins() {
        let (stmts, _) = crate::parser::parse("SELECT id FROM users JOIN orders ON orders.user_id = users.id").unwrap();
        let Stmt::Select(select) = &stmts[0] else { panic!("expected select") };
        assert_eq!(single_source_table(select), None);
    }
}
