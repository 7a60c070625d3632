//! A2: the REST/RPC/Admin HTTP surface (spec.md §6). Out of scope for
//! the core per spec.md §1 (the router is a fixed interface the core is
//! driven through) but a concrete `poem` wiring is needed for the thing
//! to run end to end, the same way the teacher ships its own router
//! rather than leaving it as a trait.

use std::sync::Arc;

use poem::http::StatusCode;
use poem::web::{Data, Json, Path};
use poem::{EndpointExt, Request, Response, Route, Server};
use poem::listener::TcpListener;
use serde_json::Value as JsonValue;

use crate::ast::{Dialect, Stmt};
use crate::error::{AppError, ErrorEnvelope, ErrorKind};
use crate::postgrest::response::Envelope;
use crate::postgrest::{self, Preferences, QueryParams};
use crate::rls::AuthContext;
use crate::state::AppState;
use crate::translate::translate_with_fallback;

impl poem::error::ResponseError for AppError {
    fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::ParseError | ErrorKind::ConstraintViolation => StatusCode::BAD_REQUEST,
            ErrorKind::UnsupportedFeature | ErrorKind::TranslationFailed => StatusCode::NOT_IMPLEMENTED,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorKind::SingleRowViolation => StatusCode::NOT_ACCEPTABLE,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn as_response(&self) -> Response {
        let envelope = ErrorEnvelope::from(self);
        Response::builder().status(self.status()).content_type("application/json").body(serde_json::to_string(&envelope).unwrap_or_default())
    }
}

fn header(req: &Request, name: &str) -> Option<String> {
    req.headers().get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn bearer_token(req: &Request) -> Option<String> {
    header(req, "authorization").and_then(|h| h.strip_prefix("Bearer ").map(str::to_string))
}

fn auth_context(req: &Request, state: &AppState) -> Result<AuthContext, AppError> {
    let apikey = header(req, "apikey");
    let bearer = bearer_token(req);
    state.auth_context(apikey.as_deref(), bearer.as_deref())
}

/// Folds the HTTP `Range: items=a-b` header (spec.md §4.3's alternative
/// to the `range=` query parameter) into `query` as a synthetic `range`
/// entry, unless the request already specifies `range`/`limit`/`offset`
/// explicitly via the query string.
fn apply_range_header(req: &Request, query: &mut QueryParams) {
    if query.params.contains_key("range") || query.params.contains_key("limit") || query.params.contains_key("offset") {
        return;
    }
    if let Some(range) = header(req, "range") {
        let spec = range.split_once('=').map(|(_, v)| v).unwrap_or(&range).to_string();
        query.params.insert("range".to_string(), vec![spec]);
    }
}

fn preferences(req: &Request) -> Preferences {
    let mut prefs = Preferences::default();
    if let Some(prefer) = header(req, "prefer") {
        for directive in prefer.split(',').map(str::trim) {
            match directive {
                "count=exact" => prefs.count_exact = true,
                "return=representation" => prefs.return_representation = true,
                "resolution=merge-duplicates" => prefs.resolution_merge_duplicates = true,
                _ => {}
            }
        }
    }
    prefs.envelope = match header(req, "accept").as_deref() {
        Some("application/vnd.pgrst.object+json") => Some(Envelope::Single),
        Some(a) if a.contains("maybeSingle") => Some(Envelope::MaybeSingle),
        _ => None,
    };
    prefs
}

async fn execute_select(state: &AppState, select: crate::ast::Select, params: &[String]) -> Result<Vec<JsonValue>, AppError> {
    let translated = translate_with_fallback(Stmt::Select(select));
    if !translated.translated {
        return Err(AppError::unsupported(translated.blocker_reason.unwrap_or_default()));
    }
    let sql = crate::ast::gen::generate(&translated.stmt, Dialect::Sqlite);
    let bound: Vec<JsonValue> = params.iter().map(|v| JsonValue::String(v.clone())).collect();
    state.db.query_rows(sql, bound).await
}

/// Snapshots the FTS indexes covering `table` into a synchronous lookup
/// closure, since `compile_read`/`compile_update`/`compile_delete` are
/// plain (non-async) functions but the index registry lives behind an
/// async `RwLock` (spec.md §4.5).
async fn fts_lookup_for_table(state: &AppState, table: &str) -> impl Fn(&str) -> Option<crate::fts::FtsIndex> {
    let indexes: Vec<crate::fts::FtsIndex> = state.fts.read().await.values().filter(|idx| idx.table == table).cloned().collect();
    move |col: &str| indexes.iter().find(|idx| idx.columns.iter().any(|c| c == col)).cloned()
}

/// `GET /rest/v1/<table>` — compiles the PostgREST query string into a
/// `SELECT`, applies RLS, executes, and shapes the envelope + headers.
#[poem::handler]
pub async fn rest_select(req: &Request, Path(table): Path<String>, Data(state): Data<&Arc<AppState>>) -> Result<Response, AppError> {
    let auth = auth_context(req, state)?;
    let prefs = preferences(req);
    let mut query = QueryParams::parse(req.uri().query().unwrap_or(""));
    apply_range_header(req, &mut query);
    let fts_lookup = fts_lookup_for_table(state, &table).await;
    let rls = state.rls.read().await;
    let compiled = postgrest::compile_read(&table, &query, &prefs, &rls, &auth, &fts_lookup)?;
    drop(rls);

    let rows = execute_select(state, compiled.select, &compiled.params).await?;
    let total = if let Some(count_select) = compiled.count_select {
        let count_rows = execute_select(state, count_select, &compiled.params).await?;
        count_rows.first().and_then(|r| r["count"].as_u64())
    } else {
        None
    };

    let accept_csv = header(req, "accept").as_deref() == Some("text/csv");
    let row_count = rows.len();
    let body = if accept_csv {
        postgrest::response::encode_csv(&rows)
    } else {
        serde_json::to_string(&postgrest::response::shape_rows(rows, compiled.envelope)?).unwrap_or_default()
    };

    let builder = Response::builder()
        .status(StatusCode::OK)
        .content_type(if accept_csv { "text/csv" } else { "application/json" })
        .header("Content-Range", postgrest::response::content_range(compiled.offset as usize, row_count, total));
    Ok(builder.body(body))
}

/// `POST /rest/v1/<table>` — accepts a JSON object or array body.
#[poem::handler]
pub async fn rest_insert(req: &Request, Path(table): Path<String>, Data(state): Data<&Arc<AppState>>, Json(body): Json<JsonValue>) -> Result<Response, AppError> {
    let auth = auth_context(req, state)?;
    let prefs = preferences(req);
    let on_conflict = req.uri().query().and_then(|q| QueryParams::parse(q).params.get("on_conflict").and_then(|v| v.first()).map(|v| v.split(',').map(str::to_string).collect()));

    let rows: Vec<serde_json::Map<String, JsonValue>> = match body {
        JsonValue::Array(items) => items.into_iter().filter_map(|v| v.as_object().cloned()).collect(),
        JsonValue::Object(obj) => vec![obj],
        _ => return Err(AppError::parse_error("insert body must be a JSON object or array")),
    };

    let rls = state.rls.read().await;
    let mut insert = postgrest::compile_insert(&table, &rows, on_conflict, &rls, &auth)?;
    drop(rls);
    state.inject_uuid_defaults(&mut insert).await;

    let translated = translate_with_fallback(Stmt::Insert(insert));
    if !translated.translated {
        return Err(AppError::unsupported(translated.blocker_reason.unwrap_or_default()));
    }
    let sql = crate::ast::gen::generate(&translated.stmt, Dialect::Sqlite);
    let returned = state.db.query_rows(sql, vec![]).await?;

    let body = if prefs.return_representation { serde_json::to_string(&returned).unwrap_or_default() } else { String::new() };
    Ok(Response::builder().status(StatusCode::CREATED).content_type("application/json").body(body))
}

/// `PATCH /rest/v1/<table>?<query>`.
#[poem::handler]
pub async fn rest_update(req: &Request, Path(table): Path<String>, Data(state): Data<&Arc<AppState>>, Json(body): Json<JsonValue>) -> Result<Response, AppError> {
    let auth = auth_context(req, state)?;
    let prefs = preferences(req);
    let query = QueryParams::parse(req.uri().query().unwrap_or(""));
    let Some(obj) = body.as_object().cloned() else {
        return Err(AppError::parse_error("update body must be a JSON object"));
    };

    let fts_lookup = fts_lookup_for_table(state, &table).await;
    let rls = state.rls.read().await;
    let (update, fts_params) = postgrest::compile_update(&table, &query, &obj, &rls, &auth, &fts_lookup)?;
    let check_expr = rls.check_predicate(&table, crate::rls::Command::Update, &auth);
    drop(rls);

    let translated = translate_with_fallback(Stmt::Update(update));
    if !translated.translated {
        return Err(AppError::unsupported(translated.blocker_reason.unwrap_or_default()));
    }
    let sql = crate::ast::gen::generate(&translated.stmt, Dialect::Sqlite);
    let bound: Vec<JsonValue> = fts_params.into_iter().map(JsonValue::String).collect();
    let returned = state.db.execute_update_with_check(sql, bound, check_expr).await?;

    let body = if prefs.return_representation { serde_json::to_string(&returned).unwrap_or_default() } else { String::new() };
    Ok(Response::builder().status(StatusCode::OK).content_type("application/json").body(body))
}

/// `DELETE /rest/v1/<table>?<query>`.
#[poem::handler]
pub async fn rest_delete(req: &Request, Path(table): Path<String>, Data(state): Data<&Arc<AppState>>) -> Result<Response, AppError> {
    let auth = auth_context(req, state)?;
    let prefs = preferences(req);
    let query = QueryParams::parse(req.uri().query().unwrap_or(""));

    let fts_lookup = fts_lookup_for_table(state, &table).await;
    let rls = state.rls.read().await;
    let (delete, fts_params) = postgrest::compile_delete(&table, &query, &rls, &auth, &fts_lookup)?;
    drop(rls);

    let translated = translate_with_fallback(Stmt::Delete(delete));
    if !translated.translated {
        return Err(AppError::unsupported(translated.blocker_reason.unwrap_or_default()));
    }
    let sql = crate::ast::gen::generate(&translated.stmt, Dialect::Sqlite);
    let bound: Vec<JsonValue> = fts_params.into_iter().map(JsonValue::String).collect();
    let returned = state.db.query_rows(sql, bound).await?;

    let body = if prefs.return_representation { serde_json::to_string(&returned).unwrap_or_default() } else { String::new() };
    Ok(Response::builder().status(StatusCode::OK).content_type("application/json").body(body))
}

/// `POST /rest/v1/rpc/<name>` — binds named/positional JSON arguments
/// against the stored function and executes its pre-translated body.
#[poem::handler]
pub async fn rpc_call(req: &Request, Path(name): Path<String>, Data(state): Data<&Arc<AppState>>, Json(body): Json<JsonValue>) -> Result<Response, AppError> {
    let _auth = auth_context(req, state)?;
    let accept_single = header(req, "accept").as_deref() == Some("application/vnd.pgrst.object+json");

    if name == "vector_search" {
        let named = body.as_object().cloned().unwrap_or_default();
        let _args = crate::rpc::parse_vector_search_args(&named)?;
        return Err(AppError::unsupported("vector_search requires a vector index extension not bundled in this build"));
    }

    let rpc = state.rpc.read().await;
    let func = rpc.get(&name).cloned_function()?;
    drop(rpc);

    let (named, positional) = match &body {
        JsonValue::Object(obj) => (obj.clone(), vec![]),
        JsonValue::Array(items) => (serde_json::Map::new(), items.clone()),
        _ => (serde_json::Map::new(), vec![]),
    };
    let bound = func.bind(&named, &positional)?;
    let rows = state.db.query_named(func.body_sql.clone(), bound).await?;
    let shaped = func.shape_result(rows, accept_single)?;
    Ok(Response::builder().status(StatusCode::OK).content_type("application/json").body(serde_json::to_string(&shaped).unwrap_or_default()))
}

trait OptionRpcExt {
    fn cloned_function(self) -> Result<crate::rpc::RpcFunction, AppError>;
}

impl OptionRpcExt for Option<&crate::rpc::RpcFunction> {
    fn cloned_function(self) -> Result<crate::rpc::RpcFunction, AppError> {
        self.cloned().ok_or_else(|| AppError::pgrst("PGRST202", "function not found"))
    }
}

/// `POST /admin/v1/tables/<table>/fts/<name>` — service-role only index
/// creation. Body: `{"columns": [...], "tokenizer": "porter", "pk_column": "id"}`.
#[poem::handler]
pub async fn admin_create_fts(
    req: &Request,
    Path((table, name)): Path<(String, String)>,
    Data(state): Data<&Arc<AppState>>,
    Json(body): Json<JsonValue>,
) -> Result<StatusCode, AppError> {
    require_service_role(req, state)?;
    let columns: Vec<String> = body["columns"].as_array().map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()).unwrap_or_default();
    let tokenizer = crate::fts::Tokenizer::parse(body["tokenizer"].as_str().unwrap_or("unicode61"))?;
    let pk_column = body["pk_column"].as_str().unwrap_or("id").to_string();
    state.create_fts_index(crate::fts::FtsIndex { table, name, columns, tokenizer, pk_column }).await?;
    Ok(StatusCode::CREATED)
}

#[poem::handler]
pub async fn admin_drop_fts(req: &Request, Path((table, name)): Path<(String, String)>, Data(state): Data<&Arc<AppState>>) -> Result<StatusCode, AppError> {
    require_service_role(req, state)?;
    state.drop_fts_index(&table, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[poem::handler]
pub async fn admin_rebuild_fts(req: &Request, Path((table, name)): Path<(String, String)>, Data(state): Data<&Arc<AppState>>) -> Result<StatusCode, AppError> {
    require_service_role(req, state)?;
    let index = state.fts.read().await.get(&(table, name)).cloned().ok_or_else(|| AppError::not_found("no such FTS index"))?;
    state.db.execute(index.rebuild_statement(), vec![]).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn require_service_role(req: &Request, state: &AppState) -> Result<(), AppError> {
    let auth = auth_context(req, state)?;
    if auth.bypass_rls {
        Ok(())
    } else {
        Err(AppError::permission_denied("admin endpoints require the service_role key"))
    }
}

pub fn build_router(state: Arc<AppState>) -> Route {
    Route::new()
        .at(
            "/rest/v1/rpc/:name",
            poem::post(rpc_call),
        )
        .at(
            "/rest/v1/:table",
            poem::get(rest_select).post(rest_insert).patch(rest_update).put(rest_update).delete(rest_delete),
        )
        .nest(
            "/admin/v1/tables",
            Route::new()
                .at("/:table/fts/:name", poem::post(admin_create_fts).delete(admin_drop_fts))
                .at("/:table/fts/:name/rebuild", poem::post(admin_rebuild_fts)),
        )
        .with(poem::middleware::Tracing)
        .data(state)
}

pub async fn serve(state: Arc<AppState>) -> std::io::Result<()> {
    let addr = state.config.listen_addr.clone();
    let router = build_router(state);
    tracing::info!(%addr, "REST surface listening");
    Server::new(TcpListener::bind(addr)).run(router).await
}
