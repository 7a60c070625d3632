//! C7: stored SQL function registry — `CREATE FUNCTION` parsing already
//! happens in the parser; this module persists the translated
//! definition, binds call-time arguments, and shapes the result
//! (spec.md §4.6).

use std::collections::HashMap;

use serde_json::Value as JsonValue;

use crate::ast::{CreateFunction, ReturnType};
use crate::error::AppError;
use crate::translate::translate_with_fallback;

#[derive(Debug, Clone)]
pub struct RpcArg {
    pub name: String,
    pub type_name: String,
    pub default: Option<JsonValue>,
    pub position: usize,
}

#[derive(Debug, Clone)]
pub struct RpcFunction {
    pub name: String,
    pub args: Vec<RpcArg>,
    pub returns: ReturnType,
    pub body_sql: String,
}

impl RpcFunction {
    pub fn returns_set(&self) -> bool {
        matches!(self.returns, ReturnType::SetOf(_) | ReturnType::Table(_))
    }

    /// Binds a call's named/positional JSON arguments against the
    /// declared parameter list: named first, then positional, then the
    /// parameter's own `DEFAULT`, else a 400.
    pub fn bind(&self, named: &serde_json::Map<String, JsonValue>, positional: &[JsonValue]) -> Result<HashMap<String, JsonValue>, AppError> {
        let mut bound = HashMap::new();
        for arg in &self.args {
            let value = named
                .get(&arg.name)
                .cloned()
                .or_else(|| positional.get(arg.position).cloned())
                .or_else(|| arg.default.clone());
            match value {
                Some(v) => {
                    bound.insert(arg.name.clone(), v);
                }
                None => {
                    return Err(AppError::pgrst("PGRST100", format!("missing required argument: {}", arg.name)));
                }
            }
        }
        Ok(bound)
    }

    /// Shapes `rows` (each a flat JSON object of column → value) per
    /// spec.md §4.6's result-shaping rules.
    pub fn shape_result(&self, rows: Vec<JsonValue>, accept_single: bool) -> Result<JsonValue, AppError> {
        if self.returns_set() {
            if accept_single && rows.len() != 1 {
                return Err(AppError::single_row_violation(format!("expected exactly one row, got {}", rows.len())));
            }
            return Ok(JsonValue::Array(rows));
        }
        match rows.len() {
            0 => Ok(JsonValue::Null),
            1 => {
                let row = &rows[0];
                let obj = row.as_object().cloned().unwrap_or_default();
                if obj.len() == 1 && !matches!(self.returns, ReturnType::Table(_)) {
                    Ok(obj.into_values().next().unwrap())
                } else {
                    Ok(row.clone())
                }
            }
            n => Err(AppError::internal(format!("scalar RPC returned {n} rows"))),
        }
    }
}

/// Registers a `CREATE [OR REPLACE] FUNCTION` AST node: runs the body
/// through C3, then rewrites `$N` positional placeholders to
/// `:<argN.name>` named parameters for `rusqlite`.
pub fn register(cf: &CreateFunction) -> Result<RpcFunction, AppError> {
    if cf.language != "sql" {
        return Err(AppError::unsupported(format!("unsupported RPC language: {}", cf.language)));
    }

    let (body_stmts, warnings) = crate::parser::parse(&cf.body.text)
        .map_err(|e| AppError::parse_error(format!("RPC body failed to parse: {e}")))?;
    if !warnings.is_empty() {
        return Err(AppError::parse_error(format!("RPC body contains unparsable SQL: {:?}", warnings)));
    }

    let mut translated_parts = Vec::new();
    for stmt in body_stmts {
        let t = translate_with_fallback(stmt);
        if !t.translated {
            return Err(AppError::new(
                crate::error::ErrorKind::TranslationFailed,
                format!("RPC body not translatable: {}", t.blocker_reason.unwrap_or_default()),
            ));
        }
        translated_parts.push(crate::ast::gen::generate(&t.stmt, crate::ast::Dialect::Sqlite));
    }
    let mut body_sql = translated_parts.join("; ");

    let args: Vec<RpcArg> = cf
        .args
        .iter()
        .map(|a| RpcArg {
            name: a.name.clone(),
            type_name: a.type_name.clone(),
            default: a.default.as_ref().map(default_to_json),
            position: a.position,
        })
        .collect();

    for arg in &args {
        let placeholder = format!(":${}", arg.position + 1);
        let named = format!(":{}", arg.name);
        body_sql = body_sql.replace(&placeholder, &named);
    }

    Ok(RpcFunction { name: cf.name.last().value.clone(), args, returns: cf.returns.clone(), body_sql })
}

fn default_to_json(expr: &crate::ast::Expr) -> JsonValue {
    use crate::ast::{Expr, Literal};
    match expr {
        Expr::Literal(Literal::Number(n)) => n.parse::<f64>().map(|f| serde_json::json!(f)).unwrap_or(JsonValue::Null),
        Expr::Literal(Literal::String(s)) => JsonValue::String(s.clone()),
        Expr::Literal(Literal::Bool(b)) => JsonValue::Bool(*b),
        Expr::Literal(Literal::Null) => JsonValue::Null,
        other => JsonValue::String(crate::ast::gen::generate_expr(other, crate::ast::Dialect::Postgres)),
    }
}

/// Arguments for the built-in `vector_search` RPC, dispatched before
/// the persistent lookup table (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct VectorSearchArgs {
    pub table: String,
    pub column: String,
    pub query_embedding: Vec<f32>,
    pub match_count: usize,
    pub filter: Option<String>,
}

pub fn parse_vector_search_args(named: &serde_json::Map<String, JsonValue>) -> Result<VectorSearchArgs, AppError> {
    let table = named.get("table").and_then(|v| v.as_str()).ok_or_else(|| AppError::pgrst("PGRST100", "vector_search requires table"))?;
    let column = named.get("column").and_then(|v| v.as_str()).ok_or_else(|| AppError::pgrst("PGRST100", "vector_search requires column"))?;
    let query_embedding = named
        .get("query_embedding")
        .and_then(|v| v.as_array())
        .ok_or_else(|| AppError::pgrst("PGRST100", "vector_search requires query_embedding"))?
        .iter()
        .filter_map(|v| v.as_f64().map(|f| f as f32))
        .collect();
    let match_count = named.get("match_count").and_then(|v| v.as_u64()).unwrap_or(10) as usize;
    let filter = named.get("filter").and_then(|v| v.as_str()).map(str::to_string);
    Ok(VectorSearchArgs { table: table.to_string(), column: column.to_string(), query_embedding, match_count, filter })
}

#[derive(Debug, Default)]
pub struct RpcRegistry {
    functions: HashMap<String, RpcFunction>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, func: RpcFunction) {
        self.functions.insert(func.name.clone(), func);
    }

    pub fn get(&self, name: &str) -> Option<&RpcFunction> {
        self.functions.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Dialect;

    fn make_function(sql: &str) -> RpcFunction {
        let (mut stmts, warnings) = crate::parser::parse(sql).unwrap();
        assert!(warnings.is_empty());
        let crate::ast::Stmt::CreateFunction(cf) = stmts.remove(0) else { panic!("expected create function") };
        register(&cf).unwrap()
    }

    #[test]
    fn registers_scalar_function_and_rewrites_placeholder() {
        let f = make_function(
            "CREATE FUNCTION add_one(n integer) RETURNS integer LANGUAGE sql AS $$ SELECT $1 + 1 $$",
        );
        assert!(f.body_sql.contains(":n"));
        assert!(!f.body_sql.contains("$1"));
    }

    #[test]
    fn shapes_scalar_result_for_single_row_single_column() {
        let f = make_function("CREATE FUNCTION cnt() RETURNS integer LANGUAGE sql AS $$ SELECT 1 $$");
        let rows = vec![serde_json::json!({"count": 5})];
        let shaped = f.shape_result(rows, false).unwrap();
        assert_eq!(shaped, serde_json::json!(5));
    }

    #[test]
    fn shapes_set_result_as_array() {
        let f = make_function("CREATE FUNCTION many() RETURNS SETOF integer LANGUAGE sql AS $$ SELECT 1 $$");
        assert!(f.returns_set());
        let rows = vec![serde_json::json!({"v": 1}), serde_json::json!({"v": 2})];
        let shaped = f.shape_result(rows, false).unwrap();
        assert!(shaped.as_array().unwrap().len() == 2);
    }

    #[test]
    fn bind_prefers_named_over_positional_over_default() {
        let f = RpcFunction {
            name: "f".to_string(),
            args: vec![RpcArg { name: "a".to_string(), type_name: "integer".to_string(), default: Some(serde_json::json!(9)), position: 0 }],
            returns: ReturnType::Scalar("integer".to_string()),
            body_sql: String::new(),
        };
        let named = serde_json::json!({"a": 1});
        let bound = f.bind(named.as_object().unwrap(), &[]).unwrap();
        assert_eq!(bound["a"], serde_json::json!(1));

        let empty = serde_json::Map::new();
        let bound = f.bind(&empty, &[serde_json::json!(2)]).unwrap();
        assert_eq!(bound["a"], serde_json::json!(2));

        let bound = f.bind(&empty, &[]).unwrap();
        assert_eq!(bound["a"], serde_json::json!(9));
    }

    #[test]
    fn bind_errors_on_missing_required_argument() {
        let f = RpcFunction {
            name: "f".to_string(),
            args: vec![RpcArg { name: "a".to_string(), type_name: "integer".to_string(), default: None, position: 0 }],
            returns: ReturnType::Scalar("integer".to_string()),
            body_sql: String::new(),
        };
        let empty = serde_json::Map::new();
        assert!(f.bind(&empty, &[]).is_err());
    }

    #[allow(dead_code)]
    fn _dialect_reference() -> Dialect {
        Dialect::Sqlite
    }
}
