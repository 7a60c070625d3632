//! PG → SQLite column type/affinity mapping for DDL (spec.md §4.2).

/// Maps a PostgreSQL DDL type name (case-insensitive, modifiers like
/// `(10,2)` already stripped) onto the SQLite storage class/affinity it
/// should use in `CREATE TABLE`. `registry_numeric` keeps `numeric`
/// spelled out for OID-synthesis purposes in the wire front-end.
pub fn ddl_type_for(pg_type: &str, registry_numeric: bool) -> String {
    let lower = pg_type.to_ascii_lowercase();
    match lower.as_str() {
        "uuid" | "text" | "varchar" | "character varying" | "citext" | "jsonb" | "json"
        | "timestamptz" | "timestamp" | "timestamp with time zone" | "timestamp without time zone"
        | "date" | "bytea" | "time" | "interval" => "TEXT".to_string(),
        "boolean" | "bool" => "INTEGER".to_string(),
        "serial" | "bigserial" | "smallserial" => "INTEGER".to_string(),
        "integer" | "int" | "int4" | "bigint" | "int8" | "smallint" | "int2" => "INTEGER".to_string(),
        "real" | "double precision" | "float4" | "float8" => "REAL".to_string(),
        "numeric" | "decimal" if registry_numeric => "numeric".to_string(),
        "numeric" | "decimal" => "REAL".to_string(),
        other => other.to_uppercase(),
    }
}

/// True when `expr::T`/`CAST(expr AS T)` targeting `pg_type` should drop
/// the cast entirely under the SQLite dialect (spec.md §4.2 cast list).
pub fn cast_is_droppable(pg_type: &str) -> bool {
    matches!(
        pg_type.to_ascii_lowercase().as_str(),
        "uuid"
            | "text"
            | "varchar"
            | "character varying"
            | "timestamptz"
            | "timestamp"
            | "timestamp with time zone"
            | "timestamp without time zone"
            | "date"
            | "time"
            | "integer"
            | "int"
            | "bigint"
            | "smallint"
            | "real"
            | "double precision"
            | "numeric"
            | "jsonb"
            | "json"
            | "bytea"
            | "boolean"
    )
}

/// `field` from `EXTRACT(field FROM expr)` to the `strftime` format
/// string that reproduces it.
pub fn extract_field_to_strftime(field: &str) -> Option<&'static str> {
    match field.to_ascii_lowercase().as_str() {
        "year" => Some("%Y"),
        "month" => Some("%m"),
        "day" => Some("%d"),
        "hour" => Some("%H"),
        "minute" => Some("%M"),
        "second" => Some("%S"),
        "dow" => Some("%w"),
        "doy" => Some("%j"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_common_ddl_types() {
        assert_eq!(ddl_type_for("uuid", false), "TEXT");
        assert_eq!(ddl_type_for("BOOLEAN", false), "INTEGER");
        assert_eq!(ddl_type_for("bigserial", false), "INTEGER");
        assert_eq!(ddl_type_for("double precision", false), "REAL");
        assert_eq!(ddl_type_for("numeric", true), "numeric");
        assert_eq!(ddl_type_for("numeric", false), "REAL");
    }

    #[test]
    fn extract_field_map_matches_spec() {
        assert_eq!(extract_field_to_strftime("year"), Some("%Y"));
        assert_eq!(extract_field_to_strftime("dow"), Some("%w"));
        assert_eq!(extract_field_to_strftime("bogus"), None);
    }
}
