//! Synthesizes a SQLite-native expression that produces a version-4 UUID,
//! standing in for PostgreSQL's `gen_random_uuid()` (spec.md §4.2).

/// SQL text for a random UUIDv4 built from `randomblob`/`hex`/`random`.
/// The `4` nibble fixes the version; the `8`/`9`/`a`/`b` choice fixes the
/// variant, picked from `abs(random()) % 4`.
pub fn v4_uuid_sql() -> String {
    "(lower(hex(randomblob(4)) || '-' || hex(randomblob(2)) || '-4' || \
      substr(hex(randomblob(2)), 2) || '-' || \
      substr('89ab', (abs(random()) % 4) + 1, 1) || substr(hex(randomblob(2)), 2) || '-' || \
      hex(randomblob(6))))"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_well_formed_expression() {
        let sql = v4_uuid_sql();
        assert!(sql.contains("randomblob(4)"));
        assert!(sql.contains("'-4'"));
        assert!(sql.contains("'89ab'"));
    }
}
