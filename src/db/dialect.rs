//! SQL dialect differences.
//!
//! The only differences handled here are the ones needed to issue the same
//! statement on every supported driver: parameter placeholders and identifier
//! quoting. Statements are written with `?` placeholders and rewritten for
//! PostgreSQL, which numbers them (`$1`, `$2`, ...).

use crate::db::DatabaseType;

/// Quote an identifier for the given database.
///
/// Table names such as `user` are reserved words on some servers, so every
/// generated identifier is quoted.
pub fn quote_ident(db_type: DatabaseType, ident: &str) -> String {
    match db_type {
        DatabaseType::MySQL => format!("`{}`", ident.replace('`', "``")),
        DatabaseType::PostgreSQL | DatabaseType::SQLite => {
            format!("\"{}\"", ident.replace('"', "\"\""))
        }
    }
}

/// Rewrite `?` placeholders for the given database.
///
/// Question marks inside single-quoted literals, double-quoted identifiers and
/// backtick-quoted identifiers are left alone.
pub fn substitute_placeholders(db_type: DatabaseType, sql: &str) -> String {
    if db_type != DatabaseType::PostgreSQL {
        return sql.to_string();
    }

    let mut out = String::with_capacity(sql.len() + 8);
    let mut quote: Option<char> = None;
    let mut n = 0;
    for ch in sql.chars() {
        match (quote, ch) {
            (None, '\'' | '"' | '`') => {
                quote = Some(ch);
                out.push(ch);
            }
            (Some(q), c) if c == q => {
                quote = None;
                out.push(ch);
            }
            (None, '?') => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Count `?` placeholders outside of quoted sections.
pub fn count_placeholders(sql: &str) -> usize {
    let mut quote: Option<char> = None;
    let mut count = 0;
    for ch in sql.chars() {
        match (quote, ch) {
            (None, '\'' | '"' | '`') => quote = Some(ch),
            (Some(q), c) if c == q => quote = None,
            (None, '?') => count += 1,
            _ => {}
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident(DatabaseType::PostgreSQL, "user"), "\"user\"");
        assert_eq!(quote_ident(DatabaseType::SQLite, "a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_ident(DatabaseType::MySQL, "user"), "`user`");
    }

    #[test]
    fn test_substitute_postgres() {
        let sql = "SELECT * FROM t WHERE a = ? AND b = ?";
        assert_eq!(
            substitute_placeholders(DatabaseType::PostgreSQL, sql),
            "SELECT * FROM t WHERE a = $1 AND b = $2"
        );
    }

    #[test]
    fn test_substitute_skips_literals() {
        let sql = "SELECT * FROM t WHERE note = 'why?' AND a = ?";
        assert_eq!(
            substitute_placeholders(DatabaseType::PostgreSQL, sql),
            "SELECT * FROM t WHERE note = 'why?' AND a = $1"
        );
        assert_eq!(count_placeholders(sql), 1);
    }

    #[test]
    fn test_substitute_is_identity_elsewhere() {
        let sql = "DELETE FROM t WHERE id = ?";
        assert_eq!(substitute_placeholders(DatabaseType::SQLite, sql), sql);
        assert_eq!(substitute_placeholders(DatabaseType::MySQL, sql), sql);
    }
}
