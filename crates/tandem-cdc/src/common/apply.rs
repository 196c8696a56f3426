//! Parameterized statement building for the apply engine
//!
//! Both connectors execute the same four statement shapes; only identifier
//! quoting and placeholder syntax differ. All identifiers go through the
//! dialect's quoting, all values travel as positional parameters, and the
//! generated text is cached per (table, operation, column set) so steady
//! state never rebuilds SQL.

use std::collections::HashMap;
use std::sync::Mutex;

/// Identifier quoting and placeholder syntax for one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    MySql,
}

impl SqlDialect {
    /// Quote an identifier, doubling any embedded quote character.
    pub fn quote_ident(&self, name: &str) -> String {
        match self {
            SqlDialect::Postgres => format!("\"{}\"", name.replace('"', "\"\"")),
            SqlDialect::MySql => format!("`{}`", name.replace('`', "``")),
        }
    }

    /// Positional parameter placeholder; `index` is 1-based.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${index}"),
            SqlDialect::MySql => "?".to_string(),
        }
    }

    fn qualified(&self, schema: &str, table: &str) -> String {
        format!("{}.{}", self.quote_ident(schema), self.quote_ident(table))
    }
}

/// `INSERT INTO s.t (c1, c2) VALUES (p1, p2)`
pub fn insert_sql(dialect: SqlDialect, schema: &str, table: &str, columns: &[String]) -> String {
    let cols: Vec<String> = columns.iter().map(|c| dialect.quote_ident(c)).collect();
    let params: Vec<String> = (1..=columns.len()).map(|i| dialect.placeholder(i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        dialect.qualified(schema, table),
        cols.join(", "),
        params.join(", ")
    )
}

/// `UPDATE s.t SET c1 = p1, ... WHERE pk1 = pn AND ...`
///
/// Set parameters come first, PK parameters follow, matching the order the
/// connectors bind them in.
pub fn update_sql(
    dialect: SqlDialect,
    schema: &str,
    table: &str,
    set_columns: &[String],
    pk_columns: &[String],
) -> String {
    let mut index = 0usize;
    let set_clause: Vec<String> = set_columns
        .iter()
        .map(|c| {
            index += 1;
            format!("{} = {}", dialect.quote_ident(c), dialect.placeholder(index))
        })
        .collect();
    let where_clause: Vec<String> = pk_columns
        .iter()
        .map(|c| {
            index += 1;
            format!("{} = {}", dialect.quote_ident(c), dialect.placeholder(index))
        })
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {}",
        dialect.qualified(schema, table),
        set_clause.join(", "),
        where_clause.join(" AND ")
    )
}

/// `DELETE FROM s.t WHERE pk1 = p1 AND ...`
pub fn delete_sql(
    dialect: SqlDialect,
    schema: &str,
    table: &str,
    pk_columns: &[String],
) -> String {
    let where_clause: Vec<String> = pk_columns
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "{} = {}",
                dialect.quote_ident(c),
                dialect.placeholder(i + 1)
            )
        })
        .collect();
    format!(
        "DELETE FROM {} WHERE {}",
        dialect.qualified(schema, table),
        where_clause.join(" AND ")
    )
}

/// Statement kind, part of the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
}

/// Cache of generated SQL text keyed by (table, operation, column set).
pub struct StatementCache {
    dialect: SqlDialect,
    entries: Mutex<HashMap<(String, StatementKind, Vec<String>), String>>,
}

impl StatementCache {
    pub fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert_stmt(&self, schema: &str, table: &str, columns: &[String]) -> String {
        self.cached(schema, table, StatementKind::Insert, columns, |d| {
            insert_sql(d, schema, table, columns)
        })
    }

    pub fn update_stmt(
        &self,
        schema: &str,
        table: &str,
        set_columns: &[String],
        pk_columns: &[String],
    ) -> String {
        let mut key_cols = set_columns.to_vec();
        key_cols.extend(pk_columns.iter().cloned());
        self.cached(schema, table, StatementKind::Update, &key_cols, |d| {
            update_sql(d, schema, table, set_columns, pk_columns)
        })
    }

    pub fn delete_stmt(&self, schema: &str, table: &str, pk_columns: &[String]) -> String {
        self.cached(schema, table, StatementKind::Delete, pk_columns, |d| {
            delete_sql(d, schema, table, pk_columns)
        })
    }

    /// Drop cached statements for one table, e.g. after schema drift.
    pub fn invalidate_table(&self, schema: &str, table: &str) {
        let qualified = format!("{schema}.{table}");
        self.entries
            .lock()
            .expect("statement cache poisoned")
            .retain(|(t, _, _), _| t != &qualified);
    }

    fn cached(
        &self,
        schema: &str,
        table: &str,
        kind: StatementKind,
        columns: &[String],
        build: impl FnOnce(SqlDialect) -> String,
    ) -> String {
        let key = (format!("{schema}.{table}"), kind, columns.to_vec());
        let mut entries = self.entries.lock().expect("statement cache poisoned");
        entries.entry(key).or_insert_with(|| build(self.dialect)).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_postgres_insert() {
        let sql = insert_sql(SqlDialect::Postgres, "public", "users", &cols(&["id", "name"]));
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"users\" (\"id\", \"name\") VALUES ($1, $2)"
        );
    }

    #[test]
    fn test_mysql_insert() {
        let sql = insert_sql(SqlDialect::MySql, "app", "users", &cols(&["id", "name"]));
        assert_eq!(sql, "INSERT INTO `app`.`users` (`id`, `name`) VALUES (?, ?)");
    }

    #[test]
    fn test_postgres_update_parameter_order() {
        let sql = update_sql(
            SqlDialect::Postgres,
            "public",
            "users",
            &cols(&["name", "email"]),
            &cols(&["id"]),
        );
        assert_eq!(
            sql,
            "UPDATE \"public\".\"users\" SET \"name\" = $1, \"email\" = $2 WHERE \"id\" = $3"
        );
    }

    #[test]
    fn test_mysql_delete_composite_pk() {
        let sql = delete_sql(SqlDialect::MySql, "app", "orders", &cols(&["region", "id"]));
        assert_eq!(
            sql,
            "DELETE FROM `app`.`orders` WHERE `region` = ? AND `id` = ?"
        );
    }

    #[test]
    fn test_quoting_doubles_embedded_quotes() {
        assert_eq!(
            SqlDialect::Postgres.quote_ident("we\"ird"),
            "\"we\"\"ird\""
        );
        assert_eq!(SqlDialect::MySql.quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_statement_cache_reuses_text() {
        let cache = StatementCache::new(SqlDialect::Postgres);
        let first = cache.insert_stmt("public", "users", &cols(&["id"]));
        let second = cache.insert_stmt("public", "users", &cols(&["id"]));
        assert_eq!(first, second);

        // Different column set is a different statement
        let third = cache.insert_stmt("public", "users", &cols(&["id", "name"]));
        assert_ne!(first, third);
    }

    #[test]
    fn test_statement_cache_invalidation() {
        let cache = StatementCache::new(SqlDialect::MySql);
        cache.insert_stmt("app", "users", &cols(&["id"]));
        cache.delete_stmt("app", "users", &cols(&["id"]));
        cache.invalidate_table("app", "users");
        // Rebuild after invalidation still yields correct SQL
        let sql = cache.delete_stmt("app", "users", &cols(&["id"]));
        assert!(sql.starts_with("DELETE FROM `app`.`users`"));
    }
}
