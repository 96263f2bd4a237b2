use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;
use crate::catalog::TableIndex;
use crate::translator::lexical::{is_reserved_word, quote_ident_if_needed, SqlLayout};
use crate::Nl2SqlError;

// NAME is a quoted identifier or a plain one; group 3 is an optional schema
// prefix and group 4 the table name.
static TABLE_REF_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(FROM|JOIN)(\s+)(?:("[^"]+"|[A-Za-z_][A-Za-z0-9_$]*)\.)?("[^"]+"|[A-Za-z_][A-Za-z0-9_$]*)"#,
    )
    .unwrap()
});

/// Rewrites unqualified table references after `FROM`/`JOIN` to
/// `schema.table`, using the schema snapshot to pick the schema.
///
/// Already-qualified references are left alone, which makes the pass
/// idempotent. Tables missing from the snapshot get the default schema so
/// the database reports the unknown relation at EXPLAIN time.
pub struct TableQualifier<'a> {
    tables: &'a TableIndex,
    default_schema: &'a str,
}

impl<'a> TableQualifier<'a> {
    pub fn new(tables: &'a TableIndex, default_schema: &'a str) -> Self {
        Self { tables, default_schema }
    }

    pub fn translate_query(&self, sql: &str) -> Result<String, Nl2SqlError> {
        let layout = SqlLayout::new(sql);
        let mut result = String::with_capacity(sql.len() + 32);
        let mut last = 0;

        for caps in TABLE_REF_REGEX.captures_iter(sql) {
            let (Some(keyword), Some(table)) = (caps.get(1), caps.get(4)) else {
                continue;
            };
            if caps.get(3).is_some() {
                // Already qualified
                continue;
            }
            if layout.in_literal(keyword.start()) || is_reserved_word(table.as_str()) {
                continue;
            }
            if keyword.as_str().eq_ignore_ascii_case("from") && !layout.is_table_from(sql, keyword.start()) {
                continue;
            }

            // schema.table.col style chains and set-returning function calls
            let rest = &sql[table.end()..];
            if rest.starts_with('.') || rest.trim_start().starts_with('(') {
                continue;
            }

            let schema = self.resolve_schema(table.as_str())?;
            result.push_str(&sql[last..table.start()]);
            result.push_str(&quote_ident_if_needed(&schema));
            result.push('.');
            result.push_str(table.as_str());
            last = table.end();
        }

        result.push_str(&sql[last..]);
        if result != sql {
            debug!("Qualified tables: {} -> {}", sql, result);
        }
        Ok(result)
    }

    /// Pick the schema for a bare table name.
    pub fn resolve_schema(&self, table: &str) -> Result<String, Nl2SqlError> {
        let bare = table.trim_matches('"');
        match self.tables.schemas_for(bare) {
            Some(schemas) if schemas.len() == 1 => {
                Ok(schemas.iter().next().cloned().unwrap_or_else(|| self.default_schema.to_string()))
            }
            Some(schemas) if schemas.contains(self.default_schema) => Ok(self.default_schema.to_string()),
            Some(schemas) if !schemas.is_empty() => Err(Nl2SqlError::AmbiguousTable {
                table: bare.to_string(),
                schemas: schemas.iter().cloned().collect(),
            }),
            _ => {
                debug!("Table '{}' not in snapshot, deferring to default schema '{}'", bare, self.default_schema);
                Ok(self.default_schema.to_string())
            }
        }
    }
}
