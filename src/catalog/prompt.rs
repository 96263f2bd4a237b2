use std::fmt::Write;
use crate::catalog::cache::CatalogState;
use crate::catalog::snapshot::EnumIndex;
use crate::catalog::synonyms::SynonymTable;

/// Render enum columns, their valid labels and accepted synonyms for the
/// model's context window. Empty when the schema has no enum columns.
pub fn enum_documentation(enums: &EnumIndex, synonyms: &SynonymTable) -> String {
    if enums.is_empty() {
        return String::new();
    }

    let mut doc = String::from("\n**ENUM Columns & Valid Values:**\n");
    for entry in enums.iter() {
        let _ = writeln!(doc, "\n{}.{}:", entry.table_key, entry.column);
        let _ = writeln!(doc, "  Valid values: {}", quote_all(&entry.values));

        let lines: Vec<String> = entry
            .values
            .iter()
            .filter_map(|value| {
                let syns = synonyms.synonyms_for(value);
                (!syns.is_empty())
                    .then(|| format!("    '{}' can be expressed as: {}", value, quote_all(syns)))
            })
            .collect();

        if !lines.is_empty() {
            doc.push_str("  Synonyms:\n");
            doc.push_str(&lines.join("\n"));
            doc.push('\n');
        }
    }
    doc
}

fn quote_all(values: &[String]) -> String {
    values
        .iter()
        .map(|v| format!("'{}'", v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Cut `s` to at most `max_chars` characters.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Schema context handed to the SQL-proposing model: enum documentation
/// followed by the snapshot as JSON, truncated to `max_chars`.
pub fn schema_context(state: &CatalogState, synonyms: &SynonymTable, max_chars: usize) -> String {
    let schema_json = serde_json::to_string(&state.snapshot).unwrap_or_else(|_| "{}".to_string());
    format!(
        "{}\nSCHEMA: {}",
        enum_documentation(&state.enums, synonyms),
        truncate_chars(&schema_json, max_chars)
    )
}
