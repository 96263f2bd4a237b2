use std::collections::{HashMap, HashSet};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, warn};
use crate::catalog::{EnumIndex, SynonymTable};
use crate::translator::lexical::replace_outside_literals;

static QUOTED_LITERAL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(['"])([^'"]*)(['"])"#).unwrap()
});

/// Synonym rewriting for every enum column sharing one name.
struct ColumnRule {
    column: String,
    /// `col = 'x'` / `col = "x"`; group 2 is the literal text
    eq_regex: Regex,
    /// `col IN (...)`; group 1 is the list body
    in_regex: Regex,
    /// lowercase synonym -> canonical label
    lookup: HashMap<String, String>,
}

/// Rewrites user-facing synonyms of enum labels to the stored label inside
/// `col = '...'` and `col IN (...)` predicates.
///
/// Matching is case-insensitive and keeps the label's own casing. Synonyms
/// that are themselves labels of the column are ignored, so a second run
/// never changes the output of the first.
pub struct EnumSynonymNormalizer {
    rules: Vec<ColumnRule>,
}

impl EnumSynonymNormalizer {
    pub fn new(enums: &EnumIndex, synonyms: &SynonymTable) -> Self {
        // column name -> (canonical labels, synonym lookup), first entry wins
        let mut order: Vec<String> = Vec::new();
        let mut by_column: HashMap<String, (HashSet<String>, HashMap<String, String>)> = HashMap::new();

        for entry in enums.iter() {
            let key = entry.column.to_lowercase();
            let (labels, lookup) = by_column.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                (HashSet::new(), HashMap::new())
            });
            labels.extend(entry.values.iter().map(|v| v.to_lowercase()));

            for value in &entry.values {
                for synonym in synonyms.synonyms_for(value) {
                    lookup.entry(synonym.to_lowercase()).or_insert_with(|| value.clone());
                }
            }
        }

        let mut rules = Vec::new();
        for column in order {
            let Some((labels, mut lookup)) = by_column.remove(&column) else {
                continue;
            };
            lookup.retain(|synonym, _| !labels.contains(synonym));
            if lookup.is_empty() {
                continue;
            }

            match Self::build_rule(&column, lookup) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!("Skipping synonym rule for column '{}': {}", column, e),
            }
        }

        Self { rules }
    }

    fn build_rule(column: &str, lookup: HashMap<String, String>) -> Result<ColumnRule, regex::Error> {
        let escaped = regex::escape(column);
        Ok(ColumnRule {
            column: column.to_string(),
            eq_regex: Regex::new(&format!(r#"(?i)\b{}\s*=\s*(['"])([^'"]*)(['"])"#, escaped))?,
            in_regex: Regex::new(&format!(r"(?i)\b{}\s+IN\s*\(([^)]*)\)", escaped))?,
            lookup,
        })
    }

    /// Number of enum columns with at least one applicable synonym.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn translate_query(&self, sql: &str) -> String {
        let mut result = sql.to_string();

        for rule in &self.rules {
            result = replace_outside_literals(&result, &rule.eq_regex, |caps: &Captures| {
                Self::rewrite_literal(rule, caps, 2)
            });

            result = replace_outside_literals(&result, &rule.in_regex, |caps: &Captures| {
                let whole = &caps[0];
                let Some(list) = caps.get(1) else {
                    return whole.to_string();
                };
                let offset = list.start() - caps.get(0).map_or(0, |m| m.start());
                let rewritten = QUOTED_LITERAL_REGEX
                    .replace_all(list.as_str(), |lit: &Captures| Self::rewrite_literal(rule, lit, 2));
                format!("{}{}{}", &whole[..offset], rewritten, &whole[offset + list.len()..])
            });
        }

        if result != sql {
            debug!("Normalized enum synonyms: {} -> {}", sql, result);
        }
        result
    }

    /// Replace capture group `group` with the canonical label when it is a
    /// known synonym; otherwise return the match unchanged.
    fn rewrite_literal(rule: &ColumnRule, caps: &Captures, group: usize) -> String {
        let whole = &caps[0];
        let (Some(all), Some(value)) = (caps.get(0), caps.get(group)) else {
            return whole.to_string();
        };
        match rule.lookup.get(&value.as_str().to_lowercase()) {
            Some(canonical) => {
                debug!("Column '{}': synonym '{}' -> '{}'", rule.column, value.as_str(), canonical);
                let start = value.start() - all.start();
                let end = value.end() - all.start();
                format!("{}{}{}", &whole[..start], canonical, &whole[end..])
            }
            None => whole.to_string(),
        }
    }
}
