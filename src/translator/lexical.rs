use std::cmp::Ordering;
use std::ops::Range;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Words that can follow `FROM`/`JOIN` or a table reference without being a
/// table name or alias.
const RESERVED_WORDS: &[&str] = &[
    "all", "and", "as", "asc", "between", "by", "case", "cross", "desc", "distinct", "else",
    "end", "except", "fetch", "for", "from", "full", "group", "having", "in", "inner",
    "intersect", "is", "join", "lateral", "left", "like", "limit", "natural", "not", "null",
    "offset", "on", "only", "or", "order", "outer", "right", "rows", "select", "then", "union",
    "using", "when", "where", "window", "with",
];

static SELECT_HEAD_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*SELECT\b").unwrap()
});

static PLAIN_IDENT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z_][a-z0-9_$]*$").unwrap()
});

pub fn is_reserved_word(word: &str) -> bool {
    let lower = word.to_ascii_lowercase();
    RESERVED_WORDS.contains(&lower.as_str())
}

/// Byte ranges of single-quoted string literals, quotes included.
///
/// A doubled quote (`''`) inside a literal is an escaped quote. An
/// unterminated literal runs to the end of the text.
pub fn literal_spans(sql: &str) -> Vec<Range<usize>> {
    let bytes = sql.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\'' {
            i += 1;
            continue;
        }
        let start = i;
        i += 1;
        loop {
            if i >= bytes.len() {
                spans.push(start..bytes.len());
                return spans;
            }
            if bytes[i] == b'\'' {
                if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                    i += 2;
                    continue;
                }
                i += 1;
                spans.push(start..i);
                break;
            }
            i += 1;
        }
    }
    spans
}

/// Whether `pos` falls in one of `spans`, which must be sorted and disjoint
/// as returned by [`literal_spans`].
pub fn in_spans(spans: &[Range<usize>], pos: usize) -> bool {
    spans
        .binary_search_by(|span| {
            if span.end <= pos {
                Ordering::Less
            } else if span.start > pos {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        })
        .is_ok()
}

/// Whether position `pos` sits inside a string literal.
pub fn is_inside_literal(sql: &str, pos: usize) -> bool {
    in_spans(&literal_spans(sql), pos)
}

/// Literal spans and parenthesis nesting of one statement, computed in a
/// single pass so per-keyword lookups do not rescan the text.
pub struct SqlLayout {
    spans: Vec<Range<usize>>,
    /// innermost `(` still open before each byte, literals ignored
    enclosing: Vec<Option<usize>>,
}

impl SqlLayout {
    pub fn new(sql: &str) -> Self {
        let spans = literal_spans(sql);
        let bytes = sql.as_bytes();
        let mut enclosing = Vec::with_capacity(bytes.len() + 1);
        let mut stack: Vec<usize> = Vec::new();
        let mut next_span = 0;

        for (i, b) in bytes.iter().enumerate() {
            enclosing.push(stack.last().copied());
            while next_span < spans.len() && spans[next_span].end <= i {
                next_span += 1;
            }
            if spans.get(next_span).is_some_and(|span| span.contains(&i)) {
                continue;
            }
            match b {
                b'(' => stack.push(i),
                b')' => {
                    stack.pop();
                }
                _ => {}
            }
        }
        enclosing.push(stack.last().copied());

        Self { spans, enclosing }
    }

    pub fn spans(&self) -> &[Range<usize>] {
        &self.spans
    }

    pub fn in_literal(&self, pos: usize) -> bool {
        in_spans(&self.spans, pos)
    }

    /// Position of the innermost `(` still open at `pos`.
    pub fn enclosing_paren(&self, pos: usize) -> Option<usize> {
        self.enclosing.get(pos).copied().flatten()
    }

    /// Whether the `FROM` keyword at `pos` introduces a table reference.
    ///
    /// `FROM` also separates arguments of `EXTRACT`, `SUBSTRING`, `TRIM` and
    /// `OVERLAY`, and ends `IS [NOT] DISTINCT FROM`. Inside parentheses it is
    /// a table reference only when the parenthesised text is a subquery.
    pub fn is_table_from(&self, sql: &str, pos: usize) -> bool {
        if self.in_literal(pos) || ends_with_distinct(&sql[..pos]) {
            return false;
        }
        match self.enclosing_paren(pos) {
            Some(open) => SELECT_HEAD_REGEX.is_match(&sql[open + 1..pos]),
            None => true,
        }
    }
}

/// `... DISTINCT ` immediately before a keyword.
fn ends_with_distinct(head: &str) -> bool {
    let trimmed = head.trim_end();
    if trimmed.len() == head.len() || trimmed.len() < "distinct".len() {
        return false;
    }
    let split = trimmed.len() - "distinct".len();
    let Some(word) = trimmed.get(split..) else {
        return false;
    };
    word.eq_ignore_ascii_case("distinct")
        && !trimmed[..split]
            .bytes()
            .next_back()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Quote a schema or table name unless it is a plain lowercase identifier.
pub fn quote_ident_if_needed(name: &str) -> String {
    if PLAIN_IDENT_REGEX.is_match(name) || (name.starts_with('"') && name.ends_with('"') && name.len() > 1) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Apply `regex` everywhere outside string literals, delegating each match
/// to `replace`.
pub fn replace_outside_literals<F>(sql: &str, regex: &Regex, mut replace: F) -> String
where
    F: FnMut(&Captures) -> String,
{
    let spans = literal_spans(sql);
    regex
        .replace_all(sql, |caps: &Captures| {
            let whole = caps.get(0).map(|m| (m.start(), m.as_str()));
            match whole {
                Some((start, text)) if in_spans(&spans, start) => text.to_string(),
                _ => replace(caps),
            }
        })
        .into_owned()
}

/// Whether `regex` matches anywhere outside string literals.
pub fn matches_outside_literals(sql: &str, regex: &Regex) -> bool {
    let spans = literal_spans(sql);
    regex.find_iter(sql).any(|m| !in_spans(&spans, m.start()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_spans() {
        let sql = "SELECT 'a' || 'it''s' FROM t WHERE x = 'from y'";
        let spans = literal_spans(sql);
        let texts: Vec<&str> = spans.iter().map(|r| &sql[r.clone()]).collect();
        assert_eq!(texts, vec!["'a'", "'it''s'", "'from y'"]);
    }

    #[test]
    fn test_unterminated_literal_runs_to_end() {
        let sql = "SELECT 'abc";
        assert_eq!(literal_spans(sql), vec![7..11]);
        assert!(is_inside_literal(sql, 9));
    }

    #[test]
    fn test_table_from_detection() {
        let sql = "SELECT EXTRACT(YEAR FROM hire_date) FROM employees";
        let layout = SqlLayout::new(sql);
        let froms: Vec<usize> = sql.match_indices("FROM").map(|(i, _)| i).collect();
        assert!(!layout.is_table_from(sql, froms[0]));
        assert!(layout.is_table_from(sql, froms[1]));

        let sql = "SELECT a FROM t WHERE id IN (SELECT id FROM u)";
        let layout = SqlLayout::new(sql);
        let froms: Vec<usize> = sql.match_indices("FROM").map(|(i, _)| i).collect();
        assert!(froms.iter().all(|&pos| layout.is_table_from(sql, pos)));

        let sql = "SELECT a FROM t WHERE a IS NOT DISTINCT FROM b";
        let layout = SqlLayout::new(sql);
        let last = sql.rfind("FROM").unwrap();
        assert!(!layout.is_table_from(sql, last));

        let sql = "SELECT indistinct FROM t";
        let layout = SqlLayout::new(sql);
        assert!(layout.is_table_from(sql, sql.find("FROM").unwrap()));
    }

    #[test]
    fn test_paren_nesting_ignores_literals() {
        let sql = "SELECT ')' , (SELECT '(' FROM u) FROM t";
        let layout = SqlLayout::new(sql);
        let inner = sql.find("FROM").unwrap();
        let outer = sql.rfind("FROM").unwrap();
        assert_eq!(layout.enclosing_paren(inner), Some(13));
        assert_eq!(layout.enclosing_paren(outer), None);
        assert!(layout.in_literal(8));
        assert!(!layout.in_literal(12));
    }

    #[test]
    fn test_quote_ident_if_needed() {
        assert_eq!(quote_ident_if_needed("employee"), "employee");
        assert_eq!(quote_ident_if_needed("HR"), "\"HR\"");
        assert_eq!(quote_ident_if_needed("\"HR\""), "\"HR\"");
        assert_eq!(quote_ident_if_needed("my schema"), "\"my schema\"");
    }

    #[test]
    fn test_replace_outside_literals() {
        let regex = Regex::new(r"\bfoo\b").unwrap();
        let out = replace_outside_literals("foo = 'foo' AND foo", &regex, |_| "bar".to_string());
        assert_eq!(out, "bar = 'foo' AND bar");
        assert!(matches_outside_literals("x = foo", &regex));
        assert!(!matches_outside_literals("x = 'foo'", &regex));
    }

    #[test]
    fn test_reserved_words() {
        assert!(is_reserved_word("WHERE"));
        assert!(is_reserved_word("lateral"));
        assert!(!is_reserved_word("employees"));
    }
}
