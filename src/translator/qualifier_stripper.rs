use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, warn};
use crate::translator::lexical::{is_reserved_word, matches_outside_literals, replace_outside_literals, SqlLayout};

/// Date/time builtins that must never carry a schema or table prefix.
const BUILTIN_FUNCTIONS: &[&str] = &[
    "CURRENT_TIMESTAMP",
    "CURRENT_DATE",
    "CURRENT_TIME",
    "LOCALTIMESTAMP",
    "LOCALTIME",
    "NOW",
];

static BUILTIN_PREFIX_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b(?:\w+\.){{1,2}}({})\b", BUILTIN_FUNCTIONS.join("|"))).unwrap()
});

static JOIN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bJOIN\b").unwrap()
});

static FROM_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bFROM\b").unwrap()
});

static QUALIFIED_FROM_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bFROM\s+(\w+)\.(\w+)(?:\s+(?:AS\s+)?(\w+))?").unwrap()
});

static CLAUSE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:WHERE|ORDER\s+BY|GROUP\s+BY|HAVING|LIMIT)\b").unwrap()
});

/// Removes qualifiers the model adds where they are noise or wrong.
///
/// Builtin date/time functions lose any prefix in every statement. Column
/// qualifiers are stripped only from single-table statements, where there
/// is no join ambiguity to preserve.
pub struct QualifierStripper;

impl QualifierStripper {
    pub fn translate_query(sql: &str) -> String {
        let result = Self::strip_builtin_prefixes(sql);
        let result = Self::strip_single_table_columns(&result);
        if result != sql {
            debug!("Stripped qualifiers: {} -> {}", sql, result);
        }
        result
    }

    /// `schema.table.NOW()` / `schema.CURRENT_DATE` -> bare builtin.
    pub fn strip_builtin_prefixes(sql: &str) -> String {
        let mut result = sql.to_string();
        // Longer chains lose two levels per pass
        for _ in 0..4 {
            if !matches_outside_literals(&result, &BUILTIN_PREFIX_REGEX) {
                break;
            }
            result = replace_outside_literals(&result, &BUILTIN_PREFIX_REGEX, |caps: &Captures| caps[1].to_string());
        }
        result
    }

    /// Strip `schema.table.col`, `schema.col` and `table.col` (or `alias.col`)
    /// down to `col` outside the `FROM` clause of a single-table statement.
    pub fn strip_single_table_columns(sql: &str) -> String {
        if matches_outside_literals(sql, &JOIN_REGEX) {
            return sql.to_string();
        }

        let layout = SqlLayout::new(sql);
        let table_froms: Vec<usize> = FROM_REGEX
            .find_iter(sql)
            .map(|m| m.start())
            .filter(|&pos| layout.is_table_from(sql, pos))
            .collect();

        // Subqueries bring their own tables; their qualifiers stay
        let &[from_pos] = table_froms.as_slice() else {
            return sql.to_string();
        };

        let Some(caps) = QUALIFIED_FROM_REGEX.captures_at(sql, from_pos) else {
            return sql.to_string();
        };
        let Some(whole) = caps.get(0) else {
            return sql.to_string();
        };
        if whole.start() != from_pos {
            return sql.to_string();
        }
        // Comma join lists more than one table
        if sql[whole.end()..].trim_start().starts_with(',') {
            return sql.to_string();
        }

        let schema = &caps[1];
        let table = &caps[2];
        let alias = caps
            .get(3)
            .map(|m| m.as_str())
            .filter(|a| !is_reserved_word(a));

        let patterns = match Self::column_patterns(schema, table, alias) {
            Ok(patterns) => patterns,
            Err(e) => {
                warn!("Skipping column de-qualification: {}", e);
                return sql.to_string();
            }
        };

        let (select_part, from_and_after) = sql.split_at(from_pos);
        let clause_pos = CLAUSE_REGEX
            .find_iter(from_and_after)
            .map(|m| m.start())
            .find(|&pos| !layout.in_literal(from_pos + pos));

        let mut result = Self::strip_columns(select_part, &patterns);
        match clause_pos {
            Some(pos) => {
                let (table_part, rest) = from_and_after.split_at(pos);
                result.push_str(table_part);
                result.push_str(&Self::strip_columns(rest, &patterns));
            }
            None => result.push_str(from_and_after),
        }
        result
    }

    fn column_patterns(schema: &str, table: &str, alias: Option<&str>) -> Result<Vec<Regex>, regex::Error> {
        let schema = regex::escape(schema);
        let table = regex::escape(table);
        let mut patterns = vec![
            Regex::new(&format!(r"(?i)\b{}\.{}\.(\w+)", schema, table))?,
            Regex::new(&format!(r"(?i)\b{}\.(\w+)", schema))?,
        ];
        match alias {
            Some(alias) => patterns.push(Regex::new(&format!(r"(?i)\b{}\.(\w+)", regex::escape(alias)))?),
            None => patterns.push(Regex::new(&format!(r"(?i)\b{}\.(\w+)", table))?),
        }
        Ok(patterns)
    }

    fn strip_columns(fragment: &str, patterns: &[Regex]) -> String {
        patterns.iter().fold(fragment.to_string(), |acc, pattern| {
            replace_outside_literals(&acc, pattern, |caps: &Captures| caps[1].to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builtin_prefixes_removed() {
        assert_eq!(
            QualifierStripper::translate_query(
                "SELECT * FROM employee.leave_requests WHERE start_date <= employee.CURRENT_DATE AND created_at < employee.leave_requests.now()"
            ),
            "SELECT * FROM employee.leave_requests WHERE start_date <= CURRENT_DATE AND created_at < now()"
        );
    }

    #[test]
    fn test_builtin_prefixes_removed_with_join() {
        let sql = "SELECT e.first_name FROM employee.employees e JOIN employee.departments d ON e.dept_id = d.dept_id \
                   WHERE e.hire_date < employee.CURRENT_DATE";
        assert_eq!(
            QualifierStripper::translate_query(sql),
            "SELECT e.first_name FROM employee.employees e JOIN employee.departments d ON e.dept_id = d.dept_id \
             WHERE e.hire_date < CURRENT_DATE"
        );
    }

    #[test]
    fn test_alias_columns_stripped() {
        let sql = "SELECT e.first_name, e.last_name FROM employee.employees e WHERE e.status = 'intern' ORDER BY e.hire_date";
        assert_eq!(
            QualifierStripper::translate_query(sql),
            "SELECT first_name, last_name FROM employee.employees e WHERE status = 'intern' ORDER BY hire_date"
        );
    }

    #[test]
    fn test_table_and_schema_columns_stripped() {
        let sql = "SELECT employee.first_name, employees.last_name, employee.employees.emp_id \
                   FROM employee.employees WHERE employees.hire_date = '2023-01-01'";
        assert_eq!(
            QualifierStripper::translate_query(sql),
            "SELECT first_name, last_name, emp_id \
             FROM employee.employees WHERE hire_date = '2023-01-01'"
        );
    }

    #[test]
    fn test_keyword_is_not_alias() {
        let sql = "SELECT employees.first_name FROM employee.employees WHERE employees.emp_id = 7";
        assert_eq!(
            QualifierStripper::translate_query(sql),
            "SELECT first_name FROM employee.employees WHERE emp_id = 7"
        );
    }

    #[test]
    fn test_join_queries_keep_column_qualifiers() {
        let sql = "SELECT e.first_name, d.dept_name FROM employee.employees e \
                   JOIN employee.departments d ON e.dept_id = d.dept_id WHERE e.status = 'intern'";
        assert_eq!(QualifierStripper::translate_query(sql), sql);
    }

    #[test]
    fn test_comma_join_keeps_column_qualifiers() {
        let sql = "SELECT e.first_name, d.dept_name FROM employee.employees e, employee.departments d \
                   WHERE e.dept_id = d.dept_id";
        assert_eq!(QualifierStripper::translate_query(sql), sql);

        let sql = "SELECT employees.first_name FROM employee.employees , employee.departments \
                   WHERE employees.dept_id = departments.dept_id";
        assert_eq!(QualifierStripper::translate_query(sql), sql);
    }

    #[test]
    fn test_subquery_keeps_qualifiers() {
        let sql = "SELECT e.first_name FROM employee.employees e \
                   WHERE e.dept_id IN (SELECT d.dept_id FROM employee.departments d)";
        assert_eq!(QualifierStripper::translate_query(sql), sql);
    }

    #[test]
    fn test_literals_untouched() {
        let sql = "SELECT e.first_name FROM employee.employees e WHERE e.email = 'e.smith@corp.id'";
        assert_eq!(
            QualifierStripper::translate_query(sql),
            "SELECT first_name FROM employee.employees e WHERE email = 'e.smith@corp.id'"
        );
    }

    #[test]
    fn test_extract_does_not_confuse_from_detection() {
        let sql = "SELECT EXTRACT(YEAR FROM e.hire_date) AS y FROM employee.employees e WHERE EXTRACT(YEAR FROM e.hire_date) = 2023";
        assert_eq!(
            QualifierStripper::translate_query(sql),
            "SELECT EXTRACT(YEAR FROM hire_date) AS y FROM employee.employees e WHERE EXTRACT(YEAR FROM hire_date) = 2023"
        );
    }

    #[test]
    fn test_no_clause_keyword() {
        let sql = "SELECT e.first_name FROM employee.employees e";
        assert_eq!(
            QualifierStripper::translate_query(sql),
            "SELECT first_name FROM employee.employees e"
        );
    }

    #[test]
    fn test_unqualified_from_left_alone() {
        let sql = "SELECT t.a FROM t";
        assert_eq!(QualifierStripper::translate_query(sql), sql);
    }
}
