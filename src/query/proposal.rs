use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use crate::Nl2SqlError;

/// Longest proposed statement accepted, in bytes; checked before any
/// rewriting pass sees the text.
pub const MAX_SQL_LENGTH: usize = 100_000;

/// Parameters supplied with a proposal: an ordered list bound to `$1`/`:1`
/// placeholders, or a mapping bound to `:name` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProposalParams {
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

impl Default for ProposalParams {
    fn default() -> Self {
        ProposalParams::Positional(Vec::new())
    }
}

impl ProposalParams {
    pub fn is_empty(&self) -> bool {
        match self {
            ProposalParams::Positional(values) => values.is_empty(),
            ProposalParams::Named(values) => values.is_empty(),
        }
    }
}

/// A validated `{sql, params, explanation}` proposal from the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposedQuery {
    pub sql: String,
    pub params: ProposalParams,
    /// Shown to the end user; never interpreted
    pub explanation: String,
}

impl ProposedQuery {
    pub fn new(sql: impl Into<String>, params: ProposalParams) -> Self {
        Self {
            sql: sql.into(),
            params,
            explanation: String::new(),
        }
    }

    /// Parse raw model output.
    ///
    /// Text that is not JSON as a whole is searched for its first balanced
    /// `{...}` block, which covers objects wrapped in prose or code fences.
    pub fn from_llm_output(raw: &str) -> Result<Self, Nl2SqlError> {
        let value = match serde_json::from_str::<Value>(raw.trim()) {
            Ok(value) => value,
            Err(e) => {
                debug!("Model output is not plain JSON ({}), searching for an object", e);
                let block = first_json_object(raw)
                    .ok_or_else(|| Nl2SqlError::malformed("no JSON object found in model output", raw))?;
                serde_json::from_str::<Value>(block)
                    .map_err(|e| Nl2SqlError::malformed(format!("invalid JSON: {}", e), raw))?
            }
        };
        Self::from_value(value, raw)
    }

    /// Validate an already-parsed JSON value; `raw` is kept for diagnostics.
    pub fn from_value(value: Value, raw: &str) -> Result<Self, Nl2SqlError> {
        let Value::Object(mut object) = value else {
            return Err(Nl2SqlError::malformed("proposal is not a JSON object", raw));
        };

        let sql = match object.remove("sql") {
            Some(Value::String(sql)) if sql.trim().len() > MAX_SQL_LENGTH => {
                return Err(Nl2SqlError::malformed(
                    format!("'sql' is {} bytes (max: {})", sql.trim().len(), MAX_SQL_LENGTH),
                    raw,
                ));
            }
            Some(Value::String(sql)) if !sql.trim().is_empty() => sql.trim().to_string(),
            Some(Value::String(_)) => return Err(Nl2SqlError::malformed("'sql' is empty", raw)),
            Some(_) => return Err(Nl2SqlError::malformed("'sql' must be a string", raw)),
            None => return Err(Nl2SqlError::malformed("missing 'sql'", raw)),
        };

        let params = match object.remove("params") {
            None | Some(Value::Null) => ProposalParams::default(),
            Some(Value::Array(values)) => ProposalParams::Positional(values),
            Some(Value::Object(values)) => ProposalParams::Named(values),
            Some(_) => return Err(Nl2SqlError::malformed("'params' must be an array or an object", raw)),
        };

        let explanation = match object.remove("explanation") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(text)) => text,
            Some(_) => return Err(Nl2SqlError::malformed("'explanation' must be a string", raw)),
        };

        Ok(Self { sql, params, explanation })
    }
}

/// The first balanced `{...}` block in `text`, skipping braces inside JSON
/// strings.
pub fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
