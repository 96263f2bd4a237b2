use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::ops::Range;
use std::str::FromStr;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tokio_postgres::types::{IsNull, Kind, ToSql, Type, to_sql_checked};
use tracing::{debug, warn};
use uuid::Uuid;
use crate::query::proposal::ProposalParams;
use crate::Nl2SqlError;

/// Query text using only `:pX` placeholders plus the values bound to them.
///
/// The key set of `params` is exactly the set of placeholder names in `sql`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedQuery {
    pub sql: String,
    pub params: BTreeMap<String, Value>,
}

/// A placeholder found outside literals, comments and quoted identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Placeholder {
    /// `$3`
    Dollar(usize),
    /// `:3`
    Number(usize),
    /// `:name`
    Named(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    SingleQuote,
    DoubleQuote,
    LineComment,
    BlockComment,
}

fn is_ident_start(b: u8) -> bool {
    b == b'_' || b.is_ascii_alphabetic()
}

fn is_ident_continue(b: u8) -> bool {
    is_ident_start(b) || b.is_ascii_digit()
}

/// Locate every placeholder in `sql`, in text order.
fn scan_placeholders(sql: &str) -> Vec<(Range<usize>, Placeholder)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut state = ScanState::Normal;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        match state {
            ScanState::Normal => match b {
                b'\'' => state = ScanState::SingleQuote,
                b'"' => state = ScanState::DoubleQuote,
                b'-' if next == Some(b'-') => {
                    state = ScanState::LineComment;
                    i += 1;
                }
                b'/' if next == Some(b'*') => {
                    state = ScanState::BlockComment;
                    i += 1;
                }
                // `::` casts and `:=` assignments
                b':' if matches!(next, Some(b':') | Some(b'=')) => i += 1,
                b'$' | b':' if next.is_some_and(|n| n.is_ascii_digit()) => {
                    let start = i;
                    let mut end = i + 1;
                    while end < bytes.len() && bytes[end].is_ascii_digit() {
                        end += 1;
                    }
                    // `$1abc` is not a placeholder
                    if end < bytes.len() && is_ident_start(bytes[end]) {
                        i = end;
                        continue;
                    }
                    if let Ok(index) = sql[start + 1..end].parse::<usize>() {
                        let placeholder = if b == b'$' {
                            Placeholder::Dollar(index)
                        } else {
                            Placeholder::Number(index)
                        };
                        found.push((start..end, placeholder));
                    }
                    i = end;
                    continue;
                }
                b':' if next.is_some_and(is_ident_start) => {
                    let start = i;
                    let mut end = i + 1;
                    while end < bytes.len() && is_ident_continue(bytes[end]) {
                        end += 1;
                    }
                    found.push((start..end, Placeholder::Named(sql[start + 1..end].to_string())));
                    i = end;
                    continue;
                }
                _ => {}
            },
            ScanState::SingleQuote => {
                if b == b'\'' {
                    if next == Some(b'\'') {
                        i += 1;
                    } else {
                        state = ScanState::Normal;
                    }
                }
            }
            ScanState::DoubleQuote => {
                if b == b'"' {
                    state = ScanState::Normal;
                }
            }
            ScanState::LineComment => {
                if b == b'\n' {
                    state = ScanState::Normal;
                }
            }
            ScanState::BlockComment => {
                if b == b'*' && next == Some(b'/') {
                    state = ScanState::Normal;
                    i += 1;
                }
            }
        }
        i += 1;
    }
    found
}

/// Replace each scanned placeholder with the text chosen by `render`.
fn rewrite_placeholders<F>(sql: &str, mut render: F) -> Result<String, Nl2SqlError>
where
    F: FnMut(&Placeholder) -> Result<String, Nl2SqlError>,
{
    let mut out = String::with_capacity(sql.len() + 16);
    let mut last = 0;
    for (range, placeholder) in scan_placeholders(sql) {
        out.push_str(&sql[last..range.start]);
        out.push_str(&render(&placeholder)?);
        last = range.end;
    }
    out.push_str(&sql[last..]);
    Ok(out)
}

/// Rewrites the placeholder styles a model produces (`$1`, `:1`, `:name`)
/// into `:pX` names with a matching value map.
pub struct ParamStyleNormalizer;

impl ParamStyleNormalizer {
    pub fn normalize(sql: &str, params: &ProposalParams) -> Result<NormalizedQuery, Nl2SqlError> {
        match params {
            ProposalParams::Positional(values) => Self::normalize_positional(sql, values),
            ProposalParams::Named(values) => Self::normalize_named(sql, values),
        }
    }

    fn positional_index(placeholder: &Placeholder) -> Option<usize> {
        match placeholder {
            Placeholder::Dollar(i) | Placeholder::Number(i) => Some(*i),
            Placeholder::Named(name) => name.strip_prefix('p').and_then(|n| n.parse().ok()),
        }
    }

    fn normalize_positional(sql: &str, values: &[Value]) -> Result<NormalizedQuery, Nl2SqlError> {
        let mut bound = BTreeMap::new();

        let rewritten = rewrite_placeholders(sql, |placeholder| {
            let index = Self::positional_index(placeholder).ok_or_else(|| {
                Nl2SqlError::malformed(format!("placeholder {:?} needs named params", placeholder), sql)
            })?;
            let value = index
                .checked_sub(1)
                .and_then(|i| values.get(i))
                .ok_or_else(|| Nl2SqlError::malformed(format!("no value for parameter {}", index), sql))?;
            let name = format!("p{}", index);
            bound.insert(name.clone(), value.clone());
            Ok(format!(":{}", name))
        })?;

        if bound.len() < values.len() {
            debug!("Dropping {} positional values without a placeholder", values.len() - bound.len());
        }
        Ok(NormalizedQuery { sql: rewritten, params: bound })
    }

    fn normalize_named(sql: &str, values: &serde_json::Map<String, Value>) -> Result<NormalizedQuery, Nl2SqlError> {
        // source key -> pX name, and pX name -> value
        let mut targets: HashMap<&str, String> = HashMap::new();
        let mut by_target: HashMap<String, &Value> = HashMap::new();

        for (key, value) in values {
            if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
                return Err(Nl2SqlError::malformed(format!("invalid parameter name '{}'", key), sql));
            }
            let target = if key.starts_with('p') { key.clone() } else { format!("p{}", key) };
            if by_target.insert(target.clone(), value).is_some() {
                return Err(Nl2SqlError::malformed(
                    format!("parameters collide on placeholder ':{}'", target),
                    sql,
                ));
            }
            targets.insert(key.as_str(), target);
        }

        let mut bound = BTreeMap::new();
        let rewritten = rewrite_placeholders(sql, |placeholder| {
            let source = match placeholder {
                Placeholder::Dollar(i) | Placeholder::Number(i) => i.to_string(),
                Placeholder::Named(name) => name.clone(),
            };
            let target = match targets.get(source.as_str()) {
                Some(target) => target.clone(),
                None if by_target.contains_key(&source) => source,
                None => {
                    return Err(Nl2SqlError::malformed(format!("no value for parameter '{}'", source), sql));
                }
            };
            if let Some(value) = by_target.get(&target) {
                bound.insert(target.clone(), (*value).clone());
            }
            Ok(format!(":{}", target))
        })?;

        for key in values.keys() {
            if targets.get(key.as_str()).is_some_and(|t| !bound.contains_key(t)) {
                debug!("Dropping parameter '{}' without a placeholder", key);
            }
        }
        Ok(NormalizedQuery { sql: rewritten, params: bound })
    }
}

impl NormalizedQuery {
    /// Convert `:pX` placeholders to Postgres `$n`, returning the values in
    /// bind order. Repeated names reuse their first position.
    pub fn bind_postgres(&self) -> Result<(String, Vec<JsonParam>), Nl2SqlError> {
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut ordered = Vec::new();

        let sql = rewrite_placeholders(&self.sql, |placeholder| {
            let Placeholder::Named(name) = placeholder else {
                return Err(Nl2SqlError::malformed(
                    format!("unexpected placeholder {:?} in normalized SQL", placeholder),
                    &self.sql,
                ));
            };
            if let Some(position) = positions.get(name) {
                return Ok(format!("${}", position));
            }
            let value = self
                .params
                .get(name)
                .ok_or_else(|| Nl2SqlError::malformed(format!("no value for parameter '{}'", name), &self.sql))?;
            ordered.push(JsonParam(value.clone()));
            positions.insert(name.clone(), ordered.len());
            Ok(format!("${}", ordered.len()))
        })?;

        Ok((sql, ordered))
    }
}

/// A JSON value bound to a Postgres parameter, encoded according to the
/// type the server inferred for it.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonParam(pub Value);

type BoxError = Box<dyn Error + Sync + Send>;

impl JsonParam {
    fn as_bool(&self) -> Result<bool, BoxError> {
        match &self.0 {
            Value::Bool(b) => Ok(*b),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(false),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(true),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "1" => Ok(true),
                "false" | "f" | "no" | "0" => Ok(false),
                _ => Err(format!("cannot convert '{}' to boolean", s).into()),
            },
            other => Err(format!("cannot convert {} to boolean", other).into()),
        }
    }

    fn as_i64(&self) -> Result<i64, BoxError> {
        match &self.0 {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .ok_or_else(|| format!("cannot convert {} to integer", n).into()),
            Value::String(s) => Ok(s.trim().parse::<i64>()?),
            other => Err(format!("cannot convert {} to integer", other).into()),
        }
    }

    fn as_f64(&self) -> Result<f64, BoxError> {
        match &self.0 {
            Value::Number(n) => n.as_f64().ok_or_else(|| format!("cannot convert {} to float", n).into()),
            Value::String(s) => Ok(s.trim().parse::<f64>()?),
            other => Err(format!("cannot convert {} to float", other).into()),
        }
    }

    fn as_decimal(&self) -> Result<Decimal, BoxError> {
        let text = match &self.0 {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.trim().to_string(),
            other => return Err(format!("cannot convert {} to numeric", other).into()),
        };
        Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .map_err(Into::into)
    }

    /// Text form of the value: strings as-is, everything else as JSON.
    fn as_text(&self) -> String {
        match &self.0 {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn as_timestamp(text: &str) -> Result<NaiveDateTime, BoxError> {
        let text = text.trim();
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
            if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
                return Ok(ts);
            }
        }
        NaiveDate::parse_from_str(text, "%Y-%m-%d")?
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| format!("cannot convert '{}' to timestamp", text).into())
    }
}

impl ToSql for JsonParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        if self.0.is_null() {
            return Ok(IsNull::Yes);
        }

        match *ty {
            Type::BOOL => self.as_bool()?.to_sql(ty, out),
            Type::INT2 => i16::try_from(self.as_i64()?)?.to_sql(ty, out),
            Type::INT4 => i32::try_from(self.as_i64()?)?.to_sql(ty, out),
            Type::INT8 => self.as_i64()?.to_sql(ty, out),
            Type::FLOAT4 => (self.as_f64()? as f32).to_sql(ty, out),
            Type::FLOAT8 => self.as_f64()?.to_sql(ty, out),
            Type::NUMERIC => self.as_decimal()?.to_sql(ty, out),
            Type::DATE => NaiveDate::parse_from_str(self.as_text().trim(), "%Y-%m-%d")?.to_sql(ty, out),
            Type::TIMESTAMP => Self::as_timestamp(&self.as_text())?.to_sql(ty, out),
            Type::TIMESTAMPTZ => {
                let text = self.as_text();
                let ts = match DateTime::parse_from_rfc3339(text.trim()) {
                    Ok(ts) => ts.with_timezone(&Utc),
                    Err(_) => Utc.from_utc_datetime(&Self::as_timestamp(&text)?),
                };
                ts.to_sql(ty, out)
            }
            Type::JSON | Type::JSONB => self.0.to_sql(ty, out),
            Type::UUID => Uuid::parse_str(self.as_text().trim())?.to_sql(ty, out),
            _ if matches!(ty.kind(), Kind::Enum(_)) => {
                // Enum labels travel as their text in binary format
                out.extend_from_slice(self.as_text().as_bytes());
                Ok(IsNull::No)
            }
            _ if <&str as ToSql>::accepts(ty) => self.as_text().as_str().to_sql(ty, out),
            _ => {
                warn!("No binary encoding for parameter type {}", ty);
                Err(format!("unsupported parameter type {}", ty).into())
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}
