//! Conversion between native [`Value`]s and their two textual forms: SQL
//! literals and CSV fields.
//!
//! The two forms deliberately disagree on timestamps. SQL literals use
//! `'YYYY-MM-DD HH:MM:SS'` (UTC, seconds precision), CSV uses ISO-8601 with
//! milliseconds and a `Z` suffix.
//!
//! No SQL literal produced here ever contains a raw line feed or carriage
//! return, so a terminator followed by a newline can only appear between
//! statements. The statement splitter depends on that.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::value::Value;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    #[default]
    MySql,
    Sqlite,
}

impl SqlDialect {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Sqlite => "sqlite",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Some(Self::MySql),
            "sqlite" | "sqlite3" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

/// Render a value as SQL literal text for the given dialect.
#[must_use]
pub fn to_sql_literal(value: &Value, dialect: SqlDialect) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(flag) => if *flag { "1" } else { "0" }.to_string(),
        Value::Integer(number) => number.to_string(),
        Value::Float(number) if number.is_finite() => number.to_string(),
        Value::Float(_) => "NULL".to_string(),
        Value::Text(text) => quote_sql_string(text, dialect),
        Value::Timestamp(at) => format!("'{}'", format_sql_timestamp(*at)),
        Value::Json(json) => quote_sql_string(&json.to_string(), dialect),
    }
}

/// Quote a string as a SQL literal.
///
/// Single quotes are doubled. For MySQL, backslashes and control characters
/// become backslash escapes. SQLite has no backslash escapes, so control
/// characters are spliced in with `char(N)` concatenation instead.
#[must_use]
pub fn quote_sql_string(text: &str, dialect: SqlDialect) -> String {
    match dialect {
        SqlDialect::MySql => {
            let mut out = String::with_capacity(text.len() + 2);
            out.push('\'');
            for ch in text.chars() {
                match ch {
                    '\'' => out.push_str("''"),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\0' => out.push_str("\\0"),
                    '\u{1a}' => out.push_str("\\Z"),
                    other => out.push(other),
                }
            }
            out.push('\'');
            out
        }
        SqlDialect::Sqlite => {
            let mut parts: Vec<String> = Vec::new();
            let mut current = String::new();
            for ch in text.chars() {
                match ch {
                    '\'' => current.push_str("''"),
                    '\n' | '\r' | '\0' => {
                        parts.push(format!("'{current}'"));
                        current.clear();
                        parts.push(format!("char({})", u32::from(ch)));
                    }
                    other => current.push(other),
                }
            }
            if parts.is_empty() {
                return format!("'{current}'");
            }
            if !current.is_empty() {
                parts.push(format!("'{current}'"));
            }
            let joined = parts.into_iter().filter(|part| part != "''").collect::<Vec<_>>();
            format!("({})", joined.join(" || "))
        }
    }
}

/// Render a table or column identifier, quoting only when needed.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    let mut chars = name.chars();
    let bare = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        }
        _ => false,
    };
    if bare {
        name.to_string()
    } else {
        format!("`{}`", name.replace('`', "``"))
    }
}

/// Render a value as one CSV field, quoting strings with `quote`.
#[must_use]
pub fn to_csv_field(value: &Value, quote: char) -> String {
    match value {
        Value::Text(_) | Value::Json(_) => quote_csv_text(&csv_field_text(value), quote),
        _ => csv_field_text(value),
    }
}

/// The unquoted text of a CSV field, for writers that apply quoting
/// themselves.
#[must_use]
pub fn csv_field_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(flag) => if *flag { "1" } else { "0" }.to_string(),
        Value::Integer(number) => number.to_string(),
        Value::Float(number) if number.is_finite() => number.to_string(),
        Value::Float(_) => String::new(),
        Value::Text(text) => text.clone(),
        Value::Timestamp(at) => format_csv_timestamp(*at),
        Value::Json(json) => json.to_string(),
    }
}

fn quote_csv_text(text: &str, quote: char) -> String {
    let doubled = format!("{quote}{quote}");
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    out.push_str(&text.replace(quote, &doubled));
    out.push(quote);
    out
}

/// Reconstruct a typed value from an unquoted CSV field.
///
/// The rules are applied in order and are lossy by construction: the text
/// `"1"` comes back as a boolean, numeric-looking text comes back as a
/// number, and any text that starts with an ISO-8601 date-time comes back
/// as that timestamp.
#[must_use]
pub fn from_csv_field(field: &str) -> Value {
    if field.is_empty() {
        return Value::Null;
    }
    if field == "1" {
        return Value::Bool(true);
    }
    if field == "0" {
        return Value::Bool(false);
    }
    if let Some(at) = iso_timestamp_prefix(field) {
        return Value::Timestamp(at);
    }
    if field.starts_with('{') || field.starts_with('[') {
        return serde_json::from_str(field)
            .map_or_else(|_| Value::Text(field.to_string()), Value::Json);
    }
    if let Ok(number) = field.parse::<i64>() {
        return Value::Integer(number);
    }
    if looks_numeric(field) {
        if let Ok(number) = field.parse::<f64>() {
            return Value::Float(number);
        }
    }
    Value::Text(field.to_string())
}

fn looks_numeric(field: &str) -> bool {
    let trimmed = field.strip_prefix(['-', '+']).unwrap_or(field);
    !trimmed.is_empty()
        && trimmed.chars().any(|ch| ch.is_ascii_digit())
        && trimmed.chars().all(|ch| ch.is_ascii_digit() || matches!(ch, '.' | 'e' | 'E' | '-' | '+'))
}

fn iso_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d{1,9})?(?:Z|[+-]\d{2}:\d{2})?")
                .ok()
        })
        .as_ref()
}

fn iso_timestamp_prefix(field: &str) -> Option<OffsetDateTime> {
    let matched = iso_pattern()?.find(field)?.as_str();
    let has_offset = matched.ends_with('Z')
        || matched.get(19..).is_some_and(|tail| tail.contains('+') || tail.contains('-'));
    if has_offset {
        OffsetDateTime::parse(matched, &Rfc3339).ok()
    } else {
        OffsetDateTime::parse(&format!("{matched}Z"), &Rfc3339).ok()
    }
}

/// `YYYY-MM-DD HH:MM:SS` in UTC, the SQL literal form (without quotes).
#[must_use]
pub fn format_sql_timestamp(at: OffsetDateTime) -> String {
    let utc = at.to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        utc.year(),
        u8::from(utc.month()),
        utc.day(),
        utc.hour(),
        utc.minute(),
        utc.second()
    )
}

/// `YYYY-MM-DDTHH:MM:SS.mmmZ`, the CSV form.
#[must_use]
pub fn format_csv_timestamp(at: OffsetDateTime) -> String {
    let utc = at.to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        utc.year(),
        u8::from(utc.month()),
        utc.day(),
        utc.hour(),
        utc.minute(),
        utc.second(),
        utc.millisecond()
    )
}

/// Parse either textual timestamp form back into a UTC date-time.
#[must_use]
pub fn parse_timestamp_text(text: &str) -> Option<OffsetDateTime> {
    let trimmed = text.trim();
    if let Ok(at) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Some(at);
    }
    PrimitiveDateTime::parse(
        trimmed,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]"),
    )
    .ok()
    .map(PrimitiveDateTime::assume_utc)
}
