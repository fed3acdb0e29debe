use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Declared or inferred storage class of a column.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TypeTag {
    Null,
    Boolean,
    Integer,
    Float,
    Text,
    Timestamp,
    Structured,
}

impl TypeTag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Text => "text",
            Self::Timestamp => "timestamp",
            Self::Structured => "structured",
        }
    }

    /// Map a declared SQL column type onto a tag.
    ///
    /// Follows SQLite affinity order, with boolean, temporal and JSON
    /// declarations recognised before the generic integer/text rules.
    #[must_use]
    pub fn infer(declared: &str) -> Self {
        let upper = declared.trim().to_ascii_uppercase();
        if upper.is_empty() {
            return Self::Text;
        }
        if upper.starts_with("BOOL") || upper == "TINYINT(1)" {
            return Self::Boolean;
        }
        if upper.contains("JSON") {
            return Self::Structured;
        }
        if upper.contains("DATE") || upper.contains("TIME") {
            return Self::Timestamp;
        }
        if upper.contains("INT") {
            return Self::Integer;
        }
        if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            return Self::Text;
        }
        if ["REAL", "FLOA", "DOUB", "NUMERIC", "DECIMAL"].iter().any(|needle| upper.contains(needle))
        {
            return Self::Float;
        }
        Self::Text
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_tag: TypeTag,
    pub nullable: bool,
}

impl ColumnDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, type_tag: TypeTag, nullable: bool) -> Self {
        Self { name: name.into(), type_tag, nullable }
    }
}

/// Table name plus its ordered columns, read once per operation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    #[must_use]
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }
}

/// A native typed value as read from, or written to, the database.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(OffsetDateTime),
    Json(serde_json::Value),
}

impl Value {
    #[must_use]
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Self::Null => TypeTag::Null,
            Self::Bool(_) => TypeTag::Boolean,
            Self::Integer(_) => TypeTag::Integer,
            Self::Float(_) => TypeTag::Float,
            Self::Text(_) => TypeTag::Text,
            Self::Timestamp(_) => TypeTag::Timestamp,
            Self::Json(_) => TypeTag::Structured,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Bool(value) => Some(i64::from(*value)),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "{value}"),
            Self::Timestamp(value) => write!(f, "{}", crate::codec::format_csv_timestamp(*value)),
            Self::Json(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<OffsetDateTime> for Value {
    fn from(value: OffsetDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Ordered column-name to value mapping. Rows have no identity beyond
/// their position in a result set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    fields: Vec<(String, Value)>,
}

impl Row {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.fields.push((column.into(), value.into()));
    }

    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(column, value);
        self
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.iter().find(|(name, _)| name == column).map(|(_, value)| value)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.fields.iter().map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self { fields: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TVAL-001
    #[test]
    fn infer_maps_declared_types_to_tags() {
        let cases = [
            ("INTEGER", TypeTag::Integer),
            ("bigint unsigned", TypeTag::Integer),
            ("BOOLEAN", TypeTag::Boolean),
            ("tinyint(1)", TypeTag::Boolean),
            ("DATETIME", TypeTag::Timestamp),
            ("timestamp", TypeTag::Timestamp),
            ("JSON", TypeTag::Structured),
            ("VARCHAR(255)", TypeTag::Text),
            ("REAL", TypeTag::Float),
            ("DECIMAL(10,2)", TypeTag::Float),
            ("", TypeTag::Text),
            ("BLOB", TypeTag::Text),
        ];
        for (declared, expected) in cases {
            assert_eq!(TypeTag::infer(declared), expected, "declared type `{declared}`");
        }
    }

    // Test IDs: TVAL-002
    #[test]
    fn row_preserves_column_order_and_lookup() {
        let row = Row::new().with("id", 7_i64).with("name", "a").with("deleted_at", None::<i64>);
        assert_eq!(row.columns().collect::<Vec<_>>(), vec!["id", "name", "deleted_at"]);
        assert_eq!(row.get("name"), Some(&Value::Text("a".to_string())));
        assert_eq!(row.get("deleted_at"), Some(&Value::Null));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.len(), 3);
    }
}
