//! Collaborator seams: the database connection and the file-record table.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::value::{ColumnDescriptor, Row};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{message}")]
pub struct ConnectionError {
    pub message: String,
}

impl ConnectionError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// "Execute one SQL statement, get rows back", plus the metadata queries
/// the dump path needs. Implementations own one live connection; it is
/// released when the value is dropped.
pub trait SqlConnection {
    /// Execute one statement and return any rows it produced.
    ///
    /// # Errors
    /// Returns the database's error message verbatim so callers can match
    /// tolerated patterns against it.
    fn execute(&mut self, statement: &str) -> Result<Vec<Row>, ConnectionError>;

    /// User tables of the current database, in a stable order.
    ///
    /// # Errors
    /// Returns an error when the catalog cannot be queried.
    fn table_names(&mut self) -> Result<Vec<String>, ConnectionError>;

    /// Ordered columns of one table.
    ///
    /// # Errors
    /// Returns an error when the table does not exist or cannot be inspected.
    fn column_metadata(&mut self, table: &str) -> Result<Vec<ColumnDescriptor>, ConnectionError>;

    /// The structural definition (`CREATE TABLE ...`) of one table, without
    /// a trailing terminator.
    ///
    /// # Errors
    /// Returns an error when the definition cannot be read.
    fn table_definition(&mut self, table: &str) -> Result<String, ConnectionError>;

    /// Name of the database the connection currently points at.
    fn current_database(&self) -> Option<String>;
}

/// One uploaded physical file as recorded in the database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub original_name: String,
    pub filename: String,
    pub path: String,
    pub url: String,
    pub mime_type: String,
    pub size: i64,
    pub category: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub is_orphaned: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Access to the file-record table used by orphan reconciliation.
pub trait FileRecordStore {
    /// # Errors
    /// Returns an error when the records cannot be read.
    fn list_file_records(&mut self) -> Result<Vec<FileRecord>, ConnectionError>;

    /// # Errors
    /// Returns an error when the delete fails.
    fn delete_file_record(&mut self, id: i64) -> Result<bool, ConnectionError>;

    /// # Errors
    /// Returns an error when the update fails.
    fn set_orphaned(&mut self, id: i64, orphaned: bool) -> Result<bool, ConnectionError>;
}
