use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use dumpvault_core::codec::parse_timestamp_text;
use dumpvault_core::retarget::validate_database_name;
use dumpvault_core::{
    ColumnDescriptor, ConnectionError, FileRecord, FileRecordStore, Row, SqlConnection, TypeTag, Value,
};
use regex_lite::Regex;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS file_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  original_name TEXT NOT NULL,
  filename TEXT NOT NULL,
  path TEXT NOT NULL,
  url TEXT NOT NULL,
  mime_type TEXT NOT NULL,
  size INTEGER NOT NULL CHECK (size >= 0),
  category TEXT NOT NULL,
  entity_type TEXT,
  entity_id INTEGER,
  is_orphaned BOOLEAN NOT NULL DEFAULT 0 CHECK (is_orphaned IN (0, 1)),
  created_at DATETIME NOT NULL,
  updated_at DATETIME NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_file_records_filename ON file_records(filename);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_file_records_entity ON file_records(entity_type, entity_id);
CREATE INDEX IF NOT EXISTS idx_file_records_orphaned ON file_records(is_orphaned);
";

const DATABASE_EXTENSION: &str = "sqlite3";

/// A SQLite "server": a data directory with one `<name>.sqlite3` file per
/// logical database, one of which is selected at a time.
///
/// Database-identity statements (`CREATE DATABASE`, `DROP DATABASE`,
/// `USE`) are interpreted against the data directory; everything else runs
/// on the selected database. A store opened on `:memory:` has no data
/// directory and treats identity statements as no-ops.
pub struct SqliteStore {
    conn: Connection,
    data_dir: Option<PathBuf>,
    database: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub database: Option<String>,
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Fields of a file record supplied at upload time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewFileRecord {
    pub original_name: String,
    pub filename: String,
    pub path: String,
    pub url: String,
    pub mime_type: String,
    pub size: i64,
    pub category: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
}

/// Path of `database` inside `data_dir`.
#[must_use]
pub fn database_path(data_dir: &Path, database: &str) -> PathBuf {
    data_dir.join(format!("{database}.{DATABASE_EXTENSION}"))
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

fn check_database_name(database: &str) -> Result<()> {
    validate_database_name(database).map_err(|err| anyhow!("{err}"))?;
    if database.contains(['/', '\\']) || database == "." || database == ".." {
        return Err(anyhow!("invalid database name `{database}`: path separators are not allowed"));
    }
    Ok(())
}

impl SqliteStore {
    /// Open a single database file (or `:memory:`) and configure required
    /// runtime pragmas. The file's directory becomes the data directory.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        if path == Path::new(":memory:") {
            return Ok(Self { conn, data_dir: None, database: None });
        }
        let data_dir = path.parent().map(Path::to_path_buf).filter(|dir| !dir.as_os_str().is_empty());
        let database = path.file_stem().and_then(|stem| stem.to_str()).map(str::to_string);
        Ok(Self { conn, data_dir: Some(data_dir.unwrap_or_else(|| PathBuf::from("."))), database })
    }

    /// Open `database` inside `data_dir`, creating both when missing.
    ///
    /// # Errors
    /// Returns an error for invalid names or when the database cannot be opened.
    pub fn open_server(data_dir: &Path, database: &str) -> Result<Self> {
        check_database_name(database)?;
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
        let conn = open_connection(&database_path(data_dir, database))?;
        Ok(Self { conn, data_dir: Some(data_dir.to_path_buf()), database: Some(database.to_string()) })
    }

    /// Selected database name, if any.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// File backing the selected database.
    #[must_use]
    pub fn database_file(&self) -> Option<PathBuf> {
        match (&self.data_dir, &self.database) {
            (Some(dir), Some(database)) => Some(database_path(dir, database)),
            _ => None,
        }
    }

    /// Execute one statement, interpreting database-identity statements
    /// against the data directory, and return any rows it produced.
    ///
    /// # Errors
    /// Returns the SQLite error (or identity error) for the statement.
    pub fn execute_sql(&mut self, statement: &str) -> Result<Vec<Row>> {
        if let Some(identity) = IdentityStatement::parse(statement) {
            self.apply_identity(identity)?;
            return Ok(Vec::new());
        }
        if self.data_dir.is_some() && self.database.is_none() {
            return Err(anyhow!("no database selected"));
        }
        let translated = translate_statement(statement);
        let Some(sql) = translated.as_deref() else {
            tracing::debug!(statement = %statement.trim(), "ignoring statement with no sqlite equivalent");
            return Ok(Vec::new());
        };
        query_rows(&self.conn, sql)
    }

    fn apply_identity(&mut self, identity: IdentityStatement) -> Result<()> {
        let Some(data_dir) = self.data_dir.clone() else {
            tracing::debug!(?identity, "in-memory store ignores database identity statement");
            return Ok(());
        };
        match identity {
            IdentityStatement::Create { name, if_not_exists } => {
                check_database_name(&name)?;
                let path = database_path(&data_dir, &name);
                if path.exists() {
                    if if_not_exists {
                        return Ok(());
                    }
                    return Err(anyhow!("database {name} already exists"));
                }
                open_connection(&path)?;
                tracing::info!(database = %name, "created database");
            }
            IdentityStatement::Drop { name, if_exists } => {
                check_database_name(&name)?;
                let path = database_path(&data_dir, &name);
                if !path.exists() {
                    if if_exists {
                        return Ok(());
                    }
                    return Err(anyhow!("can't drop database {name}; database doesn't exist"));
                }
                if self.database.as_deref() == Some(name.as_str()) {
                    self.conn = Connection::open_in_memory().context("failed to release dropped database")?;
                    self.database = None;
                }
                for suffix in ["", "-wal", "-shm"] {
                    let file = PathBuf::from(format!("{}{suffix}", path.display()));
                    if file.exists() {
                        fs::remove_file(&file).with_context(|| format!("failed to delete {}", file.display()))?;
                    }
                }
                tracing::info!(database = %name, "dropped database");
            }
            IdentityStatement::Use { name } => {
                check_database_name(&name)?;
                let path = database_path(&data_dir, &name);
                if !path.exists() {
                    return Err(anyhow!("unknown database {name}"));
                }
                self.conn = open_connection(&path)?;
                self.database = Some(name);
            }
        }
        Ok(())
    }

    /// User tables of the selected database, ordered by name.
    ///
    /// # Errors
    /// Returns an error when the catalog cannot be queried.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )
            .context("failed to prepare table listing")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut tables = Vec::new();
        for row in rows {
            tables.push(row?);
        }
        Ok(tables)
    }

    /// Columns of `table` from `PRAGMA table_info`, with inferred type tags.
    ///
    /// # Errors
    /// Returns an error when the table does not exist.
    pub fn table_columns(&self, table: &str) -> Result<Vec<ColumnDescriptor>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_sqlite_identifier(table)))
            .with_context(|| format!("failed to inspect table_info for {table}"))?;
        let mut rows = stmt.query([])?;
        let mut columns = Vec::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            let declared: String = row.get(2)?;
            let not_null: i64 = row.get(3)?;
            columns.push(ColumnDescriptor::new(name, TypeTag::infer(&declared), not_null == 0));
        }
        if columns.is_empty() {
            return Err(anyhow!("no such table: {table}"));
        }
        Ok(columns)
    }

    /// Stored `CREATE TABLE` text of `table`.
    ///
    /// # Errors
    /// Returns an error when the table has no stored definition.
    pub fn table_sql(&self, table: &str) -> Result<String> {
        self.conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .with_context(|| format!("failed to read definition of {table}"))?
            .flatten()
            .ok_or_else(|| anyhow!("no stored definition for table {table}"))
    }

    /// Report current and target schema versions plus pending migrations.
    /// Read-only: an unmigrated database is reported at version 0.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations of the file-record schema.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let (mut version, inferred) = detect_effective_schema_version(&self.conn)?;
        if inferred {
            // file_records predates the migration table.
            record_schema_version(&self.conn, 1)?;
        }

        if version < 1 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }
        if version < 2 {
            self.conn.execute_batch(MIGRATION_002_SQL).context("failed to apply migration 002")?;
            record_schema_version(&self.conn, 2)?;
            version = 2;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!("unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"));
        }
        tracing::debug!(version, "schema up to date");
        Ok(())
    }

    /// Insert a file record and return it with its assigned id.
    ///
    /// # Errors
    /// Returns an error when the insert violates a constraint.
    pub fn insert_file_record(&mut self, record: &NewFileRecord) -> Result<FileRecord> {
        let now = OffsetDateTime::now_utc();
        let stamp = rfc3339(now)?;
        self.conn
            .execute(
                "INSERT INTO file_records(
                   original_name, filename, path, url, mime_type, size, category,
                   entity_type, entity_id, is_orphaned, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?10)",
                params![
                    record.original_name,
                    record.filename,
                    record.path,
                    record.url,
                    record.mime_type,
                    record.size,
                    record.category,
                    record.entity_type,
                    record.entity_id,
                    stamp,
                ],
            )
            .with_context(|| format!("failed to insert file record for {}", record.filename))?;
        let id = self.conn.last_insert_rowid();
        self.get_file_record(id)?.ok_or_else(|| anyhow!("file record {id} vanished after insert"))
    }

    /// # Errors
    /// Returns an error when the record cannot be read.
    pub fn get_file_record(&self, id: i64) -> Result<Option<FileRecord>> {
        self.conn
            .query_row(&format!("{SELECT_FILE_RECORDS_SQL} WHERE id = ?1"), params![id], map_file_record)
            .optional()
            .with_context(|| format!("failed to read file record {id}"))?
            .map(finish_file_record)
            .transpose()
    }

    /// # Errors
    /// Returns an error when the records cannot be read.
    pub fn file_records(&self) -> Result<Vec<FileRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_FILE_RECORDS_SQL} ORDER BY id"))
            .context("failed to prepare file record listing")?;
        let rows = stmt.query_map([], map_file_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(finish_file_record(row?)?);
        }
        Ok(records)
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn remove_file_record(&mut self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM file_records WHERE id = ?1", params![id])
            .with_context(|| format!("failed to delete file record {id}"))?;
        Ok(changed > 0)
    }

    /// # Errors
    /// Returns an error when the update fails.
    pub fn flag_file_record(&mut self, id: i64, orphaned: bool) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE file_records SET is_orphaned = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, orphaned, rfc3339(OffsetDateTime::now_utc())?],
            )
            .with_context(|| format!("failed to flag file record {id}"))?;
        Ok(changed > 0)
    }

    /// Copy the selected database to `out_file` with the online backup API.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn snapshot_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for snapshot file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite snapshot at {}", out_file.display()))
    }

    /// Replace the selected database's pages with those of a snapshot file.
    ///
    /// # Errors
    /// Returns an error when the snapshot is missing or the restore fails.
    pub fn restore_snapshot(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("snapshot file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| format!("failed to restore sqlite snapshot from {}", in_file.display()))
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get::<_, Option<i64>>(1)?.unwrap_or(-1),
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            database: self.database.clone(),
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

impl SqlConnection for SqliteStore {
    fn execute(&mut self, statement: &str) -> Result<Vec<Row>, ConnectionError> {
        self.execute_sql(statement).map_err(|err| ConnectionError::new(format!("{err:#}")))
    }

    fn table_names(&mut self) -> Result<Vec<String>, ConnectionError> {
        self.list_tables().map_err(|err| ConnectionError::new(format!("{err:#}")))
    }

    fn column_metadata(&mut self, table: &str) -> Result<Vec<ColumnDescriptor>, ConnectionError> {
        self.table_columns(table).map_err(|err| ConnectionError::new(format!("{err:#}")))
    }

    fn table_definition(&mut self, table: &str) -> Result<String, ConnectionError> {
        self.table_sql(table).map_err(|err| ConnectionError::new(format!("{err:#}")))
    }

    fn current_database(&self) -> Option<String> {
        self.database.clone()
    }
}

impl FileRecordStore for SqliteStore {
    fn list_file_records(&mut self) -> Result<Vec<FileRecord>, ConnectionError> {
        self.file_records().map_err(|err| ConnectionError::new(format!("{err:#}")))
    }

    fn delete_file_record(&mut self, id: i64) -> Result<bool, ConnectionError> {
        self.remove_file_record(id).map_err(|err| ConnectionError::new(format!("{err:#}")))
    }

    fn set_orphaned(&mut self, id: i64, orphaned: bool) -> Result<bool, ConnectionError> {
        self.flag_file_record(id, orphaned).map_err(|err| ConnectionError::new(format!("{err:#}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum IdentityStatement {
    Create { name: String, if_not_exists: bool },
    Drop { name: String, if_exists: bool },
    Use { name: String },
}

struct IdentityPatterns {
    create_quoted: Regex,
    create_bare: Regex,
    drop: Regex,
    use_db: Regex,
}

fn identity_patterns() -> Option<&'static IdentityPatterns> {
    static PATTERNS: OnceLock<Option<IdentityPatterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(IdentityPatterns {
                create_quoted: Regex::new(r"(?is)^\s*CREATE\s+DATABASE\s+([^`;]*?)`([^`]+)`[^;]*;?\s*$").ok()?,
                create_bare: Regex::new(r"(?is)^\s*CREATE\s+DATABASE\s+(IF\s+NOT\s+EXISTS\s+)?([A-Za-z0-9_$]+)\s*;?\s*$")
                    .ok()?,
                drop: Regex::new(
                    r"(?is)^\s*DROP\s+DATABASE\s+(IF\s+EXISTS\s+)?(?:`([^`]+)`|([A-Za-z0-9_$]+))\s*;?\s*$",
                )
                .ok()?,
                use_db: Regex::new(r"(?is)^\s*USE\s+(?:`([^`]+)`|([A-Za-z0-9_$]+))\s*;?\s*$").ok()?,
            })
        })
        .as_ref()
}

impl IdentityStatement {
    fn parse(statement: &str) -> Option<Self> {
        let patterns = identity_patterns()?;
        if let Some(caps) = patterns.create_quoted.captures(statement) {
            return Some(Self::Create {
                name: caps[2].to_string(),
                if_not_exists: caps[1].to_ascii_uppercase().contains("IF NOT EXISTS"),
            });
        }
        if let Some(caps) = patterns.create_bare.captures(statement) {
            return Some(Self::Create { name: caps[2].to_string(), if_not_exists: caps.get(1).is_some() });
        }
        if let Some(caps) = patterns.drop.captures(statement) {
            let name = caps.get(2).or_else(|| caps.get(3))?.as_str().to_string();
            return Some(Self::Drop { name, if_exists: caps.get(1).is_some() });
        }
        if let Some(caps) = patterns.use_db.captures(statement) {
            let name = caps.get(1).or_else(|| caps.get(2))?.as_str().to_string();
            return Some(Self::Use { name });
        }
        None
    }
}

/// Map MySQL session statements found in foreign dumps onto SQLite.
/// `None` means the statement has no SQLite counterpart and is skipped.
fn translate_statement(statement: &str) -> Option<String> {
    let compact = statement
        .trim()
        .trim_end_matches(';')
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    match compact.as_str() {
        "SETFOREIGN_KEY_CHECKS=0" => Some("PRAGMA foreign_keys = OFF".to_string()),
        "SETFOREIGN_KEY_CHECKS=1" => Some("PRAGMA foreign_keys = ON".to_string()),
        other if other.starts_with("SETNAMES") => None,
        _ => Some(statement.to_string()),
    }
}

fn query_rows(conn: &Connection, sql: &str) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    if stmt.column_count() == 0 {
        stmt.execute([])?;
        return Ok(Vec::new());
    }

    let columns = stmt
        .columns()
        .iter()
        .map(|column| (column.name().to_string(), TypeTag::infer(column.decl_type().unwrap_or_default())))
        .collect::<Vec<_>>();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut typed = Row::new();
        for (index, (name, tag)) in columns.iter().enumerate() {
            typed.push(name.clone(), column_value(row.get_ref(index)?, *tag));
        }
        out.push(typed);
    }
    Ok(out)
}

/// Convert a stored value using the column's declared type tag.
fn column_value(value: ValueRef<'_>, tag: TypeTag) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) if tag == TypeTag::Boolean => Value::Bool(number != 0),
        ValueRef::Integer(number) => Value::Integer(number),
        ValueRef::Real(number) => Value::Float(number),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            match tag {
                TypeTag::Timestamp => match parse_timestamp_text(&text) {
                    Some(at) => Value::Timestamp(at),
                    None => Value::Text(text),
                },
                TypeTag::Structured => match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(json) => Value::Json(json),
                    Err(_) => Value::Text(text),
                },
                _ => Value::Text(text),
            }
        }
    }
}

fn quote_sqlite_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

const SELECT_FILE_RECORDS_SQL: &str = "SELECT id, original_name, filename, path, url, mime_type, size, category,
        entity_type, entity_id, is_orphaned, created_at, updated_at
 FROM file_records";

struct RawFileRecord {
    record: FileRecord,
    created_at: String,
    updated_at: String,
}

fn map_file_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawFileRecord> {
    Ok(RawFileRecord {
        record: FileRecord {
            id: row.get(0)?,
            original_name: row.get(1)?,
            filename: row.get(2)?,
            path: row.get(3)?,
            url: row.get(4)?,
            mime_type: row.get(5)?,
            size: row.get(6)?,
            category: row.get(7)?,
            entity_type: row.get(8)?,
            entity_id: row.get(9)?,
            is_orphaned: row.get(10)?,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        },
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn finish_file_record(raw: RawFileRecord) -> Result<FileRecord> {
    let mut record = raw.record;
    record.created_at = parse_stored_timestamp(&raw.created_at)?;
    record.updated_at = parse_stored_timestamp(&raw.updated_at)?;
    Ok(record)
}

fn parse_stored_timestamp(value: &str) -> Result<OffsetDateTime> {
    parse_timestamp_text(value).ok_or_else(|| anyhow!("invalid stored timestamp: {value}"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(0);
    }
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

/// Recorded version, or 1 when `file_records` exists without any record of
/// having been migrated.
fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }
    if table_exists(conn, "file_records")? {
        return Ok((1, true));
    }
    Ok((0, false))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use dumpvault_core::csv::{export_table, import_table, write_rows, CsvFormat};
    use dumpvault_core::restore::{restore, CancellationToken, RestoreOptions};
    use dumpvault_core::retarget::{prepare_restore_script, RestorePlan};
    use dumpvault_core::serializer::{DatabaseIdentity, DumpMode, DumpOptions, TableFilter};
    use dumpvault_core::{split, DumpStrategy, NativeDump, SqlDialect};
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    const PAGES_SQL: &str = "CREATE TABLE pages (
  id INTEGER PRIMARY KEY,
  title TEXT NOT NULL,
  body TEXT,
  published BOOLEAN NOT NULL,
  meta JSON,
  created_at DATETIME NOT NULL
)";

    fn seed_pages(store: &mut SqliteStore) -> Result<()> {
        store.execute_sql(PAGES_SQL)?;
        store.execute_sql(
            "INSERT INTO pages VALUES
               (1, 'Home', 'line one' || char(10) || 'it''s line two;', 1, '{\"tags\":[\"a\"]}', '2024-01-01 00:00:00'),
               (2, 'Draft', NULL, 0, NULL, '2024-02-03 04:05:06')",
        )?;
        Ok(())
    }

    fn sample_file(name: &str, dir: &Path) -> NewFileRecord {
        NewFileRecord {
            original_name: format!("Original {name}"),
            filename: name.to_string(),
            path: dir.join(name).display().to_string(),
            url: format!("/uploads/gallery/{name}"),
            mime_type: "image/png".to_string(),
            size: 42,
            category: "gallery".to_string(),
            entity_type: Some("page".to_string()),
            entity_id: Some(1),
        }
    }

    // Test IDs: TDB-001
    #[test]
    fn rows_come_back_typed_by_declared_column_type() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        seed_pages(&mut store)?;

        let rows = store.execute_sql("SELECT id, title, body, published, meta, created_at FROM pages ORDER BY id")?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id"), Some(&Value::Integer(1)));
        assert_eq!(rows[0].get("body"), Some(&Value::Text("line one\nit's line two;".to_string())));
        assert_eq!(rows[0].get("published"), Some(&Value::Bool(true)));
        assert_eq!(rows[0].get("meta"), Some(&Value::Json(json!({"tags": ["a"]}))));
        assert_eq!(rows[0].get("created_at"), Some(&Value::Timestamp(datetime!(2024-01-01 00:00:00 UTC))));
        assert_eq!(rows[1].get("body"), Some(&Value::Null));
        assert_eq!(rows[1].get("published"), Some(&Value::Bool(false)));
        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn metadata_queries_describe_tables() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        seed_pages(&mut store)?;
        store.execute_sql("CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT)")?;

        assert_eq!(store.table_names().map_err(|err| anyhow!(err))?, vec!["authors", "pages"]);
        let columns = store.column_metadata("pages").map_err(|err| anyhow!(err))?;
        let tags = columns.iter().map(|column| column.type_tag).collect::<Vec<_>>();
        assert_eq!(
            tags,
            vec![
                TypeTag::Integer,
                TypeTag::Text,
                TypeTag::Text,
                TypeTag::Boolean,
                TypeTag::Structured,
                TypeTag::Timestamp
            ]
        );
        assert!(!columns[1].nullable);
        assert!(columns[2].nullable);
        assert!(store.table_definition("pages").map_err(|err| anyhow!(err))?.starts_with("CREATE TABLE pages"));
        assert!(store.column_metadata("missing").is_err());
        Ok(())
    }

    // Test IDs: TDB-003
    #[test]
    fn identity_statements_manage_database_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = SqliteStore::open_server(dir.path(), "cms")?;

        store.execute_sql("CREATE DATABASE `cms_staging`;")?;
        assert!(database_path(dir.path(), "cms_staging").exists());
        let duplicate = store.execute("CREATE DATABASE `cms_staging`;");
        assert!(duplicate.is_err_and(|err| err.message.contains("already exists")));
        store.execute_sql("CREATE DATABASE /*!32312 IF NOT EXISTS*/ `cms_staging` /*!40100 DEFAULT CHARACTER SET utf8mb4 */;")?;

        store.execute_sql("USE `cms_staging`;")?;
        assert_eq!(store.current_database().as_deref(), Some("cms_staging"));
        assert!(store.execute_sql("USE `nowhere`;").is_err());

        store.execute_sql("DROP DATABASE IF EXISTS `cms_staging`;")?;
        assert!(!database_path(dir.path(), "cms_staging").exists());
        assert_eq!(store.current_database(), None);
        let orphaned = store.execute("SELECT 1");
        assert!(orphaned.is_err_and(|err| err.message.contains("no database selected")));
        store.execute_sql("DROP DATABASE IF EXISTS `cms_staging`;")?;
        assert!(store.execute_sql("DROP DATABASE `cms_staging`;").is_err());
        assert!(store.execute_sql("CREATE DATABASE `../escape`;").is_err());
        Ok(())
    }

    // Test IDs: TDB-004
    #[test]
    fn native_dump_retargets_and_restores_into_another_database() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut source = SqliteStore::open_server(dir.path(), "cms_prod")?;
        seed_pages(&mut source)?;
        let expected = source.execute_sql("SELECT * FROM pages ORDER BY id")?;

        let options = DumpOptions {
            dialect: SqlDialect::Sqlite,
            identity: Some(DatabaseIdentity::all("cms_prod")),
            ..DumpOptions::default()
        };
        let dump = NativeDump::new(&mut source, TableFilter::default(), options)
            .dump(DumpMode::Complete, datetime!(2024-06-01 00:00:00 UTC))?;
        let plan = RestorePlan { database: Some("cms_staging".to_string()), ..RestorePlan::default() };
        let script = prepare_restore_script(&dump.text, &plan)?;
        let statements = split(&script);

        let mut target = SqliteStore::open_server(dir.path(), "cms_prod")?;
        let mut ticks = 0;
        let report = restore(&statements, &mut target, &RestoreOptions::default(), &CancellationToken::new(), |_| {
            ticks += 1;
        });

        assert!(report.is_success(), "{report:?}");
        assert_eq!(report.executed_count, statements.len());
        assert_eq!(ticks, statements.len());
        assert_eq!(report.created_tables, vec!["pages".to_string()]);
        assert_eq!(target.current_database().as_deref(), Some("cms_staging"));
        assert_eq!(target.execute_sql("SELECT * FROM pages ORDER BY id")?, expected);
        assert_eq!(source.execute_sql("SELECT COUNT(*) AS n FROM pages")?[0].get("n"), Some(&Value::Integer(2)));
        Ok(())
    }

    // Test IDs: TDB-013
    #[test]
    fn commented_table_definition_dumps_and_restores() -> Result<()> {
        let mut source = SqliteStore::open(Path::new(":memory:"))?;
        source.execute_sql("CREATE TABLE pages (\n  id INTEGER PRIMARY KEY, -- primary key;\n  title TEXT\n)")?;
        source.execute_sql("INSERT INTO pages (id, title) VALUES (1, 'Home')")?;

        let options = DumpOptions { dialect: SqlDialect::Sqlite, ..DumpOptions::default() };
        let dump = NativeDump::new(&mut source, TableFilter::default(), options)
            .dump(DumpMode::Complete, datetime!(2024-06-01 00:00:00 UTC))?;
        let statements = split(&dump.text);
        assert_eq!(statements.iter().filter(|s| s.as_str().starts_with("CREATE TABLE")).count(), 1);

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        let report = restore(&statements, &mut target, &RestoreOptions::default(), &CancellationToken::new(), |_| {});
        assert!(report.is_success(), "{report:?}");
        assert_eq!(report.created_tables, vec!["pages".to_string()]);
        assert_eq!(
            target.execute_sql("SELECT id, title FROM pages")?,
            vec![Row::new().with("id", 1_i64).with("title", "Home")]
        );
        Ok(())
    }

    // Test IDs: TDB-005
    #[test]
    fn restore_tolerates_existing_tables_and_stops_on_fatal_errors() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let statements = split(
            "CREATE TABLE t (id INTEGER PRIMARY KEY);\n\
             CREATE TABLE t (id INTEGER PRIMARY KEY);\n\
             INSERT INTO t (id) VALUES (1);\n\
             INSERT INTO t (id) VALUES (1);\n\
             INSERT INTO t (id) VALUES (2);\n",
        );
        let report = restore(&statements, &mut store, &RestoreOptions::default(), &CancellationToken::new(), |_| {});

        assert_eq!(report.executed_count, 2);
        assert_eq!(report.tolerated_warnings.len(), 1);
        let fatal = report.fatal.ok_or_else(|| anyhow!("expected a fatal failure"))?;
        assert_eq!(fatal.index, 3);
        assert!(fatal.message.contains("UNIQUE"));
        Ok(())
    }

    // Test IDs: TDB-006
    #[test]
    fn mysql_session_statements_are_translated() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.execute_sql("SET FOREIGN_KEY_CHECKS=0;")?;
        let off = store.execute_sql("PRAGMA foreign_keys")?;
        assert_eq!(off[0].values().next(), Some(&Value::Integer(0)));
        store.execute_sql("SET NAMES utf8mb4;")?;
        store.execute_sql("SET FOREIGN_KEY_CHECKS=1;")?;
        let on = store.execute_sql("PRAGMA foreign_keys")?;
        assert_eq!(on[0].values().next(), Some(&Value::Integer(1)));
        Ok(())
    }

    // Test IDs: TDB-007
    #[test]
    fn migrate_creates_file_records_and_reports_status() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2]);

        store.migrate()?;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, 2);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    // Test IDs: TDB-008
    #[test]
    fn legacy_file_records_table_is_adopted() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert!(status.inferred_from_legacy);

        store.migrate()?;
        assert_eq!(store.schema_status()?.current_version, 2);
        Ok(())
    }

    // Test IDs: TDB-009
    #[test]
    fn file_record_store_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;

        let first = store.insert_file_record(&sample_file("x.png", dir.path()))?;
        let second = store.insert_file_record(&sample_file("y.png", dir.path()))?;
        assert_ne!(first.id, second.id);
        assert!(!first.is_orphaned);

        assert!(store.set_orphaned(first.id, true).map_err(|err| anyhow!(err))?);
        assert!(store.delete_file_record(second.id).map_err(|err| anyhow!(err))?);
        assert!(!store.delete_file_record(second.id).map_err(|err| anyhow!(err))?);

        let records = store.list_file_records().map_err(|err| anyhow!(err))?;
        assert_eq!(records.len(), 1);
        assert!(records[0].is_orphaned);
        assert_eq!(records[0].entity_type.as_deref(), Some("page"));

        let invalid = NewFileRecord { size: -1, ..sample_file("z.png", dir.path()) };
        assert!(store.insert_file_record(&invalid).is_err());
        Ok(())
    }

    // Test IDs: TDB-010
    #[test]
    fn snapshot_and_restore_snapshot_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut source = SqliteStore::open(Path::new(":memory:"))?;
        seed_pages(&mut source)?;
        let snapshot = dir.path().join("snapshots/cms.sqlite3");
        source.snapshot_database(&snapshot)?;

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        target.restore_snapshot(&snapshot)?;
        assert_eq!(target.execute_sql("SELECT * FROM pages")?.len(), 2);
        assert!(target.restore_snapshot(&dir.path().join("missing.sqlite3")).is_err());
        Ok(())
    }

    // Test IDs: TDB-011
    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, 2);
        Ok(())
    }

    // Test IDs: TDB-012
    #[test]
    fn csv_round_trip_through_the_store() -> Result<()> {
        let mut source = SqliteStore::open(Path::new(":memory:"))?;
        seed_pages(&mut source)?;
        let rows = source.execute_sql("SELECT * FROM pages ORDER BY id")?;
        let columns = source.table_columns("pages")?.into_iter().map(|column| column.name).collect::<Vec<_>>();
        let text = export_table(&rows, &columns, &CsvFormat::default())?;

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        target.execute_sql(PAGES_SQL)?;
        let parsed = import_table(&text, None, &CsvFormat::default())?;
        let report = write_rows(&mut target, "pages", &parsed.columns, &parsed.rows, 1, SqlDialect::Sqlite);
        assert_eq!(report.written, 2);
        assert!(report.failed_batches.is_empty());
        assert_eq!(target.execute_sql("SELECT * FROM pages ORDER BY id")?, rows);
        Ok(())
    }
}
