//! Schema and data serialization into SQL dump text.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::codec::{format_csv_timestamp, quote_identifier, to_sql_literal, SqlDialect};
use crate::connection::{ConnectionError, SqlConnection};
use crate::value::{Row, TableDescriptor, TypeTag};

#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error("failed to list tables: {0}")]
    ListTables(ConnectionError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("external dump tool `{program}` failed ({status}): {stderr}")]
    ExternalTool { program: String, status: String, stderr: String },
    #[error("external dump output is not UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DumpMode {
    Schema,
    Data,
    Complete,
}

impl DumpMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Data => "data",
            Self::Complete => "complete",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "schema" => Some(Self::Schema),
            "data" => Some(Self::Data),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }

    #[must_use]
    pub fn includes_schema(self) -> bool {
        matches!(self, Self::Schema | Self::Complete)
    }

    #[must_use]
    pub fn includes_data(self) -> bool {
        matches!(self, Self::Data | Self::Complete)
    }
}

/// Which tables take part in a dump or export.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct TableFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TableFilter {
    #[must_use]
    pub fn allows(&self, table: &str) -> bool {
        if self.exclude.iter().any(|name| name == table) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|name| name == table)
    }
}

/// Database-identity statements prepended to a complete dump, each
/// independently toggleable.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DatabaseIdentity {
    pub name: String,
    pub drop_database: bool,
    pub create_database: bool,
    pub use_database: bool,
}

impl DatabaseIdentity {
    #[must_use]
    pub fn all(name: impl Into<String>) -> Self {
        Self { name: name.into(), drop_database: true, create_database: true, use_database: true }
    }

    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        let name = escape_database_name(&self.name);
        let mut statements = Vec::new();
        if self.drop_database {
            statements.push(format!("DROP DATABASE IF EXISTS `{name}`;"));
        }
        if self.create_database {
            statements.push(format!("CREATE DATABASE `{name}`;"));
        }
        if self.use_database {
            statements.push(format!("USE `{name}`;"));
        }
        statements
    }
}

fn escape_database_name(name: &str) -> String {
    name.replace('`', "``")
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DumpOptions {
    pub dialect: SqlDialect,
    /// Emit `DROP TABLE IF EXISTS` before each definition.
    pub drop_tables: bool,
    /// Wrap the load in statements that suspend foreign-key enforcement.
    pub disable_foreign_keys: bool,
    pub identity: Option<DatabaseIdentity>,
    /// Split a table's rows across several INSERTs of at most this size.
    pub max_rows_per_insert: Option<usize>,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            dialect: SqlDialect::default(),
            drop_tables: true,
            disable_foreign_keys: true,
            identity: None,
            max_rows_per_insert: None,
        }
    }
}

/// Everything captured about one table for the duration of one dump.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSnapshot {
    pub descriptor: TableDescriptor,
    pub definition: Option<String>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capture {
    pub database: Option<String>,
    pub tables: Vec<TableSnapshot>,
    pub warnings: Vec<String>,
}

impl Capture {
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|table| table.rows.len()).sum()
    }
}

/// Result of serializing a capture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dump {
    pub text: String,
    pub mode: DumpMode,
    pub database: Option<String>,
    pub table_count: usize,
    pub row_count: usize,
    pub warnings: Vec<String>,
}

/// Read descriptors, definitions and (optionally) rows for every allowed
/// table. A table that cannot be read is skipped with a warning.
///
/// # Errors
/// Returns [`DumpError::ListTables`] when the table list itself cannot be read.
pub fn capture_tables<C>(
    conn: &mut C,
    filter: &TableFilter,
    mode: DumpMode,
) -> Result<Capture, DumpError>
where
    C: SqlConnection + ?Sized,
{
    let names = conn.table_names().map_err(DumpError::ListTables)?;
    let mut capture = Capture { database: conn.current_database(), ..Capture::default() };

    for name in names.into_iter().filter(|name| filter.allows(name)) {
        let columns = match conn.column_metadata(&name) {
            Ok(columns) if !columns.is_empty() => columns,
            Ok(_) => {
                warn_skip(&mut capture, &name, "table has no readable columns");
                continue;
            }
            Err(err) => {
                warn_skip(&mut capture, &name, &format!("metadata unreadable: {err}"));
                continue;
            }
        };
        let descriptor = TableDescriptor { name: name.clone(), columns };

        let definition = if mode.includes_schema() {
            match conn.table_definition(&name) {
                Ok(definition) => Some(definition),
                Err(err) => {
                    warn_skip(&mut capture, &name, &format!("definition unreadable: {err}"));
                    continue;
                }
            }
        } else {
            None
        };

        let rows = if mode.includes_data() {
            match conn.execute(&select_all_sql(&descriptor)) {
                Ok(rows) => rows,
                Err(err) => {
                    warn_skip(&mut capture, &name, &format!("rows unreadable: {err}"));
                    continue;
                }
            }
        } else {
            Vec::new()
        };

        tracing::debug!(table = %name, rows = rows.len(), "captured table");
        capture.tables.push(TableSnapshot { descriptor, definition, rows });
    }

    Ok(capture)
}

fn warn_skip(capture: &mut Capture, table: &str, reason: &str) {
    tracing::warn!(table = %table, reason = %reason, "skipping table");
    capture.warnings.push(format!("skipped table {table}: {reason}"));
}

fn select_all_sql(descriptor: &TableDescriptor) -> String {
    let columns = descriptor
        .columns
        .iter()
        .map(|column| quote_identifier(&column.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT {columns} FROM {}", quote_identifier(&descriptor.name))
}

/// Schema text: optional drop plus the structural definition per table.
#[must_use]
pub fn serialize_schema(tables: &[TableSnapshot], options: &DumpOptions) -> String {
    let mut out = String::new();
    for table in tables {
        let name = quote_identifier(&table.descriptor.name);
        if options.drop_tables {
            let _ = writeln!(out, "DROP TABLE IF EXISTS {name};");
        }
        let definition = table
            .definition
            .as_deref()
            .and_then(|definition| {
                let cleaned = clean_definition(definition, options.dialect);
                if cleaned.is_none() {
                    tracing::warn!(table = %table.descriptor.name, "definition keeps a terminator before a line break, synthesizing");
                }
                cleaned
            })
            .unwrap_or_else(|| synthesize_definition(&table.descriptor, options.dialect));
        let _ = writeln!(out, "{definition};");
        out.push('\n');
    }
    out
}

/// Data text: one multi-row INSERT per non-empty table. Empty tables emit
/// nothing.
#[must_use]
pub fn serialize_data(tables: &[TableSnapshot], options: &DumpOptions) -> String {
    let mut out = String::new();
    for table in tables.iter().filter(|table| !table.rows.is_empty()) {
        let chunk_size = options.max_rows_per_insert.unwrap_or(table.rows.len()).max(1);
        for chunk in table.rows.chunks(chunk_size) {
            out.push_str(&insert_statement(&table.descriptor, chunk, options.dialect));
            out.push('\n');
        }
    }
    out
}

/// One `INSERT INTO t (cols) VALUES (...), (...);` statement.
#[must_use]
pub fn insert_statement(descriptor: &TableDescriptor, rows: &[Row], dialect: SqlDialect) -> String {
    let columns = descriptor
        .columns
        .iter()
        .map(|column| quote_identifier(&column.name))
        .collect::<Vec<_>>()
        .join(",");
    let tuples = rows
        .iter()
        .map(|row| {
            let values = descriptor
                .columns
                .iter()
                .map(|column| {
                    row.get(&column.name)
                        .map_or_else(|| "NULL".to_string(), |value| to_sql_literal(value, dialect))
                })
                .collect::<Vec<_>>()
                .join(",");
            format!("({values})")
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({columns}) VALUES {tuples};", quote_identifier(&descriptor.name))
}

/// Identity statements, then schema, then data.
#[must_use]
pub fn serialize_complete(tables: &[TableSnapshot], options: &DumpOptions) -> String {
    let mut out = String::new();
    if let Some(identity) = &options.identity {
        for statement in identity.statements() {
            out.push_str(&statement);
            out.push('\n');
        }
        out.push('\n');
    }
    out.push_str(&serialize_schema(tables, options));
    out.push_str(&serialize_data(tables, options));
    out
}

/// Render a full dump document: header comments, foreign-key guards and the
/// body for `mode`.
#[must_use]
pub fn render_dump(
    capture: &Capture,
    mode: DumpMode,
    options: &DumpOptions,
    captured_at: OffsetDateTime,
) -> Dump {
    let mut text = String::new();
    let _ = writeln!(text, "-- dumpvault dump");
    let _ = writeln!(text, "-- database: {}", capture.database.as_deref().unwrap_or("unknown"));
    let _ = writeln!(text, "-- mode: {}", mode.as_str());
    let _ = writeln!(text, "-- dialect: {}", options.dialect.as_str());
    let _ = writeln!(text, "-- captured-at: {}", format_csv_timestamp(captured_at));
    text.push('\n');

    if mode == DumpMode::Complete {
        if let Some(identity) = &options.identity {
            for statement in identity.statements() {
                text.push_str(&statement);
                text.push('\n');
            }
            text.push('\n');
        }
    }

    if options.disable_foreign_keys {
        text.push_str(foreign_key_toggle(options.dialect, false));
        text.push('\n');
    }
    match mode {
        DumpMode::Schema => text.push_str(&serialize_schema(&capture.tables, options)),
        DumpMode::Data => text.push_str(&serialize_data(&capture.tables, options)),
        DumpMode::Complete => {
            text.push_str(&serialize_schema(&capture.tables, options));
            text.push_str(&serialize_data(&capture.tables, options));
        }
    }
    if options.disable_foreign_keys {
        text.push_str(foreign_key_toggle(options.dialect, true));
        text.push('\n');
    }

    Dump {
        text,
        mode,
        database: capture.database.clone(),
        table_count: capture.tables.len(),
        row_count: if mode.includes_data() { capture.row_count() } else { 0 },
        warnings: capture.warnings.clone(),
    }
}

fn foreign_key_toggle(dialect: SqlDialect, enabled: bool) -> &'static str {
    match (dialect, enabled) {
        (SqlDialect::MySql, false) => "SET FOREIGN_KEY_CHECKS=0;",
        (SqlDialect::MySql, true) => "SET FOREIGN_KEY_CHECKS=1;",
        (SqlDialect::Sqlite, false) => "PRAGMA foreign_keys=OFF;",
        (SqlDialect::Sqlite, true) => "PRAGMA foreign_keys=ON;",
    }
}

/// Strip comments from a live table definition.
///
/// Returns `None` when the cleaned text still has a `;` directly before a
/// line break, since the splitter would cut the statement there.
fn clean_definition(definition: &str, dialect: SqlDialect) -> Option<String> {
    let mut out = String::with_capacity(definition.len());
    let mut quote: Option<char> = None;
    let mut chars = definition.chars().peekable();
    while let Some(ch) = chars.next() {
        if let Some(open) = quote {
            out.push(ch);
            if ch == '\\' && dialect == SqlDialect::MySql && open != '`' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            '\'' | '"' | '`' => {
                quote = Some(ch);
                out.push(ch);
            }
            '-' if chars.peek() == Some(&'-') => skip_line(&mut chars),
            '#' if dialect == SqlDialect::MySql => skip_line(&mut chars),
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for next in chars.by_ref() {
                    if previous == '*' && next == '/' {
                        break;
                    }
                    previous = next;
                }
                out.push(' ');
            }
            _ => out.push(ch),
        }
    }

    let cleaned = out.trim().trim_end_matches(';').trim_end();
    if cleaned.contains(";\n") || cleaned.contains(";\r") {
        return None;
    }
    Some(cleaned.to_string())
}

fn skip_line(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    while chars.peek().is_some_and(|next| *next != '\n') {
        chars.next();
    }
}

fn synthesize_definition(descriptor: &TableDescriptor, dialect: SqlDialect) -> String {
    let columns = descriptor
        .columns
        .iter()
        .map(|column| {
            let declared = match (column.type_tag, dialect) {
                (TypeTag::Boolean, SqlDialect::MySql) => "TINYINT(1)",
                (TypeTag::Boolean, SqlDialect::Sqlite) => "BOOLEAN",
                (TypeTag::Integer, SqlDialect::MySql) => "BIGINT",
                (TypeTag::Integer, SqlDialect::Sqlite) => "INTEGER",
                (TypeTag::Float, SqlDialect::MySql) => "DOUBLE",
                (TypeTag::Float, SqlDialect::Sqlite) => "REAL",
                (TypeTag::Timestamp, _) => "DATETIME",
                (TypeTag::Structured, _) => "JSON",
                (TypeTag::Text | TypeTag::Null, _) => "TEXT",
            };
            let null = if column.nullable { "" } else { " NOT NULL" };
            format!("  {} {declared}{null}", quote_identifier(&column.name))
        })
        .collect::<Vec<_>>()
        .join(",\n");
    format!("CREATE TABLE {} (\n{columns}\n)", quote_identifier(&descriptor.name))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::macros::datetime;

    use super::*;
    use crate::splitter::split;
    use crate::value::{ColumnDescriptor, Value};

    fn fixture_table() -> TableSnapshot {
        TableSnapshot {
            descriptor: TableDescriptor {
                name: "T".to_string(),
                columns: vec![
                    ColumnDescriptor::new("id", TypeTag::Integer, false),
                    ColumnDescriptor::new("name", TypeTag::Text, true),
                    ColumnDescriptor::new("active", TypeTag::Boolean, false),
                    ColumnDescriptor::new("created", TypeTag::Timestamp, false),
                ],
            },
            definition: Some(
                "CREATE TABLE T (\n  id INTEGER PRIMARY KEY,\n  name TEXT,\n  active BOOLEAN NOT NULL,\n  created DATETIME NOT NULL\n)"
                    .to_string(),
            ),
            rows: vec![Row::new()
                .with("id", 1_i64)
                .with("name", "a")
                .with("active", true)
                .with("created", datetime!(2024-01-01 00:00:00 UTC))],
        }
    }

    // Test IDs: TSER-001
    #[test]
    fn data_mode_emits_one_insert_per_table() {
        let text = serialize_data(&[fixture_table()], &DumpOptions::default());
        assert_eq!(
            text,
            "INSERT INTO T (id,name,active,created) VALUES (1,'a',1,'2024-01-01 00:00:00');\n"
        );

        let statements = split(&text);
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0].as_str(),
            "INSERT INTO T (id,name,active,created) VALUES (1,'a',1,'2024-01-01 00:00:00');"
        );
    }

    // Test IDs: TSER-002
    #[test]
    fn empty_tables_emit_no_insert() {
        let mut table = fixture_table();
        table.rows.clear();
        assert!(serialize_data(&[table], &DumpOptions::default()).is_empty());
    }

    // Test IDs: TSER-003
    #[test]
    fn schema_mode_emits_drop_then_definition() {
        let text = serialize_schema(&[fixture_table()], &DumpOptions::default());
        let statements = split(&text);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].as_str(), "DROP TABLE IF EXISTS T;");
        assert!(statements[1].as_str().starts_with("CREATE TABLE T ("));

        let options = DumpOptions { drop_tables: false, ..DumpOptions::default() };
        assert_eq!(split(&serialize_schema(&[fixture_table()], &options)).len(), 1);
    }

    // Test IDs: TSER-004
    #[test]
    fn complete_mode_prepends_toggleable_identity_statements() {
        let options = DumpOptions {
            identity: Some(DatabaseIdentity {
                name: "cms".to_string(),
                drop_database: false,
                create_database: true,
                use_database: true,
            }),
            ..DumpOptions::default()
        };
        let statements = split(&serialize_complete(&[fixture_table()], &options));
        let texts = statements.iter().map(|s| s.as_str().to_string()).collect::<Vec<_>>();
        assert_eq!(texts[0], "CREATE DATABASE `cms`;");
        assert_eq!(texts[1], "USE `cms`;");
        assert_eq!(texts[2], "DROP TABLE IF EXISTS T;");
        assert!(texts[3].starts_with("CREATE TABLE T"));
        assert!(texts[4].starts_with("INSERT INTO T"));
        assert_eq!(texts.len(), 5);
    }

    // Test IDs: TSER-005
    #[test]
    fn max_rows_per_insert_chunks_rows() {
        let mut table = fixture_table();
        let row = table.rows[0].clone();
        table.rows = vec![row.clone(), row.clone(), row];
        let options = DumpOptions { max_rows_per_insert: Some(2), ..DumpOptions::default() };
        let statements = split(&serialize_data(&[table], &options));
        assert_eq!(statements.len(), 2);
        assert!(statements[0].as_str().contains("), ("));
    }

    // Test IDs: TSER-006
    #[test]
    fn render_dump_wraps_body_with_header_and_guards() {
        let capture = Capture {
            database: Some("cms".to_string()),
            tables: vec![fixture_table()],
            warnings: vec!["skipped table broken: metadata unreadable".to_string()],
        };
        let options = DumpOptions {
            dialect: SqlDialect::Sqlite,
            identity: Some(DatabaseIdentity::all("cms")),
            ..DumpOptions::default()
        };
        let dump = render_dump(&capture, DumpMode::Complete, &options, datetime!(2024-05-01 08:00:00 UTC));
        assert!(dump.text.starts_with("-- dumpvault dump\n-- database: cms\n"));
        assert_eq!(dump.table_count, 1);
        assert_eq!(dump.row_count, 1);
        assert_eq!(dump.warnings.len(), 1);

        let statements = split(&dump.text);
        let texts = statements.iter().map(|s| s.as_str()).collect::<Vec<_>>();
        assert_eq!(texts[0], "DROP DATABASE IF EXISTS `cms`;");
        assert_eq!(texts[3], "PRAGMA foreign_keys=OFF;");
        assert_eq!(texts.last().copied(), Some("PRAGMA foreign_keys=ON;"));
        assert_eq!(texts.len(), 8);
    }

    // Test IDs: TSER-007
    #[test]
    fn missing_definition_is_synthesized_from_descriptor() {
        let mut table = fixture_table();
        table.definition = None;
        let text = serialize_schema(&[table], &DumpOptions { drop_tables: false, ..DumpOptions::default() });
        assert!(text.contains("CREATE TABLE T (\n  id BIGINT NOT NULL,\n  name TEXT,"));
        assert_eq!(split(&text).len(), 1);
    }

    // Test IDs: TSER-010
    #[test]
    fn commented_definition_stays_one_statement() {
        let mut table = fixture_table();
        table.definition = Some(
            "-- pages table;\nCREATE TABLE T (\n  id INTEGER PRIMARY KEY, -- primary key;\n  name TEXT DEFAULT '--;', /* label; */\n  active BOOLEAN NOT NULL,\n  created DATETIME NOT NULL\n);"
                .to_string(),
        );
        let text = serialize_schema(&[table], &DumpOptions { drop_tables: false, ..DumpOptions::default() });
        let statements = split(&text);
        assert_eq!(statements.len(), 1);
        let statement = statements[0].as_str();
        assert!(statement.starts_with("CREATE TABLE T ("));
        assert!(statement.contains("name TEXT DEFAULT '--;',"));
        assert!(!statement.contains("primary key;"));
        assert!(!statement.contains("label"));
    }

    // Test IDs: TSER-011
    #[test]
    fn definition_with_terminator_in_literal_is_synthesized() {
        let mut table = fixture_table();
        table.definition = Some("CREATE TABLE T (\n  id INTEGER,\n  name TEXT DEFAULT 'a;\nb'\n)".to_string());
        let text = serialize_schema(&[table], &DumpOptions { drop_tables: false, ..DumpOptions::default() });
        assert_eq!(split(&text).len(), 1);
        assert!(text.contains("id BIGINT NOT NULL"));

        assert_eq!(
            clean_definition("CREATE TABLE a (id INT) # note;\n", SqlDialect::MySql).as_deref(),
            Some("CREATE TABLE a (id INT)")
        );
        assert_eq!(
            clean_definition("CREATE TABLE a (s TEXT DEFAULT 'it\\'s -- x')", SqlDialect::MySql).as_deref(),
            Some("CREATE TABLE a (s TEXT DEFAULT 'it\\'s -- x')")
        );
    }

    // Test IDs: TSER-008
    #[test]
    fn filter_include_and_exclude() {
        let filter = TableFilter {
            include: vec!["users".to_string(), "pages".to_string()],
            exclude: vec!["pages".to_string()],
        };
        assert!(filter.allows("users"));
        assert!(!filter.allows("pages"));
        assert!(!filter.allows("sessions"));
        assert!(TableFilter::default().allows("anything"));
    }

    // Test IDs: TSER-009
    proptest! {
        #[test]
        fn property_split_yields_one_statement_per_emitted_statement(
            texts in proptest::collection::vec("[a-z;'\\\\\n\r ]{0,16}", 1..6),
            tables in 1_usize..4,
            sqlite in any::<bool>(),
        ) {
            let dialect = if sqlite { SqlDialect::Sqlite } else { SqlDialect::MySql };
            let snapshots = (0..tables)
                .map(|index| TableSnapshot {
                    descriptor: TableDescriptor {
                        name: format!("t{index}"),
                        columns: vec![
                            ColumnDescriptor::new("id", TypeTag::Integer, false),
                            ColumnDescriptor::new("body", TypeTag::Text, true),
                        ],
                    },
                    definition: Some(format!("CREATE TABLE t{index} (\n  id INTEGER,\n  body TEXT\n)")),
                    rows: texts
                        .iter()
                        .enumerate()
                        .map(|(id, text)| {
                            Row::new()
                                .with("id", i64::try_from(id).unwrap_or(i64::MAX))
                                .with("body", Value::Text(text.clone()))
                        })
                        .collect(),
                })
                .collect::<Vec<_>>();
            let options = DumpOptions { dialect, ..DumpOptions::default() };
            let statements = split(&serialize_complete(&snapshots, &options));
            // DROP + CREATE + INSERT per table.
            prop_assert_eq!(statements.len(), tables * 3);
        }
    }
}
