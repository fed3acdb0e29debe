//! CSV export and import of table data.
//!
//! Fields go through the value codec in both directions. Imports validate
//! the shape of every record before anything is written, then insert in
//! bounded batches; a failed batch is logged and skipped.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::{csv_field_text, from_csv_field, quote_identifier, SqlDialect};
use crate::connection::SqlConnection;
use crate::serializer::{capture_tables, insert_statement, DumpError, DumpMode, TableFilter};
use crate::value::{ColumnDescriptor, Row, TableDescriptor, TypeTag};

#[derive(Debug, thiserror::Error)]
pub enum CsvError {
    #[error("row {row}: expected {expected} fields, found {found}")]
    ColumnCountMismatch { row: usize, expected: usize, found: usize },
    #[error("no header row and no column names supplied")]
    MissingColumns,
    #[error("invalid csv format: {0}")]
    InvalidFormat(String),
    #[error("failed to read columns for table {table}: {message}")]
    Metadata { table: String, message: String },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("{path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error(transparent)]
    Dump(#[from] DumpError),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CsvFormat {
    pub delimiter: char,
    pub quote: char,
    /// First record carries column names.
    pub header: bool,
    /// Rows per INSERT during import.
    pub batch_size: usize,
}

impl Default for CsvFormat {
    fn default() -> Self {
        Self { delimiter: ',', quote: '"', header: true, batch_size: 500 }
    }
}

impl CsvFormat {
    /// # Errors
    /// Returns [`CsvError::InvalidFormat`] for unusable delimiter/quote pairs
    /// or a zero batch size.
    pub fn validate(&self) -> Result<(), CsvError> {
        self.delimiter_byte()?;
        self.quote_byte()?;
        if self.delimiter == self.quote {
            return Err(CsvError::InvalidFormat("delimiter and quote must differ".to_string()));
        }
        if matches!(self.delimiter, '\n' | '\r') || matches!(self.quote, '\n' | '\r') {
            return Err(CsvError::InvalidFormat("delimiter and quote cannot be line breaks".to_string()));
        }
        if self.batch_size == 0 {
            return Err(CsvError::InvalidFormat("batch_size must be at least 1".to_string()));
        }
        Ok(())
    }

    fn delimiter_byte(&self) -> Result<u8, CsvError> {
        ascii_byte(self.delimiter, "delimiter")
    }

    fn quote_byte(&self) -> Result<u8, CsvError> {
        ascii_byte(self.quote, "quote")
    }

    fn writer(&self) -> Result<csv::Writer<Vec<u8>>, CsvError> {
        Ok(csv::WriterBuilder::new()
            .delimiter(self.delimiter_byte()?)
            .quote(self.quote_byte()?)
            .quote_style(csv::QuoteStyle::NonNumeric)
            .has_headers(false)
            .from_writer(Vec::new()))
    }

    fn reader<'a>(&self, text: &'a str) -> Result<csv::Reader<&'a [u8]>, CsvError> {
        Ok(csv::ReaderBuilder::new()
            .delimiter(self.delimiter_byte()?)
            .quote(self.quote_byte()?)
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes()))
    }
}

fn ascii_byte(ch: char, role: &str) -> Result<u8, CsvError> {
    u8::try_from(ch)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| CsvError::InvalidFormat(format!("{role} must be a single ASCII character")))
}

/// Render rows as CSV text, one record per row, in `columns` order.
///
/// Every field that is not a number is quoted, so a NULL is written as an
/// empty quoted field and never produces a blank line.
///
/// # Errors
/// Returns [`CsvError::InvalidFormat`] for a non-ASCII delimiter or quote.
pub fn export_table(rows: &[Row], columns: &[String], format: &CsvFormat) -> Result<String, CsvError> {
    let mut writer = format.writer()?;
    if format.header {
        writer.write_record(columns)?;
    }
    for row in rows {
        writer.write_record(
            columns.iter().map(|name| row.get(name).map_or_else(String::new, csv_field_text)),
        )?;
    }
    let bytes = writer.into_inner().map_err(|err| CsvError::Csv(csv::Error::from(err.into_error())))?;
    String::from_utf8(bytes).map_err(|err| CsvError::InvalidFormat(err.to_string()))
}

/// Split CSV text into records of unquoted field strings.
///
/// A quoted field may contain the delimiter, line breaks and doubled quote
/// characters. Blank lines between records are ignored. A quoted field left
/// open runs to the end of the input.
///
/// # Errors
/// Returns [`CsvError::Csv`] when the input cannot be read as UTF-8.
pub fn parse_records(text: &str, format: &CsvFormat) -> Result<Vec<Vec<String>>, CsvError> {
    let mut reader = format.reader(text)?;
    let mut records = Vec::new();
    for record in reader.records() {
        records.push(record?.iter().map(str::to_string).collect());
    }
    Ok(records)
}

/// Rows parsed from CSV text together with the column names they use.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTable {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// Parse CSV text into typed rows.
///
/// Column names come from the header when `format.header` is set, otherwise
/// from `expected_columns`. Every record is checked against the column
/// count before any row is returned.
///
/// # Errors
/// Returns [`CsvError::MissingColumns`] without a header or supplied
/// names, and [`CsvError::ColumnCountMismatch`] naming the first offending
/// row (1-based, counting the header).
pub fn import_table(
    text: &str,
    expected_columns: Option<&[String]>,
    format: &CsvFormat,
) -> Result<ParsedTable, CsvError> {
    format.validate()?;
    let mut records = parse_records(text, format)?.into_iter();

    let (columns, first_row_number) = if format.header {
        match records.next() {
            Some(header) => (header, 2),
            None => (expected_columns.map(<[String]>::to_vec).ok_or(CsvError::MissingColumns)?, 2),
        }
    } else {
        (expected_columns.map(<[String]>::to_vec).ok_or(CsvError::MissingColumns)?, 1)
    };
    if columns.is_empty() {
        return Err(CsvError::MissingColumns);
    }
    if let Some(expected) = expected_columns {
        if format.header && expected.len() != columns.len() {
            return Err(CsvError::ColumnCountMismatch { row: 1, expected: expected.len(), found: columns.len() });
        }
    }

    let records = records.collect::<Vec<_>>();
    for (offset, record) in records.iter().enumerate() {
        if record.len() != columns.len() {
            return Err(CsvError::ColumnCountMismatch {
                row: first_row_number + offset,
                expected: columns.len(),
                found: record.len(),
            });
        }
    }

    let rows = records
        .into_iter()
        .map(|record| {
            columns
                .iter()
                .cloned()
                .zip(record.iter().map(|field| from_csv_field(field)))
                .collect::<Row>()
        })
        .collect();
    Ok(ParsedTable { columns, rows })
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BatchFailure {
    /// Zero-based index of the first row of the batch.
    pub first_row: usize,
    pub rows: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ImportReport {
    pub table: String,
    pub attempted: usize,
    pub written: usize,
    pub failed_batches: Vec<BatchFailure>,
}

/// Insert rows in batches of `batch_size`; failed batches are skipped.
pub fn write_rows<C>(
    conn: &mut C,
    table: &str,
    columns: &[String],
    rows: &[Row],
    batch_size: usize,
    dialect: SqlDialect,
) -> ImportReport
where
    C: SqlConnection + ?Sized,
{
    let descriptor = TableDescriptor {
        name: table.to_string(),
        columns: columns
            .iter()
            .map(|name| ColumnDescriptor::new(name.clone(), TypeTag::Text, true))
            .collect(),
    };
    let mut report = ImportReport { table: table.to_string(), attempted: rows.len(), ..ImportReport::default() };

    for (batch_index, batch) in rows.chunks(batch_size.max(1)).enumerate() {
        let first_row = batch_index * batch_size.max(1);
        match conn.execute(&insert_statement(&descriptor, batch, dialect)) {
            Ok(_) => report.written += batch.len(),
            Err(err) => {
                tracing::warn!(table, first_row, rows = batch.len(), error = %err, "skipping failed batch");
                report.failed_batches.push(BatchFailure {
                    first_row,
                    rows: batch.len(),
                    message: err.message,
                });
            }
        }
    }

    tracing::info!(table, attempted = report.attempted, written = report.written, "csv import finished");
    report
}

/// Remove all rows from `table` ahead of an import.
///
/// # Errors
/// Returns the database error when the statement fails.
pub fn truncate_table<C>(conn: &mut C, table: &str, dialect: SqlDialect) -> Result<(), crate::connection::ConnectionError>
where
    C: SqlConnection + ?Sized,
{
    let statement = match dialect {
        SqlDialect::MySql => format!("TRUNCATE TABLE {}", quote_identifier(table)),
        SqlDialect::Sqlite => format!("DELETE FROM {}", quote_identifier(table)),
    };
    conn.execute(&statement).map(|_| ())
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TableExport {
    pub table: String,
    pub rows: usize,
    pub file: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct CsvExportSummary {
    pub directory: PathBuf,
    pub tables: Vec<TableExport>,
    pub warnings: Vec<String>,
}

impl CsvExportSummary {
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|table| table.rows).sum()
    }
}

/// Write one `<table>.csv` per allowed table into `directory`.
///
/// # Errors
/// Returns an error when tables cannot be listed or files cannot be written.
pub fn export_tables_to_dir<C>(
    conn: &mut C,
    directory: &Path,
    filter: &TableFilter,
    format: &CsvFormat,
) -> Result<CsvExportSummary, CsvError>
where
    C: SqlConnection + ?Sized,
{
    format.validate()?;
    fs::create_dir_all(directory).map_err(|source| CsvError::Io { path: directory.to_path_buf(), source })?;
    let capture = capture_tables(conn, filter, DumpMode::Data)?;

    let mut summary = CsvExportSummary {
        directory: directory.to_path_buf(),
        warnings: capture.warnings.clone(),
        ..CsvExportSummary::default()
    };
    for table in &capture.tables {
        let file = directory.join(format!("{}.csv", table.descriptor.name));
        let text = export_table(&table.rows, &table.descriptor.column_names(), format)?;
        fs::write(&file, text).map_err(|source| CsvError::Io { path: file.clone(), source })?;
        tracing::info!(table = %table.descriptor.name, rows = table.rows.len(), file = %file.display(), "exported table");
        summary.tables.push(TableExport { table: table.descriptor.name.clone(), rows: table.rows.len(), file });
    }
    Ok(summary)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CsvImportOptions {
    pub format: CsvFormat,
    pub dialect: SqlDialect,
    /// Empty each table before inserting.
    pub truncate: bool,
}

/// Import one CSV file into `table`.
///
/// Without a header row the column names are read from the live table.
///
/// # Errors
/// Returns an error when the file cannot be read, columns cannot be
/// determined, or any record has the wrong shape. Failed insert batches are
/// reported in the returned [`ImportReport`], not as errors.
pub fn import_file<C>(
    conn: &mut C,
    file: &Path,
    table: &str,
    options: &CsvImportOptions,
) -> Result<ImportReport, CsvError>
where
    C: SqlConnection + ?Sized,
{
    let text = fs::read_to_string(file).map_err(|source| CsvError::Io { path: file.to_path_buf(), source })?;
    let live_columns = if options.format.header {
        None
    } else {
        let columns = conn
            .column_metadata(table)
            .map_err(|err| CsvError::Metadata { table: table.to_string(), message: err.message })?;
        Some(columns.into_iter().map(|column| column.name).collect::<Vec<_>>())
    };
    let parsed = import_table(&text, live_columns.as_deref(), &options.format)?;

    if options.truncate {
        truncate_table(conn, table, options.dialect)
            .map_err(|err| CsvError::Metadata { table: table.to_string(), message: err.message })?;
    }
    Ok(write_rows(conn, table, &parsed.columns, &parsed.rows, options.format.batch_size, options.dialect))
}

/// Import every `<table>.csv` in `directory`, in file-name order.
///
/// # Errors
/// Returns the first error from [`import_file`].
pub fn import_dir<C>(
    conn: &mut C,
    directory: &Path,
    options: &CsvImportOptions,
) -> Result<Vec<ImportReport>, CsvError>
where
    C: SqlConnection + ?Sized,
{
    let mut files = fs::read_dir(directory)
        .map_err(|source| CsvError::Io { path: directory.to_path_buf(), source })?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv")))
        .collect::<Vec<_>>();
    files.sort();

    let mut reports = Vec::new();
    for file in files {
        let Some(table) = file.file_stem().and_then(|stem| stem.to_str()).map(str::to_string) else {
            continue;
        };
        reports.push(import_file(conn, &file, &table, options)?);
    }
    Ok(reports)
}
