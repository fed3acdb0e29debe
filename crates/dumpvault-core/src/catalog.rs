//! Backup artifacts on disk: naming, discovery, validation and writing.
//!
//! A backup is a group of files sharing a base name
//! `<database>-<environment>-backup-<timestamp>`:
//!
//! - a payload, `<base>-<type>.sql` or a `<base>-csv/` directory
//! - an optional archive, `<base>-<type>.sql.gz`
//! - an optional sidecar, `<base>-<type>-info.json`
//!
//! When only the archive exists it is the payload.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::codec::{format_csv_timestamp, parse_timestamp_text};
use crate::splitter::split;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("{path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("backup not found: {0}")]
    NotFound(String),
    #[error("{path}: payload is not valid UTF-8")]
    Encoding { path: PathBuf },
    #[error("failed to encode metadata: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CatalogError + '_ {
    move |source| CatalogError::Io { path: path.to_path_buf(), source }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Schema,
    Data,
    Complete,
    Csv,
}

impl BackupType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Data => "data",
            Self::Complete => "complete",
            Self::Csv => "csv",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "schema" => Some(Self::Schema),
            "data" => Some(Self::Data),
            "complete" => Some(Self::Complete),
            "csv" => Some(Self::Csv),
            _ => None,
        }
    }
}

impl From<crate::serializer::DumpMode> for BackupType {
    fn from(mode: crate::serializer::DumpMode) -> Self {
        match mode {
            crate::serializer::DumpMode::Schema => Self::Schema,
            crate::serializer::DumpMode::Data => Self::Data,
            crate::serializer::DumpMode::Complete => Self::Complete,
        }
    }
}

/// The `-info.json` sidecar. Every field is optional on read so that
/// validation can report exactly what is missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub backup_type: Option<BackupType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

const REQUIRED_FIELDS: [&str; 3] = ["timestamp", "database", "environment"];
const RECOMMENDED_FIELDS: [&str; 3] = ["tableCount", "rowCount", "fileSize"];

/// One logical backup assembled from its artifact files.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Backup {
    pub name: String,
    pub database: Option<String>,
    pub environment: Option<String>,
    pub backup_type: Option<BackupType>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub captured_at: Option<OffsetDateTime>,
    pub payload: Option<PathBuf>,
    pub archive: Option<PathBuf>,
    pub sidecar: Option<PathBuf>,
    /// Position in discovery order; breaks timestamp ties.
    pub discovery_index: usize,
}

impl Backup {
    /// The file or directory restores and validation read from.
    #[must_use]
    pub fn primary_payload(&self) -> Option<&Path> {
        self.payload.as_deref().or(self.archive.as_deref())
    }

    /// Every artifact path belonging to this backup.
    #[must_use]
    pub fn files(&self) -> Vec<&Path> {
        [self.payload.as_deref(), self.archive.as_deref(), self.sidecar.as_deref()]
            .into_iter()
            .flatten()
            .collect()
    }

    #[must_use]
    pub fn is_csv(&self) -> bool {
        self.backup_type == Some(BackupType::Csv) || self.primary_payload().is_some_and(Path::is_dir)
    }
}

/// Render a timestamp the way it appears in artifact names,
/// `YYYY-MM-DDTHH-MM-SS-mmmZ`.
#[must_use]
pub fn name_timestamp(at: OffsetDateTime) -> String {
    format_csv_timestamp(at).replace(':', "-").replacen('.', "-", 1)
}

/// Inverse of [`name_timestamp`].
#[must_use]
pub fn parse_name_timestamp(text: &str) -> Option<OffsetDateTime> {
    let format = format_description!("[year]-[month]-[day]T[hour]-[minute]-[second]-[subsecond digits:3]Z");
    PrimitiveDateTime::parse(text, format).ok().map(PrimitiveDateTime::assume_utc)
}

/// Naming inputs for a new backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub database: String,
    pub environment: String,
    pub backup_type: BackupType,
    pub captured_at: OffsetDateTime,
}

impl ArtifactName {
    #[must_use]
    pub fn base(&self) -> String {
        format!("{}-{}-backup-{}", self.database, self.environment, name_timestamp(self.captured_at))
    }

    #[must_use]
    pub fn stem(&self) -> String {
        format!("{}-{}", self.base(), self.backup_type.as_str())
    }

    #[must_use]
    pub fn payload_file_name(&self, compress: bool) -> String {
        match (self.backup_type, compress) {
            (BackupType::Csv, _) => self.stem(),
            (_, true) => format!("{}.sql.gz", self.stem()),
            (_, false) => format!("{}.sql", self.stem()),
        }
    }

    #[must_use]
    pub fn sidecar_file_name(&self) -> String {
        format!("{}-info.json", self.stem())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ArtifactKind {
    Sql,
    Archive,
    Sidecar,
    CsvDir,
}

struct ParsedArtifact {
    base: String,
    kind: ArtifactKind,
    backup_type: Option<BackupType>,
}

fn classify(file_name: &str, is_dir: bool) -> Option<ParsedArtifact> {
    let (stem, kind) = if is_dir {
        (file_name, ArtifactKind::CsvDir)
    } else if let Some(stem) = file_name.strip_suffix("-info.json") {
        (stem, ArtifactKind::Sidecar)
    } else if let Some(stem) = file_name.strip_suffix(".sql.gz") {
        (stem, ArtifactKind::Archive)
    } else if let Some(stem) = file_name.strip_suffix(".sql") {
        (stem, ArtifactKind::Sql)
    } else {
        return None;
    };
    if file_name.starts_with('.') || stem.is_empty() {
        return None;
    }

    let typed = ["schema", "data", "complete", "csv"].into_iter().find_map(|suffix| {
        stem.strip_suffix(suffix)
            .and_then(|rest| rest.strip_suffix('-'))
            .map(|base| (base, BackupType::parse(suffix)))
    });
    match (kind, typed) {
        (ArtifactKind::CsvDir, Some((base, Some(BackupType::Csv)))) => {
            Some(ParsedArtifact { base: base.to_string(), kind, backup_type: Some(BackupType::Csv) })
        }
        (ArtifactKind::CsvDir, _) => None,
        (_, Some((base, backup_type))) => Some(ParsedArtifact { base: base.to_string(), kind, backup_type }),
        (_, None) => Some(ParsedArtifact { base: stem.to_string(), kind, backup_type: None }),
    }
}

/// Split `<database>-<environment>-backup-<timestamp>` into its parts.
fn parse_base(base: &str) -> (Option<String>, Option<String>, Option<OffsetDateTime>) {
    let Some((prefix, stamp)) = base.rsplit_once("-backup-") else {
        return (None, None, None);
    };
    let captured_at = parse_name_timestamp(stamp);
    match prefix.rsplit_once('-') {
        Some((database, environment)) if !database.is_empty() && !environment.is_empty() => {
            (Some(database.to_string()), Some(environment.to_string()), captured_at)
        }
        _ => (Some(prefix.to_string()), None, captured_at),
    }
}

/// Group the artifacts in `directory` into backups, in ascending file-name
/// order. Files that follow none of the artifact shapes are ignored.
///
/// # Errors
/// Returns [`CatalogError::Io`] when the directory cannot be listed.
pub fn discover(directory: &Path) -> Result<Vec<Backup>, CatalogError> {
    let mut entries = fs::read_dir(directory)
        .map_err(io_error(directory))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    entries.sort();

    let mut groups: BTreeMap<String, Backup> = BTreeMap::new();
    let mut order = 0_usize;
    for path in entries {
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some(parsed) = classify(file_name, path.is_dir()) else {
            continue;
        };
        let backup = groups.entry(parsed.base.clone()).or_insert_with(|| {
            let (database, environment, captured_at) = parse_base(&parsed.base);
            order += 1;
            Backup {
                name: parsed.base.clone(),
                database,
                environment,
                backup_type: None,
                captured_at,
                payload: None,
                archive: None,
                sidecar: None,
                discovery_index: order - 1,
            }
        });
        if backup.backup_type.is_none() {
            backup.backup_type = parsed.backup_type;
        }
        match parsed.kind {
            ArtifactKind::Sql | ArtifactKind::CsvDir => backup.payload = Some(path),
            ArtifactKind::Archive => backup.archive = Some(path),
            ArtifactKind::Sidecar => backup.sidecar = Some(path),
        }
    }

    let mut backups = groups.into_values().collect::<Vec<_>>();
    backups.sort_by_key(|backup| backup.discovery_index);
    for backup in &mut backups {
        apply_sidecar(backup);
        if backup.captured_at.is_none() {
            backup.captured_at = backup.primary_payload().and_then(modified_at);
        }
    }
    tracing::debug!(directory = %directory.display(), backups = backups.len(), "discovered backups");
    Ok(backups)
}

fn apply_sidecar(backup: &mut Backup) {
    let Some(metadata) = backup.sidecar.as_deref().and_then(|path| read_metadata(path).ok()) else {
        return;
    };
    if let Some(at) = metadata.timestamp.as_deref().and_then(parse_timestamp_text) {
        backup.captured_at = Some(at);
    }
    if metadata.database.is_some() {
        backup.database = metadata.database;
    }
    if metadata.environment.is_some() {
        backup.environment = metadata.environment;
    }
    if metadata.backup_type.is_some() {
        backup.backup_type = metadata.backup_type;
    }
}

fn modified_at(path: &Path) -> Option<OffsetDateTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok().map(OffsetDateTime::from)
}

fn read_metadata(path: &Path) -> Result<BackupMetadata, String> {
    let text = fs::read_to_string(path).map_err(|err| err.to_string())?;
    serde_json::from_str(&text).map_err(|err| err.to_string())
}

/// Resolve a path or a backup name to a catalogued backup.
///
/// A path that exists is matched against the backups in its own directory
/// and otherwise treated as a standalone payload.
///
/// # Errors
/// Returns [`CatalogError::NotFound`] when nothing matches.
pub fn find_backup(directory: &Path, reference: &str) -> Result<Backup, CatalogError> {
    let as_path = Path::new(reference);
    if as_path.exists() {
        let parent = as_path.parent().filter(|parent| !parent.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let found = discover(parent)?
            .into_iter()
            .find(|backup| backup.files().iter().any(|file| same_file(file, as_path)));
        return Ok(found.unwrap_or_else(|| standalone(as_path)));
    }

    discover(directory)?
        .into_iter()
        .find(|backup| {
            backup.name == reference
                || backup.files().iter().any(|file| {
                    file.file_name().and_then(|name| name.to_str()) == Some(reference)
                })
        })
        .ok_or_else(|| CatalogError::NotFound(reference.to_string()))
}

fn same_file(left: &Path, right: &Path) -> bool {
    match (left.canonicalize(), right.canonicalize()) {
        (Ok(left), Ok(right)) => left == right,
        _ => left == right,
    }
}

fn standalone(path: &Path) -> Backup {
    let is_archive = path.extension().is_some_and(|ext| ext == "gz");
    Backup {
        name: path.file_name().and_then(|name| name.to_str()).unwrap_or_default().to_string(),
        database: None,
        environment: None,
        backup_type: None,
        captured_at: modified_at(path),
        payload: (!is_archive).then(|| path.to_path_buf()),
        archive: is_archive.then(|| path.to_path_buf()),
        sidecar: None,
        discovery_index: 0,
    }
}

/// Raw payload bytes, gunzipped when the file is a `.gz` archive.
///
/// # Errors
/// Returns [`CatalogError::Io`] on read or decompression failure.
pub fn read_payload_bytes(path: &Path) -> Result<Vec<u8>, CatalogError> {
    let bytes = fs::read(path).map_err(io_error(path))?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        let mut decoded = Vec::new();
        GzDecoder::new(bytes.as_slice()).read_to_end(&mut decoded).map_err(io_error(path))?;
        return Ok(decoded);
    }
    Ok(bytes)
}

/// Payload text for replay.
///
/// # Errors
/// Returns [`CatalogError::Encoding`] when the payload is not UTF-8.
pub fn read_payload(path: &Path) -> Result<String, CatalogError> {
    String::from_utf8(read_payload_bytes(path)?).map_err(|_| CatalogError::Encoding { path: path.to_path_buf() })
}

/// `sha256:<hex>` over a payload file, or over the names and contents of
/// the `.csv` files in a payload directory.
///
/// # Errors
/// Returns [`CatalogError::Io`] when the payload cannot be read.
pub fn payload_checksum(path: &Path) -> Result<String, CatalogError> {
    let mut hasher = Sha256::new();
    if path.is_dir() {
        for file in csv_files(path)? {
            if let Some(name) = file.file_name().and_then(|name| name.to_str()) {
                hasher.update(name.as_bytes());
            }
            hasher.update(fs::read(&file).map_err(io_error(&file))?);
        }
    } else {
        hasher.update(fs::read(path).map_err(io_error(path))?);
    }
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

fn payload_size(path: &Path) -> Result<u64, CatalogError> {
    if path.is_dir() {
        let mut total = 0;
        for file in csv_files(path)? {
            total += fs::metadata(&file).map_err(io_error(&file))?.len();
        }
        return Ok(total);
    }
    Ok(fs::metadata(path).map_err(io_error(path))?.len())
}

fn csv_files(directory: &Path) -> Result<Vec<PathBuf>, CatalogError> {
    let mut files = fs::read_dir(directory)
        .map_err(io_error(directory))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "csv"))
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

/// Counts recorded in a new sidecar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactStats {
    pub table_count: usize,
    pub row_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WrittenBackup {
    pub payload: PathBuf,
    pub sidecar: PathBuf,
    pub metadata: BackupMetadata,
}

/// Write a SQL dump as `<stem>.sql` (or `.sql.gz`) plus its sidecar.
///
/// # Errors
/// Returns [`CatalogError::Io`] when the directory or files cannot be written.
pub fn write_sql_backup(
    directory: &Path,
    name: &ArtifactName,
    dump_text: &str,
    compress: bool,
    stats: &ArtifactStats,
) -> Result<WrittenBackup, CatalogError> {
    fs::create_dir_all(directory).map_err(io_error(directory))?;
    let payload = directory.join(name.payload_file_name(compress));
    let bytes = if compress {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(dump_text.as_bytes()).map_err(io_error(&payload))?;
        encoder.finish().map_err(io_error(&payload))?
    } else {
        dump_text.as_bytes().to_vec()
    };
    fs::write(&payload, bytes).map_err(io_error(&payload))?;
    write_sidecar(directory, name, &payload, stats)
}

/// Directory a CSV backup's table files go into.
#[must_use]
pub fn csv_backup_dir(directory: &Path, name: &ArtifactName) -> PathBuf {
    directory.join(name.payload_file_name(false))
}

/// Write the `-info.json` sidecar describing an already written payload.
///
/// # Errors
/// Returns [`CatalogError::Io`] when the payload cannot be hashed or the
/// sidecar cannot be written.
pub fn write_sidecar(
    directory: &Path,
    name: &ArtifactName,
    payload: &Path,
    stats: &ArtifactStats,
) -> Result<WrittenBackup, CatalogError> {
    let metadata = BackupMetadata {
        timestamp: Some(format_csv_timestamp(name.captured_at)),
        database: Some(name.database.clone()),
        environment: Some(name.environment.clone()),
        backup_type: Some(name.backup_type),
        table_count: Some(stats.table_count as u64),
        row_count: Some(stats.row_count as u64),
        file_size: Some(payload_size(payload)?),
        checksum: Some(payload_checksum(payload)?),
        warnings: stats.warnings.clone(),
    };
    let sidecar = directory.join(name.sidecar_file_name());
    let json = serde_json::to_string_pretty(&metadata)?;
    fs::write(&sidecar, format!("{json}\n")).map_err(io_error(&sidecar))?;
    tracing::info!(payload = %payload.display(), checksum = ?metadata.checksum, "wrote backup");
    Ok(WrittenBackup { payload: payload.to_path_buf(), sidecar, metadata })
}

/// Structured validation outcome; problems are data, not errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationReport {
    pub name: String,
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Check a backup's payload and sidecar for structural problems.
#[must_use]
pub fn validate(backup: &Backup) -> ValidationReport {
    let mut report = ValidationReport { name: backup.name.clone(), ..ValidationReport::default() };

    match backup.primary_payload() {
        None => report.errors.push("no payload file".to_string()),
        Some(path) if path.is_dir() => validate_csv_payload(path, &mut report),
        Some(path) => validate_sql_payload(path, &mut report),
    }
    match backup.sidecar.as_deref() {
        None => report.warnings.push("no metadata sidecar".to_string()),
        Some(path) => {
            let payloads = [backup.payload.as_deref(), backup.archive.as_deref()].into_iter().flatten().collect::<Vec<_>>();
            validate_sidecar(path, &payloads, &mut report);
        }
    }

    report.valid = report.errors.is_empty();
    report
}

fn validate_csv_payload(path: &Path, report: &mut ValidationReport) {
    match csv_files(path) {
        Ok(files) if files.is_empty() => report.errors.push("csv payload holds no .csv files".to_string()),
        Ok(files) => {
            for file in files {
                if fs::metadata(&file).map(|meta| meta.len()).unwrap_or(0) == 0 {
                    report.warnings.push(format!("{} is empty", file.display()));
                }
            }
        }
        Err(err) => report.errors.push(err.to_string()),
    }
}

fn validate_sql_payload(path: &Path, report: &mut ValidationReport) {
    let bytes = match read_payload_bytes(path) {
        Ok(bytes) => bytes,
        Err(err) => {
            report.errors.push(format!("payload unreadable: {err}"));
            return;
        }
    };
    if bytes.is_empty() {
        report.errors.push("payload is empty".to_string());
        return;
    }
    let text = String::from_utf8_lossy(&bytes);
    let upper = text.to_ascii_uppercase();
    if !upper.contains("CREATE TABLE") && !upper.contains("INSERT INTO") {
        report.errors.push("payload contains neither CREATE TABLE nor INSERT INTO".to_string());
    }
    if has_mojibake(&text) {
        report.warnings.push("payload contains replacement or mis-decoded characters".to_string());
    }
    for statement in split(&text) {
        let body = statement.as_str();
        if body.get(..12).is_some_and(|head| head.eq_ignore_ascii_case("CREATE TABLE")) && !parens_balanced(body) {
            report.errors.push(format!("unterminated CREATE TABLE: {}", statement.preview(60)));
        }
    }
}

/// `payloads` holds the plain payload and the archive; the sidecar may
/// describe either.
fn validate_sidecar(path: &Path, payloads: &[&Path], report: &mut ValidationReport) {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            report.errors.push(format!("metadata unreadable: {err}"));
            return;
        }
    };
    let object = match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(serde_json::Value::Object(object)) => object,
        Ok(_) => {
            report.errors.push("metadata is not a JSON object".to_string());
            return;
        }
        Err(err) => {
            report.errors.push(format!("metadata is not valid JSON: {err}"));
            return;
        }
    };
    for field in REQUIRED_FIELDS {
        if matches!(object.get(field), None | Some(serde_json::Value::Null)) {
            report.errors.push(format!("metadata missing required field `{field}`"));
        }
    }
    for field in RECOMMENDED_FIELDS {
        if matches!(object.get(field), None | Some(serde_json::Value::Null)) {
            report.warnings.push(format!("metadata missing recommended field `{field}`"));
        }
    }
    if let Some(stamp) = object.get("timestamp").and_then(serde_json::Value::as_str) {
        if parse_timestamp_text(stamp).is_none() {
            report.warnings.push(format!("metadata timestamp `{stamp}` is not ISO-8601"));
        }
    }

    let Some(primary) = payloads.first().copied() else { return };
    let mut described = primary;
    if let Some(expected) = object.get("checksum").and_then(serde_json::Value::as_str) {
        let mut actual = None;
        for &candidate in payloads {
            match payload_checksum(candidate) {
                Ok(sum) if sum == expected => {
                    described = candidate;
                    actual = None;
                    break;
                }
                Ok(sum) => actual = actual.or(Some(sum)),
                Err(err) => actual = actual.or(Some(format!("unavailable ({err})"))),
            }
        }
        if let Some(actual) = actual {
            report.errors.push(format!("checksum mismatch: expected {expected}, found {actual}"));
        }
    }
    if let (Some(expected), Ok(actual)) =
        (object.get("fileSize").and_then(serde_json::Value::as_u64), payload_size(described))
    {
        if expected != actual {
            report.warnings.push(format!("fileSize {expected} does not match payload size {actual}"));
        }
    }
}

/// U+FFFD, or UTF-8 text that was decoded as Latin-1 at some point.
fn has_mojibake(text: &str) -> bool {
    if text.contains('\u{FFFD}') || text.contains("â€") {
        return true;
    }
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == 'Ã' && chars.peek().is_some_and(|next| ('\u{80}'..='\u{BF}').contains(next)) {
            return true;
        }
    }
    false
}

/// Parentheses outside single-quoted strings open and close evenly, and
/// at least one opens.
fn parens_balanced(statement: &str) -> bool {
    let mut depth = 0_i64;
    let mut opened = false;
    let mut in_string = false;
    for ch in statement.chars() {
        match ch {
            '\'' => in_string = !in_string,
            '(' if !in_string => {
                depth += 1;
                opened = true;
            }
            ')' if !in_string => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    opened && depth == 0 && !in_string
}
