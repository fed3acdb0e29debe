//! Reconciliation between the file-record table and the upload directories.
//!
//! Both directions are always checked: records whose file is gone, and
//! files no record refers to. Repairs delete records freely but delete
//! physical files only on explicit request.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::connection::{FileRecord, FileRecordStore};

const MAX_SCAN_DEPTH: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum OrphanError {
    #[error("upload root {root} is not a readable directory")]
    UnreadableRoot { root: PathBuf },
    #[error("failed to scan {path}: {message}")]
    Scan { path: PathBuf, message: String },
    #[error("failed to read file records: {0}")]
    Records(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OrphanFinding {
    #[serde(rename_all = "camelCase")]
    RecordWithoutFile { file_record_id: i64, path: PathBuf, reason: String },
    #[serde(rename_all = "camelCase")]
    FileWithoutRecord { file_path: PathBuf, reason: String },
}

impl OrphanFinding {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RecordWithoutFile { .. } => "record-without-file",
            Self::FileWithoutRecord { .. } => "file-without-record",
        }
    }
}

/// Physical files found under the upload roots.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilesystemScan {
    pub roots: Vec<PathBuf>,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrphanScanOptions {
    pub upload_roots: Vec<PathBuf>,
    /// Directory that relative record paths are resolved against.
    pub base_dir: Option<PathBuf>,
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_str().is_some_and(|name| name.starts_with('.'))
}

/// List every regular, non-hidden file under the upload roots.
///
/// # Errors
/// Returns [`OrphanError::UnreadableRoot`] when a root is not a directory
/// and [`OrphanError::Scan`] when walking it fails.
pub fn scan_upload_roots(roots: &[PathBuf]) -> Result<FilesystemScan, OrphanError> {
    let mut scan = FilesystemScan { roots: roots.to_vec(), files: Vec::new() };
    for root in roots {
        if !root.is_dir() {
            return Err(OrphanError::UnreadableRoot { root: root.clone() });
        }
        for entry in walkdir::WalkDir::new(root)
            .max_depth(MAX_SCAN_DEPTH)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry))
        {
            let entry = entry.map_err(|err| OrphanError::Scan {
                path: err.path().map_or_else(|| root.clone(), Path::to_path_buf),
                message: err.to_string(),
            })?;
            if entry.file_type().is_file() {
                scan.files.push(entry.into_path());
            }
        }
    }
    tracing::debug!(roots = roots.len(), files = scan.files.len(), "scanned upload roots");
    Ok(scan)
}

fn resolve(path: &str, base_dir: Option<&Path>) -> PathBuf {
    let path = Path::new(path);
    match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

fn basename(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

/// Cross-reference records and files in both directions.
///
/// A file counts as referenced when any record's stored filename, or the
/// last component of any record's path, equals its basename.
#[must_use]
pub fn find_orphans(records: &[FileRecord], scan: &FilesystemScan, base_dir: Option<&Path>) -> Vec<OrphanFinding> {
    let mut findings = Vec::new();

    for record in records {
        let path = resolve(&record.path, base_dir);
        if !path.is_file() {
            findings.push(OrphanFinding::RecordWithoutFile {
                file_record_id: record.id,
                reason: format!("no file at {}", path.display()),
                path,
            });
        }
    }

    let referenced = records
        .iter()
        .flat_map(|record| [Some(record.filename.as_str()), basename(Path::new(&record.path))])
        .flatten()
        .filter(|name| !name.is_empty())
        .collect::<BTreeSet<_>>();
    for file in &scan.files {
        let Some(name) = basename(file) else { continue };
        if !referenced.contains(name) {
            findings.push(OrphanFinding::FileWithoutRecord {
                file_path: file.clone(),
                reason: format!("no file record references {name}"),
            });
        }
    }

    tracing::info!(records = records.len(), files = scan.files.len(), findings = findings.len(), "orphan scan finished");
    findings
}

/// Read the records, walk the roots and reconcile.
///
/// # Errors
/// Returns an error when the records cannot be listed or a root cannot be
/// scanned.
pub fn scan<S>(store: &mut S, options: &OrphanScanOptions) -> Result<Vec<OrphanFinding>, OrphanError>
where
    S: FileRecordStore + ?Sized,
{
    let records = store.list_file_records().map_err(|err| OrphanError::Records(err.message))?;
    let filesystem = scan_upload_roots(&options.upload_roots)?;
    Ok(find_orphans(&records, &filesystem, options.base_dir.as_deref()))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct CleanupOptions {
    /// Delete untracked physical files.
    pub delete_files: bool,
    /// Delete records whose file is gone; otherwise they are flagged.
    pub delete_records: bool,
    pub dry_run: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self { delete_files: false, delete_records: true, dry_run: false }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub files_deleted: usize,
    pub records_deleted: usize,
    pub records_flagged: usize,
    pub files_skipped: usize,
    pub errors: Vec<String>,
}

/// Act on findings. Failures are collected, never fatal.
pub fn cleanup<S>(findings: &[OrphanFinding], store: &mut S, options: &CleanupOptions) -> CleanupReport
where
    S: FileRecordStore + ?Sized,
{
    let mut report = CleanupReport { dry_run: options.dry_run, ..CleanupReport::default() };

    for finding in findings {
        match finding {
            OrphanFinding::RecordWithoutFile { file_record_id, .. } => {
                let id = *file_record_id;
                if options.dry_run {
                    if options.delete_records {
                        report.records_deleted += 1;
                    } else {
                        report.records_flagged += 1;
                    }
                    continue;
                }
                let result = if options.delete_records {
                    store.delete_file_record(id).map(|hit| (hit, &mut report.records_deleted))
                } else {
                    store.set_orphaned(id, true).map(|hit| (hit, &mut report.records_flagged))
                };
                match result {
                    Ok((true, counter)) => *counter += 1,
                    Ok((false, _)) => report.errors.push(format!("file record {id} no longer exists")),
                    Err(err) => {
                        tracing::warn!(id, error = %err, "failed to repair file record");
                        report.errors.push(format!("file record {id}: {err}"));
                    }
                }
            }
            OrphanFinding::FileWithoutRecord { file_path, .. } => {
                if !options.delete_files {
                    report.files_skipped += 1;
                    continue;
                }
                if options.dry_run {
                    report.files_deleted += 1;
                    continue;
                }
                match fs::remove_file(file_path) {
                    Ok(()) => report.files_deleted += 1,
                    Err(err) => {
                        tracing::warn!(file = %file_path.display(), error = %err, "failed to delete orphaned file");
                        report.errors.push(format!("{}: {err}", file_path.display()));
                    }
                }
            }
        }
    }

    tracing::info!(
        files_deleted = report.files_deleted,
        records_deleted = report.records_deleted,
        records_flagged = report.records_flagged,
        dry_run = report.dry_run,
        "orphan cleanup finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::connection::ConnectionError;

    #[derive(Default)]
    struct MemoryRecords {
        records: Vec<FileRecord>,
    }

    impl FileRecordStore for MemoryRecords {
        fn list_file_records(&mut self) -> Result<Vec<FileRecord>, ConnectionError> {
            Ok(self.records.clone())
        }

        fn delete_file_record(&mut self, id: i64) -> Result<bool, ConnectionError> {
            let before = self.records.len();
            self.records.retain(|record| record.id != id);
            Ok(self.records.len() != before)
        }

        fn set_orphaned(&mut self, id: i64, orphaned: bool) -> Result<bool, ConnectionError> {
            let Some(record) = self.records.iter_mut().find(|record| record.id == id) else {
                return Ok(false);
            };
            record.is_orphaned = orphaned;
            Ok(true)
        }
    }

    fn record(id: i64, path: &Path) -> FileRecord {
        let filename = basename(path).unwrap_or_default().to_string();
        FileRecord {
            id,
            original_name: filename.clone(),
            url: format!("/uploads/gallery/{filename}"),
            filename,
            path: path.display().to_string(),
            mime_type: "image/png".to_string(),
            size: 4,
            category: "gallery".to_string(),
            entity_type: None,
            entity_id: None,
            is_orphaned: false,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    // Test IDs: TORP-001
    #[test]
    fn reconciliation_scenario_finds_both_directions() -> TestResult {
        let uploads = tempfile::tempdir()?;
        let gallery = uploads.path().join("gallery");
        fs::create_dir_all(&gallery)?;
        let untracked = gallery.join("y.png");
        fs::write(&untracked, b"png!")?;
        fs::write(gallery.join(".DS_Store"), b"")?;

        let mut store = MemoryRecords { records: vec![record(7, &gallery.join("x.png"))] };
        let options = OrphanScanOptions { upload_roots: vec![uploads.path().to_path_buf()], base_dir: None };
        let findings = scan(&mut store, &options)?;

        assert_eq!(findings.len(), 2);
        assert!(matches!(&findings[0], OrphanFinding::RecordWithoutFile { file_record_id: 7, .. }));
        assert!(
            matches!(&findings[1], OrphanFinding::FileWithoutRecord { file_path, .. } if file_path == &untracked)
        );

        let report = cleanup(&findings, &mut store, &CleanupOptions::default());
        assert_eq!(report.records_deleted, 1);
        assert_eq!(report.files_deleted, 0);
        assert_eq!(report.files_skipped, 1);
        assert!(store.records.is_empty());
        assert!(untracked.exists());
        Ok(())
    }

    // Test IDs: TORP-002
    #[test]
    fn delete_files_opt_in_removes_untracked_files() -> TestResult {
        let uploads = tempfile::tempdir()?;
        let tracked = uploads.path().join("a.png");
        let untracked = uploads.path().join("b.png");
        fs::write(&tracked, b"a")?;
        fs::write(&untracked, b"b")?;
        let mut store = MemoryRecords { records: vec![record(1, &tracked)] };

        let scan_result = scan_upload_roots(&[uploads.path().to_path_buf()])?;
        let findings = find_orphans(&store.records.clone(), &scan_result, None);
        assert_eq!(findings.len(), 1);

        let dry = cleanup(&findings, &mut store, &CleanupOptions { delete_files: true, dry_run: true, ..CleanupOptions::default() });
        assert_eq!(dry.files_deleted, 1);
        assert!(untracked.exists());

        let report = cleanup(&findings, &mut store, &CleanupOptions { delete_files: true, ..CleanupOptions::default() });
        assert_eq!(report.files_deleted, 1);
        assert!(!untracked.exists());
        assert!(tracked.exists());
        Ok(())
    }

    // Test IDs: TORP-003
    #[test]
    fn records_can_be_flagged_instead_of_deleted() -> TestResult {
        let uploads = tempfile::tempdir()?;
        let mut store = MemoryRecords { records: vec![record(3, &uploads.path().join("gone.pdf"))] };
        let findings = find_orphans(&store.records.clone(), &FilesystemScan::default(), None);

        let report = cleanup(&findings, &mut store, &CleanupOptions { delete_records: false, ..CleanupOptions::default() });
        assert_eq!(report.records_flagged, 1);
        assert!(store.records[0].is_orphaned);
        Ok(())
    }

    // Test IDs: TORP-004
    #[test]
    fn relative_record_paths_resolve_against_base_dir() -> TestResult {
        let base = tempfile::tempdir()?;
        fs::create_dir_all(base.path().join("uploads"))?;
        fs::write(base.path().join("uploads/doc.pdf"), b"%PDF")?;
        let mut relative = record(9, Path::new("uploads/doc.pdf"));
        relative.path = "uploads/doc.pdf".to_string();

        let findings = find_orphans(&[relative], &FilesystemScan::default(), Some(base.path()));
        assert!(findings.is_empty());
        Ok(())
    }

    // Test IDs: TORP-005
    #[test]
    fn missing_root_is_an_error_and_findings_serialize_tagged() -> TestResult {
        let missing = PathBuf::from("/definitely/not/here");
        assert!(matches!(scan_upload_roots(&[missing]), Err(OrphanError::UnreadableRoot { .. })));

        let finding = OrphanFinding::RecordWithoutFile {
            file_record_id: 4,
            path: PathBuf::from("/uploads/x.png"),
            reason: "no file".to_string(),
        };
        let json = serde_json::to_value(&finding)?;
        assert_eq!(json["kind"], "record-without-file");
        assert_eq!(json["fileRecordId"], 4);
        assert_eq!(finding.kind(), "record-without-file");
        Ok(())
    }
}
