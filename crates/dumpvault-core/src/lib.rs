//! Backup, restore and migration engine for a CMS database.
//!
//! The engine serializes a live database into SQL dump text or CSV, replays
//! dumps (optionally retargeted at another database), catalogs and
//! validates backup artifacts, applies retention, and reconciles uploaded
//! files against their records. Database access goes through the
//! [`SqlConnection`] and [`FileRecordStore`] traits; this crate ships no
//! driver.

pub mod catalog;
pub mod codec;
pub mod config;
pub mod connection;
pub mod csv;
pub mod orphans;
pub mod restore;
pub mod retarget;
pub mod retention;
pub mod serializer;
pub mod splitter;
pub mod strategy;
pub mod value;

pub use catalog::{
    discover, find_backup, read_payload, validate, ArtifactName, ArtifactStats, Backup, BackupMetadata,
    BackupType, CatalogError, ValidationReport, WrittenBackup,
};
pub use codec::{csv_field_text, from_csv_field, quote_identifier, to_csv_field, to_sql_literal, SqlDialect};
pub use config::{ConfigError, EngineConfig, EnvironmentConfig};
pub use connection::{ConnectionError, FileRecord, FileRecordStore, SqlConnection};
pub use self::csv::{CsvError, CsvFormat, CsvImportOptions, ImportReport};
pub use orphans::{cleanup, find_orphans, CleanupOptions, CleanupReport, OrphanError, OrphanFinding, OrphanScanOptions};
pub use restore::{restore, CancellationToken, RestoreOptions, RestoreProgress, RestoreReport, StatementFailure};
pub use retarget::{prepare_restore_script, retarget, RestorePlan, RetargetError};
pub use retention::{compute_deletion_set, RetentionPlan, RetentionPolicy};
pub use serializer::{DatabaseIdentity, Dump, DumpError, DumpMode, DumpOptions, TableFilter};
pub use splitter::{split, Statement};
pub use strategy::{DumpStrategy, ExternalToolConfig, ExternalToolDump, NativeDump};
pub use value::{ColumnDescriptor, Row, TableDescriptor, TypeTag, Value};

/// Version stamped into every CLI JSON document.
pub const CONTRACT_VERSION: &str = "dumpvault.v1";
