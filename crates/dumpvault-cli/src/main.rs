use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dumpvault_core::catalog::{csv_backup_dir, write_sidecar, write_sql_backup};
use dumpvault_core::csv::{export_tables_to_dir, import_dir, import_file};
use dumpvault_core::retarget::source_database;
use dumpvault_core::retention::apply as apply_retention;
use dumpvault_core::{
    cleanup, compute_deletion_set, discover, find_backup, prepare_restore_script, read_payload, restore, split,
    validate, ArtifactName, ArtifactStats, Backup, BackupType, CancellationToken, CleanupOptions, CsvImportOptions,
    DatabaseIdentity, DumpMode, DumpStrategy, EngineConfig, ExternalToolDump, NativeDump, OrphanScanOptions,
    RestorePlan, RestoreProgress, RestoreReport, RetentionPolicy, TableFilter, WrittenBackup, CONTRACT_VERSION,
};
use dumpvault_store_sqlite::{database_path, SqliteStore};
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const PROGRESS_EVERY: usize = 500;

#[derive(Debug, Parser)]
#[command(name = "dv")]
#[command(about = "Backup, restore and migrate CMS databases")]
struct Cli {
    /// YAML configuration file (default: ./dumpvault.yaml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Capture the environment's database into the backup directory.
    Backup(BackupArgs),
    /// Replay a backup into a database.
    Restore(RestoreArgs),
    /// List catalogued backups.
    List(ListArgs),
    /// Check a backup's payload and metadata.
    Validate(ValidateArgs),
    /// Delete backups according to a retention policy.
    Cleanup(CleanupArgs),
    ExportCsv(ExportCsvArgs),
    ImportCsv(ImportCsvArgs),
    Orphans {
        #[arg(long)]
        env: Option<String>,
        #[command(subcommand)]
        command: OrphansCommand,
    },
    Db {
        #[arg(long)]
        env: Option<String>,
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackupKind {
    Schema,
    Data,
    Complete,
    Csv,
}

impl BackupKind {
    fn backup_type(self) -> BackupType {
        match self {
            Self::Schema => BackupType::Schema,
            Self::Data => BackupType::Data,
            Self::Complete => BackupType::Complete,
            Self::Csv => BackupType::Csv,
        }
    }

    fn dump_mode(self) -> Option<DumpMode> {
        match self {
            Self::Schema => Some(DumpMode::Schema),
            Self::Data => Some(DumpMode::Data),
            Self::Complete => Some(DumpMode::Complete),
            Self::Csv => None,
        }
    }
}

#[derive(Debug, Args)]
struct TableFilterArgs {
    /// Only these tables (comma separated).
    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,
    /// Skip these tables (comma separated).
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,
}

impl TableFilterArgs {
    fn filter(&self) -> TableFilter {
        TableFilter { include: self.include.clone(), exclude: self.exclude.clone() }
    }
}

#[derive(Debug, Args)]
struct BackupArgs {
    #[arg(value_enum, default_value_t = BackupKind::Complete)]
    kind: BackupKind,
    #[arg(long)]
    env: Option<String>,
    /// Directory to write into instead of the configured backup directory.
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    compress: bool,
    #[command(flatten)]
    tables: TableFilterArgs,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    /// Backup file path or catalogued backup name.
    backup: String,
    #[arg(long)]
    env: Option<String>,
    /// Restore into this database instead of the environment's.
    #[arg(long)]
    database: Option<String>,
    #[arg(long, default_value_t = false)]
    create_db: bool,
    #[arg(long, default_value_t = false)]
    drop_existing: bool,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Refuse to restore a backup that fails validation.
    #[arg(long, default_value_t = false)]
    validate: bool,
    /// Back up the target database before replaying.
    #[arg(long, default_value_t = false)]
    backup_first: bool,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long)]
    env: Option<String>,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    backup: String,
}

#[derive(Debug, Args)]
struct CleanupArgs {
    #[arg(long)]
    env: Option<String>,
    #[arg(long)]
    keep_count: Option<usize>,
    #[arg(long)]
    keep_days: Option<u32>,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ExportCsvArgs {
    #[arg(long)]
    env: Option<String>,
    /// Plain export directory; without it a catalogued CSV backup is written.
    #[arg(long)]
    output: Option<PathBuf>,
    #[command(flatten)]
    tables: TableFilterArgs,
}

#[derive(Debug, Args)]
struct ImportCsvArgs {
    /// A `.csv` file, a directory of them, or a catalogued CSV backup name.
    source: String,
    #[arg(long)]
    env: Option<String>,
    /// Target table for a single file (default: the file stem).
    #[arg(long)]
    table: Option<String>,
    #[arg(long, default_value_t = false)]
    truncate: bool,
    #[arg(long)]
    batch_size: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum OrphansCommand {
    Scan(OrphanScanArgs),
    Cleanup(OrphanCleanupArgs),
}

#[derive(Debug, Args)]
struct OrphanScanArgs {
    /// Directory relative record paths are resolved against.
    #[arg(long)]
    base_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct OrphanCleanupArgs {
    #[command(flatten)]
    scan: OrphanScanArgs,
    /// Also delete physical files that no record references.
    #[arg(long, default_value_t = false)]
    delete_files: bool,
    /// Flag records whose file is gone instead of deleting them.
    #[arg(long, default_value_t = false)]
    flag_only: bool,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Snapshot(DbSnapshotArgs),
    RestoreSnapshot(DbRestoreSnapshotArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbSnapshotArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreSnapshotArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert("contract_version".to_string(), Value::String(CONTRACT_VERSION.to_string()));
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = EngineConfig::load(cli.config.as_deref()).context("configuration error")?;

    match cli.command {
        Command::Backup(args) => run_backup(&config, &args),
        Command::Restore(args) => run_restore(&config, &args),
        Command::List(args) => run_list(&config, &args),
        Command::Validate(args) => run_validate(&config, &args),
        Command::Cleanup(args) => run_cleanup(&config, &args),
        Command::ExportCsv(args) => run_export_csv(&config, &args),
        Command::ImportCsv(args) => run_import_csv(&config, &args),
        Command::Orphans { env, command } => {
            let (_, mut store) = open_environment(&config, env.as_deref(), false)?;
            store.migrate()?;
            run_orphans(&config, command, &mut store)
        }
        Command::Db { env, command } => {
            let (_, mut store) = open_environment(&config, env.as_deref(), true)?;
            run_db(command, &mut store)
        }
    }
}

/// Open the environment's database. Unless `create` is set, a missing
/// database file is a configuration error.
fn open_environment(config: &EngineConfig, env: Option<&str>, create: bool) -> Result<(String, SqliteStore)> {
    let (name, environment) = config.environment(env)?;
    let file = database_path(&environment.data_dir, &environment.database);
    if !create && !file.exists() {
        bail!("database {} of environment {name} not found at {}", environment.database, file.display());
    }
    let store = SqliteStore::open_server(&environment.data_dir, &environment.database)?;
    Ok((name.to_string(), store))
}

fn selected_database(store: &SqliteStore) -> Result<String> {
    store.database().map(str::to_string).ok_or_else(|| anyhow!("no database selected"))
}

/// Capture `mode` with the configured strategy and write it as a catalogued
/// SQL backup.
fn write_dump_backup(
    config: &EngineConfig,
    store: &mut SqliteStore,
    directory: &Path,
    name: &ArtifactName,
    mode: DumpMode,
    filter: TableFilter,
    compress: bool,
) -> Result<(&'static str, WrittenBackup)> {
    let (strategy, dump) = if let Some(tool) = config.dump.external_tool.clone() {
        let file = store.database_file().map(|path| path.display().to_string()).unwrap_or_default();
        let mut strategy = ExternalToolDump::new(tool, name.database.clone(), file);
        (strategy.name(), strategy.dump(mode, name.captured_at)?)
    } else {
        let mut options = config.dump_options();
        options.identity = Some(DatabaseIdentity::all(name.database.clone()));
        let mut strategy = NativeDump::new(&mut *store, filter, options);
        (strategy.name(), strategy.dump(mode, name.captured_at)?)
    };
    let stats = ArtifactStats { table_count: dump.table_count, row_count: dump.row_count, warnings: dump.warnings };
    let written = write_sql_backup(directory, name, &dump.text, compress, &stats)?;
    Ok((strategy, written))
}

fn write_csv_backup(
    config: &EngineConfig,
    store: &mut SqliteStore,
    directory: &Path,
    name: &ArtifactName,
    filter: &TableFilter,
) -> Result<WrittenBackup> {
    let payload = csv_backup_dir(directory, name);
    let summary = export_tables_to_dir(store, &payload, filter, &config.csv)?;
    let stats = ArtifactStats {
        table_count: summary.tables.len(),
        row_count: summary.row_count(),
        warnings: summary.warnings,
    };
    Ok(write_sidecar(directory, name, &payload, &stats)?)
}

fn run_backup(config: &EngineConfig, args: &BackupArgs) -> Result<()> {
    let (environment, mut store) = open_environment(config, args.env.as_deref(), false)?;
    let name = ArtifactName {
        database: selected_database(&store)?,
        environment,
        backup_type: args.kind.backup_type(),
        captured_at: OffsetDateTime::now_utc(),
    };
    let directory = args.output.clone().unwrap_or_else(|| config.backup_dir.clone());

    let (strategy, written) = match args.kind.dump_mode() {
        Some(mode) => {
            write_dump_backup(config, &mut store, &directory, &name, mode, args.tables.filter(), args.compress)?
        }
        None => ("csv", write_csv_backup(config, &mut store, &directory, &name, &args.tables.filter())?),
    };

    emit_json(serde_json::json!({
        "command": "backup",
        "name": name.base(),
        "type": name.backup_type,
        "strategy": strategy,
        "payload": written.payload,
        "sidecar": written.sidecar,
        "metadata": written.metadata
    }))
}

fn run_restore(config: &EngineConfig, args: &RestoreArgs) -> Result<()> {
    let backup = find_backup(&config.backup_dir, &args.backup)?;
    if backup.is_csv() {
        bail!("{} is a CSV backup; load it with import-csv", backup.name);
    }
    let validation = if args.validate {
        let report = validate(&backup);
        if !report.valid {
            emit_json(serde_json::json!({ "command": "restore", "validation": report }))?;
            bail!("backup {} failed validation", backup.name);
        }
        Some(report)
    } else {
        None
    };

    let payload = backup.primary_payload().ok_or_else(|| anyhow!("backup {} has no payload", backup.name))?;
    let text = read_payload(payload)?;

    let (environment_name, environment) = config.environment(args.env.as_deref())?;
    let target = args.database.clone().unwrap_or_else(|| environment.database.clone());
    let target_file = database_path(&environment.data_dir, &target);
    let creates_database = args.create_db || args.drop_existing || source_database(&text).is_some();
    if !target_file.exists() && !creates_database && !args.dry_run {
        bail!("database {target} does not exist; pass --create-db to create it");
    }

    let plan = RestorePlan {
        database: Some(target.clone()),
        create_database: args.create_db,
        drop_existing: args.drop_existing,
    };
    let script = prepare_restore_script(&text, &plan)?;
    let statements = split(&script);

    let pre_restore_backup = if args.backup_first && !args.dry_run && target_file.exists() {
        let mut current = SqliteStore::open_server(&environment.data_dir, &target)?;
        let name = ArtifactName {
            database: target.clone(),
            environment: environment_name.to_string(),
            backup_type: BackupType::Complete,
            captured_at: OffsetDateTime::now_utc(),
        };
        let (_, written) = write_dump_backup(
            config,
            &mut current,
            &config.backup_dir,
            &name,
            DumpMode::Complete,
            TableFilter::default(),
            false,
        )?;
        tracing::info!(backup = %written.payload.display(), "backed up target before restore");
        Some(written.payload)
    } else {
        None
    };

    let mut store = if args.dry_run {
        SqliteStore::open(Path::new(":memory:"))?
    } else {
        SqliteStore::open_server(&environment.data_dir, &target)?
    };
    let options = config.restore_options(args.dry_run);
    let cancel = interrupt_token()?;
    let report = restore(&statements, &mut store, &options, &cancel, |progress: &RestoreProgress| {
        let done = progress.index + 1;
        if done % PROGRESS_EVERY == 0 || done == progress.total {
            tracing::info!(done, total = progress.total, "restore progress");
        }
    });

    emit_json(serde_json::json!({
        "command": "restore",
        "backup": backup.name,
        "payload": payload,
        "environment": environment_name,
        "database": target,
        "validation": validation,
        "pre_restore_backup": pre_restore_backup,
        "report": report
    }))?;

    restore_outcome(&report)
}

/// Ctrl-C stops the restore before the next statement; a second one exits.
fn interrupt_token() -> Result<CancellationToken> {
    let cancel = CancellationToken::new();
    let handler = cancel.clone();
    ctrlc::set_handler(move || {
        if handler.is_cancelled() {
            std::process::exit(130);
        }
        tracing::warn!("interrupt received, stopping after the current statement");
        handler.cancel();
    })
    .context("failed to install interrupt handler")?;
    Ok(cancel)
}

fn restore_outcome(report: &RestoreReport) -> Result<()> {
    if let Some(fatal) = &report.fatal {
        bail!("restore aborted at statement {}: {}", fatal.index, fatal.message);
    }
    if report.cancelled {
        bail!("restore cancelled after {} statements", report.executed_count);
    }
    Ok(())
}

fn catalog(config: &EngineConfig, env: Option<&str>) -> Result<Vec<Backup>> {
    if !config.backup_dir.exists() {
        return Ok(Vec::new());
    }
    let backups = discover(&config.backup_dir)?;
    Ok(match env {
        Some(env) => backups.into_iter().filter(|backup| backup.environment.as_deref() == Some(env)).collect(),
        None => backups,
    })
}

fn run_list(config: &EngineConfig, args: &ListArgs) -> Result<()> {
    let backups = catalog(config, args.env.as_deref())?;
    emit_json(serde_json::json!({
        "command": "list",
        "backup_dir": config.backup_dir,
        "count": backups.len(),
        "backups": backups
    }))
}

fn run_validate(config: &EngineConfig, args: &ValidateArgs) -> Result<()> {
    let backup = find_backup(&config.backup_dir, &args.backup)?;
    let report = validate(&backup);
    emit_json(serde_json::json!({
        "command": "validate",
        "backup": backup,
        "report": report
    }))
}

fn run_cleanup(config: &EngineConfig, args: &CleanupArgs) -> Result<()> {
    let policy = RetentionPolicy { keep_count: args.keep_count, keep_newer_than_days: args.keep_days };
    if policy.is_empty() {
        bail!("cleanup needs --keep-count and/or --keep-days");
    }
    let backups = catalog(config, args.env.as_deref())?;
    let plan = compute_deletion_set(&backups, &policy, OffsetDateTime::now_utc());
    let outcome = apply_retention(&plan, args.dry_run);
    emit_json(serde_json::json!({
        "command": "cleanup",
        "policy": policy,
        "outcome": outcome
    }))
}

fn run_export_csv(config: &EngineConfig, args: &ExportCsvArgs) -> Result<()> {
    let (environment, mut store) = open_environment(config, args.env.as_deref(), false)?;
    let filter = args.tables.filter();
    if let Some(output) = &args.output {
        let summary = export_tables_to_dir(&mut store, output, &filter, &config.csv)?;
        return emit_json(serde_json::json!({
            "command": "export-csv",
            "row_count": summary.row_count(),
            "summary": summary
        }));
    }

    let name = ArtifactName {
        database: selected_database(&store)?,
        environment,
        backup_type: BackupType::Csv,
        captured_at: OffsetDateTime::now_utc(),
    };
    let written = write_csv_backup(config, &mut store, &config.backup_dir, &name, &filter)?;
    emit_json(serde_json::json!({
        "command": "export-csv",
        "name": name.base(),
        "payload": written.payload,
        "sidecar": written.sidecar,
        "metadata": written.metadata
    }))
}

fn run_import_csv(config: &EngineConfig, args: &ImportCsvArgs) -> Result<()> {
    let (_, mut store) = open_environment(config, args.env.as_deref(), false)?;
    let mut format = config.csv.clone();
    if let Some(batch_size) = args.batch_size {
        format.batch_size = batch_size;
    }
    format.validate()?;
    let options = CsvImportOptions { format, dialect: config.dialect, truncate: args.truncate };

    let source = PathBuf::from(&args.source);
    let reports = if source.is_file() {
        let table = match &args.table {
            Some(table) => table.clone(),
            None => source
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_string)
                .ok_or_else(|| anyhow!("cannot derive a table name from {}", source.display()))?,
        };
        vec![import_file(&mut store, &source, &table, &options)?]
    } else if source.is_dir() {
        import_dir(&mut store, &source, &options)?
    } else {
        let backup = find_backup(&config.backup_dir, &args.source)?;
        let directory = backup
            .primary_payload()
            .filter(|_| backup.is_csv())
            .ok_or_else(|| anyhow!("{} is not a CSV backup", backup.name))?;
        import_dir(&mut store, directory, &options)?
    };

    let attempted = reports.iter().map(|report| report.attempted).sum::<usize>();
    let written = reports.iter().map(|report| report.written).sum::<usize>();
    let failed_batches = reports.iter().map(|report| report.failed_batches.len()).sum::<usize>();
    if failed_batches > 0 {
        tracing::warn!(failed_batches, "some batches failed to import");
    }
    emit_json(serde_json::json!({
        "command": "import-csv",
        "attempted": attempted,
        "written": written,
        "failed_batches": failed_batches,
        "tables": reports
    }))
}

fn scan_options(config: &EngineConfig, args: &OrphanScanArgs) -> OrphanScanOptions {
    OrphanScanOptions { upload_roots: config.upload_roots.clone(), base_dir: args.base_dir.clone() }
}

fn run_orphans(config: &EngineConfig, command: OrphansCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        OrphansCommand::Scan(args) => {
            let findings = dumpvault_core::orphans::scan(store, &scan_options(config, &args))?;
            emit_json(serde_json::json!({
                "command": "orphans scan",
                "count": findings.len(),
                "findings": findings
            }))
        }
        OrphansCommand::Cleanup(args) => {
            let findings = dumpvault_core::orphans::scan(store, &scan_options(config, &args.scan))?;
            let options =
                CleanupOptions { delete_files: args.delete_files, delete_records: !args.flag_only, dry_run: args.dry_run };
            let report = cleanup(&findings, store, &options);
            emit_json(serde_json::json!({
                "command": "orphans cleanup",
                "findings": findings,
                "report": report
            }))
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => emit_json(serde_json::to_value(store.integrity_check()?)?),
        DbCommand::Snapshot(args) => {
            store.snapshot_database(&args.out)?;
            emit_json(serde_json::json!({ "command": "db snapshot", "out": args.out }))
        }
        DbCommand::RestoreSnapshot(args) => {
            store.restore_snapshot(&args.input)?;
            emit_json(serde_json::json!({ "command": "db restore-snapshot", "in": args.input }))
        }
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

#[cfg(test)]
mod tests {
    use dumpvault_core::RestoreOptions;

    use super::*;

    // Test IDs: TCLI-001
    #[test]
    fn cancelled_restore_fails_the_command() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let statements = split("CREATE TABLE t (id INTEGER);\nINSERT INTO t (id) VALUES (1);\n");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let report = restore(&statements, &mut store, &RestoreOptions::default(), &cancel, |_| trigger.cancel());

        assert!(report.cancelled);
        assert_eq!(report.executed_count, 1);
        let Err(err) = restore_outcome(&report) else {
            panic!("cancelled restore should fail");
        };
        assert_eq!(err.to_string(), "restore cancelled after 1 statements");
        Ok(())
    }

    // Test IDs: TCLI-002
    #[test]
    fn completed_restore_succeeds() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let statements = split("CREATE TABLE t (id INTEGER);\n");
        let report = restore(&statements, &mut store, &RestoreOptions::default(), &CancellationToken::new(), |_| {});
        restore_outcome(&report)
    }
}
