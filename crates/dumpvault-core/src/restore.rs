//! Replays statements against a target connection.
//!
//! Each statement moves `pending -> executing -> {succeeded | tolerated |
//! fatal}`. A fatal failure stops the replay and is reported together with
//! the progress made so far; nothing is rolled back. No statement is ever
//! retried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::connection::SqlConnection;
use crate::splitter::Statement;

pub const DEFAULT_TOLERATED_ERROR_PATTERNS: &[&str] = &["already exists"];

const PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RestoreOptions {
    /// Case-insensitive substrings marking an execution error as benign.
    pub tolerated_error_patterns: Vec<String>,
    /// Count statements without executing any of them.
    pub dry_run: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            tolerated_error_patterns: DEFAULT_TOLERATED_ERROR_PATTERNS
                .iter()
                .map(ToString::to_string)
                .collect(),
            dry_run: false,
        }
    }
}

impl RestoreOptions {
    fn tolerates(&self, message: &str) -> bool {
        let lowered = message.to_lowercase();
        self.tolerated_error_patterns
            .iter()
            .any(|pattern| !pattern.is_empty() && lowered.contains(&pattern.to_lowercase()))
    }
}

/// Shared flag checked between statements; a statement already sent to the
/// database always runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StatementOutcome {
    Succeeded,
    Tolerated,
    Fatal,
    Skipped,
}

/// Emitted after every statement.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RestoreProgress {
    /// Zero-based index of the statement just handled.
    pub index: usize,
    pub total: usize,
    pub outcome: StatementOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatementFailure {
    pub index: usize,
    pub statement: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RestoreReport {
    pub total_statements: usize,
    pub executed_count: usize,
    pub created_tables: Vec<String>,
    pub tolerated_warnings: Vec<StatementFailure>,
    pub fatal: Option<StatementFailure>,
    pub dry_run: bool,
    pub cancelled: bool,
}

impl RestoreReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.fatal.is_none() && !self.cancelled
    }
}

/// Replay `statements` in order.
///
/// `on_progress` is invoked after each statement (including in dry-run
/// mode), so callers can report `N/total` while thousands of statements run.
pub fn restore<C, F>(
    statements: &[Statement],
    conn: &mut C,
    options: &RestoreOptions,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> RestoreReport
where
    C: SqlConnection + ?Sized,
    F: FnMut(&RestoreProgress),
{
    let total = statements.len();
    let mut report =
        RestoreReport { total_statements: total, dry_run: options.dry_run, ..RestoreReport::default() };

    if options.dry_run {
        for index in 0..total {
            on_progress(&RestoreProgress { index, total, outcome: StatementOutcome::Skipped });
        }
        tracing::info!(statements = total, "dry run: no statements executed");
        return report;
    }

    for (index, statement) in statements.iter().enumerate() {
        if cancel.is_cancelled() {
            tracing::warn!(index, total, "restore cancelled between statements");
            report.cancelled = true;
            break;
        }

        let outcome = match conn.execute(statement.as_str()) {
            Ok(_) => {
                report.executed_count += 1;
                if let Some(table) = created_table_name(statement.as_str()) {
                    if !report.created_tables.contains(&table) {
                        report.created_tables.push(table);
                    }
                }
                StatementOutcome::Succeeded
            }
            Err(err) if options.tolerates(&err.message) => {
                tracing::warn!(index, error = %err, "tolerated statement failure");
                report.tolerated_warnings.push(StatementFailure {
                    index,
                    statement: statement.preview(PREVIEW_CHARS),
                    message: err.message,
                });
                StatementOutcome::Tolerated
            }
            Err(err) => {
                tracing::error!(index, error = %err, "statement failed; aborting restore");
                report.fatal = Some(StatementFailure {
                    index,
                    statement: statement.preview(PREVIEW_CHARS),
                    message: err.message,
                });
                StatementOutcome::Fatal
            }
        };

        on_progress(&RestoreProgress { index, total, outcome });
        if outcome == StatementOutcome::Fatal {
            break;
        }
    }

    tracing::info!(
        executed = report.executed_count,
        tolerated = report.tolerated_warnings.len(),
        total,
        "restore finished"
    );
    report
}

/// Table named by a `CREATE TABLE` statement, if it is one.
#[must_use]
pub fn created_table_name(statement: &str) -> Option<String> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| {
            Regex::new(
                r#"(?i)^\s*CREATE\s+(?:TEMPORARY\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:`([^`]+)`|"([^"]+)"|\[([^\]]+)\]|([A-Za-z0-9_.$]+))"#,
            )
            .ok()
        })
        .as_ref()?;
    let caps = pattern.captures(statement)?;
    (1..=4).find_map(|group| caps.get(group)).map(|found| found.as_str().to_string())
}

/// Tables a dump would create, for dry-run summaries.
#[must_use]
pub fn planned_tables(statements: &[Statement]) -> Vec<String> {
    let mut tables = Vec::new();
    for statement in statements {
        if let Some(table) = created_table_name(statement.as_str()) {
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
    }
    tables
}
