//! Retention: decide which catalogued backups to prune, then prune them.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::catalog::Backup;

/// A backup is deleted when either configured rule would delete it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RetentionPolicy {
    /// Keep the newest N backups.
    pub keep_count: Option<usize>,
    /// Keep backups captured within the last D days.
    pub keep_newer_than_days: Option<u32>,
}

impl RetentionPolicy {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keep_count.is_none() && self.keep_newer_than_days.is_none()
    }
}

/// Backups partitioned by a policy, each side newest first.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RetentionPlan {
    pub to_delete: Vec<Backup>,
    pub to_keep: Vec<Backup>,
}

/// Newest first by captured timestamp; unknown timestamps sort last and
/// ties keep discovery order.
#[must_use]
pub fn newest_first(backups: &[Backup]) -> Vec<Backup> {
    let mut sorted = backups.to_vec();
    sorted.sort_by(|left, right| {
        right
            .captured_at
            .cmp(&left.captured_at)
            .then_with(|| left.discovery_index.cmp(&right.discovery_index))
    });
    sorted
}

/// Union of "beyond the newest `keep_count`" and "older than
/// `keep_newer_than_days`". A backup with no known timestamp is never
/// judged too old.
#[must_use]
pub fn compute_deletion_set(backups: &[Backup], policy: &RetentionPolicy, now: OffsetDateTime) -> RetentionPlan {
    let cutoff = policy
        .keep_newer_than_days
        .map(|days| now - Duration::days(i64::from(days)));

    let mut plan = RetentionPlan::default();
    for (rank, backup) in newest_first(backups).into_iter().enumerate() {
        let beyond_count = policy.keep_count.is_some_and(|keep| rank >= keep);
        let too_old = match (cutoff, backup.captured_at) {
            (Some(cutoff), Some(at)) => at < cutoff,
            _ => false,
        };
        if beyond_count || too_old {
            plan.to_delete.push(backup);
        } else {
            plan.to_keep.push(backup);
        }
    }
    plan
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionOutcome {
    pub dry_run: bool,
    pub deleted: Vec<String>,
    pub kept: Vec<String>,
    pub removed_files: Vec<PathBuf>,
    pub errors: Vec<String>,
}

/// Remove every artifact of the backups in `plan.to_delete`. With
/// `dry_run` the outcome lists what would go and nothing is touched.
#[must_use]
pub fn apply(plan: &RetentionPlan, dry_run: bool) -> RetentionOutcome {
    let mut outcome = RetentionOutcome {
        dry_run,
        kept: plan.to_keep.iter().map(|backup| backup.name.clone()).collect(),
        ..RetentionOutcome::default()
    };

    for backup in &plan.to_delete {
        outcome.deleted.push(backup.name.clone());
        for file in backup.files() {
            if dry_run {
                outcome.removed_files.push(file.to_path_buf());
                continue;
            }
            let removed = if file.is_dir() { fs::remove_dir_all(file) } else { fs::remove_file(file) };
            match removed {
                Ok(()) => outcome.removed_files.push(file.to_path_buf()),
                Err(err) => {
                    tracing::warn!(file = %file.display(), error = %err, "failed to delete backup artifact");
                    outcome.errors.push(format!("{}: {err}", file.display()));
                }
            }
        }
        tracing::info!(backup = %backup.name, dry_run, "pruned backup");
    }
    outcome
}
