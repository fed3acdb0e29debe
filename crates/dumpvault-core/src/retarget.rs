//! Rewrites database-identity statements in a captured dump so it restores
//! into a differently named database.

use std::sync::OnceLock;

use regex_lite::{Captures, Regex};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RetargetError {
    #[error("invalid target database name `{0}`: must be non-empty without backticks or line breaks")]
    InvalidName(String),
    #[error("retarget patterns failed to compile")]
    Pattern,
}

struct Patterns {
    drop: Regex,
    create: Regex,
    use_db: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                drop: Regex::new(r"(?mi)^(DROP DATABASE IF EXISTS )`[^`\n]*`(;)").ok()?,
                create: Regex::new(r"(?mi)^(CREATE DATABASE [^`;\n]*)`[^`\n]*`([^;\n]*;)").ok()?,
                use_db: Regex::new(r"(?mi)^(USE )`[^`\n]*`(;)").ok()?,
            })
        })
        .as_ref()
}

/// Point every `DROP DATABASE IF EXISTS`, `CREATE DATABASE` and `USE`
/// statement at `database`, leaving all other bytes untouched.
///
/// Idempotent: retargeting already-retargeted text to the same name
/// returns it unchanged.
///
/// # Errors
/// Returns [`RetargetError::InvalidName`] for names that cannot be written
/// as a backtick-quoted identifier.
pub fn retarget(dump_text: &str, database: &str) -> Result<String, RetargetError> {
    validate_database_name(database)?;
    let patterns = patterns().ok_or(RetargetError::Pattern)?;

    let replace = |caps: &Captures<'_>| format!("{}`{database}`{}", &caps[1], &caps[2]);
    let text = patterns.drop.replace_all(dump_text, replace);
    let text = patterns.create.replace_all(&text, replace);
    let text = patterns.use_db.replace_all(&text, replace);
    Ok(text.into_owned())
}

/// Name of the database a dump selects with `USE`, falling back to the one
/// it creates.
#[must_use]
pub fn source_database(dump_text: &str) -> Option<String> {
    let use_pattern = Regex::new(r"(?mi)^USE `([^`\n]*)`;").ok()?;
    if let Some(caps) = use_pattern.captures(dump_text) {
        return Some(caps[1].to_string());
    }
    let create_pattern = Regex::new(r"(?mi)^CREATE DATABASE [^`;\n]*`([^`\n]*)`").ok()?;
    create_pattern.captures(dump_text).map(|caps| caps[1].to_string())
}

/// Check that `database` can be written as a backtick-quoted identifier.
///
/// # Errors
/// Returns [`RetargetError::InvalidName`] when it cannot.
pub fn validate_database_name(database: &str) -> Result<(), RetargetError> {
    if database.trim().is_empty() || database.contains(['`', '\n', '\r', ';']) {
        return Err(RetargetError::InvalidName(database.to_string()));
    }
    Ok(())
}

/// Statements that prepare a target database before replaying a dump.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct RestorePlan {
    /// Rewrite identity statements to this name.
    pub database: Option<String>,
    /// Prepend `CREATE DATABASE IF NOT EXISTS` and `USE`.
    pub create_database: bool,
    /// Prepend `DROP DATABASE IF EXISTS` (only with a target name).
    pub drop_existing: bool,
}

/// Apply a [`RestorePlan`] to dump text.
///
/// # Errors
/// Returns [`RetargetError::InvalidName`] for an unusable target name.
pub fn prepare_restore_script(dump_text: &str, plan: &RestorePlan) -> Result<String, RetargetError> {
    let Some(database) = plan.database.as_deref() else {
        return Ok(dump_text.to_string());
    };
    let retargeted = retarget(dump_text, database)?;

    let mut preamble = String::new();
    if plan.drop_existing {
        preamble.push_str(&format!("DROP DATABASE IF EXISTS `{database}`;\n"));
    }
    if plan.create_database || plan.drop_existing {
        preamble.push_str(&format!("CREATE DATABASE IF NOT EXISTS `{database}`;\n"));
        preamble.push_str(&format!("USE `{database}`;\n"));
    }
    if preamble.is_empty() {
        return Ok(retargeted);
    }
    preamble.push('\n');
    preamble.push_str(&retargeted);
    Ok(preamble)
}
