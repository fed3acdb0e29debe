//! Engine configuration, loaded from YAML.
//!
//! Every field has a default, so an empty document (or no file at the
//! default location) yields a usable configuration. Components never read
//! this directly; callers derive each component's options from it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::SqlDialect;
use crate::csv::CsvFormat;
use crate::restore::{RestoreOptions, DEFAULT_TOLERATED_ERROR_PATTERNS};
use crate::serializer::DumpOptions;
use crate::strategy::ExternalToolConfig;

pub const DEFAULT_CONFIG_FILE: &str = "dumpvault.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("unknown environment `{0}`")]
    UnknownEnvironment(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Directory holding one `<database>.sqlite3` file per database.
    pub data_dir: PathBuf,
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RestoreConfig {
    pub tolerated_errors: Vec<String>,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self { tolerated_errors: DEFAULT_TOLERATED_ERROR_PATTERNS.iter().map(ToString::to_string).collect() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DumpConfig {
    pub drop_tables: bool,
    pub disable_foreign_keys: bool,
    pub max_rows_per_insert: Option<usize>,
    /// Use this program instead of the in-process dump.
    pub external_tool: Option<ExternalToolConfig>,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self { drop_tables: true, disable_foreign_keys: true, max_rows_per_insert: None, external_tool: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub backup_dir: PathBuf,
    pub upload_roots: Vec<PathBuf>,
    pub default_environment: String,
    pub environments: BTreeMap<String, EnvironmentConfig>,
    /// Literal dialect for generated SQL; the bundled store speaks SQLite.
    pub dialect: SqlDialect,
    pub restore: RestoreConfig,
    pub csv: CsvFormat,
    pub dump: DumpConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut environments = BTreeMap::new();
        environments.insert(
            "development".to_string(),
            EnvironmentConfig { data_dir: PathBuf::from("data"), database: "cms".to_string() },
        );
        Self {
            backup_dir: PathBuf::from("backups"),
            upload_roots: vec![PathBuf::from("uploads")],
            default_environment: "development".to_string(),
            environments,
            dialect: SqlDialect::Sqlite,
            restore: RestoreConfig::default(),
            csv: CsvFormat::default(),
            dump: DumpConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `path`, or from [`DEFAULT_CONFIG_FILE`] when it exists.
    ///
    /// # Errors
    /// Returns [`ConfigError::Read`] when an explicitly named file cannot be
    /// read, [`ConfigError::Parse`] for malformed YAML, and
    /// [`ConfigError::Invalid`] when validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        if !explicit && !path.exists() {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        let config = Self::from_yaml(&text).map_err(|err| match err {
            ConfigError::Parse { message, .. } => ConfigError::Parse { path: path.clone(), message },
            other => other,
        })?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// # Errors
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Invalid`].
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config = if text.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str::<Self>(text)
                .map_err(|err| ConfigError::Parse { path: PathBuf::new(), message: err.to_string() })?
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.csv.validate().map_err(|err| ConfigError::Invalid(err.to_string()))?;
        if self.restore.tolerated_errors.iter().any(|pattern| pattern.trim().is_empty()) {
            return Err(ConfigError::Invalid("restore.tolerated_errors may not contain empty patterns".to_string()));
        }
        if self.dump.max_rows_per_insert == Some(0) {
            return Err(ConfigError::Invalid("dump.max_rows_per_insert must be at least 1".to_string()));
        }
        if let Some(tool) = &self.dump.external_tool {
            if tool.program.trim().is_empty() {
                return Err(ConfigError::Invalid("dump.external_tool.program is empty".to_string()));
            }
        }
        for (name, environment) in &self.environments {
            crate::retarget::validate_database_name(&environment.database)
                .map_err(|err| ConfigError::Invalid(format!("environment {name}: {err}")))?;
        }
        if !self.environments.is_empty() && !self.environments.contains_key(&self.default_environment) {
            return Err(ConfigError::UnknownEnvironment(self.default_environment.clone()));
        }
        Ok(())
    }

    /// Resolve an environment by name, falling back to the default one.
    ///
    /// # Errors
    /// Returns [`ConfigError::UnknownEnvironment`] when it is not configured.
    pub fn environment<'a>(&'a self, name: Option<&'a str>) -> Result<(&'a str, &'a EnvironmentConfig), ConfigError> {
        let name = name.unwrap_or(&self.default_environment);
        self.environments
            .get(name)
            .map(|environment| (name, environment))
            .ok_or_else(|| ConfigError::UnknownEnvironment(name.to_string()))
    }

    #[must_use]
    pub fn restore_options(&self, dry_run: bool) -> RestoreOptions {
        RestoreOptions { tolerated_error_patterns: self.restore.tolerated_errors.clone(), dry_run }
    }

    #[must_use]
    pub fn dump_options(&self) -> DumpOptions {
        DumpOptions {
            dialect: self.dialect,
            drop_tables: self.dump.drop_tables,
            disable_foreign_keys: self.dump.disable_foreign_keys,
            identity: None,
            max_rows_per_insert: self.dump.max_rows_per_insert,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TCFG-001
    #[test]
    fn empty_document_yields_defaults() -> Result<(), ConfigError> {
        let config = EngineConfig::from_yaml("")?;
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.restore_options(false).tolerated_error_patterns, vec!["already exists".to_string()]);
        let (name, environment) = config.environment(None)?;
        assert_eq!(name, "development");
        assert_eq!(environment.database, "cms");
        Ok(())
    }

    // Test IDs: TCFG-002
    #[test]
    fn yaml_overrides_nested_sections() -> Result<(), ConfigError> {
        let yaml = r"
backup_dir: /var/backups/cms
upload_roots: [/srv/uploads, /srv/media]
default_environment: production
environments:
  production:
    data_dir: /srv/data
    database: cms_prod
dialect: sqlite
restore:
  tolerated_errors: ['already exists', 'duplicate column']
csv:
  delimiter: ';'
  header: false
dump:
  drop_tables: false
  external_tool:
    program: sqlite3
    args: ['{file}', '.dump']
";
        let config = EngineConfig::from_yaml(yaml)?;
        assert_eq!(config.backup_dir, PathBuf::from("/var/backups/cms"));
        assert_eq!(config.upload_roots.len(), 2);
        assert_eq!(config.dialect, SqlDialect::Sqlite);
        assert_eq!(config.csv.delimiter, ';');
        assert_eq!(config.csv.quote, '"');
        assert!(!config.csv.header);
        assert_eq!(config.csv.batch_size, 500);
        assert!(!config.dump_options().drop_tables);
        assert!(config.dump_options().disable_foreign_keys);
        assert_eq!(config.restore.tolerated_errors.len(), 2);
        assert_eq!(config.environment(Some("production"))?.1.database, "cms_prod");
        Ok(())
    }

    // Test IDs: TCFG-003
    #[test]
    fn invalid_configurations_are_rejected() {
        let cases = [
            "csv:\n  delimiter: '\"'\n",
            "csv:\n  batch_size: 0\n",
            "restore:\n  tolerated_errors: ['']\n",
            "dump:\n  max_rows_per_insert: 0\n",
            "environments:\n  prod:\n    data_dir: d\n    database: 'a`b'\ndefault_environment: prod\n",
        ];
        for yaml in cases {
            assert!(matches!(EngineConfig::from_yaml(yaml), Err(ConfigError::Invalid(_))), "{yaml}");
        }
        assert!(matches!(
            EngineConfig::from_yaml("default_environment: staging\n"),
            Err(ConfigError::UnknownEnvironment(name)) if name == "staging"
        ));
        assert!(matches!(EngineConfig::from_yaml("bogus_key: 1\n"), Err(ConfigError::Parse { .. })));
    }

    // Test IDs: TCFG-004
    #[test]
    fn explicit_missing_file_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("nope.yaml");
        assert!(matches!(EngineConfig::load(Some(&missing)), Err(ConfigError::Read { .. })));

        let present = dir.path().join("dumpvault.yaml");
        std::fs::write(&present, "backup_dir: elsewhere\n")?;
        assert_eq!(EngineConfig::load(Some(&present))?.backup_dir, PathBuf::from("elsewhere"));
        Ok(())
    }

    // Test IDs: TCFG-005
    #[test]
    fn unknown_environment_lookup_fails() {
        let config = EngineConfig::default();
        assert!(matches!(config.environment(Some("qa")), Err(ConfigError::UnknownEnvironment(_))));
    }
}
