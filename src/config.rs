// ABOUTME: TOML run configuration with environment overrides for secrets and targets
// ABOUTME: Validated once on load and handed to each component's constructor

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::differ::{RecordDiffer, DEFAULT_COMPARE_FIELDS};
use crate::error::{SyncError, SyncResult};
use crate::record::ColumnMapping;
use crate::sink::layout::{DEFAULT_COLUMNS, DEFAULT_TIMESTAMP_COLUMN};
use crate::sink::sheets::DEFAULT_API_BASE;
use crate::sink::{SheetLayout, SheetsConfig};
use crate::utils::{Backoff, RetryPolicy};
use crate::{detect_source_type, SourceType};

pub const DEFAULT_CONFIG_FILE: &str = "appointment-sync.toml";
pub const ENV_SOURCE_URL: &str = "APPOINTMENT_SYNC_SOURCE_URL";
pub const ENV_BACKEND_URL: &str = "APPOINTMENT_SYNC_BACKEND_URL";
pub const ENV_BACKEND_API_KEY: &str = "APPOINTMENT_SYNC_BACKEND_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub differ: DifferConfig,
    #[serde(default)]
    pub sheets: Vec<SheetConfig>,
    #[serde(default)]
    pub backend: Option<BackendConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    /// `postgresql://...`, `sqlite:<path>` / `*.db`, or a `*.json` row dump
    pub url: String,
    pub query: String,
    /// Upper bound on rows taken from one fetch
    pub max_records: usize,
    pub connect_timeout_secs: u64,
    pub query_timeout_secs: u64,
    /// Accept self-signed certificates on PostgreSQL TLS connections
    pub accept_invalid_certs: bool,
    pub columns: ColumnMapping,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            query: String::new(),
            max_records: 300,
            connect_timeout_secs: 30,
            query_timeout_secs: 60,
            accept_invalid_certs: false,
            columns: ColumnMapping::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotConfig {
    pub path: PathBuf,
    /// Keep `<file>.backup` after a verified save
    pub keep_backup: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("appointments_data.json"),
            keep_backup: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DifferConfig {
    pub compare_fields: Vec<String>,
}

impl Default for DifferConfig {
    fn default() -> Self {
        Self {
            compare_fields: DEFAULT_COMPARE_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl DifferConfig {
    pub fn differ(&self) -> RecordDiffer {
        RecordDiffer::new(self.compare_fields.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SheetConfig {
    pub spreadsheet_id: String,
    pub worksheet: String,
    pub columns: Vec<String>,
    /// Trailing "written at" column; empty disables it
    pub timestamp_column: String,
    pub api_base: String,
    /// Environment variable holding the OAuth bearer token
    pub access_token_env: String,
    pub timeout_secs: u64,
    /// Reconcile (and so empty) the sheet even when the source returned nothing
    pub prune_on_empty: bool,
}

impl Default for SheetConfig {
    fn default() -> Self {
        Self {
            spreadsheet_id: String::new(),
            worksheet: "Hoja1".to_string(),
            columns: DEFAULT_COLUMNS.iter().map(|c| c.to_string()).collect(),
            timestamp_column: DEFAULT_TIMESTAMP_COLUMN.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            access_token_env: "GOOGLE_ACCESS_TOKEN".to_string(),
            timeout_secs: 30,
            prune_on_empty: false,
        }
    }
}

impl SheetConfig {
    pub fn layout(&self) -> SyncResult<SheetLayout> {
        let timestamp = Some(self.timestamp_column.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        SheetLayout::new(self.columns.clone(), timestamp).map_err(SyncError::Config)
    }

    /// Connection settings, reading the token from the configured variable.
    pub fn connection(&self) -> SyncResult<SheetsConfig> {
        let access_token = std::env::var(&self.access_token_env).map_err(|_| {
            SyncError::SinkAuth(format!(
                "environment variable {} is not set",
                self.access_token_env
            ))
        })?;
        Ok(SheetsConfig {
            api_base: self.api_base.clone(),
            spreadsheet_id: self.spreadsheet_id.clone(),
            worksheet: self.worksheet.clone(),
            access_token,
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3001".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delay_secs: u64,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            delay_secs: policy.delay.as_secs(),
            backoff: policy.backoff,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            delay: Duration::from_secs(self.delay_secs),
            backoff: self.backoff,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Advisory pid file guarding against overlapping runs
    pub lock_file: Option<PathBuf>,
}

impl SyncConfig {
    /// Read, override from the process environment, and validate.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("failed to read config file {:?}: {}", path, e))
        })?;
        let mut config = Self::parse(&contents)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        tracing::debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn parse(contents: &str) -> SyncResult<Self> {
        toml::from_str(contents).map_err(|e| SyncError::Config(format!("invalid config: {}", e)))
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_SOURCE_URL).filter(|v| !v.is_empty()) {
            self.source.url = url;
        }
        if let Some(url) = lookup(ENV_BACKEND_URL).filter(|v| !v.is_empty()) {
            self.backend.get_or_insert_with(BackendConfig::default).base_url = url;
        }
        if let Some(key) = lookup(ENV_BACKEND_API_KEY).filter(|v| !v.is_empty()) {
            if let Some(backend) = self.backend.as_mut() {
                backend.api_key = Some(key);
            }
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        let invalid = |msg: String| Err(SyncError::Config(msg));

        if self.source.url.trim().is_empty() {
            return invalid(format!(
                "source.url is empty (set it in the config file or {})",
                ENV_SOURCE_URL
            ));
        }
        let source_type =
            detect_source_type(&self.source.url).map_err(|e| SyncError::Config(format!("{:#}", e)))?;
        if source_type != SourceType::JsonFile && self.source.query.trim().is_empty() {
            return invalid("source.query is required for database sources".to_string());
        }
        if self.source.max_records == 0 {
            return invalid("source.max_records must be at least 1".to_string());
        }
        let columns = &self.source.columns;
        if [&columns.id, &columns.created, &columns.modified]
            .iter()
            .any(|c| c.trim().is_empty())
        {
            return invalid("source.columns entries must not be empty".to_string());
        }
        if self.differ.compare_fields.is_empty() {
            return invalid("differ.compare_fields must not be empty".to_string());
        }
        for (i, sheet) in self.sheets.iter().enumerate() {
            if sheet.spreadsheet_id.trim().is_empty() {
                return invalid(format!("sheets[{}].spreadsheet_id is empty", i));
            }
            sheet
                .layout()
                .map_err(|e| SyncError::Config(format!("sheets[{}]: {}", i, e)))?;
        }
        if let Some(backend) = &self.backend {
            url::Url::parse(&backend.base_url).map_err(|e| {
                SyncError::Config(format!("backend.base_url {:?}: {}", backend.base_url, e))
            })?;
        }
        Ok(())
    }
}
