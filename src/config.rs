//! Pipeline configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::features::coordinates::PageBase;
use crate::features::storage::preferred_temp_dir;

/// Where signature metadata records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetadataBackend {
    /// One JSON file per record
    #[default]
    Json,
    /// A single SQLite database file
    Sqlite,
}

impl MetadataBackend {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(Error::Config(format!("unknown metadata backend '{other}'"))),
        }
    }
}

fn parse_page_base(value: &str) -> Result<PageBase> {
    match value.trim().to_ascii_lowercase().as_str() {
        "zero_based" | "0" => Ok(PageBase::ZeroBased),
        "one_based" | "1" => Ok(PageBase::OneBased),
        other => Err(Error::Config(format!("unknown page base '{other}'"))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: not a number: '{value}'")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::Config(format!("{key}: not a boolean: '{value}'"))),
    }
}

/// Document pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory for merged intermediate documents.
    pub temp_dir: PathBuf,

    /// Directory for signed output; `None` writes next to the source document.
    pub output_dir: Option<PathBuf>,

    /// Directory holding the metadata store.
    pub metadata_dir: PathBuf,

    pub metadata_backend: MetadataBackend,

    /// Page numbering the external signing vendor expects.
    pub vendor_page_base: PageBase,

    /// Lifetime of a cached vendor access token.
    pub token_ttl_secs: u64,

    pub token_cache_capacity: usize,

    /// Skip stamping a document that already carries a stamp marker from an earlier run.
    pub skip_if_stamped: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        let temp_dir = preferred_temp_dir();
        Self {
            metadata_dir: temp_dir.join("signature_metadata"),
            temp_dir,
            output_dir: None,
            metadata_backend: MetadataBackend::Json,
            vendor_page_base: PageBase::ZeroBased,
            token_ttl_secs: 50 * 60,
            token_cache_capacity: 16,
            skip_if_stamped: false,
        }
    }

    /// Defaults overridden by any `SOLARSIGN_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::new();
        if let Some(v) = lookup("SOLARSIGN_TEMP_DIR") {
            config.temp_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SOLARSIGN_OUTPUT_DIR") {
            config.output_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SOLARSIGN_METADATA_DIR") {
            config.metadata_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SOLARSIGN_METADATA_BACKEND") {
            config.metadata_backend = MetadataBackend::parse(&v)?;
        }
        if let Some(v) = lookup("SOLARSIGN_VENDOR_PAGE_BASE") {
            config.vendor_page_base = parse_page_base(&v)?;
        }
        if let Some(v) = lookup("SOLARSIGN_TOKEN_TTL_SECS") {
            config.token_ttl_secs = parse_number("SOLARSIGN_TOKEN_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("SOLARSIGN_TOKEN_CACHE_CAPACITY") {
            config.token_cache_capacity = parse_number("SOLARSIGN_TOKEN_CACHE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("SOLARSIGN_SKIP_IF_STAMPED") {
            config.skip_if_stamped = parse_flag("SOLARSIGN_SKIP_IF_STAMPED", &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.token_cache_capacity == 0 {
            return Err(Error::Config("token_cache_capacity must be at least 1".into()));
        }
        if self.token_ttl_secs == 0 {
            return Err(Error::Config("token_ttl_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_metadata_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.metadata_dir = dir.into();
        self
    }

    pub fn with_metadata_backend(mut self, backend: MetadataBackend) -> Self {
        self.metadata_backend = backend;
        self
    }

    pub fn with_vendor_page_base(mut self, base: PageBase) -> Self {
        self.vendor_page_base = base;
        self
    }

    pub fn with_token_cache(mut self, ttl_secs: u64, capacity: usize) -> Self {
        self.token_ttl_secs = ttl_secs;
        self.token_cache_capacity = capacity;
        self
    }

    pub fn with_skip_if_stamped(mut self, skip: bool) -> Self {
        self.skip_if_stamped = skip;
        self
    }
}
