//! Optional multi-format loader for [`AgentOpts`] (feature `config`),
//! grounded on the teacher's `config::mod` loader. Scoped to the three
//! formats this crate's `config` dependency enables (TOML, JSON, YAML) —
//! the teacher additionally supports INI, RON and JSON5, which this crate
//! has no use for.

use std::path::Path;

use config::{Config as Cfg, File, FileFormat};
use regex::Regex;
use serde::de::DeserializeOwned;

use crate::runtime::AgentOpts;

/// Errors raised while locating, reading, or parsing a config file.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parsing error: {0}")]
    Parse(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Detects a config format from a file's extension.
///
/// Supported: `.toml`, `.json`, `.yaml`/`.yml`.
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("no file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

/// Substitutes `${VAR}` and `$VAR` references with the named environment
/// variable's value, leaving a reference untouched if the variable is unset.
/// Braced syntax is resolved first so `${VAR}` is never double-substituted
/// by the unbraced pass.
pub fn substitute_env_vars(content: &str) -> String {
    let braced = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex literal");
    let mut result = braced
        .replace_all(content, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string();

    let unbraced = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("valid regex literal");
    result = unbraced
        .replace_all(&result, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string();

    result
}

/// Parses `content` in the given format after env-var substitution.
pub fn from_str<T: DeserializeOwned>(content: &str, format: FileFormat) -> ConfigResult<T> {
    let substituted = substitute_env_vars(content);
    let cfg = Cfg::builder()
        .add_source(File::from_str(&substituted, format))
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    cfg.try_deserialize()
        .map_err(|e| ConfigError::Deserialization(e.to_string()))
}

/// Loads any `DeserializeOwned` type from a file, auto-detecting format from
/// its extension and substituting `${VAR}`/`$VAR` environment references
/// before parsing.
pub fn load<T: DeserializeOwned>(path: &str) -> ConfigResult<T> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    from_str(&content, format)
}

/// Loads [`AgentOpts`] from a TOML/JSON/YAML file. A convenience alias over
/// [`load`] for this crate's one concrete externally-tunable struct.
pub fn load_opts(path: &str) -> ConfigResult<AgentOpts> {
    load(path)
}
