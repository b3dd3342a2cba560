use crate::core::config::data::{path_display, ConfigDocument};
use crate::core::config::defaults::DEFAULT_CONFIG_FILE_NAME;
use directories::ProjectDirs;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Errors that can occur when loading configuration from disk.
///
/// All variants are fatal to a load. At startup they are surfaced to the
/// caller; during a hot reload they leave the previous snapshot in place.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The server document does not exist.
    #[error("Config not found at {}", path_display(.path))]
    NotFound { path: PathBuf },

    /// Failed to read a configuration file from disk.
    #[error("Failed to read config at {}: {source}", path_display(.path))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file is not valid TOML, JSON, or dotenv syntax.
    #[error("Failed to parse config at {}: {message}", path_display(.path))]
    Parse { path: PathBuf, message: String },

    /// The document parsed but does not describe a usable set of servers.
    #[error("Invalid config at {}: {message}", path_display(.path))]
    Validation { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentFormat {
    Toml,
    Json,
}

impl DocumentFormat {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => DocumentFormat::Json,
            _ => DocumentFormat::Toml,
        }
    }
}

/// Reads and parses the server document, returning it with its modification time.
pub fn read_document(path: &Path) -> Result<(ConfigDocument, Option<SystemTime>), ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let document = parse_document(path, &contents)?;
    Ok((document, modified_time(path)))
}

pub fn parse_document(path: &Path, contents: &str) -> Result<ConfigDocument, ConfigError> {
    let parsed = match DocumentFormat::for_path(path) {
        DocumentFormat::Toml => {
            toml::from_str::<ConfigDocument>(contents).map_err(|err| err.to_string())
        }
        DocumentFormat::Json => {
            serde_json::from_str::<ConfigDocument>(contents).map_err(|err| err.to_string())
        }
    };
    parsed.map_err(|message| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

/// Reads a dotenv-style file into an ordered map. A missing file yields an
/// empty map.
pub fn read_env_file(path: &Path) -> Result<BTreeMap<String, String>, ConfigError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let parse_error = |err: dotenvy::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    };

    let mut vars = BTreeMap::new();
    for item in dotenvy::from_path_iter(path).map_err(parse_error)? {
        let (key, value) = item.map_err(parse_error)?;
        vars.insert(key, value);
    }
    Ok(vars)
}

pub(crate) fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).ok()?.modified().ok()
}

/// Picks the server document to use when none is given on the command line:
/// `./mcp-fleet.toml` when present, otherwise the per-user config directory.
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from(DEFAULT_CONFIG_FILE_NAME);
    if local.exists() {
        return local;
    }
    ProjectDirs::from("org", "mcp-fleet", "mcp-fleet")
        .map(|dirs| dirs.config_dir().join(DEFAULT_CONFIG_FILE_NAME))
        .unwrap_or(local)
}
