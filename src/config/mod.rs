//! Configuration is read once at startup and handed down explicitly. The sources are, from weakest
//! to strongest: built-in defaults, the TOML config file, `TACKS_*` environment variables.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::{Host, Url};

use crate::utils::dir::default_config_path;

pub const DEFAULT_CONNECTION: &str = "couchbase://localhost";
pub const DEFAULT_SCOPE: &str = "tacks";
pub const DEFAULT_MANAGEMENT_PORT: u16 = 8091;
pub const DEFAULT_KV_PORT: u16 = 11210;
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

const ENV_PREFIX: &str = "TACKS_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing the following fields in the config: {:?}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value '{value}' for '{field}'")]
    InvalidValue { field: &'static str, value: String },

    #[error("invalid connection string '{0}': {1}")]
    InvalidConnection(String, String),
}

/// Configuration exactly as it was found. Every field may be absent until [RawConfig::validate].
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct RawConfig {
    pub connection: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub bucket: Option<String>,
    pub scope: Option<String>,
    pub management_port: Option<u16>,
    pub kv_port: Option<u16>,
    pub timeout_secs: Option<u64>,
}

/// Raw configuration together with the file it came from.
#[derive(Debug)]
pub struct LoadedConfig {
    pub raw: RawConfig,
    pub file: Option<PathBuf>,
}

impl RawConfig {
    /// Reads `explicit` if given, otherwise the default config file if it exists, then applies the
    /// process environment.
    pub fn load(explicit: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
        let file = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|path| path.exists()),
        };

        let raw = match &file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        Ok(LoadedConfig {
            raw: raw.with_env(std::env::vars())?,
            file,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Reading config from {path:?}");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overrides fields with `TACKS_<FIELD>` variables, e.g. `TACKS_PASSWORD`.
    pub fn with_env(
        mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, ConfigError> {
        for (name, value) in vars {
            let Some(field) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match field {
                "CONNECTION" => self.connection = Some(value),
                "USERNAME" => self.username = Some(value),
                "PASSWORD" => self.password = Some(value),
                "BUCKET" => self.bucket = Some(value),
                "SCOPE" => self.scope = Some(value),
                "MANAGEMENT_PORT" => {
                    self.management_port = Some(parse_number("management_port", value)?)
                }
                "KV_PORT" => self.kv_port = Some(parse_number("kv_port", value)?),
                "TIMEOUT_SECS" => self.timeout_secs = Some(parse_number("timeout_secs", value)?),
                _ => debug!("Ignoring unknown variable {name}"),
            }
        }
        Ok(self)
    }

    /// Checks that every required field is present and reports all missing ones at once.
    pub fn validate(self) -> Result<Config, ConfigError> {
        fn present(value: Option<String>) -> Option<String> {
            value.filter(|v| !v.trim().is_empty())
        }

        let username = present(self.username);
        let password = present(self.password);
        let bucket = present(self.bucket);

        let missing = [
            ("username", username.is_none()),
            ("password", password.is_none()),
            ("bucket", bucket.is_none()),
        ]
        .into_iter()
        .filter_map(|(field, missing)| missing.then_some(field))
        .collect::<Vec<_>>();

        let (Some(username), Some(password), Some(bucket)) = (username, password, bucket) else {
            return Err(ConfigError::MissingFields(missing));
        };

        let connection = present(self.connection).unwrap_or_else(|| DEFAULT_CONNECTION.into());
        let endpoint = Endpoint::parse(
            &connection,
            self.kv_port.unwrap_or(DEFAULT_KV_PORT),
            self.management_port.unwrap_or(DEFAULT_MANAGEMENT_PORT),
        )?;

        Ok(Config {
            endpoint,
            username,
            password,
            bucket,
            scope: present(self.scope).unwrap_or_else(|| DEFAULT_SCOPE.into()),
            timeout: Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
        })
    }
}

fn parse_number<T: std::str::FromStr>(
    field: &'static str,
    value: String,
) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidValue { field, value })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub kv_port: u16,
    pub management_port: u16,
}

impl Endpoint {
    /// Accepts `couchbase://host[:port]`. A port in the connection string is the data port, unless
    /// it is the management port: `couchbase://host:8091` names the HTTP bootstrap port and leaves
    /// the data port at `kv_port`.
    pub fn parse(
        connection: &str,
        kv_port: u16,
        management_port: u16,
    ) -> Result<Self, ConfigError> {
        let invalid =
            |reason: &str| ConfigError::InvalidConnection(connection.into(), reason.into());

        let url = Url::parse(connection).map_err(|e| invalid(&e.to_string()))?;
        match url.scheme() {
            "couchbase" => {}
            "couchbases" => return Err(invalid("TLS connections are not supported")),
            other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_owned(),
            Some(Host::Ipv4(address)) => address.to_string(),
            Some(Host::Ipv6(address)) => address.to_string(),
            _ => return Err(invalid("missing host")),
        };

        let kv_port = match url.port() {
            Some(port) if port != management_port => port,
            _ => kv_port,
        };

        Ok(Self {
            host,
            kv_port,
            management_port,
        })
    }
}

/// Validated configuration, constructed once and passed to whatever connects to the store.
#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    pub endpoint: Endpoint,
    pub username: String,
    pub password: String,
    pub bucket: String,
    pub scope: String,
    pub timeout: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"***")
            .field("bucket", &self.bucket)
            .field("scope", &self.scope)
            .field("timeout", &self.timeout)
            .finish()
    }
}
