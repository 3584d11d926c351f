use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_TOKENS_DB_NAME: &str = "resume-tokens";
pub const DEFAULT_SERVER_ADDR: &str = "127.0.0.1:18080";

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid option: `dbName` is missing")]
    DbNameMissing,
    #[error("invalid option: `collName` is missing")]
    CollNameMissing,
    #[error("invalid option: `tokensCollSizeInBytes` must be greater than 0")]
    InvalidCollSizeInBytes,
    #[error("invalid option: `dbName` and `tokensDbName` cannot be the same if `collName` and `tokensCollName` are the same")]
    InvalidDbAndCollNames,
    #[error("invalid option: unknown log level `{0}`")]
    InvalidLogLevel(String),
    #[error("duplicate collection configuration: {db_name}.{coll_name}")]
    DuplicateCollection { db_name: String, coll_name: String },
}

/// Log levels accepted in the config file. `Fatal` and `Panic` are kept for
/// compatibility with the file format and map to `tracing`'s `ERROR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Panic,
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            "panic" => Ok(Self::Panic),
            other => Err(Error::InvalidLogLevel(other.to_string())),
        }
    }
}

impl LogLevel {
    pub fn as_tracing(self) -> tracing::Level {
        match self {
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error | Self::Fatal | Self::Panic => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MongoConfig {
    pub uri: String,
    #[serde(default)]
    pub auth_mechanism: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    #[serde(default)]
    pub credentials: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

fn default_server_addr() -> String {
    DEFAULT_SERVER_ADDR.to_string()
}

/// A single collection entry as it appears in the config file, before
/// defaults are applied.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionConfig {
    #[serde(default)]
    pub db_name: String,
    #[serde(default)]
    pub coll_name: String,
    #[serde(default)]
    pub change_stream_pre_and_post_images: bool,
    #[serde(default)]
    pub tokens_db_name: Option<String>,
    #[serde(default)]
    pub tokens_coll_name: Option<String>,
    #[serde(default)]
    pub tokens_coll_capped: bool,
    #[serde(default)]
    pub tokens_coll_size_in_bytes: i64,
    #[serde(default)]
    pub stream_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default)]
    pub log: LogConfig,
    pub mongo: MongoConfig,
    pub nats: NatsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub collections: Vec<CollectionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileConfig {
    connector: ConnectorConfig,
}

/// A watched collection with all defaults resolved and invariants checked.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Collection {
    pub db_name: String,
    pub coll_name: String,
    pub change_stream_pre_and_post_images: bool,
    pub tokens_db_name: String,
    pub tokens_coll_name: String,
    pub tokens_coll_capped: bool,
    pub tokens_coll_size_in_bytes: i64,
    pub stream_name: String,
}

impl Collection {
    pub fn new(cfg: CollectionConfig) -> Result<Self, Error> {
        if cfg.db_name.is_empty() {
            return Err(Error::DbNameMissing);
        }
        if cfg.coll_name.is_empty() {
            return Err(Error::CollNameMissing);
        }
        if cfg.tokens_coll_capped && cfg.tokens_coll_size_in_bytes <= 0 {
            return Err(Error::InvalidCollSizeInBytes);
        }

        let tokens_db_name = cfg
            .tokens_db_name
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_TOKENS_DB_NAME.to_string());
        let tokens_coll_name = cfg
            .tokens_coll_name
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| cfg.coll_name.clone());
        let stream_name = cfg
            .stream_name
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| cfg.coll_name.to_uppercase());

        // Resume tokens must never live in the watched collection itself.
        if cfg.db_name.eq_ignore_ascii_case(&tokens_db_name)
            && cfg.coll_name.eq_ignore_ascii_case(&tokens_coll_name)
        {
            return Err(Error::InvalidDbAndCollNames);
        }

        Ok(Self {
            db_name: cfg.db_name,
            coll_name: cfg.coll_name,
            change_stream_pre_and_post_images: cfg.change_stream_pre_and_post_images,
            tokens_db_name,
            tokens_coll_name,
            tokens_coll_capped: cfg.tokens_coll_capped,
            tokens_coll_size_in_bytes: if cfg.tokens_coll_capped {
                cfg.tokens_coll_size_in_bytes
            } else {
                0
            },
            stream_name,
        })
    }
}

/// Validated application settings. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_level: LogLevel,
    pub mongo: MongoConfig,
    pub nats: NatsConfig,
    pub server_addr: String,
    collections: Vec<Collection>,
}

impl Settings {
    /// Validates the raw config tree and resolves per-collection defaults.
    pub fn new(cfg: ConnectorConfig) -> Result<Self, Error> {
        let log_level = match cfg.log.level.as_deref() {
            Some(level) => level.parse()?,
            None => LogLevel::Info,
        };

        let mut collections = Vec::with_capacity(cfg.collections.len());
        for coll_cfg in cfg.collections {
            let coll = Collection::new(coll_cfg)?;
            if collections
                .iter()
                .any(|existing: &Collection| {
                    existing.db_name == coll.db_name && existing.coll_name == coll.coll_name
                })
            {
                return Err(Error::DuplicateCollection {
                    db_name: coll.db_name,
                    coll_name: coll.coll_name,
                });
            }
            collections.push(coll);
        }

        Ok(Self {
            log_level,
            mongo: cfg.mongo,
            nats: cfg.nats,
            server_addr: cfg.server.addr,
            collections,
        })
    }

    /// Loads settings from a YAML file, applying environment overrides
    /// (`LOG_LEVEL`, `MONGO_URI`, `NATS_URL`, `SERVER_ADDR`) on top.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: FileConfig =
            serde_yaml::from_str(&contents).map_err(|source| Error::Parse {
                path: path.display().to_string(),
                source,
            })?;
        let mut cfg = file.connector;

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            cfg.log.level = Some(level);
        }
        if let Ok(uri) = std::env::var("MONGO_URI") {
            cfg.mongo.uri = uri;
        }
        if let Ok(url) = std::env::var("NATS_URL") {
            cfg.nats.url = url;
        }
        if let Ok(addr) = std::env::var("SERVER_ADDR") {
            cfg.server.addr = addr;
        }

        Self::new(cfg)
    }

    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }
}
