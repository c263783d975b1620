use std::{path::PathBuf, sync::Arc, time::Duration};

use serde::Deserialize;
use serde_with::{formats::CommaSeparator, serde_as, DurationMilliSeconds, StringWithSeparator};
use url::Url;

use crate::{
    cache::FileSystemCache,
    db::{Database, RecordTable},
    handle::DEFAULT_REFRESH_INTERVAL,
    ignored::{IgnoredPaths, DEFAULT_IGNORED_DIRECTORIES},
    lock::{
        DatabaseLockProvider, LockProvider, MemoryLockProvider, DEFAULT_LOCK_TIMEOUT,
        DEFAULT_LOCK_TTL,
    },
    store::ResourceStore,
    Error,
};

const DEFAULT_DATABASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where named locks live.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LockProviderKind {
    /// Leases in the database, shared by all instances.
    #[default]
    Database,
    /// Only visible inside this process.
    Memory,
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourceStoreConfig {
    /// The database file. In-memory if unset.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Base directory of the local overlay. A temporary directory if unset.
    #[serde(default)]
    pub cache_directory: Option<PathBuf>,

    #[serde(default = "default_ignored_directories")]
    pub ignored_directories: Vec<String>,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_database_timeout")]
    pub database_timeout: Duration,

    /// Stored with lock leases, to tell instances apart.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    #[serde(default)]
    pub locks: LockProviderKind,
}

impl Default for ResourceStoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            cache_directory: None,
            ignored_directories: default_ignored_directories(),
            refresh_interval: default_refresh_interval(),
            lock_timeout: default_lock_timeout(),
            lock_ttl: default_lock_ttl(),
            database_timeout: default_database_timeout(),
            instance_id: default_instance_id(),
            locks: LockProviderKind::default(),
        }
    }
}

impl ResourceStoreConfig {
    pub fn build(&self) -> Result<ResourceStore, Error> {
        let db = Arc::new(match &self.path {
            Some(path) => Database::open(path, self.database_timeout)?,
            None => Database::open_in_memory()?,
        });

        let locks: Arc<dyn LockProvider> = match self.locks {
            LockProviderKind::Database => Arc::new(DatabaseLockProvider::new(
                db.clone(),
                self.instance_id.clone(),
                self.lock_timeout,
                self.lock_ttl,
            )),
            LockProviderKind::Memory => Arc::new(MemoryLockProvider::new(self.lock_timeout)),
        };

        let cache = match &self.cache_directory {
            Some(dir) => FileSystemCache::new(dir.clone())?,
            None => FileSystemCache::new_temporary()?,
        };

        Ok(ResourceStore::new(
            RecordTable::new(db),
            locks,
            cache,
            IgnoredPaths::new(&self.ignored_directories)?,
            self.refresh_interval,
        ))
    }
}

/// The query parameters of a store URL. Everything arrives as a string.
#[serde_as]
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct UrlParameters {
    cache_directory: Option<PathBuf>,
    #[serde_as(as = "Option<StringWithSeparator::<CommaSeparator, String>>")]
    #[serde(default)]
    ignored_directories: Option<Vec<String>>,
    #[serde_as(as = "Option<DurationMilliSeconds<String>>")]
    #[serde(default)]
    refresh_interval: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<String>>")]
    #[serde(default)]
    lock_timeout: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<String>>")]
    #[serde(default)]
    lock_ttl: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<String>>")]
    #[serde(default)]
    database_timeout: Option<Duration>,
    instance_id: Option<String>,
    locks: Option<LockProviderKind>,
}

impl TryFrom<Url> for ResourceStoreConfig {
    type Error = Error;

    fn try_from(url: Url) -> Result<Self, Self::Error> {
        if url.scheme() != "sqlite" {
            return Err(Error::InvalidRequest(format!(
                "unknown scheme: {}",
                url.scheme()
            )));
        }

        // sqlite doesn't support host, and a path can be provided (otherwise
        // it'll live in memory only).
        if url.has_host() {
            return Err(Error::InvalidRequest("no host allowed".to_string()));
        }
        if url.path() == "/" {
            return Err(Error::InvalidRequest(
                "cowardly refusing to open / with sqlite".to_string(),
            ));
        }

        let params: UrlParameters = serde_qs::from_str(url.query().unwrap_or_default())
            .map_err(|e| Error::InvalidRequest(format!("failed to parse parameters: {}", e)))?;

        let defaults = ResourceStoreConfig::default();
        Ok(ResourceStoreConfig {
            path: (!url.path().is_empty()).then(|| url.path().into()),
            cache_directory: params.cache_directory,
            ignored_directories: params
                .ignored_directories
                .unwrap_or(defaults.ignored_directories),
            refresh_interval: params.refresh_interval.unwrap_or(defaults.refresh_interval),
            lock_timeout: params.lock_timeout.unwrap_or(defaults.lock_timeout),
            lock_ttl: params.lock_ttl.unwrap_or(defaults.lock_ttl),
            database_timeout: params.database_timeout.unwrap_or(defaults.database_timeout),
            instance_id: params.instance_id.unwrap_or(defaults.instance_id),
            locks: params.locks.unwrap_or(defaults.locks),
        })
    }
}

/// Constructs a [ResourceStore] from an URI.
///
/// The following URIs are supported:
/// - `sqlite://`
///   Uses an in-memory database, only visible to this process.
/// - `sqlite:///absolute/path/to/store.db`
///   Uses the database file at that path, which several processes can share.
///
/// Query parameters set the other fields of [ResourceStoreConfig], e.g.
/// `sqlite:///var/lib/store.db?cache_directory=/var/cache/store&refresh_interval=500&ignored_directories=temp,tmp`.
pub fn from_addr(uri: &str) -> Result<ResourceStore, Error> {
    let url =
        Url::parse(uri).map_err(|e| Error::InvalidRequest(format!("unable to parse url: {}", e)))?;

    ResourceStoreConfig::try_from(url)?.build()
}

fn default_ignored_directories() -> Vec<String> {
    DEFAULT_IGNORED_DIRECTORIES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_refresh_interval() -> Duration {
    DEFAULT_REFRESH_INTERVAL
}

fn default_lock_timeout() -> Duration {
    DEFAULT_LOCK_TIMEOUT
}

fn default_lock_ttl() -> Duration {
    DEFAULT_LOCK_TTL
}

fn default_database_timeout() -> Duration {
    DEFAULT_DATABASE_TIMEOUT
}

/// `<hostname>-<pid>`, falling back to `localhost` if the hostname is unknown.
pub fn default_instance_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}
