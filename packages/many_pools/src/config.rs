//! Read-only configuration lookup.
//!
//! The partitioner consumes a handful of hierarchical keys (`hpx.os_threads`, `hpx.scheduler`,
//! ...) from whatever configuration store the embedding runtime maintains. Only the lookup is
//! specified here; merging of defaults, files, command line and environment happens upstream.

use std::str::FromStr;

use foldhash::{HashMap, HashMapExt};

/// Read-only key-to-value lookup over hierarchical configuration keys.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigStore {
    /// Returns the value for `key`, or `None` if the key is not present.
    fn get(&self, key: &str) -> Option<String>;
}

/// Returns the value for `key` parsed as `T`, or `default` when the key is absent or does not
/// parse.
pub(crate) fn entry_as<T, C>(config: &C, key: &str, default: T) -> T
where
    T: FromStr,
    C: ConfigStore + ?Sized,
{
    config
        .get(key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// An in-memory [`ConfigStore`] backed by a hash map.
///
/// Primarily useful for tests and for embedders whose configuration is already resolved into a
/// flat map.
///
/// # Example
///
/// ```
/// use many_pools::{ConfigStore, MapConfig};
///
/// let config = MapConfig::new()
///     .with("hpx.os_threads", "4")
///     .with("hpx.scheduler", "local-priority-fifo");
///
/// assert_eq!(config.get("hpx.os_threads").as_deref(), Some("4"));
/// assert_eq!(config.get("hpx.pu_step"), None);
/// ```
#[derive(Clone, Debug, Default)]
pub struct MapConfig {
    entries: HashMap<String, String>,
}

impl MapConfig {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Adds or replaces an entry, consuming and returning the configuration.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }
}

impl ConfigStore for MapConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }
}
