//! Sandbox application configuration.
//!
//! Configuration is discovered from the sandbox file system:
//!
//! 1. Every existing, well-formed file among [`CONFIG_FILES`].
//! 2. Every `*.yml` file inside each existing directory of [`CONFIG_DIRS`],
//!    in name order.
//!
//! Candidates are listed most specific first and applied from last to first,
//! so on a conflicting key the profile specific source wins.
//!
//! Candidates are templates rendered against the sandbox context store, so
//! `{profile}` picks up the active profile. Sources are merged shallowly:
//! a later source replaces whole top-level keys of an earlier one. Malformed
//! sources are logged and skipped.

use std::collections::BTreeMap;

use tracing::{debug, error, info};

use crate::{
    context::ContextStore,
    error::Error,
    fs::{SourceFs, extension, join},
    value::Value,
};

pub const CONFIG_FILES: [&str; 2] = ["application_{profile}.yml", "application.yml"];
pub const CONFIG_DIRS: [&str; 2] = ["config_{profile}", "config"];

const CONFIG_EXT: &str = ".yml";

/// Merged configuration of one sandbox.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Config {
    values: BTreeMap<String, Value>,
}

impl Config {
    #[must_use]
    pub const fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    /// Look up a dotted path such as `db.primary.url`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut segments = key.split('.');
        let mut current = self.values.get(segments.next()?)?;
        for segment in segments {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }

    #[must_use]
    pub const fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn merge(&mut self, other: BTreeMap<String, Value>) {
        self.values.extend(other);
    }
}

/// Discover and merge configuration for the sandbox named `sandbox`.
pub async fn discover(fs: &dyn SourceFs, ctx: &ContextStore, sandbox: &str) -> Config {
    let mut config = Config::default();

    for candidate in CONFIG_FILES.iter().rev() {
        let path = ctx.render(candidate);
        match fs.stat(&path).await {
            Ok(stat) if !stat.is_dir => {}
            _ => {
                debug!(sandbox, path, "config file not found, skipped");
                continue;
            }
        }
        if let Some(values) = load(fs, &path, sandbox).await {
            info!(sandbox, path, "config file loaded");
            config.merge(values);
        }
    }

    for candidate in CONFIG_DIRS.iter().rev() {
        let dir = ctx.render(candidate);
        let names = match fs.read_dir(&dir).await {
            Ok(names) => names,
            Err(e) => {
                debug!(sandbox, dir, error = %e, "config dir not readable, skipped");
                continue;
            }
        };
        for name in names
            .iter()
            .filter(|name| extension(name) == Some(CONFIG_EXT))
        {
            if let Some(values) = load(fs, &join(&dir, name), sandbox).await {
                config.merge(values);
            }
        }
    }

    config
}

async fn load(fs: &dyn SourceFs, path: &str, sandbox: &str) -> Option<BTreeMap<String, Value>> {
    let parsed = match fs.read(path).await {
        Ok(data) => parse(path, &data),
        Err(e) => Err(Error::source_read(path, e)),
    };
    match parsed {
        Ok(values) => Some(values),
        Err(e) => {
            error!(sandbox, error = %e, "config source skipped");
            None
        }
    }
}

fn parse(path: &str, data: &[u8]) -> Result<BTreeMap<String, Value>, Error> {
    let doc: serde_yaml::Value = serde_yaml::from_slice(data).map_err(|e| Error::ConfigParse {
        path: path.to_string(),
        message: e.to_string(),
    })?;
    match Value::from(doc) {
        Value::Map(values) => Ok(values),
        Value::Undefined => Ok(BTreeMap::new()),
        other => Err(Error::ConfigParse {
            path: path.to_string(),
            message: format!("expected a mapping, found {}", other.type_name()),
        }),
    }
}
