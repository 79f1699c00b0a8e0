//! Lifecycle owner for a set of named sandboxes.

use std::{path::PathBuf, sync::Arc, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[cfg(feature = "archive")]
use crate::importer::{ArchiveImporter, Unpacker, archive::DEFAULT_DEST};
#[cfg(feature = "url")]
use crate::importer::UrlImporter;
use crate::{
    applet::{Applet, AppletOptions},
    cache::DEFAULT_CHECK_INTERVAL,
    engine::Engine,
    error::{Error, Result},
    fs::DirFs,
    importer::{FsImporter, Require},
    registry::RegistryTable,
};

#[cfg(not(feature = "archive"))]
const DEFAULT_DEST: &str = ".box_modules";
const DEFAULT_REPO_SOURCE: &str = "repo";

/// Where packages come from and where they are unpacked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Directory holding package archives named after [`Require::archive_name`].
    pub repo_source: PathBuf,
    /// Directory archives are unpacked into.
    pub repo_dest: PathBuf,
    /// Shared import roots every sandbox falls back to.
    pub public_dirs: Vec<PathBuf>,
    /// Script cache window applied to every sandbox opened by the manager.
    pub check_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            repo_source: PathBuf::from(DEFAULT_REPO_SOURCE),
            repo_dest: PathBuf::from(DEFAULT_DEST),
            public_dirs: Vec::new(),
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

impl ManagerConfig {
    /// Read `SCRIPTBOX_REPO_SOURCE`, `SCRIPTBOX_REPO_DEST`,
    /// `SCRIPTBOX_PUBLIC_DIRS` and `SCRIPTBOX_CHECK_INTERVAL_MS`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    /// Unset or empty variables keep their defaults; invalid ones are logged
    /// and ignored.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = var("SCRIPTBOX_REPO_SOURCE") {
            config.repo_source = PathBuf::from(value);
        }
        if let Some(value) = var("SCRIPTBOX_REPO_DEST") {
            config.repo_dest = PathBuf::from(value);
        }
        if let Some(value) = var("SCRIPTBOX_PUBLIC_DIRS") {
            config.public_dirs = std::env::split_paths(&value)
                .filter(|path| !path.as_os_str().is_empty())
                .collect();
        }
        if let Some(raw) = var("SCRIPTBOX_CHECK_INTERVAL_MS") {
            match raw.parse::<u64>() {
                Ok(ms) => config.check_interval = Duration::from_millis(ms),
                Err(err) => {
                    warn!(
                        %raw,
                        ?err,
                        "Invalid SCRIPTBOX_CHECK_INTERVAL_MS; falling back to default"
                    );
                }
            }
        }

        info!(
            repo_source = %config.repo_source.display(),
            repo_dest = %config.repo_dest.display(),
            public_dirs = ?config.public_dirs,
            check_interval_ms = config.check_interval.as_millis(),
            "applet manager configuration resolved"
        );
        config
    }
}

/// What to open: the sandbox options plus the registries it imports and the
/// packages it requires.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppOptions {
    #[serde(flatten)]
    pub options: AppletOptions,
    #[serde(default, rename = "stdModules")]
    pub modules: Vec<String>,
    #[serde(default)]
    pub requires: Vec<Require>,
}

/// Owns every open sandbox by name.
pub struct AppletManager {
    config: ManagerConfig,
    table: Arc<RegistryTable>,
    engine: Arc<dyn Engine>,
    #[cfg(feature = "archive")]
    unpacker: Unpacker,
    #[cfg(feature = "url")]
    remote: Arc<UrlImporter>,
    applets: DashMap<String, Arc<Applet>>,
}

impl AppletManager {
    #[must_use]
    pub fn new(config: ManagerConfig, table: Arc<RegistryTable>, engine: Arc<dyn Engine>) -> Self {
        Self {
            #[cfg(feature = "archive")]
            unpacker: Unpacker::new(&config.repo_dest),
            #[cfg(feature = "url")]
            remote: Arc::new(UrlImporter::new()),
            config,
            table,
            engine,
            applets: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    #[must_use]
    pub const fn table(&self) -> &Arc<RegistryTable> {
        &self.table
    }

    #[cfg(feature = "archive")]
    #[must_use]
    pub const fn unpacker(&self) -> &Unpacker {
        &self.unpacker
    }

    /// Create and register a sandbox.
    ///
    /// Import resolution order is: the requested registries, then one
    /// importer per required package, then the public directories, then
    /// remote URLs.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateSandboxName`] when the name is taken, or the
    /// construction or package error.
    pub async fn open(&self, app: AppOptions) -> Result<Arc<Applet>> {
        let AppOptions {
            mut options,
            modules,
            requires,
        } = app;
        let name = options.name().to_string();
        if self.applets.contains_key(&name) {
            return Err(Error::DuplicateSandboxName(name));
        }
        options.check_interval(self.config.check_interval);

        let applet = Applet::new(options, Arc::clone(&self.engine)).await?;
        let modules: Vec<&str> = modules.iter().map(String::as_str).collect();
        applet.use_registries(&self.table, &modules);

        if let Err(e) = self.add_requires(&applet, &requires).await {
            applet.shutdown("package import failed").await;
            return Err(e);
        }
        for dir in &self.config.public_dirs {
            applet.with_importer(Arc::new(FsImporter::for_applet(
                &applet,
                Arc::new(DirFs::new(dir)),
            )));
        }
        #[cfg(feature = "url")]
        applet.with_importer(self.remote.clone());

        let inserted = match self.applets.entry(name.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&applet));
                true
            }
        };
        if !inserted {
            applet.shutdown("duplicate sandbox name").await;
            return Err(Error::DuplicateSandboxName(name));
        }
        info!(sandbox = %name, "sandbox opened");
        Ok(applet)
    }

    #[cfg(feature = "archive")]
    async fn add_requires(&self, applet: &Arc<Applet>, requires: &[Require]) -> Result<()> {
        for require in requires {
            let archive = self.config.repo_source.join(require.archive_name());
            let importer = ArchiveImporter::for_applet(&self.unpacker, &archive, applet).await?;
            info!(
                sandbox = %applet.name(),
                package = %require,
                root = %importer.root().display(),
                "package imported"
            );
            applet.with_importer(Arc::new(importer));
        }
        Ok(())
    }

    #[cfg(not(feature = "archive"))]
    async fn add_requires(&self, applet: &Arc<Applet>, requires: &[Require]) -> Result<()> {
        if let Some(require) = requires.first() {
            return Err(Error::package(
                require.archive_name(),
                format!("archive support disabled, sandbox {}", applet.name()),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Applet>> {
        self.applets.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Names of the open sandboxes, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.applets.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.applets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.applets.is_empty()
    }

    /// Shut a sandbox down and forget it.
    ///
    /// # Errors
    /// Returns [`Error::UnknownSandbox`] when no sandbox has that name.
    pub async fn close(&self, name: &str, reason: &str) -> Result<()> {
        let (_, applet) = self
            .applets
            .remove(name)
            .ok_or_else(|| Error::UnknownSandbox(name.to_string()))?;
        applet.shutdown(reason).await;
        Ok(())
    }

    /// Shut every sandbox down concurrently.
    pub async fn shutdown_all(&self, reason: &str) {
        let names = self.names();
        let applets: Vec<Arc<Applet>> = names
            .iter()
            .filter_map(|name| self.applets.remove(name).map(|(_, applet)| applet))
            .collect();
        join_all(applets.iter().map(|applet| applet.shutdown(reason))).await;
        info!(count = applets.len(), reason, "all sandboxes stopped");
    }
}
