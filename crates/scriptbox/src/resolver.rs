//! Import resolution.
//!
//! A sandbox resolves module names through a [`ModuleResolver`]: first the
//! module maps materialized from the registry table (native registries and
//! raw source modules), then an ordered chain of importers that load
//! packaged code from directories, archives or URLs.

use std::{collections::BTreeMap, collections::HashMap, sync::Arc};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::value::Value;

/// What an import name resolves to.
#[derive(Clone, Debug, PartialEq)]
pub enum ModuleDefinition {
    /// Native members exposed as a map of values.
    Builtin(BTreeMap<String, Value>),
    /// Script source the engine compiles as a module.
    Source(Bytes),
}

#[async_trait::async_trait]
pub trait ModuleGetter: Send + Sync + 'static {
    async fn get(&self, name: &str) -> Option<ModuleDefinition>;
}

#[async_trait::async_trait]
impl<T: ModuleGetter + ?Sized> ModuleGetter for Arc<T> {
    async fn get(&self, name: &str) -> Option<ModuleDefinition> {
        (**self).get(name).await
    }
}

/// Fixed name to module table.
#[derive(Clone, Debug, Default)]
pub struct ModuleMap {
    modules: HashMap<String, ModuleDefinition>,
}

impl ModuleMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_builtin(&mut self, name: impl Into<String>, members: BTreeMap<String, Value>) {
        self.modules
            .insert(name.into(), ModuleDefinition::Builtin(members));
    }

    pub fn add_source(&mut self, name: impl Into<String>, src: impl Into<Bytes>) {
        self.modules
            .insert(name.into(), ModuleDefinition::Source(src.into()));
    }

    /// Copy every entry of `other` into this map, replacing same-named ones.
    pub fn merge(&mut self, other: Self) {
        self.modules.extend(other.modules);
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&ModuleDefinition> {
        self.modules.get(name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[async_trait::async_trait]
impl ModuleGetter for ModuleMap {
    async fn get(&self, name: &str) -> Option<ModuleDefinition> {
        self.modules.get(name).cloned()
    }
}

/// Ordered fallback list; the first importer that knows the name wins.
#[derive(Clone, Default)]
pub struct ImportChain {
    importers: Vec<Arc<dyn ModuleGetter>>,
}

impl ImportChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, importer: Arc<dyn ModuleGetter>) {
        self.importers.push(importer);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.importers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.importers.is_empty()
    }
}

#[async_trait::async_trait]
impl ModuleGetter for ImportChain {
    async fn get(&self, name: &str) -> Option<ModuleDefinition> {
        for importer in &self.importers {
            if let Some(module) = importer.get(name).await {
                return Some(module);
            }
        }
        None
    }
}

/// The composed resolver owned by a sandbox. Appending is safe from any
/// thread; lookups see a snapshot taken when they start.
#[derive(Default)]
pub struct ModuleResolver {
    modules: RwLock<Vec<Arc<dyn ModuleGetter>>>,
    importers: RwLock<ImportChain>,
}

impl ModuleResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a getter consulted before any importer.
    pub fn add_module(&self, getter: Arc<dyn ModuleGetter>) {
        self.modules.write().push(getter);
    }

    /// Append an importer to the fallback chain.
    pub fn add_importer(&self, importer: Arc<dyn ModuleGetter>) {
        self.importers.write().push(importer);
    }

    #[must_use]
    pub fn importer_count(&self) -> usize {
        self.importers.read().len()
    }

    pub async fn resolve(&self, name: &str) -> Option<ModuleDefinition> {
        let modules = self.modules.read().clone();
        for getter in modules {
            if let Some(module) = getter.get(name).await {
                return Some(module);
            }
        }
        let importers = self.importers.read().clone();
        let found = importers.get(name).await;
        if found.is_none() {
            tracing::trace!(module = name, "import not found");
        }
        found
    }
}

#[async_trait::async_trait]
impl ModuleGetter for ModuleResolver {
    async fn get(&self, name: &str) -> Option<ModuleDefinition> {
        self.resolve(name).await
    }
}
