//! Native capability registries and the table that composes them.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::{
    applet::Applet,
    error::BoxError,
    hook::Hook,
    resolver::{ModuleDefinition, ModuleMap},
    transpile::{TranspileStep, TranspilerChain},
    value::Value,
};

/// Name that selects every known module.
pub const ALL: &str = "*";

/// Native function that receives the sandbox it was materialized for.
pub type BoundFunction =
    Arc<dyn Fn(&Arc<Applet>, &[Value]) -> Result<Value, BoxError> + Send + Sync>;

/// A named bundle of native functions plus the transpile steps and hooks a
/// sandbox picks up when it imports the bundle.
#[derive(Clone)]
pub struct Registry {
    name: String,
    entries: BTreeMap<String, Value>,
    bound: BTreeMap<String, BoundFunction>,
    transpilers: Vec<TranspileStep>,
    hooks: Vec<Hook>,
}

impl Registry {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
            bound: BTreeMap::new(),
            transpilers: Vec::new(),
            hooks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.insert(name.into(), value.into());
        self
    }

    /// Add a context-free native function.
    #[must_use]
    pub fn with_function(
        self,
        name: impl Into<String>,
        f: impl Fn(&[Value]) -> Result<Value, BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.with_value(name, Value::function(f))
    }

    /// Add a function that is handed the importing sandbox on every call.
    #[must_use]
    pub fn with_bound_function(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&Arc<Applet>, &[Value]) -> Result<Value, BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.bound.insert(name.into(), Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_transpiler(mut self, step: TranspileStep) -> Self {
        self.transpilers.push(step);
        self
    }

    #[must_use]
    pub fn with_hook(mut self, hook: Hook) -> Self {
        self.hooks.push(hook);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Member names, sorted.
    #[must_use]
    pub fn all_names(&self) -> Vec<String> {
        self.entries
            .keys()
            .chain(self.bound.keys())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    #[must_use]
    pub fn transpilers(&self) -> &[TranspileStep] {
        &self.transpilers
    }

    #[must_use]
    pub fn hooks(&self) -> &[Hook] {
        &self.hooks
    }

    /// Build the module members for `applet`. An empty selection or `"*"`
    /// selects every member; unknown members are ignored.
    #[must_use]
    pub fn module(&self, applet: &Arc<Applet>, members: &[&str]) -> BTreeMap<String, Value> {
        let selected = if members.is_empty() || members == [ALL] {
            self.all_names()
        } else {
            members.iter().map(ToString::to_string).collect()
        };

        let mut module = BTreeMap::new();
        for name in selected {
            if let Some(f) = self.bound.get(&name) {
                module.insert(name, bind(applet, Arc::clone(f)));
            } else if let Some(v) = self.entries.get(&name) {
                module.insert(name, v.clone());
            }
        }
        module
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("members", &self.all_names())
            .field("transpilers", &self.transpilers.len())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

fn bind(applet: &Arc<Applet>, f: BoundFunction) -> Value {
    // Weak so a sandbox's own modules do not keep it alive.
    let applet: Weak<Applet> = Arc::downgrade(applet);
    Value::function(move |args| {
        let applet = applet
            .upgrade()
            .ok_or_else(|| BoxError::from("sandbox dropped"))?;
        f(&applet, args)
    })
}

/// Everything a sandbox takes from the table for one set of names.
#[derive(Debug, Default)]
pub struct Materialized {
    pub modules: ModuleMap,
    pub transpiler: TranspilerChain,
    pub hooks: Vec<Hook>,
}

/// Composition of native registries, raw source modules and prebuilt module
/// maps. Lookups by name prefer a registry, then a source module, then a
/// module map entry.
#[derive(Default)]
pub struct RegistryTable {
    registries: RwLock<HashMap<String, Arc<Registry>>>,
    sources: RwLock<HashMap<String, Bytes>>,
    modules: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl RegistryTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_registry(self, registry: Registry) -> Self {
        self.register(registry);
        self
    }

    #[must_use]
    pub fn with_source_module(self, name: impl Into<String>, src: impl Into<Bytes>) -> Self {
        self.sources.write().insert(name.into(), src.into());
        self
    }

    #[must_use]
    pub fn with_module(self, name: impl Into<String>, members: BTreeMap<String, Value>) -> Self {
        self.modules.write().insert(name.into(), members);
        self
    }

    /// Add or replace a registry on a shared table.
    pub fn register(&self, registry: Registry) {
        self.registries
            .write()
            .insert(registry.name().to_string(), Arc::new(registry));
    }

    /// Forget registries by name.
    pub fn remove(&self, names: &[&str]) {
        let mut registries = self.registries.write();
        for name in names {
            registries.remove(*name);
        }
    }

    #[must_use]
    pub fn registry(&self, name: &str) -> Option<Arc<Registry>> {
        self.registries.read().get(name).cloned()
    }

    #[must_use]
    pub fn registry_names(&self) -> Vec<String> {
        sorted(self.registries.read().keys())
    }

    #[must_use]
    pub fn source_names(&self) -> Vec<String> {
        sorted(self.sources.read().keys())
    }

    /// Every name the table can materialize, sorted and deduplicated.
    #[must_use]
    pub fn all_names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.registries.read().keys().cloned().collect();
        names.extend(self.sources.read().keys().cloned());
        names.extend(self.modules.read().keys().cloned());
        names.into_iter().collect()
    }

    /// Resolve a single name with the table's precedence.
    #[must_use]
    pub fn resolve(&self, applet: &Arc<Applet>, name: &str) -> Option<ModuleDefinition> {
        if let Some(registry) = self.registry(name) {
            return Some(ModuleDefinition::Builtin(registry.module(applet, &[])));
        }
        if let Some(src) = self.sources.read().get(name) {
            return Some(ModuleDefinition::Source(src.clone()));
        }
        self.modules
            .read()
            .get(name)
            .map(|members| ModuleDefinition::Builtin(members.clone()))
    }

    /// Build the modules for `names` (or every name for `"*"`), together with
    /// the transpile steps and hooks of the registries among them. Unknown
    /// names are skipped.
    #[must_use]
    pub fn materialize(&self, applet: &Arc<Applet>, names: &[&str]) -> Materialized {
        let names: Vec<String> = if names.contains(&ALL) {
            self.all_names()
        } else {
            names.iter().map(ToString::to_string).collect()
        };

        let mut out = Materialized::default();
        for name in &names {
            if let Some(registry) = self.registry(name) {
                out.transpiler.extend(registry.transpilers().iter().cloned());
                out.hooks.extend(registry.hooks().iter().cloned());
            }
            match self.resolve(applet, name) {
                Some(ModuleDefinition::Builtin(members)) => out.modules.add_builtin(name, members),
                Some(ModuleDefinition::Source(src)) => out.modules.add_source(name, src),
                None => tracing::debug!(module = %name, "module not registered, skipped"),
            }
        }
        out
    }
}

fn sorted<'a>(keys: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut names: Vec<String> = keys.cloned().collect();
    names.sort();
    names
}
