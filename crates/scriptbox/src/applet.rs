//! The sandbox: one isolated script execution context.
//!
//! An [`Applet`] owns its context store, the module resolver assembled from
//! registries and importers, the transpile chain, lifecycle hooks and the
//! compiled-unit cache. Every method takes `&self`; internal state is guarded
//! by the component that owns it, so one `Arc<Applet>` can serve any number
//! of concurrent call paths.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::{sync::OnceCell, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};

use crate::{
    TRACE_TARGET_SCRIPT,
    cache::{DEFAULT_CHECK_INTERVAL, ScriptCache, ScriptCompiler},
    config::{self, Config},
    context::{ContextStore, DEFAULT_PROFILE, PROFILE},
    engine::{CompiledUnit, Engine},
    error::{BoxError, Error, Result},
    fs::{DirFs, SourceFs},
    hook::{Hook, Signal},
    registry::{Materialized, RegistryTable},
    resolver::{ModuleGetter, ModuleResolver},
    transpile::{self, ScriptStep, TranspileStep, Transpiler, TranspilerChain},
    value::Value,
};

pub const DEFAULT_EXT: &str = ".box";

tokio::task_local! {
    /// Address of the sandbox whose `Initialized` hooks the current task is
    /// running. Compiles issued by those hooks must not wait on themselves.
    static INITIALIZING: usize;
}

/// Construction options of a sandbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppletOptions {
    pub(crate) name: String,
    pub(crate) default_ext: String,
    pub(crate) environ: BTreeMap<String, String>,
    pub(crate) root: PathBuf,
    #[serde(with = "millis")]
    pub(crate) check_interval: Duration,
}

impl Default for AppletOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            default_ext: DEFAULT_EXT.to_string(),
            environ: BTreeMap::new(),
            root: PathBuf::from("."),
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

impl AppletOptions {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Extension appended to script names that have none.
    pub fn default_ext(&mut self, ext: impl Into<String>) -> &mut Self {
        self.default_ext = ext.into();
        self
    }

    /// Seed a context store entry. The last value for a key wins.
    pub fn env(&mut self, k: impl Into<String>, v: impl Into<String>) -> &mut Self {
        self.environ.insert(k.into(), v.into());
        self
    }

    /// Directory the default file system is rooted at.
    pub fn root(&mut self, root: impl AsRef<Path>) -> &mut Self {
        self.root = root.as_ref().to_path_buf();
        self
    }

    /// How long a cached unit is trusted before its source is stat'ed again.
    pub const fn check_interval(&mut self, interval: Duration) -> &mut Self {
        self.check_interval = interval;
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Builder for [`Applet`].
pub struct AppletBuilder {
    options: AppletOptions,
    fs: Option<Arc<dyn SourceFs>>,
    hooks: Vec<Hook>,
    transpilers: Vec<TranspileStep>,
}

impl AppletBuilder {
    /// Serve sources from `fs` instead of a [`DirFs`] over the options root.
    #[must_use]
    pub fn fs(mut self, fs: Arc<dyn SourceFs>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Register a hook before construction, so it also sees [`Signal::Start`].
    #[must_use]
    pub fn hook(mut self, hook: Hook) -> Self {
        self.hooks.push(hook);
        self
    }

    #[must_use]
    pub fn transpiler(mut self, step: TranspileStep) -> Self {
        self.transpilers.push(step);
        self
    }

    /// Create the sandbox and fire [`Signal::Start`].
    ///
    /// # Errors
    /// Returns [`Error::InvalidName`] when the options carry no name.
    pub async fn build(self, engine: Arc<dyn Engine>) -> Result<Arc<Applet>> {
        let Self {
            mut options,
            fs,
            hooks,
            transpilers,
        } = self;

        if options.name.is_empty() {
            return Err(Error::InvalidName);
        }
        if options.default_ext.is_empty() {
            options.default_ext = DEFAULT_EXT.to_string();
        }

        let fs = fs.unwrap_or_else(|| Arc::new(DirFs::new(&options.root)));

        let context = Arc::new(ContextStore::new());
        for (k, v) in &options.environ {
            context.set(k.as_str(), v.as_str());
        }
        if context
            .get(PROFILE)
            .is_none_or(|v| v.as_str().is_none_or(str::is_empty))
        {
            context.set(PROFILE, DEFAULT_PROFILE);
        }
        info!(sandbox = %options.name, env = ?options.environ, "initialize environment");

        let transpilers = Transpilers {
            global: TranspilerChain::global(),
            sandbox: transpilers.into_iter().collect(),
            registry: TranspilerChain::new(),
        };

        let applet = Arc::new_cyclic(|this| Applet {
            this: this.clone(),
            cache: ScriptCache::new(Arc::clone(&fs), options.check_interval),
            options,
            fs,
            context,
            resolver: ModuleResolver::new(),
            transpilers: RwLock::new(transpilers),
            hooks: RwLock::new(hooks),
            engine,
            config: OnceCell::new(),
            initializing: OnceLock::new(),
            initialized: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        applet.notify(Signal::Start).await;
        Ok(applet)
    }
}

/// Rewrite steps by origin. They apply global first, then the sandbox's own,
/// then those contributed by registries, whatever order they were added in.
struct Transpilers {
    global: TranspilerChain,
    sandbox: TranspilerChain,
    registry: TranspilerChain,
}

impl Transpilers {
    fn snapshot(&self) -> Vec<TranspileStep> {
        self.global
            .steps()
            .iter()
            .chain(self.sandbox.steps())
            .chain(self.registry.steps())
            .cloned()
            .collect()
    }
}

pub struct Applet {
    this: Weak<Self>,
    options: AppletOptions,
    fs: Arc<dyn SourceFs>,
    context: Arc<ContextStore>,
    resolver: ModuleResolver,
    transpilers: RwLock<Transpilers>,
    hooks: RwLock<Vec<Hook>>,
    engine: Arc<dyn Engine>,
    cache: ScriptCache,
    config: OnceCell<Config>,
    initializing: OnceLock<Shared<BoxFuture<'static, ()>>>,
    initialized: AtomicBool,
    stopping: AtomicBool,
    closed: AtomicBool,
}

impl Applet {
    #[must_use]
    pub fn builder(options: AppletOptions) -> AppletBuilder {
        AppletBuilder {
            options,
            fs: None,
            hooks: Vec::new(),
            transpilers: Vec::new(),
        }
    }

    /// Create a sandbox rooted at the options root directory.
    ///
    /// # Errors
    /// Returns [`Error::InvalidName`] when the options carry no name.
    pub async fn new(options: AppletOptions, engine: Arc<dyn Engine>) -> Result<Arc<Self>> {
        Self::builder(options).build(engine).await
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.options.name
    }

    #[must_use]
    pub const fn options(&self) -> &AppletOptions {
        &self.options
    }

    #[must_use]
    pub fn default_ext(&self) -> &str {
        &self.options.default_ext
    }

    #[must_use]
    pub const fn context(&self) -> &Arc<ContextStore> {
        &self.context
    }

    #[must_use]
    pub fn fs(&self) -> &Arc<dyn SourceFs> {
        &self.fs
    }

    #[must_use]
    pub const fn resolver(&self) -> &ModuleResolver {
        &self.resolver
    }

    #[must_use]
    pub const fn cache(&self) -> &ScriptCache {
        &self.cache
    }

    /// Add a module source consulted before any importer.
    pub fn with_module(&self, getter: Arc<dyn ModuleGetter>) -> &Self {
        self.resolver.add_module(getter);
        self
    }

    /// Append an importer to the fallback chain.
    pub fn with_importer(&self, importer: Arc<dyn ModuleGetter>) -> &Self {
        self.resolver.add_importer(importer);
        self
    }

    pub fn with_hook(&self, hook: Hook) -> &Self {
        self.hooks.write().push(hook);
        self
    }

    /// Append a sandbox step. Sandbox steps run after the global ones and
    /// before any registry step.
    pub fn with_transpiler(&self, step: TranspileStep) -> &Self {
        self.transpilers.write().sandbox.push(step);
        self
    }

    /// Compile the script at `path` into a rewrite step that can be passed
    /// to [`with_transpiler`](Self::with_transpiler). The script reads the
    /// source from `input` and stores the result in `output`.
    ///
    /// # Errors
    /// Returns [`Error::SourceRead`] or [`Error::Compile`].
    pub async fn script_transpiler(&self, path: &str) -> Result<TranspileStep> {
        let script = self
            .fs
            .read(path)
            .await
            .map_err(|e| Error::source_read(path, e))?;
        let step = ScriptStep::compile(self.engine.as_ref(), &script, path, &self.resolver)
            .await
            .map_err(|e| Error::Compile {
                file: path.to_string(),
                source: Arc::from(e),
            })?;
        Ok(Arc::new(step))
    }

    /// Import `names` (or every name for `"*"`) from `table`, together with
    /// the transpile steps and hooks of the registries among them.
    pub fn use_registries(self: &Arc<Self>, table: &RegistryTable, names: &[&str]) -> &Self {
        let Materialized {
            modules,
            transpiler,
            hooks,
        } = table.materialize(self, names);
        debug!(sandbox = %self.name(), modules = ?modules.names(), "registries materialized");
        self.with_module(Arc::new(modules));
        self.transpilers
            .write()
            .registry
            .extend(transpiler.steps().iter().cloned());
        self.hooks.write().extend(hooks);
        self
    }

    /// Fire every hook registered for `signal`, in registration order.
    /// Failing hooks are logged and do not stop the others.
    pub async fn notify(&self, signal: Signal) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let hooks: Vec<Hook> = self
            .hooks
            .read()
            .iter()
            .filter(|hook| hook.signal() == signal)
            .cloned()
            .collect();
        for hook in hooks {
            if let Err(e) = hook.fire(Arc::clone(&this)).await {
                error!(sandbox = %self.name(), %signal, error = %e, "call hook error");
            }
        }
    }

    /// Fire [`Signal::Initialized`] once per sandbox lifetime. Concurrent
    /// callers wait until the hooks have finished.
    ///
    /// The hooks run on their own task, so a caller that is dropped while
    /// waiting does not abort them and the next caller waits on the same run.
    pub async fn initialize(&self) {
        let id = std::ptr::from_ref(self).addr();
        if INITIALIZING.try_with(|current| *current == id).unwrap_or(false) {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let run = self
            .initializing
            .get_or_init(|| {
                let task = tokio::spawn(INITIALIZING.scope(id, async move {
                    this.notify(Signal::Initialized).await;
                    this.initialized.store(true, Ordering::Release);
                }));
                async move {
                    if let Err(e) = task.await {
                        error!(error = %e, "initialized hooks panicked");
                    }
                }
                .boxed()
                .shared()
            })
            .clone();
        run.await;
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Fire [`Signal::Stop`] and mark the sandbox closed. Later calls are
    /// no-ops.
    pub async fn shutdown(&self, reason: &str) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(sandbox = %self.name(), reason, "shutting down");
        self.notify(Signal::Stop).await;
        self.closed.store(true, Ordering::Release);
        info!(sandbox = %self.name(), "stopped");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run the global, sandbox and registry steps over `src`, in that order.
    ///
    /// # Errors
    /// Returns the error of the first failing step.
    pub async fn transpile(&self, src: Vec<u8>) -> Result<Vec<u8>, BoxError> {
        let steps = self.transpilers.read().snapshot();
        transpile::run_steps(steps.iter(), src).await
    }

    /// Compile `src` with every name in `declared` pre-declared.
    ///
    /// # Errors
    /// Returns [`Error::Transpile`] or [`Error::Compile`].
    pub async fn compile(
        &self,
        src: Vec<u8>,
        declared: &[String],
        file_name: &str,
    ) -> Result<Box<dyn CompiledUnit>> {
        self.initialize().await;
        let src = self.transpile(src).await.map_err(|e| Error::Transpile {
            file: file_name.to_string(),
            source: Arc::from(e),
        })?;

        let span = info_span!(
            target: TRACE_TARGET_SCRIPT,
            "applet.compile",
            sandbox = %self.name(),
            file = file_name,
        );
        self.engine
            .compile(&src, declared, file_name, &self.resolver)
            .instrument(span)
            .await
            .map_err(|e| Error::Compile {
                file: file_name.to_string(),
                source: Arc::from(e),
            })
    }

    /// Compile and run `src` without going through the cache.
    ///
    /// # Errors
    /// Returns compile, binding, runtime or cancellation errors.
    pub async fn run(
        &self,
        src: Vec<u8>,
        bindings: BTreeMap<String, Value>,
        cancel: &CancellationToken,
        file_name: &str,
    ) -> Result<Box<dyn CompiledUnit>> {
        self.ensure_open()?;
        let declared: Vec<String> = bindings.keys().cloned().collect();
        let unit = self.compile(src, &declared, file_name).await?;
        self.execute(unit, bindings, cancel, file_name).await
    }

    /// Run the script at `path`, compiled through the cache with the binding
    /// names as declared globals. The returned unit holds the values the
    /// script left behind.
    ///
    /// # Errors
    /// Returns read, compile, binding, runtime or cancellation errors.
    pub async fn run_file(
        &self,
        path: &str,
        bindings: BTreeMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn CompiledUnit>> {
        self.ensure_open()?;
        let declared: Vec<String> = bindings.keys().cloned().collect();
        let unit = self.cache.get_compiled(path, &declared, self).await?;
        self.execute(unit, bindings, cancel, path).await
    }

    /// Start every script in `scripts` on its own task. Scripts that fail to
    /// compile are logged and skipped.
    pub async fn fork(&self, scripts: &[&str], bindings: &BTreeMap<String, Value>) -> ForkHandle {
        let token = CancellationToken::new();
        let declared: Vec<String> = bindings.keys().cloned().collect();
        let mut tasks = Vec::with_capacity(scripts.len());

        for script in scripts {
            let mut unit = match self.cache.get_compiled(script, &declared, self).await {
                Ok(unit) => unit,
                Err(e) => {
                    error!(sandbox = %self.name(), script, error = %e, "compile script error");
                    continue;
                }
            };
            for (name, value) in bindings {
                if let Err(e) = unit.set(name, value.clone()) {
                    error!(sandbox = %self.name(), script, name = %name, error = %e, "set value error");
                }
            }

            let cancel = token.child_token();
            let sandbox = self.name().to_string();
            let script = (*script).to_string();
            tasks.push(tokio::spawn(async move {
                match run_unit(unit.as_mut(), &cancel).await {
                    Ok(()) => {}
                    Err(Error::Cancelled) => {
                        debug!(sandbox = %sandbox, script = %script, "forked script cancelled");
                    }
                    Err(e) => error!(sandbox = %sandbox, script = %script, error = %e, "run script error"),
                }
            }));
        }

        ForkHandle { token, tasks }
    }

    /// Merged application configuration, discovered on first use.
    pub async fn config(&self) -> &Config {
        self.config
            .get_or_init(|| config::discover(self.fs.as_ref(), &self.context, self.name()))
            .await
    }

    /// Look up a dotted configuration key such as `db.url`.
    pub async fn get_config(&self, key: &str) -> Option<Value> {
        self.config().await.get(key).cloned()
    }

    /// Drop every cached compiled unit.
    pub fn clean_cache(&self) {
        self.cache.clean();
        info!(sandbox = %self.name(), "script cache cleaned");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed(self.name().to_string()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        mut unit: Box<dyn CompiledUnit>,
        bindings: BTreeMap<String, Value>,
        cancel: &CancellationToken,
        file_name: &str,
    ) -> Result<Box<dyn CompiledUnit>> {
        for (name, value) in bindings {
            unit.set(&name, value).map_err(|e| Error::Binding {
                name,
                source: Arc::from(e),
            })?;
        }

        let span = info_span!(
            target: TRACE_TARGET_SCRIPT,
            "applet.run",
            sandbox = %self.name(),
            file = file_name,
        );
        run_unit(unit.as_mut(), cancel).instrument(span).await?;
        Ok(unit)
    }
}

async fn run_unit(unit: &mut dyn CompiledUnit, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = unit.run(cancel) => result.map_err(|e| {
            if cancel.is_cancelled() {
                Error::Cancelled
            } else {
                Error::runtime(e)
            }
        }),
    }
}

impl std::fmt::Debug for Applet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Applet")
            .field("name", &self.options.name)
            .field("initialized", &self.is_initialized())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl ScriptCompiler for Applet {
    async fn compile_script(
        &self,
        src: Vec<u8>,
        declared: &[String],
        file_name: &str,
    ) -> Result<Box<dyn CompiledUnit>> {
        self.compile(src, declared, file_name).await
    }
}

/// Applies the sandbox chain as it stands at call time. Importers hold the
/// sandbox weakly, so a dropped sandbox passes source through unchanged.
#[async_trait::async_trait]
impl Transpiler for Weak<Applet> {
    async fn transpile(&self, src: Vec<u8>) -> Result<Vec<u8>, BoxError> {
        match self.upgrade() {
            Some(applet) => applet.transpile(src).await,
            None => Ok(src),
        }
    }
}

/// Handle over the tasks started by [`Applet::fork`].
#[derive(Debug)]
pub struct ForkHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ForkHandle {
    /// Cancel every forked run.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Number of scripts that were started.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every forked run to finish.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "forked task panicked");
            }
        }
    }
}
