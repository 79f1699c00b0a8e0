use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::{
        Arc, Once,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use scriptbox::{
    Applet, AppletOptions, BoxError, CompiledUnit, Engine, FileStat, ModuleDefinition,
    ModuleGetter, SourceFs, Value,
};
use tokio_util::sync::CancellationToken;

pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// In-memory file system that counts every stat and read.
#[derive(Default)]
pub(crate) struct MemFs {
    files: Mutex<HashMap<String, (Vec<u8>, SystemTime)>>,
    clock: AtomicU64,
    stats: AtomicUsize,
    reads: AtomicUsize,
}

impl MemFs {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create or replace a file; every write moves its modification time
    /// forward by one second.
    pub(crate) fn write(&self, path: &str, contents: impl AsRef<[u8]>) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 + tick);
        self.files
            .lock()
            .insert(path.to_string(), (contents.as_ref().to_vec(), modified));
    }

    pub(crate) fn stats(&self) -> usize {
        self.stats.load(Ordering::Relaxed)
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    fn is_dir(&self, path: &str) -> bool {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.files.lock().keys().any(|k| k.starts_with(&prefix))
    }
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{path}: not found"))
}

#[async_trait]
impl SourceFs for MemFs {
    async fn stat(&self, path: &str) -> io::Result<FileStat> {
        self.stats.fetch_add(1, Ordering::Relaxed);
        if let Some((_, modified)) = self.files.lock().get(path) {
            return Ok(FileStat {
                modified: *modified,
                is_dir: false,
            });
        }
        if self.is_dir(path) {
            return Ok(FileStat {
                modified: SystemTime::UNIX_EPOCH,
                is_dir: true,
            });
        }
        Err(not_found(path))
    }

    async fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.files
            .lock()
            .get(path)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| not_found(path))
    }

    async fn read_dir(&self, dir: &str) -> io::Result<Vec<String>> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut names: Vec<String> = self
            .files
            .lock()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|rest| rest.split('/').next().unwrap_or(rest).to_string())
            .collect();
        if names.is_empty() {
            return Err(not_found(dir));
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}

/// Line based toy language:
///
/// ```text
/// import db                 # resolve a module, compile error when missing
/// let x = 42                # literal (int, otherwise string)
/// let x = $name             # copy a global
/// let x = db.kind           # module member
/// let x = db.hit(arg)       # call a native module function
/// sleep 50                  # sleep for 50ms
/// wait                      # block until cancelled
/// fail boom                 # runtime error
/// error: boom               # compile error
/// ```
#[derive(Default)]
pub(crate) struct ToyEngine {
    compiles: AtomicUsize,
    compile_delay: Option<Duration>,
    sources: Mutex<Vec<Vec<u8>>>,
}

impl ToyEngine {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn with_compile_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            compile_delay: Some(delay),
            ..Self::default()
        })
    }

    pub(crate) fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    /// Sources exactly as handed to the engine, in compile order.
    pub(crate) fn sources(&self) -> Vec<Vec<u8>> {
        self.sources.lock().clone()
    }
}

#[derive(Clone, Debug)]
enum Expr {
    Literal(Value),
    Global(String),
    Member(String, String),
    Call(String, String, Option<Box<Expr>>),
}

#[derive(Clone, Debug)]
enum Op {
    Let(String, Expr),
    Sleep(Duration),
    Wait,
    Fail(String),
}

fn literal(raw: &str) -> Value {
    raw.parse::<i64>()
        .map_or_else(|_| Value::from(raw), Value::Int)
}

fn parse_expr(raw: &str) -> Expr {
    if let Some(name) = raw.strip_prefix('$') {
        return Expr::Global(name.to_string());
    }
    if let Some((module, rest)) = raw.split_once('.')
        && module
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '/')
        && !module.is_empty()
        && module.parse::<i64>().is_err()
    {
        if let Some((member, arg)) = rest.split_once('(') {
            let arg = arg.trim_end_matches(')').trim();
            let arg = (!arg.is_empty()).then(|| Box::new(parse_expr(arg)));
            return Expr::Call(module.to_string(), member.to_string(), arg);
        }
        return Expr::Member(module.to_string(), rest.to_string());
    }
    Expr::Literal(literal(raw))
}

fn source_members(src: &[u8]) -> BTreeMap<String, Value> {
    String::from_utf8_lossy(src)
        .lines()
        .filter_map(|line| line.trim().strip_prefix("let "))
        .filter_map(|rest| rest.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), literal(v.trim())))
        .collect()
}

#[async_trait]
impl Engine for ToyEngine {
    async fn compile(
        &self,
        source: &[u8],
        declared: &[String],
        _file_name: &str,
        imports: &dyn ModuleGetter,
    ) -> Result<Box<dyn CompiledUnit>, BoxError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        self.sources.lock().push(source.to_vec());
        if let Some(delay) = self.compile_delay {
            tokio::time::sleep(delay).await;
        }

        let text = String::from_utf8(source.to_vec())?;
        let mut ops = Vec::new();
        let mut modules = BTreeMap::new();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with("//") || line.starts_with('#') {
                continue;
            }
            if let Some(msg) = line.strip_prefix("error:") {
                return Err(msg.trim().into());
            }
            if let Some(name) = line.strip_prefix("import ") {
                let name = name.trim();
                let members = match imports.get(name).await {
                    Some(ModuleDefinition::Builtin(members)) => members,
                    Some(ModuleDefinition::Source(src)) => source_members(&src),
                    None => return Err(format!("import not found: {name}").into()),
                };
                modules.insert(name.to_string(), members);
                continue;
            }
            if let Some(rest) = line.strip_prefix("let ") {
                let (name, expr) = rest
                    .split_once('=')
                    .ok_or_else(|| format!("bad let: {line}"))?;
                ops.push(Op::Let(name.trim().to_string(), parse_expr(expr.trim())));
                continue;
            }
            if let Some(ms) = line.strip_prefix("sleep ") {
                ops.push(Op::Sleep(Duration::from_millis(ms.trim().parse()?)));
                continue;
            }
            if line == "wait" {
                ops.push(Op::Wait);
                continue;
            }
            if let Some(msg) = line.strip_prefix("fail ") {
                ops.push(Op::Fail(msg.to_string()));
                continue;
            }
            return Err(format!("unexpected token: {line}").into());
        }

        Ok(Box::new(ToyUnit {
            ops: Arc::new(ops),
            modules: Arc::new(modules),
            globals: declared
                .iter()
                .map(|name| (name.clone(), Value::Undefined))
                .collect(),
        }))
    }
}

pub(crate) struct ToyUnit {
    ops: Arc<Vec<Op>>,
    modules: Arc<BTreeMap<String, BTreeMap<String, Value>>>,
    globals: BTreeMap<String, Value>,
}

impl ToyUnit {
    fn member(&self, module: &str, member: &str) -> Result<Value, BoxError> {
        self.modules
            .get(module)
            .and_then(|m| m.get(member))
            .cloned()
            .ok_or_else(|| format!("unknown member {module}.{member}").into())
    }

    fn eval(&self, expr: &Expr) -> Result<Value, BoxError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Global(g) => Ok(self.globals.get(g).cloned().unwrap_or_default()),
            Expr::Member(m, k) => self.member(m, k),
            Expr::Call(m, k, arg) => {
                let args = match arg {
                    Some(arg) => vec![self.eval(arg)?],
                    None => Vec::new(),
                };
                self.member(m, k)?.call(&args)
            }
        }
    }
}

#[async_trait]
impl CompiledUnit for ToyUnit {
    fn set(&mut self, name: &str, value: Value) -> Result<(), BoxError> {
        if matches!(value, Value::Bytes(_)) {
            return Err("bytes cannot be bound".into());
        }
        match self.globals.get_mut(name) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(format!("{name} is not declared").into()),
        }
    }

    fn get(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    async fn run(&mut self, cancel: &CancellationToken) -> Result<(), BoxError> {
        let ops = Arc::clone(&self.ops);
        for op in ops.iter() {
            match op {
                Op::Let(name, expr) => {
                    let value = self.eval(expr)?;
                    self.globals.insert(name.clone(), value);
                }
                Op::Sleep(d) => tokio::time::sleep(*d).await,
                Op::Wait => {
                    cancel.cancelled().await;
                    return Err("interrupted".into());
                }
                Op::Fail(msg) => return Err(msg.clone().into()),
            }
        }
        Ok(())
    }

    fn fork(&self) -> Box<dyn CompiledUnit> {
        Box::new(Self {
            ops: Arc::clone(&self.ops),
            modules: Arc::clone(&self.modules),
            globals: self.globals.clone(),
        })
    }
}

pub(crate) fn options(name: &str) -> AppletOptions {
    AppletOptions::new(name)
}

/// Sandbox over `fs` with a ten second check interval.
pub(crate) async fn applet(fs: Arc<MemFs>, engine: Arc<ToyEngine>) -> Arc<Applet> {
    Applet::builder(options("test"))
        .fs(fs)
        .build(engine)
        .await
        .expect("applet")
}

pub(crate) fn bindings<const N: usize>(pairs: [(&str, Value); N]) -> BTreeMap<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

pub(crate) fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}
