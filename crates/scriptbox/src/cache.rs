use std::{io, sync::Arc, time::Duration, time::SystemTime};

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{Instrument, debug, info_span};

use crate::{
    TRACE_TARGET_SCRIPT,
    engine::CompiledUnit,
    error::{Error, Result},
    fs::{FileStat, SourceFs},
    singleflight::Group,
};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Turns source bytes into a compiled unit. Implemented by the sandbox, which
/// runs its transpile chain before handing the source to the engine.
#[async_trait::async_trait]
pub trait ScriptCompiler: Send + Sync {
    async fn compile_script(
        &self,
        src: Vec<u8>,
        declared: &[String],
        file_name: &str,
    ) -> Result<Box<dyn CompiledUnit>>;
}

#[derive(Clone)]
struct CachedItem {
    result: Result<Arc<dyn CompiledUnit>>,
    /// Modification time of the source the result was built from; `None`
    /// when the source could not be stat'ed.
    modified: Option<SystemTime>,
    last_check: Instant,
}

/// Compiled-unit cache keyed by path and declared names.
///
/// The file system is consulted at most once per check interval for a key;
/// in between, the cached unit (or cached error) is served as is. A unit is
/// rebuilt only after its source's modification time moves forward.
pub struct ScriptCache {
    items: DashMap<String, CachedItem>,
    group: Group<String, Result<Arc<dyn CompiledUnit>>>,
    fs: Arc<dyn SourceFs>,
    check_interval: Duration,
}

impl ScriptCache {
    #[must_use]
    pub fn new(fs: Arc<dyn SourceFs>, check_interval: Duration) -> Self {
        Self {
            items: DashMap::new(),
            group: Group::new(),
            fs,
            check_interval,
        }
    }

    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Fetch a private copy of the compiled unit for `path`.
    ///
    /// # Errors
    /// Returns the read, transpile or compile error cached for this key.
    pub async fn get_compiled(
        &self,
        path: &str,
        declared: &[String],
        compiler: &dyn ScriptCompiler,
    ) -> Result<Box<dyn CompiledUnit>> {
        let key = cache_key(path, declared);
        let result = self
            .group
            .work(key.clone(), || self.lookup(key, path, declared, compiler))
            .await?;
        Ok(result.fork())
    }

    async fn lookup(
        &self,
        key: String,
        path: &str,
        declared: &[String],
        compiler: &dyn ScriptCompiler,
    ) -> Result<Arc<dyn CompiledUnit>> {
        let now = Instant::now();
        let cached = self.items.get(&key).map(|item| item.value().clone());

        let item = match cached {
            None => match self.fs.stat(path).await {
                Ok(stat) => self.load(path, stat, declared, compiler, now).await,
                Err(e) => unreadable(path, e, now),
            },
            Some(item) if now.duration_since(item.last_check) > self.check_interval => {
                match self.fs.stat(path).await {
                    Ok(stat) if item.modified.is_none_or(|m| stat.modified > m) => {
                        debug!(path, "source changed, recompiling");
                        self.load(path, stat, declared, compiler, now).await
                    }
                    Ok(_) => CachedItem {
                        last_check: now,
                        ..item
                    },
                    Err(e) => unreadable(path, e, now),
                }
            }
            Some(item) => return item.result,
        };

        let result = item.result.clone();
        self.items.insert(key, item);
        result
    }

    /// Read and compile `path`, whose stat was just taken.
    async fn load(
        &self,
        path: &str,
        stat: FileStat,
        declared: &[String],
        compiler: &dyn ScriptCompiler,
        last_check: Instant,
    ) -> CachedItem {
        let span = info_span!(target: TRACE_TARGET_SCRIPT, "cache.compile", path);
        let result = async {
            let src = self
                .fs
                .read(path)
                .await
                .map_err(|e| Error::source_read(path, e))?;
            let unit: Arc<dyn CompiledUnit> =
                Arc::from(compiler.compile_script(src, declared, path).await?);
            Ok::<_, Error>(unit)
        }
        .instrument(span)
        .await;

        CachedItem {
            result,
            modified: Some(stat.modified),
            last_check,
        }
    }

    /// Drop every cached unit.
    pub fn clean(&self) {
        self.items.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn unreadable(path: &str, err: io::Error, last_check: Instant) -> CachedItem {
    CachedItem {
        result: Err(Error::source_read(path, err)),
        modified: None,
        last_check,
    }
}

fn cache_key(path: &str, declared: &[String]) -> String {
    let mut names: Vec<&str> = declared.iter().map(String::as_str).collect();
    names.sort_unstable();
    names.dedup();
    format!("{path}[{}]", names.join(","))
}
