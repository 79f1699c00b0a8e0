use std::sync::{Arc, Weak};

use bytes::Bytes;
use tracing::trace;

use crate::{
    applet::Applet,
    context::ContextStore,
    error::{Error, Result},
    fs::{SourceFs, extension, join},
    resolver::{ModuleDefinition, ModuleGetter},
    transpile::Transpiler,
};

/// File name looked up when an import name points at a directory.
pub const INDEX_STEM: &str = "index";

/// Loads modules from a file system.
///
/// Import names may carry `{var}` placeholders rendered against the sandbox
/// context store. A name that points at a directory loads its `index` file,
/// and a name without extension gets the default script extension.
pub struct FsImporter {
    fs: Arc<dyn SourceFs>,
    context: Arc<ContextStore>,
    transpiler: Arc<dyn Transpiler>,
    ext: String,
}

impl FsImporter {
    #[must_use]
    pub fn new(
        fs: Arc<dyn SourceFs>,
        context: Arc<ContextStore>,
        transpiler: Arc<dyn Transpiler>,
        ext: impl Into<String>,
    ) -> Self {
        Self {
            fs,
            context,
            transpiler,
            ext: ext.into(),
        }
    }

    /// Importer over `fs` that renders names with the sandbox context and
    /// rewrites sources with the sandbox transpile chain.
    #[must_use]
    pub fn for_applet(applet: &Arc<Applet>, fs: Arc<dyn SourceFs>) -> Self {
        let transpiler: Weak<Applet> = Arc::downgrade(applet);
        Self::new(
            fs,
            Arc::clone(applet.context()),
            Arc::new(transpiler),
            applet.default_ext(),
        )
    }

    /// Resolve `name` to a file path inside the importer file system.
    pub async fn locate(&self, name: &str) -> String {
        let mut path = if name.contains('{') {
            self.context.render(name)
        } else {
            name.to_string()
        };
        if self.fs.stat(&path).await.is_ok_and(|stat| stat.is_dir) {
            path = join(&path, &format!("{INDEX_STEM}{}", self.ext));
        }
        if extension(&path).is_none() {
            path.push_str(&self.ext);
        }
        path
    }

    /// Read and transpile the module source for `name`.
    ///
    /// # Errors
    /// Returns [`Error::SourceRead`] or [`Error::Transpile`].
    pub async fn load(&self, name: &str) -> Result<Bytes> {
        let path = self.locate(name).await;
        let src = self
            .fs
            .read(&path)
            .await
            .map_err(|e| Error::source_read(&path, e))?;
        let src = self
            .transpiler
            .transpile(src)
            .await
            .map_err(|e| Error::Transpile {
                file: path,
                source: Arc::from(e),
            })?;
        Ok(Bytes::from(src))
    }
}

#[async_trait::async_trait]
impl ModuleGetter for FsImporter {
    async fn get(&self, name: &str) -> Option<ModuleDefinition> {
        match self.load(name).await {
            Ok(src) => Some(ModuleDefinition::Source(src)),
            Err(e) => {
                trace!(module = name, error = %e, "import file error");
                None
            }
        }
    }
}
