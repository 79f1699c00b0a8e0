use std::{
    io,
    path::{Component, Path, PathBuf},
    time::SystemTime,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub modified: SystemTime,
    pub is_dir: bool,
}

/// Read-only view of the files a sandbox can see. Paths are slash separated
/// and relative to the file system root.
#[async_trait::async_trait]
pub trait SourceFs: Send + Sync + 'static {
    async fn stat(&self, path: &str) -> io::Result<FileStat>;

    async fn read(&self, path: &str) -> io::Result<Vec<u8>>;

    /// Names of the direct children of `dir`, sorted.
    async fn read_dir(&self, dir: &str) -> io::Result<Vec<String>>;
}

/// [`SourceFs`] rooted at a host directory.
#[derive(Clone, Debug)]
pub struct DirFs {
    root: PathBuf,
}

impl DirFs {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let mut out = self.root.clone();
        for component in Path::new(path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("path escapes sandbox root: {path}"),
                    ));
                }
            }
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl SourceFs for DirFs {
    async fn stat(&self, path: &str) -> io::Result<FileStat> {
        let meta = tokio::fs::metadata(self.resolve(path)?).await?;
        Ok(FileStat {
            modified: meta.modified()?,
            is_dir: meta.is_dir(),
        })
    }

    async fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.resolve(path)?).await
    }

    async fn read_dir(&self, dir: &str) -> io::Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(self.resolve(dir)?).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Join slash separated path segments, dropping empty ones.
pub(crate) fn join(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{name}")
    }
}

/// Extension of the last path segment including the dot, if any.
pub(crate) fn extension(path: &str) -> Option<&str> {
    let file = path.rsplit('/').next().unwrap_or(path);
    file.rfind('.').filter(|idx| *idx > 0).map(|idx| &file[idx..])
}
