use std::{
    fmt::Write as _,
    io::{Cursor, Read as _, Write as _},
    path::{Component, Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{Instrument, debug, info, info_span};
use zip::{ZipArchive, result::ZipError};

use super::fs::FsImporter;
use crate::{
    TRACE_TARGET_SCRIPT,
    applet::Applet,
    context::ContextStore,
    error::{BoxError, Error, Result},
    fs::DirFs,
    resolver::{ModuleDefinition, ModuleGetter},
    singleflight::Group,
    transpile::Transpiler,
};

/// Manifest file read from the archive root.
pub const MANIFEST: &str = "manifest.yml";

/// Default directory archives are unpacked into.
pub const DEFAULT_DEST: &str = ".box_modules";

/// `name` and `version` of a package. Missing fields are derived from the
/// archive: the name from its file stem, the version from its content hash.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl PackageManifest {
    /// Read the manifest of `data`, filling in whatever it leaves out.
    ///
    /// # Errors
    /// Fails when the archive cannot be opened or the manifest is malformed.
    pub fn from_archive(archive: &Path, data: &[u8]) -> Result<Self> {
        let label = archive.display().to_string();
        let mut zip = ZipArchive::new(Cursor::new(data)).map_err(|e| Error::package(&label, e))?;

        let mut manifest = match zip.by_name(MANIFEST) {
            Ok(mut file) => {
                let mut buf = String::new();
                file.read_to_string(&mut buf)
                    .map_err(|e| Error::package(&label, e))?;
                serde_yaml::from_str::<Option<Self>>(&buf)
                    .map_err(|e| {
                        Error::package(&label, format!("{MANIFEST} found but unmarshal error: {e}"))
                    })?
                    .unwrap_or_default()
            }
            Err(ZipError::FileNotFound) => Self::default(),
            Err(e) => return Err(Error::package(&label, e)),
        };

        if manifest.name.is_empty() {
            manifest.name = archive
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        if manifest.version.is_empty() {
            manifest.version = content_hash(data);
        }

        let dir_name = manifest.dir_name();
        let mut components = Path::new(&dir_name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(Error::package(
                &label,
                format!("{dir_name:?} is not a single directory name"),
            ));
        }
        Ok(manifest)
    }

    /// Directory name the package unpacks into.
    #[must_use]
    pub fn dir_name(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

fn content_hash(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

/// Unpacks package archives into `dest/name@version`.
///
/// A package directory that already exists is reused as is. Otherwise the
/// archive is extracted into a uniquely named sibling directory which is then
/// renamed into place. Concurrent requests for the same archive share one
/// unpack; losing a rename race to another process counts as success.
pub struct Unpacker {
    dest: PathBuf,
    group: Group<PathBuf, Result<PathBuf>>,
    extractions: Arc<AtomicUsize>,
}

impl Unpacker {
    #[must_use]
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self {
            dest: dest.into(),
            group: Group::new(),
            extractions: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Number of archives this unpacker actually extracted.
    #[must_use]
    pub fn extractions(&self) -> usize {
        self.extractions.load(Ordering::Relaxed)
    }

    /// Unpack `archive` and return the package directory.
    ///
    /// # Errors
    /// Returns [`Error::SourceRead`] when the archive cannot be read and
    /// [`Error::Package`] when it cannot be unpacked.
    pub async fn unpack(&self, archive: &Path) -> Result<PathBuf> {
        self.group
            .work(archive.to_path_buf(), || self.unpack_once(archive))
            .await
    }

    async fn unpack_once(&self, archive: &Path) -> Result<PathBuf> {
        let label = archive.display().to_string();
        let span = info_span!(target: TRACE_TARGET_SCRIPT, "package.unpack", archive = %label);
        async {
            let data = tokio::fs::read(archive)
                .await
                .map_err(|e| Error::source_read(&label, e))?;

            let archive = archive.to_path_buf();
            let dest = self.dest.clone();
            let extractions = Arc::clone(&self.extractions);
            tokio::task::spawn_blocking(move || {
                let manifest = PackageManifest::from_archive(&archive, &data)?;
                let target = dest.join(manifest.dir_name());
                if target.is_dir() {
                    debug!(package = %manifest.dir_name(), "package already unpacked");
                    return Ok(target);
                }
                extract(&archive, &data, &dest, &manifest)?;
                extractions.fetch_add(1, Ordering::Relaxed);
                info!(package = %manifest.dir_name(), "package unpacked");
                Ok(target)
            })
            .await
            .map_err(|e| Error::package(&label, e))?
        }
        .instrument(span)
        .await
    }
}

fn extract(archive: &Path, data: &[u8], dest: &Path, manifest: &PackageManifest) -> Result<()> {
    static EXTRACT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let label = archive.display().to_string();
    let fail = |e: &dyn std::fmt::Display| Error::package(&label, e);
    let sequence = EXTRACT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let target = dest.join(manifest.dir_name());
    let tmp = dest.join(format!(
        "{}.tmp-{}-{sequence}",
        manifest.dir_name(),
        std::process::id()
    ));
    std::fs::create_dir_all(&tmp).map_err(|e| fail(&e))?;

    if let Err(e) = unzip_into(data, &tmp) {
        let _ = std::fs::remove_dir_all(&tmp);
        return Err(fail(&e));
    }

    match std::fs::rename(&tmp, &target) {
        Ok(()) => Ok(()),
        // Another extractor won the race; its copy has the same content.
        Err(_) if target.is_dir() => {
            let _ = std::fs::remove_dir_all(&tmp);
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_dir_all(&tmp);
            Err(fail(&e))
        }
    }
}

fn unzip_into(data: &[u8], dir: &Path) -> std::result::Result<(), BoxError> {
    let mut zip = ZipArchive::new(Cursor::new(data))?;
    let mut buffer = vec![0u8; 16384];
    for i in 0..zip.len() {
        let mut file = zip.by_index(i)?;
        let Some(outpath) = file.enclosed_name().map(|path| dir.join(path)) else {
            continue;
        };

        if file.is_dir() {
            std::fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&outpath)?;
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n])?;
        }
    }
    Ok(())
}

/// Imports modules from an unpacked package archive.
pub struct ArchiveImporter {
    root: PathBuf,
    inner: FsImporter,
}

impl ArchiveImporter {
    /// Unpack `archive` and import from the package directory.
    ///
    /// # Errors
    /// Returns the unpack error.
    pub async fn open(
        unpacker: &Unpacker,
        archive: &Path,
        context: Arc<ContextStore>,
        transpiler: Arc<dyn Transpiler>,
        ext: impl Into<String>,
    ) -> Result<Self> {
        let root = unpacker.unpack(archive).await?;
        let inner = FsImporter::new(Arc::new(DirFs::new(&root)), context, transpiler, ext);
        Ok(Self { root, inner })
    }

    /// [`open`](Self::open) with the context, transpile chain and script
    /// extension of `applet`.
    ///
    /// # Errors
    /// Returns the unpack error.
    pub async fn for_applet(
        unpacker: &Unpacker,
        archive: &Path,
        applet: &Arc<Applet>,
    ) -> Result<Self> {
        let root = unpacker.unpack(archive).await?;
        let inner = FsImporter::for_applet(applet, Arc::new(DirFs::new(&root)));
        Ok(Self { root, inner })
    }

    /// Directory the package was unpacked into.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait::async_trait]
impl ModuleGetter for ArchiveImporter {
    async fn get(&self, name: &str) -> Option<ModuleDefinition> {
        self.inner.get(name).await
    }
}
