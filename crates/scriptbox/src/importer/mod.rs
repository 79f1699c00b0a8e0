//! Package importers: resolve an import name to module source from a
//! directory, an unpacked versioned archive or a remote URL.
//!
//! Each importer implements [`ModuleGetter`](crate::resolver::ModuleGetter)
//! and returns `None` on any miss, so importers compose into an
//! [`ImportChain`](crate::resolver::ImportChain) where the first hit wins.

use std::fmt;

use serde::{Deserialize, Serialize};

#[cfg(feature = "archive")]
pub mod archive;
pub mod fs;
#[cfg(feature = "url")]
pub mod url;

#[cfg(feature = "archive")]
pub use archive::{ArchiveImporter, PackageManifest, Unpacker};
pub use fs::FsImporter;
#[cfg(feature = "url")]
pub use url::UrlImporter;

/// A package dependency declared by a sandbox.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Require {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

impl Require {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// File name of the archive that provides this package.
    #[must_use]
    pub fn archive_name(&self) -> String {
        format!("{self}.zip")
    }
}

impl fmt::Display for Require {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.version.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}@{}", self.name, self.version)
        }
    }
}
