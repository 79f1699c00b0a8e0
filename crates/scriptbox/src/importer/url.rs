use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{Instrument, error, info_span};

use crate::{
    TRACE_TARGET_SCRIPT,
    error::{Error, Result},
    resolver::{ModuleDefinition, ModuleGetter},
    singleflight::Group,
};

/// Whether `name` is something [`UrlImporter`] would fetch.
#[must_use]
pub fn is_remote(name: &str) -> bool {
    name.starts_with("http://") || name.starts_with("https://")
}

/// Imports modules named by an `http://` or `https://` URL.
///
/// Successful bodies are kept for the lifetime of the importer, keyed by URL.
/// Concurrent imports of the same URL share one request. Failed requests are
/// not cached.
pub struct UrlImporter {
    client: reqwest::Client,
    bodies: DashMap<String, Bytes>,
    group: Group<String, Result<Bytes>>,
    fetches: AtomicUsize,
}

impl Default for UrlImporter {
    fn default() -> Self {
        Self::with_client(reqwest::Client::new())
    }
}

impl UrlImporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            bodies: DashMap::new(),
            group: Group::new(),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Number of requests sent so far.
    #[must_use]
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Fetch the body at `url`, from the cache when possible.
    ///
    /// # Errors
    /// Returns [`Error::Request`] when the request fails and [`Error::Fetch`]
    /// for a non-success status.
    pub async fn fetch(&self, url: &str) -> Result<Bytes> {
        if let Some(body) = self.cached(url) {
            return Ok(body);
        }
        self.group
            .work(url.to_string(), || async {
                if let Some(body) = self.cached(url) {
                    return Ok(body);
                }
                let span = info_span!(target: TRACE_TARGET_SCRIPT, "package.fetch", url);
                let body = self.request(url).instrument(span).await?;
                self.bodies.insert(url.to_string(), body.clone());
                Ok(body)
            })
            .await
    }

    fn cached(&self, url: &str) -> Option<Bytes> {
        self.bodies.get(url).map(|body| body.value().clone())
    }

    async fn request(&self, url: &str) -> Result<Bytes> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let request_error = |e: reqwest::Error| Error::Request {
            url: url.to_string(),
            source: Arc::new(e),
        };

        let response = self.client.get(url).send().await.map_err(request_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(request_error)?;
        if !status.is_success() {
            return Err(Error::Fetch {
                url: url.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body)
    }
}

#[async_trait::async_trait]
impl ModuleGetter for UrlImporter {
    async fn get(&self, name: &str) -> Option<ModuleDefinition> {
        if !is_remote(name) {
            return None;
        }
        match self.fetch(name).await {
            Ok(body) => Some(ModuleDefinition::Source(body)),
            Err(e) => {
                error!(url = name, error = %e, "request url failed");
                None
            }
        }
    }
}
