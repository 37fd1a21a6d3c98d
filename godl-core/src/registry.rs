//! Protocol registry — scheme-to-handler dispatch (spec §4.9, §9 redesign flag).
//!
//! Modeled as a trait rather than an interface-with-hidden-shared-base: each
//! handler is a small, independently testable collaborator the registry
//! dispatches to by URL scheme. The HTTP handler itself is composed from the
//! probe/planner/worker-pool/sink collaborators in [`crate::http`] rather
//! than inheriting from a shared downloader base.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::Error;
use crate::request::DownloadRequest;
use crate::stats::DownloadStats;

/// A pluggable per-scheme download backend.
///
/// FTP/S3/etc. implementations are out of scope (spec §1); the registry only
/// needs to accept their registration and dispatch to them uniformly.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// The URL scheme this handler owns, lowercase (e.g. `"http"`).
    fn scheme(&self) -> &str;

    /// Whether this handler can actually serve `url` (beyond scheme match —
    /// e.g. a handler might refuse unsupported hosts).
    fn can_handle(&self, url: &url::Url) -> bool;

    /// Executes the download, reporting progress through whatever reporter
    /// and metrics hooks the caller wired into `request` before dispatch.
    async fn download(
        &self,
        request: &DownloadRequest,
        cancel: CancellationToken,
    ) -> Result<DownloadStats, Error>;
}

/// Thread-safe scheme→handler map. Read-heavy (spec §4.9): lookups use a
/// shared read lock; only registration/unregistration takes the write lock.
#[derive(Default)]
pub struct ProtocolRegistry {
    handlers: RwLock<HashMap<String, std::sync::Arc<dyn ProtocolHandler>>>,
}

impl ProtocolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { handlers: RwLock::new(HashMap::new()) }
    }

    /// Registers `handler` under its own [`ProtocolHandler::scheme`].
    /// Rejects a duplicate scheme registration (spec §4.9).
    #[instrument(skip(self, handler))]
    pub fn register(&self, handler: std::sync::Arc<dyn ProtocolHandler>) -> Result<(), Error> {
        let scheme = handler.scheme().to_lowercase();
        let mut handlers = self.handlers.write().expect("registry lock poisoned");
        if handlers.contains_key(&scheme) {
            return Err(Error::validation(format!("handler already registered for scheme {scheme}")));
        }
        handlers.insert(scheme, handler);
        Ok(())
    }

    pub fn unregister(&self, scheme: &str) {
        self.handlers.write().expect("registry lock poisoned").remove(&scheme.to_lowercase());
    }

    /// Resolves the handler for `url`'s scheme, verifying [`ProtocolHandler::can_handle`].
    pub fn get_handler(&self, url: &str) -> Result<std::sync::Arc<dyn ProtocolHandler>, Error> {
        let parsed = url::Url::parse(url).map_err(|e| Error::invalid_url(url).with_details(e.to_string()))?;
        let scheme = parsed.scheme().to_lowercase();
        let handler = {
            let handlers = self.handlers.read().expect("registry lock poisoned");
            handlers.get(&scheme).cloned()
        };
        let Some(handler) = handler else {
            return Err(Error::validation(format!("no handler registered for scheme {scheme}")));
        };
        if !handler.can_handle(&parsed) {
            return Err(Error::validation(format!("handler for scheme {scheme} declined url")));
        }
        Ok(handler)
    }

    /// Dispatches `request` to the handler for its URL's scheme.
    pub async fn download(
        &self,
        request: &DownloadRequest,
        cancel: CancellationToken,
    ) -> Result<DownloadStats, Error> {
        let handler = self.get_handler(&request.url)?;
        handler.download(request, cancel).await
    }
}
