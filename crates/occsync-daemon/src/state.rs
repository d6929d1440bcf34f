//! Shared handler state.

use std::sync::Arc;

use occsync_core::couch::DocumentStore;

use crate::directory::Directory;
use crate::identity::TokenVerifier;
use crate::provision::Provisioner;

/// URL prefix under which the credential bridge is mounted. Requests keep
/// everything after this prefix as the upstream path.
pub const BRIDGE_PREFIX: &str = "/api/couchdb";

/// State shared by every HTTP handler.
///
/// Cheap to clone; the heavyweight members are behind `Arc`s, and
/// `reqwest::Client` clones share one connection pool.
#[derive(Clone)]
pub struct AppState {
    /// Relational tenant directory.
    pub directory: Directory,
    /// Workstation provisioning and repair.
    pub provisioner: Arc<Provisioner>,
    /// Bearer-token verification for the identity middleware.
    pub verifier: Arc<TokenVerifier>,
    /// HTTP client for forwarding bridge traffic upstream.
    pub http: reqwest::Client,
    /// Base URL of the upstream document store, no trailing slash.
    pub couch_url: String,
    /// Shared secret for signing proxy-auth tokens.
    pub proxy_secret: String,
}

impl AppState {
    /// Assemble the shared state.
    pub fn new(
        directory: Directory,
        store: Arc<dyn DocumentStore>,
        verifier: TokenVerifier,
        http: reqwest::Client,
        couch_url: impl Into<String>,
        proxy_secret: impl Into<String>,
    ) -> Self {
        let couch_url = couch_url.into();
        Self {
            provisioner: Arc::new(Provisioner::new(directory.clone(), store)),
            directory,
            verifier: Arc::new(verifier),
            http,
            couch_url: couch_url.trim_end_matches('/').to_string(),
            proxy_secret: proxy_secret.into(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("couch_url", &self.couch_url)
            .finish_non_exhaustive()
    }
}
