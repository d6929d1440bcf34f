//! occsync-core - Core library for the occurrence sync bridge.
//!
//! This crate holds everything the daemon needs that is not daemon state:
//! configuration parsing, the typed occurrence-document model, the
//! document-store (CouchDB) admin client, and proxy-credential derivation
//! for the credential bridge.
//!
//! The daemon crate (`occsync-daemon`) layers the tenant directory, the
//! reconciliation engine, and the HTTP surface on top of this.

pub mod config;
pub mod couch;
pub mod credentials;
pub mod document;

pub use config::{ConfigError, OccsyncConfig};
pub use couch::{CouchClient, CouchError, DocumentStore};
pub use credentials::{proxy_credentials, ProxyCredentials};
pub use document::OccurrenceDocument;
