//! Document-store admin client.
//!
//! Wraps every privileged operation against the per-tenant document store
//! (CouchDB) behind administrator credentials: database creation, security
//! (access-control) updates, revision-aware document upserts, and full
//! database listing. The admin credentials live only inside this client
//! and are never exposed to end users; end-user traffic goes through the
//! credential bridge instead.
//!
//! All four operations are idempotent at this layer:
//! - creating a database that already exists is success, not an error;
//! - setting security replaces the whole security object;
//! - upserting re-fetches the current revision marker before writing;
//! - fetching all documents has no side effects.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by document-store operations.
///
/// The variants are deliberately distinct where callers must react
/// differently: `AdminAuthRejected` means the subsystem is misconfigured
/// (fatal), `DatabaseNotFound` is a provisioning gap (repairable), and
/// `RevisionConflict` is retryable by the caller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CouchError {
    /// The document store rejected the administrator credentials.
    #[error("document store rejected admin credentials during {operation}; check admin user/password")]
    AdminAuthRejected {
        /// Operation that was refused.
        operation: &'static str,
    },

    /// The named database does not exist.
    ///
    /// Distinct from "database exists but is empty" so callers can tell a
    /// provisioning gap from a tenant with no data yet.
    #[error("database not found: {database}")]
    DatabaseNotFound {
        /// Database name that was missing.
        database: String,
    },

    /// A revision-tagged write lost the optimistic-concurrency race.
    ///
    /// The caller decides whether to retry; this client never merges and
    /// never drops the conflict silently.
    #[error("revision conflict writing {doc_id} in {database}")]
    RevisionConflict {
        /// Target database.
        database: String,
        /// Conflicting document id.
        doc_id: String,
    },

    /// Network-level failure reaching the document store.
    #[error("document store transport error: {0}")]
    Transport(String),

    /// The store answered with a status this client has no mapping for.
    #[error("document store returned unexpected status {status} during {operation}")]
    UnexpectedStatus {
        /// Operation that failed.
        operation: &'static str,
        /// HTTP status code received.
        status: u16,
    },

    /// A response or document body could not be (de)serialized.
    #[error("invalid document body: {0}")]
    InvalidBody(String),
}

impl From<reqwest::Error> for CouchError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

/// Privileged operations against the per-tenant document store.
///
/// The trait is the seam between the provisioning/reconciliation logic and
/// the real CouchDB client, so both can be exercised against an in-memory
/// store in tests.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Deterministic database name for a workstation.
    ///
    /// The `<prefix>_ws_<workstation_id>` convention is a durable external
    /// contract; changing it breaks existing tenants' sync.
    fn database_name(&self, workstation_id: i64) -> String;

    /// Create a database, treating "already exists" as success.
    async fn create_database(&self, name: &str) -> Result<(), CouchError>;

    /// Replace the database's access-control list so the given member
    /// names may read/write. Administrators retain access unconditionally.
    async fn set_security(&self, name: &str, member_names: &[String]) -> Result<(), CouchError>;

    /// Insert or update a document, carrying the current revision marker.
    async fn upsert_document(
        &self,
        database: &str,
        doc_id: &str,
        data: Value,
    ) -> Result<(), CouchError>;

    /// List every document in the database with bodies included.
    async fn fetch_all_documents(&self, database: &str) -> Result<Vec<Value>, CouchError>;
}

/// HTTP admin client for CouchDB.
pub struct CouchClient {
    http: reqwest::Client,
    base_url: String,
    admin_user: String,
    admin_pass: String,
    db_prefix: String,
}

impl CouchClient {
    /// Build a client with a bounded per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`CouchError::Transport`] if the underlying HTTP client
    /// cannot be constructed.
    pub fn new(
        base_url: impl Into<String>,
        admin_user: impl Into<String>,
        admin_pass: impl Into<String>,
        db_prefix: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, CouchError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into();

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            admin_user: admin_user.into(),
            admin_pass: admin_pass.into(),
            db_prefix: db_prefix.into(),
        })
    }

    /// Base URL of the document store.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get_current_revision(
        &self,
        database: &str,
        doc_id: &str,
    ) -> Result<Option<String>, CouchError> {
        let response = self
            .http
            .get(self.url(&format!("{database}/{doc_id}")))
            .basic_auth(&self.admin_user, Some(&self.admin_pass))
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Ok(None);
        }

        let current: Value = response
            .json()
            .await
            .map_err(|e| CouchError::InvalidBody(e.to_string()))?;
        Ok(current
            .get("_rev")
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

#[derive(Deserialize)]
struct AllDocsRow {
    doc: Option<Value>,
}

#[derive(Deserialize)]
struct AllDocsResponse {
    #[serde(default)]
    rows: Vec<AllDocsRow>,
}

#[async_trait]
impl DocumentStore for CouchClient {
    fn database_name(&self, workstation_id: i64) -> String {
        format!("{}_ws_{}", self.db_prefix, workstation_id)
    }

    async fn create_database(&self, name: &str) -> Result<(), CouchError> {
        let response = self
            .http
            .put(self.url(name))
            .basic_auth(&self.admin_user, Some(&self.admin_pass))
            .send()
            .await?;

        match response.status() {
            // 412 Precondition Failed means the database already exists,
            // which is exactly the state we wanted.
            StatusCode::CREATED | StatusCode::ACCEPTED | StatusCode::PRECONDITION_FAILED => {
                debug!(database = name, "database ensured");
                Ok(())
            },
            StatusCode::UNAUTHORIZED => Err(CouchError::AdminAuthRejected {
                operation: "create_database",
            }),
            status => Err(CouchError::UnexpectedStatus {
                operation: "create_database",
                status: status.as_u16(),
            }),
        }
    }

    async fn set_security(&self, name: &str, member_names: &[String]) -> Result<(), CouchError> {
        // Full replacement of the security object. The admin role is kept
        // unconditionally; members are exactly the granted identities.
        let security = json!({
            "members": { "names": member_names, "roles": [] },
            "admins": { "names": [], "roles": ["_admin"] },
        });

        let response = self
            .http
            .put(self.url(&format!("{name}/_security")))
            .basic_auth(&self.admin_user, Some(&self.admin_pass))
            .json(&security)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED => {
                debug!(database = name, members = member_names.len(), "security updated");
                Ok(())
            },
            StatusCode::UNAUTHORIZED => Err(CouchError::AdminAuthRejected {
                operation: "set_security",
            }),
            StatusCode::NOT_FOUND => Err(CouchError::DatabaseNotFound {
                database: name.to_string(),
            }),
            status => Err(CouchError::UnexpectedStatus {
                operation: "set_security",
                status: status.as_u16(),
            }),
        }
    }

    async fn upsert_document(
        &self,
        database: &str,
        doc_id: &str,
        mut data: Value,
    ) -> Result<(), CouchError> {
        // A first write to a fresh tenant must not 404.
        self.create_database(database).await?;

        // The store uses optimistic revision-tagged writes: an existing
        // document must be overwritten with its current _rev attached or
        // the PUT is rejected with a conflict.
        if let Some(rev) = self.get_current_revision(database, doc_id).await? {
            match data.as_object_mut() {
                Some(map) => {
                    map.insert("_rev".to_string(), Value::String(rev));
                },
                None => {
                    return Err(CouchError::InvalidBody(
                        "document body must be a JSON object".to_string(),
                    ));
                },
            }
        }

        let response = self
            .http
            .put(self.url(&format!("{database}/{doc_id}")))
            .basic_auth(&self.admin_user, Some(&self.admin_pass))
            .json(&data)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED => Ok(()),
            StatusCode::CONFLICT => Err(CouchError::RevisionConflict {
                database: database.to_string(),
                doc_id: doc_id.to_string(),
            }),
            StatusCode::UNAUTHORIZED => Err(CouchError::AdminAuthRejected {
                operation: "upsert_document",
            }),
            status => Err(CouchError::UnexpectedStatus {
                operation: "upsert_document",
                status: status.as_u16(),
            }),
        }
    }

    async fn fetch_all_documents(&self, database: &str) -> Result<Vec<Value>, CouchError> {
        let response = self
            .http
            .get(self.url(&format!("{database}/_all_docs")))
            .query(&[("include_docs", "true")])
            .basic_auth(&self.admin_user, Some(&self.admin_pass))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body: AllDocsResponse = response
                    .json()
                    .await
                    .map_err(|e| CouchError::InvalidBody(e.to_string()))?;
                Ok(body.rows.into_iter().filter_map(|row| row.doc).collect())
            },
            StatusCode::NOT_FOUND => Err(CouchError::DatabaseNotFound {
                database: database.to_string(),
            }),
            StatusCode::UNAUTHORIZED => Err(CouchError::AdminAuthRejected {
                operation: "fetch_all_documents",
            }),
            status => Err(CouchError::UnexpectedStatus {
                operation: "fetch_all_documents",
                status: status.as_u16(),
            }),
        }
    }
}

impl std::fmt::Debug for CouchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouchClient")
            .field("base_url", &self.base_url)
            .field("admin_user", &self.admin_user)
            .field("db_prefix", &self.db_prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::{get, put};
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base: &str) -> CouchClient {
        CouchClient::new(base, "admin", "pw", "db", Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_database_name_convention() {
        let c = client("http://localhost:5984");
        assert_eq!(c.database_name(7), "db_ws_7");
        assert_eq!(c.database_name(120), "db_ws_120");
    }

    #[tokio::test]
    async fn test_create_database_created() {
        let app = Router::new().route("/{db}", put(|| async { StatusCode::CREATED }));
        let base = spawn(app).await;
        client(&base).create_database("db_ws_1").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_database_already_exists_is_success() {
        let app = Router::new().route("/{db}", put(|| async { StatusCode::PRECONDITION_FAILED }));
        let base = spawn(app).await;
        client(&base).create_database("db_ws_1").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_database_admin_auth_rejected() {
        let app = Router::new().route("/{db}", put(|| async { StatusCode::UNAUTHORIZED }));
        let base = spawn(app).await;
        let err = client(&base).create_database("db_ws_1").await.unwrap_err();
        assert!(matches!(err, CouchError::AdminAuthRejected { .. }));
    }

    #[tokio::test]
    async fn test_set_security_sends_member_names() {
        #[derive(Clone, Default)]
        struct Seen(Arc<Mutex<Option<Value>>>);

        let seen = Seen::default();
        let app = Router::new()
            .route(
                "/{db}/_security",
                put(
                    |State(seen): State<Seen>, Json(body): Json<Value>| async move {
                        *seen.0.lock().unwrap() = Some(body);
                        StatusCode::OK
                    },
                ),
            )
            .with_state(seen.clone());
        let base = spawn(app).await;

        client(&base)
            .set_security("db_ws_1", &["42".to_string(), "43".to_string()])
            .await
            .unwrap();

        let body = seen.0.lock().unwrap().clone().unwrap();
        assert_eq!(body["members"]["names"], json!(["42", "43"]));
        assert_eq!(body["admins"]["roles"], json!(["_admin"]));
    }

    #[tokio::test]
    async fn test_upsert_attaches_current_revision() {
        #[derive(Clone, Default)]
        struct Docs(Arc<Mutex<HashMap<String, Value>>>);

        let docs = Docs::default();
        docs.0.lock().unwrap().insert(
            "occ-1".to_string(),
            json!({"_id": "occ-1", "_rev": "3-aaa", "note": "old"}),
        );

        let app = Router::new()
            .route("/{db}", put(|| async { StatusCode::PRECONDITION_FAILED }))
            .route(
                "/{db}/{doc}",
                get(
                    |State(docs): State<Docs>, Path((_, doc)): Path<(String, String)>| async move {
                        match docs.0.lock().unwrap().get(&doc) {
                            Some(value) => (StatusCode::OK, Json(value.clone())),
                            None => (StatusCode::NOT_FOUND, Json(json!({"error": "not_found"}))),
                        }
                    },
                )
                .put(
                    |State(docs): State<Docs>,
                     Path((_, doc)): Path<(String, String)>,
                     Json(body): Json<Value>| async move {
                        docs.0.lock().unwrap().insert(doc, body);
                        StatusCode::CREATED
                    },
                ),
            )
            .with_state(docs.clone());
        let base = spawn(app).await;

        client(&base)
            .upsert_document("db_ws_1", "occ-1", json!({"_id": "occ-1", "note": "new"}))
            .await
            .unwrap();

        let stored = docs.0.lock().unwrap().get("occ-1").cloned().unwrap();
        assert_eq!(stored["_rev"], "3-aaa");
        assert_eq!(stored["note"], "new");
    }

    #[tokio::test]
    async fn test_upsert_conflict_is_surfaced() {
        let app = Router::new()
            .route("/{db}", put(|| async { StatusCode::PRECONDITION_FAILED }))
            .route(
                "/{db}/{doc}",
                get(|| async { StatusCode::NOT_FOUND }).put(|| async { StatusCode::CONFLICT }),
            );
        let base = spawn(app).await;

        let err = client(&base)
            .upsert_document("db_ws_1", "occ-1", json!({"_id": "occ-1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, CouchError::RevisionConflict { .. }));
    }

    #[tokio::test]
    async fn test_fetch_all_documents() {
        let app = Router::new().route(
            "/{db}/_all_docs",
            get(|| async {
                Json(json!({
                    "total_rows": 2,
                    "rows": [
                        {"id": "a", "doc": {"_id": "a", "type": "occurrence"}},
                        {"id": "b", "doc": {"_id": "b", "type": "marker"}},
                        {"id": "c"}
                    ]
                }))
            }),
        );
        let base = spawn(app).await;

        let docs = client(&base).fetch_all_documents("db_ws_1").await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["_id"], "a");
    }

    #[tokio::test]
    async fn test_fetch_missing_database_is_not_found_not_empty() {
        let app = Router::new().route("/{db}/_all_docs", get(|| async { StatusCode::NOT_FOUND }));
        let base = spawn(app).await;

        let err = client(&base).fetch_all_documents("db_ws_9").await.unwrap_err();
        assert!(matches!(err, CouchError::DatabaseNotFound { database } if database == "db_ws_9"));
    }

    #[tokio::test]
    async fn test_transport_error_is_distinct() {
        // Nothing listens on this port.
        let c = CouchClient::new(
            "http://127.0.0.1:1",
            "admin",
            "pw",
            "db",
            Duration::from_millis(200),
        )
        .unwrap();
        let err = c.create_database("db_ws_1").await.unwrap_err();
        assert!(matches!(err, CouchError::Transport(_)));
    }
}
