//! End-to-end flows against a mock document-store upstream: provisioning
//! over HTTP, credential-bridge forwarding with tenant isolation, and the
//! reconciliation sweep folding seeded documents into relational rows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::routing::{get, put};
use axum::{Json, Router};
use occsync_core::couch::{CouchClient, DocumentStore};
use occsync_core::proxy_credentials;
use occsync_daemon::directory::Directory;
use occsync_daemon::handlers;
use occsync_daemon::identity::TokenVerifier;
use occsync_daemon::reconcile::Reconciler;
use occsync_daemon::state::AppState;
use serde_json::{json, Value};
use tower::util::ServiceExt;

const AUTH_SECRET: &str = "e2e-signing-secret";
const PROXY_SECRET: &str = "e2e-proxy-secret";

#[derive(Default)]
struct MockDb {
    members: Vec<String>,
    docs: Vec<Value>,
}

/// Minimal CouchDB stand-in: database creation with the already-exists
/// status, security replacement, and `_all_docs` with proxy-auth
/// enforcement when the bridge headers are present.
#[derive(Clone, Default)]
struct MockCouch {
    dbs: Arc<Mutex<HashMap<String, MockDb>>>,
}

impl MockCouch {
    fn seed_doc(&self, database: &str, doc: Value) {
        self.dbs
            .lock()
            .unwrap()
            .entry(database.to_string())
            .or_default()
            .docs
            .push(doc);
    }

    fn members(&self, database: &str) -> Vec<String> {
        self.dbs
            .lock()
            .unwrap()
            .get(database)
            .map(|db| db.members.clone())
            .unwrap_or_default()
    }

    fn exists(&self, database: &str) -> bool {
        self.dbs.lock().unwrap().contains_key(database)
    }
}

async fn create_db(State(mock): State<MockCouch>, Path(db): Path<String>) -> StatusCode {
    let mut dbs = mock.dbs.lock().unwrap();
    if dbs.contains_key(&db) {
        StatusCode::PRECONDITION_FAILED
    } else {
        dbs.insert(db, MockDb::default());
        StatusCode::CREATED
    }
}

async fn set_security(
    State(mock): State<MockCouch>,
    Path(db): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    let mut dbs = mock.dbs.lock().unwrap();
    let Some(entry) = dbs.get_mut(&db) else {
        return StatusCode::NOT_FOUND;
    };
    entry.members = body["members"]["names"]
        .as_array()
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    StatusCode::OK
}

async fn all_docs(
    State(mock): State<MockCouch>,
    Path(db): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    let dbs = mock.dbs.lock().unwrap();
    let Some(entry) = dbs.get(&db) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "not_found"})));
    };

    // Bridged requests carry proxy-auth headers; admin requests carry
    // basic auth and bypass the member check.
    if let Some(username) = headers
        .get("x-auth-couchdb-username")
        .and_then(|v| v.to_str().ok())
    {
        let token = headers
            .get("x-auth-couchdb-token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if token != proxy_credentials(username, PROXY_SECRET).token {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad token"})));
        }
        if !entry.members.iter().any(|m| m == username) {
            return (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"})));
        }
    } else if !headers.contains_key(header::AUTHORIZATION) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "no auth"})));
    }

    let rows: Vec<Value> = entry
        .docs
        .iter()
        .map(|doc| json!({"id": doc["_id"], "doc": doc}))
        .collect();
    (
        StatusCode::OK,
        Json(json!({"total_rows": rows.len(), "rows": rows})),
    )
}

async fn spawn_mock() -> (MockCouch, String) {
    let mock = MockCouch::default();
    let app = Router::new()
        .route("/{db}", put(create_db))
        .route("/{db}/_security", put(set_security))
        .route("/{db}/_all_docs", get(all_docs))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (mock, format!("http://{addr}"))
}

struct Harness {
    mock: MockCouch,
    directory: Directory,
    store: Arc<dyn DocumentStore>,
    app: Router,
}

async fn harness() -> Harness {
    let (mock, base) = spawn_mock().await;
    let directory = Directory::in_memory().unwrap();
    let store: Arc<dyn DocumentStore> = Arc::new(
        CouchClient::new(&base, "admin", "pw", "db", Duration::from_secs(2)).unwrap(),
    );
    let state = AppState::new(
        directory.clone(),
        Arc::clone(&store),
        TokenVerifier::new(AUTH_SECRET),
        reqwest::Client::new(),
        base,
        PROXY_SECRET,
    );
    Harness {
        mock,
        directory,
        store,
        app: handlers::router(state),
    }
}

fn bearer(user_id: &str) -> String {
    format!("Bearer {}", TokenVerifier::new(AUTH_SECRET).issue(user_id))
}

async fn create_workstation(app: &Router, user: &str, name: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::post("/api/workstations")
                .header(header::AUTHORIZATION, bearer(user))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"workstation_name": name}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn occurrence_doc(id: &str, workstation_id: i64) -> Value {
    json!({
        "_id": id,
        "type": "occurrence",
        "workstation_id": workstation_id.to_string(),
        "created_by_user_id": "42",
        "project_id": "survey-2026",
        "created_at": "2026-06-10T07:15:00Z",
        "timezone": "Asia/Tokyo",
        "occurrence_data": {
            "individual_id": "ind-9",
            "lifestage": "larva",
            "sex": "unknown",
            "body_length": 8.25,
            "note": "under bark"
        },
        "classification_data": {
            "classification_id": "cls-9",
            "class_classification": {"order": "Coleoptera"}
        },
        "place_data": {
            "place_id": "plc-9",
            "coordinates": {"lat": 35.7, "lon": 139.8},
            "accuracy": 12.0
        }
    })
}

#[tokio::test]
async fn test_provision_then_reconcile_converges_to_one_row() {
    let h = harness().await;

    let (status, body) = create_workstation(&h.app, "42", "Field Camp 1").await;
    assert_eq!(status, StatusCode::CREATED);
    let workstation_id = body["workstation_id"].as_i64().unwrap();
    let database = format!("db_ws_{workstation_id}");

    assert!(h.mock.exists(&database));
    assert_eq!(h.mock.members(&database), vec!["42".to_string()]);
    assert_eq!(h.directory.workstations_for_user(42).unwrap().len(), 1);

    h.mock.seed_doc(&database, occurrence_doc("occ-1", workstation_id));
    h.mock.seed_doc(&database, json!({"_id": "meta", "type": "settings"}));

    let reconciler = Reconciler::new(
        h.directory.clone(),
        Arc::clone(&h.store),
        Duration::from_secs(60),
    );
    let first = reconciler.sweep().await;
    assert_eq!(first.docs_synced, 1);
    assert_eq!(first.docs_skipped, 1);

    // Reprocessing converges; no duplicate rows.
    let second = reconciler.sweep().await;
    assert_eq!(second.docs_synced, 1);
    assert_eq!(h.directory.count_occurrences().unwrap(), 1);

    let row = h.directory.get_occurrence("occ-1").unwrap().unwrap();
    assert_eq!(row.workstation_id, workstation_id);
    assert_eq!(row.user_id, 42);
    assert_eq!(row.note, "under bark");
    assert!(h.directory.get_place("plc-9").unwrap().is_some());
    assert!(h.directory.get_classification("cls-9").unwrap().is_some());
}

#[tokio::test]
async fn test_bridge_enforces_tenant_isolation_upstream() {
    let h = harness().await;

    let (status, body) = create_workstation(&h.app, "42", "Camp A").await;
    assert_eq!(status, StatusCode::CREATED);
    let database = format!("db_ws_{}", body["workstation_id"].as_i64().unwrap());
    h.mock.seed_doc(&database, occurrence_doc("occ-1", 1));

    // Member traffic is stamped with valid proxy credentials and admitted.
    let response = h
        .app
        .clone()
        .oneshot(
            Request::get(format!("/api/couchdb/{database}/_all_docs"))
                .header(header::AUTHORIZATION, bearer("42"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    let listing: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(listing["total_rows"], 1);

    // A different authenticated user is refused by the upstream member
    // check, and the refusal is mirrored back verbatim.
    let response = h
        .app
        .clone()
        .oneshot(
            Request::get(format!("/api/couchdb/{database}/_all_docs"))
                .header(header::AUTHORIZATION, bearer("99"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_bridge_ignores_smuggled_proxy_headers() {
    let h = harness().await;

    let (_, body) = create_workstation(&h.app, "42", "Camp A").await;
    let database = format!("db_ws_{}", body["workstation_id"].as_i64().unwrap());

    // User 99 claims to be 42 via a forged header; the bridge replaces it
    // with credentials for the verified identity, so upstream sees 99.
    let response = h
        .app
        .clone()
        .oneshot(
            Request::get(format!("/api/couchdb/{database}/_all_docs"))
                .header(header::AUTHORIZATION, bearer("99"))
                .header("x-auth-couchdb-username", "42")
                .header(
                    "x-auth-couchdb-token",
                    proxy_credentials("42", PROXY_SECRET).token,
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_bridge_requires_token() {
    let h = harness().await;
    let response = h
        .app
        .clone()
        .oneshot(
            Request::get("/api/couchdb/db_ws_1/_all_docs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_missing_tenant_database_skipped_until_repaired() {
    let h = harness().await;

    let (_, body) = create_workstation(&h.app, "42", "Camp A").await;
    let workstation_id = body["workstation_id"].as_i64().unwrap();
    let database = format!("db_ws_{workstation_id}");

    // Simulate a document-store wipe.
    h.mock.dbs.lock().unwrap().remove(&database);

    let reconciler = Reconciler::new(
        h.directory.clone(),
        Arc::clone(&h.store),
        Duration::from_secs(60),
    );
    let report = reconciler.sweep().await;
    assert_eq!(report.tenants_skipped, 1);
    assert_eq!(report.tenants_swept, 0);
}
