//! The credential-translation bridge.
//!
//! Authenticated clients talk to the per-tenant document store through this
//! reverse proxy without ever holding document-store credentials. For each
//! request the bridge strips the mount prefix, scrubs the inbound headers,
//! stamps proxy-auth credentials derived from the verified identity, and
//! forwards verbatim — method, remaining path, query string, and body all
//! pass through untouched. The upstream response travels back the same way.
//!
//! Authorization is split deliberately: this bridge only answers "who is
//! calling"; whether that caller may touch the requested database is the
//! document store's per-database member list, enforced upstream. A
//! non-member's request is forwarded and comes back as the upstream's own
//! 403.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use occsync_core::proxy_credentials;
use serde_json::json;
use tracing::{debug, warn};

use crate::identity::Identity;
use crate::state::{AppState, BRIDGE_PREFIX};

/// Role stamped on every bridged request. Membership in a database is
/// name-based; the role exists so upstream policy can address bridged
/// traffic as a class.
const BRIDGE_ROLE: &str = "member";

/// Largest request body the bridge will buffer before forwarding.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

const HEADER_USERNAME: HeaderName = HeaderName::from_static("x-auth-couchdb-username");
const HEADER_ROLES: HeaderName = HeaderName::from_static("x-auth-couchdb-roles");
const HEADER_TOKEN: HeaderName = HeaderName::from_static("x-auth-couchdb-token");

/// Headers that must not be forwarded: hop-by-hop headers, the bearer
/// token (meaningless upstream), `Host` (reqwest sets its own), lengths
/// (recomputed for the buffered body), and any inbound proxy-auth headers
/// a client might try to smuggle past the credential stamp.
fn is_forwardable(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "authorization"
            | "content-length"
            | "x-auth-couchdb-username"
            | "x-auth-couchdb-roles"
            | "x-auth-couchdb-token"
    )
}

fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| is_forwardable(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Upstream path for a bridged request: everything after the mount prefix,
/// query string preserved. `/api/couchdb/db_ws_7/_all_docs?limit=5` maps to
/// `/db_ws_7/_all_docs?limit=5`.
fn upstream_path(uri: &axum::http::Uri) -> String {
    let path = uri.path().strip_prefix(BRIDGE_PREFIX).unwrap_or(uri.path());
    let path = if path.is_empty() { "/" } else { path };
    match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    }
}

fn bad_gateway(message: &str) -> Response {
    (StatusCode::BAD_GATEWAY, Json(json!({ "error": message }))).into_response()
}

/// Forward one authenticated request to the document store.
///
/// Never panics on upstream failure; transport errors become a 502 with a
/// JSON body, and every upstream status (including 403 for non-members) is
/// mirrored back as-is.
pub async fn forward(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let url = format!("{}{}", state.couch_url, upstream_path(&parts.uri));

    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "bridge request body rejected");
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "error": "request body too large" })),
            )
                .into_response();
        },
    };

    let mut headers = filter_headers(&parts.headers);
    let creds = proxy_credentials(&identity.0, &state.proxy_secret);
    match (creds.username.parse(), creds.token.parse()) {
        (Ok(username), Ok(token)) => {
            headers.insert(HEADER_USERNAME, username);
            headers.insert(HEADER_ROLES, header::HeaderValue::from_static(BRIDGE_ROLE));
            headers.insert(HEADER_TOKEN, token);
        },
        _ => {
            // User ids are verified non-empty strings; only control
            // characters could land here.
            warn!(user_id = %identity.0, "identity not representable as a header value");
            return bad_gateway("identity not forwardable");
        },
    }

    debug!(method = %parts.method, url = %url, user_id = %identity.0, "bridging request");

    let upstream = state
        .http
        .request(parts.method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(response) => response,
        Err(err) => {
            warn!(url = %url, error = %err, "document store unreachable");
            return bad_gateway("document store unreachable");
        },
    };

    let status = upstream.status();
    let response_headers = filter_headers(upstream.headers());
    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(url = %url, error = %err, "document store response truncated");
            return bad_gateway("document store response unreadable");
        },
    };

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

#[cfg(test)]
mod tests {
    use axum::http::Uri;

    use super::*;

    #[test]
    fn test_upstream_path_strips_prefix() {
        let uri: Uri = "/api/couchdb/db_ws_7/_all_docs".parse().unwrap();
        assert_eq!(upstream_path(&uri), "/db_ws_7/_all_docs");
    }

    #[test]
    fn test_upstream_path_preserves_query() {
        let uri: Uri = "/api/couchdb/db_ws_7/_all_docs?include_docs=true&limit=5"
            .parse()
            .unwrap();
        assert_eq!(upstream_path(&uri), "/db_ws_7/_all_docs?include_docs=true&limit=5");
    }

    #[test]
    fn test_upstream_path_bare_prefix_maps_to_root() {
        let uri: Uri = "/api/couchdb".parse().unwrap();
        assert_eq!(upstream_path(&uri), "/");
    }

    #[test]
    fn test_hop_by_hop_and_auth_headers_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(header::AUTHORIZATION, "Bearer tok".parse().unwrap());
        headers.insert(header::HOST, "bridge.local".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        headers.insert(header::ACCEPT, "application/json".parse().unwrap());

        let filtered = filter_headers(&headers);
        assert!(!filtered.contains_key(header::CONNECTION));
        assert!(!filtered.contains_key(header::AUTHORIZATION));
        assert!(!filtered.contains_key(header::HOST));
        assert!(filtered.contains_key(header::CONTENT_TYPE));
        assert!(filtered.contains_key(header::ACCEPT));
    }

    #[test]
    fn test_inbound_proxy_auth_headers_cannot_be_smuggled() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_USERNAME, "999".parse().unwrap());
        headers.insert(HEADER_ROLES, "_admin".parse().unwrap());
        headers.insert(HEADER_TOKEN, "deadbeef".parse().unwrap());

        let filtered = filter_headers(&headers);
        assert!(filtered.is_empty());
    }
}
