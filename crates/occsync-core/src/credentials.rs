//! Proxy-credential derivation for the credential bridge.
//!
//! CouchDB's proxy authentication trusts three request headers:
//! `X-Auth-CouchDB-UserName`, `X-Auth-CouchDB-Roles`, and
//! `X-Auth-CouchDB-Token`, where the token is a hex-encoded HMAC-SHA1 of
//! the username keyed with the shared secret configured on the CouchDB
//! side. The bridge derives these from the already-verified web identity:
//! the relational user id *is* the document-store username, so no lookup
//! is needed on the proxied path.
//!
//! Tokens are recomputed per request. They are cheap and deterministic,
//! and recomputation means a secret rotation takes effect on the very next
//! request with no invalidation step.

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Credentials injected into a forwarded document-store request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    /// Document-store username (the verified user id, verbatim).
    pub username: String,
    /// Hex-encoded HMAC-SHA1 of the username under the shared secret.
    pub token: String,
}

/// Derive proxy credentials for a verified user identity.
///
/// The mapping is identity-preserving: `user_id` becomes the document-store
/// username unchanged, and the token is `hex(HMAC-SHA1(secret, user_id))`.
#[must_use]
pub fn proxy_credentials(user_id: &str, secret: &str) -> ProxyCredentials {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(user_id.as_bytes());
    let token = hex::encode(mac.finalize().into_bytes());

    ProxyCredentials {
        username: user_id.to_string(),
        token,
    }
}
