//! occsync-daemon - The occurrence sync bridge service.
//!
//! Multi-tenant field-data collection works offline against per-workstation
//! document databases; this daemon is the reconciliation and access bridge
//! between those databases and the relational system of record:
//!
//! - [`provision`] creates tenants: a workstation row, an admin membership,
//!   the tenant's document database, and its access grant.
//! - [`bridge`] translates an already-verified web identity into
//!   document-store proxy credentials on every forwarded request.
//! - [`reconcile`] periodically drains each tenant database, folding
//!   occurrence documents into the relational schema idempotently, one
//!   transaction per document.
//! - [`directory`] owns the SQLite schema for both the tenant directory
//!   and the occurrence projection tables.

pub mod bridge;
pub mod directory;
pub mod handlers;
pub mod identity;
pub mod provision;
pub mod reconcile;
pub mod state;
pub mod testing;

pub use directory::Directory;
pub use provision::Provisioner;
pub use reconcile::Reconciler;
pub use state::AppState;
