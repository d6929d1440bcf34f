//! Tenant provisioning and repair.
//!
//! Creating a workstation touches two systems with different failure
//! modes, and the split is deliberate:
//!
//! - Relational failures (row or membership creation) fail the whole
//!   operation; nothing to repair, the caller retries.
//! - A document-database creation failure is a *warning*: the relational
//!   tenant stands and [`Provisioner::ensure_all_databases`] repairs the
//!   store side later.
//! - An access-grant failure is reported to the caller as
//!   [`ProvisionError::AccessGrant`] without rolling the relational rows
//!   back — the tenant exists but cannot sync until the grant is repaired,
//!   and the error text must let an operator tell the two sides apart.

use std::sync::Arc;

use occsync_core::couch::{CouchError, DocumentStore};
use thiserror::Error;
use tracing::{info, warn};

use crate::directory::{Directory, DirectoryError, Workstation, ADMIN_ROLE_ID};

/// Provisioning failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// Workstation name was empty after trimming.
    #[error("workstation name cannot be empty")]
    EmptyName,

    /// The relational side failed; nothing was provisioned.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// The workstation row exists but the document-store access grant
    /// failed. Repairable; the caller should retry or run the repair
    /// operation rather than re-create the workstation.
    #[error("workstation created, but granting access on {database} failed: {source}")]
    AccessGrant {
        /// Tenant database the grant targeted.
        database: String,
        /// Underlying document-store failure.
        #[source]
        source: CouchError,
    },
}

/// Outcome of a repair sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Databases verified or (re)created with their grants in place.
    pub ensured: usize,
    /// Databases whose creation or grant failed this sweep.
    pub failed: usize,
}

/// Creates tenants and repairs their document-store side.
pub struct Provisioner {
    directory: Directory,
    store: Arc<dyn DocumentStore>,
}

impl Provisioner {
    /// Build a provisioner over the tenant directory and document store.
    pub fn new(directory: Directory, store: Arc<dyn DocumentStore>) -> Self {
        Self { directory, store }
    }

    /// Create a workstation for a user: relational row, admin membership,
    /// tenant database, access grant.
    ///
    /// # Errors
    ///
    /// See [`ProvisionError`] for the failure split.
    pub async fn create_workstation(
        &self,
        user_id: i64,
        name: &str,
    ) -> Result<Workstation, ProvisionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ProvisionError::EmptyName);
        }

        let workstation = self.directory.create_workstation(name)?;
        self.directory
            .add_member(workstation.workstation_id, user_id, ADMIN_ROLE_ID)?;

        let database = self.store.database_name(workstation.workstation_id);

        // Database creation failure is tolerated: the relational tenant is
        // kept and ensure_all_databases() recreates the database later.
        if let Err(err) = self.store.create_database(&database).await {
            warn!(
                database = %database,
                workstation_id = workstation.workstation_id,
                error = %err,
                "tenant database creation failed; sync blocked until repaired"
            );
        }

        // Without the grant the tenant cannot sync at all, so this failure
        // is surfaced to the caller. The relational rows stay.
        self.store
            .set_security(&database, &[user_id.to_string()])
            .await
            .map_err(|source| ProvisionError::AccessGrant { database, source })?;

        info!(
            workstation_id = workstation.workstation_id,
            user_id, "workstation provisioned"
        );
        Ok(workstation)
    }

    /// Repair sweep: for every workstation, re-create its database under
    /// the canonical naming convention and re-grant its full member set.
    ///
    /// Individual failures are logged and counted, never aborting the
    /// sweep. This is the designed recovery from a provisioning-time
    /// document-store outage.
    ///
    /// # Errors
    ///
    /// Returns an error only if the tenant directory itself cannot be
    /// read.
    pub async fn ensure_all_databases(&self) -> Result<RepairReport, DirectoryError> {
        let mut report = RepairReport::default();

        for workstation in self.directory.list_workstations()? {
            let database = self.store.database_name(workstation.workstation_id);
            let members: Vec<String> = self
                .directory
                .members_of(workstation.workstation_id)?
                .into_iter()
                .map(|user_id| user_id.to_string())
                .collect();

            let ensured = match self.store.create_database(&database).await {
                Ok(()) => match self.store.set_security(&database, &members).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(database = %database, error = %err, "repair: access grant failed");
                        false
                    },
                },
                Err(err) => {
                    warn!(database = %database, error = %err, "repair: database creation failed");
                    false
                },
            };

            if ensured {
                report.ensured += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            ensured = report.ensured,
            failed = report.failed,
            "database repair sweep complete"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner").finish_non_exhaustive()
    }
}
