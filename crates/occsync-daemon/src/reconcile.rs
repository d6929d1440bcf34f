//! The reconciliation engine.
//!
//! A recurring background sweep converts offline-authored occurrence
//! documents into normalized relational rows. Each cycle enumerates every
//! known workstation, fetches its tenant database in full, and folds each
//! occurrence-typed document into the store inside its own transaction.
//!
//! Failure containment is strict and layered:
//! - a tenant whose fetch fails (missing database included) is skipped for
//!   the cycle, never aborting the remaining tenants;
//! - a document that fails to decode or write is logged with its id and
//!   skipped, never aborting the tenant;
//! - reprocessing is idempotent, so the system converges over repeated
//!   cycles.
//!
//! Shutdown is cooperative: the run loop observes a `watch` flag and lets
//! an in-flight cycle finish — document transactions are synchronous and
//! are never cut mid-write.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use occsync_core::couch::{CouchError, DocumentStore};
use occsync_core::document::{is_occurrence, OccurrenceDocument};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::directory::{
    ClassificationRow, Directory, DirectoryError, OccurrenceBundle, OccurrenceRow, PlaceRow,
};

/// Per-document reconciliation failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    /// The document carried the occurrence discriminator but did not
    /// decode as an occurrence document.
    #[error("document decode failed: {0}")]
    Decode(String),

    /// The relational write failed; the transaction was rolled back.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

/// What happened to a single document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The document was folded into the relational store.
    Synced,
    /// Not an occurrence document; ignored by design.
    Skipped,
}

/// Counters for one sweep cycle. Observable through logs only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Tenants whose database was fetched and drained.
    pub tenants_swept: usize,
    /// Tenants skipped this cycle (fetch failed or database missing).
    pub tenants_skipped: usize,
    /// Documents upserted into the relational store.
    pub docs_synced: usize,
    /// Non-occurrence documents ignored.
    pub docs_skipped: usize,
    /// Documents that failed decode or write and were skipped.
    pub docs_failed: usize,
}

/// The background reconciliation engine.
pub struct Reconciler {
    directory: Directory,
    store: Arc<dyn DocumentStore>,
    poll_interval: Duration,
}

impl Reconciler {
    /// Build a reconciler sweeping at the given interval.
    pub fn new(directory: Directory, store: Arc<dyn DocumentStore>, poll_interval: Duration) -> Self {
        Self {
            directory,
            store,
            poll_interval,
        }
    }

    /// Run the recurring sweep until the shutdown flag flips.
    ///
    /// Ticks are independent: a slow cycle delays only itself, and cycles
    /// never overlap because each one runs to completion before the next
    /// tick is observed (single-flight per tenant by construction).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.poll_interval.as_secs(), "reconciler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                },
            }

            let report = self.sweep().await;
            info!(
                tenants_swept = report.tenants_swept,
                tenants_skipped = report.tenants_skipped,
                docs_synced = report.docs_synced,
                docs_skipped = report.docs_skipped,
                docs_failed = report.docs_failed,
                "reconcile cycle complete"
            );

            if *shutdown.borrow() {
                break;
            }
        }

        info!("reconciler stopped");
    }

    /// One full cycle over every known workstation.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let workstations = match self.directory.list_workstations() {
            Ok(workstations) => workstations,
            Err(err) => {
                error!(error = %err, "sweep aborted: cannot list workstations");
                return report;
            },
        };

        for workstation in workstations {
            let database = self.store.database_name(workstation.workstation_id);

            let docs = match self.store.fetch_all_documents(&database).await {
                Ok(docs) => docs,
                Err(CouchError::DatabaseNotFound { .. }) => {
                    // Provisioning gap, not "no data yet". Loud, then on
                    // to the next tenant.
                    warn!(
                        database = %database,
                        workstation_id = workstation.workstation_id,
                        "tenant database missing; run the repair operation"
                    );
                    report.tenants_skipped += 1;
                    continue;
                },
                Err(err) => {
                    warn!(
                        database = %database,
                        error = %err,
                        "tenant fetch failed; skipping for this cycle"
                    );
                    report.tenants_skipped += 1;
                    continue;
                },
            };

            report.tenants_swept += 1;

            for doc in docs {
                match self.process_document(&doc) {
                    Ok(Outcome::Synced) => report.docs_synced += 1,
                    Ok(Outcome::Skipped) => report.docs_skipped += 1,
                    Err(err) => {
                        let doc_id = doc.get("_id").and_then(Value::as_str).unwrap_or("<no id>");
                        warn!(
                            database = %database,
                            doc_id = %doc_id,
                            error = %err,
                            "document failed to reconcile; skipped"
                        );
                        report.docs_failed += 1;
                    },
                }
            }
        }

        report
    }

    /// Fold one raw document into the relational store.
    ///
    /// Non-occurrence documents are a silent no-op. Occurrence documents
    /// are decoded once into the typed model and written as a single
    /// transaction: classification, place, occurrence.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] if the document fails to decode or the
    /// transaction fails; prior documents' effects are unaffected.
    pub fn process_document(&self, doc: &Value) -> Result<Outcome, ReconcileError> {
        if !is_occurrence(doc) {
            return Ok(Outcome::Skipped);
        }

        let parsed =
            OccurrenceDocument::decode(doc).map_err(|e| ReconcileError::Decode(e.to_string()))?;
        let bundle = bundle_from(parsed)?;

        self.directory.upsert_occurrence(&bundle)?;
        debug!(occurrence_id = %bundle.occurrence.occurrence_id, "occurrence synced");
        Ok(Outcome::Synced)
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

/// Parse a decimal identifier string, substituting 0 for anything
/// unparsable. Matches the tolerance contract: a bad identifier is a
/// document-level oddity worth a log line, not a cycle abort.
fn parse_numeric_id(field: &'static str, raw: &str) -> i64 {
    if raw.is_empty() {
        return 0;
    }
    raw.parse().unwrap_or_else(|_| {
        warn!(field, value = raw, "unparsable numeric identifier, substituting 0");
        0
    })
}

/// Project the typed document into its transactional row bundle,
/// applying the documented defaults for every absent optional field.
fn bundle_from(doc: OccurrenceDocument) -> Result<OccurrenceBundle, ReconcileError> {
    let classification = if doc.classification_data.classification_id.is_empty() {
        None
    } else {
        Some(ClassificationRow {
            classification_id: doc.classification_data.classification_id.clone(),
            class_classification: serde_json::to_string(&doc.classification_data.class_classification)
                .map_err(|e| ReconcileError::Decode(e.to_string()))?,
        })
    };

    let place = if doc.place_data.place_id.is_empty() {
        None
    } else {
        Some(PlaceRow {
            place_id: doc.place_data.place_id.clone(),
            place_name_id: doc.place_data.place_name_id.clone(),
            coordinates: serde_json::to_string(&doc.place_data.coordinates)
                .map_err(|e| ReconcileError::Decode(e.to_string()))?,
            accuracy: doc.place_data.accuracy.unwrap_or(0.0),
        })
    };

    // Malformed timestamps tolerate down to the epoch rather than failing
    // the document.
    let created_at = DateTime::parse_from_rfc3339(&doc.created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .to_rfc3339();

    let occurrence = OccurrenceRow {
        occurrence_id: doc.id,
        workstation_id: parse_numeric_id("workstation_id", &doc.workstation_id),
        user_id: parse_numeric_id("created_by_user_id", &doc.created_by_user_id),
        project_id: doc.project_id.unwrap_or_default(),
        individual_id: doc.occurrence_data.individual_id,
        lifestage: doc.occurrence_data.lifestage,
        sex: doc.occurrence_data.sex,
        body_length: doc.occurrence_data.body_length.unwrap_or(0.0),
        note: doc.occurrence_data.note,
        classification_id: doc.classification_data.classification_id,
        place_id: doc.place_data.place_id,
        language_id: doc.language_id.unwrap_or_default(),
        created_at,
        timezone: doc.timezone,
    };

    Ok(OccurrenceBundle {
        classification,
        place,
        occurrence,
    })
}
