//! Bulk delete coordinator.
//!
//! Ids are processed in fixed-size chunks. For each chunk the live rows are loaded in
//! one query, every live id is probed, and only then are the cleared ids deleted in a
//! single atomic batch. A failure for one id or one chunk is recorded as that id's skip
//! reason and never aborts the request.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;

use common::catalog::EntityStore;
use common::config::GuardConfig;
use common::model::{ContextEntityType, DeleteMode, EntityRecord};
use futures::{FutureExt, StreamExt, stream};
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::message::usage_message;
use crate::probe::{UsageCheck, UsageResult};
use crate::request::{BulkDeleteRequest, RequestError};

/// Why an id was not deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    /// A reference was confirmed; carries the operator message.
    InUse(String),
    /// Peers could not be asked; carries the operator message.
    VerificationFailed(String),
    /// The probe itself errored or panicked.
    ProbeFailed,
    LoadFailed(String),
    DeleteFailed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotFound => f.write_str("not found"),
            SkipReason::InUse(message) | SkipReason::VerificationFailed(message) => {
                f.write_str(message)
            }
            SkipReason::ProbeFailed => f.write_str("could not verify usage"),
            SkipReason::LoadFailed(error) => write!(f, "could not load record: {error}"),
            SkipReason::DeleteFailed(error) => write!(f, "delete failed: {error}"),
        }
    }
}

impl Serialize for SkipReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Every requested id appears exactly once, in `deleted` or as a key of `skipped`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkDeleteOutcome {
    /// Deleted ids in request order.
    pub deleted: Vec<i64>,
    pub skipped: BTreeMap<i64, SkipReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub max_ids: usize,
    pub chunk_size: usize,
    pub probe_concurrency: usize,
}

impl From<&GuardConfig> for CoordinatorSettings {
    fn from(config: &GuardConfig) -> Self {
        Self {
            max_ids: config.max_ids,
            chunk_size: config.chunk_size,
            probe_concurrency: config.probe_concurrency,
        }
    }
}

pub struct BulkDeleteCoordinator<C, S> {
    checker: C,
    store: S,
    settings: CoordinatorSettings,
}

impl<C: UsageCheck, S: EntityStore> BulkDeleteCoordinator<C, S> {
    pub fn new(checker: C, store: S, settings: CoordinatorSettings) -> Self {
        Self {
            checker,
            store,
            settings,
        }
    }

    pub fn checker(&self) -> &C {
        &self.checker
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> CoordinatorSettings {
        self.settings
    }

    /// Validate a raw request body against this coordinator's ceiling.
    pub fn parse_request(
        &self,
        entity_type: &str,
        body: &Value,
    ) -> Result<BulkDeleteRequest, RequestError> {
        BulkDeleteRequest::from_json(entity_type, body, self.settings.max_ids)
    }

    pub async fn execute(
        &self,
        request: &BulkDeleteRequest,
        mode: DeleteMode,
    ) -> BulkDeleteOutcome {
        let entity_type = request.entity_type();
        let mut outcome = BulkDeleteOutcome::default();

        log::info!(
            "Bulk {mode:?} delete of {} {entity_type} ids",
            request.ids().len()
        );

        for chunk in request.ids().chunks(self.settings.chunk_size.max(1)) {
            let accepted = self.screen_chunk(entity_type, chunk, &mut outcome).await;
            self.commit_chunk(entity_type, accepted, mode, &mut outcome)
                .await;
        }

        log::info!(
            "Bulk delete of {entity_type}: {} deleted, {} skipped",
            outcome.deleted.len(),
            outcome.skipped.len()
        );
        outcome
    }

    /// Delete a single id through the same probe-then-commit path.
    pub async fn delete_one(
        &self,
        entity_type: ContextEntityType,
        id: i64,
        mode: DeleteMode,
    ) -> Result<(), SkipReason> {
        let request = BulkDeleteRequest::single(entity_type, id);
        let mut outcome = self.execute(&request, mode).await;
        outcome.skipped.remove(&id).map_or(Ok(()), Err)
    }

    /// Load and probe one chunk. Returns the ids cleared for deletion, in chunk order.
    async fn screen_chunk(
        &self,
        entity_type: ContextEntityType,
        chunk: &[i64],
        outcome: &mut BulkDeleteOutcome,
    ) -> Vec<i64> {
        let records = match self.store.fetch_existing(entity_type, chunk).await {
            Ok(records) => records,
            Err(e) => {
                log::error!("Failed to load {entity_type} records for chunk: {e}");
                for id in chunk {
                    outcome
                        .skipped
                        .insert(*id, SkipReason::LoadFailed(e.to_string()));
                }
                return Vec::new();
            }
        };

        let mut by_id: HashMap<i64, EntityRecord> =
            records.into_iter().map(|r| (r.id, r)).collect();
        let mut live = Vec::with_capacity(chunk.len());
        for id in chunk {
            match by_id.remove(id) {
                Some(record) => live.push(record),
                None => {
                    outcome.skipped.insert(*id, SkipReason::NotFound);
                }
            }
        }

        let probed: Vec<_> = stream::iter(live)
            .map(|record| async move {
                let result = AssertUnwindSafe(self.checker.check_usage(entity_type, record.id))
                    .catch_unwind()
                    .await;
                (record, result)
            })
            .buffered(self.settings.probe_concurrency.max(1))
            .collect()
            .await;

        let mut accepted = Vec::with_capacity(probed.len());
        for (record, result) in probed {
            match result {
                Ok(Ok(usage)) => match skip_for_usage(entity_type, &record, &usage) {
                    Some(reason) => {
                        outcome.skipped.insert(record.id, reason);
                    }
                    None => accepted.push(record.id),
                },
                Ok(Err(e)) => {
                    log::error!("Usage probe for {entity_type} {} failed: {e}", record.id);
                    outcome.skipped.insert(record.id, SkipReason::ProbeFailed);
                }
                Err(_) => {
                    log::error!("Usage probe for {entity_type} {} panicked", record.id);
                    outcome.skipped.insert(record.id, SkipReason::ProbeFailed);
                }
            }
        }
        accepted
    }

    async fn commit_chunk(
        &self,
        entity_type: ContextEntityType,
        accepted: Vec<i64>,
        mode: DeleteMode,
        outcome: &mut BulkDeleteOutcome,
    ) {
        if accepted.is_empty() {
            return;
        }

        match self.store.delete_batch(entity_type, &accepted, mode).await {
            Ok(affected) => {
                if affected != accepted.len() as u64 {
                    log::debug!(
                        "{mode:?} delete of {} {entity_type} rows affected {affected}",
                        accepted.len()
                    );
                }
                outcome.deleted.extend(accepted);
            }
            Err(e) => {
                log::error!(
                    "{mode:?} delete of {} {entity_type} rows rolled back: {e}",
                    accepted.len()
                );
                let reason = SkipReason::DeleteFailed(e.to_string());
                for id in accepted {
                    outcome.skipped.insert(id, reason.clone());
                }
            }
        }
    }
}

fn skip_for_usage(
    entity_type: ContextEntityType,
    record: &EntityRecord,
    usage: &UsageResult,
) -> Option<SkipReason> {
    let message = usage_message(entity_type, &record.display, usage)?;
    if usage.verification_failed {
        Some(SkipReason::VerificationFailed(message))
    } else {
        Some(SkipReason::InUse(message))
    }
}
