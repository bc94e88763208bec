use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{
    Alert, AlertLink, Aliquot, AliquotStatus, AuditLogEntry, Batch, EntityType, Experiment,
    NewAlert, NewAliquot, NewAuditEntry, NewBatch, NewExperiment, NewPerson, NewSample, NewUsage,
    Person, QcStatus, Sample, StorageLocation, Usage, UsageRecord,
};

pub mod error;
pub mod memory;
pub mod pg;
#[cfg(test)]
pub(crate) mod test_util;

pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use pg::PgStore;

/// Move one aliquot to `to`, unless it currently sits in one of `blocked_from`
#[derive(Debug, Clone)]
pub struct AliquotTransition {
    pub aliquot_id: Uuid,
    pub to: AliquotStatus,
    pub blocked_from: &'static [AliquotStatus],
}

/// Finalize a pending batch and cascade `cascade` onto its non-terminal aliquots
#[derive(Debug, Clone)]
pub struct BatchTransition {
    pub batch_id: Uuid,
    pub to: QcStatus,
    pub cascade: AliquotStatus,
}

/// What a guarded status write found once it held the row lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guarded<S> {
    Applied { previous: S, cascaded: usize },
    Missing,
    Blocked { current: S },
}

/// The relational store behind every operation.
///
/// Reads are plain lookups. `transition_*` apply the precondition check, the status write(s)
/// and the audit entry as one atomic unit. `create_alert` writes the alert and its
/// per-experiment rows as a second, independent unit.
pub trait Store: Send + Sync {
    fn fetch_person(&self, id: Uuid) -> impl Future<Output = Result<Option<Person>>> + Send;

    fn fetch_batch(&self, id: Uuid) -> impl Future<Output = Result<Option<Batch>>> + Send;

    fn fetch_sample(&self, id: Uuid) -> impl Future<Output = Result<Option<Sample>>> + Send;

    fn fetch_aliquot(&self, id: Uuid) -> impl Future<Output = Result<Option<Aliquot>>> + Send;

    fn fetch_aliquot_by_code(
        &self,
        code: &str,
    ) -> impl Future<Output = Result<Option<Aliquot>>> + Send;

    fn fetch_experiment(&self, id: Uuid)
    -> impl Future<Output = Result<Option<Experiment>>> + Send;

    fn code_exists(&self, code: &str) -> impl Future<Output = Result<bool>> + Send;

    fn count_batch_aliquots(&self, batch_id: Uuid) -> impl Future<Output = Result<i64>> + Send;

    fn batch_aliquots(&self, batch_id: Uuid) -> impl Future<Output = Result<Vec<Aliquot>>> + Send;

    /// Every usage of any of `aliquot_ids`, ordered by experiment date then experiment id
    fn usages_of(
        &self,
        aliquot_ids: &[Uuid],
    ) -> impl Future<Output = Result<Vec<UsageRecord>>> + Send;

    fn insert_person(&self, person: NewPerson) -> impl Future<Output = Result<Person>> + Send;

    fn insert_batch(&self, batch: NewBatch) -> impl Future<Output = Result<Batch>> + Send;

    fn insert_sample(&self, sample: NewSample) -> impl Future<Output = Result<Sample>> + Send;

    fn insert_experiment(
        &self,
        experiment: NewExperiment,
    ) -> impl Future<Output = Result<Experiment>> + Send;

    /// Reserves `count` consecutive aliquot indices for a sample and returns the first, or
    /// `None` if the sample does not exist. Concurrent callers never receive overlapping ranges.
    fn allocate_aliquot_indices(
        &self,
        sample_id: Uuid,
        count: i32,
    ) -> impl Future<Output = Result<Option<i32>>> + Send;

    /// Inserts every aliquot or none of them. Fails with [`Error::DuplicateRecord`] on field
    /// `code`, naming the clashing code, if any code is taken.
    fn insert_aliquots(
        &self,
        aliquots: Vec<NewAliquot>,
    ) -> impl Future<Output = Result<Vec<Aliquot>>> + Send;

    /// Overwrites an aliquot's storage coordinates and records `audit` in the same unit.
    /// `None` means there is no such aliquot.
    fn relocate_aliquot(
        &self,
        aliquot_id: Uuid,
        location: &StorageLocation,
        audit: &NewAuditEntry,
    ) -> impl Future<Output = Result<Option<Aliquot>>> + Send;

    fn insert_usage(&self, usage: NewUsage) -> impl Future<Output = Result<Usage>> + Send;

    fn delete_usage(
        &self,
        experiment_id: Uuid,
        aliquot_id: Uuid,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn transition_aliquot(
        &self,
        transition: &AliquotTransition,
        audit: &NewAuditEntry,
    ) -> impl Future<Output = Result<Guarded<AliquotStatus>>> + Send;

    fn transition_batch(
        &self,
        transition: &BatchTransition,
        audit: &NewAuditEntry,
    ) -> impl Future<Output = Result<Guarded<QcStatus>>> + Send;

    fn create_alert(
        &self,
        alert: &NewAlert,
        experiment_ids: &[Uuid],
    ) -> impl Future<Output = Result<Alert>> + Send;

    fn alerts_for(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Alert>>> + Send;

    fn alert_links(&self, alert_id: Uuid) -> impl Future<Output = Result<Vec<AlertLink>>> + Send;

    /// Every alert linked to one experiment with that experiment's acknowledgement row, newest
    /// alert first
    fn experiment_alerts(
        &self,
        experiment_id: Uuid,
    ) -> impl Future<Output = Result<Vec<(Alert, AlertLink)>>> + Send;

    /// Stamps an unacknowledged row and returns the row as it now stands. An already
    /// acknowledged row is returned untouched; `None` means there is no such row.
    fn acknowledge_alert_link(
        &self,
        alert_id: Uuid,
        experiment_id: Uuid,
        actor_id: Uuid,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<AlertLink>>> + Send;

    /// Newest first
    fn audit_entries(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<AuditLogEntry>>> + Send;
}
