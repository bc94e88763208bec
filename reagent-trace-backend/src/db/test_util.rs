use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, NaiveDate, Utc};
use rstest::fixture;
use uuid::Uuid;

use super::{AliquotTransition, BatchTransition, Guarded, MemoryStore, Store};
use crate::{
    db,
    model::{
        Alert, AlertLink, Aliquot, AliquotStatus, AuditLogEntry, Batch, EntityType, Experiment,
        ExperimentOutput, NewAlert, NewAliquot, NewAuditEntry, NewBatch, NewExperiment,
        NewPerson, NewSample, NewUsage, Person, QcStatus, Sample, StorageLocation, Usage,
        UsageRecord,
    },
    notify::{self, Notification, Notifier},
};

pub const LOT_NUMBER: &str = "12345ABC";
pub const SAMPLE_NAME: &str = "Fetal Bovine Serum";

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn new_aliquot(sample: &Sample, code: &str) -> NewAliquot {
    NewAliquot {
        id: Uuid::now_v7(),
        code: code.to_string(),
        sample_id: sample.id,
        batch_id: sample.batch_id,
        status: AliquotStatus::PendingQc,
        volume: Some(1.5),
        concentration: None,
        unit: Some("mL".to_string()),
        made_on: date(2024, 1, 18),
        created_by: None,
    }
}

/// One batch, one sample, aliquots X, Y and Z.
///
/// Owner A ran E1 and E2, both on X. Owner B ran E3 on Y and Z. E1 has a reviewable output,
/// E2's outputs are malformed and E3's outputs lack urls.
pub struct World {
    pub store: MemoryStore,
    pub batch: Batch,
    pub sample: Sample,
    pub x: Aliquot,
    pub y: Aliquot,
    pub z: Aliquot,
    pub owner_a: Person,
    pub owner_b: Person,
    pub e1: Experiment,
    pub e2: Experiment,
    pub e3: Experiment,
}

impl World {
    async fn seed() -> Self {
        let store = MemoryStore::new();

        let batch = store.insert_batch(NewBatch::new(LOT_NUMBER)).await.unwrap();
        let sample = store
            .insert_sample(NewSample::new(batch.id, SAMPLE_NAME))
            .await
            .unwrap();
        store.allocate_aliquot_indices(sample.id, 3).await.unwrap();

        let [x, y, z]: [Aliquot; 3] = store
            .insert_aliquots(vec![
                new_aliquot(&sample, "FETALBOVINESERUM-12345ABC-20240118-A01-AAAA"),
                new_aliquot(&sample, "FETALBOVINESERUM-12345ABC-20240118-A02-BBBB"),
                new_aliquot(&sample, "FETALBOVINESERUM-12345ABC-20240118-A03-CCCC"),
            ])
            .await
            .unwrap()
            .try_into()
            .unwrap();

        let owner_a = store
            .insert_person(NewPerson::new("Ada Owner", "ada@example.org"))
            .await
            .unwrap();
        let owner_b = store
            .insert_person(NewPerson::new("Ben Owner", "ben@example.org"))
            .await
            .unwrap();

        let e1 = store
            .insert_experiment(
                NewExperiment::new("Cell viability", date(2024, 1, 20), owner_a.id).with_outputs(
                    &[ExperimentOutput::new(
                        "https://eln.example.org/e1/plate",
                        "plate read",
                    )],
                ),
            )
            .await
            .unwrap();

        let mut e2 = NewExperiment::new("Passage 4", date(2024, 1, 22), owner_a.id);
        e2.outputs = Some("{not json".to_string());
        let e2 = store.insert_experiment(e2).await.unwrap();

        let mut e3 = NewExperiment::new("Western blot", date(2024, 1, 21), owner_b.id);
        e3.outputs = Some(r#"[{"label": "gel image"}]"#.to_string());
        let e3 = store.insert_experiment(e3).await.unwrap();

        for (experiment, aliquot) in [(&e1, &x), (&e2, &x), (&e3, &y), (&e3, &z)] {
            store
                .insert_usage(NewUsage {
                    experiment_id: experiment.id,
                    aliquot_id: aliquot.id,
                    usage_notes: None,
                })
                .await
                .unwrap();
        }

        Self {
            store,
            batch,
            sample,
            x,
            y,
            z,
            owner_a,
            owner_b,
            e1,
            e2,
            e3,
        }
    }
}

#[fixture]
pub async fn world() -> World {
    World::seed().await
}

/// Keeps every notification it is handed. Deliveries to `failing` addresses are refused.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
    failing: BTreeSet<String>,
}

impl RecordingNotifier {
    pub fn failing_for(addresses: &[&str]) -> Self {
        Self {
            failing: addresses.iter().map(ToString::to_string).collect(),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> notify::Result<()> {
        if self.failing.contains(&notification.to) {
            return Err(notify::Error::Rejected {
                to: notification.to.clone(),
                message: "mailbox unavailable".to_string(),
            });
        }

        self.sent.lock().unwrap().push(notification.clone());

        Ok(())
    }
}

/// Wraps a [`MemoryStore`] to stage failures the real database can produce mid-operation.
///
/// Codes in `unseen_codes` were committed by another writer after the uniqueness lookup, so
/// `code_exists` misses them but inserting them still clashes. With `refuse_alerts` set,
/// alert creation fails while every other write goes through.
pub struct FaultyStore {
    pub inner: MemoryStore,
    unseen_codes: BTreeSet<String>,
    refuse_alerts: bool,
}

impl FaultyStore {
    pub fn racing(inner: MemoryStore, unseen_codes: &[&str]) -> Self {
        Self {
            inner,
            unseen_codes: unseen_codes.iter().map(ToString::to_string).collect(),
            refuse_alerts: false,
        }
    }

    pub fn refusing_alerts(inner: MemoryStore) -> Self {
        Self {
            inner,
            unseen_codes: BTreeSet::new(),
            refuse_alerts: true,
        }
    }
}

impl Store for FaultyStore {
    async fn fetch_person(&self, id: Uuid) -> db::Result<Option<Person>> {
        self.inner.fetch_person(id).await
    }

    async fn fetch_batch(&self, id: Uuid) -> db::Result<Option<Batch>> {
        self.inner.fetch_batch(id).await
    }

    async fn fetch_sample(&self, id: Uuid) -> db::Result<Option<Sample>> {
        self.inner.fetch_sample(id).await
    }

    async fn fetch_aliquot(&self, id: Uuid) -> db::Result<Option<Aliquot>> {
        self.inner.fetch_aliquot(id).await
    }

    async fn fetch_aliquot_by_code(&self, code: &str) -> db::Result<Option<Aliquot>> {
        self.inner.fetch_aliquot_by_code(code).await
    }

    async fn fetch_experiment(&self, id: Uuid) -> db::Result<Option<Experiment>> {
        self.inner.fetch_experiment(id).await
    }

    async fn code_exists(&self, code: &str) -> db::Result<bool> {
        if self.unseen_codes.contains(code) {
            return Ok(false);
        }

        self.inner.code_exists(code).await
    }

    async fn count_batch_aliquots(&self, batch_id: Uuid) -> db::Result<i64> {
        self.inner.count_batch_aliquots(batch_id).await
    }

    async fn batch_aliquots(&self, batch_id: Uuid) -> db::Result<Vec<Aliquot>> {
        self.inner.batch_aliquots(batch_id).await
    }

    async fn usages_of(&self, aliquot_ids: &[Uuid]) -> db::Result<Vec<UsageRecord>> {
        self.inner.usages_of(aliquot_ids).await
    }

    async fn insert_person(&self, person: NewPerson) -> db::Result<Person> {
        self.inner.insert_person(person).await
    }

    async fn insert_batch(&self, batch: NewBatch) -> db::Result<Batch> {
        self.inner.insert_batch(batch).await
    }

    async fn insert_sample(&self, sample: NewSample) -> db::Result<Sample> {
        self.inner.insert_sample(sample).await
    }

    async fn insert_experiment(&self, experiment: NewExperiment) -> db::Result<Experiment> {
        self.inner.insert_experiment(experiment).await
    }

    async fn allocate_aliquot_indices(&self, sample_id: Uuid, count: i32) -> db::Result<Option<i32>> {
        self.inner.allocate_aliquot_indices(sample_id, count).await
    }

    async fn insert_aliquots(&self, aliquots: Vec<NewAliquot>) -> db::Result<Vec<Aliquot>> {
        self.inner.insert_aliquots(aliquots).await
    }

    async fn relocate_aliquot(
        &self,
        aliquot_id: Uuid,
        location: &StorageLocation,
        audit: &NewAuditEntry,
    ) -> db::Result<Option<Aliquot>> {
        self.inner.relocate_aliquot(aliquot_id, location, audit).await
    }

    async fn insert_usage(&self, usage: NewUsage) -> db::Result<Usage> {
        self.inner.insert_usage(usage).await
    }

    async fn delete_usage(&self, experiment_id: Uuid, aliquot_id: Uuid) -> db::Result<bool> {
        self.inner.delete_usage(experiment_id, aliquot_id).await
    }

    async fn transition_aliquot(
        &self,
        transition: &AliquotTransition,
        audit: &NewAuditEntry,
    ) -> db::Result<Guarded<AliquotStatus>> {
        self.inner.transition_aliquot(transition, audit).await
    }

    async fn transition_batch(
        &self,
        transition: &BatchTransition,
        audit: &NewAuditEntry,
    ) -> db::Result<Guarded<QcStatus>> {
        self.inner.transition_batch(transition, audit).await
    }

    async fn create_alert(&self, alert: &NewAlert, experiment_ids: &[Uuid]) -> db::Result<Alert> {
        if self.refuse_alerts {
            return Err(db::Error::Other {
                message: "connection reset while creating alert".to_string(),
            });
        }

        self.inner.create_alert(alert, experiment_ids).await
    }

    async fn alerts_for(&self, entity_type: EntityType, entity_id: Uuid) -> db::Result<Vec<Alert>> {
        self.inner.alerts_for(entity_type, entity_id).await
    }

    async fn alert_links(&self, alert_id: Uuid) -> db::Result<Vec<AlertLink>> {
        self.inner.alert_links(alert_id).await
    }

    async fn experiment_alerts(&self, experiment_id: Uuid) -> db::Result<Vec<(Alert, AlertLink)>> {
        self.inner.experiment_alerts(experiment_id).await
    }

    async fn acknowledge_alert_link(
        &self,
        alert_id: Uuid,
        experiment_id: Uuid,
        actor_id: Uuid,
        at: DateTime<Utc>,
    ) -> db::Result<Option<AlertLink>> {
        self.inner
            .acknowledge_alert_link(alert_id, experiment_id, actor_id, at)
            .await
    }

    async fn audit_entries(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        limit: i64,
    ) -> db::Result<Vec<AuditLogEntry>> {
        self.inner.audit_entries(entity_type, entity_id, limit).await
    }
}
