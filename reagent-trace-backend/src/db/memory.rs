use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::{AtomicBool, Ordering},
};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{AliquotTransition, BatchTransition, Error, Guarded, Result, Store};
use crate::model::{
    Alert, AlertLink, Aliquot, AliquotStatus, AuditLogEntry, Batch, EntityType, Experiment,
    NewAlert, NewAliquot, NewAuditEntry, NewBatch, NewExperiment, NewPerson, NewSample, NewUsage,
    Person, QcStatus, Sample, StorageLocation, Usage, UsageRecord,
};

#[derive(Default)]
struct Tables {
    person: BTreeMap<Uuid, Person>,
    batch: BTreeMap<Uuid, Batch>,
    sample: BTreeMap<Uuid, Sample>,
    aliquot: BTreeMap<Uuid, Aliquot>,
    experiment: BTreeMap<Uuid, Experiment>,
    experiment_aliquot: BTreeMap<(Uuid, Uuid), Usage>,
    alert: BTreeMap<Uuid, Alert>,
    alert_experiment: BTreeMap<(Uuid, Uuid), AlertLink>,
    audit_log: Vec<AuditLogEntry>,
}

fn duplicate(entity: &str, field: &str, value: impl ToString) -> Error {
    Error::DuplicateRecord {
        entity: entity.to_string(),
        field: Some(field.to_string()),
        value: Some(value.to_string()),
    }
}

fn missing_reference(entity: &str, referenced_entity: &str, value: Uuid) -> Error {
    Error::ReferenceNotFound {
        entity: entity.to_string(),
        referenced_entity: referenced_entity.to_string(),
        value: Some(value.to_string()),
    }
}

impl Tables {
    fn append_audit(&mut self, audit: &NewAuditEntry) {
        let NewAuditEntry {
            id,
            entity_type,
            entity_id,
            action,
            actor_id,
            reason,
            metadata,
        } = audit.clone();

        self.audit_log.push(AuditLogEntry {
            id,
            entity_type,
            entity_id,
            action,
            actor_id,
            reason,
            metadata,
            created_at: Utc::now(),
        });
    }
}

/// A [`Store`] kept entirely in process memory, enforcing the same keys and references as the
/// Postgres schema. It can be switched off to simulate a database outage.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    async fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Other {
                message: "connection refused: store unavailable".to_string(),
            });
        }

        Ok(self.tables.lock().await)
    }
}

impl Store for MemoryStore {
    async fn fetch_person(&self, id: Uuid) -> Result<Option<Person>> {
        Ok(self.tables().await?.person.get(&id).cloned())
    }

    async fn fetch_batch(&self, id: Uuid) -> Result<Option<Batch>> {
        Ok(self.tables().await?.batch.get(&id).cloned())
    }

    async fn fetch_sample(&self, id: Uuid) -> Result<Option<Sample>> {
        Ok(self.tables().await?.sample.get(&id).cloned())
    }

    async fn fetch_aliquot(&self, id: Uuid) -> Result<Option<Aliquot>> {
        Ok(self.tables().await?.aliquot.get(&id).cloned())
    }

    async fn fetch_aliquot_by_code(&self, code: &str) -> Result<Option<Aliquot>> {
        Ok(self
            .tables()
            .await?
            .aliquot
            .values()
            .find(|a| a.code == code)
            .cloned())
    }

    async fn fetch_experiment(&self, id: Uuid) -> Result<Option<Experiment>> {
        Ok(self.tables().await?.experiment.get(&id).cloned())
    }

    async fn code_exists(&self, code: &str) -> Result<bool> {
        Ok(self
            .tables()
            .await?
            .aliquot
            .values()
            .any(|a| a.code == code))
    }

    async fn count_batch_aliquots(&self, batch_id: Uuid) -> Result<i64> {
        let n = self
            .tables()
            .await?
            .aliquot
            .values()
            .filter(|a| a.batch_id == batch_id)
            .count();

        Ok(i64::try_from(n).unwrap_or(i64::MAX))
    }

    async fn batch_aliquots(&self, batch_id: Uuid) -> Result<Vec<Aliquot>> {
        let tables = self.tables().await?;

        let mut aliquots: Vec<_> = tables
            .aliquot
            .values()
            .filter(|a| a.batch_id == batch_id)
            .cloned()
            .collect();
        aliquots.sort_by(|a, b| a.code.cmp(&b.code));

        Ok(aliquots)
    }

    async fn usages_of(&self, aliquot_ids: &[Uuid]) -> Result<Vec<UsageRecord>> {
        let tables = self.tables().await?;

        let mut records: Vec<_> = tables
            .experiment_aliquot
            .values()
            .filter(|u| aliquot_ids.contains(&u.aliquot_id))
            .filter_map(|u| {
                let experiment = tables.experiment.get(&u.experiment_id)?.clone();
                let owner = tables.person.get(&experiment.owner_id)?.clone();

                Some(UsageRecord {
                    aliquot_id: u.aliquot_id,
                    experiment,
                    owner,
                })
            })
            .collect();

        records.sort_by_key(|r| (r.experiment.performed_on, r.experiment.id, r.aliquot_id));

        Ok(records)
    }

    async fn insert_person(&self, person: NewPerson) -> Result<Person> {
        let mut tables = self.tables().await?;

        if tables.person.values().any(|p| p.email == person.email) {
            return Err(duplicate("person", "email", &person.email));
        }

        let person = Person::from(person);
        tables.person.insert(person.id, person.clone());

        Ok(person)
    }

    async fn insert_batch(&self, batch: NewBatch) -> Result<Batch> {
        let NewBatch {
            id,
            lot_number,
            vendor,
            received_on,
            expires_on,
        } = batch;

        let batch = Batch {
            id,
            lot_number,
            vendor,
            qc_status: QcStatus::default(),
            received_on,
            expires_on,
            inserted_at: Utc::now(),
        };
        self.tables().await?.batch.insert(id, batch.clone());

        Ok(batch)
    }

    async fn insert_sample(&self, sample: NewSample) -> Result<Sample> {
        let NewSample {
            id,
            batch_id,
            name,
            category,
        } = sample;

        let mut tables = self.tables().await?;
        if !tables.batch.contains_key(&batch_id) {
            return Err(missing_reference("sample", "batch", batch_id));
        }

        let sample = Sample {
            id,
            batch_id,
            name,
            category,
            next_aliquot_index: 1,
            inserted_at: Utc::now(),
        };
        tables.sample.insert(id, sample.clone());

        Ok(sample)
    }

    async fn insert_experiment(&self, experiment: NewExperiment) -> Result<Experiment> {
        let NewExperiment {
            id,
            title,
            performed_on,
            owner_id,
            notes,
            outputs,
        } = experiment;

        let mut tables = self.tables().await?;
        if !tables.person.contains_key(&owner_id) {
            return Err(missing_reference("experiment", "person", owner_id));
        }

        let experiment = Experiment {
            id,
            title,
            performed_on,
            owner_id,
            notes,
            outputs,
            inserted_at: Utc::now(),
        };
        tables.experiment.insert(id, experiment.clone());

        Ok(experiment)
    }

    async fn allocate_aliquot_indices(&self, sample_id: Uuid, count: i32) -> Result<Option<i32>> {
        let mut tables = self.tables().await?;

        Ok(tables.sample.get_mut(&sample_id).map(|sample| {
            let first = sample.next_aliquot_index;
            sample.next_aliquot_index += count;

            first
        }))
    }

    async fn insert_aliquots(&self, aliquots: Vec<NewAliquot>) -> Result<Vec<Aliquot>> {
        let mut tables = self.tables().await?;

        // Check the whole set before writing any of it
        {
            let mut codes = BTreeSet::new();
            for NewAliquot {
                code,
                sample_id,
                batch_id,
                ..
            } in &aliquots
            {
                if !codes.insert(code.as_str()) || tables.aliquot.values().any(|a| &a.code == code) {
                    return Err(duplicate("aliquot", "code", code));
                }
                match tables.sample.get(sample_id) {
                    Some(sample) if sample.batch_id == *batch_id => {}
                    _ => return Err(missing_reference("aliquot", "sample", *sample_id)),
                }
            }
        }

        let inserted_at = Utc::now();
        let created: Vec<_> = aliquots
            .into_iter()
            .map(|aliquot| {
                let NewAliquot {
                    id,
                    code,
                    sample_id,
                    batch_id,
                    status,
                    volume,
                    concentration,
                    unit,
                    made_on,
                    created_by,
                } = aliquot;

                Aliquot {
                    id,
                    code,
                    sample_id,
                    batch_id,
                    status,
                    volume,
                    concentration,
                    unit,
                    freezer: None,
                    box_label: None,
                    position: None,
                    made_on,
                    created_by,
                    inserted_at,
                }
            })
            .collect();

        for aliquot in &created {
            tables.aliquot.insert(aliquot.id, aliquot.clone());
        }

        Ok(created)
    }

    async fn relocate_aliquot(
        &self,
        aliquot_id: Uuid,
        location: &StorageLocation,
        audit: &NewAuditEntry,
    ) -> Result<Option<Aliquot>> {
        let mut tables = self.tables().await?;

        let Some(aliquot) = tables.aliquot.get_mut(&aliquot_id) else {
            return Ok(None);
        };

        let StorageLocation {
            freezer,
            box_label,
            position,
        } = location.clone();
        aliquot.freezer = freezer;
        aliquot.box_label = box_label;
        aliquot.position = position;

        let relocated = aliquot.clone();
        tables.append_audit(audit);

        Ok(Some(relocated))
    }

    async fn insert_usage(&self, usage: NewUsage) -> Result<Usage> {
        let NewUsage {
            experiment_id,
            aliquot_id,
            usage_notes,
        } = usage;

        let mut tables = self.tables().await?;

        if !tables.experiment.contains_key(&experiment_id) {
            return Err(missing_reference(
                "experiment_aliquot",
                "experiment",
                experiment_id,
            ));
        }
        if !tables.aliquot.contains_key(&aliquot_id) {
            return Err(missing_reference("experiment_aliquot", "aliquot", aliquot_id));
        }
        if tables
            .experiment_aliquot
            .contains_key(&(experiment_id, aliquot_id))
        {
            return Err(duplicate(
                "experiment_aliquot",
                "experiment_id, aliquot_id",
                format!("{experiment_id}, {aliquot_id}"),
            ));
        }

        let usage = Usage {
            experiment_id,
            aliquot_id,
            usage_notes,
            attached_at: Utc::now(),
        };
        tables
            .experiment_aliquot
            .insert((experiment_id, aliquot_id), usage.clone());

        Ok(usage)
    }

    async fn delete_usage(&self, experiment_id: Uuid, aliquot_id: Uuid) -> Result<bool> {
        Ok(self
            .tables()
            .await?
            .experiment_aliquot
            .remove(&(experiment_id, aliquot_id))
            .is_some())
    }

    async fn transition_aliquot(
        &self,
        transition: &AliquotTransition,
        audit: &NewAuditEntry,
    ) -> Result<Guarded<AliquotStatus>> {
        let mut tables = self.tables().await?;

        let Some(aliquot) = tables.aliquot.get_mut(&transition.aliquot_id) else {
            return Ok(Guarded::Missing);
        };

        let current = aliquot.status;
        if transition.blocked_from.contains(&current) {
            return Ok(Guarded::Blocked { current });
        }

        aliquot.status = transition.to;
        tables.append_audit(audit);

        Ok(Guarded::Applied {
            previous: current,
            cascaded: 0,
        })
    }

    async fn transition_batch(
        &self,
        transition: &BatchTransition,
        audit: &NewAuditEntry,
    ) -> Result<Guarded<QcStatus>> {
        let mut tables = self.tables().await?;

        let Some(batch) = tables.batch.get_mut(&transition.batch_id) else {
            return Ok(Guarded::Missing);
        };

        let current = batch.qc_status;
        if !current.can_transition_to(transition.to) {
            return Ok(Guarded::Blocked { current });
        }
        batch.qc_status = transition.to;

        let mut cascaded = 0;
        for aliquot in tables
            .aliquot
            .values_mut()
            .filter(|a| a.batch_id == transition.batch_id && !a.status.is_terminal())
        {
            aliquot.status = transition.cascade;
            cascaded += 1;
        }

        tables.append_audit(audit);

        Ok(Guarded::Applied {
            previous: current,
            cascaded,
        })
    }

    async fn create_alert(&self, alert: &NewAlert, experiment_ids: &[Uuid]) -> Result<Alert> {
        let mut tables = self.tables().await?;

        if let Some(missing) = experiment_ids
            .iter()
            .find(|id| !tables.experiment.contains_key(*id))
        {
            return Err(missing_reference("alert_experiment", "experiment", *missing));
        }

        let NewAlert {
            id,
            kind,
            entity_type,
            entity_id,
            title,
            message,
            created_by,
        } = alert.clone();

        let created = Alert {
            id,
            kind,
            entity_type,
            entity_id,
            title,
            message,
            created_by,
            created_at: Utc::now(),
        };
        tables.alert.insert(id, created.clone());

        for experiment_id in experiment_ids {
            tables
                .alert_experiment
                .entry((id, *experiment_id))
                .or_insert(AlertLink {
                    alert_id: id,
                    experiment_id: *experiment_id,
                    acknowledged_at: None,
                    acknowledged_by: None,
                });
        }

        Ok(created)
    }

    async fn alerts_for(&self, entity_type: EntityType, entity_id: Uuid) -> Result<Vec<Alert>> {
        let tables = self.tables().await?;

        let mut alerts: Vec<_> = tables
            .alert
            .values()
            .filter(|a| a.entity_type == entity_type && a.entity_id == entity_id)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(alerts)
    }

    async fn alert_links(&self, alert_id: Uuid) -> Result<Vec<AlertLink>> {
        Ok(self
            .tables()
            .await?
            .alert_experiment
            .values()
            .filter(|l| l.alert_id == alert_id)
            .cloned()
            .collect())
    }

    async fn experiment_alerts(&self, experiment_id: Uuid) -> Result<Vec<(Alert, AlertLink)>> {
        let tables = self.tables().await?;

        let mut alerts: Vec<_> = tables
            .alert_experiment
            .values()
            .filter(|l| l.experiment_id == experiment_id)
            .filter_map(|l| Some((tables.alert.get(&l.alert_id)?.clone(), l.clone())))
            .collect();
        alerts.sort_by(|(a, _), (b, _)| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(alerts)
    }

    async fn acknowledge_alert_link(
        &self,
        alert_id: Uuid,
        experiment_id: Uuid,
        actor_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<AlertLink>> {
        let mut tables = self.tables().await?;

        if !tables.person.contains_key(&actor_id) {
            return Err(missing_reference("alert_experiment", "person", actor_id));
        }

        Ok(tables
            .alert_experiment
            .get_mut(&(alert_id, experiment_id))
            .map(|link| {
                if !link.is_acknowledged() {
                    link.acknowledged_at = Some(at);
                    link.acknowledged_by = Some(actor_id);
                }

                link.clone()
            }))
    }

    async fn audit_entries(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AuditLogEntry>> {
        let limit = usize::try_from(limit).unwrap_or_default();

        Ok(self
            .tables()
            .await?
            .audit_log
            .iter()
            .rev()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
