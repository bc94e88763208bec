use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{
    AsyncConnection, AsyncPgConnection, RunQueryDsl,
    async_connection_wrapper::AsyncConnectionWrapper,
    pooled_connection::{
        AsyncDieselConnectionManager,
        deadpool::{Object, Pool},
    },
    scoped_futures::ScopedFutureExt,
};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use reagent_trace_schema::{
    alert, alert_experiment, aliquot, audit_log, batch, experiment, experiment_aliquot, person,
    sample,
};
use uuid::Uuid;

use super::{AliquotTransition, BatchTransition, Error, Guarded, Result, Store};
use crate::model::{
    Alert, AlertLink, Aliquot, AliquotStatus, AuditLogEntry, Batch, EntityType, Experiment,
    NewAlert, NewAliquot, NewAuditEntry, NewBatch, NewExperiment, NewPerson, NewSample, NewUsage,
    Person, QcStatus, Sample, StorageLocation, Usage, UsageRecord,
};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("../db/migrations");

#[derive(Clone)]
pub struct PgStore {
    db_pool: Pool<AsyncPgConnection>,
}

impl PgStore {
    /// # Errors
    pub fn connect(db_url: &str, max_connections: usize) -> anyhow::Result<Self> {
        let db_config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
        let db_pool = Pool::builder(db_config).max_size(max_connections).build()?;

        Ok(Self::from_pool(db_pool))
    }

    #[must_use]
    pub fn from_pool(db_pool: Pool<AsyncPgConnection>) -> Self {
        Self { db_pool }
    }

    async fn db_conn(&self) -> Result<Object<AsyncPgConnection>> {
        Ok(self.db_pool.get().await?)
    }

    /// # Errors
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        let db_conn = self.db_conn().await?;
        let mut wrapper: AsyncConnectionWrapper<Object<AsyncPgConnection>> =
            AsyncConnectionWrapper::from(db_conn);

        tokio::task::spawn_blocking(move || {
            wrapper
                .run_pending_migrations(MIGRATIONS)
                .map(|_| ())
                .map_err(|err| anyhow::anyhow!("{err}"))
        })
        .await??;

        Ok(())
    }
}

async fn append_audit(audit: &NewAuditEntry, db_conn: &mut AsyncPgConnection) -> Result<()> {
    diesel::insert_into(audit_log::table)
        .values(audit)
        .execute(db_conn)
        .await?;

    Ok(())
}

impl Store for PgStore {
    async fn fetch_person(&self, id: Uuid) -> Result<Option<Person>> {
        let mut db_conn = self.db_conn().await?;

        Ok(person::table
            .find(id)
            .select(Person::as_select())
            .first(&mut db_conn)
            .await
            .optional()?)
    }

    async fn fetch_batch(&self, id: Uuid) -> Result<Option<Batch>> {
        let mut db_conn = self.db_conn().await?;

        Ok(batch::table
            .find(id)
            .select(Batch::as_select())
            .first(&mut db_conn)
            .await
            .optional()?)
    }

    async fn fetch_sample(&self, id: Uuid) -> Result<Option<Sample>> {
        let mut db_conn = self.db_conn().await?;

        Ok(sample::table
            .find(id)
            .select(Sample::as_select())
            .first(&mut db_conn)
            .await
            .optional()?)
    }

    async fn fetch_aliquot(&self, id: Uuid) -> Result<Option<Aliquot>> {
        let mut db_conn = self.db_conn().await?;

        Ok(aliquot::table
            .find(id)
            .select(Aliquot::as_select())
            .first(&mut db_conn)
            .await
            .optional()?)
    }

    async fn fetch_aliquot_by_code(&self, code: &str) -> Result<Option<Aliquot>> {
        let mut db_conn = self.db_conn().await?;

        Ok(aliquot::table
            .filter(aliquot::code.eq(code))
            .select(Aliquot::as_select())
            .first(&mut db_conn)
            .await
            .optional()?)
    }

    async fn fetch_experiment(&self, id: Uuid) -> Result<Option<Experiment>> {
        let mut db_conn = self.db_conn().await?;

        Ok(experiment::table
            .find(id)
            .select(Experiment::as_select())
            .first(&mut db_conn)
            .await
            .optional()?)
    }

    async fn code_exists(&self, code: &str) -> Result<bool> {
        let mut db_conn = self.db_conn().await?;

        Ok(
            diesel::select(diesel::dsl::exists(aliquot::table.filter(aliquot::code.eq(code))))
                .get_result(&mut db_conn)
                .await?,
        )
    }

    async fn count_batch_aliquots(&self, batch_id: Uuid) -> Result<i64> {
        let mut db_conn = self.db_conn().await?;

        Ok(aliquot::table
            .filter(aliquot::batch_id.eq(batch_id))
            .count()
            .get_result(&mut db_conn)
            .await?)
    }

    async fn batch_aliquots(&self, batch_id: Uuid) -> Result<Vec<Aliquot>> {
        let mut db_conn = self.db_conn().await?;

        Ok(aliquot::table
            .filter(aliquot::batch_id.eq(batch_id))
            .order_by(aliquot::code)
            .select(Aliquot::as_select())
            .load(&mut db_conn)
            .await?)
    }

    async fn usages_of(&self, aliquot_ids: &[Uuid]) -> Result<Vec<UsageRecord>> {
        if aliquot_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut db_conn = self.db_conn().await?;

        let rows: Vec<(Uuid, Experiment, Person)> = experiment_aliquot::table
            .inner_join(experiment::table.inner_join(person::table))
            .filter(experiment_aliquot::aliquot_id.eq_any(aliquot_ids))
            .order_by((
                experiment::performed_on,
                experiment::id,
                experiment_aliquot::aliquot_id,
            ))
            .select((
                experiment_aliquot::aliquot_id,
                Experiment::as_select(),
                Person::as_select(),
            ))
            .load(&mut db_conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(aliquot_id, experiment, owner)| UsageRecord {
                aliquot_id,
                experiment,
                owner,
            })
            .collect())
    }

    async fn insert_person(&self, person: NewPerson) -> Result<Person> {
        let mut db_conn = self.db_conn().await?;

        Ok(diesel::insert_into(person::table)
            .values(&person)
            .returning(Person::as_returning())
            .get_result(&mut db_conn)
            .await?)
    }

    async fn insert_batch(&self, batch: NewBatch) -> Result<Batch> {
        let mut db_conn = self.db_conn().await?;

        Ok(diesel::insert_into(batch::table)
            .values(&batch)
            .returning(Batch::as_returning())
            .get_result(&mut db_conn)
            .await?)
    }

    async fn insert_sample(&self, sample: NewSample) -> Result<Sample> {
        let mut db_conn = self.db_conn().await?;

        Ok(diesel::insert_into(sample::table)
            .values(&sample)
            .returning(Sample::as_returning())
            .get_result(&mut db_conn)
            .await?)
    }

    async fn insert_experiment(&self, experiment: NewExperiment) -> Result<Experiment> {
        let mut db_conn = self.db_conn().await?;

        Ok(diesel::insert_into(experiment::table)
            .values(&experiment)
            .returning(Experiment::as_returning())
            .get_result(&mut db_conn)
            .await?)
    }

    async fn allocate_aliquot_indices(&self, sample_id: Uuid, count: i32) -> Result<Option<i32>> {
        let mut db_conn = self.db_conn().await?;

        // The row lock taken by the update serializes allocation per sample
        let next: Option<i32> = diesel::update(sample::table.find(sample_id))
            .set(sample::next_aliquot_index.eq(sample::next_aliquot_index + count))
            .returning(sample::next_aliquot_index)
            .get_result(&mut db_conn)
            .await
            .optional()?;

        Ok(next.map(|next| next - count))
    }

    async fn insert_aliquots(&self, aliquots: Vec<NewAliquot>) -> Result<Vec<Aliquot>> {
        if aliquots.is_empty() {
            return Ok(Vec::new());
        }

        let mut db_conn = self.db_conn().await?;

        // A single multi-row insert either lands every row or none
        Ok(diesel::insert_into(aliquot::table)
            .values(&aliquots)
            .returning(Aliquot::as_returning())
            .get_results(&mut db_conn)
            .await?)
    }

    async fn relocate_aliquot(
        &self,
        aliquot_id: Uuid,
        location: &StorageLocation,
        audit: &NewAuditEntry,
    ) -> Result<Option<Aliquot>> {
        let mut db_conn = self.db_conn().await?;

        db_conn
            .transaction::<_, Error, _>(|conn| {
                async move {
                    let relocated = diesel::update(aliquot::table.find(aliquot_id))
                        .set(location)
                        .returning(Aliquot::as_returning())
                        .get_result(conn)
                        .await
                        .optional()?;

                    if relocated.is_some() {
                        append_audit(audit, conn).await?;
                    }

                    Ok(relocated)
                }
                .scope_boxed()
            })
            .await
    }

    async fn insert_usage(&self, usage: NewUsage) -> Result<Usage> {
        let mut db_conn = self.db_conn().await?;

        Ok(diesel::insert_into(experiment_aliquot::table)
            .values(&usage)
            .returning(Usage::as_returning())
            .get_result(&mut db_conn)
            .await?)
    }

    async fn delete_usage(&self, experiment_id: Uuid, aliquot_id: Uuid) -> Result<bool> {
        let mut db_conn = self.db_conn().await?;

        let n_deleted = diesel::delete(experiment_aliquot::table.find((experiment_id, aliquot_id)))
            .execute(&mut db_conn)
            .await?;

        Ok(n_deleted > 0)
    }

    async fn transition_aliquot(
        &self,
        transition: &AliquotTransition,
        audit: &NewAuditEntry,
    ) -> Result<Guarded<AliquotStatus>> {
        let AliquotTransition {
            aliquot_id,
            to,
            blocked_from,
        } = *transition;

        let mut db_conn = self.db_conn().await?;

        db_conn
            .transaction::<_, Error, _>(|conn| {
                async move {
                    let current: Option<AliquotStatus> = aliquot::table
                        .find(aliquot_id)
                        .select(aliquot::status)
                        .for_update()
                        .first(conn)
                        .await
                        .optional()?;

                    let Some(current) = current else {
                        return Ok(Guarded::Missing);
                    };

                    if blocked_from.contains(&current) {
                        return Ok(Guarded::Blocked { current });
                    }

                    diesel::update(aliquot::table.find(aliquot_id))
                        .set(aliquot::status.eq(to))
                        .execute(conn)
                        .await?;

                    append_audit(audit, conn).await?;

                    Ok(Guarded::Applied {
                        previous: current,
                        cascaded: 0,
                    })
                }
                .scope_boxed()
            })
            .await
    }

    async fn transition_batch(
        &self,
        transition: &BatchTransition,
        audit: &NewAuditEntry,
    ) -> Result<Guarded<QcStatus>> {
        let BatchTransition {
            batch_id,
            to,
            cascade,
        } = *transition;

        let mut db_conn = self.db_conn().await?;

        db_conn
            .transaction::<_, Error, _>(|conn| {
                async move {
                    let current: Option<QcStatus> = batch::table
                        .find(batch_id)
                        .select(batch::qc_status)
                        .for_update()
                        .first(conn)
                        .await
                        .optional()?;

                    let Some(current) = current else {
                        return Ok(Guarded::Missing);
                    };

                    if !current.can_transition_to(to) {
                        return Ok(Guarded::Blocked { current });
                    }

                    diesel::update(batch::table.find(batch_id))
                        .set(batch::qc_status.eq(to))
                        .execute(conn)
                        .await?;

                    let cascaded = diesel::update(
                        aliquot::table
                            .filter(aliquot::batch_id.eq(batch_id))
                            .filter(aliquot::status.ne_all(AliquotStatus::TERMINAL)),
                    )
                    .set(aliquot::status.eq(cascade))
                    .execute(conn)
                    .await?;

                    append_audit(audit, conn).await?;

                    Ok(Guarded::Applied {
                        previous: current,
                        cascaded,
                    })
                }
                .scope_boxed()
            })
            .await
    }

    async fn create_alert(&self, alert: &NewAlert, experiment_ids: &[Uuid]) -> Result<Alert> {
        let mut db_conn = self.db_conn().await?;

        db_conn
            .transaction::<_, Error, _>(|conn| {
                async move {
                    let created = diesel::insert_into(alert::table)
                        .values(alert)
                        .returning(Alert::as_returning())
                        .get_result(conn)
                        .await?;

                    let links: Vec<_> = experiment_ids
                        .iter()
                        .map(|experiment_id| {
                            (
                                alert_experiment::alert_id.eq(created.id),
                                alert_experiment::experiment_id.eq(*experiment_id),
                            )
                        })
                        .collect();

                    if !links.is_empty() {
                        diesel::insert_into(alert_experiment::table)
                            .values(&links)
                            .on_conflict_do_nothing()
                            .execute(conn)
                            .await?;
                    }

                    Ok(created)
                }
                .scope_boxed()
            })
            .await
    }

    async fn alerts_for(&self, entity_type: EntityType, entity_id: Uuid) -> Result<Vec<Alert>> {
        let mut db_conn = self.db_conn().await?;

        Ok(alert::table
            .filter(alert::entity_type.eq(entity_type))
            .filter(alert::entity_id.eq(entity_id))
            .order_by(alert::created_at.desc())
            .select(Alert::as_select())
            .load(&mut db_conn)
            .await?)
    }

    async fn alert_links(&self, alert_id: Uuid) -> Result<Vec<AlertLink>> {
        let mut db_conn = self.db_conn().await?;

        Ok(alert_experiment::table
            .filter(alert_experiment::alert_id.eq(alert_id))
            .order_by(alert_experiment::experiment_id)
            .select(AlertLink::as_select())
            .load(&mut db_conn)
            .await?)
    }

    async fn experiment_alerts(&self, experiment_id: Uuid) -> Result<Vec<(Alert, AlertLink)>> {
        let mut db_conn = self.db_conn().await?;

        Ok(alert_experiment::table
            .inner_join(alert::table)
            .filter(alert_experiment::experiment_id.eq(experiment_id))
            .order_by((alert::created_at.desc(), alert::id.desc()))
            .select((Alert::as_select(), AlertLink::as_select()))
            .load(&mut db_conn)
            .await?)
    }

    async fn acknowledge_alert_link(
        &self,
        alert_id: Uuid,
        experiment_id: Uuid,
        actor_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<AlertLink>> {
        use alert_experiment::{acknowledged_at, acknowledged_by};

        let mut db_conn = self.db_conn().await?;

        // First acknowledgement wins
        diesel::update(
            alert_experiment::table
                .find((alert_id, experiment_id))
                .filter(acknowledged_at.is_null()),
        )
        .set((acknowledged_at.eq(at), acknowledged_by.eq(actor_id)))
        .execute(&mut db_conn)
        .await?;

        Ok(alert_experiment::table
            .find((alert_id, experiment_id))
            .select(AlertLink::as_select())
            .first(&mut db_conn)
            .await
            .optional()?)
    }

    async fn audit_entries(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AuditLogEntry>> {
        let mut db_conn = self.db_conn().await?;

        Ok(audit_log::table
            .filter(audit_log::entity_type.eq(entity_type))
            .filter(audit_log::entity_id.eq(entity_id))
            .order_by((audit_log::created_at.desc(), audit_log::id.desc()))
            .limit(limit)
            .select(AuditLogEntry::as_select())
            .load(&mut db_conn)
            .await?)
    }
}
