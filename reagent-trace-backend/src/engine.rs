use std::{fmt::Display, str::FromStr};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;
use valuable::Valuable;

use crate::{
    db::{self, AliquotTransition, BatchTransition, Guarded, Store},
    error::{Error, Result},
    impact::{self, ImpactSummary},
    model::{
        Alert, AlertKind, AlertLink, Aliquot, AliquotStatus, AuditAction, AuditLogEntry, Batch,
        EntityType, NewAlert, NewAuditEntry, NewUsage, QcStatus, StorageLocation, Usage,
    },
    notify::{self, DispatchReport, Notification, Notifier},
};

pub const DEFAULT_AUDIT_LIMIT: i64 = 50;

const QC_FAIL_REASON: &str = "Batch failed QC; aliquots quarantined";
const QC_RELEASE_REASON: &str = "Batch released (QC passed)";

/// What happened after a status change had committed. Nothing here can undo the change.
#[derive(Serialize, Debug, Default, Clone, PartialEq)]
pub struct FollowUp {
    pub impact: Option<ImpactSummary>,
    pub alert: Option<Alert>,
    pub notifications: DispatchReport,
    /// The first thing that went wrong while alerting, if anything did
    pub error: Option<Error>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TransitionReport {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub from: String,
    pub to: String,
    /// Aliquots whose status followed a batch verdict
    pub cascaded: usize,
    #[serde(flatten)]
    pub follow_up: FollowUp,
}

/// An alert as one experiment sees it, with that experiment's acknowledgement
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ExperimentAlert {
    pub alert: Alert,
    pub link: AlertLink,
}

/// An aliquot named either by id or by its printed code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliquotRef {
    Id(Uuid),
    Code(String),
}

impl FromStr for AliquotRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Uuid::parse_str(s).map_or_else(|_| Self::Code(s.to_string()), Self::Id))
    }
}

impl Display for AliquotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => id.fmt(f),
            Self::Code(code) => code.fmt(f),
        }
    }
}

/// Everything needed to raise one alert and tell the affected owners about it
struct Escalation {
    alert: NewAlert,
    subject: String,
    body: String,
}

pub struct ImpactEngine<S, N> {
    store: S,
    notifier: N,
}

impl<S: Store, N: Notifier> ImpactEngine<S, N> {
    pub fn new(store: S, notifier: N) -> Self {
        Self { store, notifier }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// # Errors
    pub async fn aliquot_impact(&self, aliquot_id: Uuid) -> Result<ImpactSummary> {
        Ok(impact::aliquot_impact(&self.store, aliquot_id).await?)
    }

    /// # Errors
    pub async fn batch_impact(&self, batch_id: Uuid) -> Result<ImpactSummary> {
        Ok(impact::batch_impact(&self.store, batch_id).await?)
    }

    async fn require_aliquot(&self, aliquot_id: Uuid) -> Result<Aliquot> {
        self.store
            .fetch_aliquot(aliquot_id)
            .await?
            .ok_or_else(|| Error::not_found(EntityType::Aliquot, aliquot_id))
    }

    async fn require_batch(&self, batch_id: Uuid) -> Result<Batch> {
        self.store
            .fetch_batch(batch_id)
            .await?
            .ok_or_else(|| Error::not_found(EntityType::Batch, batch_id))
    }

    /// Creates the alert, links it to every affected experiment and notifies each distinct
    /// owner once. Failures are logged and recorded, never returned.
    async fn escalate(
        &self,
        impact: db::Result<ImpactSummary>,
        escalation: impl FnOnce(&ImpactSummary) -> Escalation,
    ) -> FollowUp {
        let impact = match impact {
            Ok(impact) => impact,
            Err(err) => {
                let err = Error::from(err);
                tracing::error!(error = err.as_value(), "failed to compute impact after transition");

                return FollowUp {
                    error: Some(err),
                    ..Default::default()
                };
            }
        };

        let Escalation {
            alert,
            subject,
            body,
        } = escalation(&impact);

        let mut follow_up = FollowUp::default();

        let experiment_ids: Vec<_> = impact.experiments.iter().map(|e| e.id).collect();
        match self.store.create_alert(&alert, &experiment_ids).await {
            Ok(created) => follow_up.alert = Some(created),
            Err(err) => {
                let err = Error::from(err);
                tracing::error!(error = err.as_value(), entity_id = %alert.entity_id, "failed to create alert");
                follow_up.error = Some(err);
            }
        }

        let notifications: Vec<_> = impact
            .owners()
            .into_iter()
            .map(|(_, email)| Notification {
                to: email.to_string(),
                subject: subject.clone(),
                body: body.clone(),
            })
            .collect();
        follow_up.notifications = notify::dispatch(&self.notifier, &notifications).await;
        follow_up.impact = Some(impact);

        follow_up
    }

    async fn apply_aliquot_transition(
        &self,
        transition: &AliquotTransition,
        audit: &NewAuditEntry,
    ) -> Result<AliquotStatus> {
        let AliquotTransition { aliquot_id, to, .. } = *transition;

        match self.store.transition_aliquot(transition, audit).await? {
            Guarded::Applied { previous, .. } => Ok(previous),
            Guarded::Missing => Err(Error::not_found(EntityType::Aliquot, aliquot_id)),
            Guarded::Blocked { current } => Err(Error::invalid_transition(
                EntityType::Aliquot,
                aliquot_id,
                current,
                to,
            )),
        }
    }

    /// # Errors
    /// [`Error::NotFound`] for an unknown aliquot, [`Error::InvalidStateTransition`] if it is
    /// already contaminated
    pub async fn mark_aliquot_contaminated(
        &self,
        aliquot_id: Uuid,
        reason: Option<String>,
        actor_id: Option<Uuid>,
    ) -> Result<TransitionReport> {
        let aliquot = self.require_aliquot(aliquot_id).await?;

        let to = AliquotStatus::Contaminated;
        let transition = AliquotTransition {
            aliquot_id,
            to,
            blocked_from: &[AliquotStatus::Contaminated],
        };
        let audit = NewAuditEntry::new(
            EntityType::Aliquot,
            aliquot_id,
            AuditAction::MarkContaminated,
        )
        .actor(actor_id)
        .reason(reason.clone());

        let from = self.apply_aliquot_transition(&transition, &audit).await?;
        tracing::info!(%aliquot_id, code = %aliquot.code, %from, "aliquot marked contaminated");

        let code = aliquot.code;
        let follow_up = self
            .escalate(
                impact::aliquot_impact(&self.store, aliquot_id).await,
                |impact| Escalation {
                    alert: NewAlert {
                        id: Uuid::now_v7(),
                        kind: AlertKind::Contamination,
                        entity_type: EntityType::Aliquot,
                        entity_id: aliquot_id,
                        title: format!("Aliquot {code} marked contaminated"),
                        message: reason.unwrap_or_else(|| {
                            format!(
                                "Aliquot contaminated. {} experiment(s) affected.",
                                impact.experiment_count
                            )
                        }),
                        created_by: actor_id,
                    },
                    subject: format!("Aliquot {code} contaminated"),
                    body: format!(
                        "Aliquot {code} has been marked contaminated. Please review the experiments that used it."
                    ),
                },
            )
            .await;

        Ok(TransitionReport {
            entity_type: EntityType::Aliquot,
            entity_id: aliquot_id,
            from: from.to_string(),
            to: to.to_string(),
            cascaded: 0,
            follow_up,
        })
    }

    /// A manual status edit. Setting [`AliquotStatus::Contaminated`] goes through
    /// [`Self::mark_aliquot_contaminated`].
    ///
    /// # Errors
    pub async fn update_aliquot_status(
        &self,
        aliquot_id: Uuid,
        status: AliquotStatus,
        reason: Option<String>,
        actor_id: Option<Uuid>,
    ) -> Result<TransitionReport> {
        if status == AliquotStatus::Contaminated {
            return self
                .mark_aliquot_contaminated(aliquot_id, reason, actor_id)
                .await;
        }

        let transition = AliquotTransition {
            aliquot_id,
            to: status,
            blocked_from: &[],
        };
        let audit = NewAuditEntry::new(EntityType::Aliquot, aliquot_id, AuditAction::StatusUpdate)
            .actor(actor_id)
            .reason(reason)
            .metadata(json!({ "status": status }));

        let from = self.apply_aliquot_transition(&transition, &audit).await?;
        tracing::info!(%aliquot_id, %from, to = %status, "aliquot status updated");

        Ok(TransitionReport {
            entity_type: EntityType::Aliquot,
            entity_id: aliquot_id,
            from: from.to_string(),
            to: status.to_string(),
            cascaded: 0,
            follow_up: FollowUp::default(),
        })
    }

    async fn apply_batch_verdict(
        &self,
        batch: &Batch,
        to: QcStatus,
        cascade: AliquotStatus,
        audit: NewAuditEntry,
    ) -> Result<(QcStatus, usize)> {
        let transition = BatchTransition {
            batch_id: batch.id,
            to,
            cascade,
        };
        let audit = audit.metadata(json!({ "qc_status": to, "aliquot_status": cascade }));

        match self.store.transition_batch(&transition, &audit).await? {
            Guarded::Applied { previous, cascaded } => {
                tracing::info!(batch_id = %batch.id, lot_number = %batch.lot_number, %previous, %to, cascaded, "batch QC finalized");
                Ok((previous, cascaded))
            }
            Guarded::Missing => Err(Error::not_found(EntityType::Batch, batch.id)),
            Guarded::Blocked { current } => Err(Error::invalid_transition(
                EntityType::Batch,
                batch.id,
                current,
                to,
            )),
        }
    }

    /// Fails a pending batch, quarantines its non-terminal aliquots and alerts every affected
    /// experiment.
    ///
    /// # Errors
    /// [`Error::NotFound`] for an unknown batch, [`Error::InvalidStateTransition`] unless the
    /// batch is pending QC
    pub async fn fail_batch_qc(
        &self,
        batch_id: Uuid,
        actor_id: Option<Uuid>,
    ) -> Result<TransitionReport> {
        let batch = self.require_batch(batch_id).await?;

        let to = QcStatus::FailedQc;
        let audit = NewAuditEntry::new(EntityType::Batch, batch_id, AuditAction::QcFail)
            .actor(actor_id)
            .reason(Some(QC_FAIL_REASON.to_string()));

        let (from, cascaded) = self
            .apply_batch_verdict(&batch, to, AliquotStatus::Quarantined, audit)
            .await?;

        let lot = &batch.lot_number;
        let follow_up = self
            .escalate(
                impact::batch_impact(&self.store, batch_id).await,
                |impact| Escalation {
                    alert: NewAlert {
                        id: Uuid::now_v7(),
                        kind: AlertKind::QcFailure,
                        entity_type: EntityType::Batch,
                        entity_id: batch_id,
                        title: format!("Batch {lot} failed QC"),
                        message: format!(
                            "Aliquots quarantined. {} experiment(s) affected.",
                            impact.experiment_count
                        ),
                        created_by: actor_id,
                    },
                    subject: format!("Batch {lot} failed QC"),
                    body: format!(
                        "Batch {lot} has been marked as failed QC and its aliquots are quarantined. Please review the experiments that used it."
                    ),
                },
            )
            .await;

        Ok(TransitionReport {
            entity_type: EntityType::Batch,
            entity_id: batch_id,
            from: from.to_string(),
            to: to.to_string(),
            cascaded,
            follow_up,
        })
    }

    /// # Errors
    /// Same preconditions as [`Self::fail_batch_qc`]
    pub async fn release_batch(
        &self,
        batch_id: Uuid,
        actor_id: Option<Uuid>,
    ) -> Result<TransitionReport> {
        let batch = self.require_batch(batch_id).await?;

        let to = QcStatus::ReleasedPassed;
        let audit = NewAuditEntry::new(EntityType::Batch, batch_id, AuditAction::QcRelease)
            .actor(actor_id)
            .reason(Some(QC_RELEASE_REASON.to_string()));

        let (from, cascaded) = self
            .apply_batch_verdict(&batch, to, AliquotStatus::ReleasedPassed, audit)
            .await?;

        Ok(TransitionReport {
            entity_type: EntityType::Batch,
            entity_id: batch_id,
            from: from.to_string(),
            to: to.to_string(),
            cascaded,
            follow_up: FollowUp::default(),
        })
    }

    /// Records that `actor_id` has seen an alert on behalf of one experiment. The first
    /// acknowledgement sticks; repeating it returns the row unchanged.
    ///
    /// # Errors
    /// [`Error::Unauthenticated`] without a known actor, [`Error::NotFound`] if the alert does
    /// not concern the experiment
    pub async fn acknowledge_alert(
        &self,
        alert_id: Uuid,
        experiment_id: Uuid,
        actor_id: Option<Uuid>,
    ) -> Result<AlertLink> {
        let Some(actor_id) = actor_id else {
            return Err(Error::Unauthenticated);
        };
        if self.store.fetch_person(actor_id).await?.is_none() {
            return Err(Error::Unauthenticated);
        }

        let link = self
            .store
            .acknowledge_alert_link(alert_id, experiment_id, actor_id, Utc::now())
            .await?
            .ok_or_else(|| {
                Error::not_found("alert_experiment", format!("{alert_id}/{experiment_id}"))
            })?;

        tracing::info!(%alert_id, %experiment_id, %actor_id, "alert acknowledged");

        Ok(link)
    }

    /// # Errors
    /// [`Error::NotFound`] for an unknown experiment or aliquot, [`Error::DuplicateUsage`] if
    /// the aliquot is already attached
    pub async fn attach_aliquot(
        &self,
        experiment_id: Uuid,
        aliquot: &AliquotRef,
        usage_notes: Option<String>,
    ) -> Result<Usage> {
        if self.store.fetch_experiment(experiment_id).await?.is_none() {
            return Err(Error::not_found(EntityType::Experiment, experiment_id));
        }

        let found = match aliquot {
            AliquotRef::Id(id) => self.store.fetch_aliquot(*id).await?,
            AliquotRef::Code(code) => self.store.fetch_aliquot_by_code(code).await?,
        };
        let aliquot = found.ok_or_else(|| Error::not_found(EntityType::Aliquot, aliquot))?;

        let usage = NewUsage {
            experiment_id,
            aliquot_id: aliquot.id,
            usage_notes,
        };

        match self.store.insert_usage(usage).await {
            Ok(usage) => Ok(usage),
            Err(db::Error::DuplicateRecord { entity, .. }) if entity == "experiment_aliquot" => {
                Err(Error::duplicate_usage(experiment_id, aliquot.id))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// # Errors
    /// [`Error::NotFound`] if the aliquot is not attached to the experiment
    pub async fn detach_aliquot(&self, experiment_id: Uuid, aliquot_id: Uuid) -> Result<()> {
        if self.store.delete_usage(experiment_id, aliquot_id).await? {
            Ok(())
        } else {
            Err(Error::not_found(
                "experiment_aliquot",
                format!("{experiment_id}/{aliquot_id}"),
            ))
        }
    }

    /// Newest first, at most `limit` (default 50) entries
    ///
    /// # Errors
    pub async fn audit_trail(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
        limit: Option<i64>,
    ) -> Result<Vec<AuditLogEntry>> {
        let limit = limit.unwrap_or(DEFAULT_AUDIT_LIMIT);
        if limit <= 0 {
            return Err(Error::validation("audit limit must be positive"));
        }

        Ok(self
            .store
            .audit_entries(entity_type, entity_id, limit)
            .await?)
    }

    /// # Errors
    pub async fn alerts_for(&self, entity_type: EntityType, entity_id: Uuid) -> Result<Vec<Alert>> {
        Ok(self.store.alerts_for(entity_type, entity_id).await?)
    }

    /// # Errors
    pub async fn alert_links(&self, alert_id: Uuid) -> Result<Vec<AlertLink>> {
        Ok(self.store.alert_links(alert_id).await?)
    }

    /// Every alert an experiment was linked to, newest first, so its owner can see what is
    /// still waiting for acknowledgement.
    ///
    /// # Errors
    /// [`Error::NotFound`] for an unknown experiment
    pub async fn experiment_alerts(&self, experiment_id: Uuid) -> Result<Vec<ExperimentAlert>> {
        if self.store.fetch_experiment(experiment_id).await?.is_none() {
            return Err(Error::not_found(EntityType::Experiment, experiment_id));
        }

        Ok(self
            .store
            .experiment_alerts(experiment_id)
            .await?
            .into_iter()
            .map(|(alert, link)| ExperimentAlert { alert, link })
            .collect())
    }

    /// Moves an aliquot to new storage coordinates, replacing all three.
    ///
    /// # Errors
    /// [`Error::NotFound`] for an unknown aliquot
    pub async fn assign_location(
        &self,
        aliquot_id: Uuid,
        location: StorageLocation,
        actor_id: Option<Uuid>,
    ) -> Result<Aliquot> {
        let audit = NewAuditEntry::new(
            EntityType::Aliquot,
            aliquot_id,
            AuditAction::AssignLocation,
        )
        .actor(actor_id)
        .metadata(json!(location));

        let aliquot = self
            .store
            .relocate_aliquot(aliquot_id, &location, &audit)
            .await?
            .ok_or_else(|| Error::not_found(EntityType::Aliquot, aliquot_id))?;

        tracing::info!(
            %aliquot_id,
            freezer = ?location.freezer,
            box_label = ?location.box_label,
            position = ?location.position,
            "aliquot location assigned"
        );

        Ok(aliquot)
    }
}
