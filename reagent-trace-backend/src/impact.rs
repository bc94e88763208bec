//! Blast radius of a bad aliquot or batch: who used it, in what, and which results need
//! another look.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use itertools::Itertools;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    db::{self, Store},
    model::UsageRecord,
};

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AffectedExperiment {
    pub id: Uuid,
    pub title: String,
    pub performed_on: NaiveDate,
    pub owner_id: Uuid,
    pub owner_name: String,
    pub owner_email: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct OutputToReview {
    pub url: String,
    pub label: String,
    pub experiment_id: Uuid,
}

#[derive(Serialize, Debug, Default, Clone, PartialEq)]
pub struct ImpactSummary {
    /// Every aliquot of the batch involved, the flagged one included
    pub aliquot_count: i64,
    pub experiment_count: usize,
    pub experiments: Vec<AffectedExperiment>,
    pub affected_user_ids: BTreeSet<Uuid>,
    pub outputs_to_review: Vec<OutputToReview>,
}

impl ImpactSummary {
    fn from_usages(aliquot_count: i64, usages: Vec<UsageRecord>) -> Self {
        let mut summary = Self {
            aliquot_count,
            ..Default::default()
        };

        for UsageRecord {
            experiment, owner, ..
        } in usages.into_iter().unique_by(|u| u.experiment.id)
        {
            summary.affected_user_ids.insert(owner.id);
            summary
                .outputs_to_review
                .extend(
                    experiment
                        .review_outputs()
                        .into_iter()
                        .map(|output| OutputToReview {
                            url: output.url,
                            label: output.label,
                            experiment_id: experiment.id,
                        }),
                );
            summary.experiments.push(AffectedExperiment {
                id: experiment.id,
                title: experiment.title,
                performed_on: experiment.performed_on,
                owner_id: owner.id,
                owner_name: owner.name,
                owner_email: owner.email,
            });
        }

        summary.experiment_count = summary.experiments.len();

        summary
    }

    /// One `(id, email)` pair per distinct owner, in the order their experiments appear
    #[must_use]
    pub fn owners(&self) -> Vec<(Uuid, &str)> {
        self.experiments
            .iter()
            .unique_by(|e| e.owner_id)
            .map(|e| (e.owner_id, e.owner_email.as_str()))
            .collect()
    }
}

/// # Errors
/// Only if the store fails. An unknown aliquot has no impact.
pub async fn aliquot_impact(store: &impl Store, aliquot_id: Uuid) -> db::Result<ImpactSummary> {
    let Some(aliquot) = store.fetch_aliquot(aliquot_id).await? else {
        return Ok(ImpactSummary::default());
    };

    let aliquot_count = store.count_batch_aliquots(aliquot.batch_id).await?;
    let usages = store.usages_of(&[aliquot.id]).await?;

    Ok(ImpactSummary::from_usages(aliquot_count, usages))
}

/// # Errors
/// Only if the store fails. An unknown batch has no impact.
pub async fn batch_impact(store: &impl Store, batch_id: Uuid) -> db::Result<ImpactSummary> {
    let aliquot_ids: Vec<_> = store
        .batch_aliquots(batch_id)
        .await?
        .into_iter()
        .map(|a| a.id)
        .collect();

    let aliquot_count = i64::try_from(aliquot_ids.len()).unwrap_or(i64::MAX);
    let usages = store.usages_of(&aliquot_ids).await?;

    Ok(ImpactSummary::from_usages(aliquot_count, usages))
}
