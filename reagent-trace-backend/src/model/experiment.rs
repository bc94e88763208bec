use chrono::{DateTime, NaiveDate, Utc};
use diesel::{pg::Pg, prelude::*};
use garde::Validate;
use reagent_trace_schema::{experiment, experiment_aliquot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::Person;

#[derive(Queryable, Selectable, Serialize, Debug, Clone, PartialEq)]
#[diesel(table_name = experiment, check_for_backend(Pg))]
pub struct Experiment {
    pub id: Uuid,
    pub title: String,
    pub performed_on: NaiveDate,
    pub owner_id: Uuid,
    pub notes: Option<String>,
    /// Free-form JSON as typed by the owner. Read it through [`Experiment::review_outputs`].
    pub outputs: Option<String>,
    pub inserted_at: DateTime<Utc>,
}

impl Experiment {
    #[must_use]
    pub fn review_outputs(&self) -> Vec<ExperimentOutput> {
        self.outputs.as_deref().map(parse_outputs).unwrap_or_default()
    }
}

#[derive(Insertable, Deserialize, Validate, Debug, Clone)]
#[diesel(table_name = experiment, check_for_backend(Pg))]
#[garde(allow_unvalidated)]
pub struct NewExperiment {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    #[garde(length(min = 1))]
    pub title: String,
    pub performed_on: NaiveDate,
    pub owner_id: Uuid,
    pub notes: Option<String>,
    pub outputs: Option<String>,
}

impl NewExperiment {
    #[must_use]
    pub fn new(title: &str, performed_on: NaiveDate, owner_id: Uuid) -> Self {
        Self {
            id: Uuid::now_v7(),
            title: title.to_string(),
            performed_on,
            owner_id,
            notes: None,
            outputs: None,
        }
    }

    #[must_use]
    pub fn with_outputs(mut self, outputs: &[ExperimentOutput]) -> Self {
        self.outputs = serde_json::to_string(outputs).ok();
        self
    }
}

/// A result artifact somebody has to look at again if the experiment's inputs go bad
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExperimentOutput {
    pub url: String,
    #[serde(default)]
    pub label: String,
}

impl ExperimentOutput {
    #[must_use]
    pub fn new(url: &str, label: &str) -> Self {
        Self {
            url: url.to_string(),
            label: label.to_string(),
        }
    }
}

/// Parses the stored outputs text. Anything that is not a JSON array yields nothing, and
/// array entries without a usable `url` are skipped.
#[must_use]
pub fn parse_outputs(raw: &str) -> Vec<ExperimentOutput> {
    let entries: Vec<Value> = match serde_json::from_str(raw) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::debug!(error = %err, "skipping unparseable experiment outputs");
            return Vec::new();
        }
    };

    entries
        .iter()
        .filter_map(|entry| {
            let url = match entry.get("url")? {
                Value::String(s) if !s.is_empty() => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            let label = entry
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            Some(ExperimentOutput { url, label })
        })
        .collect()
}

#[derive(Queryable, Selectable, Serialize, Debug, Clone, PartialEq)]
#[diesel(table_name = experiment_aliquot, check_for_backend(Pg))]
pub struct Usage {
    pub experiment_id: Uuid,
    pub aliquot_id: Uuid,
    pub usage_notes: Option<String>,
    pub attached_at: DateTime<Utc>,
}

#[derive(Insertable, Deserialize, Debug, Clone)]
#[diesel(table_name = experiment_aliquot, check_for_backend(Pg))]
pub struct NewUsage {
    pub experiment_id: Uuid,
    pub aliquot_id: Uuid,
    pub usage_notes: Option<String>,
}

/// A usage joined to the experiment it belongs to and that experiment's owner
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub aliquot_id: Uuid,
    pub experiment: Experiment,
    pub owner: Person,
}
