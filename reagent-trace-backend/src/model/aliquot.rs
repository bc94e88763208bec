use chrono::{DateTime, NaiveDate, Utc};
use diesel::{deserialize::FromSqlRow, expression::AsExpression, pg::Pg, prelude::*, sql_types};
use garde::Validate;
use reagent_trace_schema::aliquot;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
    Deserialize,
    Serialize,
    Default,
    FromSqlRow,
    AsExpression,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::IntoStaticStr,
    strum::EnumString,
    strum::Display,
    strum::VariantArray,
    clap::ValueEnum,
)]
#[diesel(sql_type = sql_types::Text)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum AliquotStatus {
    #[default]
    PendingQc,
    ReleasedPassed,
    Quarantined,
    Contaminated,
    Consumed,
}
super::db_enum!(AliquotStatus);

impl AliquotStatus {
    /// Statuses a batch-level QC cascade leaves untouched
    pub const TERMINAL: [Self; 2] = [Self::Contaminated, Self::Consumed];

    #[must_use]
    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

#[derive(Queryable, Selectable, Serialize, Debug, Clone, PartialEq)]
#[diesel(table_name = aliquot, check_for_backend(Pg))]
pub struct Aliquot {
    pub id: Uuid,
    pub code: String,
    pub sample_id: Uuid,
    pub batch_id: Uuid,
    pub status: AliquotStatus,
    pub volume: Option<f64>,
    pub concentration: Option<f64>,
    pub unit: Option<String>,
    pub freezer: Option<String>,
    pub box_label: Option<String>,
    pub position: Option<String>,
    pub made_on: NaiveDate,
    pub created_by: Option<Uuid>,
    pub inserted_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = aliquot, check_for_backend(Pg))]
pub struct NewAliquot {
    pub id: Uuid,
    pub code: String,
    pub sample_id: Uuid,
    pub batch_id: Uuid,
    pub status: AliquotStatus,
    pub volume: Option<f64>,
    pub concentration: Option<f64>,
    pub unit: Option<String>,
    pub made_on: NaiveDate,
    pub created_by: Option<Uuid>,
}

/// A request to subdivide a sample into `count` freshly coded aliquots
#[derive(Deserialize, Validate, Debug, Clone)]
#[garde(allow_unvalidated)]
pub struct GenerateAliquots {
    pub sample_id: Uuid,
    #[garde(range(min = 1, max = 100))]
    pub count: i32,
    pub made_on: NaiveDate,
    pub volume: Option<f64>,
    pub concentration: Option<f64>,
    pub unit: Option<String>,
    pub created_by: Option<Uuid>,
}

impl GenerateAliquots {
    #[must_use]
    pub fn new(sample_id: Uuid, count: i32, made_on: NaiveDate) -> Self {
        Self {
            sample_id,
            count,
            made_on,
            volume: None,
            concentration: None,
            unit: None,
            created_by: None,
        }
    }
}

/// Where an aliquot sits. Blank coordinates are stored as unset.
#[derive(AsChangeset, Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[diesel(table_name = aliquot, check_for_backend(Pg), treat_none_as_null = true)]
pub struct StorageLocation {
    pub freezer: Option<String>,
    pub box_label: Option<String>,
    pub position: Option<String>,
}

impl StorageLocation {
    #[must_use]
    pub fn new(freezer: Option<&str>, box_label: Option<&str>, position: Option<&str>) -> Self {
        let coordinate = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(ToString::to_string)
        };

        Self {
            freezer: coordinate(freezer),
            box_label: coordinate(box_label),
            position: coordinate(position),
        }
    }
}
