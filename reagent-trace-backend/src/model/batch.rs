use chrono::{DateTime, NaiveDate, Utc};
use diesel::{deserialize::FromSqlRow, expression::AsExpression, pg::Pg, prelude::*, sql_types};
use garde::Validate;
use reagent_trace_schema::batch;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Batch-level QC verdict. Only `PendingQc` may move, and only once.
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
    strum::IntoStaticStr,
    strum::EnumString,
    strum::Display,
)]
#[diesel(sql_type = sql_types::Text)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QcStatus {
    #[default]
    PendingQc,
    ReleasedPassed,
    FailedQc,
}
super::db_enum!(QcStatus);

impl QcStatus {
    #[must_use]
    pub fn is_final(self) -> bool {
        !matches!(self, Self::PendingQc)
    }

    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        !self.is_final() && to.is_final()
    }
}

#[derive(Queryable, Selectable, Serialize, Debug, Clone, PartialEq)]
#[diesel(table_name = batch, check_for_backend(Pg))]
pub struct Batch {
    pub id: Uuid,
    pub lot_number: String,
    pub vendor: Option<String>,
    pub qc_status: QcStatus,
    pub received_on: Option<NaiveDate>,
    pub expires_on: Option<NaiveDate>,
    pub inserted_at: DateTime<Utc>,
}

#[derive(Insertable, Deserialize, Validate, Debug, Clone)]
#[diesel(table_name = batch, check_for_backend(Pg))]
#[garde(allow_unvalidated)]
pub struct NewBatch {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    #[garde(length(min = 1))]
    pub lot_number: String,
    pub vendor: Option<String>,
    pub received_on: Option<NaiveDate>,
    pub expires_on: Option<NaiveDate>,
}

impl NewBatch {
    #[must_use]
    pub fn new(lot_number: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            lot_number: lot_number.to_string(),
            vendor: None,
            received_on: None,
            expires_on: None,
        }
    }
}
