use chrono::{DateTime, Utc};
use diesel::{deserialize::FromSqlRow, expression::AsExpression, pg::Pg, prelude::*, sql_types};
use reagent_trace_schema::{alert, alert_experiment};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::EntityType;

#[derive(
    Deserialize,
    Serialize,
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
pub enum AlertKind {
    Contamination,
    QcFailure,
}
super::db_enum!(AlertKind);

#[derive(Queryable, Selectable, Serialize, Debug, Clone, PartialEq)]
#[diesel(table_name = alert, check_for_backend(Pg))]
pub struct Alert {
    pub id: Uuid,
    pub kind: AlertKind,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub title: String,
    pub message: String,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = alert, check_for_backend(Pg))]
pub struct NewAlert {
    pub id: Uuid,
    pub kind: AlertKind,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub title: String,
    pub message: String,
    pub created_by: Option<Uuid>,
}

/// The per-experiment acknowledgement row of an alert
#[derive(Queryable, Selectable, Serialize, Debug, Clone, PartialEq)]
#[diesel(table_name = alert_experiment, check_for_backend(Pg))]
pub struct AlertLink {
    pub alert_id: Uuid,
    pub experiment_id: Uuid,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<Uuid>,
}

impl AlertLink {
    #[must_use]
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }
}
