use chrono::{DateTime, Utc};
use diesel::{deserialize::FromSqlRow, expression::AsExpression, pg::Pg, prelude::*, sql_types};
use reagent_trace_schema::audit_log;
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
pub enum AuditAction {
    MarkContaminated,
    StatusUpdate,
    QcFail,
    QcRelease,
    AssignLocation,
}
super::db_enum!(AuditAction);

#[derive(Queryable, Selectable, Serialize, Debug, Clone, PartialEq)]
#[diesel(table_name = audit_log, check_for_backend(Pg))]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub action: AuditAction,
    pub actor_id: Option<Uuid>,
    pub reason: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = audit_log, check_for_backend(Pg))]
pub struct NewAuditEntry {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub action: AuditAction,
    pub actor_id: Option<Uuid>,
    pub reason: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl NewAuditEntry {
    #[must_use]
    pub fn new(entity_type: EntityType, entity_id: Uuid, action: AuditAction) -> Self {
        Self {
            id: Uuid::now_v7(),
            entity_type,
            entity_id,
            action,
            actor_id: None,
            reason: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn actor(mut self, actor_id: Option<Uuid>) -> Self {
        self.actor_id = actor_id;
        self
    }

    #[must_use]
    pub fn reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
