use chrono::{DateTime, Utc};
use diesel::{pg::Pg, prelude::*};
use garde::Validate;
use reagent_trace_schema::sample;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Queryable, Selectable, Serialize, Debug, Clone, PartialEq)]
#[diesel(table_name = sample, check_for_backend(Pg))]
pub struct Sample {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub name: String,
    pub category: Option<String>,
    /// The next aliquot index not yet handed out for this sample
    pub next_aliquot_index: i32,
    pub inserted_at: DateTime<Utc>,
}

#[derive(Insertable, Deserialize, Validate, Debug, Clone)]
#[diesel(table_name = sample, check_for_backend(Pg))]
#[garde(allow_unvalidated)]
pub struct NewSample {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    pub batch_id: Uuid,
    #[garde(length(min = 1))]
    pub name: String,
    pub category: Option<String>,
}

impl NewSample {
    #[must_use]
    pub fn new(batch_id: Uuid, name: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            batch_id,
            name: name.to_string(),
            category: None,
        }
    }
}
