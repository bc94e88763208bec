use diesel::{pg::Pg, prelude::*};
use garde::Validate;
use reagent_trace_schema::person;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Queryable, Selectable, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[diesel(table_name = person, check_for_backend(Pg))]
pub struct Person {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

#[derive(Insertable, Deserialize, Validate, Debug, Clone)]
#[diesel(table_name = person, check_for_backend(Pg))]
#[garde(allow_unvalidated)]
pub struct NewPerson {
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    #[garde(length(min = 1))]
    pub name: String,
    #[garde(email)]
    pub email: String,
}

impl NewPerson {
    #[must_use]
    pub fn new(name: &str, email: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.to_string(),
            email: email.to_string(),
        }
    }
}

impl From<NewPerson> for Person {
    fn from(NewPerson { id, name, email }: NewPerson) -> Self {
        Self { id, name, email }
    }
}
