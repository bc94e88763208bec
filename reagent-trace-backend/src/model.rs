use std::str::FromStr;

use diesel::{
    backend::Backend,
    deserialize::{FromSql, FromSqlRow},
    expression::AsExpression,
    pg::Pg,
    serialize::{Output, ToSql},
    sql_types,
};
use serde::{Deserialize, Serialize};

pub mod alert;
pub mod aliquot;
pub mod audit;
pub mod batch;
pub mod experiment;
pub mod person;
pub mod sample;

pub use alert::{Alert, AlertKind, AlertLink, NewAlert};
pub use aliquot::{Aliquot, AliquotStatus, GenerateAliquots, NewAliquot, StorageLocation};
pub use audit::{AuditAction, AuditLogEntry, NewAuditEntry};
pub use batch::{Batch, NewBatch, QcStatus};
pub use experiment::{
    Experiment, ExperimentOutput, NewExperiment, NewUsage, Usage, UsageRecord, parse_outputs,
};
pub use person::{NewPerson, Person};
pub use sample::{NewSample, Sample};

/// Enums stored as snake_case text columns
trait DbEnum: FromStr<Err = strum::ParseError> + Into<&'static str> + Copy {
    fn from_sql_inner(bytes: <Pg as Backend>::RawValue<'_>) -> diesel::deserialize::Result<Self> {
        let raw: String = FromSql::<sql_types::Text, Pg>::from_sql(bytes)?;

        Ok(Self::from_str(&raw)?)
    }

    fn to_sql_inner<'b>(self, out: &mut Output<'b, '_, Pg>) -> diesel::serialize::Result {
        let as_str: &'static str = self.into();

        <str as ToSql<sql_types::Text, Pg>>::to_sql(as_str, out)
    }
}

macro_rules! db_enum {
    ($($enum_type:ty),+ $(,)?) => {
        $(
            impl $crate::model::DbEnum for $enum_type {}

            impl ::diesel::deserialize::FromSql<::diesel::sql_types::Text, ::diesel::pg::Pg>
                for $enum_type
            {
                fn from_sql(
                    bytes: <::diesel::pg::Pg as ::diesel::backend::Backend>::RawValue<'_>,
                ) -> ::diesel::deserialize::Result<Self> {
                    <Self as $crate::model::DbEnum>::from_sql_inner(bytes)
                }
            }

            impl ::diesel::serialize::ToSql<::diesel::sql_types::Text, ::diesel::pg::Pg>
                for $enum_type
            {
                fn to_sql<'b>(
                    &'b self,
                    out: &mut ::diesel::serialize::Output<'b, '_, ::diesel::pg::Pg>,
                ) -> ::diesel::serialize::Result {
                    <Self as $crate::model::DbEnum>::to_sql_inner(*self, out)
                }
            }
        )+
    };
}
pub(crate) use db_enum;

/// The kinds of record an audit entry or an alert can point at
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
    Hash,
    strum::IntoStaticStr,
    strum::EnumString,
    strum::Display,
    clap::ValueEnum,
)]
#[diesel(sql_type = sql_types::Text)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum EntityType {
    Aliquot,
    Batch,
    Sample,
    Experiment,
}
db_enum!(EntityType);
