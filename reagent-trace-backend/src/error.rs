use std::fmt::Display;

use serde::Serialize;
use uuid::Uuid;
use valuable::Valuable;

use crate::{db, model::EntityType};

#[derive(thiserror::Error, Serialize, Debug, Clone, PartialEq, Valuable)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Error {
    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },
    #[error("{entity} {id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        entity: String,
        id: String,
        from: String,
        to: String,
    },
    #[error("aliquot {aliquot_id} is already attached to experiment {experiment_id}")]
    DuplicateUsage {
        experiment_id: String,
        aliquot_id: String,
    },
    #[error("invalid data: {reason}")]
    Validation { reason: String },
    #[error("an acting user is required")]
    Unauthenticated,
    #[error("storage failure: {source}")]
    Infrastructure { source: db::Error },
}

impl Error {
    #[must_use]
    pub fn not_found(entity: impl Display, id: impl Display) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn invalid_transition(
        entity: EntityType,
        id: Uuid,
        from: impl Display,
        to: impl Display,
    ) -> Self {
        Self::InvalidStateTransition {
            entity: entity.to_string(),
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    #[must_use]
    pub fn duplicate_usage(experiment_id: Uuid, aliquot_id: Uuid) -> Self {
        Self::DuplicateUsage {
            experiment_id: experiment_id.to_string(),
            aliquot_id: aliquot_id.to_string(),
        }
    }

    pub fn validation(reason: impl Display) -> Self {
        Self::Validation {
            reason: reason.to_string(),
        }
    }
}

impl From<db::Error> for Error {
    fn from(source: db::Error) -> Self {
        Self::Infrastructure { source }
    }
}

impl From<garde::Report> for Error {
    fn from(err: garde::Report) -> Self {
        Self::Validation {
            reason: format!("{err:#}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use uuid::Uuid;

    use super::Error;
    use crate::{
        db,
        model::{EntityType, QcStatus},
    };

    #[test]
    fn transition_error_serializes_with_tag() {
        let id = Uuid::nil();
        let err = Error::invalid_transition(
            EntityType::Batch,
            id,
            QcStatus::ReleasedPassed,
            QcStatus::FailedQc,
        );

        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({
                "type": "invalid_state_transition",
                "entity": "batch",
                "id": id.to_string(),
                "from": "released_passed",
                "to": "failed_qc"
            })
        );
    }

    #[test]
    fn store_errors_are_infrastructure() {
        let err = Error::from(db::Error::Other {
            message: "connection refused".to_string(),
        });

        assert!(matches!(err, Error::Infrastructure { .. }));
        assert_eq!(err.to_string(), "storage failure: connection refused");
    }
}
