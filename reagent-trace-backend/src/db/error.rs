use std::sync::LazyLock;

use diesel::result::{DatabaseErrorInformation, DatabaseErrorKind};
use diesel_async::pooled_connection::deadpool;
use regex::Regex;
use serde::Serialize;
use valuable::Valuable;

// Postgres reports both unique and foreign key violations as
// `Key (column)=(value) already exists.` / `... is not present in table "other".`
static KEY_DETAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^Key \((?<field>[^)]+)\)=\((?<value>.*)\) ",
        r#"(?:already exists|is not present in table "(?<table>[^"]+)")"#
    ))
    .unwrap()
});

/// A persistence failure, with unique and foreign key violations decoded
#[derive(thiserror::Error, Debug, Serialize, Valuable, Clone, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Error {
    #[error("duplicate {entity}: {} = {}", field.as_deref().unwrap_or("?"), value.as_deref().unwrap_or("?"))]
    DuplicateRecord {
        entity: String,
        field: Option<String>,
        value: Option<String>,
    },
    #[error("{entity} refers to a missing {referenced_entity} ({})", value.as_deref().unwrap_or("?"))]
    ReferenceNotFound {
        entity: String,
        referenced_entity: String,
        value: Option<String>,
    },
    #[error("record not found")]
    RecordNotFound,
    #[error("{message}")]
    Other { message: String },
}

impl Error {
    fn other(err: impl std::fmt::Display) -> Self {
        Self::Other {
            message: err.to_string(),
        }
    }

    /// Whether this is a unique violation on `field` of `entity`
    #[must_use]
    pub fn is_duplicate(&self, entity: &str, field: &str) -> bool {
        matches!(
            self,
            Self::DuplicateRecord { entity: e, field: Some(f), .. } if e == entity && f == field
        )
    }

    fn from_violation(
        kind: DatabaseErrorKind,
        info: &(dyn DatabaseErrorInformation + Send + Sync),
    ) -> Self {
        let entity = info.table_name().unwrap_or_default().to_string();
        let captures = info.details().and_then(|d| KEY_DETAIL.captures(d));
        let group = |name: &str| {
            captures
                .as_ref()
                .and_then(|c| c.name(name))
                .map(|m| m.as_str().to_string())
        };

        match kind {
            DatabaseErrorKind::UniqueViolation => Self::DuplicateRecord {
                entity,
                field: group("field"),
                value: group("value"),
            },
            DatabaseErrorKind::ForeignKeyViolation => Self::ReferenceNotFound {
                entity,
                referenced_entity: group("table").unwrap_or_default(),
                value: group("value"),
            },
            _ => Self::other(info.message()),
        }
    }
}

impl From<diesel::result::Error> for Error {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::DatabaseError(kind, info) => {
                Self::from_violation(kind, info.as_ref())
            }
            diesel::result::Error::NotFound => Self::RecordNotFound,
            err => Self::other(err),
        }
    }
}

impl From<deadpool::PoolError> for Error {
    fn from(err: deadpool::PoolError) -> Self {
        Self::other(err)
    }
}

impl From<diesel::ConnectionError> for Error {
    fn from(err: diesel::ConnectionError) -> Self {
        Self::other(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use diesel::result::{DatabaseErrorInformation, DatabaseErrorKind};
    use pretty_assertions::assert_eq;

    use super::Error;

    struct Violation {
        table: &'static str,
        details: &'static str,
    }

    impl DatabaseErrorInformation for Violation {
        fn message(&self) -> &str {
            "violation"
        }

        fn details(&self) -> Option<&str> {
            Some(self.details)
        }

        fn hint(&self) -> Option<&str> {
            None
        }

        fn table_name(&self) -> Option<&str> {
            Some(self.table)
        }

        fn column_name(&self) -> Option<&str> {
            None
        }

        fn constraint_name(&self) -> Option<&str> {
            None
        }

        fn statement_position(&self) -> Option<i32> {
            None
        }
    }

    fn violation(kind: DatabaseErrorKind, table: &'static str, details: &'static str) -> Error {
        Error::from(diesel::result::Error::DatabaseError(
            kind,
            Box::new(Violation { table, details }),
        ))
    }

    #[test]
    fn unique_violation_names_the_column() {
        let err = violation(
            DatabaseErrorKind::UniqueViolation,
            "aliquot",
            "Key (code)=(FBS-LOT-20240118-A01-AAAA) already exists.",
        );

        assert!(err.is_duplicate("aliquot", "code"));
        assert!(!err.is_duplicate("experiment_aliquot", "code"));
        assert_eq!(
            err,
            Error::DuplicateRecord {
                entity: "aliquot".to_string(),
                field: Some("code".to_string()),
                value: Some("FBS-LOT-20240118-A01-AAAA".to_string()),
            }
        );
    }

    #[test]
    fn foreign_key_violation_names_the_referenced_table() {
        let err = violation(
            DatabaseErrorKind::ForeignKeyViolation,
            "experiment_aliquot",
            r#"Key (experiment_id)=(0190b5a4-0000-7000-8000-000000000000) is not present in table "experiment"."#,
        );

        assert_eq!(
            err,
            Error::ReferenceNotFound {
                entity: "experiment_aliquot".to_string(),
                referenced_entity: "experiment".to_string(),
                value: Some("0190b5a4-0000-7000-8000-000000000000".to_string()),
            }
        );
    }

    #[test]
    fn other_failures_keep_their_message() {
        let err = violation(DatabaseErrorKind::CheckViolation, "aliquot", "");

        assert_eq!(
            err,
            Error::Other {
                message: "violation".to_string()
            }
        );
        assert!(!Error::RecordNotFound.is_duplicate("aliquot", "code"));
    }
}
