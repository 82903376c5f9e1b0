//! Repository utilities.

use diesel::result::{DatabaseErrorInformation, DatabaseErrorKind};

use super::pool::DbError;

/// Simple error info wrapper for database errors.
#[derive(Debug)]
pub struct DbErrorInfo(pub String);

impl DatabaseErrorInformation for DbErrorInfo {
    fn message(&self) -> &str {
        &self.0
    }
    fn details(&self) -> Option<&str> {
        None
    }
    fn hint(&self) -> Option<&str> {
        None
    }
    fn table_name(&self) -> Option<&str> {
        None
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

/// Convert any displayable error to a diesel error with proper message.
pub fn to_diesel_error(e: impl std::fmt::Display) -> DbError {
    DbError::DatabaseError(DatabaseErrorKind::Unknown, Box::new(DbErrorInfo(e.to_string())))
}

/// Whether the error is a constraint violation caused by the row being
/// written, as opposed to a problem with the connection or database.
pub fn is_constraint_violation(err: &DbError) -> bool {
    matches!(
        err,
        DbError::DatabaseError(
            DatabaseErrorKind::UniqueViolation
                | DatabaseErrorKind::ForeignKeyViolation
                | DatabaseErrorKind::NotNullViolation
                | DatabaseErrorKind::CheckViolation,
            _
        )
    )
}

/// Whether the error is a uniqueness violation.
pub fn is_unique_violation(err: &DbError) -> bool {
    matches!(
        err,
        DbError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_error(kind: DatabaseErrorKind) -> DbError {
        DbError::DatabaseError(kind, Box::new(DbErrorInfo("boom".to_string())))
    }

    #[test]
    fn test_to_diesel_error_keeps_message() {
        let err = to_diesel_error("unable to open database file");
        assert!(err.to_string().contains("unable to open database file"));
        assert!(!is_constraint_violation(&err));
    }

    #[test]
    fn test_constraint_classification() {
        assert!(is_constraint_violation(&db_error(
            DatabaseErrorKind::UniqueViolation
        )));
        assert!(is_constraint_violation(&db_error(
            DatabaseErrorKind::ForeignKeyViolation
        )));
        assert!(is_constraint_violation(&db_error(
            DatabaseErrorKind::CheckViolation
        )));
        assert!(!is_constraint_violation(&db_error(
            DatabaseErrorKind::SerializationFailure
        )));
        assert!(!is_constraint_violation(&DbError::NotFound));

        assert!(is_unique_violation(&db_error(
            DatabaseErrorKind::UniqueViolation
        )));
        assert!(!is_unique_violation(&db_error(
            DatabaseErrorKind::NotNullViolation
        )));
    }
}
