pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid schedule key: {reason}")]
    InvalidScheduleKey { reason: String },
    #[error("invalid teaching-state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("delivery failed: {reason}")]
    TransientDeliveryFailure { reason: String },
    #[error("duplicate {0} key, concurrent writer won")]
    StoreContention(&'static str),
    #[error("failed to decode stored {what}: {reason}")]
    Decode { what: &'static str, reason: String },
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_schedule_key(reason: impl Into<String>) -> Self {
        Error::InvalidScheduleKey {
            reason: reason.into(),
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn delivery_failure(reason: impl Into<String>) -> Self {
        Error::TransientDeliveryFailure {
            reason: reason.into(),
        }
    }

    pub fn decode(what: &'static str, reason: impl ToString) -> Self {
        Error::Decode {
            what,
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::decode("json column", err)
    }
}

/// SQLite reports both UNIQUE and PRIMARY KEY conflicts as unique violations.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation)
        }
        _ => false,
    }
}
