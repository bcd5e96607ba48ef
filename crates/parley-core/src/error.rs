use parley_db::DbError;

/// Failure taxonomy shared by every service. Transport layers map these to
/// status codes or scoped `error` events; nothing above this crate inspects
/// message strings. Provider failures never reach callers, see
/// [`crate::provider::ProviderError`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing, invalid or expired credential.
    #[error("{0}")]
    Unauthenticated(String),

    /// Valid identity, insufficient rights.
    #[error("{0}")]
    Forbidden(String),

    /// Allowed caller, but a business rule blocks the action.
    #[error("{0}")]
    Policy(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The single answer for any refresh or access credential problem.
    pub fn reauthenticate() -> Self {
        Self::Unauthenticated("please re-authenticate".into())
    }

    pub fn feature_disabled(key: &str) -> Self {
        Self::Policy(format!("{key} is disabled"))
    }
}

impl From<DbError> for Error {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(what) => Self::NotFound(what),
            DbError::Forbidden(msg) => Self::Forbidden(msg),
            DbError::Policy(msg) => Self::Policy(msg),
            DbError::Conflict(msg) => Self::Conflict(msg),
            DbError::Invalid(msg) => Self::Validation(msg),
            e @ (DbError::Sqlite(_) | DbError::Corrupt(_) | DbError::Poisoned) => {
                Self::Persistence(e.to_string())
            }
        }
    }
}
