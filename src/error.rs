use crate::models::TicketStatus;
use thiserror::Error;

/// Domain errors for the ticket engine. Transport layers map these onto
/// user-facing notices or HTTP status codes; the core never retries.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("session expired")]
    ExpiredSession,

    #[error("reply could not be matched to a ticket")]
    CorrelationMiss,

    #[error("invalid ticket transition: {from} -> {to}")]
    InvalidTransition { from: TicketStatus, to: TicketStatus },

    #[error("access denied")]
    AccessDenied,

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl Error {
    /// True when the underlying store rejected a write because of a
    /// uniqueness constraint (e.g. two first-contact inserts racing on
    /// the same channel identity).
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Store(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
