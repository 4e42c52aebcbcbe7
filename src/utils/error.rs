use thiserror::Error;

/// Parlor global error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("event not found")]
    EventNotFound,

    #[error("event already exists")]
    EventAlreadyExists,

    #[error("event has been redacted")]
    EventRedacted,

    #[error("event ID is not the reference hash")]
    EventIdMismatch,

    #[error("invalid signature from {0}")]
    SignatureInvalid(String),

    #[error("this room is not federated")]
    NotFederated,

    #[error("this server is not in this room")]
    NotInRoom,

    #[error("unknown or unsupported room version {0}")]
    UnknownRoomVersion(String),

    #[error("failed to auth event (step 4): {0}")]
    AuthStep4Failed(String),

    #[error("failed to auth event (step 5): {0}")]
    AuthStep5Failed(String),

    #[error("event is not authorized: {0}")]
    EventNotAuthorized(String),

    #[error("duplicate reaction for this event/user")]
    DuplicateAnnotation,

    #[error("profile is unchanged")]
    ProfileUnchanged,

    #[error("lease fencing token changed, lease was lost")]
    LeaseLost,

    #[error("transaction exceeded its time budget")]
    TransactionTimeout,

    #[error("failed to publish change over the bus: {0}")]
    BusPublishFailed(String),

    #[error("key-value store error: {0}")]
    Kvs(String),

    #[error("federation transport error: {0}")]
    Transport(String),

    #[error("bad configuration: {0}")]
    BadConfig(&'static str),

    #[error("bad data in database: {0}")]
    BadData(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("signature/hash error: {0}")]
    Signatures(#[from] ruma::signatures::Error),
}

impl Error {
    /// Whether this error is a per-event rejection (returned to the caller
    /// beside the accepted batch) rather than a transaction-fatal error.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::EventAlreadyExists
                | Error::EventIdMismatch
                | Error::SignatureInvalid(_)
                | Error::AuthStep4Failed(_)
                | Error::AuthStep5Failed(_)
                | Error::EventNotAuthorized(_)
                | Error::DuplicateAnnotation
        )
    }
}

/// Parlor global result type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_classification() {
        assert!(Error::DuplicateAnnotation.is_rejection());
        assert!(Error::AuthStep4Failed("missing power levels".to_owned()).is_rejection());
        assert!(!Error::EventNotFound.is_rejection());
        assert!(!Error::LeaseLost.is_rejection());
    }

    #[test]
    fn test_error_display() {
        let error = Error::AuthStep5Failed("sender not joined".to_owned());
        assert!(error.to_string().contains("step 5"));
        assert!(error.to_string().contains("sender not joined"));

        let error = Error::SignatureInvalid("remote.example.com".to_owned());
        assert!(error.to_string().contains("remote.example.com"));
    }
}
