//! Error type for the allocation service.
//!
//! `From<Error> for Status` decides what a client sees:
//!
//! | Cause                                   | gRPC code            |
//! | --------------------------------------- | -------------------- |
//! | unknown tag                             | `NOT_FOUND`          |
//! | malformed tag, bad count                | `INVALID_ARGUMENT`   |
//! | buffer exhausted, store down, shutdown  | `UNAVAILABLE`        |
//! | tag's ID space used up                  | `RESOURCE_EXHAUSTED` |
//!
//! `UNAVAILABLE` is the one code clients should retry with backoff.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the allocation service.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The allocator rejected the call.
    #[error("Allocation error: {0}")]
    Allocation(#[from] segid::Error),

    /// The client request was invalid or exceeded constraints.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Allocation(e) => match e {
                segid::Error::UnknownTag { .. } => Status::not_found(e.to_string()),
                segid::Error::InvalidArgument { reason } => Status::invalid_argument(reason),
                segid::Error::RangeOverflow { .. } => Status::resource_exhausted(e.to_string()),
                segid::Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
                e if e.is_retryable() => Status::unavailable(e.to_string()),
                e => Status::internal(e.to_string()),
            },
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use tonic::Code;

    fn code(err: impl Into<Error>) -> Code {
        Status::from(err.into()).code()
    }

    #[test]
    fn allocation_errors_map_to_codes() {
        assert_eq!(
            code(segid::Error::UnknownTag { tag: "x".into() }),
            Code::NotFound
        );
        assert_eq!(
            code(segid::Error::BufferExhausted {
                tag: "x".into(),
                waited: Duration::from_millis(500),
            }),
            Code::Unavailable
        );
        assert_eq!(
            code(segid::Error::StoreUnavailable {
                reason: "down".into()
            }),
            Code::Unavailable
        );
        assert_eq!(
            code(segid::Error::CoordinationUnavailable {
                reason: "down".into()
            }),
            Code::Unavailable
        );
        assert_eq!(
            code(segid::Error::RangeOverflow { tag: "x".into() }),
            Code::ResourceExhausted
        );
        assert_eq!(
            code(segid::Error::InvalidArgument {
                reason: "empty".into()
            }),
            Code::InvalidArgument
        );
        assert_eq!(code(segid::Error::ServiceShutdown), Code::Unavailable);
    }

    #[test]
    fn service_errors_map_to_codes() {
        assert_eq!(
            code(Error::InvalidRequest {
                reason: "count".into()
            }),
            Code::InvalidArgument
        );
        assert_eq!(code(Error::ServiceShutdown), Code::Unavailable);
    }
}
