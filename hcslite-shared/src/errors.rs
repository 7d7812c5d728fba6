//! Error taxonomy shared by the shim and its embedders.
//!
//! Every fallible operation in the workspace returns [`HcsliteResult`]. The
//! variants mirror the error kinds the manager-facing RPC surface can carry,
//! so service handlers convert losslessly via the [`tonic::Status`]
//! conversion below.

use thiserror::Error;

/// Result type used throughout hcslite.
pub type HcsliteResult<T> = Result<T, HcsliteError>;

#[derive(Debug, Error)]
pub enum HcsliteError {
    /// Task id or exec id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Create with an id that is already registered.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Operation invoked in the wrong lifecycle state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Malformed or unsupported request payload.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation is not supported by this shim.
    #[error("not implemented: {0}")]
    Unimplemented(String),

    /// A backend wait exceeded its deadline.
    #[error("timeout waiting for {0}")]
    Timeout(String),

    /// The caller's context was cancelled.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// A notification channel closed before a value arrived.
    #[error("notification channel closed")]
    HandleClosed,

    /// The container exited while a different notification was awaited.
    #[error("unexpected container exit")]
    UnexpectedContainerExit,

    /// The compute service dropped its callback connection.
    #[error("compute service disconnected")]
    UnexpectedProcessAbort,

    /// Native failure reported by the compute backend.
    #[error("compute backend failure {hresult:#010x}: {message}")]
    Compute { hresult: i32, message: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Any unclassified failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HcsliteError {
    /// Build a [`HcsliteError::Compute`] from a backend status code.
    pub fn compute(hresult: i32, message: impl Into<String>) -> Self {
        Self::Compute {
            hresult,
            message: message.into(),
        }
    }

    /// True when the error indicates the target no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<HcsliteError> for tonic::Status {
    fn from(err: HcsliteError) -> Self {
        use tonic::Code;

        let code = match &err {
            HcsliteError::NotFound(_) => Code::NotFound,
            HcsliteError::AlreadyExists(_) => Code::AlreadyExists,
            HcsliteError::FailedPrecondition(_) => Code::FailedPrecondition,
            HcsliteError::InvalidArgument(_) => Code::InvalidArgument,
            HcsliteError::Unimplemented(_) => Code::Unimplemented,
            HcsliteError::Timeout(_) => Code::DeadlineExceeded,
            HcsliteError::Cancelled(_) => Code::Cancelled,
            HcsliteError::HandleClosed
            | HcsliteError::UnexpectedContainerExit
            | HcsliteError::UnexpectedProcessAbort => Code::Unavailable,
            HcsliteError::Compute { .. }
            | HcsliteError::Io(_)
            | HcsliteError::Internal(_) => Code::Internal,
        };

        tonic::Status::new(code, err.to_string())
    }
}

impl From<tonic::Status> for HcsliteError {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;

        let message = status.message().to_string();
        match status.code() {
            Code::NotFound => Self::NotFound(message),
            Code::AlreadyExists => Self::AlreadyExists(message),
            Code::FailedPrecondition => Self::FailedPrecondition(message),
            Code::InvalidArgument => Self::InvalidArgument(message),
            Code::Unimplemented => Self::Unimplemented(message),
            Code::DeadlineExceeded => Self::Timeout(message),
            Code::Cancelled => Self::Cancelled(message),
            _ => Self::Internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip_by_kind() {
        let cases = [
            (HcsliteError::NotFound("t".into()), tonic::Code::NotFound),
            (
                HcsliteError::AlreadyExists("t".into()),
                tonic::Code::AlreadyExists,
            ),
            (
                HcsliteError::FailedPrecondition("state".into()),
                tonic::Code::FailedPrecondition,
            ),
            (
                HcsliteError::InvalidArgument("arg".into()),
                tonic::Code::InvalidArgument,
            ),
            (
                HcsliteError::Unimplemented("pause".into()),
                tonic::Code::Unimplemented,
            ),
            (
                HcsliteError::Timeout("start".into()),
                tonic::Code::DeadlineExceeded,
            ),
            (HcsliteError::HandleClosed, tonic::Code::Unavailable),
        ];

        for (err, code) in cases {
            let status: tonic::Status = err.into();
            assert_eq!(status.code(), code);
        }
    }

    #[test]
    fn compute_error_carries_hresult() {
        let err = HcsliteError::compute(-2147024891, "access denied");
        let text = err.to_string();
        assert!(text.contains("0x80070005"), "got: {text}");
    }
}
