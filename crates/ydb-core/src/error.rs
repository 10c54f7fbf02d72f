//! Error taxonomy shared by every layer of the client.

use std::fmt;

use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced to callers. One value per call.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The transport failed before any server-side semantics applied.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server answered with a non-success status.
    #[error(transparent)]
    Operation(#[from] OperationError),

    /// The server accepted the operation but it has not completed yet.
    #[error("operation {operation_id:?} is not ready")]
    NotReady { operation_id: String },

    /// Caller-side cancellation or deadline expiry.
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("decode {what}: {message}")]
    Decode { what: &'static str, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether the node that produced this error must be pessimized.
    ///
    /// Only transport failures qualify: operation errors and `NotReady`
    /// mean the node answered correctly.
    pub fn must_pessimize(&self) -> bool {
        match self {
            Error::Transport(e) => e.must_pessimize(),
            _ => false,
        }
    }

    pub fn is_context(&self) -> bool {
        matches!(self, Error::Context(_))
    }

    pub fn transport_reason(&self) -> Option<TransportReason> {
        match self {
            Error::Transport(e) => Some(e.reason()),
            _ => None,
        }
    }

    pub fn operation_status(&self) -> Option<StatusCode> {
        match self {
            Error::Operation(e) => Some(e.status()),
            _ => None,
        }
    }

    /// Prefix the message of a transport error; other kinds pass through
    /// unmodified.
    pub fn context(self, prefix: &str) -> Self {
        match self {
            Error::Transport(e) => Error::Transport(e.context(prefix)),
            other => other,
        }
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Transport(status.into())
    }
}

// ── Transport ──────────────────────────────────────────────────

/// Reason code of a transport failure. Mirrors gRPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportReason {
    Unknown,
    Canceled,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl TransportReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportReason::Unknown => "unknown",
            TransportReason::Canceled => "canceled",
            TransportReason::InvalidArgument => "invalid argument",
            TransportReason::DeadlineExceeded => "deadline exceeded",
            TransportReason::NotFound => "not found",
            TransportReason::AlreadyExists => "already exists",
            TransportReason::PermissionDenied => "permission denied",
            TransportReason::ResourceExhausted => "resource exhausted",
            TransportReason::FailedPrecondition => "failed precondition",
            TransportReason::Aborted => "aborted",
            TransportReason::OutOfRange => "out of range",
            TransportReason::Unimplemented => "unimplemented",
            TransportReason::Internal => "internal",
            TransportReason::Unavailable => "unavailable",
            TransportReason::DataLoss => "data loss",
            TransportReason::Unauthenticated => "unauthenticated",
        }
    }

    /// Fixed predicate deciding whether a failure with this reason bans
    /// the node.
    ///
    /// Exhausted quotas and out-of-range requests say nothing about node
    /// health; canceled and expired calls usually come from the caller.
    pub fn must_pessimize(self) -> bool {
        !matches!(
            self,
            TransportReason::ResourceExhausted
                | TransportReason::OutOfRange
                | TransportReason::Canceled
                | TransportReason::DeadlineExceeded
        )
    }
}

impl fmt::Display for TransportReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<tonic::Code> for TransportReason {
    fn from(code: tonic::Code) -> Self {
        use tonic::Code;
        match code {
            Code::Ok | Code::Unknown => TransportReason::Unknown,
            Code::Cancelled => TransportReason::Canceled,
            Code::InvalidArgument => TransportReason::InvalidArgument,
            Code::DeadlineExceeded => TransportReason::DeadlineExceeded,
            Code::NotFound => TransportReason::NotFound,
            Code::AlreadyExists => TransportReason::AlreadyExists,
            Code::PermissionDenied => TransportReason::PermissionDenied,
            Code::ResourceExhausted => TransportReason::ResourceExhausted,
            Code::FailedPrecondition => TransportReason::FailedPrecondition,
            Code::Aborted => TransportReason::Aborted,
            Code::OutOfRange => TransportReason::OutOfRange,
            Code::Unimplemented => TransportReason::Unimplemented,
            Code::Internal => TransportReason::Internal,
            Code::Unavailable => TransportReason::Unavailable,
            Code::DataLoss => TransportReason::DataLoss,
            Code::Unauthenticated => TransportReason::Unauthenticated,
        }
    }
}

/// Transport-level failure (unavailable node, dial failure, broken channel).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport error ({reason}): {message}")]
pub struct TransportError {
    reason: TransportReason,
    message: String,
}

impl TransportError {
    pub fn new(reason: TransportReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(TransportReason::Unavailable, message)
    }

    pub fn reason(&self) -> TransportReason {
        self.reason
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn must_pessimize(&self) -> bool {
        self.reason.must_pessimize()
    }

    /// Prefix the message, keeping the reason: `"take failed: <message>"`.
    pub fn context(mut self, prefix: &str) -> Self {
        self.message = format!("{prefix}: {}", self.message);
        self
    }
}

impl From<tonic::Status> for TransportError {
    fn from(status: tonic::Status) -> Self {
        Self::new(status.code().into(), status.message())
    }
}

// ── Operation ──────────────────────────────────────────────────

/// Server status ids carried by an operation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Unspecified = 0,
    Success = 400000,
    BadRequest = 400010,
    Unauthorized = 400020,
    InternalError = 400030,
    Aborted = 400040,
    Unavailable = 400050,
    Overloaded = 400060,
    SchemeError = 400070,
    GenericError = 400080,
    Timeout = 400090,
    BadSession = 400100,
    PreconditionFailed = 400120,
    AlreadyExists = 400130,
    NotFound = 400140,
    SessionExpired = 400150,
    Cancelled = 400160,
    Undetermined = 400170,
    Unsupported = 400180,
    SessionBusy = 400190,
}

impl StatusCode {
    /// Map a wire status id; unknown ids become `Unspecified`.
    pub fn from_code(code: i32) -> Self {
        match code {
            400000 => StatusCode::Success,
            400010 => StatusCode::BadRequest,
            400020 => StatusCode::Unauthorized,
            400030 => StatusCode::InternalError,
            400040 => StatusCode::Aborted,
            400050 => StatusCode::Unavailable,
            400060 => StatusCode::Overloaded,
            400070 => StatusCode::SchemeError,
            400080 => StatusCode::GenericError,
            400090 => StatusCode::Timeout,
            400100 => StatusCode::BadSession,
            400120 => StatusCode::PreconditionFailed,
            400130 => StatusCode::AlreadyExists,
            400140 => StatusCode::NotFound,
            400150 => StatusCode::SessionExpired,
            400160 => StatusCode::Cancelled,
            400170 => StatusCode::Undetermined,
            400180 => StatusCode::Unsupported,
            400190 => StatusCode::SessionBusy,
            _ => StatusCode::Unspecified,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Unspecified => "STATUS_CODE_UNSPECIFIED",
            StatusCode::Success => "SUCCESS",
            StatusCode::BadRequest => "BAD_REQUEST",
            StatusCode::Unauthorized => "UNAUTHORIZED",
            StatusCode::InternalError => "INTERNAL_ERROR",
            StatusCode::Aborted => "ABORTED",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::Overloaded => "OVERLOADED",
            StatusCode::SchemeError => "SCHEME_ERROR",
            StatusCode::GenericError => "GENERIC_ERROR",
            StatusCode::Timeout => "TIMEOUT",
            StatusCode::BadSession => "BAD_SESSION",
            StatusCode::PreconditionFailed => "PRECONDITION_FAILED",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::SessionExpired => "SESSION_EXPIRED",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Undetermined => "UNDETERMINED",
            StatusCode::Unsupported => "UNSUPPORTED",
            StatusCode::SessionBusy => "SESSION_BUSY",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One server-reported issue. Issues nest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Issue {
    pub message: String,
    pub code: u32,
    pub severity: u32,
    pub issues: Vec<Issue>,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.code, self.message)?;
        if !self.issues.is_empty() {
            f.write_str(" {")?;
            for (i, nested) in self.issues.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{nested}")?;
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}

/// The server answered but reported a non-success status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct OperationError {
    status: StatusCode,
    issues: Vec<Issue>,
    operation_id: String,
}

impl OperationError {
    pub fn new(status: StatusCode, issues: Vec<Issue>) -> Self {
        Self {
            status,
            issues,
            operation_id: String::new(),
        }
    }

    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = operation_id.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation error {}", self.status)?;
        if !self.issues.is_empty() {
            f.write_str(": ")?;
            for (i, issue) in self.issues.iter().enumerate() {
                if i > 0 {
                    f.write_str("; ")?;
                }
                write!(f, "{issue}")?;
            }
        }
        Ok(())
    }
}

// ── Context ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}
