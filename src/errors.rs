//! Remote and reconciliation error types.
//!
//! Both remote APIs report failures as a machine-readable code plus an
//! optional HTTP status.  [`StorageError`] and [`AccountError`] carry those
//! values verbatim so the [`crate::classify`] table can decide what is
//! transient.  [`ReconcileError`] is what the outermost reconcilers return:
//! it always names the resource and the sub-operation that failed.

use thiserror::Error;

use crate::destroy::DestroyError;
use crate::policy::PolicyError;

/// Well-known object-storage error codes.
pub mod codes {
    /// The specified bucket does not exist.
    pub const NO_SUCH_BUCKET: &str = "NoSuchBucket";
    /// The specified key does not exist.
    pub const NO_SUCH_KEY: &str = "NoSuchKey";
    /// Generic not-found (HEAD requests carry no error body).
    pub const NOT_FOUND: &str = "NotFound";
    /// A conflicting operation is in progress against the resource.
    pub const OPERATION_ABORTED: &str = "OperationAborted";
    /// The bucket you tried to delete is not empty.
    pub const BUCKET_NOT_EMPTY: &str = "BucketNotEmpty";
    /// Access denied, including deletes blocked by a legal hold or retention.
    pub const ACCESS_DENIED: &str = "AccessDenied";
    /// The object or bucket has no tag set.
    pub const NO_SUCH_TAG_SET: &str = "NoSuchTagSet";
    /// The bucket has no object lock configuration.
    pub const OBJECT_LOCK_CONFIGURATION_NOT_FOUND: &str = "ObjectLockConfigurationNotFoundError";
    /// The bucket is already owned by the caller.
    pub const BUCKET_ALREADY_OWNED_BY_YOU: &str = "BucketAlreadyOwnedByYou";
    /// Request could not be built or was rejected as malformed.
    pub const BAD_REQUEST: &str = "BadRequest";
    /// Backend asks the caller to reduce the request rate.
    pub const SLOW_DOWN: &str = "SlowDown";
    /// Generic throttling code used by several backends.
    pub const THROTTLING: &str = "Throttling";
    /// Request rate limit exceeded.
    pub const TOO_MANY_REQUESTS: &str = "TooManyRequests";
    /// The backend is temporarily unavailable.
    pub const SERVICE_UNAVAILABLE: &str = "ServiceUnavailable";
    /// The backend timed out reading the request.
    pub const REQUEST_TIMEOUT: &str = "RequestTimeout";
    /// The backend failed internally.
    pub const INTERNAL_ERROR: &str = "InternalError";
    /// The request never reached the backend (DNS, TLS, connection reset).
    pub const TRANSPORT: &str = "TransportError";
    /// The account API does not know the permission.
    pub const PERMISSION_NOT_FOUND: &str = "PermissionNotFound";
    /// The account API does not know the service account.
    pub const SERVICE_ACCOUNT_NOT_FOUND: &str = "ServiceAccountNotFound";
    /// The bearer token was rejected.
    pub const UNAUTHORIZED: &str = "Unauthorized";
    /// The response body could not be decoded.
    pub const MALFORMED_RESPONSE: &str = "MalformedResponse";
    /// A conditional copy's precondition did not hold.
    pub const PRECONDITION_FAILED: &str = "PreconditionFailed";
    /// The request is not valid for the addressed resource.
    pub const INVALID_REQUEST: &str = "InvalidRequest";
}

/// A failure reported by a remote API, reduced to what classification needs.
pub trait RemoteFailure: std::fmt::Debug + std::fmt::Display {
    /// Machine-readable error code (e.g. `NoSuchBucket`).
    fn code(&self) -> &str;
    /// HTTP status of the failed response, when one was received.
    fn status(&self) -> Option<u16>;
    /// Human-readable message from the backend.
    fn message(&self) -> &str;
}

/// An error returned by the object-storage API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} (status {status}): {message}")]
pub struct StorageError {
    /// Backend error code.
    pub code: String,
    /// HTTP status, `0` when no response was received.
    pub status: u16,
    /// Backend message.
    pub message: String,
}

impl StorageError {
    /// Build an error from its parts.
    pub fn new(code: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            status,
            message: message.into(),
        }
    }

    /// `NoSuchBucket` for `bucket`.
    pub fn no_such_bucket(bucket: &str) -> Self {
        Self::new(
            codes::NO_SUCH_BUCKET,
            404,
            format!("The specified bucket does not exist: {bucket}"),
        )
    }

    /// `NoSuchKey` for `bucket/key`.
    pub fn no_such_key(bucket: &str, key: &str) -> Self {
        Self::new(
            codes::NO_SUCH_KEY,
            404,
            format!("The specified key does not exist: {bucket}/{key}"),
        )
    }

    /// `AccessDenied` with a message.
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(codes::ACCESS_DENIED, 403, message)
    }

    /// Whether the error carries exactly `code`.
    pub fn is_code(&self, code: &str) -> bool {
        self.code == code
    }
}

impl RemoteFailure for StorageError {
    fn code(&self) -> &str {
        &self.code
    }

    fn status(&self) -> Option<u16> {
        (self.status != 0).then_some(self.status)
    }

    fn message(&self) -> &str {
        &self.message
    }
}

/// An error returned by the account API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct AccountError {
    /// Code (or bare message when the API returned no code).
    pub code: String,
    /// HTTP status, when a response was received.
    pub status: Option<u16>,
    /// Message from the API.
    pub message: String,
}

impl AccountError {
    /// Build an error from its parts.
    pub fn new(code: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            status,
            message: message.into(),
        }
    }

    /// Whether the error carries exactly `code`.
    pub fn is_code(&self, code: &str) -> bool {
        self.code == code
    }
}

impl RemoteFailure for AccountError {
    fn code(&self) -> &str {
        &self.code
    }

    fn status(&self) -> Option<u16> {
        self.status
    }

    fn message(&self) -> &str {
        &self.message
    }
}

/// Either remote API's error, for aggregation in [`ReconcileError`].
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Object-storage API failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Account API failure.
    #[error(transparent)]
    Account(#[from] AccountError),
}

/// The single explanatory error returned by a resource reconciler.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A remote call failed.
    #[error("{resource}: {operation}: {source}")]
    Remote {
        /// Resource description, e.g. `bucket (photos)`.
        resource: String,
        /// Failing sub-operation.
        operation: &'static str,
        /// Remote failure.
        #[source]
        source: RemoteError,
    },

    /// The desired state failed boundary validation.
    #[error("{resource}: invalid desired state: {message}")]
    Invalid {
        /// Resource description.
        resource: String,
        /// Validation report.
        message: String,
    },

    /// An identifying field changed; the resource must be replaced instead.
    #[error("{resource}: {field} cannot be changed in place")]
    Immutable {
        /// Resource description.
        resource: String,
        /// Field that changed.
        field: &'static str,
    },

    /// A policy document could not be normalized or compared.
    #[error("{resource}: {operation}: {source}")]
    Policy {
        /// Resource description.
        resource: String,
        /// Failing sub-operation.
        operation: &'static str,
        /// Policy failure.
        #[source]
        source: PolicyError,
    },

    /// Force-emptying a bucket failed.
    #[error("{resource}: emptying: {source}")]
    Empty {
        /// Resource description.
        resource: String,
        /// Destroyer failure.
        #[source]
        source: DestroyError,
    },

    /// A bounded convergence loop ran out of passes.
    #[error("{resource}: {operation} did not converge after {passes} passes: {last}")]
    Exhausted {
        /// Resource description.
        resource: String,
        /// Sub-operation that kept failing.
        operation: &'static str,
        /// Passes attempted.
        passes: u32,
        /// Last failure observed.
        last: String,
    },

    /// The reconciliation was cancelled between attempts.
    #[error("{resource}: {operation} cancelled")]
    Cancelled {
        /// Resource description.
        resource: String,
        /// Sub-operation in progress.
        operation: &'static str,
    },

    /// No client was configured for the API this resource needs.
    #[error("{resource}: credentials for {api} operations are missing")]
    MissingClient {
        /// Resource description.
        resource: String,
        /// API name.
        api: &'static str,
    },

    /// Reading the object body from its source failed.
    #[error("{resource}: reading source {path}: {source}")]
    Source {
        /// Resource description.
        resource: String,
        /// Source path.
        path: String,
        /// I/O failure.
        #[source]
        source: std::io::Error,
    },
}

impl ReconcileError {
    /// Wrap a remote failure.
    pub fn remote(
        resource: impl Into<String>,
        operation: &'static str,
        source: impl Into<RemoteError>,
    ) -> Self {
        Self::Remote {
            resource: resource.into(),
            operation,
            source: source.into(),
        }
    }
}
