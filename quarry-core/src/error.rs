//! Error taxonomy shared by every component.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::jobs::JobId;
use crate::pool::DbError;
use crate::ratelimit::BucketKind;

/// Every failure the governor reports. Ceiling rejections are told apart
/// from genuine failures through [`GovernorError::is_busy`].
#[derive(Error, Debug)]
pub enum GovernorError {
    /// The concurrent job ceiling is reached.
    #[error("job admission rejected: {running} of {limit} execution slots busy")]
    AdmissionRejected {
        /// Active jobs at the time of the request.
        running: usize,
        /// Configured job ceiling.
        limit: usize,
    },

    /// No connection slot freed up within the acquire timeout.
    #[error(
        "connection pool exhausted: {max_connections} connections busy after waiting {waited:?}"
    )]
    PoolExhausted {
        /// Configured connection ceiling.
        max_connections: usize,
        /// How long the caller waited.
        waited: Duration,
    },

    /// Opening or using a connection failed at the transport level.
    #[error("database connection failed: {0}")]
    Connection(DbError),

    /// The statement itself failed.
    #[error("query failed: {0}")]
    Query(DbError),

    /// The statement overran the per-use timeout.
    #[error("query exceeded the {timeout:?} timeout")]
    QueryTimeout {
        /// Configured per-use timeout.
        timeout: Duration,
    },

    /// A workspace could not be created from the template.
    #[error("failed to initialize workspace {path}: {reason}")]
    WorkspaceInit {
        /// Workspace being created.
        path: PathBuf,
        /// What went wrong.
        reason: String,
        /// Underlying filesystem error, if any.
        #[source]
        source: Option<std::io::Error>,
    },

    /// Model operations need an initialized workspace.
    #[error("no workspace for {tenant}/{content_set}")]
    WorkspaceNotFound {
        /// Owning tenant.
        tenant: String,
        /// Requested content set.
        content_set: String,
    },

    /// The principal's sliding window for `bucket` is full.
    #[error("rate limit exceeded for {bucket} requests: {limit} per {window:?}")]
    RateLimitExceeded {
        /// Bucket the request counted against.
        bucket: BucketKind,
        /// Requests allowed per window.
        limit: usize,
        /// Window length.
        window: Duration,
        /// Time until the oldest entry leaves the window.
        retry_after: Duration,
    },

    /// The principal already has the maximum number of requests in flight.
    #[error("too many concurrent requests (limit {limit})")]
    ConcurrencyLimitExceeded {
        /// Configured per-principal ceiling.
        limit: usize,
    },

    /// A tenant, content set or model name failed validation.
    #[error("invalid {kind}: {value:?}")]
    InvalidIdentifier {
        /// Which identifier was rejected.
        kind: &'static str,
        /// The rejected input.
        value: String,
    },

    /// The external program could not be started.
    #[error("failed to spawn `{program}`: {source}")]
    JobSpawn {
        /// Program that failed to start.
        program: String,
        /// Spawn error.
        #[source]
        source: std::io::Error,
    },

    /// Unknown job, or one owned by another tenant.
    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// Filesystem failure outside workspace initialization.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GovernorError {
    /// True for rejections caused by a resource ceiling rather than by a
    /// failure of the requested operation itself.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::AdmissionRejected { .. }
                | Self::PoolExhausted { .. }
                | Self::RateLimitExceeded { .. }
                | Self::ConcurrencyLimitExceeded { .. }
        )
    }

    /// Suggested client backoff for retryable rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            Self::AdmissionRejected { .. }
            | Self::PoolExhausted { .. }
            | Self::ConcurrencyLimitExceeded { .. } => {
                Some(Duration::from_secs(5))
            }
            Self::Connection(_) => Some(Duration::from_secs(1)),
            _ => None,
        }
    }

    pub(crate) fn workspace_init(
        path: impl Into<PathBuf>,
        reason: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::WorkspaceInit {
            path: path.into(),
            reason: reason.into(),
            source: Some(source),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GovernorError>;
