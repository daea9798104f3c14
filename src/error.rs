//! Tracker error types.
//!
//! [`ApiError`] describes failures of the external stats service and
//! knows which of them are worth retrying. [`TrackerError`] is the central
//! error type for everything else; every pipeline returns it, and each
//! variant carries a numeric code so ops tooling can bucket failures.

/// Name of the unique index guarding case-insensitive callsigns.
pub const CALLSIGN_CONSTRAINT: &str = "ix_players_callsign";

/// Postgres SQLSTATE for `unique_violation`.
const PG_UNIQUE_VIOLATION: &str = "23505";

/// Failure talking to the external stats / server-list service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The service reported itself unavailable (HTTP 503 or envelope 503).
    #[error("service unavailable")]
    ServiceUnavailable,

    /// Non-success HTTP status.
    #[error("http error: status {status}")]
    Http {
        /// Status code returned by the service.
        status: u16,
    },

    /// The request did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// The connection could not be established or was dropped.
    #[error("connection error: {0}")]
    Connection(String),

    /// Credentials or session grant were rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The service answered but rejected the call.
    #[error("request rejected ({status}): {message}")]
    Rejected {
        /// Envelope status code.
        status: u16,
        /// Envelope message.
        message: String,
    },
}

impl ApiError {
    /// Returns `true` for error classes the API wrapper retries.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable | Self::Http { .. } | Self::Timeout | Self::Connection(_)
        )
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() || err.is_request() {
            Self::Connection(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            match status.as_u16() {
                503 => Self::ServiceUnavailable,
                401 | 403 => Self::Unauthorized(err.to_string()),
                code => Self::Http { status: code },
            }
        } else {
            Self::Connection(err.to_string())
        }
    }
}

/// Crate-wide error type.
///
/// # Error Code Ranges
///
/// | Range     | Category                     |
/// |-----------|------------------------------|
/// | 1000–1999 | Configuration / input        |
/// | 2000–2999 | External stats service       |
/// | 3000–3999 | Relational / key-value store |
/// | 4000–4999 | Pipeline                     |
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// The stats service kept failing; wraps the last underlying error.
    #[error("interface error after {attempts} attempt(s)")]
    Interface {
        /// Number of invocations made before giving up.
        attempts: u32,
        /// Last error observed.
        #[source]
        source: ApiError,
    },

    /// A unique constraint was violated.
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation {
        /// Name of the violated constraint or index.
        constraint: String,
    },

    /// Relational store failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Rank / token key-value store failure.
    #[error("rank store error: {0}")]
    RankStore(String),

    /// Missing or malformed configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A window size of zero was requested.
    #[error("window size must be greater than zero")]
    InvalidWindowSize,

    /// Callsign collisions did not settle within the allowed rounds.
    #[error("callsign conflict unresolved after {rounds} round(s)")]
    CallsignConflictUnresolved {
        /// Rounds attempted.
        rounds: usize,
    },

    /// A pushed event could not be ingested.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Internal invariant broken.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TrackerError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::InvalidConfig(_) => 1001,
            Self::InvalidWindowSize => 1002,
            Self::InvalidEvent(_) => 1003,
            Self::Interface { .. } => 2001,
            Self::Persistence(_) => 3001,
            Self::UniqueViolation { .. } => 3002,
            Self::RankStore(_) => 3003,
            Self::CallsignConflictUnresolved { .. } => 4001,
            Self::Internal(_) => 4000,
        }
    }

    /// Returns `true` when this is a unique violation on `constraint`.
    #[must_use]
    pub fn is_unique_violation(&self, constraint: &str) -> bool {
        matches!(self, Self::UniqueViolation { constraint: c } if c == constraint)
    }
}

impl From<sqlx::Error> for TrackerError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err
            && db_err.code().as_deref() == Some(PG_UNIQUE_VIOLATION)
        {
            return Self::UniqueViolation {
                constraint: db_err.constraint().unwrap_or_default().to_string(),
            };
        }
        Self::Persistence(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for TrackerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<redis::RedisError> for TrackerError {
    fn from(err: redis::RedisError) -> Self {
        Self::RankStore(err.to_string())
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(format!("json: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ApiError::ServiceUnavailable.is_transient());
        assert!(ApiError::Http { status: 500 }.is_transient());
        assert!(ApiError::Timeout.is_transient());
        assert!(ApiError::Connection("reset".to_string()).is_transient());
        assert!(!ApiError::Unauthorized("bad grant".to_string()).is_transient());
        assert!(!ApiError::Decode("eof".to_string()).is_transient());
        assert!(
            !ApiError::Rejected {
                status: 400,
                message: "bad guid".to_string()
            }
            .is_transient()
        );
    }

    #[test]
    fn unique_violation_matches_constraint_name() {
        let err = TrackerError::UniqueViolation {
            constraint: CALLSIGN_CONSTRAINT.to_string(),
        };
        assert!(err.is_unique_violation(CALLSIGN_CONSTRAINT));
        assert!(!err.is_unique_violation("players_pkey"));
        let other = TrackerError::Persistence("x".to_string());
        assert!(!other.is_unique_violation(CALLSIGN_CONSTRAINT));
    }

    #[test]
    fn interface_error_chains_source() {
        let err = TrackerError::Interface {
            attempts: 3,
            source: ApiError::ServiceUnavailable,
        };
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("service unavailable"));
        assert_eq!(err.error_code(), 2001);
    }
}
