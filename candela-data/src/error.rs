use crate::frame::Source;
use candela_instrument::InstrumentError;
use chrono::NaiveDate;
use thiserror::Error;

/// Coarse classification of a [`DataError`], used when deciding whether to
/// retry within a source, fall through to the next source, or abort.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Bad symbol/interval/market/time inputs. Fail fast, no fallback.
    Validation,
    /// Network failure or timeout. Retriable within a source; falls through
    /// across sources in `auto` mode.
    Transport,
    /// A specific day is absent from the archive. Expected; falls through
    /// to REST.
    NotFound,
    /// Checksum mismatch, schema mismatch or corrupt file. Demoted to a
    /// cache miss and recorded to the registry.
    Integrity,
    /// REST rate limit signal. Backed off within the source.
    RateLimit,
    /// The caller pinned a source that cannot serve the request.
    Policy,
    /// All sources exhausted for at least one required day.
    Incomplete,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Transport => "transport",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Integrity => "integrity",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Policy => "policy",
            ErrorKind::Incomplete => "incomplete",
        };
        f.write_str(s)
    }
}

/// Terminal outcome of one day-bucket that could not be served.
#[derive(Debug, Clone)]
pub struct DayFailure {
    pub day: NaiveDate,
    pub source: Source,
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for DayFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} via {}: {} ({})",
            self.day, self.source, self.kind, self.message
        )
    }
}

/// Error type for all fallible operations in this crate.
#[derive(Debug, Clone, Error)]
pub enum DataError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("day {day} not present in archive")]
    NotFound { day: NaiveDate },

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("source policy cannot be satisfied: {0}")]
    Policy(String),

    #[error("request incomplete: {} day(s) failed", failures.len())]
    Incomplete { failures: Vec<DayFailure> },

    #[error(
        "request deadline exceeded: {} day(s) resolved, {} day(s) unresolved",
        resolved.len(),
        unresolved.len()
    )]
    DeadlineExceeded {
        resolved: Vec<NaiveDate>,
        unresolved: Vec<NaiveDate>,
    },
}

impl DataError {
    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DataError::Validation(_) => ErrorKind::Validation,
            DataError::Transport(_) => ErrorKind::Transport,
            DataError::NotFound { .. } => ErrorKind::NotFound,
            DataError::Integrity(_) => ErrorKind::Integrity,
            DataError::RateLimit(_) => ErrorKind::RateLimit,
            DataError::Policy(_) => ErrorKind::Policy,
            DataError::Incomplete { .. } | DataError::DeadlineExceeded { .. } => {
                ErrorKind::Incomplete
            }
        }
    }

    /// Whether retrying the same operation against the same source may
    /// succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, DataError::Transport(_) | DataError::RateLimit(_))
    }

    pub(crate) fn day_failure(&self, day: NaiveDate, source: Source) -> DayFailure {
        DayFailure {
            day,
            source,
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<InstrumentError> for DataError {
    fn from(error: InstrumentError) -> Self {
        DataError::Validation(error.to_string())
    }
}

impl From<reqwest::Error> for DataError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            DataError::Transport(format!("request timed out: {error}"))
        } else {
            DataError::Transport(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            DataError::Validation("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            DataError::NotFound {
                day: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
            }
            .kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            DataError::Incomplete { failures: vec![] }.kind(),
            ErrorKind::Incomplete
        );
    }

    #[test]
    fn test_retriability() {
        assert!(DataError::Transport("io".into()).is_retriable());
        assert!(DataError::RateLimit("429".into()).is_retriable());
        assert!(!DataError::Validation("bad".into()).is_retriable());
        assert!(
            !DataError::NotFound {
                day: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
            }
            .is_retriable()
        );
    }
}
