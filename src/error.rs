/// Error type returned when a [`LogRecord`](crate::record::LogRecord)
/// cannot be turned into an output line.
#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    #[error("failed to serialize log entry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Error type returned when parsing a [`Level`](crate::record::Level) from text.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown log level: {0:?}")]
pub struct ParseLevelError(pub String);
