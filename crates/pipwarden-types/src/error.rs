//! Error types for decoding shared report data.

use thiserror::Error;

/// Result type alias for report decoding.
pub type Result<T> = std::result::Result<T, ReportLineError>;

/// Errors raised while decoding a report line or one of its fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportLineError {
    #[error("report line is empty")]
    Empty,

    #[error("report line has no '<operation>:<pid>' header: {0}")]
    MissingHeader(String),

    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("report line has {found} fields, expected {expected}")]
    FieldCount { expected: usize, found: usize },

    #[error("invalid value for {field}: '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("dangling escape at end of report line")]
    DanglingEscape,
}
