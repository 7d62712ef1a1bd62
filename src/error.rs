// ⚠️ Errors - Fatal conditions of a linkage run
//
// Ambiguous matches and missing key data are NOT errors: the first is a
// report value surfaced for whitelist review, the second is handled by the
// grouping and matching policies.

use thiserror::Error;

/// Result type for linkage operations
pub type Result<T> = std::result::Result<T, LinkageError>;

#[derive(Error, Debug)]
pub enum LinkageError {
    /// Missing or invalid identifying-column, aggregation, or rule spec
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A configured column does not exist in the table it should come from
    #[error("configuration error: table '{table}' has no column '{column}'")]
    MissingColumn { table: String, column: String },

    /// The source's provenance column is already present in the reference table
    #[error("configuration error: source '{0}' has already been merged into the reference table")]
    SourceAlreadyMerged(String),

    /// Row-count mismatch, duplicate UID, lost officer, corrupted snapshot
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl LinkageError {
    /// Shorthand for building an invariant violation
    pub fn invariant(message: impl Into<String>) -> Self {
        LinkageError::InvariantViolation(message.into())
    }

    /// Shorthand for building a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        LinkageError::Configuration(message.into())
    }

    /// True for errors raised before any data is processed
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            LinkageError::Configuration(_)
                | LinkageError::MissingColumn { .. }
                | LinkageError::SourceAlreadyMerged(_)
                | LinkageError::ConfigParse(_)
        )
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, LinkageError::InvariantViolation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(LinkageError::config("no id columns").is_configuration());
        assert!(LinkageError::MissingColumn {
            table: "roster".to_string(),
            column: "star".to_string(),
        }
        .is_configuration());
        assert!(!LinkageError::invariant("rows lost").is_configuration());
        assert!(LinkageError::invariant("rows lost").is_invariant_violation());
    }

    #[test]
    fn test_error_messages() {
        let err = LinkageError::MissingColumn {
            table: "roster".to_string(),
            column: "star".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "configuration error: table 'roster' has no column 'star'"
        );

        let err = LinkageError::SourceAlreadyMerged("salary_2017".to_string());
        assert!(err.to_string().contains("salary_2017"));
    }
}
