// Merge error taxonomy
//
// Uniqueness conflicts are deliberately NOT represented here: colliding
// relation rows are counted in the RelationOutcome (skipped/deleted) and
// handled by the directive's configured policy. Everything below aborts the
// enclosing transaction and propagates to the caller unchanged.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MergeError {
    /// Source and target refer to the same record.
    #[error("cannot merge {entity_type} #{pk} into itself")]
    IdenticalRecords { entity_type: String, pk: i64 },

    /// Source and target are different entity types.
    #[error("cannot merge '{source_type}' into '{target_type}': entity types differ")]
    TypeMismatch {
        source_type: String,
        target_type: String,
    },

    /// Entity type has no registered merge contract.
    #[error("entity type '{0}' is not registered for merging")]
    UnsupportedEntity(String),

    /// Record referenced by the merge request does not exist in the store.
    #[error("{entity_type} #{pk} not found")]
    RecordNotFound { entity_type: String, pk: i64 },

    /// Unknown strategy tag, or a strategy reached in a context where it
    /// cannot be evaluated (e.g. an unresolved user prompt).
    #[error("unsupported strategy '{strategy}' for '{name}': {reason}")]
    UnsupportedStrategy {
        strategy: String,
        name: String,
        reason: String,
    },

    /// Malformed strategy/directive configuration (missing callback,
    /// directive invalid for the relation shape, ...).
    #[error("invalid merge configuration for '{name}': {reason}")]
    Configuration { name: String, reason: String },

    /// Underlying persistence failure.
    #[error("record store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Snapshot or audit payload could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored timestamp could not be parsed.
    #[error("invalid stored timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

impl MergeError {
    pub fn configuration(name: &str, reason: impl Into<String>) -> Self {
        MergeError::Configuration {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unsupported_strategy(strategy: &str, name: &str, reason: impl Into<String>) -> Self {
        MergeError::UnsupportedStrategy {
            strategy: strategy.to_string(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MergeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = MergeError::IdenticalRecords {
            entity_type: "contact".to_string(),
            pk: 7,
        };
        assert_eq!(err.to_string(), "cannot merge contact #7 into itself");

        let err = MergeError::configuration("tags", "callback 'x' is not registered");
        assert!(err.to_string().contains("tags"));
        assert!(err.to_string().contains("not registered"));
    }

    #[test]
    fn test_store_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidQuery;
        let err: MergeError = sqlite_err.into();
        assert!(matches!(err, MergeError::Store(_)));
    }
}
