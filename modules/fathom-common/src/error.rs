use thiserror::Error;

#[derive(Error, Debug)]
pub enum FathomError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A stored ground-truth answer that can't be compared against an extracted value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnswerError {
    #[error("answer for {fact_key} is not valid JSON: {reason}")]
    Undecodable { fact_key: String, reason: String },

    #[error("answer for {fact_key} is not a {expected}: {found}")]
    WrongType {
        fact_key: String,
        expected: crate::types::FactType,
        found: String,
    },
}
