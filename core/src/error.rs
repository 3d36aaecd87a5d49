use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Rule '{rule}' has an invalid condition: {reason}")]
    InvalidCondition { rule: String, reason: String },

    #[error("Rule '{rule}' is invalid: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("Cluster '{cluster_id}' has an unparseable score '{raw}'")]
    InvalidScore { cluster_id: String, raw: String },

    #[error("Unknown {kind} '{value}'")]
    UnknownTag { kind: &'static str, value: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
