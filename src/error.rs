use thiserror::Error;

#[derive(Error, Debug)]
pub enum NovelError {
    #[error("daily AI quota exceeded, limit is {limit} calls")]
    RateLimited { limit: i64 },

    #[error("AI service busy, please retry: {0}")]
    LlmTransient(String),

    #[error("AI response truncated by length limit")]
    LlmTruncated,

    #[error("AI returned no content")]
    LlmEmpty,

    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    #[error("failed to parse AI response: {0}")]
    Parse(String),

    #[error("regenerating {artifact} would delete {would_delete}; pass cascade_delete=true to confirm")]
    CascadeRequired {
        artifact: String,
        would_delete: String,
    },

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("generation cancelled")]
    Cancelled,

    #[error("generation error: {0}")]
    Generation(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NovelError>;

impl From<serde_json::Error> for NovelError {
    fn from(err: serde_json::Error) -> Self {
        NovelError::Parse(format!("JSON error: {}", err))
    }
}

impl NovelError {
    /// Transport-level faults the gateway is allowed to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, NovelError::LlmTransient(_))
    }
}
