use thiserror::Error;

/// Error taxonomy surfaced to tool callers. Every variant maps to exactly
/// one observable kind; upstream and transient failures are never folded
/// into each other.
#[derive(Error, Debug)]
pub enum LitMcpError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{entity} \"{id}\" not found. {suggestion}")]
    NotFound {
        entity: String,
        id: String,
        suggestion: String,
    },

    /// A source answered with a definitive failure (4xx/5xx after retries,
    /// or an unparseable body).
    #[error("{source_name} error: {message}")]
    Upstream { source_name: String, message: String },

    /// A failure that may succeed on retry: network error, timeout, or a
    /// 429 that exhausted the retry budget.
    #[error("{source_name} transient failure: {message}")]
    Transient { source_name: String, message: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LitMcpError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found(
        entity: impl Into<String>,
        id: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn upstream(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            source_name: source.into(),
            message: message.into(),
        }
    }

    pub fn transient(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            source_name: source.into(),
            message: message.into(),
        }
    }

    /// Short machine-readable kind tag attached to tool-facing errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid-input",
            Self::NotFound { .. } => "not-found",
            Self::Upstream { .. } => "upstream",
            Self::Transient { .. } => "transient",
            Self::Cancelled => "cancelled",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal",
        }
    }

    /// Soft errors are recorded on the run without aborting the pipeline.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::Upstream { .. } | Self::Transient { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(LitMcpError::invalid("x").kind(), "invalid-input");
        assert_eq!(
            LitMcpError::not_found("pipeline", "weekly", "Save it first.").kind(),
            "not-found"
        );
        assert_eq!(LitMcpError::upstream("pubmed", "HTTP 500").kind(), "upstream");
        assert_eq!(LitMcpError::transient("core", "timeout").kind(), "transient");
        assert_eq!(LitMcpError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn only_source_failures_are_soft() {
        assert!(LitMcpError::upstream("pubmed", "HTTP 500").is_soft());
        assert!(LitMcpError::transient("core", "timeout").is_soft());
        assert!(!LitMcpError::invalid("bad cron").is_soft());
        assert!(!LitMcpError::Cancelled.is_soft());
    }
}
