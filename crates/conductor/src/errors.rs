use thiserror::Error;

use crate::models::tool::SchemaError;
use crate::providers::errors::ProviderError;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Provider(ProviderError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Middleware '{middleware}' failed at {trigger}: {message}")]
    CatastrophicMiddlewareFailure {
        trigger: String,
        middleware: String,
        message: String,
    },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {0}")]
    ExecutionError(String),

    #[error("Exceeded {0} tool rounds in a single turn")]
    MaxToolRounds(u32),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ProviderError> for AgentError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Schema(schema) => AgentError::Schema(schema),
            other => AgentError::Provider(other),
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_errors_are_lifted() {
        let err: AgentError = ProviderError::Schema(SchemaError("bad".to_string())).into();
        assert!(matches!(err, AgentError::Schema(_)));

        let err: AgentError = ProviderError::RequestAborted.into();
        assert!(matches!(err, AgentError::Provider(ProviderError::RequestAborted)));
    }

    #[test]
    fn test_catastrophic_message() {
        let err = AgentError::CatastrophicMiddlewareFailure {
            trigger: "preCompletion".to_string(),
            middleware: "guard".to_string(),
            message: "denied".to_string(),
        };
        assert_eq!(err.to_string(), "Middleware 'guard' failed at preCompletion: denied");
    }
}
