use thiserror::Error;

use crate::protocol::ErrorShape;

/// JSON-RPC code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC code for a violated parameter precondition.
pub const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC code for an internal invariant violation.
pub const INTERNAL_ERROR: i64 = -32603;
/// Generic server error code, used for every failure without a more precise code.
pub const SERVER_ERROR: i64 = -32000;

/// The four error shapes a CDP client can observe from the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CdpError {
    #[error("{0}")]
    MethodNotFound(String),

    #[error("{0}")]
    InvalidParams(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0}")]
    Server(String),
}

impl CdpError {
    pub fn method_not_found(method: &str) -> Self {
        Self::MethodNotFound(format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::Server(message.into())
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::Internal(_) => INTERNAL_ERROR,
            Self::Server(_) => SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::MethodNotFound(m) | Self::InvalidParams(m) | Self::Internal(m) | Self::Server(m) => m,
        }
    }

    /// Coerce an arbitrary failure into one of the four wire shapes.
    ///
    /// A `CdpError` anywhere at the top of the chain passes through untouched;
    /// everything else becomes `Server` carrying the original message.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<CdpError>() {
            Ok(typed) => typed,
            Err(other) => Self::Server(other.to_string()),
        }
    }

    pub fn to_shape(&self) -> ErrorShape {
        ErrorShape {
            code: self.code(),
            message: self.message().to_string(),
        }
    }
}

impl From<ErrorShape> for CdpError {
    fn from(shape: ErrorShape) -> Self {
        match shape.code {
            METHOD_NOT_FOUND => Self::MethodNotFound(shape.message),
            INVALID_PARAMS => Self::InvalidParams(shape.message),
            INTERNAL_ERROR => Self::Internal(shape.message),
            _ => Self::Server(shape.message),
        }
    }
}

pub type Result<T> = std::result::Result<T, CdpError>;

/// Errors raised while loading configuration from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(CdpError::method_not_found("Foo.bar").code(), -32601);
        assert_eq!(CdpError::invalid_params("x").code(), -32602);
        assert_eq!(CdpError::internal("x").code(), -32603);
        assert_eq!(CdpError::server("x").code(), -32000);
    }

    #[test]
    fn test_method_not_found_message() {
        let err = CdpError::method_not_found("Target.bogus");
        assert_eq!(err.to_string(), "Method not found: Target.bogus");
    }

    #[test]
    fn test_from_anyhow_keeps_typed_errors() {
        let err: anyhow::Error = CdpError::invalid_params("flatten must be true").into();
        let back = CdpError::from_anyhow(err);
        assert_eq!(back, CdpError::InvalidParams("flatten must be true".into()));
    }

    #[test]
    fn test_from_anyhow_wraps_foreign_errors() {
        let err = anyhow::anyhow!("renderer crashed");
        let back = CdpError::from_anyhow(err);
        assert_eq!(back.code(), SERVER_ERROR);
        assert_eq!(back.message(), "renderer crashed");
    }

    #[test]
    fn test_shape_round_trip() {
        let shape = CdpError::method_not_found("Page.navigate").to_shape();
        assert_eq!(shape.code, METHOD_NOT_FOUND);
        let err = CdpError::from(shape);
        assert!(matches!(err, CdpError::MethodNotFound(_)));

        let unknown = CdpError::from(ErrorShape {
            code: -1,
            message: "odd".into(),
        });
        assert_eq!(unknown, CdpError::Server("odd".into()));
    }
}
