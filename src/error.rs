use thiserror::Error;

/// Failure reported by an engine adapter. `code` is a stable identifier,
/// `message` is whatever the native layer told us.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: &'static str,
    pub message: String,
}

impl EngineError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new("unavailable", message)
    }
}

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("web view is not ready")]
    NotReady,
    #[error("no function is bound as `{0}`")]
    NotBound(String),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ViewError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotReady => "unavailable",
            Self::NotBound(_) => "not_bound",
            Self::InvalidOptions(_) => "invalid_request",
            Self::Engine(err) => err.code,
        }
    }
}

/// Error handed to an evaluation's completion callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ScriptError {
    pub message: String,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure returned by a bound function. Only logged; the page sees a bare
/// promise rejection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct BindingError {
    pub message: String,
}

impl BindingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for BindingError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<String> for BindingError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for BindingError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
