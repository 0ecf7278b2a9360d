use std::error::Error;
use std::fmt;
use std::sync::PoisonError;

#[derive(Debug)]
pub enum HubError {
    // Hub state errors
    StateLock(String),

    // Counter store errors
    StoreUnavailable,

    // Frame errors
    MessageParseError(String),

    // Identity errors
    AuthenticationRequired(String),

    // Validation errors
    ValidationError(String),

    // Configuration errors
    ConfigError(String),
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateLock(msg) => write!(f, "Hub state lock error: {}", msg),
            Self::StoreUnavailable => write!(f, "Counter store unavailable"),
            Self::MessageParseError(msg) => write!(f, "Message parse error: {}", msg),
            Self::AuthenticationRequired(action) => {
                write!(f, "Authentication required for {}", action)
            }
            Self::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for HubError {}

// Converting from PoisonError to facilitate poisoned mutex handling
impl<T> From<PoisonError<T>> for HubError {
    fn from(err: PoisonError<T>) -> Self {
        HubError::StateLock(format!("Mutex poisoned: {}", err))
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::MessageParseError(err.to_string())
    }
}

// Generic result type for the hub
pub type Result<T> = std::result::Result<T, HubError>;
