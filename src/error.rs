use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, AgentError>;

/// Custom Error type for the netprobe library
///
/// Measurement and delivery failures are not errors: they travel as
/// [`crate::probe::ProbeFailure`] inside samples and as
/// [`crate::exporter::SinkError`] inside the delivery loop.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Invalid state transition: {from} -> {to}")]
    State { from: String, to: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// Shorthand for configuration errors
    pub fn config(msg: impl Into<String>) -> Self {
        AgentError::Config(msg.into())
    }

    /// Whether this error is fatal at startup
    pub fn is_config(&self) -> bool {
        matches!(self, AgentError::Config(_))
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(err: config::ConfigError) -> Self {
        AgentError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_fatal() {
        assert!(AgentError::config("bad window").is_config());
        let state = AgentError::State {
            from: "running".to_string(),
            to: "initializing".to_string(),
        };
        assert!(!state.is_config());
        assert_eq!(state.to_string(), "Invalid state transition: running -> initializing");
    }
}
