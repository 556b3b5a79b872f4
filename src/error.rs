//! Error handling for lillia.
use thiserror::Error;

/// Defines all possible errors that can occur in the process manager.
#[derive(Debug, Error)]
pub enum ProcessManagerError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// Configuration parsed but failed validation.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Error spawning a managed process.
    #[error("Failed to start process '{process}': {source}")]
    ProcessStartError {
        /// The process name that failed to start.
        process: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error stopping a managed process.
    #[error("Failed to stop process '{process}': {source}")]
    ProcessStopError {
        /// The process name that failed to stop.
        process: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The executable configured for a process does not exist.
    #[error("Executable for '{process}' not found at {path}")]
    ExecutableMissing {
        /// The process name.
        process: String,
        /// The path that was checked.
        path: String,
    },

    /// No free port could be allocated for the control plane.
    #[error("Port allocation failed: {0}")]
    Port(#[from] PortError),
}

/// Error type for port allocation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    /// Every probed port was busy or reserved.
    #[error("no available port in {attempts} attempts starting at {start}")]
    Exhausted {
        /// First port probed.
        start: u16,
        /// Number of consecutive ports probed.
        attempts: u32,
    },
}

/// Errors raised while talking to the control-plane HTTP endpoint.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// Transport failure (connection refused, timeout, ...).
    #[error("control-plane request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-success HTTP status.
    #[error("control-plane returned HTTP {0}")]
    Status(u16),

    /// The body could not be decoded as JSON.
    #[error("failed to decode control-plane response: {0}")]
    Json(#[from] serde_json::Error),

    /// The body was JSON but not a `call` envelope.
    #[error("malformed control-plane response: {0}")]
    Malformed(&'static str),

    /// The remote function reported an error string as its result.
    #[error("control-plane call '{func}' failed: {message}")]
    Remote {
        /// Function that was called.
        func: String,
        /// Error text returned by the endpoint.
        message: String,
    },
}
