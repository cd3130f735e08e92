//! Error types for civitai-fleet
//!
//! Only configuration-time and caller mistakes surface as `FleetError`.
//! Anything that goes wrong talking to a single worker host is folded into
//! that host's `DownloadOutcome` or `HealthState` instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    /// An endpoint with this name is already registered
    #[error("Endpoint '{0}' is already registered")]
    DuplicateEndpoint(String),

    /// No endpoint with this name is registered
    #[error("Unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    /// Endpoint definition failed validation
    #[error("Invalid endpoint '{name}': {reason}")]
    InvalidEndpoint { name: String, reason: String },

    /// Download request failed validation
    #[error("Invalid download request: {0}")]
    InvalidRequest(String),

    /// Source URL points outside the configured model catalogs
    #[error("Host '{host}' is not an allowed model catalog")]
    DisallowedCatalogHost { host: String },

    /// No in-flight fan-out carries this operation id
    #[error("Unknown or finished operation '{0}'")]
    UnknownOperation(String),

    /// Configuration could not be parsed or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;
