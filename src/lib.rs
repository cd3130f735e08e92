//! Client-side coordinator that fans a catalog model download out to a
//! fleet of worker hosts and collects one outcome per host.

pub mod api;
pub mod cancel;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod model;
pub mod registry;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use client::WorkerClient;
pub use config::FleetConfig;
pub use coordinator::FleetCoordinator;
pub use error::{FleetError, Result};
pub use events::FleetEvent;
pub use model::{
    DownloadOutcome, DownloadRequest, DownloadSuccess, EndpointStatus, Failure, FailureKind,
    FleetReport, HealthState, ModelRef,
};
pub use registry::{Endpoint, Registry};
