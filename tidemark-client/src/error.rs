//! Error types for the monitor binary.

use crate::api_client::ApiClientError;
use crate::config::ClientConfigError;
use crate::telemetry::TelemetryError;
use tidemark_core::SyncError;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ClientConfigError),
    #[error(transparent)]
    Api(#[from] ApiClientError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}
