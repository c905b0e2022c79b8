//! Tidemark Client - Dashboard Data Access
//!
//! The REST side of Tidemark: a [`DashboardApi`] trait with a `reqwest`
//! implementation, the dashboard's declared queries and mutations on top of
//! [`tidemark_sync`], TOML configuration and tracing setup.

pub mod api_client;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod telemetry;
pub mod types;

pub use api_client::{ApiClientError, DashboardApi, RestClient};
pub use config::{AuthConfig, ClientConfig, ClientConfigError, LogFormat};
pub use dashboard::{keys, Dashboard, DeclaredQuery};
pub use error::MonitorError;
