//! Tidemark monitor entry point.
//!
//! Mounts the monitoring overview and CDP platform views against the
//! configured API and logs every state change until interrupted.

use std::sync::Arc;

use tidemark_client::config::ClientConfig;
use tidemark_client::error::MonitorError;
use tidemark_client::types::{CdpPlatform, MonitoringOverview};
use tidemark_client::{telemetry, Dashboard, DashboardApi, RestClient};
use tidemark_sync::{QuerySnapshot, SyncClient};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), MonitorError> {
    let config = ClientConfig::load()?;
    telemetry::init_tracing(config.log_format)?;

    let api: Arc<dyn DashboardApi> = Arc::new(RestClient::new(&config)?);
    let sync = SyncClient::new(config.sync.clone())?;
    let dashboard = Dashboard::new(api, sync.clone());

    let mut overview = dashboard.monitoring_overview().live(&sync)?;
    let mut platforms = dashboard.cdp_platforms().live(&sync)?;
    info!(api_base_url = %config.api_base_url, "Monitor started");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            changed = overview.changed() => {
                let snapshot = changed?;
                report_overview(&snapshot);
            }
            changed = platforms.changed() => {
                let snapshot = changed?;
                report_platforms(&snapshot);
            }
            result = &mut shutdown => {
                result?;
                break;
            }
        }
    }

    drop(overview);
    drop(platforms);
    sync.reset()?;
    let stats = sync.store().stats();
    info!(
        executions = stats.executions,
        hits = stats.hits,
        deduplicated = stats.deduplicated,
        "Monitor stopped"
    );
    Ok(())
}

fn report_overview(snapshot: &QuerySnapshot) {
    if let (true, Some(err)) = (snapshot.is_error(), snapshot.error()) {
        warn!(error = %err, stale_data = snapshot.has_data(), "Overview refresh failed");
        return;
    }
    if let Some(overview) = snapshot.data::<MonitoringOverview>() {
        if snapshot.is_success() {
            info!(
                active_campaigns = overview.active_campaigns,
                events_per_minute = overview.events_per_minute,
                error_rate = overview.error_rate,
                platforms_connected = overview.platforms_connected,
                platforms_total = overview.platforms_total,
                "Monitoring overview"
            );
        }
    }
}

fn report_platforms(snapshot: &QuerySnapshot) {
    if let (true, Some(err)) = (snapshot.is_error(), snapshot.error()) {
        warn!(error = %err, "CDP platform refresh failed");
        return;
    }
    if let (true, Some(platforms)) = (snapshot.is_success(), snapshot.data::<Vec<CdpPlatform>>()) {
        let connected = platforms.iter().filter(|p| p.connected).count();
        info!(connected, total = platforms.len(), "CDP platforms");
    }
}
