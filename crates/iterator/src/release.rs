//! Release-by-name: the compensation path for sawtooth-scheduled alerts,
//! and the HTTP client the `release` subcommand uses to reach it.

use tracing::info;

use crate::driver;
use crate::server::Server;
use crate::store::{PersistedBinding, StateStore};
use crate::{Error, Result};

/// Look up the stored binding for an alert name; if it was scheduled as
/// sawtooth, destroy the provisioned module and drop the binding. Bindings
/// with any other scheduling are left in place.
pub async fn release_alert(server: &Server, alert_name: &str) -> Result<()> {
    let data = server
        .store
        .get(alert_name)
        .await?
        .ok_or_else(|| Error::Store(format!("no stored alert data for {}", alert_name)))?;
    let binding = PersistedBinding::from_bytes(&data)?;

    if !binding.is_sawtooth() {
        info!(
            "Alert {} is not sawtooth scheduled, nothing to release",
            alert_name
        );
        return Ok(());
    }

    info!(
        "Sawtooth scheduling detected for alert: {}. Triggering destroy for module: {}",
        alert_name, binding.module
    );
    driver::run(&server.config.server.driver, &binding.module, "destroy").await?;
    info!(
        "Destroy successful for alert: {} on module: {}",
        alert_name, binding.module
    );

    server.store.delete(alert_name).await?;
    Ok(())
}

/// POST a release request to a running executor. Used by the CLI.
pub async fn send_release(address: &str, alert_name: &str) -> Result<()> {
    let url = format!("http://{}/release", address);
    let client = reqwest::Client::new();
    let resp = client
        .post(&url)
        .json(&serde_json::json!({ "alert_name": alert_name }))
        .send()
        .await?;

    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(Error::Execution(format!("server response: {}", body.trim())));
    }

    info!("Release request sent successfully for alert: {}", alert_name);
    Ok(())
}
