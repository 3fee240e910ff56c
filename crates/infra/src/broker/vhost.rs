//! Best-effort vhost provisioning through the RabbitMQ management API.

use tracing::{info, warn};

use crate::config::BrokerConfig;

use super::BrokerError;

/// `PUT {management_url}/api/vhosts/{vhost}`.
///
/// Returns `Ok(false)` when provisioning is not configured (no management URL
/// or credentials). The call is idempotent on the broker side; callers treat
/// an error as non-fatal and go on to connect.
pub async fn provision_vhost(client: &reqwest::Client, config: &BrokerConfig) -> Result<bool, BrokerError> {
    let (Some(base), Some(user)) = (&config.management_url, &config.management_user) else {
        info!(vhost = %config.vhost, "vhost provisioning skipped, management API not configured");
        return Ok(false);
    };

    let url = vhost_url(base, config);
    let response = client
        .put(&url)
        .basic_auth(user, config.management_password.as_deref())
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body("{}")
        .send()
        .await
        .map_err(|e| BrokerError::Provision(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        warn!(vhost = %config.vhost, %status, "vhost provisioning rejected");
        return Err(BrokerError::Provision(format!("management API returned {status}")));
    }

    info!(vhost = %config.vhost, "vhost provisioned");
    Ok(true)
}

fn vhost_url(base: &str, config: &BrokerConfig) -> String {
    format!("{}/api/vhosts/{}", base.trim_end_matches('/'), config.encoded_vhost())
}
