//! The `healthcheck` command.

use anyhow::Result;

use crate::config::Config;

/// Requests `/health` from the server at the configured address and fails on a bad status.
pub async fn healthcheck(config: Config) -> Result<()> {
    let client = reqwest::Client::builder()
        .user_agent(blockrelay_service::source::USER_AGENT)
        .build()?;
    let url = format!("http://{}/health", config.http_addr);

    tracing::debug!("sending healthcheck request to {}", url);
    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        anyhow::bail!("Bad Status: {}", response.status());
    }

    tracing::info!("OK");
    Ok(())
}
