//! Command handlers and the connection helpers they share.

pub mod config_cmd;
pub mod run;
pub mod states;
pub mod sync;

use std::sync::Arc;
use std::time::Duration;

use hublink_api::{CloudLink, CloudLinkConfig, ControllerLink, ControllerLinkConfig};
use hublink_config::{AgentConfig, Config};
use hublink_core::SyncAgent;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Load the config from `--config` (or the default path) plus environment.
pub fn load_config(global: &GlobalOpts) -> Result<Config, CliError> {
    let config = match &global.config {
        Some(path) => hublink_config::load_config_from(path)?,
        None => hublink_config::load_config()?,
    };
    Ok(config)
}

/// Connect to the controller, giving up after one request timeout.
pub async fn connect_controller(
    config: ControllerLinkConfig,
) -> Result<Arc<ControllerLink>, CliError> {
    let deadline = config.request_timeout;
    let link = Arc::new(ControllerLink::new(config)?);
    let url = link.url().to_string();
    tracing::info!(%url, "connecting to controller");

    let failed = |source: hublink_api::Error| CliError::ConnectionFailed {
        link: "controller",
        url: url.clone(),
        source,
    };
    match tokio::time::timeout(deadline, link.connect()).await {
        Ok(Ok(())) => Ok(link),
        Ok(Err(hublink_api::Error::Authentication { message })) => {
            Err(CliError::AuthFailed { message })
        }
        Ok(Err(e)) => Err(failed(e)),
        Err(_) => {
            link.disconnect().await;
            Err(failed(hublink_api::Error::Timeout {
                timeout_ms: duration_ms(deadline),
            }))
        }
    }
}

/// Start the cloud session and wait up to `deadline` for it to come up.
pub async fn connect_cloud(
    config: CloudLinkConfig,
    deadline: Duration,
) -> Result<Arc<CloudLink>, CliError> {
    let url = config.url.to_string();
    let link = Arc::new(CloudLink::new(config)?);
    tracing::info!(%url, agent_id = link.agent_id(), "connecting to cloud");

    link.connect().await;
    if let Err(source) = link.wait_until_connected(deadline).await {
        link.disconnect().await;
        return Err(CliError::ConnectionFailed {
            link: "cloud",
            url,
            source,
        });
    }
    Ok(link)
}

/// Both links up and an agent on top of them.
pub struct Session {
    pub agent: SyncAgent,
    controller: Arc<ControllerLink>,
    cloud: Arc<CloudLink>,
}

impl Session {
    /// Connect the controller first, then the cloud. The cloud gets one
    /// acknowledgement timeout to come up.
    pub async fn open(config: AgentConfig) -> Result<Self, CliError> {
        let controller = connect_controller(config.controller).await?;
        let cloud = match connect_cloud(config.cloud, config.sync.submit_timeout).await {
            Ok(cloud) => cloud,
            Err(e) => {
                controller.disconnect().await;
                return Err(e);
            }
        };

        let agent = SyncAgent::new(controller.clone(), cloud.clone(), config.sync);
        Ok(Self {
            agent,
            controller,
            cloud,
        })
    }

    /// Drop the sync, then both links.
    pub async fn close(self) {
        self.agent.shutdown().await;
        self.cloud.disconnect().await;
        self.controller.disconnect().await;
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
