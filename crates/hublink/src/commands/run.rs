//! `hublink run`: the long-running agent.

use std::sync::Arc;
use std::time::Duration;

use hublink_core::{SyncAgent, SyncStats};
use tracing::{error, info, warn};

use crate::cli::{GlobalOpts, RunArgs};
use crate::commands::sync::sync_failed;
use crate::commands::{Session, load_config};
use crate::error::CliError;
use crate::output;

const STATS_INTERVAL: Duration = Duration::from_secs(300);

pub async fn handle(args: &RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let config = load_config(global)?.to_agent_config()?;
    let home_id = args.home_id.clone().or_else(|| config.home_id.clone());

    let session = Session::open(config).await?;
    let agent = session.agent.clone();
    agent.on_unhealthy(Arc::new(|message: &str| {
        error!(error = message, "controller link unhealthy");
    }));
    agent.start_supervision();

    if let Err(e) = establish(&agent, home_id.as_deref()).await {
        session.close().await;
        return Err(e);
    }

    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    stats_tick.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "could not listen for ctrl-c");
                }
                break;
            }
            _ = stats_tick.tick() => log_stats(&agent.sync_stats()),
        }
    }

    info!("shutting down");
    let stats = agent.sync_stats();
    session.close().await;

    let rendered = output::render_single(global.output, &stats, summary)?;
    output::print_output(&rendered, global.quiet);
    Ok(())
}

/// Sync into `home_id` when given, otherwise restore what the cloud has.
async fn establish(agent: &SyncAgent, home_id: Option<&str>) -> Result<(), CliError> {
    if let Some(home_id) = home_id {
        let response = agent.start_sync(home_id).await;
        if !response.success {
            return Err(sync_failed(&response));
        }
        info!(
            home_id,
            devices = response.synced_device_count,
            "sync established"
        );
        return Ok(());
    }

    if agent.restore().await? {
        info!(stats = ?agent.sync_stats(), "sync restored from cloud");
        Ok(())
    } else {
        Err(CliError::NothingToSync)
    }
}

fn log_stats(stats: &SyncStats) {
    info!(
        generation = stats.generation,
        mappings = stats.mapping_count,
        received = stats.events_received,
        sent = stats.updates_sent,
        skipped = stats.updates_skipped,
        failed = stats.updates_failed,
        "sync stats"
    );
}

fn summary(stats: &SyncStats) -> String {
    format!(
        "Home:            {}\n\
         Mappings:        {}\n\
         Events received: {}\n\
         Updates sent:    {}\n\
         Updates skipped: {} ({} deduplicated)\n\
         Updates failed:  {}",
        stats.home_id.as_deref().unwrap_or("-"),
        stats.mapping_count,
        stats.events_received,
        stats.updates_sent,
        stats.updates_skipped,
        stats.updates_deduped,
        stats.updates_failed,
    )
}
