//! `hublink sync`: submit the device inventory once and report.

use hublink_config::ConfigError;
use hublink_core::SyncResponse;

use crate::cli::{GlobalOpts, SyncArgs};
use crate::commands::{Session, load_config};
use crate::error::CliError;
use crate::output;

pub async fn handle(args: &SyncArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let config = load_config(global)?.to_agent_config()?;
    let home_id = args
        .home_id
        .clone()
        .or_else(|| config.home_id.clone())
        .ok_or_else(|| ConfigError::Missing {
            field: "sync.home_id".into(),
        })?;

    let session = Session::open(config).await?;
    let response = session.agent.start_sync(&home_id).await;
    session.close().await;

    let rendered = output::render_single(global.output, &response, |r| detail(r, &home_id))?;
    output::print_output(&rendered, global.quiet);

    if response.success {
        Ok(())
    } else {
        Err(sync_failed(&response))
    }
}

pub(crate) fn sync_failed(response: &SyncResponse) -> CliError {
    response.error.as_ref().map_or_else(
        || CliError::SyncFailed {
            code: "sync_failed".into(),
            message: "the cloud did not confirm the sync".into(),
        },
        |body| CliError::SyncFailed {
            code: body.code.clone(),
            message: body.message.clone(),
        },
    )
}

fn detail(response: &SyncResponse, home_id: &str) -> String {
    if response.success {
        format!(
            "Synced {} device(s) into home {home_id}",
            response.synced_device_count
        )
    } else {
        format!("Sync into home {home_id} failed")
    }
}
