//! `hublink states`: one-shot listing of the controller's entity states.

use hublink_api::EntityState;
use serde_json::Value;
use tabled::Tabled;

use crate::cli::{GlobalOpts, StatesArgs};
use crate::commands::{connect_controller, load_config};
use crate::error::CliError;
use crate::output;

#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "Entity")]
    entity_id: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Last Changed")]
    last_changed: String,
}

fn to_row(entity: &EntityState, color: bool) -> StateRow {
    let state = match entity.state.as_str() {
        "on" | "open" | "unlocked" | "playing" | "cleaning" | "home" => {
            output::paint_status(&entity.state, Some(true), color)
        }
        "off" | "closed" | "locked" | "idle" | "paused" | "docked" | "not_home" => {
            output::paint_status(&entity.state, Some(false), color)
        }
        "unavailable" | "unknown" => output::paint_status(&entity.state, None, color),
        _ => entity.state.clone(),
    };

    StateRow {
        entity_id: entity.entity_id.clone(),
        state,
        name: entity
            .attribute("friendly_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        last_changed: entity.last_changed.clone().unwrap_or_default(),
    }
}

fn filter_states(mut states: Vec<EntityState>, domain: Option<&str>) -> Vec<EntityState> {
    if let Some(domain) = domain {
        states.retain(|s| s.domain() == domain);
    }
    states.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    states
}

pub async fn handle(args: &StatesArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = load_config(global)?;
    let controller = connect_controller(cfg.controller_link_config()?).await?;

    let fetched = controller.get_states().await;
    controller.disconnect().await;
    let states = filter_states(fetched?, args.domain.as_deref());
    tracing::debug!(count = states.len(), "fetched entity states");

    let color = output::should_color(global.color);
    let rendered = output::render_list(global.output, &states, |s| to_row(s, color))?;
    output::print_output(&rendered, global.quiet);
    Ok(())
}
