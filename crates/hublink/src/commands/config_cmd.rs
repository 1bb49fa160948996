//! Config subcommand handlers.

use std::path::PathBuf;

use hublink_config::Config;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::commands::load_config;
use crate::error::CliError;
use crate::output;

const MASK: &str = "****";

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Show => {
            let cfg = redacted(load_config(global)?);
            let rendered = match global.output {
                OutputFormat::Table => toml::to_string_pretty(&cfg)?,
                format => output::render_single(format, &cfg, |_| String::new())?,
            };
            output::print_output(rendered.trim_end(), global.quiet);
            Ok(())
        }

        ConfigCommand::Path => {
            output::print_output(&path(global).display().to_string(), global.quiet);
            Ok(())
        }

        ConfigCommand::Init { force } => {
            let path = path(global);
            if path.exists() && !force {
                return Err(CliError::ConfigExists {
                    path: path.display().to_string(),
                });
            }
            hublink_config::save_config_to(&hublink_config::template(), &path)?;
            tracing::info!(path = %path.display(), "wrote config template");
            output::print_output(&format!("Wrote {}", path.display()), global.quiet);
            Ok(())
        }
    }
}

fn path(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(hublink_config::config_path)
}

/// Mask plaintext tokens. Env var names stay visible.
fn redacted(mut cfg: Config) -> Config {
    for token in [&mut cfg.controller.token, &mut cfg.cloud.token] {
        if token.is_some() {
            *token = Some(MASK.into());
        }
    }
    cfg
}
