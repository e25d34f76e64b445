//! Command handlers.

pub mod config_cmd;
pub mod logs;
pub mod watch;

use crate::cli::{Command, GlobalOpts};
use crate::config::Config;
use crate::error::CliError;

/// Route a command that needs a resolved config.
///
/// `config` and `completions` are handled before the config is loaded.
pub async fn dispatch(cmd: Command, cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        Command::Watch(args) => watch::handle(args, cfg, global).await,
        Command::Logs(args) => logs::handle(args, cfg, global),
        Command::Config(_) | Command::Completions(_) => Err(CliError::Internal(
            "config and completions are handled before dispatch".into(),
        )),
    }
}
