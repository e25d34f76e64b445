//! `logs` subcommand handlers: read or clear the persisted audit log
//! without touching the network.

use chrono::Utc;

use parkline_core::persist::{self, LoadOutcome};
use parkline_core::{AuditAction, AuditLogEntry, FileStore};

use crate::cli::{GlobalOpts, LogsArgs, LogsCommand};
use crate::config::{self, Config};
use crate::error::CliError;
use crate::output;

pub fn handle(args: LogsArgs, cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let store = FileStore::new(cfg.storage_dir());
    let audit = cfg.audit_config();

    match args.command {
        LogsCommand::List { action, limit } => {
            let entries = match persist::load_logs(
                &store,
                &audit.storage_key,
                audit.expiry,
                Utc::now(),
            )? {
                LoadOutcome::Loaded(entries) => entries,
                LoadOutcome::Missing => Vec::new(),
                LoadOutcome::Expired => {
                    tracing::info!("stored audit log had expired and was discarded");
                    Vec::new()
                }
                LoadOutcome::Corrupt => {
                    tracing::warn!("stored audit log was unreadable and was discarded");
                    Vec::new()
                }
            };

            let entries = filter_entries(entries, action, limit);
            let out = output::render_entries(config::output_format(global, cfg)?, &entries)?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        LogsCommand::Clear => {
            persist::save_logs(&store, &audit.storage_key, &[], Utc::now())?;
            if !global.quiet {
                eprintln!("Audit log cleared ({})", store.dir().display());
            }
            Ok(())
        }
    }
}

fn filter_entries(
    entries: Vec<AuditLogEntry>,
    action: Option<AuditAction>,
    limit: Option<usize>,
) -> Vec<AuditLogEntry> {
    entries
        .into_iter()
        .filter(|e| action.is_none_or(|a| e.action == a))
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}
