//! `watch`: subscribe to gates and follow the audit log live.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use parkline_core::{
    AuditAggregator, AuditLogEntry, ConnectionEvent, ConnectionManager, FileStore, KeyValueStore,
    MemoryStore,
};

use crate::cli::{GlobalOpts, OutputFormat, WatchArgs};
use crate::config::{self, Config};
use crate::error::CliError;
use crate::output;

pub async fn handle(args: WatchArgs, cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let gates = if args.gates.is_empty() {
        cfg.gates.clone()
    } else {
        args.gates
    };
    if gates.is_empty() {
        return Err(CliError::NoGates {
            path: config::active_path(global).display().to_string(),
        });
    }

    let connection = ConnectionManager::new(cfg.server_url()?, cfg.reconnect_config());
    let store: Arc<dyn KeyValueStore> = if args.ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(FileStore::new(cfg.storage_dir()))
    };

    let format = config::output_format(global, cfg)?;
    let color = output::should_color(config::color_mode(global, cfg)?);

    let aggregator = AuditAggregator::new(connection.clone(), store, cfg.audit_config());
    let mut events = connection.events();
    let log = aggregator.log_stream();
    let restored = log.current().clone();
    // Yields the current log first, then every change.
    let mut snapshots = log.into_stream();

    aggregator.initialize(&gates).await?;
    info!(gates = ?gates, url = %connection.url(), "watching audit feed");

    let mut seen: HashSet<String> = restored.iter().map(|e| e.id.clone()).collect();
    if args.replay {
        print_entries(restored.iter().rev(), format, color, global.quiet)?;
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                debug!("interrupted, shutting down");
                break;
            }

            snapshot = snapshots.next() => {
                let Some(snapshot) = snapshot else { break };
                let fresh = snapshot.iter().rev().filter(|e| !seen.contains(&e.id));
                print_entries(fresh, format, color, global.quiet)?;
                seen = snapshot.iter().map(|e| e.id.clone()).collect();
            }

            event = events.recv() => match event {
                // Subscriptions are not restored by the connection itself.
                Ok(ConnectionEvent::Connected) => {
                    for gate in aggregator.subscribed_gates() {
                        connection.subscribe_to_gate(&gate);
                    }
                }
                Ok(ConnectionEvent::ReconnectExhausted { attempts }) => {
                    warn!(attempts, "gave up reconnecting");
                    if !global.quiet {
                        eprintln!(
                            "Lost connection to {} after {attempts} reconnect attempts; \
                             restart parkline to try again.",
                            connection.url()
                        );
                    }
                }
                Ok(other) => debug!(event = ?other, "connection event"),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "connection events lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    aggregator.destroy();
    connection.disconnect();
    Ok(())
}

fn print_entries<'a>(
    entries: impl Iterator<Item = &'a AuditLogEntry>,
    format: OutputFormat,
    color: bool,
    quiet: bool,
) -> Result<(), CliError> {
    for entry in entries {
        let line = output::render_entry_line(format, entry, color)?;
        output::print_output(&line, quiet);
    }
    Ok(())
}
