//! Output formatting: table, JSON, YAML, plain.
//!
//! Renders data in the format selected by `--output`. Table uses `tabled`,
//! structured formats use serde, plain emits one identifier per line.

use std::io::{self, IsTerminal, Write};

use owo_colors::OwoColorize;
use tabled::{Table, Tabled, settings::Style};

use parkline_core::{AuditAction, AuditLogEntry};

use crate::cli::{ColorMode, OutputFormat};
use crate::error::CliError;

// ── Color helpers ────────────────────────────────────────────────────

/// Determine whether color output should be enabled.
pub fn should_color(mode: ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    }
}

fn paint_action(action: AuditAction, color: bool) -> String {
    let tag = action.to_string();
    if !color {
        return tag;
    }
    match action {
        AuditAction::ZoneStateChanged => tag.cyan().to_string(),
        AuditAction::ZoneOpened | AuditAction::UserAdded => tag.green().to_string(),
        AuditAction::ZoneClosed => tag.red().to_string(),
        AuditAction::CategoryRatesChanged | AuditAction::RushUpdated => tag.yellow().to_string(),
        AuditAction::VacationAdded => tag.magenta().to_string(),
    }
}

// ── Render dispatchers ───────────────────────────────────────────────

/// Render a list of serde-serializable + tabled items in the chosen format.
pub fn render_list<T, R>(
    format: OutputFormat,
    data: &[T],
    to_row: impl Fn(&T) -> R,
    id_fn: impl Fn(&T) -> String,
) -> Result<String, CliError>
where
    T: serde::Serialize,
    R: Tabled,
{
    Ok(match format {
        OutputFormat::Table => {
            let rows: Vec<R> = data.iter().map(to_row).collect();
            render_table(&rows)
        }
        OutputFormat::Json => serde_json::to_string_pretty(data)?,
        OutputFormat::JsonCompact => serde_json::to_string(data)?,
        OutputFormat::Yaml => serde_yaml::to_string(data)?,
        OutputFormat::Plain => data.iter().map(&id_fn).collect::<Vec<_>>().join("\n"),
    })
}

/// Render a single serde-serializable item in the chosen format.
///
/// Table and plain rendering use `text_fn`, since a single item has no rows.
pub fn render_single<T>(
    format: OutputFormat,
    data: &T,
    text_fn: impl Fn(&T) -> Result<String, CliError>,
) -> Result<String, CliError>
where
    T: serde::Serialize,
{
    match format {
        OutputFormat::Table | OutputFormat::Plain => text_fn(data),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(data)?),
        OutputFormat::JsonCompact => Ok(serde_json::to_string(data)?),
        OutputFormat::Yaml => Ok(serde_yaml::to_string(data)?),
    }
}

/// Print the rendered output to stdout, respecting quiet mode.
pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

fn render_table<R: Tabled>(rows: &[R]) -> String {
    Table::new(rows).with(Style::rounded()).to_string()
}

// ── Audit entries ────────────────────────────────────────────────────

#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Actor")]
    actor: String,
    #[tabled(rename = "Details")]
    details: String,
}

impl EntryRow {
    fn new(entry: &AuditLogEntry) -> Self {
        Self {
            time: format_time(entry),
            action: entry.action.to_string(),
            target: format!("{}/{}", entry.target_type, entry.target_id),
            actor: entry.admin_id.clone(),
            details: summarize_details(entry),
        }
    }
}

/// Local wall-clock time, or the raw string when it does not parse.
fn format_time(entry: &AuditLogEntry) -> String {
    entry.recorded_at().map_or_else(
        || entry.timestamp.clone(),
        |at| {
            at.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        },
    )
}

/// `occupied=3 free=7 open=true` for zone entries, compact JSON otherwise.
pub fn summarize_details(entry: &AuditLogEntry) -> String {
    let Some(details) = &entry.details else {
        return String::new();
    };
    match details.as_object() {
        Some(map) if entry.is_zone_state() => map
            .iter()
            .filter(|(key, _)| matches!(key.as_str(), "occupied" | "free" | "open"))
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" "),
        _ => details.to_string(),
    }
}

pub fn render_entries(format: OutputFormat, entries: &[AuditLogEntry]) -> Result<String, CliError> {
    render_list(format, entries, EntryRow::new, |e| e.id.clone())
}

/// One entry as it arrives on `watch`. Structured formats stay one
/// document per entry so the output can be piped.
pub fn render_entry_line(
    format: OutputFormat,
    entry: &AuditLogEntry,
    color: bool,
) -> Result<String, CliError> {
    Ok(match format {
        OutputFormat::Table => {
            let details = summarize_details(entry);
            let line = format!(
                "{}  {:<22}  {}/{}  by {}",
                format_time(entry),
                paint_action(entry.action, color),
                entry.target_type,
                entry.target_id,
                entry.admin_id,
            );
            if details.is_empty() {
                line
            } else if color {
                format!("{line}  {}", details.dimmed())
            } else {
                format!("{line}  {details}")
            }
        }
        OutputFormat::Json | OutputFormat::JsonCompact => serde_json::to_string(entry)?,
        OutputFormat::Yaml => format!("---\n{}", serde_yaml::to_string(entry)?),
        OutputFormat::Plain => entry.id.clone(),
    })
}
