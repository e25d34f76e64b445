//! Clap derive structures for the `parkline` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use parkline_core::AuditAction;

// ── Top-Level CLI ────────────────────────────────────────────────────

/// parkline -- live audit feed for the parking console
#[derive(Debug, Parser)]
#[command(
    name = "parkline",
    version,
    about = "Follow and inspect the parking console audit log",
    long_about = "Connects to the parking console's real-time channel, subscribes to gates,\n\
        and records admin actions and zone occupancy changes in a bounded,\n\
        persisted audit log.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file to use instead of the platform default
    #[arg(long, env = "PARKLINE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Console WebSocket URL (overrides config)
    #[arg(long, global = true)]
    pub server: Option<String>,

    /// Directory holding the persisted audit log (overrides config)
    #[arg(long, global = true)]
    pub storage_dir: Option<PathBuf>,

    /// Output format [default: `defaults.output` from config, else table]
    #[arg(long, short = 'o', env = "PARKLINE_OUTPUT", global = true)]
    pub output: Option<OutputFormat>,

    /// When to use color output [default: `defaults.color` from config, else auto]
    #[arg(long, global = true)]
    pub color: Option<ColorMode>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Subscribe to gates and print audit entries as they are recorded
    #[command(alias = "w")]
    Watch(WatchArgs),

    /// Inspect or clear the persisted audit log
    #[command(alias = "log")]
    Logs(LogsArgs),

    /// Manage CLI configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Watch ────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Gate to subscribe to (repeatable; defaults to `gates` from config)
    #[arg(long = "gate", short = 'g', value_name = "GATE_ID")]
    pub gates: Vec<String>,

    /// Keep the log in memory only; nothing is read from or written to disk
    #[arg(long)]
    pub ephemeral: bool,

    /// Print the entries already in the log before following
    #[arg(long)]
    pub replay: bool,
}

// ── Logs ─────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct LogsArgs {
    #[command(subcommand)]
    pub command: LogsCommand,
}

#[derive(Debug, Subcommand)]
pub enum LogsCommand {
    /// List persisted entries, newest first
    #[command(alias = "ls")]
    List {
        /// Only entries with this action (e.g. zone-opened)
        #[arg(long, value_parser = parse_action)]
        action: Option<AuditAction>,

        /// Show at most this many entries
        #[arg(long, short = 'n')]
        limit: Option<usize>,
    },

    /// Remove every persisted entry
    Clear,
}

fn parse_action(raw: &str) -> Result<AuditAction, String> {
    raw.parse().map_err(|_| {
        use strum::IntoEnumIterator;
        let valid: Vec<String> = AuditAction::iter().map(|a| a.to_string()).collect();
        format!("unknown action '{raw}' (expected one of: {})", valid.join(", "))
    })
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location
    Path,

    /// Display the resolved configuration
    Show,

    /// Write a config file populated with defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
