//! CLI configuration: thin wrapper around `parkline_config` that applies
//! `GlobalOpts` flag overrides (--config, --server, --storage-dir).

use std::path::PathBuf;

use clap::ValueEnum;

use crate::cli::{ColorMode, GlobalOpts, OutputFormat};
use crate::error::CliError;

pub use parkline_config::{Config, config_path, load_config_from, parse_server_url, save_config_to};

/// The config file this invocation reads: `--config` or the platform default.
pub fn active_path(global: &GlobalOpts) -> PathBuf {
    global.config.clone().unwrap_or_else(config_path)
}

/// Load the config file + environment, then apply flag overrides.
pub fn resolve(global: &GlobalOpts) -> Result<Config, CliError> {
    let mut cfg = load_config_from(&active_path(global))?;

    if let Some(server) = &global.server {
        parse_server_url(server)?;
        cfg.server.url.clone_from(server);
    }
    if let Some(dir) = &global.storage_dir {
        cfg.storage.dir = Some(dir.clone());
    }

    Ok(cfg)
}

/// `-o` when given, else `defaults.output` from the config file.
pub fn output_format(global: &GlobalOpts, cfg: &Config) -> Result<OutputFormat, CliError> {
    match global.output {
        Some(format) => Ok(format),
        None => parse_default("defaults.output", &cfg.defaults.output),
    }
}

/// `--color` when given, else `defaults.color` from the config file.
pub fn color_mode(global: &GlobalOpts, cfg: &Config) -> Result<ColorMode, CliError> {
    match global.color {
        Some(mode) => Ok(mode),
        None => parse_default("defaults.color", &cfg.defaults.color),
    }
}

fn parse_default<T: ValueEnum>(field: &str, raw: &str) -> Result<T, CliError> {
    <T as ValueEnum>::from_str(raw, true).map_err(|reason| CliError::Validation {
        field: field.into(),
        reason,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::Cli;

    fn global(args: &[&str]) -> GlobalOpts {
        let mut argv = vec!["parkline"];
        argv.extend_from_slice(args);
        argv.extend_from_slice(&["logs", "list"]);
        Cli::try_parse_from(argv).unwrap().global
    }

    #[test]
    fn config_defaults_apply_when_flags_are_absent() {
        let mut cfg = Config::default();
        cfg.defaults.output = "json-compact".into();
        cfg.defaults.color = "never".into();

        let opts = global(&[]);
        assert_eq!(output_format(&opts, &cfg).unwrap(), OutputFormat::JsonCompact);
        assert_eq!(color_mode(&opts, &cfg).unwrap(), ColorMode::Never);
    }

    #[test]
    fn flags_beat_config_defaults() {
        let mut cfg = Config::default();
        cfg.defaults.output = "json".into();

        let opts = global(&["-o", "yaml", "--color", "always"]);
        assert_eq!(output_format(&opts, &cfg).unwrap(), OutputFormat::Yaml);
        assert_eq!(color_mode(&opts, &cfg).unwrap(), ColorMode::Always);
    }

    #[test]
    fn built_in_defaults_are_table_and_auto() {
        let opts = global(&[]);
        let cfg = Config::default();
        assert_eq!(output_format(&opts, &cfg).unwrap(), OutputFormat::Table);
        assert_eq!(color_mode(&opts, &cfg).unwrap(), ColorMode::Auto);
    }

    #[test]
    fn unknown_config_default_is_a_validation_error() {
        let mut cfg = Config::default();
        cfg.defaults.output = "xml".into();
        let err = output_format(&global(&[]), &cfg).unwrap_err();
        assert!(
            matches!(&err, CliError::Validation { field, .. } if field == "defaults.output"),
            "{err}"
        );
    }
}
