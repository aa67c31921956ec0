pub mod record;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use record::{process_record_command, RecordCommand};
use tracing::{info, level_filters::LevelFilter};

use crate::{
    config::{Config, LoadedConfig, RawConfig},
    error::Error,
    utils::{
        dir::create_application_default_path,
        logging::{enable_logging, CLI_PREFIX},
    },
};

#[derive(Parser, Debug)]
#[command(name = "tacks", version)]
#[command(about = "A time tracking application", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Option<Commands>,
    #[arg(
        long,
        global = true,
        help = "Config file. By default $HOME/.config/tacks/config.toml"
    )]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Mirror logs to stderr")]
    log: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Block whilst tracking time")]
    Record {
        #[command(flatten)]
        command: RecordCommand,
    },
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let logging_level = if args.log {
        Some(LevelFilter::TRACE)
    } else {
        None
    };
    enable_logging(
        CLI_PREFIX,
        &create_application_default_path()?,
        logging_level,
        args.log,
    )?;

    let config = load_config(args.config.as_deref())?;

    match args.commands {
        None => {
            info!("Loaded {config:?}");
            println!("Configuration is valid");
            Ok(())
        }
        Some(Commands::Record { command }) => process_record_command(command, config).await,
    }
}

/// Loads and validates configuration before anything touches the store.
fn load_config(path: Option<&Path>) -> Result<Config, Error> {
    let LoadedConfig { raw, file } = RawConfig::load(path)?;
    if let Some(file) = file {
        eprintln!("Using config file: {}", file.display());
    }
    Ok(raw.validate()?)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Args, Commands};

    #[test]
    fn parses_record_flags() {
        let args = Args::parse_from([
            "tacks",
            "--config",
            "/tmp/tacks.toml",
            "record",
            "--description",
            "planning",
            "--tag",
            "a",
            "--tag",
            "b,c",
            "--attr",
            "env:prod",
            "--log",
        ]);

        assert!(args.log);
        assert_eq!(args.config.unwrap().to_str(), Some("/tmp/tacks.toml"));
        let Some(Commands::Record { command }) = args.commands else {
            panic!("expected record command");
        };
        let draft = command.into_draft().unwrap();
        assert_eq!(draft.description, "planning");
        assert_eq!(draft.tags, vec!["a", "b", "c"]);
        assert_eq!(draft.attrs["env"], "prod");
    }

    #[test]
    fn record_flags_default_to_empty() {
        let args = Args::parse_from(["tacks", "record"]);
        let Some(Commands::Record { command }) = args.commands else {
            panic!("expected record command");
        };
        let draft = command.into_draft().unwrap();
        assert!(draft.description.is_empty());
        assert!(draft.tags.is_empty());
        assert!(draft.attrs.is_empty());

        assert!(Args::parse_from(["tacks"]).commands.is_none());
    }
}
