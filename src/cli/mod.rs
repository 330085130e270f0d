pub mod commands;

use clap::{value_parser, Arg, ArgAction, Command};

use crate::config::DEFAULT_CONFIG_PATH;

pub use commands::{handle_subcommands, init_logging, run_fleet};

pub fn build_cli() -> Command {
    Command::new("sml-ingest")
        .version(crate::VERSION)
        .about("Reads SML telegrams from smart meters and stores them in SQLite")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .default_value(DEFAULT_CONFIG_PATH)
                .help("Configuration file"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (overrides general.log_level)"),
        )
        .subcommand(Command::new("run").about("Start all enabled meters (default)"))
        .subcommand(Command::new("ports").about("List available serial ports"))
        .subcommand(Command::new("check-config").about("Validate the configuration file"))
        .subcommand(
            Command::new("init-config")
                .about("Write an example configuration file")
                .arg(Arg::new("path").value_name("PATH").help("Target file (defaults to --config)"))
                .arg(
                    Arg::new("force")
                        .short('f')
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Overwrite an existing file"),
                ),
        )
        .subcommand(
            Command::new("tail")
                .about("Show store statistics and the latest readings of one meter")
                .arg(Arg::new("meter").required(true).help("Meter id"))
                .arg(
                    Arg::new("count")
                        .short('n')
                        .long("count")
                        .value_parser(value_parser!(usize))
                        .default_value("20")
                        .help("Number of rows"),
                ),
        )
}
