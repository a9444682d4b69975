//! This module implements the definition of the command line app.

use std::path::PathBuf;

use clap::{Arg, ArgAction, Command, value_parser};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "Courier aggregates metrics and sends telemetry to an ingestion endpoint.";

pub fn make_app() -> Command {
    Command::new("courier")
        .disable_help_subcommand(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .propagate_version(true)
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .long("config")
                .short('c')
                .global(true)
                .env("COURIER_CONFIG_PATH")
                .value_parser(value_parser!(PathBuf))
                .help("The path to the config folder."),
        )
        .subcommand(
            Command::new("run")
                .about("Aggregate metrics read from stdin and send them")
                .after_help(
                    "This reads one value per line from standard input until the input ends. \
                     Lines have the form `name value [dimension=value ...]`, or `trace message` \
                     to send a log message. Aggregates are sent to the configured endpoint.",
                )
                .arg(
                    Arg::new("endpoint")
                        .long("endpoint")
                        .value_name("URL")
                        .env("COURIER_ENDPOINT")
                        .help("The ingestion endpoint to send telemetry to."),
                )
                .arg(
                    Arg::new("log_level")
                        .long("log-level")
                        .value_name("LEVEL")
                        .env("COURIER_LOG_LEVEL")
                        .help("The log level of Courier, for example `debug`."),
                )
                .arg(
                    Arg::new("sending_interval")
                        .long("sending-interval-ms")
                        .value_name("MILLIS")
                        .help("The interval between regular transmissions."),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Manage the configuration")
                .subcommand_required(true)
                .arg_required_else_help(true)
                .subcommand(Command::new("show").about("Show the entire effective configuration"))
                .subcommand(
                    Command::new("init")
                        .about("Write a default configuration file")
                        .arg(
                            Arg::new("overwrite")
                                .long("overwrite")
                                .action(ArgAction::SetTrue)
                                .help("Replace an existing configuration file."),
                        ),
                ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_definition() {
        make_app().debug_assert();
    }

    #[test]
    fn test_run_arguments() {
        let matches = make_app()
            .try_get_matches_from([
                "courier",
                "run",
                "--config",
                "/etc/courier",
                "--endpoint",
                "http://localhost/track",
            ])
            .unwrap();

        assert_eq!(
            matches.get_one::<PathBuf>("config"),
            Some(&PathBuf::from("/etc/courier"))
        );
        let (name, run) = matches.subcommand().unwrap();
        assert_eq!(name, "run");
        assert_eq!(
            run.get_one::<String>("endpoint").map(String::as_str),
            Some("http://localhost/track")
        );
    }

    #[test]
    fn test_subcommand_required() {
        assert!(make_app().try_get_matches_from(["courier"]).is_err());
        assert!(make_app().try_get_matches_from(["courier", "config"]).is_err());
    }
}
