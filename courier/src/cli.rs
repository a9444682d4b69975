use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::ArgMatches;
use courier_config::{Config, OverridableConfig};

use crate::cliapp::make_app;
use crate::{pipeline, setup};

/// Configuration folder used when `--config` is not given.
const DEFAULT_CONFIG_DIR: &str = ".courier";

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let matches = make_app().get_matches();
    let config_path = matches.get_one::<PathBuf>("config").map(PathBuf::as_path);

    // Commands that do not need a loaded config.
    if let Some(("config", config_matches)) = matches.subcommand() {
        if let Some(("init", init_matches)) = config_matches.subcommand() {
            return init_config(config_path, init_matches);
        }
    }

    let mut config = load_config(config_path)?;

    if let Some(("run", run_matches)) = matches.subcommand() {
        config.apply_override(extract_config_args(run_matches))?;
    }

    courier_log::init(config.logging());

    match matches.subcommand() {
        Some(("run", _)) => run(config),
        Some(("config", config_matches)) => manage_config(&config, config_matches),
        _ => unreachable!(),
    }
}

/// Extracts config overrides from the arguments of the `run` command.
fn extract_config_args(matches: &ArgMatches) -> OverridableConfig {
    OverridableConfig {
        endpoint: matches.get_one("endpoint").cloned(),
        log_level: matches.get_one("log_level").cloned(),
        sending_interval_ms: matches.get_one("sending_interval").cloned(),
    }
}

/// Loads the config from the given folder, the default folder, or falls back to defaults.
fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG_DIR).join("config.yml").exists() => {
            Path::new(DEFAULT_CONFIG_DIR)
        }
        None => return Ok(Config::default()),
    };

    Config::from_path(path)
        .with_context(|| format!("failed to load config from {}", path.display()))
}

fn init_config(path: Option<&Path>, matches: &ArgMatches) -> Result<()> {
    let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_DIR));

    if path.join("config.yml").exists() && !matches.get_flag("overwrite") {
        bail!(
            "config already exists in {}, pass --overwrite to replace it",
            path.display()
        );
    }

    Config::default().save_in_folder(path)?;

    #[allow(clippy::print_stdout)]
    {
        println!("Wrote default config to {}", path.join("config.yml").display());
    }

    Ok(())
}

fn manage_config(config: &Config, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("show", _)) => {
            let yaml = config.to_yaml_string()?;

            #[allow(clippy::print_stdout)]
            {
                print!("{yaml}");
            }

            Ok(())
        }
        _ => unreachable!(),
    }
}

fn run(config: Config) -> Result<()> {
    setup::check_config(&config)?;
    setup::dump_spawn_infos(&config);
    setup::init_metrics(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("courier")
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;

    runtime.block_on(pipeline::run(config))
}
