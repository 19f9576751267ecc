//! MAST-F scan orchestration core.
//!
//! Runs a configurable set of scanner plugins over an uploaded mobile application. A scan
//! is prepared once (hashes verified, package unpacked and decompiled), then every selected
//! scanner runs as an isolated unit on a worker pool, reporting progress through an
//! [`observer::Observer`]. Results are stored per scan and scanner and rendered per result
//! category through the extension handlers each plugin declares.

#![forbid(
    overflowing_literals,
    unconditional_recursion,
    while_true,
    unused_comparisons,
    improper_ctypes,
    non_shorthand_field_patterns
)]
#![warn(
    unused_qualifications,
    unused_results,
    unused_import_braces,
    missing_debug_implementations
)]

#[macro_use]
extern crate failure_derive;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate lazy_static;

pub mod aggregate;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod filetree;
pub mod observer;
pub mod plugin;
pub mod preparation;
pub mod query;
pub mod registry;
pub mod scanners;
pub mod severity;
pub mod store;
pub mod tools;
pub mod upload;
pub mod utils;

use std::{env, io::Write, path::PathBuf};

use clap::ArgMatches;
use colored::Colorize;
use env_logger::Builder;
use failure::ResultExt;
use log::{Level, LevelFilter};

pub use crate::{config::Config, error::Kind};

/// Result type of the crate.
pub type Result<T> = std::result::Result<T, failure::Error>;

/// Loads the configuration and decorates it with the command line options.
///
/// The file given with `--config` wins. Otherwise `./config.toml` is used, then
/// `/etc/mastf/config.toml`, then the defaults.
pub fn initialize_config(cli: &ArgMatches<'_>) -> Result<Config> {
    let config_path = PathBuf::from("config.toml");
    let global_config_path = PathBuf::from("/etc/mastf/config.toml");

    let mut config = if let Some(path) = cli.value_of("config") {
        Config::from_file(path)
            .with_context(|_| format!("there was an error when reading `{}`", path))?
    } else if config_path.exists() {
        Config::from_file(&config_path)
            .context("there was an error when reading the config.toml file")?
    } else if cfg!(target_family = "unix") && global_config_path.exists() {
        Config::from_file(&global_config_path)
            .context("there was an error when reading the /etc/mastf/config.toml file")?
    } else {
        warn!("config file not found, using the default configuration");
        Config::default()
    };

    config
        .decorate_with_cli(cli)
        .context("there was an error reading the configuration from the CLI")?;
    if let (_, Some(sub)) = cli.subcommand() {
        config
            .decorate_with_cli(sub)
            .context("there was an error reading the configuration from the CLI")?;
    }

    Ok(config)
}

/// Initializes the logger.
///
/// `RUST_LOG` replaces the default filter, which shows debug messages of this crate in
/// verbose mode and informational messages otherwise.
pub fn initialize_logger(is_verbose: bool) {
    let mut builder = Builder::new();
    let _ = builder.format(|buf, record| match record.level() {
        Level::Warn => writeln!(
            buf,
            "{}{}",
            "Warning: ".bold().yellow(),
            record.args().to_string().yellow()
        ),
        Level::Error => writeln!(
            buf,
            "{}{}",
            "Error: ".bold().red(),
            record.args().to_string().red()
        ),
        Level::Debug => writeln!(
            buf,
            "{}{}",
            "Debug: ".bold(),
            record.args().to_string().bold()
        ),
        Level::Info => writeln!(buf, "{}", record.args()),
        Level::Trace => writeln!(buf, "{}: {}", record.level(), record.args()),
    });

    let _ = if let Ok(env_log) = env::var("RUST_LOG") {
        builder.parse_filters(&env_log)
    } else {
        let log_level = if is_verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        };
        builder.filter(Some("mastf"), log_level)
    };

    if let Err(e) = builder.try_init() {
        eprintln!("could not initialize logger: {}", e);
    }
}
