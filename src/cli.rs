use std::{net::SocketAddr, path::PathBuf};

use anyhow::Result;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};

use crate::config::Settings;

const CONFIG: &str = "CONFIG_FILE";
const LOG_PATH: &str = "LOG_PATH";
const LISTEN: &str = "LISTEN_ADDR";
const GRACE_PERIOD: &str = "GRACE_PERIOD_MS";
const BACKFILL: &str = "BACKFILL";

pub fn command() -> Command {
    Command::new(clap::crate_name!())
        .version(clap::crate_version!())
        .about(clap::crate_description!())
        .arg(
            Arg::new(CONFIG)
                .long("config")
                .short('c')
                .value_parser(value_parser!(PathBuf))
                .help("path to TOML file with settings"),
        )
        .arg(
            Arg::new(LOG_PATH)
                .long("path")
                .short('p')
                .value_parser(value_parser!(PathBuf))
                .help("path to miner log file that is possibly rotated"),
        )
        .arg(
            Arg::new(LISTEN)
                .long("listen")
                .short('l')
                .value_parser(value_parser!(SocketAddr))
                .help("address to serve metrics on"),
        )
        .arg(
            Arg::new(GRACE_PERIOD)
                .long("grace-period-ms")
                .value_parser(value_parser!(u64))
                .help("pause before reopening the log file after rotation"),
        )
        .arg(
            Arg::new(BACKFILL)
                .long("backfill")
                .action(ArgAction::SetTrue)
                .help("read content already present in the log file on startup"),
        )
}

/// Merge settings from optional config file with values given on the command line. Command line wins.
pub fn settings_from_matches(matches: &ArgMatches) -> Result<Settings> {
    let mut settings = match matches.get_one::<PathBuf>(CONFIG) {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    if let Some(path) = matches.get_one::<PathBuf>(LOG_PATH) {
        settings.log_path = path.clone();
    }
    if let Some(addr) = matches.get_one::<SocketAddr>(LISTEN) {
        settings.listen_addr = *addr;
    }
    if let Some(grace_period_ms) = matches.get_one::<u64>(GRACE_PERIOD) {
        settings.grace_period_ms = *grace_period_ms;
    }
    if matches.get_flag(BACKFILL) {
        settings.start_at_end = false;
    }

    settings.validate()?;
    Ok(settings)
}
