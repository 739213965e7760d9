use anyhow::{anyhow, Context, Result};
use std::{fs, time};

use serde::Deserialize;

use crate::CommandLineConf;

#[derive(Deserialize)]
struct RawConfig {
    iface: Option<String>,
    search_target: Option<String>,
    mx: Option<u8>,
    timeout: Option<u64>,
    verbose: Option<u8>,
}

pub struct Config {
    pub iface: String,
    pub search_target: String,
    pub mx: u8,
    pub timeout: time::Duration,
    pub verbose: log::LevelFilter,
}

impl TryFrom<CommandLineConf> for Config {
    type Error = anyhow::Error;

    fn try_from(args: CommandLineConf) -> std::result::Result<Self, Self::Error> {
        get_config(args)
    }
}

fn get_config(args: CommandLineConf) -> Result<Config> {
    let config_as_file = args
        .config
        .map(|file| fs::read_to_string(file).context("Could not open/read config file."))
        .transpose()?;

    let (iface, search_target, mx, timeout, verbose) = if let Some(config_file) = config_as_file {
        let raw_config: RawConfig =
            toml::from_str(&config_file).context("failed to parse config file.")?;

        let iface = args
            .iface
            .or(raw_config.iface)
            .ok_or_else(|| anyhow!("Missing --iface (or `iface` in config file)"))?;

        let search_target = args
            .search_target
            .or(raw_config.search_target)
            .unwrap_or_else(|| "ssdp:all".to_string());

        let mx = args.mx.or(raw_config.mx).unwrap_or(3);
        let timeout = time::Duration::from_secs(args.timeout.or(raw_config.timeout).unwrap_or(5));
        let verbose = verbosity_from(args.verbose.max(raw_config.verbose.unwrap_or(0)));

        (iface, search_target, mx, timeout, verbose)
    } else {
        let iface = args
            .iface
            .ok_or_else(|| anyhow!("Missing --iface (or pass --config)"))?;
        let search_target = args.search_target.unwrap_or_else(|| "ssdp:all".to_string());
        let mx = args.mx.unwrap_or(3);
        let timeout = time::Duration::from_secs(args.timeout.unwrap_or(5));
        let verbose = verbosity_from(args.verbose);

        (iface, search_target, mx, timeout, verbose)
    };

    Ok(Config {
        iface,
        search_target,
        mx,
        timeout,
        verbose,
    })
}

fn verbosity_from(count: u8) -> log::LevelFilter {
    match count {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}
