#[cfg(target_os = "linux")]
pub mod commands;

use crate::config::Config;
use crate::mac::MacAddr;
use crate::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "flowlat")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Attach a tc latency probe to a network interface and stream its events", long_about = None)]
pub struct Cli {
    #[arg(short, long, help = "Interface to attach to [default: eth0]")]
    pub iface: Option<String>,

    #[arg(short, long, help = "Source hardware address written into the probe [default: 00:00:00:00:00:00]")]
    pub mac: Option<MacAddr>,

    #[arg(short, long, help = "YAML configuration file")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Probe object to load instead of the default")]
    pub object: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,
}

impl Cli {
    /// Load the config file, if any, and apply flag overrides on top.
    pub fn resolve_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(iface) = &self.iface {
            config.interface = iface.clone();
        }
        if let Some(mac) = self.mac {
            config.mac = mac;
        }
        if let Some(object) = &self.object {
            config.object_path = Some(object.clone());
        }

        config.validate()?;
        Ok(config)
    }
}
