use std::{fs::read_to_string, net::SocketAddr};

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(tag = "role", rename_all = "kebab-case")]
pub enum Bridge {
    /// Accept bridge connections from other zones.
    Listen {
        listen: SocketAddr,
        ///
        /// Reply timeout
        ///
        /// A call suspended on a peer's reply is cancelled when no
        /// answer arrives within this many seconds.
        #[serde(default = "Bridge::timeout")]
        timeout: u64,
    },
    /// Open a bridge connection towards another zone.
    Connect {
        connect: SocketAddr,
        ///
        /// The zone id expected at the other end of this bridge. The
        /// connection is refused when the peer announces anything else.
        destination_zone: u64,
        #[serde(default = "Bridge::timeout")]
        timeout: u64,
    },
}

impl Bridge {
    fn timeout() -> u64 {
        20
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct ZoneConfig {
    ///
    /// The id of the zone this process hosts. Zone ids are assigned by
    /// the operator and must be unique across the whole topology; id
    /// zero is reserved.
    pub id: u64,
    ///
    /// Diagnostic label carried in log lines.
    ///
    #[serde(default = "ZoneConfig::name")]
    pub name: String,
}

impl ZoneConfig {
    fn name() -> String {
        "zone".to_string()
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default = "Log::level")]
    pub level: LogLevel,
}

impl Log {
    fn level() -> LogLevel {
        LogLevel::Info
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: Self::level(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub zone: ZoneConfig,
    #[serde(default)]
    pub bridges: Vec<Bridge>,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Path of the configuration file, a json5 document.
    #[arg(long, short, env = "ZONE_RPC_CONFIG")]
    config: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();
        Ok(serde_json5::from_str(&read_to_string(&cli.config)?)?)
    }
}
