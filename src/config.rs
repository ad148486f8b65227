use std::{fs::read_to_string, net::SocketAddr, path::PathBuf};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    ///
    /// Open a port, publish its name, accept peers.
    ///
    #[default]
    Server,
    ///
    /// Read the published port name and reach the server.
    ///
    Client,
}

impl Role {
    pub fn as_role(&self) -> transport::Role {
        match *self {
            Self::Server => transport::Role::Server,
            Self::Client => transport::Role::Client,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Rma {
    ///
    /// One-sided operations expressed as two-sided messages, served by
    /// a worker task on the side exposing the memory.
    ///
    #[default]
    Emulated,
    ///
    /// One-sided operations carried as window frames and applied by
    /// the peer connection directly.
    ///
    Native,
}

impl Rma {
    pub fn as_mode(&self) -> transport::RmaMode {
        match *self {
            Self::Emulated => transport::RmaMode::Emulated,
            Self::Native => transport::RmaMode::Native,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Node {
    #[serde(default)]
    pub role: Role,
    ///
    /// node listen address
    ///
    /// The address and port the server binds its port to. Clients
    /// ignore this.
    ///
    #[serde(default = "Node::listen")]
    pub listen: SocketAddr,
    ///
    /// port name file
    ///
    /// The server writes the name of its port here; clients read it to
    /// find the server.
    ///
    #[serde(default = "Node::port_file")]
    pub port_file: PathBuf,
    #[serde(default)]
    pub rma: Rma,
}

impl Node {
    fn listen() -> SocketAddr {
        "127.0.0.1:4700".parse().unwrap()
    }

    fn port_file() -> PathBuf {
        "port.cfg".into()
    }
}

impl Default for Node {
    fn default() -> Self {
        Self {
            role: Role::default(),
            listen: Self::listen(),
            port_file: Self::port_file(),
            rma: Rma::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub node: Node,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: ferry-node --config /etc/ferry/config.toml
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => toml::from_str::<Self>(&read_to_string(path)?)?,
            None => Self::default(),
        })
    }
}
