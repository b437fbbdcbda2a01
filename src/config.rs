use std::{fs::read_to_string, net::SocketAddr};

use anyhow::Result;
use clap::Parser;
use codec::message::{ComponentIdentity, ComponentType};
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    ///
    /// control channel listen address
    ///
    /// The address and port the RSPRO TCP server binds to. SIM clients
    /// and SIM banks dial this endpoint.
    ///
    #[serde(default = "Server::listen")]
    pub listen: SocketAddr,
}

impl Server {
    fn listen() -> SocketAddr {
        "0.0.0.0:9998".parse().unwrap()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Bankd {
    ///
    /// bank data-plane port
    ///
    /// The TCP port on which every SIM bank serves its card data plane.
    /// This is the port pushed to clients together with the bank address
    /// when a mapping becomes active.
    ///
    #[serde(default = "Bankd::port")]
    pub port: u16,
}

impl Bankd {
    fn port() -> u16 {
        9999
    }
}

impl Default for Bankd {
    fn default() -> Self {
        Self { port: Self::port() }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Api {
    ///
    /// admin api listen address
    ///
    /// The http server used to create and remove slot mappings and to
    /// inspect connected peers.
    ///
    /// Warn: This http server does not contain any means of
    /// authentication, and sensitive information and dangerous
    /// operations can be reached through this service, please do not
    /// expose it directly to an unsafe environment.
    ///
    #[serde(default = "Api::listen")]
    pub listen: SocketAddr,
}

impl Api {
    fn listen() -> SocketAddr {
        "127.0.0.1:9997".parse().unwrap()
    }
}

impl Default for Api {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Identity {
    ///
    /// component name announced in handshake responses.
    ///
    #[serde(default = "Identity::name")]
    pub name: String,

    #[serde(default = "Identity::sw_version")]
    pub sw_version: String,

    #[serde(default = "Identity::hw_version")]
    pub hw_version: String,
}

impl Identity {
    fn name() -> String {
        "remsim-server".to_string()
    }

    fn sw_version() -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn hw_version() -> String {
        "unknown".to_string()
    }

    pub fn to_component(&self) -> ComponentIdentity {
        ComponentIdentity {
            kind: ComponentType::Server,
            name: self.name.clone(),
            sw_version: self.sw_version.clone(),
            hw_version: self.hw_version.clone(),
        }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            name: Self::name(),
            sw_version: Self::sw_version(),
            hw_version: Self::hw_version(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
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

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Log {
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub bankd: Bankd,
    #[serde(default)]
    pub api: Api,
    #[serde(default)]
    pub identity: Identity,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// specify the configuration file path.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => serde_json5::from_str(&read_to_string(path)?)?,
            None => Self::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen.port(), 9998);
        assert_eq!(config.bankd.port, 9999);
        assert_eq!(config.api.listen.port(), 9997);
        assert_eq!(config.identity.to_component().kind, ComponentType::Server);
    }

    #[test]
    fn parse_partial_file() {
        let config: Config = serde_json5::from_str(
            r#"{
                server: { listen: "127.0.0.1:19998" },
                bankd: { port: 4444 },
                log: { level: "Debug" },
            }"#,
        )
        .unwrap();

        assert_eq!(config.server.listen.port(), 19998);
        assert_eq!(config.bankd.port, 4444);
        assert_eq!(config.log.level.as_level(), log::Level::Debug);
        // untouched sections keep their defaults.
        assert_eq!(config.api.listen.port(), 9997);
    }
}
