use std::{collections::HashMap, fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::Result;
use base64::prelude::{BASE64_STANDARD, Engine};
use bytes::Bytes;
use clap::Parser;
use serde::Deserialize;
use service::session::{MaxIdle, Mode, SessionOptions};

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Switch {
    ///
    /// forwarding mode
    ///
    /// "hub" floods everything, "normal" defers to the datapath's own L2
    /// bridge, "learn" runs source-address learning in the controller.
    ///
    #[serde(default = "Switch::mode")]
    pub mode: Mode,
    ///
    /// exact flow matches
    ///
    /// when set, installed flows match every header field of the packet
    /// instead of only the Ethernet addresses, VLAN and ingress port.
    ///
    #[serde(default)]
    pub exact_flows: bool,
    ///
    /// flow idle timeout
    ///
    /// seconds of inactivity after which an installed flow expires.
    /// "permanent" installs flows that never expire, "never" disables flow
    /// installation so that every packet is escalated to the controller.
    ///
    #[serde(default = "Switch::max_idle")]
    pub max_idle: MaxIdle,
    ///
    /// default output queue
    ///
    /// the queue packets are classified into when their ingress port has
    /// no binding. when absent, unbound ports emit plain output actions.
    ///
    #[serde(default)]
    pub default_queue: Option<u32>,
    ///
    /// per-port output queues
    ///
    /// map from port name (as the datapath announces it) to queue id.
    /// names are resolved to port numbers from the features reply.
    ///
    #[serde(default)]
    pub port_queues: HashMap<String, u32>,
    ///
    /// startup flows
    ///
    /// base64-encoded, pre-serialized OpenFlow messages sent verbatim on
    /// every new connection, right after the handshake.
    ///
    #[serde(default)]
    pub default_flows: Vec<String>,
}

impl Switch {
    fn mode() -> Mode {
        Mode::Learn
    }

    fn max_idle() -> MaxIdle {
        MaxIdle::Seconds(60)
    }
}

impl Default for Switch {
    fn default() -> Self {
        Self {
            mode: Self::mode(),
            exact_flows: false,
            max_idle: Self::max_idle(),
            default_queue: None,
            port_queues: Default::default(),
            default_flows: Default::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Controller {
    ///
    /// controller listen address
    ///
    /// the address and port datapaths connect to. each accepted
    /// connection gets its own switch session.
    ///
    #[serde(default = "Controller::listen")]
    pub listen: SocketAddr,
}

impl Controller {
    fn listen() -> SocketAddr {
        "0.0.0.0:6633".parse().unwrap()
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
        }
    }
}

/// Verbosity threshold, most to least severe.
#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    /// The equivalent `log` facade level.
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
    /// lowest severity that is written out. rate-limited debug lines from
    /// the sessions only appear at "debug" and below.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub switch: Switch,
    #[serde(default)]
    pub controller: Controller,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// configuration file path
    ///
    /// Example: lswitch --config /etc/lswitch/config.toml
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    /// Parse the command line; read the TOML file it names, or fall back
    /// to the built-in defaults when no file is given.
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => toml::from_str(&read_to_string(&path)?)?,
            None => Self::default(),
        })
    }

    /// The per-connection session configuration, with the startup flows
    /// decoded.
    pub fn session_options(&self) -> Result<SessionOptions> {
        let mut default_flows = Vec::with_capacity(self.switch.default_flows.len());
        for encoded in &self.switch.default_flows {
            default_flows.push(Bytes::from(BASE64_STANDARD.decode(encoded)?));
        }

        Ok(SessionOptions {
            mode: self.switch.mode,
            exact_flows: self.switch.exact_flows,
            max_idle: self.switch.max_idle,
            default_queue: self.switch.default_queue,
            port_queues: self
                .switch
                .port_queues
                .iter()
                .map(|(name, queue_id)| (name.clone(), *queue_id))
                .collect(),
            default_flows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(
            r#"
            [switch]
            mode = "learn"
            exact-flows = true
            max-idle = "permanent"
            default-queue = 3
            port-queues = { eth0 = 7 }

            [controller]
            listen = "127.0.0.1:6653"

            [log]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.switch.mode, Mode::Learn);
        assert!(config.switch.exact_flows);
        assert_eq!(config.switch.max_idle, MaxIdle::Permanent);
        assert_eq!(config.switch.port_queues.get("eth0"), Some(&7));
        assert_eq!(config.controller.listen.port(), 6653);
    }

    #[test]
    fn max_idle_accepts_seconds_and_never() {
        let config: Config = toml::from_str("[switch]\nmax-idle = 120\n").unwrap();
        assert_eq!(config.switch.max_idle, MaxIdle::Seconds(120));

        let config: Config = toml::from_str("[switch]\nmax-idle = \"never\"\n").unwrap();
        assert_eq!(config.switch.max_idle, MaxIdle::Never);
    }

    #[test]
    fn defaults_stand_in_for_missing_sections() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.switch.mode, Mode::Learn);
        assert_eq!(config.switch.max_idle, MaxIdle::Seconds(60));
        assert_eq!(config.controller.listen.port(), 6633);
    }

    #[test]
    fn default_flows_decode_from_base64() {
        let mut config = Config::default();
        config.switch.default_flows = vec![BASE64_STANDARD.encode([1u8, 14, 0, 8, 0, 0, 0, 1])];

        let options = config.session_options().unwrap();
        assert_eq!(options.default_flows[0].as_ref(), &[1, 14, 0, 8, 0, 0, 0, 1]);
    }
}
