use std::fs::read_to_string;
use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

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
    ///
    /// Log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
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
pub struct Overlay {
    ///
    /// Bind address
    ///
    /// The UDP socket address the node listens on. Every engine of the
    /// overlay shares this one socket.
    ///
    #[serde(default = "Overlay::listen")]
    pub listen: SocketAddr,
    ///
    /// Globally reachable
    ///
    /// Declare this node directly reachable from the internet, skipping
    /// NAT detection. Only set this on nodes with a public address.
    ///
    #[serde(default)]
    pub global: bool,
    ///
    /// Bootstrap endpoint
    ///
    /// An existing overlay node to join through. A node started without
    /// one waits for others to join it instead.
    ///
    #[serde(default)]
    pub bootstrap: Option<SocketAddr>,
    ///
    /// Node identifier override
    ///
    /// 40 hex digits. Useful for stable identities across restarts;
    /// omitted, the node draws a random identifier per run.
    ///
    #[serde(default)]
    pub id: Option<String>,
}

impl Overlay {
    fn listen() -> SocketAddr {
        "0.0.0.0:30800".parse().expect("default listen address")
    }
}

impl Default for Overlay {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            global: false,
            bootstrap: None,
            id: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub overlay: Overlay,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to a JSON5 configuration file.
    #[arg(long, env = "WARREN_CONFIG")]
    config: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();
        match cli.config {
            Some(path) => Ok(serde_json5::from_str(&read_to_string(&path)?)?),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kebab_case_json5() {
        let config: Config = serde_json5::from_str(
            r#"{
                overlay: {
                    listen: "127.0.0.1:31000",
                    global: true,
                    bootstrap: "198.51.100.1:30800",
                },
                log: { level: "debug" },
            }"#,
        )
        .unwrap();

        assert!(config.overlay.global);
        assert_eq!(config.overlay.listen.port(), 31000);
        assert_eq!(config.log.level, LogLevel::Debug);
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let config: Config = serde_json5::from_str("{}").unwrap();
        assert!(!config.overlay.global);
        assert!(config.overlay.bootstrap.is_none());
        assert_eq!(config.log.level, LogLevel::Info);
    }
}
