//! Command line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::server::RelaySettings;

/// Meeting signaling and chat relay
#[derive(Debug, Clone, Parser)]
#[command(name = "meeting_relay", version, about)]
pub struct Config {
    /// Address to listen on
    #[arg(env = "RELAY_ADDR", default_value = "127.0.0.1:8080")]
    pub addr: String,

    /// Seconds a candidate may wait for the admin's decision
    #[arg(long, env = "RELAY_ADMISSION_TIMEOUT_SECS", default_value_t = 60)]
    pub admission_timeout_secs: u64,

    /// Close active connections silent for this many seconds (0 disables)
    #[arg(long, env = "RELAY_IDLE_TIMEOUT_SECS", default_value_t = 0)]
    pub idle_timeout_secs: u64,

    /// Whether broadcasts skip the peer that sent them
    #[arg(long, env = "RELAY_EXCLUDE_SENDER", default_value_t = true, action = ArgAction::Set)]
    pub exclude_sender: bool,

    /// Append chat messages to this JSON lines file (logged only if unset)
    #[arg(long, env = "RELAY_CHAT_LOG")]
    pub chat_log: Option<PathBuf>,

    /// Per-peer outbound queue capacity
    #[arg(long, env = "RELAY_OUTBOUND_BUFFER", default_value_t = 256)]
    pub outbound_buffer: usize,
}

impl Config {
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            admission_timeout: Duration::from_secs(self.admission_timeout_secs),
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            exclude_sender: self.exclude_sender,
            outbound_buffer: self.outbound_buffer.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["meeting_relay"]).unwrap();
        let settings = config.relay_settings();

        assert_eq!(config.addr, "127.0.0.1:8080");
        assert_eq!(settings.admission_timeout, Duration::from_secs(60));
        assert!(settings.idle_timeout.is_none());
        assert!(settings.exclude_sender);
        assert!(config.chat_log.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::try_parse_from([
            "meeting_relay",
            "0.0.0.0:9000",
            "--admission-timeout-secs",
            "5",
            "--idle-timeout-secs",
            "30",
            "--exclude-sender",
            "false",
            "--chat-log",
            "/tmp/chat.jsonl",
        ])
        .unwrap();
        let settings = config.relay_settings();

        assert_eq!(config.addr, "0.0.0.0:9000");
        assert_eq!(settings.admission_timeout, Duration::from_secs(5));
        assert_eq!(settings.idle_timeout, Some(Duration::from_secs(30)));
        assert!(!settings.exclude_sender);
        assert_eq!(config.chat_log, Some(PathBuf::from("/tmp/chat.jsonl")));
    }
}
