//! Session options consumed by the agent channel

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_MAX_CLIPBOARD: i64 = 100 * 1024 * 1024;

/// Environment variable overriding `max_clipboard`, read once at startup.
pub const MAX_CLIPBOARD_ENV: &str = "SPICE_MAX_CLIPBOARD";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid port redirection {0:?}, expected [bind:]port:host:host_port")]
    InvalidRedirection(String),

    #[error("invalid display color depth {0}, expected 0, 8, 16, 24 or 32")]
    InvalidColorDepth(u32),

    #[error("invalid max clipboard {0}, expected -1 or a non-negative size")]
    InvalidMaxClipboard(i64),
}

/// One `[bind:]port:host:host_port` redirection entry, replayed whenever
/// the agent (re)connects.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct PortRedirection {
    pub bind_address: Option<String>,
    pub port: u16,
    pub host: String,
    pub host_port: u16,
}

impl FromStr for PortRedirection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::InvalidRedirection(s.to_string());
        let parts: Vec<&str> = s.split(':').collect();

        let (bind_address, port, host, host_port) = match parts.as_slice() {
            [port, host, host_port] => (None, port, host, host_port),
            [bind, port, host, host_port] => (Some(bind.to_string()), port, host, host_port),
            _ => return Err(bad()),
        };

        if host.is_empty() {
            return Err(bad());
        }

        Ok(Self {
            bind_address,
            port: port.parse().map_err(|_| bad())?,
            host: host.to_string(),
            host_port: host_port.parse().map_err(|_| bad())?,
        })
    }
}

impl TryFrom<String> for PortRedirection {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for PortRedirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(bind) = &self.bind_address {
            write!(f, "{bind}:")?;
        }
        write!(f, "{}:{}:{}", self.port, self.host, self.host_port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Largest clipboard transfer accepted or offered, in octets. `-1`
    /// means unlimited.
    pub max_clipboard: i64,
    pub disable_display_position: bool,
    pub disable_display_align: bool,
    /// 0 leaves the guest color depth alone.
    pub display_color_depth: u32,
    pub disable_wallpaper: bool,
    pub disable_font_smooth: bool,
    pub disable_animation: bool,
    pub redirected_remote_ports: Vec<PortRedirection>,
    pub redirected_local_ports: Vec<PortRedirection>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_clipboard: DEFAULT_MAX_CLIPBOARD,
            disable_display_position: false,
            disable_display_align: false,
            display_color_depth: 0,
            disable_wallpaper: false,
            disable_font_smooth: false,
            disable_animation: false,
            redirected_remote_ports: Vec::new(),
            redirected_local_ports: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.display_color_depth, 0 | 8 | 16 | 24 | 32) {
            return Err(ConfigError::InvalidColorDepth(self.display_color_depth));
        }
        if self.max_clipboard < -1 {
            return Err(ConfigError::InvalidMaxClipboard(self.max_clipboard));
        }
        Ok(())
    }

    /// Apply the `SPICE_MAX_CLIPBOARD` override if present.
    pub fn apply_env(mut self) -> Self {
        if let Ok(raw) = std::env::var(MAX_CLIPBOARD_ENV) {
            match raw.parse::<i64>() {
                Ok(max) if max >= -1 => self.max_clipboard = max,
                _ => warn!(value = %raw, "ignoring unparsable {MAX_CLIPBOARD_ENV}"),
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirection_without_bind_address() {
        let redir: PortRedirection = "2222:127.0.0.1:22".parse().unwrap();

        assert_eq!(
            redir,
            PortRedirection {
                bind_address: None,
                port: 2222,
                host: "127.0.0.1".to_string(),
                host_port: 22,
            }
        );
    }

    #[test]
    fn redirection_with_bind_address() {
        let redir: PortRedirection = "*:8080:localhost:80".parse().unwrap();

        assert_eq!(redir.bind_address.as_deref(), Some("*"));
        assert_eq!(redir.port, 8080);
        assert_eq!(redir.to_string(), "*:8080:localhost:80");
    }

    #[test]
    fn malformed_redirections_are_rejected() {
        for bad in ["", "80", "80:host", "x:host:80", "80::22", "a:b:c:d:e"] {
            assert!(
                bad.parse::<PortRedirection>().is_err(),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = SessionConfig::default();

        assert_eq!(config.max_clipboard, DEFAULT_MAX_CLIPBOARD);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn color_depth_is_validated() {
        let config = SessionConfig {
            display_color_depth: 15,
            ..Default::default()
        };

        assert_eq!(config.validate(), Err(ConfigError::InvalidColorDepth(15)));
    }

    #[test]
    fn env_overrides_max_clipboard() {
        std::env::set_var(MAX_CLIPBOARD_ENV, "-1");
        let config = SessionConfig::default().apply_env();
        std::env::remove_var(MAX_CLIPBOARD_ENV);

        assert_eq!(config.max_clipboard, -1);
    }

    #[test]
    fn config_deserializes_redirections() {
        let json = r#"{
            "max_clipboard": 1024,
            "redirected_remote_ports": ["2222:127.0.0.1:22"]
        }"#;

        let config: SessionConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.max_clipboard, 1024);
        assert_eq!(config.redirected_remote_ports.len(), 1);
        assert_eq!(config.redirected_remote_ports[0].port, 2222);
    }
}
