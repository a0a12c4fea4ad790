use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const ICE_SERVERS_ENV: &str = "TANDEM_ICE_SERVERS";
pub const MAX_BUFFERED_AMOUNT_ENV: &str = "TANDEM_MAX_BUFFERED_AMOUNT";

/// Default high-water mark reported to data channel buffering callbacks (16 MiB).
pub const DEFAULT_MAX_BUFFERED_AMOUNT: u64 = 0x0100_0000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Settings the coordinator hands to the native session and applies to its
/// data channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ice_servers: Vec<IceServer>,
    pub max_buffered_amount: u64,
    /// Retransmit budget for channels created with `reliable = false`.
    pub unreliable_max_retransmits: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::new("stun:stun.l.google.com:19302")],
            max_buffered_amount: DEFAULT_MAX_BUFFERED_AMOUNT,
            unreliable_max_retransmits: 0,
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SessionConfig =
            serde_json::from_str(json).map_err(|e| Error::config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `TANDEM_ICE_SERVERS` and `TANDEM_MAX_BUFFERED_AMOUNT`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = read_env(ICE_SERVERS_ENV)? {
            config.ice_servers = parse_ice_server_list(&value)?;
        }
        if let Some(value) = read_env(MAX_BUFFERED_AMOUNT_ENV)? {
            config.max_buffered_amount = value.trim().parse().map_err(|_| {
                Error::config(format!("{MAX_BUFFERED_AMOUNT_ENV} must be an integer, got '{value}'"))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_buffered_amount == 0 {
            return Err(Error::config("max_buffered_amount must be non-zero"));
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(Error::config("ICE server entry has no URLs"));
            }
            for url in &server.urls {
                if !is_ice_url(url) {
                    return Err(Error::config(format!(
                        "unsupported ICE server URL '{url}': expected stun:, stuns:, turn: or turns:"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn read_env(name: &str) -> Result<Option<String>> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::config(format!("failed to read {name}: {e}"))),
    }
}

fn is_ice_url(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    ["stun:", "stuns:", "turn:", "turns:"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
}

fn parse_ice_server_list(value: &str) -> Result<Vec<IceServer>> {
    let servers: Vec<IceServer> = value
        .split([',', ';'])
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(IceServer::new)
        .collect();

    if servers.is_empty() {
        return Err(Error::config(format!(
            "{ICE_SERVERS_ENV} is set but no usable URLs were found"
        )));
    }
    Ok(servers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_buffered_amount, DEFAULT_MAX_BUFFERED_AMOUNT);
    }

    #[test]
    fn test_parse_ice_server_list_multiple_entries() {
        let servers =
            parse_ice_server_list("stun:a.example:3478; turn:b.example:3478,").unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].urls, vec!["turn:b.example:3478".to_string()]);
    }

    #[test]
    fn test_parse_ice_server_list_rejects_empty() {
        assert!(parse_ice_server_list(" , ;").is_err());
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = SessionConfig::from_json(r#"{"unreliable_max_retransmits": 3}"#).unwrap();
        assert_eq!(config.unreliable_max_retransmits, 3);
        assert_eq!(config.max_buffered_amount, DEFAULT_MAX_BUFFERED_AMOUNT);
        assert_eq!(config.ice_servers, SessionConfig::default().ice_servers);
    }

    #[test]
    fn test_from_json_rejects_bad_url() {
        let err = SessionConfig::from_json(r#"{"ice_servers": [{"urls": ["http://x"]}]}"#);
        assert!(matches!(err, Err(Error::Config(_))));
    }
}
