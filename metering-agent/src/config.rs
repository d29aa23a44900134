use anyhow::Context;
use serde::Deserialize;
use std::{env, fs, io, net::SocketAddr};

/// Development-only secret; every deployed agent must override it.
pub const DEFAULT_SHARED_SECRET: &str = "dev-secret-key";
pub const DEFAULT_CONFIG_PATH: &str = "metering-agent.toml";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    /// File-backed, survives restarts.
    Sqlite,
    /// Process memory only; lost on exit.
    Memory,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerConfig {
    pub kind: LedgerKind,
    pub path: String,
    pub max_connections: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            kind: LedgerKind::Sqlite,
            path: "metering.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SigningConfig {
    pub shared_secret: String,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            shared_secret: DEFAULT_SHARED_SECRET.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmissionConfig {
    /// Value placed in `context.bpp_id` of outbound envelopes.
    pub sender_id: String,
    pub timeout_secs: u64,
    /// Extra attempts after the first; 0 keeps delivery at-most-once.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for EmissionConfig {
    fn default() -> Self {
        Self {
            sender_id: "metering.agent.example".to_string(),
            timeout_secs: 10,
            max_retries: 0,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Reject inbound messages that carry no signature instead of storing
    /// them as unverified.
    pub require_signature: bool,
    pub reject_negative_kwh: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub ledger: LedgerConfig,
    pub signing: SigningConfig,
    pub emission: EmissionConfig,
    pub validation: ValidationConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    /// Load `METERING_CONFIG` (or `metering-agent.toml` when present), then
    /// apply environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let explicit = env::var("METERING_CONFIG").ok();
        let path = explicit.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let mut cfg = match fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml(&contents).with_context(|| format!("invalid config file {path}"))?,
            Err(e) if explicit.is_none() && e.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e).with_context(|| format!("failed to read config file {path}")),
        };

        cfg.apply_env_overrides(|key| env::var(key).ok())?;
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Overrides: `METERING_SHARED_SECRET`, `PORT`, `METER_DB`,
    /// `METERING_REQUIRE_SIGNATURE`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup("METERING_SHARED_SECRET") {
            self.signing.shared_secret = secret;
        }

        if let Some(port) = lookup("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("invalid PORT '{port}'"))?;
            let mut addr = self.bind_socket_addr()?;
            addr.set_port(port);
            self.server.bind_addr = addr.to_string();
        }

        if let Some(path) = lookup("METER_DB") {
            self.ledger.path = path;
        }

        if let Some(flag) = lookup("METERING_REQUIRE_SIGNATURE") {
            self.validation.require_signature = parse_flag(&flag)
                .with_context(|| format!("invalid METERING_REQUIRE_SIGNATURE '{flag}'"))?;
        }

        Ok(())
    }

    pub fn bind_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid server.bind_addr '{}': {e}", self.server.bind_addr))
    }

    pub fn uses_default_secret(&self) -> bool {
        self.signing.shared_secret == DEFAULT_SHARED_SECRET
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_without_a_file() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.bind_addr, "0.0.0.0:8000");
        assert_eq!(cfg.ledger.kind, LedgerKind::Sqlite);
        assert_eq!(cfg.ledger.path, "metering.db");
        assert_eq!(cfg.emission.timeout_secs, 10);
        assert_eq!(cfg.emission.max_retries, 0);
        assert!(!cfg.validation.require_signature);
        assert!(cfg.metrics.is_none());
        assert!(cfg.uses_default_secret());
    }

    #[test]
    fn partial_toml_keeps_defaults_for_missing_sections() {
        let cfg = AppConfig::from_toml(
            r#"
            [ledger]
            kind = "memory"

            [emission]
            max_retries = 2

            [metrics]
            bind_addr = "127.0.0.1:9100"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.ledger.kind, LedgerKind::Memory);
        assert_eq!(cfg.ledger.path, "metering.db");
        assert_eq!(cfg.emission.max_retries, 2);
        assert_eq!(cfg.emission.timeout_secs, 10);
        assert_eq!(cfg.metrics.unwrap().bind_addr, "127.0.0.1:9100");
    }

    #[test]
    fn environment_overrides_take_precedence() {
        let env: HashMap<&str, &str> = [
            ("METERING_SHARED_SECRET", "prod-secret"),
            ("PORT", "9000"),
            ("METER_DB", "/var/lib/metering/ledger.db"),
            ("METERING_REQUIRE_SIGNATURE", "true"),
        ]
        .into_iter()
        .collect();

        let mut cfg = AppConfig::default();
        cfg.apply_env_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(cfg.signing.shared_secret, "prod-secret");
        assert!(!cfg.uses_default_secret());
        assert_eq!(cfg.server.bind_addr, "0.0.0.0:9000");
        assert_eq!(cfg.ledger.path, "/var/lib/metering/ledger.db");
        assert!(cfg.validation.require_signature);
    }

    #[test]
    fn invalid_port_is_an_error() {
        let mut cfg = AppConfig::default();
        let res = cfg.apply_env_overrides(|k| (k == "PORT").then(|| "eighty".to_string()));
        assert!(res.is_err());
    }
}
