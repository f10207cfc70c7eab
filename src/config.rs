use anyhow::{ensure, Result};
use figment::{providers::{Env, Format, Serialized, Toml}, Figment};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Upper bound for `ocpp.stale_after_minutes` (one week).
pub const MAX_STALE_AFTER_MINUTES: i64 = 7 * 24 * 60;

/// Placeholder shipped in `config/default.toml`; startup refuses it.
pub const GATEWAY_KEY_PLACEHOLDER: &str = "__SET_VIA_ENV__";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub ocpp: OcppConfig,
    pub authorization: AuthorizationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub enable_cors: bool,
    pub cors_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            request_timeout_secs: 60,
            enable_cors: false,
            cors_origin: None,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticToken {
    pub token: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret expected in `x-api-key` on device-gateway routes.
    pub gateway_api_key: String,
    /// Skip all REST authentication. Local development only.
    pub bypass: bool,
    /// External identity service that validates end-user bearer tokens.
    pub identity_url: Option<String>,
    /// Sessions accepted when no identity service is configured.
    pub static_tokens: Vec<StaticToken>,
}

impl AuthConfig {
    pub fn gateway_key_is_unset(&self) -> bool {
        self.gateway_api_key.trim().is_empty() || self.gateway_api_key == GATEWAY_KEY_PLACEHOLDER
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcppConfig {
    pub path: String,
    pub heartbeat_interval_secs: i32,
    pub stale_after_minutes: i64,
    pub sweep_interval_secs: u64,
    pub request_timeout_ms: u64,
    pub send_buffer: usize,
    pub max_message_bytes: usize,
    pub enable_validation: bool,
    pub event_buffer: usize,
}

impl Default for OcppConfig {
    fn default() -> Self {
        Self {
            path: "/ocpp".into(),
            heartbeat_interval_secs: 60,
            stale_after_minutes: 5,
            sweep_interval_secs: 60,
            request_timeout_ms: 30_000,
            send_buffer: 256,
            max_message_bytes: 64 * 1024,
            enable_validation: true,
            event_buffer: 1024,
        }
    }
}

impl OcppConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    pub blocked_id_tags: Vec<String>,
    pub expiry_hours: i64,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            blocked_id_tags: Vec::new(),
            expiry_hours: 24,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::figment(Figment::new().merge(Toml::file("config/default.toml")))
    }

    fn figment(base: Figment) -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(base)
            .merge(Env::prefixed("OCPP_GW__").split("__"));
        let cfg: Config = figment.extract()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            (1..=MAX_STALE_AFTER_MINUTES).contains(&self.ocpp.stale_after_minutes),
            "ocpp.stale_after_minutes must be within 1..={MAX_STALE_AFTER_MINUTES}, got {}",
            self.ocpp.stale_after_minutes
        );
        ensure!(
            self.ocpp.request_timeout_ms > 0
                && self.ocpp.request_timeout_ms
                    < self.server.request_timeout_secs.saturating_mul(1000),
            "ocpp.request_timeout_ms ({}) must be positive and below server.request_timeout_secs ({}s)",
            self.ocpp.request_timeout_ms,
            self.server.request_timeout_secs
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        figment::Jail::expect_with(|_jail| {
            let cfg = Config::figment(Figment::new()).expect("defaults load");
            assert_eq!(cfg.ocpp.path, "/ocpp");
            assert_eq!(cfg.ocpp.heartbeat_interval_secs, 60);
            assert_eq!(cfg.ocpp.stale_after_minutes, 5);
            assert_eq!(cfg.ocpp.request_timeout(), Duration::from_secs(30));
            assert!(cfg.ocpp.enable_validation);
            assert!(cfg.auth.gateway_key_is_unset());
            Ok(())
        });
    }

    #[test]
    fn test_file_and_env_layers() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "gateway.toml",
                r#"
                [server]
                port = 9000

                [auth]
                gateway_api_key = "__SET_VIA_ENV__"

                [authorization]
                blocked_id_tags = ["STOLEN"]
                "#,
            )?;
            jail.set_env("OCPP_GW__AUTH__GATEWAY_API_KEY", "s3cret-key");
            jail.set_env("OCPP_GW__OCPP__STALE_AFTER_MINUTES", "10");

            let cfg = Config::figment(Figment::new().merge(Toml::file("gateway.toml")))
                .expect("layers load");
            assert_eq!(cfg.server.port, 9000);
            assert_eq!(cfg.auth.gateway_api_key, "s3cret-key");
            assert!(!cfg.auth.gateway_key_is_unset());
            assert_eq!(cfg.ocpp.stale_after_minutes, 10);
            assert_eq!(cfg.authorization.blocked_id_tags, vec!["STOLEN".to_string()]);
            Ok(())
        });
    }

    #[rstest::rstest]
    #[case("0")]
    #[case("-1")]
    #[case("4611686018427387903")]
    fn test_unusable_stale_threshold_is_refused(#[case] minutes: &str) {
        figment::Jail::expect_with(|jail| {
            jail.set_env("OCPP_GW__OCPP__STALE_AFTER_MINUTES", minutes);
            let err = Config::figment(Figment::new()).expect_err("must be refused");
            assert!(err.to_string().contains("stale_after_minutes"), "{err}");
            Ok(())
        });
    }

    #[test]
    fn test_correlation_timeout_must_fit_request_timeout() {
        let mut cfg = Config::default();
        assert!(cfg.validate().is_ok());
        cfg.ocpp.request_timeout_ms = cfg.server.request_timeout_secs * 1000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_socket_addr() {
        let server = ServerConfig::default();
        assert_eq!(server.socket_addr().unwrap().port(), 8080);
    }
}
