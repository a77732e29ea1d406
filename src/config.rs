// Environment-variable configuration, in the style of the teacher's
// MetricsConfig::from_env: small typed helpers, clamped/defaulted reads,
// no config file format.

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub devlink3_host: String,
    pub devlink3_port: u16,
    pub devlink3_username: String,
    pub devlink3_password: String,
    pub devlink3_use_tls: bool,
    pub devlink3_tls_verify: bool,
    pub devlink3_event_flags: String,

    pub smdr_enabled: bool,
    pub smdr_host: String,
    pub smdr_port: u16,

    pub db_pool_max: u32,
    pub db_idle_timeout_ms: u64,
    pub data_dir: std::path::PathBuf,

    pub broker_url: Option<String>,
    pub log_level: String,

    pub health_bind_addr: String,

    /// "production" enforces fatal config errors; anything else
    /// warns and falls back to defaults (§7).
    pub environment: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let environment = env_str("DEVLINK3_ENV", "production");
        let production = environment == "production";

        let devlink3_host = match std::env::var("DEVLINK3_HOST") {
            Ok(v) if !v.is_empty() => v,
            _ if production => {
                return Err(BridgeError::InvalidInput(
                    "DEVLINK3_HOST is required in production".into(),
                ))
            }
            _ => {
                tracing::warn!("DEVLINK3_HOST unset, defaulting to 127.0.0.1 (non-production)");
                "127.0.0.1".to_string()
            }
        };

        let devlink3_username = match std::env::var("DEVLINK3_USERNAME") {
            Ok(v) if !v.is_empty() => v,
            _ if production => {
                return Err(BridgeError::InvalidInput(
                    "DEVLINK3_USERNAME is required in production".into(),
                ))
            }
            _ => {
                tracing::warn!("DEVLINK3_USERNAME unset, defaulting to empty (non-production)");
                String::new()
            }
        };

        let devlink3_password = match std::env::var("DEVLINK3_PASSWORD") {
            Ok(v) => v,
            Err(_) if production => {
                return Err(BridgeError::InvalidInput(
                    "DEVLINK3_PASSWORD is required in production".into(),
                ))
            }
            Err(_) => {
                tracing::warn!("DEVLINK3_PASSWORD unset, defaulting to empty (non-production)");
                String::new()
            }
        };

        let devlink3_use_tls = env_bool("DEVLINK3_USE_TLS", false);
        let devlink3_port = env_u16(
            "DEVLINK3_PORT",
            if devlink3_use_tls { 50796 } else { 50797 },
        );

        Ok(Self {
            devlink3_host,
            devlink3_port,
            devlink3_username,
            devlink3_password,
            devlink3_use_tls,
            devlink3_tls_verify: env_bool("DEVLINK3_TLS_VERIFY", production),
            devlink3_event_flags: env_str("DEVLINK3_EVENT_FLAGS", "-CallDelta3 -CMExtn"),

            smdr_enabled: env_bool("SMDR_ENABLED", true),
            smdr_host: env_str("SMDR_HOST", "0.0.0.0"),
            smdr_port: env_u16("SMDR_PORT", 1150),

            db_pool_max: env_u32("DB_POOL_MAX", 20),
            db_idle_timeout_ms: env_u64("DB_IDLE_TIMEOUT_MS", 30_000),
            data_dir: env_str("DEVLINK3_DATA_DIR", "./data").into(),

            broker_url: std::env::var("BROKER_URL").ok(),
            log_level: env_str("LOG_LEVEL", "info"),

            health_bind_addr: env_str("DEVLINK3_HEALTH_BIND", "0.0.0.0:8088"),

            environment,
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
