use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;

use crate::model::{MINUTE_MS, TenantSettings};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Server settings read from `STUDIOSLOT_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    /// Settings a tenant starts with until it stores its own.
    pub tenant_defaults: TenantSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "studioslot".into(),
            max_connections: 256,
            compact_threshold: 1000,
            sweep_interval: Duration::from_millis(5000),
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
            tenant_defaults: TenantSettings::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the config from any variable source; unset variables keep
    /// their defaults, malformed ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = parsed(&lookup, "STUDIOSLOT_PORT")? {
            config.port = v;
        }
        if let Some(v) = lookup("STUDIOSLOT_BIND") {
            config.bind = v;
        }
        if let Some(v) = lookup("STUDIOSLOT_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("STUDIOSLOT_PASSWORD") {
            config.password = v;
        }
        if let Some(v) = parsed(&lookup, "STUDIOSLOT_MAX_CONNECTIONS")? {
            config.max_connections = v;
        }
        if let Some(v) = parsed(&lookup, "STUDIOSLOT_COMPACT_THRESHOLD")? {
            config.compact_threshold = v;
        }
        if let Some(ms) = parsed::<u64>(&lookup, "STUDIOSLOT_SWEEP_INTERVAL_MS")? {
            config.sweep_interval = Duration::from_millis(ms.max(1));
        }
        config.tls_cert = lookup("STUDIOSLOT_TLS_CERT");
        config.tls_key = lookup("STUDIOSLOT_TLS_KEY");
        config.metrics_port = parsed(&lookup, "STUDIOSLOT_METRICS_PORT")?;
        if let Some(minutes) = parsed::<i64>(&lookup, "STUDIOSLOT_SESSION_MINUTES")? {
            if minutes <= 0 {
                return Err(ConfigError::Invalid {
                    var: "STUDIOSLOT_SESSION_MINUTES",
                    value: minutes.to_string(),
                });
            }
            config.tenant_defaults.session_length_ms = minutes * MINUTE_MS;
        }
        if let Some(tz) = parsed::<Tz>(&lookup, "STUDIOSLOT_TIMEZONE")? {
            config.tenant_defaults.timezone = tz;
        }
        Ok(config)
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
