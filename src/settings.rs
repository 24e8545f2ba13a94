//! Runtime configuration from environment variables.
//!
//! All knobs live under the `FISCAL_GATEWAY_` / `MQTT_` prefixes and are read
//! once at startup into a [`Settings`] struct shared across the service.

use std::env;
use std::path::PathBuf;

fn env_str(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,

    pub job_poll_interval_s: f64,
    pub job_timeout_s: f64,
    pub job_max_retries: i64,
    pub global_dry_run: bool,

    pub mqtt_enabled: bool,
    pub mqtt_broker_host: String,
    pub mqtt_broker_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_client_id: String,
    pub mqtt_topic_prefix: String,
    pub mqtt_qos: u8,
    pub mqtt_keepalive_s: u64,
    pub mqtt_use_tls: bool,
}

impl Settings {
    pub fn from_env() -> Self {
        let data_dir = env_str("FISCAL_GATEWAY_DATA_DIR", "data");
        let default_db = PathBuf::from(&data_dir).join("fiscal_gateway.sqlite");
        Self {
            host: env_str("FISCAL_GATEWAY_HOST", "127.0.0.1"),
            port: env_parse("FISCAL_GATEWAY_PORT", 8787),
            db_path: env::var("FISCAL_GATEWAY_DB")
                .map(PathBuf::from)
                .unwrap_or(default_db),
            job_poll_interval_s: env_parse("FISCAL_GATEWAY_POLL_INTERVAL", 1.0),
            job_timeout_s: env_parse("FISCAL_GATEWAY_JOB_TIMEOUT", 15.0),
            job_max_retries: env_parse("FISCAL_GATEWAY_JOB_RETRIES", 1),
            global_dry_run: env_bool("FISCAL_GATEWAY_DRY_RUN", false),

            mqtt_enabled: env_bool("MQTT_ENABLED", false),
            mqtt_broker_host: env_str("MQTT_BROKER_HOST", ""),
            mqtt_broker_port: env_parse("MQTT_BROKER_PORT", 1883),
            mqtt_username: env_str("MQTT_USERNAME", ""),
            mqtt_password: env_str("MQTT_PASSWORD", ""),
            mqtt_client_id: env_str("MQTT_CLIENT_ID", "fiscal-gateway"),
            mqtt_topic_prefix: env_str("MQTT_TOPIC_PREFIX", "fiscal"),
            mqtt_qos: env_parse("MQTT_QOS", 1),
            mqtt_keepalive_s: env_parse("MQTT_KEEPALIVE", 60),
            mqtt_use_tls: env_bool("MQTT_USE_TLS", false),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            db_path: PathBuf::from("data/fiscal_gateway.sqlite"),
            job_poll_interval_s: 1.0,
            job_timeout_s: 15.0,
            job_max_retries: 1,
            global_dry_run: false,
            mqtt_enabled: false,
            mqtt_broker_host: String::new(),
            mqtt_broker_port: 1883,
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            mqtt_client_id: "fiscal-gateway".into(),
            mqtt_topic_prefix: "fiscal".into(),
            mqtt_qos: 1,
            mqtt_keepalive_s: 60,
            mqtt_use_tls: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.port, 8787);
        assert_eq!(s.job_poll_interval_s, 1.0);
        assert_eq!(s.job_timeout_s, 15.0);
        assert_eq!(s.job_max_retries, 1);
        assert_eq!(s.mqtt_topic_prefix, "fiscal");
        assert_eq!(s.mqtt_qos, 1);
    }
}
