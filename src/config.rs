use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

/// Where user profiles come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityConfig {
    /// JSON array of profiles on disk.
    Static(PathBuf),
    /// HTTP user directory.
    Rest { endpoint: String, timeout: Duration },
}

/// Server settings, read from `SHIFTBOARD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub timezone: Tz,
    pub identity: IdentityConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("SHIFTBOARD_TIMEZONE: unknown time zone {0:?}")]
    UnknownTimezone(String),
    #[error("both SHIFTBOARD_TLS_CERT and SHIFTBOARD_TLS_KEY must be set, or neither")]
    PartialTls,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let timezone_name = string("SHIFTBOARD_TIMEZONE", "UTC");
        let timezone =
            Tz::from_str(&timezone_name).map_err(|_| ConfigError::UnknownTimezone(timezone_name.clone()))?;

        let tls_cert = lookup("SHIFTBOARD_TLS_CERT").map(PathBuf::from);
        let tls_key = lookup("SHIFTBOARD_TLS_KEY").map(PathBuf::from);
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        let identity = match lookup("SHIFTBOARD_USERS_FILE") {
            Some(path) => IdentityConfig::Static(PathBuf::from(path)),
            None => IdentityConfig::Rest {
                endpoint: string("SHIFTBOARD_IDENTITY_ENDPOINT", "http://localhost:5000"),
                timeout: Duration::from_millis(parse(&lookup, "SHIFTBOARD_IDENTITY_TIMEOUT_MS", 5000)?),
            },
        };

        Ok(Self {
            bind: string("SHIFTBOARD_BIND", "0.0.0.0"),
            port: parse(&lookup, "SHIFTBOARD_PORT", 5434)?,
            data_dir: PathBuf::from(string("SHIFTBOARD_DATA_DIR", "./data")),
            password: string("SHIFTBOARD_PASSWORD", "shiftboard"),
            max_connections: parse(&lookup, "SHIFTBOARD_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse(&lookup, "SHIFTBOARD_COMPACT_THRESHOLD", 1000)?,
            metrics_port: lookup("SHIFTBOARD_METRICS_PORT")
                .map(|v| v.parse().map_err(|_| ConfigError::Invalid { var: "SHIFTBOARD_METRICS_PORT", value: v }))
                .transpose()?,
            tls_cert,
            tls_key,
            timezone,
            identity,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("shifts.wal")
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]).unwrap();
        assert_eq!(c.bind, "0.0.0.0");
        assert_eq!(c.port, 5434);
        assert_eq!(c.password, "shiftboard");
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.compact_threshold, 1000);
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.timezone, Tz::UTC);
        assert_eq!(c.wal_path(), PathBuf::from("./data/shifts.wal"));
        assert_eq!(
            c.identity,
            IdentityConfig::Rest {
                endpoint: "http://localhost:5000".into(),
                timeout: Duration::from_millis(5000),
            }
        );
    }

    #[test]
    fn overrides() {
        let c = config(&[
            ("SHIFTBOARD_PORT", "6000"),
            ("SHIFTBOARD_TIMEZONE", "Asia/Tokyo"),
            ("SHIFTBOARD_USERS_FILE", "/etc/shiftboard/users.json"),
            ("SHIFTBOARD_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(c.port, 6000);
        assert_eq!(c.timezone, chrono_tz::Asia::Tokyo);
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.identity, IdentityConfig::Static("/etc/shiftboard/users.json".into()));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            config(&[("SHIFTBOARD_PORT", "lots")]),
            Err(ConfigError::Invalid { var: "SHIFTBOARD_PORT", .. })
        ));
        assert!(matches!(
            config(&[("SHIFTBOARD_TIMEZONE", "Mars/Olympus")]),
            Err(ConfigError::UnknownTimezone(_))
        ));
        assert!(matches!(
            config(&[("SHIFTBOARD_TLS_CERT", "cert.pem")]),
            Err(ConfigError::PartialTls)
        ));
        assert!(matches!(
            config(&[("SHIFTBOARD_METRICS_PORT", "-1")]),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
