use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::clock::CondoClock;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Server settings, read from `CONDOBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub admin_user: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub clock: CondoClock,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |var: &'static str, default: &str| -> Result<String, ConfigError> {
            let value = lookup(var).unwrap_or_else(|| default.to_string());
            if value.trim().is_empty() {
                return Err(ConfigError::Empty(var));
            }
            Ok(value)
        };

        let timezone = text("CONDOBOOK_TIMEZONE", "America/Sao_Paulo")?;
        let clock = CondoClock::from_name(&timezone).map_err(|e| ConfigError::Invalid {
            var: "CONDOBOOK_TIMEZONE",
            value: timezone.clone(),
            reason: e.to_string(),
        })?;

        let max_connections = parsed(&lookup, "CONDOBOOK_MAX_CONNECTIONS")?.unwrap_or(256);
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "CONDOBOOK_MAX_CONNECTIONS",
                value: "0".into(),
                reason: "at least one connection is required".into(),
            });
        }

        Ok(Self {
            port: parsed(&lookup, "CONDOBOOK_PORT")?.unwrap_or(5433),
            bind: text("CONDOBOOK_BIND", "0.0.0.0")?,
            data_dir: PathBuf::from(text("CONDOBOOK_DATA_DIR", "./data")?),
            password: text("CONDOBOOK_PASSWORD", "condobook")?,
            admin_user: text("CONDOBOOK_ADMIN_USER", "admin")?,
            max_connections,
            compact_threshold: parsed(&lookup, "CONDOBOOK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            clock,
            metrics_port: parsed(&lookup, "CONDOBOOK_METRICS_PORT")?,
            tls_cert: lookup("CONDOBOOK_TLS_CERT"),
            tls_key: lookup("CONDOBOOK_TLS_KEY"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(var)
        .map(|value| {
            value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]).unwrap();
        assert_eq!(c.port, 5433);
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert_eq!(c.data_dir, PathBuf::from("./data"));
        assert_eq!(c.password, "condobook");
        assert_eq!(c.admin_user, "admin");
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.compact_threshold, 1000);
        assert_eq!(c.clock.timezone(), chrono_tz::America::Sao_Paulo);
        assert_eq!(c.metrics_port, None);
        assert!(c.tls_cert.is_none() && c.tls_key.is_none());
    }

    #[test]
    fn overrides() {
        let c = config(&[
            ("CONDOBOOK_PORT", "6000"),
            ("CONDOBOOK_ADMIN_USER", "sindico"),
            ("CONDOBOOK_TIMEZONE", "Europe/Lisbon"),
            ("CONDOBOOK_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(c.port, 6000);
        assert_eq!(c.admin_user, "sindico");
        assert_eq!(c.clock.timezone(), chrono_tz::Europe::Lisbon);
        assert_eq!(c.metrics_port, Some(9100));
    }

    #[test]
    fn bad_number_is_reported_with_its_variable() {
        let err = config(&[("CONDOBOOK_PORT", "http")]).unwrap_err();
        assert!(err.to_string().starts_with("CONDOBOOK_PORT=http"));
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        assert!(matches!(
            config(&[("CONDOBOOK_TIMEZONE", "Mars/Olympus")]),
            Err(ConfigError::Invalid {
                var: "CONDOBOOK_TIMEZONE",
                ..
            })
        ));
    }

    #[test]
    fn empty_password_is_rejected() {
        assert!(matches!(
            config(&[("CONDOBOOK_PASSWORD", "")]),
            Err(ConfigError::Empty("CONDOBOOK_PASSWORD"))
        ));
    }

    #[test]
    fn zero_connections_is_rejected() {
        assert!(config(&[("CONDOBOOK_MAX_CONNECTIONS", "0")]).is_err());
    }
}
