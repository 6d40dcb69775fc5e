use std::{fmt::Display, str::FromStr, time::Duration};

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Rest,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Backend::Sqlite),
            "rest" => Ok(Backend::Rest),
            other => Err(format!("unknown backend {other:?}, expected sqlite or rest")),
        }
    }
}

pub struct Config {
    pub bind_addr: String,
    pub backend: Backend,
    pub database_url: String,
    pub public_url: String,
    pub rest_url: String,
    pub rest_key: String,
    pub refresh_interval: Duration,
    pub auto_refresh: bool,
    pub settings_path: String,
}

impl Config {
    /// Reads the environment (and `.env`, if present).
    pub fn load() -> anyhow::Result<Self> {
        if dotenv::dotenv().is_err() {
            info!("no .env file, using the process environment");
        }

        Ok(Self {
            bind_addr: try_load("CHATHUB_BIND", "0.0.0.0:8080")?,
            backend: try_load("CHATHUB_BACKEND", "sqlite")?,
            database_url: try_load("DATABASE_URL", "sqlite://chathub.db")?,
            public_url: try_load("CHATHUB_PUBLIC_URL", "http://localhost:8080")?,
            rest_url: try_load("CHATHUB_REST_URL", "")?,
            rest_key: try_load("CHATHUB_REST_KEY", "")?,
            refresh_interval: Duration::from_millis(try_load("CHATHUB_REFRESH_MS", "1000")?),
            auto_refresh: try_load("CHATHUB_AUTO_REFRESH", "true")?,
            settings_path: try_load("CHATHUB_SETTINGS_PATH", "chathub-settings.json")?,
        })
    }
}

fn try_load<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T>
where
    T::Err: Display,
{
    let value = dotenv::var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default:?}");
        default.to_string()
    });
    value.parse().map_err(|e| {
        warn!("invalid {key} value {value:?}: {e}");
        anyhow::anyhow!("invalid {key}: {e}")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backends_parse_case_insensitively() {
        assert_eq!("SQLite".parse::<Backend>().unwrap(), Backend::Sqlite);
        assert_eq!("rest".parse::<Backend>().unwrap(), Backend::Rest);
        assert!("firebase".parse::<Backend>().is_err());
    }

    #[test]
    fn unset_keys_take_defaults() {
        let port: u16 = try_load("CHATHUB_TEST_UNSET_PORT", "8080").unwrap();
        assert_eq!(port, 8080);
        assert!(try_load::<u16>("CHATHUB_TEST_UNSET_PORT", "eighty").is_err());
    }
}
