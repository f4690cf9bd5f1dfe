//! Runtime settings, read from `REELSHELF_*` environment variables.

use log::warn;
use std::path::PathBuf;
use thiserror::Error;

const SECRET_KEY_MIN_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} has an invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("REELSHELF_SECRET_KEY must be at least {} bytes long", SECRET_KEY_MIN_LEN)]
    SecretTooShort,
}

#[derive(Clone)]
pub struct Settings {
    pub bind_address: String,
    /// `None` runs on a temporary database that is removed on shutdown.
    pub database_path: Option<PathBuf>,
    pub secret_key: Vec<u8>,
    pub bcrypt_cost: u32,
    pub session_ttl_secs: u64,
    pub remember_ttl_secs: u64,
    pub secure_cookie: bool,
    pub seed_demo: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            bind_address: "127.0.0.1:8080".to_owned(),
            database_path: Some(PathBuf::from("reelshelf.db")),
            secret_key: generate_secret_key(),
            bcrypt_cost: bcrypt::DEFAULT_COST,
            session_ttl_secs: 12 * 60 * 60,
            remember_ttl_secs: 30 * 24 * 60 * 60,
            secure_cookie: false,
            seed_demo: false,
        }
    }
}

fn generate_secret_key() -> Vec<u8> {
    let mut key = uuid::Uuid::new_v4().as_bytes().to_vec();
    key.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    key
}

fn parse<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value })
}

/// Parses a duration given in `unit_secs`-sized units into seconds.
fn parse_secs(var: &'static str, value: String, unit_secs: u64) -> Result<u64, ConfigError> {
    let units: u64 = parse(var, value.clone())?;
    units
        .checked_mul(unit_secs)
        .filter(|secs| *secs <= i64::MAX as u64)
        .ok_or(ConfigError::Invalid { var, value })
}

fn parse_bool(var: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid { var, value }),
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();

        if let Some(bind) = lookup("REELSHELF_BIND") {
            settings.bind_address = bind;
        }
        if let Some(path) = lookup("REELSHELF_DB_PATH") {
            settings.database_path = match path.trim() {
                ":memory:" => None,
                "" => {
                    return Err(ConfigError::Invalid {
                        var: "REELSHELF_DB_PATH",
                        value: path.clone(),
                    })
                }
                path => Some(PathBuf::from(path)),
            };
        }
        match lookup("REELSHELF_SECRET_KEY") {
            Some(key) if key.len() < SECRET_KEY_MIN_LEN => return Err(ConfigError::SecretTooShort),
            Some(key) => settings.secret_key = key.into_bytes(),
            None => warn!("REELSHELF_SECRET_KEY is not set; sessions will not survive a restart"),
        }
        if let Some(cost) = lookup("REELSHELF_BCRYPT_COST") {
            let var = "REELSHELF_BCRYPT_COST";
            settings.bcrypt_cost = parse(var, cost.clone())?;
            if !(4..=31).contains(&settings.bcrypt_cost) {
                return Err(ConfigError::Invalid { var, value: cost });
            }
        }
        if let Some(hours) = lookup("REELSHELF_SESSION_HOURS") {
            settings.session_ttl_secs = parse_secs("REELSHELF_SESSION_HOURS", hours, 60 * 60)?;
        }
        if let Some(days) = lookup("REELSHELF_REMEMBER_DAYS") {
            settings.remember_ttl_secs =
                parse_secs("REELSHELF_REMEMBER_DAYS", days, 24 * 60 * 60)?;
        }
        if let Some(secure) = lookup("REELSHELF_SECURE_COOKIE") {
            settings.secure_cookie = parse_bool("REELSHELF_SECURE_COOKIE", secure)?;
        }
        if let Some(seed) = lookup("REELSHELF_SEED_DEMO") {
            settings.seed_demo = parse_bool("REELSHELF_SEED_DEMO", seed)?;
        }

        Ok(settings)
    }

    pub fn open_database(&self) -> sled::Result<sled::Db> {
        match &self.database_path {
            Some(path) => sled::open(path),
            None => sled::Config::new().temporary(true).open(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let settings = settings(&[]).unwrap();
        assert_eq!(settings.bind_address, "127.0.0.1:8080");
        assert_eq!(settings.database_path, Some(PathBuf::from("reelshelf.db")));
        assert_eq!(settings.secret_key.len(), 32);
        assert_eq!(settings.bcrypt_cost, bcrypt::DEFAULT_COST);
        assert!(!settings.secure_cookie);
    }

    #[test]
    fn reads_overrides() {
        let settings = settings(&[
            ("REELSHELF_BIND", "0.0.0.0:9000"),
            ("REELSHELF_DB_PATH", ":memory:"),
            ("REELSHELF_SECRET_KEY", "0123456789abcdef0123456789abcdef"),
            ("REELSHELF_BCRYPT_COST", "4"),
            ("REELSHELF_SESSION_HOURS", "1"),
            ("REELSHELF_REMEMBER_DAYS", "2"),
            ("REELSHELF_SECURE_COOKIE", "true"),
            ("REELSHELF_SEED_DEMO", "yes"),
        ])
        .unwrap();
        assert_eq!(settings.bind_address, "0.0.0.0:9000");
        assert_eq!(settings.database_path, None);
        assert_eq!(settings.secret_key, b"0123456789abcdef0123456789abcdef");
        assert_eq!(settings.bcrypt_cost, 4);
        assert_eq!(settings.session_ttl_secs, 3600);
        assert_eq!(settings.remember_ttl_secs, 2 * 86400);
        assert!(settings.secure_cookie);
        assert!(settings.seed_demo);
    }

    #[test]
    fn rejects_short_secret() {
        assert!(matches!(
            settings(&[("REELSHELF_SECRET_KEY", "short")]),
            Err(ConfigError::SecretTooShort)
        ));
    }

    #[test]
    fn rejects_bad_numbers() {
        assert!(matches!(
            settings(&[("REELSHELF_BCRYPT_COST", "2")]),
            Err(ConfigError::Invalid {
                var: "REELSHELF_BCRYPT_COST",
                ..
            })
        ));
        assert!(settings(&[("REELSHELF_SESSION_HOURS", "soon")]).is_err());
        assert!(settings(&[("REELSHELF_SECURE_COOKIE", "maybe")]).is_err());
    }

    #[test]
    fn rejects_lifetimes_that_overflow_seconds() {
        assert!(matches!(
            settings(&[("REELSHELF_SESSION_HOURS", "18446744073709551615")]),
            Err(ConfigError::Invalid {
                var: "REELSHELF_SESSION_HOURS",
                ..
            })
        ));
        assert!(matches!(
            settings(&[("REELSHELF_REMEMBER_DAYS", "300000000000000")]),
            Err(ConfigError::Invalid {
                var: "REELSHELF_REMEMBER_DAYS",
                ..
            })
        ));
        let settings = settings(&[("REELSHELF_REMEMBER_DAYS", "3650")]).unwrap();
        assert_eq!(settings.remember_ttl_secs, 3650 * 86400);
    }
}
