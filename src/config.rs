use std::env;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{var} has an invalid value: {value}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub database_name: String,
    pub jwt_secret: String,
    pub session_ttl_hours: i64,
    pub app_name: String,
    pub app_url: String,
    pub smtp: Option<SmtpConfig>,
}

impl Config {
    /// Reads the process environment. Call `dotenv::dotenv()` first to pick
    /// up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let smtp = match optional("SMTP_HOST") {
            Some(host) => {
                let user = optional("SMTP_USER");
                let from = optional("SMTP_FROM")
                    .or_else(|| user.clone())
                    .ok_or(ConfigError::Missing("SMTP_FROM"))?;
                Some(SmtpConfig {
                    host,
                    port: parsed("SMTP_PORT", 587)?,
                    user,
                    password: optional("SMTP_PASSWORD"),
                    from,
                })
            }
            None => None,
        };

        Ok(Config {
            bind_addr: optional("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            database_url: required("DATABASE_URL")?,
            database_name: optional("DATABASE_NAME").unwrap_or_else(|| "storefront".to_string()),
            jwt_secret: required("JWT_SECRET")?,
            session_ttl_hours: parsed("SESSION_TTL_HOURS", 24)?,
            app_name: optional("APP_NAME").unwrap_or_else(|| "Storefront".to_string()),
            app_url: optional("APP_URL").unwrap_or_else(|| "http://localhost:8080".to_string()),
            smtp,
        })
    }

    /// Settings for an in-memory instance with mail going to the log.
    pub fn in_memory(jwt_secret: impl Into<String>) -> Self {
        Config {
            bind_addr: "127.0.0.1:0".to_string(),
            database_url: "memory://".to_string(),
            database_name: "storefront".to_string(),
            jwt_secret: jwt_secret.into(),
            session_ttl_hours: 24,
            app_name: "Storefront".to_string(),
            app_url: "http://localhost:8080".to_string(),
            smtp: None,
        }
    }
}

fn optional(var: &'static str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    optional(var).ok_or(ConfigError::Missing(var))
}

fn parsed<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(var) {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}
