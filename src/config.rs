//! Application configuration
//!
//! Loads configuration from environment variables with sensible defaults.

use chrono_tz::Tz;
use std::env;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Database connection URL
    pub database_url: String,
    /// Frontend assets directory
    pub frontend_dir: String,
    /// Staff session expiration in hours
    pub session_expiry_hours: i64,
    /// External reviewer session expiration in hours
    pub external_session_hours: i64,
    /// CORS allowed origins
    pub cors_origins: Vec<String>,
    /// Environment (development/production)
    pub environment: Environment,
    /// Trusted proxy IP prefixes (e.g., ["10.0.0.", "172.16."])
    /// Only trust X-Forwarded-For headers from these IPs
    pub trusted_proxies: Vec<String>,
    /// Base URL put in emailed links
    pub public_url: String,
    /// From address for outgoing mail
    pub mail_sender: String,
    /// Time zone stage dates are laid out in
    pub timezone: Tz,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Development,
    Production,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = match env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
            .as_str()
        {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        };

        // DATABASE_URL, or the individual DATABASE_* components
        let database_url = env::var("DATABASE_URL")
            .or_else(|_| {
                let host = env::var("DATABASE_HOST")?;
                let port = env::var("DATABASE_PORT").unwrap_or_else(|_| "5432".to_string());
                let user = env::var("DATABASE_USER")?;
                let password = env::var("DATABASE_PASSWORD")?;
                let db = env::var("DATABASE_DB")?;
                Ok(format!(
                    "postgres://{}:{}@{}:{}/{}",
                    user, password, host, port, db
                ))
            })
            .map_err(|_: env::VarError| {
                ConfigError::Missing(
                    "DATABASE_URL, or DATABASE_HOST + DATABASE_USER + DATABASE_PASSWORD + DATABASE_DB is required".to_string(),
                )
            })?;

        let timezone = parse_timezone(
            &env::var("REVIEW_TIMEZONE").unwrap_or_else(|_| "Europe/London".to_string()),
        )?;

        Ok(Config {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            database_url,
            frontend_dir: env::var("FRONTEND_DIR").unwrap_or_else(|_| "./frontend".to_string()),
            session_expiry_hours: env::var("SESSION_EXPIRY_HOURS")
                .ok()
                .and_then(|h| h.parse().ok())
                .unwrap_or(8),
            external_session_hours: env::var("EXTERNAL_SESSION_HOURS")
                .ok()
                .and_then(|h| h.parse().ok())
                .unwrap_or(4),
            cors_origins: env::var("CORS_ORIGINS")
                .map(|s| s.split(',').map(|o| o.trim().to_string()).collect())
                .unwrap_or_else(|_| vec!["http://localhost:8080".to_string()]),
            environment,
            trusted_proxies: env::var("TRUSTED_PROXIES")
                .map(|s| split_list(&s))
                .unwrap_or_default(),
            public_url: env::var("PUBLIC_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "https://feedback.example.org".to_string()),
            mail_sender: env::var("MAIL_SENDER")
                .unwrap_or_else(|_| "feedback@example.org".to_string()),
            timezone,
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_timezone(name: &str) -> Result<Tz, ConfigError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ConfigError::Invalid(format!("REVIEW_TIMEZONE: unknown time zone '{}'", name)))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration: {0}")]
    Missing(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timezone() {
        assert_eq!(parse_timezone("Europe/London").unwrap(), chrono_tz::Europe::London);
        assert_eq!(parse_timezone(" UTC ").unwrap(), chrono_tz::UTC);
        assert!(matches!(
            parse_timezone("Mars/Olympus"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_split_list_skips_blanks() {
        assert_eq!(
            split_list("10.0.0., ,172.16.,"),
            vec!["10.0.0.".to_string(), "172.16.".to_string()]
        );
        assert!(split_list("").is_empty());
    }
}
