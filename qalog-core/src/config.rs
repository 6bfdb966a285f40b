use chrono::FixedOffset;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize, Clone)]
pub struct QaLogConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub iteration: IterationConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub socket_path: String,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_seconds: u64,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: usize,
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

fn default_acquire_timeout() -> u64 {
    5
}

fn default_connect_retries() -> usize {
    3
}

fn default_true() -> bool {
    true
}

/// Which partition owns a session: each (user, program) pair, or the program
/// as a whole.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionScope {
    #[default]
    User,
    Program,
}

/// Iteration bucketing knobs. The defaults are product constants, not
/// load-tested values.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IterationConfig {
    pub bucket_size_seconds: i64,
    pub ceiling: i32,
    pub assign_timeout_ms: u64,
    pub scope: SessionScope,
    pub time_zone: String,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            bucket_size_seconds: 2,
            ceiling: 50,
            assign_timeout_ms: 1000,
            scope: SessionScope::User,
            time_zone: "+00:00".to_string(),
        }
    }
}

impl IterationConfig {
    /// Offset used to interpret timestamps that carry no zone of their own.
    pub fn offset(&self) -> Result<FixedOffset, ConfigError> {
        parse_utc_offset(&self.time_zone).ok_or_else(|| {
            ConfigError::Message(format!(
                "iteration.time_zone must look like +HH:MM, got {:?}",
                self.time_zone
            ))
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdentityConfig {
    /// Logical user name -> known IP addresses or device names.
    #[serde(default)]
    pub devices: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_unknown_user")]
    pub unknown_user: String,
    #[serde(default = "default_guest_user")]
    pub guest_user: String,
}

fn default_unknown_user() -> String {
    "UNKNOWN".to_string()
}

fn default_guest_user() -> String {
    "guest".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            devices: BTreeMap::new(),
            unknown_user: default_unknown_user(),
            guest_user: default_guest_user(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StatusConfig {
    pub active_window_seconds: i64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            active_window_seconds: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8766,
        }
    }
}

impl QaLogConfig {
    /// Load from a TOML file, overlaid by `QALOG__SECTION__KEY` variables.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("QALOG").separator("__"))
            .build()?;
        let config: Self = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.iteration.offset()?;
        if self.iteration.bucket_size_seconds <= 0 {
            return Err(ConfigError::Message(
                "iteration.bucket_size_seconds must be positive".to_string(),
            ));
        }
        if self.iteration.ceiling <= 0 {
            return Err(ConfigError::Message(
                "iteration.ceiling must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse `Z`, `UTC`, `+HH:MM`, `-HH:MM` or `+HHMM`.
fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }

    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
