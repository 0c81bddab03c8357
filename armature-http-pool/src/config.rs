//! Pooled HTTP client configuration.
//!
//! Every struct here is a plain value constructed in one step (struct literal
//! with `..Default::default()`, a config file, or the environment) and checked
//! once by [`ClientConfig::validate`] before the client is built.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::{HttpPoolError, Result};

/// Default maximum concurrently leased connections per destination.
pub const DEFAULT_MAX_PER_ROUTE: usize = 15;
/// Default maximum concurrently leased connections across all destinations.
pub const DEFAULT_MAX_TOTAL: usize = 200;
/// Default idle lifetime of a pooled connection.
pub const DEFAULT_CONNECTION_TTL: Duration = Duration::from_millis(3000);
/// Default socket (read) timeout.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_millis(5000);
/// Default connect timeout, also the longest wait for a pooled connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Connection pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum leased connections per destination.
    pub max_per_route: usize,
    /// Maximum leased connections overall.
    pub max_total: usize,
    /// Idle connections older than this are discarded instead of reused.
    #[serde(rename = "connection_ttl_ms", with = "duration_ms")]
    pub connection_time_to_live: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_route: DEFAULT_MAX_PER_ROUTE,
            max_total: DEFAULT_MAX_TOTAL,
            connection_time_to_live: DEFAULT_CONNECTION_TTL,
        }
    }
}

/// Client-wide timeout defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    /// Maximum time to wait for response data.
    #[serde(rename = "socket_timeout_ms", with = "duration_ms")]
    pub socket_timeout: Duration,
    /// Maximum time to obtain a connected transport.
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            socket_timeout: DEFAULT_SOCKET_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// How presented server hostnames are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationMode {
    /// Any hostname is accepted. Insecure; this is what an unset host list means.
    Disabled,
    /// Only hostnames in `TrustMaterial::trusted_hosts` are accepted.
    AllowList,
}

impl fmt::Display for VerificationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::AllowList => f.write_str("allow-list"),
        }
    }
}

/// Certificate and key inputs for the TLS context.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustMaterial {
    /// Directory walked recursively for trusted certificates.
    pub trusted_certs_path: Option<PathBuf>,
    /// Required whenever `trusted_certs_path` is set.
    pub trusted_store_password: Option<String>,
    /// PKCS#12 key store holding the client identity.
    pub private_key_path: Option<PathBuf>,
    /// Required whenever `private_key_path` is set.
    pub private_key_password: Option<String>,
    /// Server hostnames accepted in allow-list mode.
    pub trusted_hosts: Option<Vec<String>>,
    /// Explicit verification mode; derived from `trusted_hosts` when unset.
    pub hostname_verification: Option<VerificationMode>,
}

impl TrustMaterial {
    /// Effective hostname verification mode.
    pub fn verification_mode(&self) -> VerificationMode {
        match self.hostname_verification {
            Some(mode) => mode,
            None if self.has_trusted_hosts() => VerificationMode::AllowList,
            None => VerificationMode::Disabled,
        }
    }

    fn has_trusted_hosts(&self) -> bool {
        self.trusted_hosts
            .as_ref()
            .is_some_and(|hosts| hosts.iter().any(|h| !h.trim().is_empty()))
    }

    /// Check that every configured path has its paired password.
    pub fn validate(&self) -> Result<()> {
        if self.trusted_certs_path.is_some() {
            require_value("trusted_store_password", self.trusted_store_password.as_deref())?;
        }
        if self.private_key_path.is_some() {
            require_value("private_key_password", self.private_key_password.as_deref())?;
        }
        if self.verification_mode() == VerificationMode::AllowList && !self.has_trusted_hosts() {
            return Err(HttpPoolError::Configuration(
                "allow-list hostname verification requires trusted_hosts".to_string(),
            ));
        }
        Ok(())
    }
}

fn require_value(name: &str, value: Option<&str>) -> Result<()> {
    match value {
        Some(v) if !v.is_empty() => Ok(()),
        _ => Err(HttpPoolError::Configuration(format!(
            "{name} is empty, it must be set"
        ))),
    }
}

impl fmt::Debug for TrustMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "***");
        f.debug_struct("TrustMaterial")
            .field("trusted_certs_path", &self.trusted_certs_path)
            .field("trusted_store_password", &redact(&self.trusted_store_password))
            .field("private_key_path", &self.private_key_path)
            .field("private_key_password", &redact(&self.private_key_password))
            .field("trusted_hosts", &self.trusted_hosts)
            .field("hostname_verification", &self.verification_mode())
            .finish()
    }
}

/// Pooled HTTP client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Connection pool sizing.
    pub pool: PoolConfig,
    /// Default timeouts applied when a request leaves them unset.
    pub timeouts: TimeoutPolicy,
    /// Automatic retry of requests that failed before sending.
    pub retry: RetryPolicy,
    /// Discard every connection after use instead of returning it to the pool.
    pub release_connection_eagerly: bool,
    /// TLS trust and key material.
    pub tls: TrustMaterial,
    /// User agent string.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            timeouts: TimeoutPolicy::default(),
            retry: RetryPolicy::default(),
            release_connection_eagerly: false,
            tls: TrustMaterial::default(),
            user_agent: format!("armature-http-pool/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ClientConfig {
    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_per_route == 0 || self.pool.max_total == 0 {
            return Err(HttpPoolError::Configuration(
                "max_per_route and max_total must be at least 1".to_string(),
            ));
        }
        if self.pool.max_per_route > self.pool.max_total {
            return Err(HttpPoolError::Configuration(format!(
                "max_per_route ({}) must not exceed max_total ({})",
                self.pool.max_per_route, self.pool.max_total
            )));
        }
        if self.timeouts.socket_timeout.is_zero() || self.timeouts.connect_timeout.is_zero() {
            return Err(HttpPoolError::Configuration(
                "default socket and connect timeouts must be positive".to_string(),
            ));
        }
        self.tls.validate()
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| HttpPoolError::Configuration(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(input: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(input)
            .map_err(|e| HttpPoolError::Configuration(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a `.toml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            HttpPoolError::Configuration(format!("failed to read {}: {e}", path.display()))
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => Self::from_json_str(&content),
            other => Err(HttpPoolError::Configuration(format!(
                "unsupported config format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    /// Load from process environment variables named `<PREFIX>_<KEY>`.
    pub fn from_env(prefix: &str) -> Result<Self> {
        Self::from_vars(prefix, std::env::vars())
    }

    /// Load from an explicit set of variables, as [`ClientConfig::from_env`] does.
    ///
    /// Recognized keys: `MAX_PER_ROUTE`, `MAX_TOTAL`, `CONNECTION_TTL_MS`,
    /// `SOCKET_TIMEOUT_MS`, `CONNECT_TIMEOUT_MS`, `RETRY_ENABLED`,
    /// `RETRY_COUNT`, `RELEASE_CONNECTION_EAGERLY`, `TRUSTED_CERTS_PATH`,
    /// `TRUSTED_STORE_PASSWORD`, `PRIVATE_KEY_PATH`, `PRIVATE_KEY_PASSWORD`,
    /// `TRUSTED_HOSTS` (comma separated), `HOSTNAME_VERIFICATION`.
    pub fn from_vars<I, K, V>(prefix: &str, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let prefix = format!("{}_", prefix.trim_end_matches('_').to_uppercase());
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter_map(|(k, v)| {
                let key: String = k.into();
                key.strip_prefix(&prefix).map(|rest| (rest.to_string(), v.into()))
            })
            .collect();

        let mut config = Self::default();
        if let Some(v) = vars.get("MAX_PER_ROUTE") {
            config.pool.max_per_route = parse_var("MAX_PER_ROUTE", v)?;
        }
        if let Some(v) = vars.get("MAX_TOTAL") {
            config.pool.max_total = parse_var("MAX_TOTAL", v)?;
        }
        if let Some(v) = vars.get("CONNECTION_TTL_MS") {
            config.pool.connection_time_to_live =
                Duration::from_millis(parse_var("CONNECTION_TTL_MS", v)?);
        }
        if let Some(v) = vars.get("SOCKET_TIMEOUT_MS") {
            config.timeouts.socket_timeout =
                Duration::from_millis(parse_var("SOCKET_TIMEOUT_MS", v)?);
        }
        if let Some(v) = vars.get("CONNECT_TIMEOUT_MS") {
            config.timeouts.connect_timeout =
                Duration::from_millis(parse_var("CONNECT_TIMEOUT_MS", v)?);
        }
        if let Some(v) = vars.get("RETRY_ENABLED") {
            config.retry.enabled = parse_var("RETRY_ENABLED", v)?;
        }
        if let Some(v) = vars.get("RETRY_COUNT") {
            config.retry.max_attempts = parse_var("RETRY_COUNT", v)?;
        }
        if let Some(v) = vars.get("RELEASE_CONNECTION_EAGERLY") {
            config.release_connection_eagerly = parse_var("RELEASE_CONNECTION_EAGERLY", v)?;
        }
        config.tls.trusted_certs_path = vars.get("TRUSTED_CERTS_PATH").map(PathBuf::from);
        config.tls.trusted_store_password = vars.get("TRUSTED_STORE_PASSWORD").cloned();
        config.tls.private_key_path = vars.get("PRIVATE_KEY_PATH").map(PathBuf::from);
        config.tls.private_key_password = vars.get("PRIVATE_KEY_PASSWORD").cloned();
        config.tls.trusted_hosts = vars.get("TRUSTED_HOSTS").map(|hosts| {
            hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect()
        });
        if let Some(v) = vars.get("HOSTNAME_VERIFICATION") {
            config.tls.hostname_verification = Some(match v.trim() {
                "disabled" => VerificationMode::Disabled,
                "allow-list" => VerificationMode::AllowList,
                other => {
                    return Err(HttpPoolError::Configuration(format!(
                        "HOSTNAME_VERIFICATION must be 'disabled' or 'allow-list', got '{other}'"
                    )));
                }
            });
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| HttpPoolError::Configuration(format!("invalid value for {key}: '{value}'")))
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_pool_contract() {
        let config = ClientConfig::default();
        assert_eq!(config.pool.max_per_route, 15);
        assert_eq!(config.pool.max_total, 200);
        assert_eq!(config.pool.connection_time_to_live, Duration::from_millis(3000));
        assert_eq!(config.timeouts.socket_timeout, Duration::from_millis(5000));
        assert_eq!(config.timeouts.connect_timeout, Duration::from_millis(5000));
        assert!(!config.retry.enabled);
        assert_eq!(config.tls.verification_mode(), VerificationMode::Disabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_per_route_above_total_is_rejected() {
        let config = ClientConfig {
            pool: PoolConfig {
                max_per_route: 10,
                max_total: 5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(HttpPoolError::Configuration(_))
        ));
    }

    #[test]
    fn test_path_without_password_is_rejected() {
        let trust = TrustMaterial {
            trusted_certs_path: Some(PathBuf::from("/etc/certs")),
            ..Default::default()
        };
        let err = trust.validate().unwrap_err();
        assert!(err.to_string().contains("trusted_store_password"));

        let key = TrustMaterial {
            private_key_path: Some(PathBuf::from("client.p12")),
            private_key_password: Some(String::new()),
            ..Default::default()
        };
        let err = key.validate().unwrap_err();
        assert!(err.to_string().contains("private_key_password"));
    }

    #[test]
    fn test_verification_mode_follows_hosts() {
        let trust = TrustMaterial {
            trusted_hosts: Some(vec!["api.example.com".into()]),
            ..Default::default()
        };
        assert_eq!(trust.verification_mode(), VerificationMode::AllowList);

        let forced = TrustMaterial {
            hostname_verification: Some(VerificationMode::AllowList),
            ..Default::default()
        };
        assert!(forced.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_passwords() {
        let trust = TrustMaterial {
            private_key_path: Some(PathBuf::from("client.p12")),
            private_key_password: Some("hunter2".into()),
            ..Default::default()
        };
        let debug = format!("{trust:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn test_from_toml() {
        let config = ClientConfig::from_toml_str(
            r#"
            release_connection_eagerly = true

            [pool]
            max_per_route = 4
            max_total = 8
            connection_ttl_ms = 1500

            [timeouts]
            socket_timeout_ms = 250

            [retry]
            enabled = true
            max_attempts = 2

            [tls]
            trusted_hosts = ["api.example.com"]
            "#,
        )
        .unwrap();

        assert_eq!(config.pool.max_per_route, 4);
        assert_eq!(config.pool.connection_time_to_live, Duration::from_millis(1500));
        assert_eq!(config.timeouts.socket_timeout, Duration::from_millis(250));
        assert_eq!(config.timeouts.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(config.retry.enabled);
        assert_eq!(config.retry.max_attempts, 2);
        assert!(config.release_connection_eagerly);
        assert_eq!(config.tls.verification_mode(), VerificationMode::AllowList);
    }

    #[test]
    fn test_from_json_validates() {
        let result = ClientConfig::from_json_str(r#"{"pool": {"max_per_route": 0}}"#);
        assert!(matches!(result, Err(HttpPoolError::Configuration(_))));
    }

    #[test]
    fn test_from_vars() {
        let vars = vec![
            ("HTTP_POOL_MAX_PER_ROUTE", "3"),
            ("HTTP_POOL_MAX_TOTAL", "6"),
            ("HTTP_POOL_RETRY_ENABLED", "true"),
            ("HTTP_POOL_RETRY_COUNT", "1"),
            ("HTTP_POOL_TRUSTED_HOSTS", "a.example.com, b.example.com"),
            ("UNRELATED_MAX_TOTAL", "1"),
        ];
        let config = ClientConfig::from_vars("HTTP_POOL", vars).unwrap();

        assert_eq!(config.pool.max_per_route, 3);
        assert_eq!(config.pool.max_total, 6);
        assert!(config.retry.enabled);
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(
            config.tls.trusted_hosts,
            Some(vec!["a.example.com".to_string(), "b.example.com".to_string()])
        );
    }

    #[test]
    fn test_from_vars_rejects_garbage() {
        let vars = vec![("APP_MAX_TOTAL", "lots")];
        assert!(ClientConfig::from_vars("APP", vars).is_err());

        let vars = vec![("APP_HOSTNAME_VERIFICATION", "strict")];
        assert!(ClientConfig::from_vars("APP", vars).is_err());
    }
}
