//! Configuration Module
//!
//! Handles configuration loading from an optional YAML file, environment variables and
//! command-line arguments, in that order of increasing precedence.

use crate::{CounterError, Result};
use clap::{Arg, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Custom (de)serializer for Duration from string format like "1s", "500ms", "5m"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let num_end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {:?}", s));
        }

        let (num_str, unit) = s.split_at(num_end);
        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let secs = match unit.trim() {
            "ms" | "millis" => value / 1000.0,
            "" | "s" | "sec" | "secs" | "seconds" => value,
            "m" | "min" | "mins" | "minutes" => value * 60.0,
            "h" | "hr" | "hours" => value * 3600.0,
            other => return Err(format!("Unknown duration unit: {}", other)),
        };

        Duration::try_from_secs_f64(secs)
            .map_err(|e| format!("Duration out of range '{}': {}", s, e))
    }
}

/// Optional duration, absent or null in YAML meaning "unset"
mod option_duration_serde {
    use super::duration_serde::parse_duration;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&format!("{}ms", d.as_millis())),
            None => serializer.serialize_none(),
        }
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `host:port`, or `:port` to bind every interface
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl ServerConfig {
    /// Resolve the listen address, expanding the `:8080` shorthand
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let addr = self.listen_addr.trim();
        let addr = if addr.starts_with(':') {
            format!("0.0.0.0{}", addr)
        } else {
            addr.to_string()
        };

        addr.parse().map_err(|e| {
            CounterError::ConfigError(format!(
                "Invalid listen address {:?}: {}",
                self.listen_addr, e
            ))
        })
    }
}

/// Coordination store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub endpoints: Vec<String>,
    /// Key holding the counter text
    pub counter_key: String,
    /// Lock name shared by every replica
    pub lock_name: String,
    /// TTL of the lease backing each lock
    #[serde(with = "duration_serde")]
    pub lease_ttl: Duration,
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    /// Per-RPC timeout; unset lets lock acquisition block until granted
    #[serde(with = "option_duration_serde")]
    pub request_timeout: Option<Duration>,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://0.0.0.0:2379".to_string()],
            counter_key: "key".to_string(),
            lock_name: "/distributed-lock/".to_string(),
            lease_ttl: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            request_timeout: None,
        }
    }
}

impl CoordinationConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.endpoints.is_empty() || self.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err("At least one non-empty etcd endpoint is required".to_string());
        }
        if self.counter_key.is_empty() {
            return Err("Counter key cannot be empty".to_string());
        }
        if self.lock_name.is_empty() {
            return Err("Lock name cannot be empty".to_string());
        }
        if self.lease_ttl < Duration::from_secs(1) {
            return Err(format!(
                "Lease TTL must be at least 1s, got {:?}",
                self.lease_ttl
            ));
        }
        Ok(())
    }
}

/// Replica identity, normally injected through the pod environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub pod_name: String,
    pub node_name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            pod_name: "unknown".to_string(),
            node_name: "unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time in-flight increments get to finish before the client is closed
    #[serde(with = "duration_serde")]
    pub grace_period: Duration,
    #[serde(with = "duration_serde")]
    pub close_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(1),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl ShutdownConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.close_timeout.is_zero() {
            return Err("Shutdown close timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Directory for rolling application logs; console only when unset
    pub app_log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            app_log_dir: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub coordination: CoordinationConfig,
    pub identity: IdentityConfig,
    pub shutdown: ShutdownConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file, environment, and command line
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches, &|key| std::env::var(key).ok())
    }

    /// Load configuration from explicit arguments and an environment lookup
    pub fn load_from<I, T>(args: I, env: &dyn Fn(&str) -> Option<String>) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = Self::build_cli()
            .try_get_matches_from(args)
            .map_err(|e| CounterError::ConfigError(e.to_string()))?;
        Self::from_matches(&matches, env)
    }

    fn from_matches(matches: &ArgMatches, env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match matches.get_one::<String>("config") {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };

        config.apply_env_overrides(env)?;
        config.apply_cli_overrides(matches)?;
        config.validate()?;

        info!(
            "Configuration loaded: listen_addr={}, etcd_endpoints={:?}, grace_period={:?}",
            config.server.listen_addr, config.coordination.endpoints, config.shutdown.grace_period
        );
        debug!("Configuration: {:?}", config);

        Ok(config)
    }

    /// Build CLI argument parser
    fn build_cli() -> Command {
        Command::new("etcd-counter")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Replicated HTTP counter coordinated through etcd")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("server-addr")
                    .long("server-addr")
                    .value_name("ADDR")
                    .help("The address the server binds to (default: :8080)"),
            )
            .arg(
                Arg::new("etcd-endpoints")
                    .long("etcd-endpoints")
                    .value_name("URLS")
                    .help("Comma-separated etcd endpoints (default: http://0.0.0.0:2379)"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level filter (default: info)"),
            )
            .arg(
                Arg::new("grace-period")
                    .long("grace-period")
                    .value_name("DURATION")
                    .help("Shutdown grace period for in-flight requests (default: 1s)"),
            )
    }

    /// Load configuration from YAML file
    fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CounterError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            CounterError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        info!("Configuration loaded from file: {}", path);
        Ok(config)
    }

    /// Apply environment variable overrides; empty values are ignored
    pub fn apply_env_overrides(&mut self, env: &dyn Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        if let Some(endpoints) = var("ETCD_ENDPOINTS") {
            self.coordination.endpoints = split_endpoints(&endpoints);
        }
        if let Some(pod_name) = var("MY_POD_NAME") {
            self.identity.pod_name = pod_name;
        }
        if let Some(node_name) = var("MY_NODE_NAME") {
            self.identity.node_name = node_name;
        }
        if let Some(addr) = var("SERVER_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Some(log_level) = var("LOG_LEVEL") {
            self.logging.log_level = log_level;
        }
        if let Some(app_log_dir) = var("APP_LOG_DIR") {
            self.logging.app_log_dir = Some(PathBuf::from(app_log_dir));
        }
        if let Some(grace) = var("SHUTDOWN_GRACE_PERIOD") {
            self.shutdown.grace_period = parse_duration_setting("SHUTDOWN_GRACE_PERIOD", &grace)?;
        }
        Ok(())
    }

    /// Apply command line argument overrides
    fn apply_cli_overrides(&mut self, matches: &ArgMatches) -> Result<()> {
        if let Some(addr) = matches.get_one::<String>("server-addr") {
            self.server.listen_addr = addr.clone();
        }
        if let Some(endpoints) = matches.get_one::<String>("etcd-endpoints") {
            self.coordination.endpoints = split_endpoints(endpoints);
        }
        if let Some(log_level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = log_level.clone();
        }
        if let Some(grace) = matches.get_one::<String>("grace-period") {
            self.shutdown.grace_period = parse_duration_setting("--grace-period", grace)?;
        }
        Ok(())
    }

    /// Validate the full configuration
    pub fn validate(&self) -> Result<()> {
        self.server.socket_addr()?;

        self.coordination.validate().map_err(|e| {
            CounterError::ConfigError(format!("Invalid coordination configuration: {}", e))
        })?;

        self.shutdown.validate().map_err(|e| {
            CounterError::ConfigError(format!("Invalid shutdown configuration: {}", e))
        })?;

        Ok(())
    }
}

/// Split a comma-separated endpoint list, dropping blanks
fn split_endpoints(raw: &str) -> Vec<String> {
    let endpoints: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect();
    if endpoints.len() > 1 {
        info!("Configuring etcd with endpoints {:?}", endpoints);
    }
    endpoints
}

fn parse_duration_setting(name: &str, value: &str) -> Result<Duration> {
    duration_serde::parse_duration(value)
        .map_err(|e| CounterError::ConfigError(format!("Invalid duration for {}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_default_settings() {
        let config = Config::load_from(["etcd-counter"], &no_env).unwrap();

        assert_eq!(
            config.server.socket_addr().unwrap(),
            "0.0.0.0:8080".parse().unwrap()
        );
        assert_eq!(config.coordination.endpoints, vec!["http://0.0.0.0:2379"]);
        assert_eq!(config.coordination.counter_key, "key");
        assert_eq!(config.coordination.lock_name, "/distributed-lock/");
        assert_eq!(config.coordination.lease_ttl, Duration::from_secs(60));
        assert!(config.coordination.request_timeout.is_none());
        assert_eq!(config.identity.pod_name, "unknown");
        assert_eq!(config.identity.node_name, "unknown");
        assert_eq!(config.shutdown.grace_period, Duration::from_secs(1));
    }

    #[test]
    fn test_port_shorthand_binds_all_interfaces() {
        let server = ServerConfig {
            listen_addr: ":9090".to_string(),
        };
        assert_eq!(server.socket_addr().unwrap(), "0.0.0.0:9090".parse().unwrap());

        let server = ServerConfig {
            listen_addr: "not-an-address".to_string(),
        };
        assert!(matches!(
            server.socket_addr(),
            Err(CounterError::ConfigError(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ETCD_ENDPOINTS", "http://etcd-0:2379, http://etcd-1:2379,,http://etcd-2:2379"),
            ("MY_POD_NAME", "counter-7f9c"),
            ("MY_NODE_NAME", "worker-2"),
            ("SHUTDOWN_GRACE_PERIOD", "250ms"),
        ]
        .into_iter()
        .collect();
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());

        let config = Config::load_from(["etcd-counter"], &lookup).unwrap();
        assert_eq!(
            config.coordination.endpoints,
            vec!["http://etcd-0:2379", "http://etcd-1:2379", "http://etcd-2:2379"]
        );
        assert_eq!(config.identity.pod_name, "counter-7f9c");
        assert_eq!(config.identity.node_name, "worker-2");
        assert_eq!(config.shutdown.grace_period, Duration::from_millis(250));
    }

    #[test]
    fn test_empty_env_values_keep_defaults() {
        let lookup = |key: &str| match key {
            "MY_POD_NAME" | "ETCD_ENDPOINTS" => Some(String::new()),
            _ => None,
        };

        let config = Config::load_from(["etcd-counter"], &lookup).unwrap();
        assert_eq!(config.identity.pod_name, "unknown");
        assert_eq!(config.coordination.endpoints, vec!["http://0.0.0.0:2379"]);
    }

    #[test]
    fn test_cli_overrides_env() {
        let lookup = |key: &str| match key {
            "SERVER_ADDR" => Some("0.0.0.0:7000".to_string()),
            "ETCD_ENDPOINTS" => Some("http://from-env:2379".to_string()),
            _ => None,
        };

        let config = Config::load_from(
            [
                "etcd-counter",
                "--server-addr",
                ":8081",
                "--etcd-endpoints",
                "http://a:2379,http://b:2379",
                "--grace-period",
                "3s",
            ],
            &lookup,
        )
        .unwrap();

        assert_eq!(config.server.listen_addr, ":8081");
        assert_eq!(
            config.coordination.endpoints,
            vec!["http://a:2379", "http://b:2379"]
        );
        assert_eq!(config.shutdown.grace_period, Duration::from_secs(3));
    }

    #[test]
    fn test_yaml_file_with_env_on_top() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
server:
  listen_addr: "127.0.0.1:8000"
coordination:
  endpoints: ["http://etcd:2379"]
  counter_key: "counter"
  lease_ttl: "30s"
  request_timeout: "10s"
shutdown:
  grace_period: "2s"
logging:
  log_level: "debug"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let lookup = |key: &str| (key == "MY_NODE_NAME").then(|| "node-a".to_string());
        let config = Config::load_from(["etcd-counter", "--config", path.as_str()], &lookup).unwrap();

        assert_eq!(config.server.listen_addr, "127.0.0.1:8000");
        assert_eq!(config.coordination.counter_key, "counter");
        // Fields missing from the file keep their defaults
        assert_eq!(config.coordination.lock_name, "/distributed-lock/");
        assert_eq!(config.coordination.lease_ttl, Duration::from_secs(30));
        assert_eq!(
            config.coordination.request_timeout,
            Some(Duration::from_secs(10))
        );
        assert_eq!(config.shutdown.grace_period, Duration::from_secs(2));
        assert_eq!(config.logging.log_level, "debug");
        assert_eq!(config.identity.node_name, "node-a");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.coordination.endpoints.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.coordination.lease_ttl = Duration::from_millis(200);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.shutdown.close_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let result = Config::load_from(["etcd-counter", "--grace-period", "soon"], &no_env);
        assert!(matches!(result, Err(CounterError::ConfigError(_))));

        let huge = |name: &str| match name {
            "SHUTDOWN_GRACE_PERIOD" => Some("99999999999999999999999h".to_string()),
            _ => None,
        };
        let result = Config::load_from(["etcd-counter"], &huge);
        assert!(matches!(result, Err(CounterError::ConfigError(_))));
    }

    #[test]
    fn test_duration_parsing() {
        use duration_serde::parse_duration;
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1.5").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10 fortnights").is_err());
        assert!(parse_duration("99999999999999999999999h").is_err());
    }
}
