//! Configuration for the relay server.
//!
//! Configuration can be loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `BR__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! See [`Config`] for a description of all configuration fields and their defaults.
//!
//! # Environment Variables
//!
//! Environment variables use `BR__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `BR__HTTP_ADDR=0.0.0.0:8888` sets the HTTP server address
//! - `BR__UPSTREAM__TYPE=http` selects the HTTP block gateway
//! - `BR__UPSTREAM__ENDPOINT=http://gateway:9000` sets the gateway address
//! - `BR__WORKERS=[token-a,token-b]` provisions two workers
//!
//! # YAML Configuration File
//!
//! The above configuration in YAML format would look like this:
//!
//! ```yaml
//! http_addr: 0.0.0.0:8888
//!
//! upstream:
//!   type: http
//!   endpoint: http://gateway:9000
//!   home_shard: 1
//!
//! workers:
//!   - token-a
//!   - token-b
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use blockrelay_service::ShardId;
use blockrelay_service::range::{DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE, is_valid_block_size};
use blockrelay_service::registry::ObjectRecord;
use blockrelay_service::relay::RelayOptions;
use blockrelay_service::source::UpstreamConfig;
use figment::providers::{Env, Format, Serialized, Yaml};
use secrecy::{CloneableSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "BR__";

/// Newtype around `String` that may protect against accidental
/// logging of secrets in our configuration struct. Use with
/// [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    /// Returns the secret value.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl std::ops::Deref for ConfigSecret {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// Upstream block store configuration.
///
/// The `type` field in YAML or `__TYPE` in environment variables determines which variant is used.
///
/// Used in: [`Config::upstream`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Upstream {
    /// Shard directories on the local filesystem (type `"filesystem"`).
    ///
    /// Objects are read from `<path>/shard-<id>/<object id>.bin`. Suitable for development and
    /// testing.
    ///
    /// # Example
    ///
    /// ```yaml
    /// upstream:
    ///   type: filesystem
    ///   path: /data
    ///   home_shard: 1
    /// ```
    FileSystem {
        /// Directory containing one directory per shard.
        ///
        /// # Environment Variable
        ///
        /// `BR__UPSTREAM__PATH`
        path: PathBuf,

        /// The shard worker credentials are native to.
        ///
        /// # Environment Variable
        ///
        /// `BR__UPSTREAM__HOME_SHARD`
        home_shard: ShardId,
    },

    /// An HTTP block gateway (type `"http"`).
    ///
    /// # Example
    ///
    /// ```yaml
    /// upstream:
    ///   type: http
    ///   endpoint: http://gateway:9000
    ///   home_shard: 2
    /// ```
    Http {
        /// Base URL of the gateway.
        ///
        /// # Environment Variable
        ///
        /// `BR__UPSTREAM__ENDPOINT`
        endpoint: String,

        /// The shard worker credentials are native to.
        ///
        /// # Environment Variable
        ///
        /// `BR__UPSTREAM__HOME_SHARD`
        home_shard: ShardId,
    },
}

impl Upstream {
    /// Returns the connector configuration for this upstream.
    pub fn as_connector_config(&self) -> UpstreamConfig<'_> {
        match self {
            Upstream::FileSystem { path, home_shard } => UpstreamConfig::FileSystem {
                path,
                home_shard: *home_shard,
            },
            Upstream::Http {
                endpoint,
                home_shard,
            } => UpstreamConfig::Http {
                endpoint,
                home_shard: *home_shard,
            },
        }
    }
}

/// Relay stream configuration.
///
/// Used in: [`Config::relay`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Relay {
    /// Size of the blocks fetched from upstream shards, in bytes.
    ///
    /// Must be a power of two and at least 4 KiB.
    ///
    /// # Default
    ///
    /// `524288` (512 KiB)
    ///
    /// # Environment Variable
    ///
    /// `BR__RELAY__BLOCK_SIZE`
    pub block_size: u32,

    /// Upper bound for a single block fetch, for example `30s`.
    ///
    /// A stalled fetch otherwise holds its stream and the worker's load indefinitely. When the
    /// timeout expires, the download is cut off.
    ///
    /// # Default
    ///
    /// `None` (no timeout)
    ///
    /// # Environment Variable
    ///
    /// `BR__RELAY__FETCH_TIMEOUT`
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Option<Duration>,
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            fetch_timeout: None,
        }
    }
}

impl Relay {
    /// Returns the options for the relay streams of all workers.
    pub fn options(&self) -> RelayOptions {
        RelayOptions {
            block_size: self.block_size,
            fetch_timeout: self.fetch_timeout,
        }
    }
}

/// Object registry configuration.
///
/// Objects from both sources are merged. Entries in `objects` take precedence over entries of the
/// same name in the file at `path`.
///
/// Used in: [`Config::registry`]
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Registry {
    /// Objects keyed by their public reference.
    ///
    /// # YAML Example
    ///
    /// ```yaml
    /// registry:
    ///   objects:
    ///     intro:
    ///       file_id: 9UwBAAEAAAA...
    ///       size: 2000000
    ///       name: intro.mp4
    ///       media_type: video/mp4
    /// ```
    pub objects: BTreeMap<String, ObjectRecord>,

    /// Path to a JSON file with further objects, in the same shape as `objects`.
    ///
    /// # Environment Variable
    ///
    /// `BR__REGISTRY__PATH`
    pub path: Option<PathBuf>,
}

/// Runtime configuration for the Tokio async runtime.
///
/// Used in: [`Config::runtime`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Runtime {
    /// Number of worker threads for the server runtime.
    ///
    /// # Default
    ///
    /// Defaults to the number of CPU cores on the host machine.
    ///
    /// # Environment Variable
    ///
    /// `BR__RUNTIME__WORKER_THREADS`
    pub worker_threads: usize,

    /// Interval for reporting worker load metrics.
    ///
    /// Defaults to `10s`.
    #[serde(with = "humantime_serde")]
    pub metrics_interval: Duration,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
            metrics_interval: Duration::from_secs(10),
        }
    }
}

/// [Sentry](https://sentry.io/) error tracking and performance monitoring configuration.
///
/// Sentry is disabled by default and only enabled when a DSN is provided.
///
/// Used in: [`Config::sentry`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Sentry {
    /// Sentry DSN. When `None`, Sentry integration is disabled.
    ///
    /// # Environment Variable
    ///
    /// `BR__SENTRY__DSN`
    pub dsn: Option<SecretBox<ConfigSecret>>,

    /// Environment name for this deployment, such as `"production"`.
    ///
    /// # Environment Variable
    ///
    /// `BR__SENTRY__ENVIRONMENT`
    pub environment: Option<Cow<'static, str>>,

    /// Server name or identifier, such as the hostname or pod name.
    ///
    /// # Environment Variable
    ///
    /// `BR__SENTRY__SERVER_NAME`
    pub server_name: Option<Cow<'static, str>>,

    /// Error event sampling rate between `0.0` and `1.0`.
    ///
    /// # Default
    ///
    /// `1.0` (send all errors)
    ///
    /// # Environment Variable
    ///
    /// `BR__SENTRY__SAMPLE_RATE`
    pub sample_rate: f32,

    /// Performance trace sampling rate between `0.0` and `1.0`.
    ///
    /// # Default
    ///
    /// `0.01` (send 1% of traces)
    ///
    /// # Environment Variable
    ///
    /// `BR__SENTRY__TRACES_SAMPLE_RATE`
    pub traces_sample_rate: f32,

    /// Enable Sentry SDK debug mode.
    ///
    /// # Default
    ///
    /// `false`
    ///
    /// # Environment Variable
    ///
    /// `BR__SENTRY__DEBUG`
    pub debug: bool,

    /// Additional tags to attach to all Sentry events.
    ///
    /// # Environment Variables
    ///
    /// Each tag is set individually:
    /// - `BR__SENTRY__TAGS__FOO=foo`
    /// - `BR__SENTRY__TAGS__BAR=bar`
    pub tags: BTreeMap<String, String>,
}

impl Sentry {
    /// Returns whether Sentry integration is enabled.
    ///
    /// Sentry is considered enabled if a DSN is configured.
    pub fn is_enabled(&self) -> bool {
        self.dsn.is_some()
    }
}

impl Default for Sentry {
    fn default() -> Self {
        Self {
            dsn: None,
            environment: None,
            server_name: None,
            sample_rate: 1.0,
            traces_sample_rate: 0.01,
            debug: false,
            tags: BTreeMap::new(),
        }
    }
}

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO  blockrelay_server::web > HTTP server listening on 0.0.0.0:8888
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2025-07-04T12:10:32Z [blockrelay_server::web] INFO: HTTP server listening on 0.0.0.0:8888
    /// ```
    Simplified,

    /// Dump out JSON lines.
    ///
    /// ```text
    /// {"timestamp":"2025-07-04T12:11:08.729716Z","level":"INFO","fields":{"message":"HTTP server listening on 0.0.0.0:8888"},"target":"blockrelay_server::web"}
    /// ```
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

impl std::error::Error for FormatParseError {}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr.
///
/// Used in: [`Config::logging`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output: TRACE, DEBUG, INFO, WARN, ERROR or OFF.
    ///
    /// The `RUST_LOG` environment variable provides more granular control per module if needed.
    ///
    /// # Default
    ///
    /// `INFO`
    ///
    /// # Environment Variable
    ///
    /// `BR__LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format. See [`LogFormat`] for available options.
    ///
    /// # Default
    ///
    /// `Auto` (pretty for TTY, simplified otherwise)
    ///
    /// # Environment Variable
    ///
    /// `BR__LOGGING__FORMAT`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Metrics configuration.
///
/// Configures submission of internal metrics to Datadog.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Metrics {
    /// Datadog API key for metrics. When `None`, metrics are not submitted.
    ///
    /// # Environment Variable
    ///
    /// `BR__METRICS__DATADOG_KEY`
    pub datadog_key: Option<SecretBox<ConfigSecret>>,

    /// Global tags applied to all metrics.
    ///
    /// # Environment Variables
    ///
    /// Each tag is set individually:
    /// - `BR__METRICS__TAGS__FOO=foo`
    /// - `BR__METRICS__TAGS__BAR=bar`
    pub tags: BTreeMap<String, String>,
}

/// Main configuration struct for the relay server.
///
/// Configuration is merged from the following sources, with later sources overriding earlier
/// ones:
///
/// 1. Environment variables (highest priority)
/// 2. YAML configuration file (if provided via `-c` flag)
/// 3. Default values
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// HTTP server bind address.
    ///
    /// # Default
    ///
    /// `0.0.0.0:8888`
    ///
    /// # Environment Variable
    ///
    /// `BR__HTTP_ADDR`
    pub http_addr: SocketAddr,

    /// The upstream block store. See [`Upstream`] for available options.
    ///
    /// # Default
    ///
    /// Filesystem upstream in the `./data` directory with home shard `1`.
    pub upstream: Upstream,

    /// Worker credentials, one worker per entry.
    ///
    /// Credentials that fail to authenticate at startup are skipped. Without any working
    /// credential the server still starts, but reports not ready and rejects downloads.
    ///
    /// # Default
    ///
    /// Empty
    ///
    /// # Environment Variable
    ///
    /// `BR__WORKERS=[token-a,token-b]`
    pub workers: Vec<SecretBox<ConfigSecret>>,

    /// Relay stream configuration. See [`Relay`].
    pub relay: Relay,

    /// Object registry configuration. See [`Registry`].
    pub registry: Registry,

    /// Configuration of the internal task runtime. See [`Runtime`].
    pub runtime: Runtime,

    /// Logging configuration. See [`Logging`].
    pub logging: Logging,

    /// Sentry error tracking configuration. See [`Sentry`].
    pub sentry: Sentry,

    /// Internal metrics configuration. See [`Metrics`].
    pub metrics: Metrics,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8888)),
            upstream: Upstream::FileSystem {
                path: PathBuf::from("data"),
                home_shard: ShardId(1),
            },
            workers: Vec::new(),
            relay: Relay::default(),
            registry: Registry::default(),
            runtime: Runtime::default(),
            logging: Logging::default(),
            sentry: Sentry::default(),
            metrics: Metrics::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the provided arguments.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if `path` is given)
    /// 3. Environment variables (prefixed with `BR__`)
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML file cannot be read or parsed, if values are malformed, or if
    /// [`validate`](Self::validate) rejects the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Checks constraints that cannot be expressed in the configuration types.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_block_size(self.relay.block_size) {
            anyhow::bail!(
                "relay.block_size must be a power of two of at least {MIN_BLOCK_SIZE} bytes, got {}",
                self.relay.block_size
            );
        }

        if self.relay.fetch_timeout.is_some_and(|t| t.is_zero()) {
            anyhow::bail!("relay.fetch_timeout must not be zero");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("BR__UPSTREAM__TYPE", "http");
            jail.set_env("BR__UPSTREAM__ENDPOINT", "http://gateway:9000");
            jail.set_env("BR__UPSTREAM__HOME_SHARD", "2");
            jail.set_env("BR__WORKERS", "[token-a,token-b]");
            jail.set_env("BR__RELAY__BLOCK_SIZE", "1048576");
            jail.set_env("BR__RELAY__FETCH_TIMEOUT", "30s");
            jail.set_env("BR__METRICS__TAGS__FOO", "bar");
            jail.set_env("BR__SENTRY__DSN", "abcde");
            jail.set_env("BR__SENTRY__SAMPLE_RATE", "0.5");
            jail.set_env("BR__SENTRY__ENVIRONMENT", "production");

            let config = Config::load(None).unwrap();

            let Upstream::Http {
                endpoint,
                home_shard,
            } = &dbg!(&config).upstream
            else {
                panic!("expected http upstream");
            };
            assert_eq!(endpoint, "http://gateway:9000");
            assert_eq!(*home_shard, ShardId(2));

            let workers: Vec<&str> = config
                .workers
                .iter()
                .map(|w| w.expose_secret().as_str())
                .collect();
            assert_eq!(workers, ["token-a", "token-b"]);

            assert_eq!(config.relay.block_size, 1024 * 1024);
            assert_eq!(config.relay.fetch_timeout, Some(Duration::from_secs(30)));
            assert_eq!(config.metrics.tags, [("foo".into(), "bar".into())].into());
            assert_eq!(config.sentry.dsn.unwrap().expose_secret().as_str(), "abcde");
            assert_eq!(config.sentry.environment.as_deref(), Some("production"));
            assert_eq!(config.sentry.sample_rate, 0.5);

            Ok(())
        });
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            http_addr: 127.0.0.1:9999
            upstream:
                type: filesystem
                path: /srv/shards
                home_shard: 3
            workers:
                - secret-token
            registry:
                path: /etc/blockrelay/registry.json
                objects:
                    intro:
                        file_id: 9UwBAAEAAAA
                        size: 2000000
                        media_type: video/mp4
            logging:
                level: debug
                format: json
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(tempfile.path())).unwrap();

            assert_eq!(config.http_addr, SocketAddr::from(([127, 0, 0, 1], 9999)));
            let Upstream::FileSystem { path, home_shard } = &dbg!(&config).upstream else {
                panic!("expected filesystem upstream");
            };
            assert_eq!(path, Path::new("/srv/shards"));
            assert_eq!(*home_shard, ShardId(3));
            assert_eq!(config.workers.len(), 1);

            let intro = &config.registry.objects["intro"];
            assert_eq!(intro.size, 2_000_000);
            assert_eq!(intro.name, None);
            assert_eq!(intro.media_type.as_deref(), Some("video/mp4"));
            assert_eq!(
                config.registry.path.as_deref(),
                Some(Path::new("/etc/blockrelay/registry.json"))
            );

            assert_eq!(config.logging.level, LevelFilter::DEBUG);
            assert_eq!(config.logging.format, LogFormat::Json);
            assert_eq!(config.relay.block_size, DEFAULT_BLOCK_SIZE);
            assert_eq!(config.relay.fetch_timeout, None);

            Ok(())
        });
    }

    #[test]
    fn configured_with_env_and_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            upstream:
                type: http
                endpoint: http://gateway:9000
                home_shard: 1
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("BR__UPSTREAM__ENDPOINT", "http://gateway:9001");

            let config = Config::load(Some(tempfile.path())).unwrap();

            let Upstream::Http { endpoint, .. } = &dbg!(&config).upstream else {
                panic!("expected http upstream");
            };
            // Env should overwrite the yaml config
            assert_eq!(endpoint, "http://gateway:9001");

            Ok(())
        });
    }

    #[test]
    fn secrets_are_redacted() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("BR__WORKERS", "[super-secret-token]");
            jail.set_env("BR__METRICS__DATADOG_KEY", "datadog-secret");

            let config = Config::load(None).unwrap();
            let debug = format!("{config:?}");
            assert!(!debug.contains("super-secret-token"));
            assert!(!debug.contains("datadog-secret"));

            Ok(())
        });
    }

    #[test]
    fn rejects_invalid_block_size() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("BR__RELAY__BLOCK_SIZE", "100000");
            assert!(Config::load(None).is_err());

            jail.set_env("BR__RELAY__BLOCK_SIZE", "2048");
            assert!(Config::load(None).is_err());

            jail.set_env("BR__RELAY__BLOCK_SIZE", "4096");
            assert!(Config::load(None).is_ok());

            Ok(())
        });
    }

    #[test]
    fn rejects_zero_fetch_timeout() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("BR__RELAY__FETCH_TIMEOUT", "0s");
            assert!(Config::load(None).is_err());
            Ok(())
        });
    }
}
