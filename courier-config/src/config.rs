use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use courier_channel::ChannelConfig;
use courier_log::{Level, LogConfig};
use courier_metrics::MetricsConfig;
use serde::{Deserialize, Serialize};
use url::Url;

/// Name of the configuration file within the configuration directory.
const CONFIG_FILE_NAME: &str = "config.yml";

type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to save a file.
    #[error("could not write config file")]
    CouldNotWriteFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

/// Defines the origin of a config error.
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override, such as a CLI parameter.
    FieldOverride(String),
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    kind: ConfigErrorKind,
    origin: ConfigErrorSource,
    cause: Option<BoxError>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            kind,
            origin: ConfigErrorSource::None,
            cause: None,
        }
    }

    #[inline]
    fn wrap<E>(cause: E, kind: ConfigErrorKind) -> Self
    where
        E: Into<BoxError>,
    {
        Self {
            cause: Some(cause.into()),
            ..Self::new(kind)
        }
    }

    #[inline]
    fn for_field<E>(cause: E, field: &'static str) -> Self
    where
        E: Into<BoxError>,
    {
        Self::wrap(cause, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.origin = ConfigErrorSource::File(path.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.origin = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            ConfigErrorSource::None => self.kind.fmt(f),
            ConfigErrorSource::File(path) => write!(f, "{} (file {})", self.kind, path.display()),
            ConfigErrorSource::FieldOverride(name) => write!(f, "{} (field {name})", self.kind),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|cause| cause as &(dyn Error + 'static))
    }
}

/// Values overriding the configuration file, typically from command line arguments.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The ingestion endpoint URL.
    pub endpoint: Option<String>,
    /// The log level of Courier's crates.
    pub log_level: Option<String>,
    /// The interval between regular transmissions in milliseconds.
    pub sending_interval_ms: Option<String>,
}

/// Controls internal metrics of Courier.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StatsdConfig {
    /// Address of the statsd server. Internal metrics are disabled if not set.
    pub host: Option<String>,
    /// Prefix prepended to all metric names.
    pub prefix: String,
    /// Tags added to all metrics.
    pub default_tags: BTreeMap<String, String>,
    /// Fraction of metrics sent to the server, between `0.0` and `1.0`.
    pub sample_rate: f64,
}

impl Default for StatsdConfig {
    fn default() -> Self {
        Self {
            host: None,
            prefix: "courier".to_owned(),
            default_tags: BTreeMap::new(),
            sample_rate: 1.0,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct ConfigValues {
    logging: LogConfig,
    metrics: MetricsConfig,
    channel: ChannelConfig,
    statsd: StatsdConfig,
}

/// Courier's configuration.
#[derive(Clone, Debug, Default)]
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl Config {
    /// Loads the configuration from `config.yml` in the given directory.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let file = Self::file_path(&path);

        let contents = fs::read_to_string(&file)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&file))?;

        let values = if contents.trim().is_empty() {
            ConfigValues::default()
        } else {
            serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&file))?
        };

        Ok(Self { values, path })
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        Ok(Self {
            values: serde_json::from_value(value)
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadJson))?,
            path: PathBuf::new(),
        })
    }

    fn file_path(base: &Path) -> PathBuf {
        base.join(CONFIG_FILE_NAME)
    }

    /// Override configuration with values coming from other sources.
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        if let Some(endpoint) = overrides.endpoint {
            Url::parse(&endpoint).map_err(|e| ConfigError::for_field(e, "endpoint"))?;
            self.values.channel.endpoint = endpoint;
        }

        if let Some(level) = overrides.log_level {
            self.values.logging.level = level
                .parse::<Level>()
                .map_err(|e| ConfigError::for_field(e, "log_level"))?;
        }

        if let Some(interval) = overrides.sending_interval_ms {
            self.values.channel.sending_interval_ms = interval
                .trim()
                .parse()
                .map_err(|e| ConfigError::for_field(e, "sending_interval_ms"))?;
        }

        Ok(self)
    }

    /// Writes the configuration to `config.yml` in the given directory, creating the directory
    /// if needed.
    pub fn save_in_folder<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        fs::create_dir_all(path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile).file(path))?;

        let file = Self::file_path(path);
        let yaml = self.to_yaml_string().map_err(|e| e.file(&file))?;

        fs::File::create(&file)
            .and_then(|mut f| f.write_all(yaml.as_bytes()))
            .map_err(|e: io::Error| {
                ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile).file(&file)
            })
    }

    /// Returns the directory the config was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dumps out a YAML string of the values.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile))
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns the metric aggregation configuration.
    pub fn metrics(&self) -> &MetricsConfig {
        &self.values.metrics
    }

    /// Returns the telemetry channel configuration.
    pub fn channel(&self) -> &ChannelConfig {
        &self.values.channel
    }

    /// Returns the internal metrics configuration.
    pub fn statsd(&self) -> &StatsdConfig {
        &self.values.statsd
    }
}
