// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Buffer configuration with strict validation.
//!
//! Configuration comes either from a YAML file (`ConfigLoader`) or is built in
//! code with `BufferConfig::new`. Option tokens such as `MUTEX=MAO BSEM=0x20`
//! can be layered on top with `BufferConfig::apply_options`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{BufferName, IpcKey, Timeout};

/// Protocol versions above this carry the 32-byte name tag header.
const HEADER_VERSION_THRESHOLD: f64 = 2.57;

/// Whether this process creates the shared resources or attaches to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    #[default]
    Attacher,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Attacher => write!(f, "attacher"),
        }
    }
}

/// Mutual exclusion policy guarding the data region, selected by `MUTEX=<token>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExclusionKind {
    #[serde(rename = "NONE")]
    None,
    #[default]
    #[serde(rename = "OS_SEM")]
    OsSemaphore,
    #[serde(rename = "NO_INTERRUPTS")]
    NoInterrupts,
    #[serde(rename = "NO_SWITCHING")]
    NoSwitching,
    #[serde(rename = "MAO")]
    Mao,
    #[serde(rename = "MAO_W_OS_SEM")]
    MaoWithOsSemaphore,
}

impl ExclusionKind {
    /// Configuration token for this variant.
    pub const fn token(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::OsSemaphore => "OS_SEM",
            Self::NoInterrupts => "NO_INTERRUPTS",
            Self::NoSwitching => "NO_SWITCHING",
            Self::Mao => "MAO",
            Self::MaoWithOsSemaphore => "MAO_W_OS_SEM",
        }
    }

    /// Strategies that need an OS semaphore keyed like the segment.
    pub const fn needs_os_semaphore(&self) -> bool {
        matches!(self, Self::OsSemaphore | Self::MaoWithOsSemaphore)
    }

    /// Strategies that arbitrate through the per-connection table.
    pub const fn uses_connection_slots(&self) -> bool {
        matches!(self, Self::Mao | Self::MaoWithOsSemaphore)
    }
}

impl fmt::Display for ExclusionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for ExclusionKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(Self::None),
            "OS_SEM" => Ok(Self::OsSemaphore),
            "NO_INTERRUPTS" => Ok(Self::NoInterrupts),
            "NO_SWITCHING" => Ok(Self::NoSwitching),
            "MAO" => Ok(Self::Mao),
            "MAO_W_OS_SEM" => Ok(Self::MaoWithOsSemaphore),
            other => Err(ConfigError::InvalidFieldValue {
                field: "mutex",
                value: other.to_string(),
                reason: "Expected NONE, OS_SEM, NO_INTERRUPTS, NO_SWITCHING, MAO or MAO_W_OS_SEM"
                    .to_string(),
            }),
        }
    }
}

fn default_timeout() -> f64 {
    -1.0 // wait forever
}

fn default_sem_delay() -> f64 {
    0.00001
}

fn default_total_connections() -> usize {
    1
}

fn default_mode() -> u32 {
    0o666
}

fn default_mutex() -> String {
    ExclusionKind::OsSemaphore.token().to_string()
}

/// Raw buffer configuration as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
struct RawBufferConfig {
    name: String,
    key: i32,
    size: usize,
    #[serde(default)]
    role: Role,
    #[serde(default = "default_mutex")]
    mutex: String,
    #[serde(default = "default_timeout")]
    timeout: f64,
    #[serde(default)]
    bsem: Option<i32>,
    #[serde(default = "default_sem_delay")]
    semdelay: f64,
    #[serde(default)]
    connection: i64,
    #[serde(default = "default_total_connections")]
    total_connections: usize,
    #[serde(default)]
    min_compatible_version: f64,
    #[serde(default = "default_mode")]
    mode: u32,
    #[serde(default)]
    autokey_table_size: usize,
    #[serde(default)]
    delete_totally: bool,
    #[serde(default)]
    options: Option<String>,
}

/// Raw root configuration file.
#[derive(Debug, Deserialize)]
struct RawConfig {
    buffer: RawBufferConfig,
}

/// Validated configuration of one shared memory buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub name: BufferName,
    pub key: IpcKey,
    /// Requested segment size in bytes, header included.
    pub size: usize,
    pub role: Role,
    pub exclusion: ExclusionKind,
    /// Exclusion acquisition timeout.
    pub timeout: Timeout,
    /// Key of the blocking notifier semaphore, if any.
    pub notifier_key: Option<IpcKey>,
    /// Back-off between MAO acquisition attempts.
    pub sem_delay: Duration,
    pub connection_index: i64,
    pub total_connections: usize,
    pub min_compatible_version: f64,
    /// Permission bits for created segments and semaphores.
    pub mode: u32,
    pub autokey_table_size: usize,
    /// Destroy shared resources on close even when other processes are attached.
    pub delete_totally: bool,
}

impl BufferConfig {
    /// Configuration with defaults: attacher, OS semaphore, no timeout, no notifier.
    pub fn new(name: BufferName, key: impl Into<IpcKey>, size: usize) -> Self {
        Self {
            name,
            key: key.into(),
            size,
            role: Role::Attacher,
            exclusion: ExclusionKind::default(),
            timeout: Timeout::from_secs_f64(default_timeout()),
            notifier_key: None,
            sem_delay: Duration::from_secs_f64(default_sem_delay()),
            connection_index: 0,
            total_connections: default_total_connections(),
            min_compatible_version: 0.0,
            mode: default_mode(),
            autokey_table_size: 0,
            delete_totally: false,
        }
    }

    /// Whether the 32-byte name tag header is reserved and checked.
    pub fn header_validation_enabled(&self) -> bool {
        self.min_compatible_version > HEADER_VERSION_THRESHOLD
            || self.min_compatible_version <= 0.0
    }

    /// Apply whitespace separated option tokens.
    ///
    /// Recognised: `MUTEX=<kind>`, `BSEM=<int>`, `SEMDELAY=<float>`. Later tokens win;
    /// anything else on the line is ignored.
    pub fn apply_options(&mut self, line: &str) -> Result<(), ConfigError> {
        for token in line.split_whitespace() {
            let upper = token.to_ascii_uppercase();
            let (field, value) = match upper.split_once('=') {
                Some(pair) => pair,
                None => {
                    if upper == "MAO_W_OS_SEM" {
                        self.exclusion = ExclusionKind::MaoWithOsSemaphore;
                    }
                    continue;
                }
            };

            match field {
                "MUTEX" => self.exclusion = value.parse()?,
                "BSEM" => {
                    let key = parse_c_integer(value).ok_or_else(|| {
                        ConfigError::InvalidFieldValue {
                            field: "bsem",
                            value: value.to_string(),
                            reason: "Expected an integer key".to_string(),
                        }
                    })?;
                    self.notifier_key = (key > 0).then(|| IpcKey::new(key));
                }
                "SEMDELAY" => {
                    let secs: f64 =
                        value
                            .parse()
                            .map_err(|_| ConfigError::InvalidFieldValue {
                                field: "semdelay",
                                value: value.to_string(),
                                reason: "Expected a number of seconds".to_string(),
                            })?;
                    self.sem_delay = sem_delay_from_secs(secs)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Check field bounds that do not depend on the shared segment.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size == 0 {
            return Err(ConfigError::InvalidFieldValue {
                field: "size",
                value: "0".to_string(),
                reason: "Buffer size must be greater than 0".to_string(),
            });
        }

        if self.total_connections == 0 {
            return Err(ConfigError::InvalidFieldValue {
                field: "total_connections",
                value: "0".to_string(),
                reason: "At least one connection is required".to_string(),
            });
        }

        if self.mode > 0o777 {
            return Err(ConfigError::InvalidFieldValue {
                field: "mode",
                value: format!("{:o}", self.mode),
                reason: "Mode must only contain permission bits".to_string(),
            });
        }

        Ok(())
    }
}

fn sem_delay_from_secs(secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidFieldValue {
        field: "semdelay",
        value: secs.to_string(),
        reason: "Delay must be a non-negative, representable number of seconds".to_string(),
    })
}

/// Parse an integer the way `strtol(s, NULL, 0)` does: `0x` hex, leading `0` octal.
fn parse_c_integer(s: &str) -> Option<i32> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let value = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16).ok()?
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8).ok()?
    } else {
        digits.parse::<i64>().ok()?
    };
    let value = if negative { -value } else { value };
    i32::try_from(value).ok()
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<BufferConfig, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> Result<BufferConfig, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            message: format!("YAML parse error: {}", e),
        })?;

        Self::validate(raw.buffer)
    }

    fn validate(raw: RawBufferConfig) -> Result<BufferConfig, ConfigError> {
        let name = BufferName::new(raw.name)?;

        let mut config = BufferConfig::new(name, raw.key, raw.size);
        config.role = raw.role;
        config.exclusion = raw.mutex.parse()?;
        config.timeout = Timeout::from_secs_f64(raw.timeout);
        config.notifier_key = raw.bsem.filter(|key| *key > 0).map(IpcKey::new);
        config.sem_delay = sem_delay_from_secs(raw.semdelay)?;
        config.connection_index = raw.connection;
        config.total_connections = raw.total_connections;
        config.min_compatible_version = raw.min_compatible_version;
        config.mode = raw.mode;
        config.autokey_table_size = raw.autokey_table_size;
        config.delete_totally = raw.delete_totally;

        if let Some(options) = raw.options.as_deref() {
            config.apply_options(options)?;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_CONFIG: &str = r#"
buffer:
  name: joint-status
  key: 1001
  size: 8192
  role: master
  mutex: MAO
  timeout: 2.5
  bsem: 1002
  connection: 1
  total_connections: 4
"#;

    fn config() -> BufferConfig {
        BufferConfig::new(BufferName::new("test").unwrap(), 42, 4096)
    }

    #[test]
    fn test_valid_config() {
        let config = ConfigLoader::load_string(VALID_CONFIG).unwrap();
        assert_eq!(config.name.as_str(), "joint-status");
        assert_eq!(config.key, IpcKey::new(1001));
        assert_eq!(config.role, Role::Master);
        assert_eq!(config.exclusion, ExclusionKind::Mao);
        assert_eq!(config.timeout.as_secs_f64(), 2.5);
        assert_eq!(config.notifier_key, Some(IpcKey::new(1002)));
        assert_eq!(config.connection_index, 1);
        assert_eq!(config.total_connections, 4);
    }

    #[test]
    fn test_defaults_applied() {
        let yaml = r#"
buffer:
  name: minimal
  key: 7
  size: 1024
"#;
        let config = ConfigLoader::load_string(yaml).unwrap();
        assert_eq!(config.role, Role::Attacher);
        assert_eq!(config.exclusion, ExclusionKind::OsSemaphore);
        assert!(config.timeout.is_forever());
        assert_eq!(config.notifier_key, None);
        assert_eq!(config.sem_delay, Duration::from_secs_f64(0.00001));
        assert_eq!(config.mode, 0o666);
        assert!(config.header_validation_enabled());
    }

    #[test]
    fn test_options_override_fields() {
        let yaml = r#"
buffer:
  name: tokens
  key: 7
  size: 1024
  mutex: NONE
  options: "SHMEM mutex=mao_w_os_sem BSEM=0x20 SEMDELAY=0.5"
"#;
        let config = ConfigLoader::load_string(yaml).unwrap();
        assert_eq!(config.exclusion, ExclusionKind::MaoWithOsSemaphore);
        assert_eq!(config.notifier_key, Some(IpcKey::new(0x20)));
        assert_eq!(config.sem_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_name() {
        let yaml = r#"
buffer:
  name: this-name-is-definitely-longer-than-31-bytes
  key: 7
  size: 1024
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_invalid_mutex() {
        let yaml = r#"
buffer:
  name: x
  key: 7
  size: 1024
  mutex: SPINNY
"#;
        assert!(matches!(
            ConfigLoader::load_string(yaml),
            Err(ConfigError::InvalidFieldValue { field: "mutex", .. })
        ));
    }

    #[test]
    fn test_zero_size_rejected() {
        let yaml = r#"
buffer:
  name: x
  key: 7
  size: 0
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            ConfigLoader::load_file("/nonexistent/shmbuf.yaml"),
            Err(ConfigError::NotFound { .. })
        ));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("buffer.yaml");
        std::fs::write(&path, VALID_CONFIG).unwrap();
        let config = ConfigLoader::load_file(&path).unwrap();
        assert_eq!(config.size, 8192);
    }

    #[test]
    fn test_apply_options_each_mutex_token() {
        let mut cfg = config();
        for kind in [
            ExclusionKind::None,
            ExclusionKind::OsSemaphore,
            ExclusionKind::NoInterrupts,
            ExclusionKind::NoSwitching,
            ExclusionKind::Mao,
            ExclusionKind::MaoWithOsSemaphore,
        ] {
            cfg.apply_options(&format!("MUTEX={}", kind.token())).unwrap();
            assert_eq!(cfg.exclusion, kind);
        }
    }

    #[test]
    fn test_bsem_disabled_by_non_positive_key() {
        let mut cfg = config();
        cfg.apply_options("BSEM=17").unwrap();
        assert_eq!(cfg.notifier_key, Some(IpcKey::new(17)));
        cfg.apply_options("BSEM=0").unwrap();
        assert_eq!(cfg.notifier_key, None);
        assert!(cfg.apply_options("BSEM=abc").is_err());
    }

    #[test]
    fn test_negative_semdelay_rejected() {
        let mut cfg = config();
        assert!(cfg.apply_options("SEMDELAY=-1").is_err());
    }

    #[test]
    fn test_huge_semdelay_rejected() {
        let mut cfg = config();
        for token in ["SEMDELAY=1e30", "SEMDELAY=inf", "SEMDELAY=NaN"] {
            assert!(matches!(
                cfg.apply_options(token),
                Err(ConfigError::InvalidFieldValue { field: "semdelay", .. })
            ));
        }
        assert_eq!(cfg.sem_delay, config().sem_delay);

        let yaml = r#"
buffer:
  name: slow
  key: 7
  size: 1024
  semdelay: 1.0e30
"#;
        assert!(matches!(
            ConfigLoader::load_string(yaml),
            Err(ConfigError::InvalidFieldValue { field: "semdelay", .. })
        ));
    }

    #[test]
    fn test_parse_c_integer() {
        assert_eq!(parse_c_integer("42"), Some(42));
        assert_eq!(parse_c_integer("0x1F"), Some(31));
        assert_eq!(parse_c_integer("010"), Some(8));
        assert_eq!(parse_c_integer("0"), Some(0));
        assert_eq!(parse_c_integer("-5"), Some(-5));
        assert_eq!(parse_c_integer("zz"), None);
    }

    #[test]
    fn test_header_validation_versions() {
        let mut cfg = config();
        cfg.min_compatible_version = 2.0;
        assert!(!cfg.header_validation_enabled());
        cfg.min_compatible_version = 3.0;
        assert!(cfg.header_validation_enabled());
        cfg.min_compatible_version = 0.0;
        assert!(cfg.header_validation_enabled());
    }
}
