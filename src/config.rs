use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filter::FilterRule;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse config file: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Missing '{field}' in {section} configuration")]
    MissingField { section: &'static str, field: &'static str },

    #[error("Invalid {section} configuration: {reason}")]
    Invalid { section: &'static str, reason: String },

    #[error("Invalid filter pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImapSecurity {
    None,
    StartTLS,
    SSL,
}

impl Default for ImapSecurity {
    fn default() -> Self {
        ImapSecurity::SSL
    }
}

/// Which messages the first run of a sync covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Everything in the mailbox.
    All,
    /// Only messages that arrive from now on.
    New,
    /// Everything after the stored checkpoint.
    #[serde(alias = "since-last-sync")]
    SinceLastSync,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::New
    }
}

impl FromStr for SyncMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(SyncMode::All),
            "new" => Ok(SyncMode::New),
            "sincelastsync" | "since-last-sync" => Ok(SyncMode::SinceLastSync),
            other => Err(ConfigError::Invalid {
                section: "options",
                reason: format!("unknown sync mode '{}'", other),
            }),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::All => write!(f, "all"),
            SyncMode::New => write!(f, "new"),
            SyncMode::SinceLastSync => write!(f, "sincelastsync"),
        }
    }
}

/// One side of the mirror as written in the config file. Which fields are
/// present decides whether it is a server, a local directory or an
/// auto-responder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub server: Option<String>,
    pub port: Option<u16>,
    pub security: Option<ImapSecurity>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub folder: Option<String>,
    pub uidfile: Option<String>,

    pub path: Option<String>,
    pub compress: Option<bool>,

    pub autoresponder_file: Option<String>,
    pub ignore_from: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub bcc: Option<String>,
    pub default_subject: Option<String>,
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    #[serde(default)]
    pub syncmode: SyncMode,
    #[serde(default, rename = "move")]
    pub move_messages: bool,
    #[serde(default = "default_true")]
    pub watch: bool,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_max_connection_age_secs")]
    pub max_connection_age_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_keepalive_secs() -> u64 {
    5 * 60
}

fn default_max_connection_age_secs() -> u64 {
    60 * 60
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_idle_timeout_secs() -> u64 {
    60
}

impl Default for Options {
    fn default() -> Self {
        Self {
            syncmode: SyncMode::default(),
            move_messages: false,
            watch: true,
            keepalive_secs: default_keepalive_secs(),
            max_connection_age_secs: default_max_connection_age_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Options {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn max_connection_age(&self) -> Duration {
        Duration::from_secs(self.max_connection_age_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    pub folder: Option<String>,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub receiver: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: Option<EndpointConfig>,
    pub target: Option<EndpointConfig>,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub filter: Vec<FilterConfig>,

    /// Directory relative paths in the file are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// A validated remote mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub server: String,
    pub port: u16,
    pub security: ImapSecurity,
    pub user: String,
    pub password: Option<String>,
    pub folder: String,
    pub uidfile: PathBuf,
}

impl RemoteEndpoint {
    /// Keyring account name for this endpoint.
    pub fn account_id(&self) -> String {
        format!("{}@{}", self.user, self.server)
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}/{}", self.user, self.server, self.port, self.folder)
    }
}

/// A validated local message directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEndpoint {
    pub path: PathBuf,
    pub folder: String,
    pub compress: bool,
    pub uidfile: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoResponderConfig {
    pub template: PathBuf,
    pub ignore_from: Option<String>,
    pub from: String,
    pub to: Option<String>,
    pub bcc: Option<String>,
    pub default_subject: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEndpoint {
    Remote(RemoteEndpoint),
    Local(LocalEndpoint),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEndpoint {
    Remote(RemoteEndpoint),
    Local(LocalEndpoint),
    AutoResponder(AutoResponderConfig),
}

impl Config {
    /// Loads a YAML config, or JSON when the file name ends in `.json`.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let path = Path::new(path);
        let content = fs::read_to_string(path)?;

        let mut config: Config = if path.extension().map_or(false, |ext| ext == "json") {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn source_endpoint(&self) -> Result<SourceEndpoint, ConfigError> {
        let source = self.source.as_ref().ok_or(ConfigError::MissingField {
            section: "top-level",
            field: "source",
        })?;
        if source.path.is_some() {
            Ok(SourceEndpoint::Local(self.local_endpoint("source", source)?))
        } else {
            Ok(SourceEndpoint::Remote(self.remote_endpoint("source", source)?))
        }
    }

    pub fn target_endpoint(&self) -> Result<TargetEndpoint, ConfigError> {
        let target = self.target.as_ref().ok_or(ConfigError::MissingField {
            section: "top-level",
            field: "target",
        })?;
        if target.path.is_some() {
            Ok(TargetEndpoint::Local(self.local_endpoint("target", target)?))
        } else if target.autoresponder_file.is_some() {
            Ok(TargetEndpoint::AutoResponder(self.autoresponder(target)?))
        } else {
            Ok(TargetEndpoint::Remote(self.remote_endpoint("target", target)?))
        }
    }

    pub fn rules(&self) -> Result<Vec<FilterRule>, ConfigError> {
        self.filter
            .iter()
            .map(|f| -> Result<FilterRule, ConfigError> {
                let folder = f.folder.as_deref().ok_or(ConfigError::MissingField {
                    section: "filter",
                    field: "folder",
                })?;
                Ok(FilterRule::new(
                    folder,
                    f.subject.as_deref(),
                    f.sender.as_deref(),
                    f.receiver.as_deref(),
                )?)
            })
            .collect()
    }

    /// Validates everything needed to start a mirror without touching the
    /// network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source_endpoint()?;
        self.target_endpoint()?;
        self.rules()?;
        Ok(())
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let expanded = PathBuf::from(shellexpand::tilde(path).into_owned());
        if expanded.is_absolute() {
            expanded
        } else {
            self.base_dir.join(expanded)
        }
    }

    fn remote_endpoint(&self, section: &'static str, c: &EndpointConfig) -> Result<RemoteEndpoint, ConfigError> {
        let required = |value: &Option<String>, field: &'static str| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingField { section, field })
        };

        Ok(RemoteEndpoint {
            server: required(&c.server, "server")?,
            port: c.port.unwrap_or(993),
            security: c.security.unwrap_or_default(),
            user: required(&c.user, "user")?,
            password: c.password.clone(),
            folder: required(&c.folder, "folder")?,
            uidfile: self.resolve(c.uidfile.as_deref().unwrap_or("imap_uid.txt")),
        })
    }

    fn local_endpoint(&self, section: &'static str, c: &EndpointConfig) -> Result<LocalEndpoint, ConfigError> {
        let path = c.path.as_deref().ok_or(ConfigError::MissingField { section, field: "path" })?;
        let folder = c
            .folder
            .clone()
            .filter(|f| !f.is_empty())
            .ok_or(ConfigError::MissingField { section, field: "folder" })?;

        Ok(LocalEndpoint {
            path: self.resolve(path),
            folder,
            compress: c.compress.unwrap_or(false),
            uidfile: c.uidfile.as_deref().map(|f| self.resolve(f)),
        })
    }

    fn autoresponder(&self, c: &EndpointConfig) -> Result<AutoResponderConfig, ConfigError> {
        const SECTION: &str = "target";
        let template = c
            .autoresponder_file
            .as_deref()
            .ok_or(ConfigError::MissingField { section: SECTION, field: "autoresponder_file" })?;
        let from = c
            .from
            .clone()
            .ok_or(ConfigError::MissingField { section: SECTION, field: "from" })?;
        let smtp_host = c
            .smtp_host
            .clone()
            .ok_or(ConfigError::MissingField { section: SECTION, field: "smtp_host" })?;

        if let Some(pattern) = &c.ignore_from {
            regex::Regex::new(pattern)?;
        }
        if from.parse::<lettre::message::Mailbox>().is_err() {
            return Err(ConfigError::Invalid {
                section: SECTION,
                reason: format!("'{}' is not a valid sender address", from),
            });
        }

        Ok(AutoResponderConfig {
            template: self.resolve(template),
            ignore_from: c.ignore_from.clone().filter(|p| !p.is_empty()),
            from,
            to: c.to.clone().filter(|t| !t.is_empty()),
            bcc: c.bcc.clone().filter(|b| !b.is_empty()),
            default_subject: c.default_subject.clone().unwrap_or_default(),
            smtp_host,
            smtp_port: c.smtp_port.unwrap_or(587),
            smtp_user: c.smtp_user.clone().unwrap_or_default(),
            smtp_password: c.smtp_password.clone().unwrap_or_default(),
        })
    }
}
