use crate::error::{Error, Result};
use dbus::strings::{BusName, Path as ObjectPath};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use structopt::StructOpt;

/// Which bus a connection goes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BusSelector {
    System,
    Session,
    /// A D-Bus address such as `unix:path=/run/dbus/other_bus_socket`.
    Address(String),
}

impl FromStr for BusSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "system" => Ok(BusSelector::System),
            "session" => Ok(BusSelector::Session),
            "" => Err(Error::Config("empty bus selector".into())),
            addr => match addr.split_once(':') {
                Some((transport, _)) if !transport.is_empty() => {
                    Ok(BusSelector::Address(addr.to_owned()))
                }
                _ => Err(Error::Config(format!(
                    "unknown bus {:?}, expected system, session or a dbus address",
                    addr
                ))),
            },
        }
    }
}

impl fmt::Display for BusSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusSelector::System => f.write_str("system"),
            BusSelector::Session => f.write_str("session"),
            BusSelector::Address(a) => f.write_str(a),
        }
    }
}

/// What to do with the error of a failed forwarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Relay the source's error name and message as they are.
    Preserve,
    /// Relay the message under `org.freedesktop.DBus.Error.Failed`.
    Normalize,
}

#[derive(StructOpt, Debug, Default)]
#[structopt(
    name = "dbus-relay",
    about = "expose a dbus service from one bus under a name on another bus"
)]
pub struct Params {
    #[structopt(
        short = "c",
        long = "config",
        help = "read settings from this toml file, command line flags take precedence"
    )]
    pub config: Option<PathBuf>,
    #[structopt(
        short = "n",
        long = "source-bus-name",
        help = "the service to relay, e.g. org.freedesktop.NetworkManager"
    )]
    pub source_bus_name: Option<String>,
    #[structopt(
        short = "p",
        long = "source-object-path",
        help = "the object of the service to relay"
    )]
    pub source_object_path: Option<String>,
    #[structopt(
        short = "x",
        long = "proxy-bus-name",
        help = "the name to own on the target bus"
    )]
    pub proxy_bus_name: Option<String>,
    #[structopt(
        short = "s",
        long = "source-bus",
        help = "bus the service lives on: system, session or an address [default: system]"
    )]
    pub source_bus: Option<String>,
    #[structopt(
        short = "t",
        long = "target-bus",
        help = "bus to expose the service on: system, session or an address [default: session]"
    )]
    pub target_bus: Option<String>,
    #[structopt(
        long = "timeout-ms",
        help = "give up on a forwarded call after this many milliseconds"
    )]
    pub timeout_ms: Option<u64>,
    #[structopt(
        long = "normalize-errors",
        help = "report forwarded failures as org.freedesktop.DBus.Error.Failed"
    )]
    pub normalize_errors: bool,
    #[structopt(short = "v", long = "verbose", help = "log every forwarded message")]
    pub verbose: bool,
    #[structopt(long = "log-file", help = "append the log to this file instead of stderr")]
    pub log_file: Option<PathBuf>,
    #[structopt(long = "show-config", help = "print the effective configuration and exit")]
    pub show_config: bool,
    #[structopt(long = "create-config", help = "write a configuration template and exit")]
    pub create_config: Option<PathBuf>,
}

/// Unvalidated settings, as read from the config file and the command line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub source_bus_name: Option<String>,
    pub source_object_path: Option<String>,
    pub proxy_bus_name: Option<String>,
    pub source_bus: Option<String>,
    pub target_bus: Option<String>,
    pub timeout_ms: Option<u64>,
    pub normalize_errors: Option<bool>,
    pub verbose: Option<bool>,
    pub log_file: Option<PathBuf>,
}

const TEMPLATE_HEADER: &str = "\
# dbus-relay configuration
#
# source_bus_name    the service to relay
# source_object_path the object of that service to expose
# proxy_bus_name     the name owned on the target bus
# source_bus         system, session or a dbus address
# target_bus         system, session or a dbus address
# timeout_ms         timeout of forwarded calls, unset for none
# normalize_errors   report forwarded failures as org.freedesktop.DBus.Error.Failed
# verbose            log every forwarded message
# log_file           append the log here instead of stderr

";

impl Settings {
    pub fn load(path: &Path) -> Result<Settings> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::parse(&text).map_err(|e| match e {
            Error::Config(m) => Error::Config(format!("{}: {}", path.display(), m)),
            e => e,
        })
    }

    pub fn parse(text: &str) -> Result<Settings> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Settings from the config file named in `params`, if any, overlaid
    /// with the flags given on the command line.
    pub fn from_params(params: &Params) -> Result<Settings> {
        let file = match &params.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        Ok(file.overlay(Settings {
            source_bus_name: params.source_bus_name.clone(),
            source_object_path: params.source_object_path.clone(),
            proxy_bus_name: params.proxy_bus_name.clone(),
            source_bus: params.source_bus.clone(),
            target_bus: params.target_bus.clone(),
            timeout_ms: params.timeout_ms,
            normalize_errors: params.normalize_errors.then_some(true),
            verbose: params.verbose.then_some(true),
            log_file: params.log_file.clone(),
        }))
    }

    /// Fields set in `other` win.
    pub fn overlay(self, other: Settings) -> Settings {
        Settings {
            source_bus_name: other.source_bus_name.or(self.source_bus_name),
            source_object_path: other.source_object_path.or(self.source_object_path),
            proxy_bus_name: other.proxy_bus_name.or(self.proxy_bus_name),
            source_bus: other.source_bus.or(self.source_bus),
            target_bus: other.target_bus.or(self.target_bus),
            timeout_ms: other.timeout_ms.or(self.timeout_ms),
            normalize_errors: other.normalize_errors.or(self.normalize_errors),
            verbose: other.verbose.or(self.verbose),
            log_file: other.log_file.or(self.log_file),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// A commented template holding these settings.
    pub fn template(&self) -> Result<String> {
        Ok(format!("{}{}", TEMPLATE_HEADER, self.to_toml()?))
    }

    pub fn validate(self) -> Result<ProxyConfig> {
        let source_bus_name = required("source_bus_name", self.source_bus_name)?;
        BusName::new(source_bus_name.as_str()).map_err(|e| {
            Error::Config(format!("source_bus_name {:?}: {}", source_bus_name, e))
        })?;
        let source_object_path = required("source_object_path", self.source_object_path)?;
        ObjectPath::new(source_object_path.as_str()).map_err(|e| {
            Error::Config(format!("source_object_path {:?}: {}", source_object_path, e))
        })?;
        let proxy_bus_name = required("proxy_bus_name", self.proxy_bus_name)?;
        if proxy_bus_name.starts_with(':') {
            return Err(Error::Config(format!(
                "proxy_bus_name {:?} is a unique name, it can not be owned",
                proxy_bus_name
            )));
        }
        BusName::new(proxy_bus_name.as_str()).map_err(|e| {
            Error::Config(format!("proxy_bus_name {:?}: {}", proxy_bus_name, e))
        })?;
        let source_bus = match self.source_bus {
            Some(s) => s.parse()?,
            None => BusSelector::System,
        };
        let target_bus = match self.target_bus {
            Some(s) => s.parse()?,
            None => BusSelector::Session,
        };
        let call_timeout = match self.timeout_ms {
            Some(0) => return Err(Error::Config("timeout_ms must be positive".into())),
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        };
        let error_policy = if self.normalize_errors.unwrap_or(false) {
            ErrorPolicy::Normalize
        } else {
            ErrorPolicy::Preserve
        };
        Ok(ProxyConfig {
            source_bus_name,
            source_object_path,
            proxy_bus_name,
            source_bus,
            target_bus,
            call_timeout,
            error_policy,
            verbose: self.verbose.unwrap_or(false),
            log_file: self.log_file,
        })
    }
}

fn required(field: &str, value: Option<String>) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_owned()),
        _ => Err(Error::Config(format!("{} is required", field))),
    }
}

/// Validated relay configuration. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    source_bus_name: String,
    source_object_path: String,
    proxy_bus_name: String,
    source_bus: BusSelector,
    target_bus: BusSelector,
    call_timeout: Option<Duration>,
    error_policy: ErrorPolicy,
    verbose: bool,
    log_file: Option<PathBuf>,
}

impl ProxyConfig {
    pub fn source_bus_name(&self) -> &str {
        &self.source_bus_name
    }

    pub fn source_object_path(&self) -> &str {
        &self.source_object_path
    }

    pub fn proxy_bus_name(&self) -> &str {
        &self.proxy_bus_name
    }

    pub fn source_bus(&self) -> &BusSelector {
        &self.source_bus
    }

    pub fn target_bus(&self) -> &BusSelector {
        &self.target_bus
    }

    /// Timeout of forwarded method calls, `None` waits forever.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        self.error_policy
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    /// The settings this configuration was built from, with defaults filled in.
    pub fn settings(&self) -> Settings {
        Settings {
            source_bus_name: Some(self.source_bus_name.clone()),
            source_object_path: Some(self.source_object_path.clone()),
            proxy_bus_name: Some(self.proxy_bus_name.clone()),
            source_bus: Some(self.source_bus.to_string()),
            target_bus: Some(self.target_bus.to_string()),
            timeout_ms: self.call_timeout.map(|t| t.as_millis() as u64),
            normalize_errors: Some(self.error_policy == ErrorPolicy::Normalize),
            verbose: Some(self.verbose),
            log_file: self.log_file.clone(),
        }
    }
}
