//! Broker installation and `server.properties` inspection.
//!
//! [`ConfigInspector::parse`] checks that an installation directory has the
//! launcher scripts and properties file the toolkit needs, parses the
//! properties, decides whether the broker runs in ZooKeeper or KRaft mode and
//! extracts the endpoints clients should bootstrap from. Parsing is pure: it
//! never touches a running broker.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Key whose non-empty value marks a KRaft (self-managed quorum) broker
pub const PROCESS_ROLES: &str = "process.roles";
/// Key that marks a ZooKeeper-coordinated broker
pub const ZOOKEEPER_CONNECT: &str = "zookeeper.connect";
pub const LISTENERS: &str = "listeners";
pub const ADVERTISED_LISTENERS: &str = "advertised.listeners";
pub const CONTROLLER_LISTENER_NAMES: &str = "controller.listener.names";

const DEFAULT_BOOTSTRAP: &str = "localhost:9092";

const COMMON_KEYS: &[&str] = &[
    "broker.id",
    "listeners",
    "advertised.listeners",
    "log.dirs",
    "num.network.threads",
    "num.io.threads",
    "socket.send.buffer.bytes",
    "socket.receive.buffer.bytes",
    "socket.request.max.bytes",
    "num.partitions",
    "num.recovery.threads.per.data.dir",
    "offsets.topic.replication.factor",
    "transaction.state.log.replication.factor",
    "transaction.state.log.min.isr",
    "log.retention.hours",
    "log.retention.bytes",
    "log.segment.bytes",
    "log.retention.check.interval.ms",
    "group.initial.rebalance.delay.ms",
];

const ZOOKEEPER_KEYS: &[&str] = &["zookeeper.connect", "zookeeper.connection.timeout.ms"];

const KRAFT_KEYS: &[&str] = &[
    "process.roles",
    "node.id",
    "controller.quorum.voters",
    "controller.listener.names",
    "log.dirs",
];

const NUMERIC_KEYS: &[&str] = &[
    "broker.id",
    "node.id",
    "num.partitions",
    "num.network.threads",
    "num.io.threads",
    "log.retention.hours",
    "offsets.topic.replication.factor",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Required file missing: {}", path.display())]
    MissingFile { path: PathBuf },

    #[error("Cannot determine cluster mode: neither 'process.roles' nor 'zookeeper.connect' is set")]
    AmbiguousMode,

    #[error("Invalid listener endpoint '{token}': {reason}")]
    InvalidEndpoint { token: String, reason: String },

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    fn invalid_endpoint<S: Into<String>>(token: &str, reason: S) -> Self {
        Self::InvalidEndpoint {
            token: token.to_string(),
            reason: reason.into(),
        }
    }
}

/// Cluster topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClusterMode {
    /// ZooKeeper-coordinated
    Coordinated,
    /// KRaft quorum
    SelfManaged,
}

impl fmt::Display for ClusterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterMode::Coordinated => write!(f, "ZooKeeper"),
            ClusterMode::SelfManaged => write!(f, "KRaft"),
        }
    }
}

/// `host:port` a client can bootstrap from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a listener entry such as `PLAINTEXT://host:9092` or `host:9092`.
    /// Wildcard binds (`0.0.0.0`, `::`, empty host) become `localhost`.
    pub fn parse_listener(token: &str) -> Result<Self, ConfigError> {
        let (_, address) = split_listener(token);

        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::invalid_endpoint(token, "expected host:port"))?;

        if host.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(ConfigError::invalid_endpoint(token, "malformed host"));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ConfigError::invalid_endpoint(token, format!("bad port '{}'", port)))?;
        if port == 0 {
            return Err(ConfigError::invalid_endpoint(token, "port must be non-zero"));
        }

        let host = match host {
            "" | "0.0.0.0" | "::" | "[::]" => "localhost",
            other => other,
        };
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Split `NAME://address` into its listener name and address
fn split_listener(token: &str) -> (Option<&str>, &str) {
    match token.split_once("://") {
        Some((name, address)) => (Some(name), address),
        None => (None, token),
    }
}

/// Relative locations of the files the toolkit needs inside an installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationLayout {
    pub start_script: PathBuf,
    pub stop_script: PathBuf,
    pub properties: PathBuf,
}

impl InstallationLayout {
    /// `bin/kafka-server-start.sh` and friends
    pub fn unix() -> Self {
        Self {
            start_script: PathBuf::from("bin/kafka-server-start.sh"),
            stop_script: PathBuf::from("bin/kafka-server-stop.sh"),
            properties: PathBuf::from("config/server.properties"),
        }
    }

    /// `bin\windows\kafka-server-start.bat` and friends
    pub fn windows() -> Self {
        Self {
            start_script: PathBuf::from("bin")
                .join("windows")
                .join("kafka-server-start.bat"),
            stop_script: PathBuf::from("bin")
                .join("windows")
                .join("kafka-server-stop.bat"),
            properties: PathBuf::from("config").join("server.properties"),
        }
    }

    /// Layout for the platform the toolkit runs on
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::windows()
        } else {
            Self::unix()
        }
    }

    /// Every required file, resolved under `root`, that does not exist
    pub fn missing_files(&self, root: &Path) -> Vec<PathBuf> {
        [&self.start_script, &self.stop_script, &self.properties]
            .into_iter()
            .map(|relative| root.join(relative))
            .filter(|path| !path.is_file())
            .collect()
    }
}

impl Default for InstallationLayout {
    fn default() -> Self {
        Self::current()
    }
}

/// Parsed broker configuration. Replaced wholesale on reload.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerConfig {
    pub installation_path: PathBuf,
    pub properties_path: PathBuf,
    pub start_script: PathBuf,
    pub stop_script: PathBuf,
    pub mode: ClusterMode,
    pub bootstrap_endpoints: Vec<Endpoint>,
    pub raw_properties: BTreeMap<String, String>,
}

/// Well-known settings present in a configuration, grouped for display
#[derive(Debug, Clone, Default, Serialize)]
pub struct KeySettings {
    pub common: Vec<(String, String)>,
    pub mode_specific: Vec<(String, String)>,
}

impl BrokerConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw_properties.get(key).map(String::as_str)
    }

    /// Comma-separated endpoints, ready for `bootstrap.servers`
    pub fn bootstrap_servers(&self) -> String {
        self.bootstrap_endpoints
            .iter()
            .map(Endpoint::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn key_settings(&self) -> KeySettings {
        let pick = |keys: &[&str]| {
            keys.iter()
                .filter_map(|k| self.get(k).map(|v| (k.to_string(), v.to_string())))
                .collect::<Vec<_>>()
        };

        KeySettings {
            common: pick(COMMON_KEYS),
            mode_specific: match self.mode {
                ClusterMode::SelfManaged => pick(KRAFT_KEYS),
                ClusterMode::Coordinated => pick(ZOOKEEPER_KEYS),
            },
        }
    }

    /// Case-insensitive match against keys and values
    pub fn search(&self, term: &str) -> Vec<(&str, &str)> {
        let term = term.to_lowercase();
        self.raw_properties
            .iter()
            .filter(|(k, v)| k.to_lowercase().contains(&term) || v.to_lowercase().contains(&term))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }

    /// Human-readable problems that would likely stop the broker from
    /// starting. An empty list means nothing suspicious was found.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        let (label, required): (&str, &[&str]) = match self.mode {
            ClusterMode::SelfManaged => ("KRaft", &["process.roles", "node.id", "log.dirs"]),
            ClusterMode::Coordinated => {
                ("ZooKeeper", &["broker.id", "log.dirs", "zookeeper.connect"])
            }
        };
        for key in required {
            if self.get(key).map_or(true, str::is_empty) {
                issues.push(format!("Missing required {} setting: {}", label, key));
            }
        }

        if let Some(dirs) = self.get("log.dirs") {
            for dir in dirs.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                // The broker runs with the installation as its working directory.
                if !self.installation_path.join(dir).exists() {
                    issues.push(format!("Log directory does not exist: {}", dir));
                }
            }
        }

        for key in NUMERIC_KEYS {
            if let Some(value) = self.get(key) {
                if value.parse::<i64>().is_err() {
                    issues.push(format!("Invalid integer value for {}: {}", key, value));
                }
            }
        }

        for key in [LISTENERS, ADVERTISED_LISTENERS] {
            let Some(listeners) = self.get(key) else {
                continue;
            };
            for listener in listeners.split(',').map(str::trim).filter(|l| !l.is_empty()) {
                let named = matches!(
                    split_listener(listener),
                    (Some(name), _) if !name.is_empty()
                        && name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
                );
                if !named || Endpoint::parse_listener(listener).is_err() {
                    issues.push(format!("Invalid listener format in {}: {}", key, listener));
                }
            }
        }

        issues
    }
}

/// Parses broker installations laid out per an [`InstallationLayout`]
#[derive(Debug, Clone, Default)]
pub struct ConfigInspector {
    layout: InstallationLayout,
}

impl ConfigInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layout(layout: InstallationLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &InstallationLayout {
        &self.layout
    }

    pub fn parse<P: AsRef<Path>>(&self, installation: P) -> Result<BrokerConfig, ConfigError> {
        let root = installation.as_ref();

        if let Some(path) = self.layout.missing_files(root).into_iter().next() {
            return Err(ConfigError::MissingFile { path });
        }

        let properties_path = root.join(&self.layout.properties);
        let text = std::fs::read_to_string(&properties_path).map_err(|source| ConfigError::Io {
            path: properties_path.clone(),
            source,
        })?;

        let raw_properties = parse_properties(&text);
        let mode = detect_mode(&raw_properties)?;
        let bootstrap_endpoints = bootstrap_endpoints(&raw_properties)?;

        info!(
            "Parsed {} ({} mode, {} settings, bootstrap {})",
            properties_path.display(),
            mode,
            raw_properties.len(),
            bootstrap_endpoints
                .iter()
                .map(Endpoint::to_string)
                .collect::<Vec<_>>()
                .join(",")
        );

        Ok(BrokerConfig {
            installation_path: root.to_path_buf(),
            properties_path,
            start_script: root.join(&self.layout.start_script),
            stop_script: root.join(&self.layout.stop_script),
            mode,
            bootstrap_endpoints,
            raw_properties,
        })
    }
}

/// Parse `key=value` lines. Blank lines and `#`/`!` comments are skipped,
/// trailing `# ...` comments are stripped, and a repeated key keeps its last
/// value.
pub fn parse_properties(text: &str) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();

    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            warn!("Skipping line {} without '=': {}", number + 1, line);
            continue;
        };

        let key = key.trim();
        if key.is_empty() {
            warn!("Skipping line {} with empty key", number + 1);
            continue;
        }
        let value = value.split('#').next().unwrap_or_default().trim();

        if properties
            .insert(key.to_string(), value.to_string())
            .is_some()
        {
            debug!("Duplicate key '{}' on line {}, last value wins", key, number + 1);
        }
    }

    properties
}

fn detect_mode(properties: &BTreeMap<String, String>) -> Result<ClusterMode, ConfigError> {
    let non_empty = |key: &str| properties.get(key).map_or(false, |v| !v.is_empty());

    if non_empty(PROCESS_ROLES) {
        Ok(ClusterMode::SelfManaged)
    } else if non_empty(ZOOKEEPER_CONNECT) {
        Ok(ClusterMode::Coordinated)
    } else {
        Err(ConfigError::AmbiguousMode)
    }
}

/// Client endpoints from `listeners`, else `advertised.listeners`, else
/// `localhost:9092`. Controller listeners are never bootstrap endpoints.
fn bootstrap_endpoints(
    properties: &BTreeMap<String, String>,
) -> Result<Vec<Endpoint>, ConfigError> {
    let controller_names: Vec<&str> = properties
        .get(CONTROLLER_LISTENER_NAMES)
        .map(|names| names.split(',').map(str::trim).filter(|n| !n.is_empty()).collect())
        .unwrap_or_default();

    for key in [LISTENERS, ADVERTISED_LISTENERS] {
        let Some(value) = properties.get(key) else {
            continue;
        };

        let mut endpoints = Vec::new();
        for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if let (Some(name), _) = split_listener(token) {
                if controller_names.contains(&name) {
                    continue;
                }
            }
            let endpoint = Endpoint::parse_listener(token)?;
            if !endpoints.contains(&endpoint) {
                endpoints.push(endpoint);
            }
        }

        if !endpoints.is_empty() {
            return Ok(endpoints);
        }
    }

    Ok(vec![Endpoint::parse_listener(DEFAULT_BOOTSTRAP)?])
}
