//! TOML-based configuration for the daemon.
//!
//! The configuration is loaded once at startup and passed by reference to
//! every component that needs it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_CONTAINERD_STATE_DIR: &str = "/run/containerd";
const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_CORRELATION_INTERVAL_MS: u64 = 1000;
const DEFAULT_CORRELATION_TIMEOUT_MS: u64 = 60_000;

const DEFAULT_LABEL_KEY: &str = "enforce.k8s.io";
const DEFAULT_LABEL_VALUE: &str = "deny-third-party-execution";

const IGNORED_DESTINATIONS: &[&str] = &[
    "/dev/shm",
    "/var/run/secrets/kubernetes.io/serviceaccount",
];

const FILE_DESTINATIONS: &[&str] = &[
    "/etc/resolv.conf",
    "/etc/hostname",
    "/etc/hosts",
    "/dev/termination-log",
];

fn to_pathbuf_vec(arr: &[&str]) -> Vec<PathBuf> {
    arr.iter().map(PathBuf::from).collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Container runtime the daemon talks to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Containerd,
    Docker,
}

impl RuntimeKind {
    /// Containerd namespace holding this runtime's containers.
    pub fn containerd_namespace(self) -> &'static str {
        match self {
            RuntimeKind::Containerd => "k8s.io",
            RuntimeKind::Docker => "moby",
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "containerd" => Ok(RuntimeKind::Containerd),
            "docker" => Ok(RuntimeKind::Docker),
            other => anyhow::bail!(
                "Unsupported runtime {} provided. Supported runtimes: docker, containerd.",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub runtime: RuntimeKind,
    #[serde(default = "default_containerd_state_dir")]
    pub containerd_state_dir: PathBuf,
    #[serde(default = "default_docker_socket")]
    pub docker_socket: PathBuf,
    /// How often the containerd task directory is listed for changes
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_containerd_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CONTAINERD_STATE_DIR)
}

fn default_docker_socket() -> PathBuf {
    PathBuf::from(DEFAULT_DOCKER_SOCKET)
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::default(),
            containerd_state_dir: default_containerd_state_dir(),
            docker_socket: default_docker_socket(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

/// Mount classification rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Mount destinations that are never watched
    #[serde(default = "default_ignored_destinations")]
    pub ignored_destinations: Vec<PathBuf>,
    /// Mount destinations watched as single files rather than directories
    #[serde(default = "default_file_destinations")]
    pub file_destinations: Vec<PathBuf>,
}

fn default_ignored_destinations() -> Vec<PathBuf> {
    to_pathbuf_vec(IGNORED_DESTINATIONS)
}

fn default_file_destinations() -> Vec<PathBuf> {
    to_pathbuf_vec(FILE_DESTINATIONS)
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            ignored_destinations: default_ignored_destinations(),
            file_destinations: default_file_destinations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    #[serde(default = "default_label_key")]
    pub label_key: String,
    #[serde(default = "default_label_value")]
    pub label_value: String,
    /// Workload names eligible for enforcement regardless of labels
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default = "default_correlation_interval")]
    pub correlation_interval_ms: u64,
    #[serde(default = "default_correlation_timeout")]
    pub correlation_timeout_ms: u64,
}

fn default_label_key() -> String {
    DEFAULT_LABEL_KEY.to_string()
}

fn default_label_value() -> String {
    DEFAULT_LABEL_VALUE.to_string()
}

fn default_correlation_interval() -> u64 {
    DEFAULT_CORRELATION_INTERVAL_MS
}

fn default_correlation_timeout() -> u64 {
    DEFAULT_CORRELATION_TIMEOUT_MS
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            label_key: default_label_key(),
            label_value: default_label_value(),
            names: Vec::new(),
            correlation_interval_ms: DEFAULT_CORRELATION_INTERVAL_MS,
            correlation_timeout_ms: DEFAULT_CORRELATION_TIMEOUT_MS,
        }
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn load_or_default(path: &std::path::Path) -> Self {
        Self::load(path).unwrap_or_default()
    }
}
