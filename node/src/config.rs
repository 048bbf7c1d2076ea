use crate::sync::SyncConfig;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Ssh,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(TransportKind::Http),
            "ssh" => Ok(TransportKind::Ssh),
            other => bail!("unknown transport {other:?}, expected http or ssh"),
        }
    }
}

/// Where and as whom the host-side send script runs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SshConfig {
    pub user: String,
    #[serde(rename = "ip")]
    pub host: String,
    #[serde(rename = "scriptPath")]
    pub script_path: String,
}

/// Runtime configuration for the mirror daemon.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub build_id: String,
    /// SQLite mirror file.
    pub db_path: PathBuf,
    /// Checkpoint file and attachment cache live here.
    pub data_dir: PathBuf,
    pub remote_url: String,
    pub remote_token: Option<String>,
    pub transport: TransportKind,
    pub ssh: Option<SshConfig>,
    pub poll_interval: Duration,
    pub ping_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            build_id: Uuid::new_v4().to_string(),
            db_path: PathBuf::from("data/sms.db"),
            data_dir: PathBuf::from("data"),
            remote_url: "http://127.0.0.1:3000".to_string(),
            remote_token: None,
            transport: TransportKind::Http,
            ssh: None,
            poll_interval: Duration::from_secs(1),
            ping_interval: Duration::from_secs(5),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key/value source; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(host) = lookup("HOST") {
            config.host = host;
        }
        config.port = lookup("PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(config.port);
        if let Some(build_id) = lookup("CHATMIRROR_BUILD_ID") {
            config.build_id = build_id;
        }
        if let Some(dir) = lookup("CHATMIRROR_DATA_DIR") {
            config = config.with_data_dir(dir);
        }
        if let Some(db) = lookup("CHATMIRROR_DB") {
            config.db_path = PathBuf::from(db);
        }
        if let Some(url) = lookup("CHATMIRROR_REMOTE_URL") {
            config.remote_url = url;
        }
        config.remote_token = lookup("CHATMIRROR_REMOTE_TOKEN").filter(|t| !t.is_empty());
        if let Some(kind) = lookup("CHATMIRROR_TRANSPORT") {
            config.transport = kind.parse()?;
        }
        if let Some(ms) = lookup("CHATMIRROR_POLL_MS") {
            config.poll_interval = parse_millis("CHATMIRROR_POLL_MS", &ms)?;
        }
        if let Some(ms) = lookup("CHATMIRROR_PING_MS") {
            config.ping_interval = parse_millis("CHATMIRROR_PING_MS", &ms)?;
        }

        if let Some(path) = lookup("CHATMIRROR_SECRETS") {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read secrets file {path}"))?;
            let ssh: SshConfig = serde_json::from_str(&raw)
                .with_context(|| format!("secrets file {path} is not valid"))?;
            config.ssh = Some(ssh);
        }
        let ssh_user = lookup("CHATMIRROR_SSH_USER");
        let ssh_host = lookup("CHATMIRROR_SSH_HOST");
        let ssh_script = lookup("CHATMIRROR_SSH_SCRIPT");
        if ssh_user.is_some() || ssh_host.is_some() || ssh_script.is_some() {
            let base = config.ssh.take();
            config.ssh = Some(SshConfig {
                user: ssh_user
                    .or_else(|| base.as_ref().map(|s| s.user.clone()))
                    .unwrap_or_else(|| "root".to_string()),
                host: ssh_host
                    .or_else(|| base.as_ref().map(|s| s.host.clone()))
                    .context("CHATMIRROR_SSH_HOST is required for ssh settings")?,
                script_path: ssh_script
                    .or_else(|| base.as_ref().map(|s| s.script_path.clone()))
                    .context("CHATMIRROR_SSH_SCRIPT is required for ssh settings")?,
            });
        }

        Ok(config)
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self.db_path = self.data_dir.join("sms.db");
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig::default()
            .with_data_dir(&self.data_dir)
            .with_poll_interval(self.poll_interval)
    }
}

fn parse_millis(key: &str, value: &str) -> anyhow::Result<Duration> {
    let millis: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a whole number of milliseconds"))?;
    if millis == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(Duration::from_millis(millis))
}
