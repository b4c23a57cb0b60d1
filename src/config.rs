//! Daemon configuration.
//!
//! Defaults, then an optional YAML file (`KEYWATCH_CONFIG`, else
//! `<data_dir>/keywatch.yaml`), then `KEYWATCH_*` environment overrides.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use zeroize::Zeroizing;

use crate::monitor::scheduler::SchedulerConfig;

const CONFIG_FILE: &str = "keywatch.yaml";
const MASTER_KEY_FILE: &str = "master.key";
const MASTER_KEY_ENV: &str = "KEYWATCH_MASTER_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => bail!("unknown log format '{}' (expected 'pretty' or 'json')", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/keywatch.db`.
    pub db_path: Option<PathBuf>,
    /// Defaults to `<data_dir>/keywatch.sock`.
    pub socket_path: Option<PathBuf>,
    pub interval_secs: u64,
    pub max_concurrency: usize,
    pub jitter_ms: u64,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_path: None,
            socket_path: None,
            interval_secs: 300,
            max_concurrency: 8,
            jitter_ms: 0,
            log_format: LogFormat::Pretty,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".keywatch"))
        .unwrap_or_else(|| PathBuf::from(".keywatch"))
}

impl Settings {
    /// Load from the process environment.
    pub fn load() -> Result<Self> {
        Self::load_from(|name| std::env::var(name).ok())
    }

    /// Load with a custom environment lookup.
    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let explicit = env("KEYWATCH_CONFIG").map(PathBuf::from);
        let file = match &explicit {
            Some(path) => path.clone(),
            None => env("KEYWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_data_dir)
                .join(CONFIG_FILE),
        };

        let mut settings = if file.exists() {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read config file {}", file.display()))?;
            serde_yaml::from_str::<Settings>(&text)
                .with_context(|| format!("Invalid config file {}", file.display()))?
        } else if explicit.is_some() {
            bail!("Config file {} does not exist", file.display());
        } else {
            Settings::default()
        };

        if let Some(v) = env("KEYWATCH_DATA_DIR") {
            settings.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env("KEYWATCH_DB_PATH") {
            settings.db_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env("KEYWATCH_SOCKET") {
            settings.socket_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env("KEYWATCH_INTERVAL_SECS") {
            settings.interval_secs = v.trim().parse().context("KEYWATCH_INTERVAL_SECS must be a whole number")?;
        }
        if let Some(v) = env("KEYWATCH_MAX_CONCURRENCY") {
            settings.max_concurrency = v.trim().parse().context("KEYWATCH_MAX_CONCURRENCY must be a whole number")?;
        }
        if let Some(v) = env("KEYWATCH_JITTER_MS") {
            settings.jitter_ms = v.trim().parse().context("KEYWATCH_JITTER_MS must be a whole number")?;
        }
        if let Some(v) = env("KEYWATCH_LOG_FORMAT") {
            settings.log_format = v.parse()?;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            bail!("interval_secs must be greater than zero");
        }
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be greater than zero");
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| self.data_dir.join("keywatch.db"))
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(|| self.data_dir.join("keywatch.sock"))
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.interval_secs),
            max_concurrency: self.max_concurrency,
            dispatch_jitter: Duration::from_millis(self.jitter_ms),
        }
    }

    /// The vault passphrase: `KEYWATCH_MASTER_KEY` if set, else the
    /// `master.key` file in the data dir, generated on first boot.
    pub fn master_passphrase(&self) -> Result<Zeroizing<String>> {
        resolve_master_passphrase(std::env::var(MASTER_KEY_ENV).ok(), &self.data_dir)
    }
}

fn resolve_master_passphrase(from_env: Option<String>, data_dir: &Path) -> Result<Zeroizing<String>> {
    if let Some(value) = from_env.map(Zeroizing::new) {
        if !value.trim().is_empty() {
            return Ok(value);
        }
    }

    let path = data_dir.join(MASTER_KEY_FILE);
    if path.exists() {
        let contents = Zeroizing::new(
            std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?,
        );
        let passphrase = contents.trim();
        if passphrase.is_empty() {
            bail!("Master key file {} is empty", path.display());
        }
        return Ok(Zeroizing::new(passphrase.to_string()));
    }

    info!(path = %path.display(), "No master key found — generating new one");
    std::fs::create_dir_all(data_dir).with_context(|| format!("Failed to create {}", data_dir.display()))?;
    let passphrase = Zeroizing::new(format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple()));
    write_private(&path, passphrase.as_bytes())?;
    Ok(passphrase)
}

/// Create a file readable only by the owner.
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
