//! Persisted settings – reads/writes `~/.roomba/config.toml`.

use roomba_driver::DriverConfig;
use roomba_types::{RobotModel, RoombaMode, SensorCategory};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// How the CLI reaches the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// In-process simulated robot.
    #[default]
    Simulated,
    /// Serial-over-TCP bridge at `driver.port` (`host:port`).
    Tcp,
    /// Local serial device at `driver.port`.
    Serial,
}

impl std::fmt::Display for LinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkKind::Simulated => write!(f, "simulated"),
            LinkKind::Tcp => write!(f, "tcp"),
            LinkKind::Serial => write!(f, "serial"),
        }
    }
}

impl std::str::FromStr for LinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulated" | "sim" => Ok(LinkKind::Simulated),
            "tcp" => Ok(LinkKind::Tcp),
            "serial" => Ok(LinkKind::Serial),
            other => Err(format!("unknown link '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub link: LinkKind,

    /// Print change notifications as they arrive.
    #[serde(default = "default_print_notifications")]
    pub print_notifications: bool,

    /// Categories to print; empty prints all of them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<SensorCategory>,

    #[serde(default)]
    pub driver: DriverConfig,
}

fn default_print_notifications() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            link: LinkKind::default(),
            print_notifications: default_print_notifications(),
            notify: Vec::new(),
            driver: DriverConfig::default(),
        }
    }
}

/// Return the path to `~/.roomba/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".roomba").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `ROOMBA_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ROOMBA_LINK` | `link` |
/// | `ROOMBA_PORT` | `driver.port` |
/// | `ROOMBA_MODEL` | `driver.model` |
/// | `ROOMBA_POLLING_MS` | `driver.polling_interval_ms` |
/// | `ROOMBA_MAINTAIN_MODE` | `driver.maintain_mode` (`none` clears it) |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("ROOMBA_LINK")
        && let Ok(link) = v.parse::<LinkKind>()
    {
        cfg.link = link;
    }
    if let Ok(v) = std::env::var("ROOMBA_PORT") {
        cfg.driver.port = v;
    }
    if let Ok(v) = std::env::var("ROOMBA_MODEL")
        && let Ok(model) = v.parse::<RobotModel>()
    {
        cfg.driver.model = model;
    }
    if let Ok(v) = std::env::var("ROOMBA_POLLING_MS")
        && let Ok(ms) = v.trim().parse::<i64>()
    {
        cfg.driver.polling_interval_ms = ms;
    }
    if let Ok(v) = std::env::var("ROOMBA_MAINTAIN_MODE") {
        if v.trim().eq_ignore_ascii_case("none") {
            cfg.driver.maintain_mode = None;
        } else if let Ok(mode) = v.parse::<RoombaMode>() {
            cfg.driver.maintain_mode = Some(mode);
        }
    }
}

/// Save the config to disk, creating `~/.roomba/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
