use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "spinmpc.toml";
const SYSTEM_CONFIG_PATH: &str = "/etc/spinmpc.toml";
const ENV_PREFIX: &str = "SPINMPC_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub debug: bool,
    pub mpd: MpdConfig,
    pub supervisor: SupervisorConfig,
    pub web: WebConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MpdConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub kill_command: String,
    pub connect_timeout_ms: u64,
}

impl Default for MpdConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6600,
            password: None,
            kill_command: "/usr/bin/mpd --kill".to_string(),
            connect_timeout_ms: 3000,
        }
    }
}

impl MpdConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub probe_interval_ms: u64,
    /// Reconnect once more than this many probes in a row have failed.
    pub failure_threshold: u32,
    pub command_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 5000,
            failure_threshold: 3,
            command_timeout_ms: 2000,
        }
    }
}

impl SupervisorConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebConfig {
    /// Empty means every interface.
    pub address: String,
    pub port: u16,
    pub root: String,
    pub search_base: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8870,
            root: "./".to_string(),
            search_base: "https://duckduckgo.com/?q=".to_string(),
        }
    }
}

impl WebConfig {
    pub fn bind_host(&self) -> &str {
        if self.address.trim().is_empty() {
            "0.0.0.0"
        } else {
            self.address.trim()
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            config = toml::from_str::<Config>(&raw)
                .map_err(|err| format!("can't parse {}: {err}", config_path.display()))?;
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| env::var(format!("{}{}", ENV_PREFIX, name)).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("DEBUG") {
            self.debug = val.parse().unwrap_or(self.debug);
        }

        // MPD settings
        if let Some(val) = lookup("MPD_HOST") {
            self.mpd.host = val;
        }
        if let Some(val) = lookup("MPD_PORT") {
            if let Ok(port) = val.parse() {
                self.mpd.port = port;
            }
        }
        if let Some(val) = lookup("MPD_PASSWORD") {
            self.mpd.password = Some(val);
        }
        if let Some(val) = lookup("MPD_KILL_COMMAND") {
            self.mpd.kill_command = val;
        }
        if let Some(val) = lookup("CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.mpd.connect_timeout_ms = ms;
            }
        }

        // Supervisor settings
        if let Some(val) = lookup("PROBE_INTERVAL_MS") {
            if let Ok(ms) = val.parse() {
                self.supervisor.probe_interval_ms = ms;
            }
        }
        if let Some(val) = lookup("FAILURE_THRESHOLD") {
            if let Ok(threshold) = val.parse() {
                self.supervisor.failure_threshold = threshold;
            }
        }
        if let Some(val) = lookup("COMMAND_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                self.supervisor.command_timeout_ms = ms;
            }
        }

        // Web settings
        if let Some(val) = lookup("WEB_ADDRESS") {
            self.web.address = val;
        }
        if let Some(val) = lookup("WEB_PORT") {
            if let Ok(port) = val.parse() {
                self.web.port = port;
            }
        }
        if let Some(val) = lookup("WEB_ROOT") {
            self.web.root = val;
        }
        if let Some(val) = lookup("WEB_SEARCH") {
            self.web.search_base = val;
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.mpd.host.trim().is_empty() {
            return Err("mpd.host must be set".into());
        }
        if self.mpd.port == 0 {
            return Err("mpd.port must be non-zero".into());
        }
        if self.mpd.connect_timeout_ms == 0 {
            return Err("mpd.connect_timeout_ms must be non-zero".into());
        }
        if self.mpd.kill_command.split_whitespace().next().is_none() {
            return Err("mpd.kill_command must name a program".into());
        }
        if self.supervisor.probe_interval_ms < 100 {
            return Err("supervisor.probe_interval_ms must be >= 100".into());
        }
        if self.supervisor.failure_threshold == 0 {
            return Err("supervisor.failure_threshold must be at least 1".into());
        }
        if self.supervisor.command_timeout_ms == 0 {
            return Err("supervisor.command_timeout_ms must be non-zero".into());
        }
        if self.web.port == 0 {
            return Err("web.port must be non-zero".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err(format!("{} already exists", path.as_ref().display()).into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }

    /// Logs the effective settings at debug level with secrets masked.
    pub fn log_summary(&self) {
        tracing::debug!(debug = self.debug, "configured debug mode");
        tracing::debug!(
            address = %self.mpd.host,
            port = self.mpd.port,
            password = mask(self.mpd.password.as_deref()),
            kill_command = %self.mpd.kill_command,
            "configured MPD"
        );
        tracing::debug!(
            probe_interval_ms = self.supervisor.probe_interval_ms,
            failure_threshold = self.supervisor.failure_threshold,
            command_timeout_ms = self.supervisor.command_timeout_ms,
            "configured MPD supervisor"
        );
        tracing::debug!(
            address = self.web.bind_host(),
            port = self.web.port,
            root = %self.web.root,
            search_base = %self.web.search_base,
            "configured web interface"
        );
    }
}

fn mask(secret: Option<&str>) -> &'static str {
    match secret {
        Some(s) if !s.is_empty() => "****************",
        _ => "[none]",
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    PathBuf::from(SYSTEM_CONFIG_PATH)
}

fn active_config_path() -> PathBuf {
    if env::var(format!("{}CONFIG_PATH", ENV_PREFIX)).is_ok() {
        return managed_config_path();
    }
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
