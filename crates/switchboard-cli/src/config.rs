//! Reads and writes `~/.switchboard/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use switchboard_worker::{RpcMode, WorkerConfig};

/// Persisted settings shared by every sub-command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Listen address of the Hub.
    #[serde(default = "default_hub_addr")]
    pub hub_addr: String,

    /// Where Workers dial the Hub.
    #[serde(default = "default_hub_url")]
    pub hub_url: String,

    /// Listen address of the HTTP front-end.
    #[serde(default = "default_web_addr")]
    pub web_addr: String,

    /// Where Workers dial the front-end. Empty disables the web bridge.
    #[serde(default = "default_web_url")]
    pub web_url: String,

    /// Worker processes started by `switchboard pool`.
    #[serde(default = "default_pool_size")]
    pub worker_pool_size: usize,

    #[serde(default = "default_true")]
    pub reconnect: bool,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Default level when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Command prefixes, e.g. `["!", "?"]`.
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<String>,

    #[serde(default)]
    pub rpc_mode: RpcMode,

    /// Caller-side RPC deadline. Unset means wait forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_timeout_secs: Option<u64>,

    /// Skip commands in messages authored by the Hub's own account.
    #[serde(default = "default_true")]
    pub ignore_self: bool,
}

fn default_hub_addr() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_hub_url() -> String {
    "ws://127.0.0.1:3000".to_string()
}
fn default_web_addr() -> String {
    "0.0.0.0:5000".to_string()
}
fn default_web_url() -> String {
    switchboard_worker::DEFAULT_WEB_URL.to_string()
}
fn default_pool_size() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_reconnect_delay() -> u64 {
    3
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_prefixes() -> Vec<String> {
    vec!["!".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hub_addr: default_hub_addr(),
            hub_url: default_hub_url(),
            web_addr: default_web_addr(),
            web_url: default_web_url(),
            worker_pool_size: default_pool_size(),
            reconnect: true,
            reconnect_delay_secs: default_reconnect_delay(),
            log_level: default_log_level(),
            prefixes: default_prefixes(),
            rpc_mode: RpcMode::default(),
            rpc_timeout_secs: None,
            ignore_self: true,
        }
    }
}

impl Config {
    /// Worker settings derived from this file.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new(self.hub_url.clone())
            .with_reconnect(self.reconnect, Duration::from_secs(self.reconnect_delay_secs))
            .with_rpc(self.rpc_mode, self.rpc_timeout_secs.map(Duration::from_secs))
            .with_prefixes(self.prefixes.iter().cloned())
            .with_ignore_self(self.ignore_self)
    }
}

/// Return the path to `~/.switchboard/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".switchboard").join("config.toml")
}

/// Load `path`, falling back to defaults when it does not exist. Environment
/// overrides apply either way.
pub fn load_or_default(path: &Path) -> Result<Config, String> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from `path`. Returns `None` if the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `SWITCHBOARD_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SWITCHBOARD_HUB_ADDR` | `hub_addr` |
/// | `SWITCHBOARD_HUB_URL` | `hub_url` |
/// | `SWITCHBOARD_WEB_ADDR` | `web_addr` |
/// | `SWITCHBOARD_WEB_URL` | `web_url` |
/// | `SWITCHBOARD_POOL_SIZE` | `worker_pool_size` |
/// | `SWITCHBOARD_LOG_LEVEL` | `log_level` |
/// | `SWITCHBOARD_RPC_TIMEOUT_SECS` | `rpc_timeout_secs` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SWITCHBOARD_HUB_ADDR") {
        cfg.hub_addr = v;
    }
    if let Ok(v) = std::env::var("SWITCHBOARD_HUB_URL") {
        cfg.hub_url = v;
    }
    if let Ok(v) = std::env::var("SWITCHBOARD_WEB_ADDR") {
        cfg.web_addr = v;
    }
    if let Ok(v) = std::env::var("SWITCHBOARD_WEB_URL") {
        cfg.web_url = v;
    }
    if let Ok(v) = std::env::var("SWITCHBOARD_POOL_SIZE")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.worker_pool_size = n;
    }
    if let Ok(v) = std::env::var("SWITCHBOARD_LOG_LEVEL") {
        cfg.log_level = v;
    }
    if let Ok(v) = std::env::var("SWITCHBOARD_RPC_TIMEOUT_SECS")
        && let Ok(n) = v.parse::<u64>()
    {
        cfg.rpc_timeout_secs = Some(n);
    }
}

/// Save the config to `path`. A missing directory is created private to the
/// user.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty() && !p.exists()) {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
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
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

/// Write a default config to `path` on first run. Returns `true` when a file
/// was created; an existing file is left untouched.
pub fn write_default_if_missing(path: &Path) -> Result<bool, String> {
    if path.exists() {
        return Ok(false);
    }
    save_to(&Config::default(), path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_writes_defaults_once() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join(".switchboard").join("config.toml");

        assert!(write_default_if_missing(&path).unwrap());
        assert_eq!(load_from(&path).unwrap(), Some(Config::default()));

        fs::write(&path, "worker_pool_size = 9\n").unwrap();
        assert!(!write_default_if_missing(&path).unwrap());
        assert_eq!(load_from(&path).unwrap().unwrap().worker_pool_size, 9);
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_non_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config {
            worker_pool_size: 8,
            prefixes: vec!["?".into(), "sb ".into()],
            rpc_mode: RpcMode::SingleInFlight,
            rpc_timeout_secs: Some(30),
            ..Config::default()
        };
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "worker_pool_size = 4\nrpc_mode = \"single_in_flight\"\n").unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.worker_pool_size, 4);
        assert_eq!(loaded.rpc_mode, RpcMode::SingleInFlight);
        assert_eq!(loaded.hub_url, "ws://127.0.0.1:3000");
        assert_eq!(loaded.prefixes, vec!["!".to_string()]);
        assert!(loaded.reconnect);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "worker_pool_size = \"many\"").unwrap();
        assert!(load_from(&path).unwrap_err().contains("Failed to parse config"));
    }

    #[test]
    fn config_path_points_to_switchboard_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".switchboard"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn worker_config_carries_file_values() {
        let cfg = Config {
            hub_url: "ws://hub:9000".into(),
            reconnect: false,
            reconnect_delay_secs: 7,
            rpc_timeout_secs: Some(2),
            ignore_self: false,
            ..Config::default()
        };
        let worker = cfg.worker_config();
        assert_eq!(worker.hub_url, "ws://hub:9000");
        assert!(!worker.reconnect);
        assert_eq!(worker.reconnect_delay, Duration::from_secs(7));
        assert_eq!(worker.rpc_timeout, Some(Duration::from_secs(2)));
        assert!(!worker.ignore_self);
    }

    #[test]
    fn apply_env_overrides_changes_hub_url() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("SWITCHBOARD_HUB_URL", "ws://10.0.0.2:3000") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.hub_url, "ws://10.0.0.2:3000");
        unsafe { std::env::remove_var("SWITCHBOARD_HUB_URL") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_pool_size() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("SWITCHBOARD_POOL_SIZE", "lots") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.worker_pool_size, 2);
        unsafe { std::env::remove_var("SWITCHBOARD_POOL_SIZE") };
    }

    #[test]
    fn apply_env_overrides_sets_rpc_timeout() {
        // SAFETY: no other test touches this variable.
        unsafe { std::env::set_var("SWITCHBOARD_RPC_TIMEOUT_SECS", "15") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.rpc_timeout_secs, Some(15));
        unsafe { std::env::remove_var("SWITCHBOARD_RPC_TIMEOUT_SECS") };
    }
}
