//! Persistent operator configuration – reads/writes `~/.axon/config.toml`.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use axon_bridge::DEFAULT_PORT;
use axon_hal::serial::DEFAULT_BAUD_RATE;
use axon_types::AxonError;
use serde::{Deserialize, Serialize};

/// Settings stored in `~/.axon/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Serial device of the sensor board.  Empty means "first port found".
    #[serde(default)]
    pub serial_port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Interface the telemetry bridge listens on.
    #[serde(default = "default_bridge_host")]
    pub bridge_host: String,

    #[serde(default = "default_bridge_port")]
    pub bridge_port: u16,

    /// `host:port` used by `axon remote` when no address is given.
    #[serde(default = "default_remote_addr")]
    pub remote_addr: String,

    /// Frames buffered per bridge client before the oldest is dropped.
    #[serde(default = "default_client_queue")]
    pub client_queue: usize,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}
fn default_bridge_host() -> String {
    "0.0.0.0".to_string()
}
fn default_bridge_port() -> u16 {
    DEFAULT_PORT
}
fn default_remote_addr() -> String {
    format!("127.0.0.1:{DEFAULT_PORT}")
}
fn default_client_queue() -> usize {
    64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial_port: String::new(),
            baud_rate: default_baud_rate(),
            bridge_host: default_bridge_host(),
            bridge_port: default_bridge_port(),
            remote_addr: default_remote_addr(),
            client_queue: default_client_queue(),
        }
    }
}

impl Config {
    /// Listen address of the bridge server.
    pub fn bridge_addr(&self) -> Result<SocketAddr, AxonError> {
        let ip: IpAddr = self
            .bridge_host
            .trim()
            .parse()
            .map_err(|_| AxonError::Config(format!("invalid bridge_host '{}'", self.bridge_host)))?;
        Ok(SocketAddr::new(ip, self.bridge_port))
    }
}

/// Return the path to `~/.axon/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".axon").join("config.toml")
}

/// Load the config from disk and apply the `AXON_*` environment overrides.
/// Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, AxonError> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

/// Read and parse the file only; no overrides are applied.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, AxonError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        AxonError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| AxonError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `AXON_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `AXON_SERIAL_PORT` | `serial_port` |
/// | `AXON_BAUD_RATE` | `baud_rate` |
/// | `AXON_BRIDGE_HOST` | `bridge_host` |
/// | `AXON_BRIDGE_PORT` | `bridge_port` |
/// | `AXON_REMOTE_ADDR` | `remote_addr` |
/// | `AXON_CLIENT_QUEUE` | `client_queue` |
///
/// Numeric values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

/// Apply overrides looked up by variable name in `lookup`.
pub(crate) fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("AXON_SERIAL_PORT") {
        cfg.serial_port = v;
    }
    if let Some(v) = lookup("AXON_BAUD_RATE")
        && let Ok(baud) = v.trim().parse::<u32>()
    {
        cfg.baud_rate = baud;
    }
    if let Some(v) = lookup("AXON_BRIDGE_HOST") {
        cfg.bridge_host = v;
    }
    if let Some(v) = lookup("AXON_BRIDGE_PORT")
        && let Ok(port) = v.trim().parse::<u16>()
    {
        cfg.bridge_port = port;
    }
    if let Some(v) = lookup("AXON_REMOTE_ADDR") {
        cfg.remote_addr = v;
    }
    if let Some(v) = lookup("AXON_CLIENT_QUEUE")
        && let Ok(len) = v.trim().parse::<usize>()
        && len > 0
    {
        cfg.client_queue = len;
    }
}

/// Save the config to disk, creating `~/.axon/` if necessary.
pub fn save(cfg: &Config) -> Result<(), AxonError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), AxonError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AxonError::Config(format!("failed to create config directory: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                AxonError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| AxonError::Config(format!("failed to serialize config: {e}")))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| {
                AxonError::Config(format!("failed to write config at {}: {e}", path.display()))
            })?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| {
        AxonError::Config(format!("failed to write config at {}: {e}", path.display()))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = std::fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.serial_port = "/dev/ttyUSB0".to_string();
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.serial_port, "/dev/ttyUSB0");
        assert_eq!(loaded.baud_rate, 115_200);
        assert_eq!(loaded.bridge_port, 8765);
        assert_eq!(loaded.client_queue, 64);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "bridge_port = 9001\n").unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.bridge_port, 9001);
        assert_eq!(loaded.bridge_host, "0.0.0.0");
        assert_eq!(loaded.remote_addr, "127.0.0.1:8765");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "bridge_port = \"not a number\"\n").unwrap();
        assert!(matches!(load_from(&path), Err(AxonError::Config(_))));
    }

    #[test]
    fn config_path_points_to_axon_dir() {
        let p = config_path_for_home("/home/operator");
        assert!(p.to_string_lossy().contains(".axon"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn bridge_addr_combines_host_and_port() {
        let mut cfg = Config::default();
        cfg.bridge_host = "127.0.0.1".to_string();
        cfg.bridge_port = 9100;
        assert_eq!(cfg.bridge_addr().unwrap(), SocketAddr::from(([127, 0, 0, 1], 9100)));

        cfg.bridge_host = "robot.local".to_string();
        assert!(cfg.bridge_addr().is_err());
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn overrides_change_serial_port_and_bridge_port() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            vars(&[("AXON_SERIAL_PORT", "/dev/ttyACM1"), ("AXON_BRIDGE_PORT", " 9999 ")]),
        );
        assert_eq!(cfg.serial_port, "/dev/ttyACM1");
        assert_eq!(cfg.bridge_port, 9999);
        assert_eq!(cfg.baud_rate, 115_200);
    }

    #[test]
    fn overrides_ignore_invalid_numbers() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            vars(&[
                ("AXON_BAUD_RATE", "fast"),
                ("AXON_BRIDGE_PORT", "70000"),
                ("AXON_CLIENT_QUEUE", "0"),
            ]),
        );
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn overrides_apply_on_top_of_the_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "bridge_port = 9001\nclient_queue = 16\n").unwrap();

        let mut cfg = load_from(&path).expect("load ok").expect("some");
        apply_overrides(&mut cfg, vars(&[("AXON_CLIENT_QUEUE", "128")]));
        assert_eq!(cfg.bridge_port, 9001);
        assert_eq!(cfg.client_queue, 128);
    }
}
