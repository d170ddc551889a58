//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/xwlink/config.toml or /etc/xwlink/config.toml.
/// Env overrides: XWLINK_DEVICE_NAME, XWLINK_STORAGE_DIR, XWLINK_LOG_LEVEL,
/// XWLINK_PUBSUB_ENABLED, XWLINK_MESH_ENABLED, XWLINK_MESH_PORT, XWLINK_MESH_OWNER.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name shown to mesh peers.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Where persisted blobs live.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Fallback filter when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub pubsub: PubSubConfig,
    #[serde(default)]
    pub tap: TapConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PubSubConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_backoff_floor_ms")]
    pub backoff_floor_ms: u64,
    #[serde(default = "default_backoff_ceiling_ms")]
    pub backoff_ceiling_ms: u64,
    /// Publish worker gives up after this long without a connection.
    #[serde(default = "default_idle_exit_ms")]
    pub idle_exit_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TapConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_frame")]
    pub max_frame: usize,
    #[serde(default = "default_read_min_ms")]
    pub read_mode_min_ms: u64,
    #[serde(default = "default_read_max_ms")]
    pub read_mode_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshConfig {
    #[serde(default)]
    pub enabled: bool,
    /// This device's mesh address; generated if empty.
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_owner_port")]
    pub owner_port: u16,
    /// Act as group owner (listen) instead of connecting out.
    #[serde(default)]
    pub owner: bool,
    /// Owner to connect to when not the owner, e.g. "192.168.49.1:5432".
    #[serde(default)]
    pub owner_addr: Option<String>,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_step_retry_ms")]
    pub step_retry_ms: u64,
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "xwlink".to_string())
}
fn default_storage_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/xwlink"),
        None => PathBuf::from("/var/lib/xwlink"),
    }
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_qos() -> u8 {
    1
}
fn default_backoff_floor_ms() -> u64 {
    2 * 60 * 1000
}
fn default_backoff_ceiling_ms() -> u64 {
    4 * 60 * 60 * 1000
}
fn default_idle_exit_ms() -> u64 {
    10_000
}
fn default_queue_capacity() -> usize {
    256
}
fn default_max_frame() -> usize {
    xwlink_core::tap::DEFAULT_MAX_FRAME
}
fn default_read_min_ms() -> u64 {
    300
}
fn default_read_max_ms() -> u64 {
    500
}
fn default_owner_port() -> u16 {
    xwlink_core::mesh::OWNER_PORT
}
fn default_failure_threshold() -> u32 {
    8
}
fn default_step_retry_ms() -> u64 {
    10_000
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            qos: default_qos(),
            backoff_floor_ms: default_backoff_floor_ms(),
            backoff_ceiling_ms: default_backoff_ceiling_ms(),
            idle_exit_ms: default_idle_exit_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_frame: default_max_frame(),
            read_mode_min_ms: default_read_min_ms(),
            read_mode_max_ms: default_read_max_ms(),
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            owner_port: default_owner_port(),
            owner: false,
            owner_addr: None,
            failure_threshold: default_failure_threshold(),
            step_retry_ms: default_step_retry_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            storage_dir: default_storage_dir(),
            log_level: default_log_level(),
            pubsub: PubSubConfig::default(),
            tap: TapConfig::default(),
            mesh: MeshConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("XWLINK_DEVICE_NAME") {
        c.device_name = s;
    }
    if let Some(s) = var("XWLINK_STORAGE_DIR") {
        c.storage_dir = PathBuf::from(s);
    }
    if let Some(s) = var("XWLINK_LOG_LEVEL") {
        c.log_level = s;
    }
    if let Some(b) = var("XWLINK_PUBSUB_ENABLED").and_then(|s| parse_bool(&s)) {
        c.pubsub.enabled = b;
    }
    if let Some(b) = var("XWLINK_MESH_ENABLED").and_then(|s| parse_bool(&s)) {
        c.mesh.enabled = b;
    }
    if let Some(p) = var("XWLINK_MESH_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.mesh.owner_port = p;
    }
    if let Some(b) = var("XWLINK_MESH_OWNER").and_then(|s| parse_bool(&s)) {
        c.mesh.owner = b;
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/xwlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/xwlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => eprintln!("xwlink: ignoring {}: {}", p.display(), e),
                },
                Err(e) => eprintln!("xwlink: cannot read {}: {}", p.display(), e),
            }
            break;
        }
    }
    None
}
