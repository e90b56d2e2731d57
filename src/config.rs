use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RETENTION_SECS: u64 = 30;
pub const DEFAULT_MAX_AUTH_FAILURES: u32 = 5;

/// On-disk configuration, loaded from TOML. Every field is optional; command
/// line flags override whatever is set here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    /// Listen address (host:port).
    pub bind: Option<String>,
    /// Shared authentication key.
    pub key: Option<String>,
    /// Shell used for persistent terminals.
    pub shell: Option<String>,
    /// Working directory for new terminals and one-shot commands.
    pub cwd: Option<PathBuf>,
    pub ready_timeout_ms: Option<u64>,
    pub retention_secs: Option<u64>,
    pub max_auth_failures: Option<u32>,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl FileConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// `<config_dir>/shellgate/config.toml`, when the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("shellgate").join("config.toml"))
    }
}

/// Values given on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<String>,
    /// Port from the environment, used only when no bind address is given anywhere.
    pub port: Option<u16>,
    pub key: Option<String>,
    pub shell: Option<String>,
    pub cwd: Option<PathBuf>,
    pub ready_timeout_ms: Option<u64>,
    pub retention_secs: Option<u64>,
    pub cors_origins: Vec<String>,
}

/// Fully resolved settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    pub key: Option<String>,
    pub shell: String,
    pub default_cwd: PathBuf,
    /// How long an `execute` waits for a terminal that is still starting.
    pub ready_timeout: Duration,
    /// How long finished correlation ids stay known to `kill`.
    pub retention: Duration,
    pub max_auth_failures: u32,
    pub cors_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            key: None,
            shell: default_shell(),
            default_cwd: default_cwd(),
            ready_timeout: Duration::from_millis(DEFAULT_READY_TIMEOUT_MS),
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            max_auth_failures: DEFAULT_MAX_AUTH_FAILURES,
            cors_origins: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Merge command line > file > defaults.
    pub fn resolve(file: Option<FileConfig>, cli: Overrides) -> Result<Self, ConfigError> {
        let file = file.unwrap_or_default();
        let defaults = Self::default();

        let bind = match cli.bind.or(file.bind) {
            Some(addr) => addr
                .parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBind(addr.clone()))?,
            None => match cli.port {
                Some(port) => SocketAddr::new(defaults.bind.ip(), port),
                None => defaults.bind,
            },
        };

        let default_cwd = cli.cwd.or(file.cwd).unwrap_or(defaults.default_cwd);
        if !default_cwd.is_dir() {
            return Err(ConfigError::InvalidCwd(default_cwd));
        }

        let mut cors_origins = file.cors_origins;
        cors_origins.extend(cli.cors_origins);

        Ok(Self {
            bind,
            key: cli.key.or(file.key).filter(|k| !k.is_empty()),
            shell: cli.shell.or(file.shell).unwrap_or(defaults.shell),
            default_cwd,
            ready_timeout: cli
                .ready_timeout_ms
                .or(file.ready_timeout_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.ready_timeout),
            retention: cli
                .retention_secs
                .or(file.retention_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.retention),
            max_auth_failures: file
                .max_auth_failures
                .unwrap_or(defaults.max_auth_failures)
                .max(1),
            cors_origins,
        })
    }
}

pub fn default_shell() -> String {
    if cfg!(windows) {
        "cmd.exe".to_string()
    } else {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

pub fn default_cwd() -> PathBuf {
    dirs::home_dir()
        .filter(|p| p.is_dir())
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Errors that can occur when loading or resolving config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    InvalidBind(String),
    InvalidCwd(PathBuf),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::InvalidBind(addr) => write!(f, "Invalid bind address: {addr}"),
            Self::InvalidCwd(path) => {
                write!(f, "Working directory does not exist: {}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Check file permissions on a config file and warn if world-readable.
///
/// On Unix, checks `st_mode & 0o004` (world-readable bit). If set, logs a
/// warning because the config file may contain the shared key.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             It may contain the access key -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
