//! Environment-driven configuration, read once at startup.
//!
//! The core consumes these values but does not own them: missing variables
//! fall back to the documented defaults, malformed ones fail fast.

use crate::transport::Endpoint;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use strum_macros::{Display, EnumString, IntoStaticStr};

pub const DEFAULT_PORT: u16 = 60123;
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Communication channel between controller and injected runtime.
#[derive(Copy, Clone, PartialEq, Debug, EnumString, Display, IntoStaticStr)]
pub enum CommMode {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "unix")]
    Unix,
}

/// Startup execution mode of the injected runtime.
#[derive(Copy, Clone, PartialEq, Debug, EnumString, Display, IntoStaticStr)]
pub enum StartMode {
    #[strum(serialize = "interactive")]
    Interactive,
    #[strum(serialize = "unattended")]
    Unattended,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub comm: CommMode,
    pub host: String,
    pub port: u16,
    /// Unix socket path, meaningful when `comm == Unix`.
    pub socket_path: PathBuf,
    pub log_level: log::LevelFilter,
    pub log_dir: Option<PathBuf>,
    /// Search path for auxiliary debug shared objects.
    pub lib_path: Option<PathBuf>,
    pub start_mode: StartMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            comm: CommMode::Tcp,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            socket_path: std::env::temp_dir().join("gldbg.sock"),
            log_level: log::LevelFilter::Info,
            log_dir: None,
            lib_path: None,
            start_mode: StartMode::Interactive,
        }
    }
}

impl Config {
    /// Read configuration from `GLDBG_*` environment variables.
    ///
    /// Recognized: `GLDBG_COMM` (tcp|unix), `GLDBG_HOST`, `GLDBG_PORT`,
    /// `GLDBG_SOCKET`, `GLDBG_LOG_LEVEL`, `GLDBG_LOG_DIR`, `GLDBG_LIB_PATH`,
    /// `GLDBG_MODE` (interactive|unattended).
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();

        if let Some(comm) = env_var("GLDBG_COMM") {
            config.comm = CommMode::from_str(&comm)
                .map_err(|_| anyhow::anyhow!("GLDBG_COMM: unknown mode `{comm}`"))?;
        }
        if let Some(host) = env_var("GLDBG_HOST") {
            config.host = host;
        }
        if let Some(port) = env_var("GLDBG_PORT") {
            config.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("GLDBG_PORT: invalid port `{port}`"))?;
        }
        if let Some(path) = env_var("GLDBG_SOCKET") {
            config.socket_path = PathBuf::from(path);
        }
        if let Some(level) = env_var("GLDBG_LOG_LEVEL") {
            config.log_level = log::LevelFilter::from_str(&level)
                .map_err(|_| anyhow::anyhow!("GLDBG_LOG_LEVEL: invalid level `{level}`"))?;
        }
        if let Some(dir) = env_var("GLDBG_LOG_DIR") {
            config.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = env_var("GLDBG_LIB_PATH") {
            config.lib_path = Some(PathBuf::from(path));
        }
        if let Some(mode) = env_var("GLDBG_MODE") {
            config.start_mode = StartMode::from_str(&mode)
                .map_err(|_| anyhow::anyhow!("GLDBG_MODE: unknown mode `{mode}`"))?;
        }

        Ok(config)
    }

    /// Endpoint the session listens on / connects to.
    pub fn endpoint(&self) -> Endpoint {
        match self.comm {
            CommMode::Tcp => Endpoint::Tcp {
                host: self.host.clone(),
                port: self.port,
            },
            CommMode::Unix => Endpoint::Unix {
                path: self.socket_path.clone(),
            },
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Read-only session configuration (set only once, at startup).
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Set initial configuration.
pub fn set(config: Config) {
    CONFIG.set(config).expect("should called once");
}

/// Return the session config, falling back to defaults when unset.
pub fn current() -> &'static Config {
    CONFIG.get_or_init(Config::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_tcp_interactive() {
        let config = Config::default();
        assert_eq!(config.comm, CommMode::Tcp);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.start_mode, StartMode::Interactive);
    }

    #[test]
    fn comm_mode_parses() {
        assert_eq!(CommMode::from_str("tcp").unwrap(), CommMode::Tcp);
        assert_eq!(CommMode::from_str("unix").unwrap(), CommMode::Unix);
        assert!(CommMode::from_str("shm").is_err());
    }
}
