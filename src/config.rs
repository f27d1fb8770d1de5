//! Configuration for tilemux.
//!
//! Loaded from `~/.tilemux/config.toml`; every key is optional:
//!
//! ```toml
//! # Command run in new panes (defaults to $SHELL, then /bin/sh)
//! shell = "/bin/zsh"
//!
//! # Log filter, overridden by RUST_LOG
//! log_level = "info"
//!
//! [server]
//! # Unix socket path (default ~/.tilemux/tilemux.sock)
//! socket = "/tmp/tilemux.sock"
//! # Listen on loopback TCP instead of the Unix socket
//! tcp = "127.0.0.1:4376"
//!
//! [status_bar]
//! show_time = true
//! time_format = "%H:%M:%S"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::pty::CommandSpec;

/// Default loopback address for `server --tcp`
pub const DEFAULT_TCP_ADDR: &str = "127.0.0.1:4376";

/// Status bar clock format used when none (or an invalid one) is configured
pub const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Command run in new panes
    pub shell: Option<String>,
    /// Tracing filter directive
    pub log_level: String,
    pub server: ServerConfig,
    pub status_bar: StatusBarConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            log_level: "info".to_string(),
            server: ServerConfig::default(),
            status_bar: StatusBarConfig::default(),
        }
    }
}

/// Control-plane endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub socket: Option<PathBuf>,
    pub tcp: Option<String>,
}

/// Status bar configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusBarConfig {
    pub show_time: bool,
    /// chrono format string for the clock
    pub time_format: String,
}

impl Default for StatusBarConfig {
    fn default() -> Self {
        Self {
            show_time: true,
            time_format: DEFAULT_TIME_FORMAT.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `~/.tilemux/config.toml`, falling back to defaults
    pub fn load() -> Self {
        match config_dir() {
            Some(dir) => Self::load_from(&dir.join("config.toml")),
            None => Self::default(),
        }
    }

    /// Load from an explicit path; a missing or invalid file yields defaults.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                return Self::default();
            }
        };
        match toml::from_str::<Self>(&content) {
            Ok(mut config) => {
                if !crate::ui::statusbar::is_valid_time_format(&config.status_bar.time_format) {
                    warn!(
                        "Invalid time_format {:?} in {}, using the default",
                        config.status_bar.time_format,
                        path.display()
                    );
                    config.status_bar.time_format = DEFAULT_TIME_FORMAT.to_string();
                }
                config
            }
            Err(e) => {
                warn!("Invalid config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Command for new panes: `shell`, then `$SHELL`, then `/bin/sh`
    pub fn shell_command(&self) -> CommandSpec {
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .and_then(|line| CommandSpec::from_command_line(&line))
            .unwrap_or_else(|| CommandSpec::new("/bin/sh"))
    }

    /// Unix socket the server listens on
    pub fn socket_path(&self) -> PathBuf {
        if let Some(path) = &self.server.socket {
            return path.clone();
        }
        config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("tilemux.sock")
    }
}

/// `~/.tilemux`, created on demand
pub fn config_dir() -> Option<PathBuf> {
    let dir = home_dir()?.join(".tilemux");
    if !dir.exists() {
        let _ = fs::create_dir_all(&dir);
    }
    Some(dir)
}

/// Log file written by every mode
pub fn log_path() -> PathBuf {
    config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("tilemux.log")
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.toml"));
        assert_eq!(config.log_level, "info");
        assert!(config.status_bar.show_time);
        assert!(config.server.tcp.is_none());
    }

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "shell = \"/bin/bash -l\"\n[server]\ntcp = \"127.0.0.1:9000\"").unwrap();

        let config = Config::load_from(file.path());
        assert_eq!(config.server.tcp.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(config.log_level, "info");

        let shell = config.shell_command();
        assert_eq!(shell.program, "/bin/bash");
        assert_eq!(shell.args, vec!["-l"]);
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "shell = [").unwrap();
        let config = Config::load_from(file.path());
        assert!(config.shell.is_none());
    }

    #[test]
    fn test_explicit_socket() {
        let config = Config {
            server: ServerConfig {
                socket: Some(PathBuf::from("/tmp/x.sock")),
                tcp: None,
            },
            ..Config::default()
        };
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/x.sock"));
    }

    #[test]
    fn test_bad_time_format_replaced_on_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[status_bar]\ntime_format = \"%Q\"").unwrap();
        let config = Config::load_from(file.path());
        assert_eq!(config.status_bar.time_format, DEFAULT_TIME_FORMAT);
        assert!(config.status_bar.show_time);
    }
}
