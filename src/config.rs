//! Client configuration.
//!
//! Loaded once at startup from a TOML file (or built in code by the
//! embedder) and held behind an `ArcSwap` by the service client so a reload
//! never tears concurrent readers.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{ClientError, ClientResult};

/// Verbosity of the server-side log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogVerbosity {
    #[default]
    Off,
    Normal,
    Verbose,
}

impl LogVerbosity {
    /// Flag value understood by the server's `--logVerbosity` option.
    pub fn as_flag(self) -> &'static str {
        match self {
            LogVerbosity::Off => "off",
            LogVerbosity::Normal => "normal",
            LogVerbosity::Verbose => "verbose",
        }
    }

    pub fn is_enabled(self) -> bool {
        self != LogVerbosity::Off
    }
}

/// Configuration for the analysis service client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfiguration {
    /// Path to the analysis server executable.
    pub server_path: PathBuf,
    /// Declared version of the server binary. Falls back to
    /// [`crate::version::ProtocolVersion::DEFAULT`] when absent or unparsable.
    pub server_version: Option<String>,
    /// Locale passed to the server via `--locale` (version-gated).
    pub locale: Option<String>,
    /// Upper bound on server heap, in megabytes.
    pub max_server_memory: Option<u32>,
    /// Route syntax-only commands to a dedicated low-latency server.
    pub use_separate_syntax_server: bool,
    /// Run diagnostics sweeps on a dedicated background server.
    pub enable_project_diagnostics: bool,
    /// Pass `--disableAutomaticTypingAcquisition` to every server role.
    pub disable_automatic_typing_acquisition: bool,
    /// Server-side log verbosity; `off` disables the log file entirely.
    pub log_verbosity: LogVerbosity,
    /// Directory for server log files. Defaults to a per-user data dir.
    pub log_dir: Option<PathBuf>,
}

impl Default for ClientConfiguration {
    fn default() -> Self {
        Self {
            server_path: PathBuf::from("tsserver"),
            server_version: None,
            locale: None,
            max_server_memory: None,
            use_separate_syntax_server: true,
            enable_project_diagnostics: false,
            disable_automatic_typing_acquisition: false,
            log_verbosity: LogVerbosity::Off,
            log_dir: None,
        }
    }
}

impl ClientConfiguration {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> ClientResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&raw)
            .map_err(|e| ClientError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Directory server log files are written to when logging is enabled.
    pub fn resolved_log_dir(&self) -> Option<PathBuf> {
        if !self.log_verbosity.is_enabled() {
            return None;
        }
        self.log_dir
            .clone()
            .or_else(|| dirs::data_local_dir().map(|dir| dir.join("tsunagi").join("server-log")))
    }

    /// Changes that require killing and respawning the server processes.
    pub fn requires_restart(&self, other: &Self) -> bool {
        self.server_path != other.server_path
            || self.locale != other.locale
            || self.max_server_memory != other.max_server_memory
            || self.use_separate_syntax_server != other.use_separate_syntax_server
            || self.enable_project_diagnostics != other.enable_project_diagnostics
            || self.disable_automatic_typing_acquisition != other.disable_automatic_typing_acquisition
            || self.log_verbosity != other.log_verbosity
            || self.log_dir != other.log_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = ClientConfiguration::default();
        assert!(config.use_separate_syntax_server);
        assert!(!config.enable_project_diagnostics);
        assert_eq!(config.log_verbosity, LogVerbosity::Off);
        assert!(config.resolved_log_dir().is_none());
    }

    #[test]
    fn parses_toml_with_partial_keys() {
        let config: ClientConfiguration = toml::from_str(
            r#"
            server_path = "/opt/analysis/tsserver"
            enable_project_diagnostics = true
            log_verbosity = "verbose"
            "#,
        )
        .unwrap();
        assert_eq!(config.server_path, PathBuf::from("/opt/analysis/tsserver"));
        assert!(config.enable_project_diagnostics);
        assert!(config.log_verbosity.is_enabled());
    }

    #[test]
    fn restart_detection_ignores_equal_configs() {
        let a = ClientConfiguration::default();
        let b = a.clone();
        assert!(!a.requires_restart(&b));

        let mut c = a.clone();
        c.enable_project_diagnostics = true;
        assert!(a.requires_restart(&c));
    }
}
