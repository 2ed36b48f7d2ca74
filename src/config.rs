use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from watchdog.toml.
///
/// The file is re-read on every loop iteration, so operators (and the
/// surrounding agent) can flip `state.stopped` or tune periods without
/// restarting the watchdog.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub watchdog: WatchdogConfig,
    pub worker: WorkerConfig,
    pub coordinator: CoordinatorConfig,
    pub control: ControlConfig,
    pub capture: CaptureConfig,
    pub state: StateConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub check_period_secs: f64,
    pub warmup_period_secs: f64,
    pub relax_period_secs: f64,
    pub warning_report_period_secs: f64,
    pub error_report_period_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Supervisor program name of the worker.
    pub component: String,
    pub status_url: String,
    pub http_timeout_secs: f64,
    pub expected_http_response_time_secs: f64,
    pub heartbeat_enabled: bool,
    pub offline_to_restart_secs: f64,
    pub offline_to_reboot_secs: f64,
    pub restart_wait_secs: f64,
    pub reboot_wait_secs: f64,
    pub purge_period_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub url: String,
    pub token: Option<String>,
    pub timeout_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub supervisorctl: String,
    pub reboot_command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CaptureConfig {
    /// When set, captured messages are POSTed here as JSON.
    pub webhook_url: Option<String>,
}

/// Lifecycle facts owned by the surrounding agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub activated: bool,
    pub stopped: bool,
    pub worker_started_at: Option<DateTime<Utc>>,
    pub rebooted_at: Option<DateTime<Utc>>,
}

// --- Default implementations ---

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_period_secs: 30.0,
            warmup_period_secs: 120.0,
            relax_period_secs: 60.0,
            warning_report_period_secs: 3600.0,
            error_report_period_secs: 600.0,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            component: "packy-agent-worker".to_string(),
            status_url: "http://127.0.0.1:8001/status".to_string(),
            http_timeout_secs: 10.0,
            expected_http_response_time_secs: 1.0,
            heartbeat_enabled: true,
            offline_to_restart_secs: 600.0,
            offline_to_reboot_secs: 1800.0,
            restart_wait_secs: 600.0,
            reboot_wait_secs: 3600.0,
            purge_period_secs: 3600.0,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            url: "https://packy.io/api/v2/agent/online".to_string(),
            token: None,
            timeout_secs: 10.0,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            supervisorctl: "supervisorctl".to_string(),
            reboot_command: vec!["sudo".to_string(), "reboot".to_string()],
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            activated: true,
            stopped: false,
            worker_started_at: None,
            rebooted_at: None,
        }
    }
}

/// Source of settings, consulted once per loop iteration.
pub trait SettingsProvider: Send + Sync {
    fn load(&self) -> Result<Settings, ConfigError>;
}

/// Reads settings from a TOML file on every call.
pub struct FileSettings {
    path: PathBuf,
}

impl FileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsProvider for FileSettings {
    fn load(&self) -> Result<Settings, ConfigError> {
        load_settings(&self.path)
    }
}

/// Parse settings from a TOML file.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_settings(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

fn parse_settings(contents: &str) -> Result<Settings, toml::de::Error> {
    toml::from_str(contents)
}

/// Errors from loading the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_when_empty() {
        let settings = parse_settings("").unwrap();
        assert_eq!(settings.watchdog.check_period_secs, 30.0);
        assert_eq!(settings.worker.component, "packy-agent-worker");
        assert!(settings.state.activated);
        assert!(!settings.state.stopped);
        assert!(settings.capture.webhook_url.is_none());
        assert_eq!(settings.control.reboot_command, vec!["sudo", "reboot"]);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let settings = parse_settings(
            r#"
[watchdog]
relax_period_secs = 10

[worker]
offline_to_restart_secs = 5.5
"#,
        )
        .unwrap();
        assert_eq!(settings.watchdog.relax_period_secs, 10.0);
        assert_eq!(settings.watchdog.check_period_secs, 30.0);
        assert_eq!(settings.worker.offline_to_restart_secs, 5.5);
        assert_eq!(settings.worker.offline_to_reboot_secs, 1800.0);
    }

    #[test]
    fn test_state_timestamps_parse_rfc3339() {
        let settings = parse_settings(
            r#"
[state]
stopped = true
worker_started_at = "2024-03-01T12:00:00Z"
"#,
        )
        .unwrap();
        assert!(settings.state.stopped);
        assert_eq!(
            settings.state.worker_started_at.unwrap().to_rfc3339(),
            "2024-03-01T12:00:00+00:00"
        );
        assert!(settings.state.rebooted_at.is_none());
    }

    #[test]
    fn test_file_settings_rereads_on_each_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watchdog.toml");
        std::fs::write(&path, "[watchdog]\ncheck_period_secs = 5\n").unwrap();

        let provider = FileSettings::new(&path);
        assert_eq!(provider.load().unwrap().watchdog.check_period_secs, 5.0);

        std::fs::write(&path, "[watchdog]\ncheck_period_secs = 7\n").unwrap();
        assert_eq!(provider.load().unwrap().watchdog.check_period_secs, 7.0);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = tempdir().unwrap();
        let err = load_settings(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("failed to read config"));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watchdog.toml");
        std::fs::write(&path, "[watchdog]\ncheck_period_secs = \"soon\"\n").unwrap();
        let err = load_settings(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
