/// Worker process control: supervisor queries, start/restart, host reboot.
use crate::config::ControlConfig;
use crate::sample::ProgramState;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use regex::Regex;
use std::sync::LazyLock;
use tokio::process::Command;

/// Running/starting/stopping are read off the returned `ProgramState`, so a
/// single supervisor query answers all three.
#[async_trait]
pub trait ControlManager: Send + Sync {
    async fn program_state(&self, component: &str) -> Result<ProgramState, ControlError>;
    async fn start(&self, component: &str) -> Result<(), ControlError>;
    async fn restart(&self, component: &str) -> Result<(), ControlError>;
    async fn reboot(&self) -> Result<(), ControlError>;

    async fn get_pid(&self, component: &str) -> Result<Option<u32>, ControlError> {
        Ok(self.program_state(component).await?.pid())
    }

    /// Whether an OS process with this pid exists.
    fn process_exists(&self, pid: u32) -> bool {
        process_exists(pid)
    }
}

/// Signal 0 probe. EPERM still means the process exists.
pub fn process_exists(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            tracing::debug!(pid, error = %e, "process probe inconclusive, assuming alive");
            true
        }
    }
}

/// Errors from invoking the supervisor or reboot command.
#[derive(Debug)]
pub enum ControlError {
    Spawn {
        command: String,
        source: std::io::Error,
    },
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },
    UnexpectedOutput {
        command: String,
        output: String,
    },
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::Spawn { command, source } => {
                write!(f, "failed to run '{command}': {source}")
            }
            ControlError::CommandFailed {
                command,
                code,
                output,
            } => match code {
                Some(code) => write!(f, "'{command}' exited with {code}: {output}"),
                None => write!(f, "'{command}' killed by signal: {output}"),
            },
            ControlError::UnexpectedOutput { command, output } => {
                write!(f, "unexpected output from '{command}': {output}")
            }
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControlError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// `name   STATE   pid 123, uptime 0:01:02`
static STATUS_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+)\s+([A-Z]+)(?:\s+pid\s+(\d+))?").unwrap());

/// Parse the state of `component` out of `supervisorctl status` output.
fn parse_status(component: &str, output: &str) -> Option<ProgramState> {
    output.lines().find_map(|line| {
        let caps = STATUS_LINE.captures(line.trim())?;
        let name = caps.get(1)?.as_str();
        // Programs inside a group are listed as `group:name`
        if name != component && name.rsplit(':').next() != Some(component) {
            return None;
        }
        let state = match caps.get(2)?.as_str() {
            "RUNNING" => ProgramState::Running {
                pid: caps.get(3).and_then(|m| m.as_str().parse().ok()),
            },
            "STARTING" => ProgramState::Starting,
            "STOPPING" => ProgramState::Stopping,
            "STOPPED" => ProgramState::Stopped,
            "BACKOFF" => ProgramState::Backoff,
            "EXITED" => ProgramState::Exited,
            "FATAL" => ProgramState::Fatal,
            _ => ProgramState::Unknown,
        };
        Some(state)
    })
}

/// Drives supervisord through `supervisorctl`.
pub struct SupervisorControl {
    supervisorctl: String,
    reboot_command: Vec<String>,
}

impl SupervisorControl {
    pub fn new(config: &ControlConfig) -> Self {
        Self {
            supervisorctl: config.supervisorctl.clone(),
            reboot_command: config.reboot_command.clone(),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<(Option<i32>, String), ControlError> {
        let command = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        tracing::debug!(%command, "running control command");

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| ControlError::Spawn {
                command: command.clone(),
                source: e,
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.code(), text))
    }

    async fn run_checked(&self, program: &str, args: &[&str]) -> Result<(), ControlError> {
        let (code, output) = self.run(program, args).await?;
        if code == Some(0) {
            return Ok(());
        }
        Err(ControlError::CommandFailed {
            command: format!("{program} {}", args.join(" ")),
            code,
            output: output.trim().to_string(),
        })
    }
}

#[async_trait]
impl ControlManager for SupervisorControl {
    async fn program_state(&self, component: &str) -> Result<ProgramState, ControlError> {
        // supervisorctl exits non-zero for anything but RUNNING, so only the
        // output is meaningful here
        let (_, output) = self.run(&self.supervisorctl, &["status", component]).await?;
        parse_status(component, &output).ok_or_else(|| ControlError::UnexpectedOutput {
            command: format!("{} status {component}", self.supervisorctl),
            output: output.trim().to_string(),
        })
    }

    async fn start(&self, component: &str) -> Result<(), ControlError> {
        self.run_checked(&self.supervisorctl, &["start", component]).await
    }

    async fn restart(&self, component: &str) -> Result<(), ControlError> {
        self.run_checked(&self.supervisorctl, &["restart", component]).await
    }

    async fn reboot(&self) -> Result<(), ControlError> {
        let Some((program, args)) = self.reboot_command.split_first() else {
            return Err(ControlError::UnexpectedOutput {
                command: String::new(),
                output: "reboot command is empty".to_string(),
            });
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(program, &args).await
    }
}
