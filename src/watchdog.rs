/// Worker watchdog: polls worker health on a fixed cadence and escalates
/// through start, restart and host reboot when the worker stops making
/// progress or drops offline.
///
/// Each iteration resolves, in order: online status (coordinator),
/// supervisor program status, OS process status, and the worker's own HTTP
/// status report. The first decisive outcome triggers its remedial action
/// and ends the iteration.
use crate::capture::CaptureSink;
use crate::clock::{period, Clock, InvalidPeriod};
use crate::config::{ConfigError, Settings, SettingsProvider};
use crate::control::{ControlError, ControlManager};
use crate::coordinator::Coordinator;
use crate::liveness::{LoopTracker, WorkflowTracker};
use crate::report::Reporter;
use crate::worker::{WorkerClient, WorkerError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Wait used when the check period cannot be read from settings.
pub const FAILOVER_CHECK_PERIOD: Duration = Duration::from_secs(30);

/// Outcome of one resolution step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Ok,
    /// No definitive answer; keep the previous state.
    Unknown,
    /// Anomaly worth reporting but not worth a restart.
    Warning,
    /// The worker's status endpoint failed; reported, not escalated.
    Error,
    Start,
    Restart,
    Reboot,
}

/// Everything the watchdog talks to.
pub struct Collaborators {
    pub coordinator: Box<dyn Coordinator>,
    pub control: Box<dyn ControlManager>,
    pub worker: Box<dyn WorkerClient>,
    pub settings: Box<dyn SettingsProvider>,
    pub sink: Box<dyn CaptureSink>,
    pub clock: Box<dyn Clock>,
}

/// Requests a graceful stop from another task or a signal handler.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Ask the loop to exit; wakes it if it is waiting for the next check.
    pub fn graceful_stop(&self) {
        self.tx.send_replace(true);
    }
}

pub struct WatchdogService {
    coordinator: Box<dyn Coordinator>,
    control: Box<dyn ControlManager>,
    worker: Box<dyn WorkerClient>,
    settings: Box<dyn SettingsProvider>,
    clock: Box<dyn Clock>,
    reporter: Reporter,

    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,

    started_at: DateTime<Utc>,
    last_known_online: Option<DateTime<Utc>>,
    last_start_request: Option<DateTime<Utc>>,
    last_reboot_request: Option<DateTime<Utc>>,
    has_reported_not_activated: bool,
    has_reported_stopped: bool,

    loops: LoopTracker,
    workflow: WorkflowTracker,
}

impl WatchdogService {
    pub fn new(collaborators: Collaborators) -> Self {
        let Collaborators {
            coordinator,
            control,
            worker,
            settings,
            sink,
            clock,
        } = collaborators;
        let (stop_tx, stop_rx) = watch::channel(false);
        let started_at = clock.now();

        Self {
            coordinator,
            control,
            worker,
            settings,
            clock,
            reporter: Reporter::new(sink),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            started_at,
            last_known_online: None,
            last_start_request: None,
            last_reboot_request: None,
            has_reported_not_activated: false,
            has_reported_stopped: false,
            loops: LoopTracker::new(),
            workflow: WorkflowTracker::new(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    #[cfg(test)]
    pub fn graceful_stop(&self) {
        self.stop_handle().graceful_stop();
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Run iterations until a graceful stop is requested.
    pub async fn run(&mut self) {
        tracing::info!("watchdog started");

        while !self.stop_requested() {
            let started = tokio::time::Instant::now();
            if let Err(e) = self.loop_iteration().await {
                self.reporter.exception("error during loop iteration", &e);
            }

            // Settings may change at any time, so the period is re-read every loop
            let wait = self.check_period().saturating_sub(started.elapsed());
            if !wait.is_zero() {
                tracing::debug!(wait_secs = wait.as_secs_f64(), "waiting for next iteration");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.stop_rx.changed() => {}
                }
            }
        }

        tracing::info!("watchdog stopped gracefully");
    }

    fn check_period(&self) -> Duration {
        let loaded = self
            .settings
            .load()
            .map_err(WatchdogError::Config)
            .and_then(|s| {
                let secs = s.watchdog.check_period_secs;
                Duration::try_from_secs_f64(secs).map_err(|_| {
                    WatchdogError::InvalidPeriod(InvalidPeriod {
                        setting: "watchdog.check_period_secs",
                        secs,
                    })
                })
            });
        match loaded {
            Ok(period) => period,
            Err(e) => {
                self.reporter.exception(
                    &format!(
                        "could not get check period from settings, using failover value of {}s",
                        FAILOVER_CHECK_PERIOD.as_secs()
                    ),
                    &e,
                );
                FAILOVER_CHECK_PERIOD
            }
        }
    }

    /// One pass over all checks. Worker and console handling failures are
    /// reported here and do not fail the iteration.
    pub async fn loop_iteration(&mut self) -> Result<(), WatchdogError> {
        let settings = self.settings.load()?;
        self.reporter.configure(&settings.watchdog)?;

        let warmup = period(
            "watchdog.warmup_period_secs",
            settings.watchdog.warmup_period_secs,
        )?;
        if self.clock.now() - self.started_at < warmup {
            tracing::debug!("warming up");
            return Ok(());
        }

        self.check(&settings).await;
        Ok(())
    }

    /// Single iteration that ignores the warm-up period.
    pub async fn run_once(&mut self) -> Result<(), WatchdogError> {
        let settings = self.settings.load()?;
        self.reporter.configure(&settings.watchdog)?;
        self.check(&settings).await;
        Ok(())
    }

    async fn check(&mut self, settings: &Settings) {
        if let Err(e) = self.handle_worker(settings).await {
            self.reporter.exception("error while handling worker", &e);
        }

        if let Err(e) = self.handle_console(settings) {
            self.reporter.exception("error while handling console", &e);
        }
    }

    pub async fn handle_worker(&mut self, settings: &Settings) -> Result<(), WatchdogError> {
        if !settings.state.activated {
            if !self.has_reported_not_activated {
                self.has_reported_not_activated = true;
                tracing::info!("worker is not activated");
            }
            return Ok(());
        }
        self.has_reported_not_activated = false;

        if settings.state.stopped {
            if !self.has_reported_stopped {
                self.has_reported_stopped = true;
                tracing::info!("worker is stopped on purpose");
            }
            return Ok(());
        }
        self.has_reported_stopped = false;

        match self.resolve_online_status(settings).await? {
            Resolution::Reboot => return self.reboot().await,
            Resolution::Restart => return self.restart_worker(settings).await,
            _ => {}
        }

        match self.resolve_worker_supervisor_program_status(settings).await? {
            Resolution::Start => return self.start_worker(settings).await,
            Resolution::Unknown => {
                tracing::debug!("worker is starting or stopping, skipping remaining checks");
                return Ok(());
            }
            _ => {}
        }

        if self.resolve_worker_process_status(settings).await? == Resolution::Restart {
            // Supervisor says running but the process is gone: the two are out
            // of sync, so a plain start would not help
            return self.restart_worker(settings).await;
        }

        if self.resolve_worker_response(settings).await? == Resolution::Restart {
            return self.restart_worker(settings).await;
        }

        Ok(())
    }

    /// Console supervision is not implemented; the agent console manages itself.
    pub fn handle_console(&mut self, _settings: &Settings) -> Result<(), WatchdogError> {
        Ok(())
    }

    pub async fn resolve_online_status(
        &mut self,
        settings: &Settings,
    ) -> Result<Resolution, WatchdogError> {
        tracing::debug!("resolving agent online status");
        let now = self.clock.now();

        if !settings.worker.heartbeat_enabled {
            tracing::debug!("heartbeat is disabled, agent is not expected to be online");
            return Ok(Resolution::Unknown);
        }

        match self.coordinator.is_agent_online().await {
            Ok(Some(true)) => self.last_known_online = Some(now),
            Ok(Some(false)) => {}
            Ok(None) => {
                tracing::debug!("coordinator could not tell whether agent is online");
                return Ok(Resolution::Unknown);
            }
            Err(e) => {
                tracing::debug!(error = %e, "could not get agent online status");
                return Ok(Resolution::Unknown);
            }
        }

        let Some(last_online) = self.last_known_online else {
            return Ok(Resolution::Unknown);
        };
        let offline = now - last_online;
        let worker = &settings.worker;
        let offline_to_reboot =
            period("worker.offline_to_reboot_secs", worker.offline_to_reboot_secs)?;
        let reboot_wait = period("worker.reboot_wait_secs", worker.reboot_wait_secs)?;
        let offline_to_restart =
            period("worker.offline_to_restart_secs", worker.offline_to_restart_secs)?;
        let restart_wait = period("worker.restart_wait_secs", worker.restart_wait_secs)?;

        let rebooted_at = latest(settings.state.rebooted_at, self.last_reboot_request);
        let started_at = latest(settings.state.worker_started_at, self.last_start_request);

        // Offline long enough and rebooted long ago: reboot
        if offline >= offline_to_reboot && waited(rebooted_at, reboot_wait, now) {
            return Ok(Resolution::Reboot);
        }
        // Offline long enough and started long ago: restart
        if offline >= offline_to_restart && waited(started_at, restart_wait, now) {
            return Ok(Resolution::Restart);
        }

        Ok(Resolution::Ok)
    }

    pub async fn resolve_worker_supervisor_program_status(
        &mut self,
        settings: &Settings,
    ) -> Result<Resolution, WatchdogError> {
        tracing::debug!("resolving worker supervisor status");
        let state = self.control.program_state(&settings.worker.component).await?;

        if state.is_running() {
            tracing::debug!("worker is running (supervisor)");
            Ok(Resolution::Ok)
        } else if !(state.is_starting() || state.is_stopping()) {
            tracing::debug!(?state, "worker is not running (supervisor)");
            Ok(Resolution::Start)
        } else {
            Ok(Resolution::Unknown)
        }
    }

    pub async fn resolve_worker_process_status(
        &mut self,
        settings: &Settings,
    ) -> Result<Resolution, WatchdogError> {
        let pid = self.control.get_pid(&settings.worker.component).await?;
        match pid {
            Some(pid) if self.control.process_exists(pid) => Ok(Resolution::Ok),
            Some(pid) => {
                tracing::debug!(pid, "worker process does not exist");
                Ok(Resolution::Restart)
            }
            None => {
                tracing::debug!("supervisor reports no pid for running worker");
                Ok(Resolution::Restart)
            }
        }
    }

    pub async fn resolve_worker_response(
        &mut self,
        settings: &Settings,
    ) -> Result<Resolution, WatchdogError> {
        let expected = period(
            "worker.expected_http_response_time_secs",
            settings.worker.expected_http_response_time_secs,
        )?;
        let relax = period("watchdog.relax_period_secs", settings.watchdog.relax_period_secs)?;
        let purge_period = period("worker.purge_period_secs", settings.worker.purge_period_secs)?;

        let start = self.clock.now();
        let result = self.worker.get_status().await;
        let finish = self.clock.now();

        let status = match result {
            Ok(status) => status,
            Err(WorkerError::Connection { source }) => {
                tracing::debug!(error = %source, "could not get worker status over HTTP");
                return Ok(Resolution::Restart);
            }
            Err(WorkerError::Http { status, body }) => {
                self.reporter
                    .error(&format!("Worker returned HTTP{status}: {body}"), finish);
                return Ok(Resolution::Error);
            }
            Err(e) => {
                self.reporter
                    .error(&format!("Could not read Worker status: {e}"), finish);
                return Ok(Resolution::Error);
            }
        };

        let mut result = Resolution::Ok;

        let actual = finish - start;
        if actual > expected {
            result = Resolution::Warning;
            self.reporter.warning(
                &format!(
                    "It took {:.3} seconds for Worker to respond while it was expected to take only {:.3}",
                    actual.num_milliseconds() as f64 / 1000.0,
                    settings.worker.expected_http_response_time_secs
                ),
                finish,
            );
        }

        if status.loops.is_empty() {
            result = Resolution::Warning;
            self.reporter
                .warning("Worker did not return running loops", finish);
        } else if self
            .loops
            .resolve(&status.loops, relax, finish, &mut self.reporter)
        {
            result = Resolution::Warning;
        }

        if self
            .workflow
            .resolve(&status, relax, purge_period, finish, &mut self.reporter)
            == Some(true)
        {
            result = Resolution::Warning;
        }

        Ok(result)
    }

    pub async fn start_worker(&mut self, settings: &Settings) -> Result<(), WatchdogError> {
        let now = self.clock.now();
        self.reporter.warning("Watchdog requested Worker start", now);
        self.last_start_request = Some(now);
        self.control.start(&settings.worker.component).await?;
        Ok(())
    }

    pub async fn restart_worker(&mut self, settings: &Settings) -> Result<(), WatchdogError> {
        let now = self.clock.now();
        self.reporter.warning("Watchdog requested Worker restart", now);
        self.last_start_request = Some(now);
        self.control.restart(&settings.worker.component).await?;
        Ok(())
    }

    pub async fn reboot(&mut self) -> Result<(), WatchdogError> {
        let now = self.clock.now();
        self.reporter.warning("Watchdog requested reboot", now);
        self.last_reboot_request = Some(now);
        self.control.reboot().await?;
        Ok(())
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    a.max(b)
}

/// Whether `wait` has passed since `since` (the epoch when unknown). A wait
/// ending past the representable range never elapses.
fn waited(since: Option<DateTime<Utc>>, wait: chrono::Duration, now: DateTime<Utc>) -> bool {
    since
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .checked_add_signed(wait)
        .is_some_and(|end| now >= end)
}

/// Failures that abort a watchdog step.
#[derive(Debug)]
pub enum WatchdogError {
    Config(ConfigError),
    InvalidPeriod(InvalidPeriod),
    Control(ControlError),
}

impl std::fmt::Display for WatchdogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchdogError::Config(e) => write!(f, "settings unavailable: {e}"),
            WatchdogError::InvalidPeriod(e) => write!(f, "settings unusable: {e}"),
            WatchdogError::Control(e) => write!(f, "worker control failed: {e}"),
        }
    }
}

impl std::error::Error for WatchdogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchdogError::Config(e) => Some(e),
            WatchdogError::InvalidPeriod(e) => Some(e),
            WatchdogError::Control(e) => Some(e),
        }
    }
}

impl From<ConfigError> for WatchdogError {
    fn from(e: ConfigError) -> Self {
        WatchdogError::Config(e)
    }
}

impl From<InvalidPeriod> for WatchdogError {
    fn from(e: InvalidPeriod) -> Self {
        WatchdogError::InvalidPeriod(e)
    }
}

impl From<ControlError> for WatchdogError {
    fn from(e: ControlError) -> Self {
        WatchdogError::Control(e)
    }
}
