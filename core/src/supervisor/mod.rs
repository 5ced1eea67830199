//! Broker process supervision.
//!
//! [`ProcessSupervisor`] launches the broker through its own start script,
//! streams its output onto the [`EventBus`], waits for it to accept
//! connections and stops it through the stop script, escalating to a kill
//! when it does not exit in time. It is the only writer of [`BrokerState`].

mod output;
mod probe;
mod state;

pub use probe::{ReadinessProbe, TcpProbe};
pub use state::{BrokerState, StateWatch};
pub(crate) use state::StateCell;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ToolkitSettings;
use crate::events::{EventBus, LogLevel};
use crate::inspector::BrokerConfig;
use output::{spawn_line_reader, Stream};
use probe::Backoff;

const SOURCE_BROKER: &str = "broker";
const SOURCE_STOP_SCRIPT: &str = "stop-script";
const SOURCE_SUPERVISOR: &str = "supervisor";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Broker is already {state}")]
    AlreadyRunning { state: BrokerState },

    #[error("Broker did not become ready within {timeout:?}")]
    StartupTimeout { timeout: Duration },

    #[error("Broker exited during startup ({exit})")]
    UnexpectedExit { exit: ExitInfo },

    #[error("Something is already listening on {endpoint}; refusing to start a second broker")]
    EndpointInUse { endpoint: String },

    #[error("Failed to launch broker: {message}")]
    Spawn { message: String },

    #[error("Startup interrupted by a concurrent stop")]
    Aborted,
}

/// How the broker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: std::io::Result<ExitStatus>) -> Self {
        match status {
            Ok(status) => {
                #[cfg(unix)]
                let signal = std::os::unix::process::ExitStatusExt::signal(&status);
                #[cfg(not(unix))]
                let signal = None;

                Self {
                    code: status.code(),
                    signal,
                }
            }
            Err(e) => {
                warn!("Waiting for broker process failed: {}", e);
                Self {
                    code: None,
                    signal: None,
                }
            }
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Public facts about the supervised child
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub installation: PathBuf,
}

/// Everything needed to control one launched broker. Never leaves the
/// supervisor.
struct ProcessHandle {
    info: ProcessInfo,
    stop_script: PathBuf,
    kill: CancellationToken,
    exit: watch::Receiver<Option<ExitInfo>>,
    output_cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    fn exited(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    async fn wait_exit(&mut self, timeout: Duration) -> Option<ExitInfo> {
        let _ = tokio::time::timeout(timeout, self.exit.wait_for(Option::is_some)).await;
        self.exited()
    }

    /// Kill the child and wait for it to be reaped
    async fn force_kill(&mut self, wait: Duration) -> Option<ExitInfo> {
        self.kill.cancel();
        self.wait_exit(wait).await
    }

    /// Let the readers drain what is left in the pipes, then stop them
    async fn finish_output(self, drain: Duration) {
        let output_cancel = self.output_cancel;
        let drained = async {
            for task in self.tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(drain, drained).await.is_err() {
            debug!("Output readers still busy after {:?}, cancelling", drain);
        }
        output_cancel.cancel();
    }
}

fn script_command(script: &Path) -> Command {
    if cfg!(windows) {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(script);
        command
    } else {
        Command::new(script)
    }
}

/// Supervises one broker installation at a time
pub struct ProcessSupervisor {
    settings: ToolkitSettings,
    bus: EventBus,
    state: Arc<StateCell>,
    process: Mutex<Option<ProcessHandle>>,
    probe_override: Option<Arc<dyn ReadinessProbe>>,
}

impl ProcessSupervisor {
    pub fn new(settings: ToolkitSettings, bus: EventBus) -> Self {
        Self {
            state: Arc::new(StateCell::new(bus.clone())),
            settings,
            bus,
            process: Mutex::new(None),
            probe_override: None,
        }
    }

    /// Replace the default TCP readiness probe
    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe_override = Some(probe);
        self
    }

    pub fn current_state(&self) -> BrokerState {
        self.state.current()
    }

    /// Read-only view for other components
    pub fn state_watch(&self) -> StateWatch {
        self.state.watch()
    }

    pub async fn process_info(&self) -> Option<ProcessInfo> {
        self.process.lock().await.as_ref().map(|p| p.info.clone())
    }

    fn probe_for(&self, config: &BrokerConfig) -> Arc<dyn ReadinessProbe> {
        match &self.probe_override {
            Some(probe) => probe.clone(),
            None => Arc::new(TcpProbe::new(
                config.bootstrap_endpoints.clone(),
                self.settings.probe_connect_timeout(),
            )),
        }
    }

    /// Launch the broker and wait until it accepts connections.
    ///
    /// Accepted only from `Stopped` or `Failed`. On timeout the child is
    /// killed and the state becomes `Failed("startup timeout")`.
    pub async fn start(&self, config: &BrokerConfig) -> Result<ProcessInfo, SupervisorError> {
        let state = self.state.current();
        if !state.can_start() {
            return Err(SupervisorError::AlreadyRunning { state });
        }
        if !config.start_script.is_file() {
            return Err(SupervisorError::Spawn {
                message: format!("launcher not found: {}", config.start_script.display()),
            });
        }

        let probe = self.probe_for(config);
        if probe.probe().await {
            let endpoint = probe.describe();
            warn!("Refusing to start: {} already answers", endpoint);
            self.bus.log(
                LogLevel::Warn,
                SOURCE_SUPERVISOR,
                format!("{} is already in use; is another broker running?", endpoint),
            );
            return Err(SupervisorError::EndpointInUse { endpoint });
        }

        let (info, mut exit) = {
            let mut slot = self.process.lock().await;

            self.state
                .transition(BrokerState::can_start, BrokerState::Starting)
                .map_err(|state| SupervisorError::AlreadyRunning { state })?;

            // Leftovers from a failed run.
            if let Some(previous) = slot.take() {
                previous.kill.cancel();
                previous.output_cancel.cancel();
            }

            match self.spawn(config) {
                Ok(handle) => {
                    let launched = (handle.info.clone(), handle.exit.clone());
                    *slot = Some(handle);
                    launched
                }
                Err(e) => {
                    error!("Failed to launch broker: {}", e);
                    self.bus
                        .log(LogLevel::Error, SOURCE_SUPERVISOR, e.to_string());
                    let _ = self.state.transition(
                        |s| *s == BrokerState::Starting,
                        BrokerState::Failed(e.to_string()),
                    );
                    return Err(e);
                }
            }
        };

        info!(
            "Broker launched (pid {:?}), waiting for {}",
            info.pid,
            probe.describe()
        );
        self.bus.log(
            LogLevel::Info,
            SOURCE_SUPERVISOR,
            format!("Broker process started, waiting for {}", probe.describe()),
        );

        let timeout = self.settings.startup_timeout();
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new(
            self.settings.probe_initial_backoff(),
            self.settings.probe_max_backoff(),
        );

        loop {
            if self.state.current() != BrokerState::Starting {
                return Err(SupervisorError::Aborted);
            }
            let exited = *exit.borrow();
            if let Some(status) = exited {
                return Err(self.fail_start(SupervisorError::UnexpectedExit { exit: status }).await);
            }

            if probe.probe().await {
                // Exit is checked under the state lock; the watcher publishes
                // it before looking at the state.
                let promoted = self.state.transition(
                    |s| *s == BrokerState::Starting && exit.borrow().is_none(),
                    BrokerState::Running,
                );
                match promoted {
                    Ok(_) => {
                        self.bus
                            .log(LogLevel::Info, SOURCE_SUPERVISOR, "Broker is ready");
                        return Ok(info);
                    }
                    // Still starting, so the child has exited: handled above.
                    Err(BrokerState::Starting) => continue,
                    Err(_) => return Err(SupervisorError::Aborted),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.fail_start(SupervisorError::StartupTimeout { timeout }).await);
            }

            let delay = backoff.next_delay().min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = exit.changed() => {}
            }
        }
    }

    fn spawn(&self, config: &BrokerConfig) -> Result<ProcessHandle, SupervisorError> {
        let mut command = script_command(&config.start_script);
        command
            .arg(&config.properties_path)
            .current_dir(&config.installation_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| SupervisorError::Spawn {
            message: format!("{}: {}", config.start_script.display(), e),
        })?;

        let output_cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            tasks.push(spawn_line_reader(
                stdout,
                Stream::Stdout,
                SOURCE_BROKER,
                self.bus.clone(),
                output_cancel.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tasks.push(spawn_line_reader(
                stderr,
                Stream::Stderr,
                SOURCE_BROKER,
                self.bus.clone(),
                output_cancel.clone(),
            ));
        }

        let info = ProcessInfo {
            pid: child.id(),
            started_at: Utc::now(),
            installation: config.installation_path.clone(),
        };

        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(watch_process(
            child,
            kill.clone(),
            exit_tx,
            self.state.clone(),
            self.bus.clone(),
        ));

        Ok(ProcessHandle {
            info,
            stop_script: config.stop_script.clone(),
            kill,
            exit: exit_rx,
            output_cancel,
            tasks,
        })
    }

    /// Kill whatever is left of a failed start, record the failure and hand
    /// the error back.
    async fn fail_start(&self, err: SupervisorError) -> SupervisorError {
        let handle = self.process.lock().await.take();
        if let Some(mut handle) = handle {
            if handle
                .force_kill(self.settings.kill_wait_timeout())
                .await
                .is_none()
            {
                error!("Broker pid {:?} did not die after kill", handle.info.pid);
            }
            handle.finish_output(Duration::from_millis(500)).await;
        }

        let reason = match &err {
            SupervisorError::StartupTimeout { .. } => "startup timeout".to_string(),
            SupervisorError::UnexpectedExit { exit } => format!("unexpected exit, {}", exit),
            other => other.to_string(),
        };
        error!("Broker failed to start: {}", err);
        self.bus.log(LogLevel::Error, SOURCE_SUPERVISOR, err.to_string());

        match self
            .state
            .transition(|s| *s == BrokerState::Starting, BrokerState::Failed(reason))
        {
            Ok(_) => err,
            Err(_) => SupervisorError::Aborted,
        }
    }

    /// Stop the broker: run its stop script, wait up to `graceful_timeout`
    /// for it to exit, then kill it. A no-op when already stopped; a second
    /// concurrent call waits for the first one to finish.
    pub async fn stop(&self, graceful_timeout: Duration) -> Result<(), SupervisorError> {
        let mut watch = self.state.watch();

        loop {
            match self.state.current() {
                BrokerState::Stopped => return Ok(()),
                BrokerState::Stopping => {
                    watch.wait_for(|s| *s != BrokerState::Stopping).await;
                }
                BrokerState::Failed(_) => {
                    let handle = self.process.lock().await.take();
                    if let Some(mut handle) = handle {
                        if handle.exited().is_none() {
                            handle.force_kill(self.settings.kill_wait_timeout()).await;
                        }
                        handle.finish_output(Duration::from_millis(500)).await;
                    }
                    if self
                        .state
                        .transition(|s| matches!(s, BrokerState::Failed(_)), BrokerState::Stopped)
                        .is_ok()
                    {
                        return Ok(());
                    }
                }
                BrokerState::Running | BrokerState::Starting => {
                    if self
                        .state
                        .transition(
                            |s| matches!(s, BrokerState::Running | BrokerState::Starting),
                            BrokerState::Stopping,
                        )
                        .is_ok()
                    {
                        break;
                    }
                }
            }
        }

        // Waits for a concurrent start to finish registering its child.
        let handle = self.process.lock().await.take();
        if let Some(handle) = handle {
            self.shutdown(handle, graceful_timeout).await;
        }

        let _ = self
            .state
            .transition(|s| *s == BrokerState::Stopping, BrokerState::Stopped);
        self.bus
            .log(LogLevel::Info, SOURCE_SUPERVISOR, "Broker stopped");
        Ok(())
    }

    async fn shutdown(&self, mut handle: ProcessHandle, graceful_timeout: Duration) {
        let mut stop_script = None;

        if handle.exited().is_none() {
            match self.run_stop_script(&handle) {
                Ok(child) => stop_script = Some(child),
                Err(e) => {
                    warn!("Stop script failed to run: {}", e);
                    self.bus.log(
                        LogLevel::Warn,
                        SOURCE_SUPERVISOR,
                        format!("Stop script failed to run: {}", e),
                    );
                    signal_terminate(handle.info.pid);
                }
            }
        }

        let exit = match handle.wait_exit(graceful_timeout).await {
            Some(exit) => {
                info!("Broker exited ({})", exit);
                Some(exit)
            }
            None => {
                warn!(
                    "Broker still running after {:?}, killing it",
                    graceful_timeout
                );
                self.bus.log(
                    LogLevel::Warn,
                    SOURCE_SUPERVISOR,
                    format!(
                        "Broker did not stop within {:?}; forcing termination",
                        graceful_timeout
                    ),
                );
                handle.force_kill(self.settings.kill_wait_timeout()).await
            }
        };
        if exit.is_none() {
            error!("Broker pid {:?} survived a kill", handle.info.pid);
            self.bus.log(
                LogLevel::Error,
                SOURCE_SUPERVISOR,
                "Broker process could not be confirmed dead",
            );
        }

        if let Some((mut child, readers)) = stop_script {
            if tokio::time::timeout(Duration::from_secs(1), child.wait())
                .await
                .is_err()
            {
                debug!("Stop script still running; dropping it");
            }
            for reader in readers {
                let _ = tokio::time::timeout(Duration::from_millis(500), reader).await;
            }
        }

        handle.finish_output(Duration::from_millis(500)).await;
    }

    fn run_stop_script(
        &self,
        handle: &ProcessHandle,
    ) -> std::io::Result<(Child, Vec<JoinHandle<()>>)> {
        info!("Running {}", handle.stop_script.display());

        let mut child = script_command(&handle.stop_script)
            .current_dir(&handle.info.installation)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(
                stdout,
                Stream::Stdout,
                SOURCE_STOP_SCRIPT,
                self.bus.clone(),
                handle.output_cancel.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(
                stderr,
                Stream::Stderr,
                SOURCE_STOP_SCRIPT,
                self.bus.clone(),
                handle.output_cancel.clone(),
            ));
        }
        Ok((child, readers))
    }
}

#[cfg(unix)]
fn signal_terminate(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        warn!(
            "SIGTERM to pid {} failed: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn signal_terminate(_pid: Option<u32>) {
    debug!("No terminate signal on this platform; relying on kill escalation");
}

/// Owns the child until it exits. Publishes the exit status, then turns an
/// exit while `Running` into `Failed`.
async fn watch_process(
    mut child: Child,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    state: Arc<StateCell>,
    bus: EventBus,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                warn!("Kill request failed: {}", e);
            }
            child.wait().await
        }
    };
    let exit = ExitInfo::from_status(status);
    exit_tx.send_replace(Some(exit));

    if state
        .transition(
            BrokerState::is_running,
            BrokerState::Failed(format!("unexpected exit, {}", exit)),
        )
        .is_ok()
    {
        error!("Broker exited unexpectedly ({})", exit);
        bus.log(
            LogLevel::Error,
            SOURCE_SUPERVISOR,
            format!("Broker exited unexpectedly ({})", exit),
        );
    } else {
        debug!("Broker process exited ({})", exit);
    }
}
