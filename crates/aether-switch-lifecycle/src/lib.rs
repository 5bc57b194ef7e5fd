//! Process lifecycle control for the managed Aether installation: detect
//! running processes, execute a staged cross-platform shutdown, and launch
//! the application again.
//!
//! The stop sequence per attempt is: platform graceful-quit request, then a
//! terminate signal to every matching process, then a bounded poll for
//! exit, then (when permitted) a hard kill. The whole sequence retries with
//! increasing backoff, skipping a retry once nothing matches any more.

pub mod scan;

use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

pub use scan::ProcessInfo;

/// Display name of the managed application.
pub const APP_NAME: &str = "Aether";

/// URI used for activation handoff when launching.
pub const ACTIVATION_URI: &str = "aether://welcome";

#[cfg(target_os = "macos")]
const MACOS_BUNDLE_MARKER: &str = "aether.app";
#[cfg(windows)]
const WINDOWS_IMAGE: &str = "aether.exe";
#[cfg(all(unix, not(target_os = "macos")))]
const LINUX_BINARY: &str = "aether";

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const KILL_GRACE: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_UNIT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("processes still running after {attempts} shutdown attempts: {survivors:?}")]
    Unkillable { attempts: u32, survivors: Vec<String> },
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} reported failure ({status})")]
    CommandFailed { command: String, status: std::process::ExitStatus },
    #[error("no {APP_NAME} executable found to launch")]
    ExecutableNotFound,
}

/// Options for one staged stop.
#[derive(Debug, Clone)]
pub struct StopOptions {
    /// How long to wait for matched processes to exit per attempt.
    pub timeout: Duration,
    /// Escalate to a hard kill when the timeout elapses.
    pub force_kill: bool,
    /// Whole-sequence attempts before giving up.
    pub max_retries: u32,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10), force_kill: true, max_retries: 3 }
    }
}

/// Options for launching the application.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Prefer URI activation over launching the executable directly.
    pub use_uri: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self { use_uri: true }
    }
}

/// What a successful stop took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    /// Attempts used; 0 when nothing was running to begin with.
    pub attempts: u32,
    /// Whether a hard kill was needed.
    pub forced: bool,
    pub elapsed: Duration,
}

/// Decides whether an observed process belongs to the managed application.
pub trait ProcessMatcher: Send + Sync {
    fn matches(&self, process: &ProcessInfo) -> bool;
}

/// The fixed platform markers for Aether.
pub struct AetherMatcher;

impl ProcessMatcher for AetherMatcher {
    fn matches(&self, process: &ProcessInfo) -> bool {
        marker_match(process)
    }
}

#[cfg(target_os = "macos")]
fn marker_match(process: &ProcessInfo) -> bool {
    process
        .exe
        .as_ref()
        .is_some_and(|exe| exe.to_string_lossy().to_lowercase().contains(MACOS_BUNDLE_MARKER))
}

#[cfg(windows)]
fn marker_match(process: &ProcessInfo) -> bool {
    let name = process.name.to_lowercase();
    name == WINDOWS_IMAGE || name == "aether"
}

#[cfg(all(unix, not(target_os = "macos")))]
fn marker_match(process: &ProcessInfo) -> bool {
    let name = process.name.to_lowercase();
    let exe = process
        .exe
        .as_ref()
        .map(|exe| exe.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    name == LINUX_BINARY || exe.contains(LINUX_BINARY)
}

#[cfg(not(any(unix, windows)))]
fn marker_match(_process: &ProcessInfo) -> bool {
    false
}

/// Detects, stops, and starts the managed application.
pub struct LifecycleController {
    matcher: Box<dyn ProcessMatcher>,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleController {
    #[must_use]
    pub fn new() -> Self {
        Self::with_matcher(Box::new(AetherMatcher))
    }

    /// Controller with a custom matcher; the staged stop machinery is
    /// unchanged.
    #[must_use]
    pub fn with_matcher(matcher: Box<dyn ProcessMatcher>) -> Self {
        Self { matcher }
    }

    /// Matching processes, excluding this process and anything running from
    /// this tool's own install directory.
    #[must_use]
    pub fn running_processes(&self) -> Vec<ProcessInfo> {
        let own_pid = std::process::id();
        let own_dir =
            std::env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf));
        scan::running_processes()
            .into_iter()
            .filter(|process| process.pid != own_pid)
            .filter(|process| match (&own_dir, &process.exe) {
                (Some(dir), Some(exe)) => !exe.starts_with(dir),
                _ => true,
            })
            .filter(|process| self.matcher.matches(process))
            .collect()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.running_processes().is_empty()
    }

    /// Execute the staged stop sequence until nothing matches or the retry
    /// budget is exhausted.
    ///
    /// # Errors
    /// Returns [`ProcessError::Unkillable`] with the surviving processes
    /// when every stage and retry has been used up.
    pub fn stop(&self, options: &StopOptions) -> Result<StopOutcome, ProcessError> {
        let started = Instant::now();
        if self.running_processes().is_empty() {
            tracing::info!("no {APP_NAME} processes running");
            return Ok(StopOutcome { attempts: 0, forced: false, elapsed: started.elapsed() });
        }

        let retries = options.max_retries.max(1);
        let mut forced = false;
        for attempt in 1..=retries {
            if attempt > 1 {
                let backoff = RETRY_BACKOFF_UNIT * (attempt - 1);
                tracing::info!(
                    attempt,
                    retries,
                    "shutdown incomplete, retrying in {}s",
                    backoff.as_secs()
                );
                thread::sleep(backoff);
                // The processes may have finished exiting during the
                // backoff; skip the whole sequence when they did.
                if self.running_processes().is_empty() {
                    return Ok(StopOutcome { attempts: attempt, forced, elapsed: started.elapsed() });
                }
            }
            if self.stop_once(options, &mut forced) {
                return Ok(StopOutcome { attempts: attempt, forced, elapsed: started.elapsed() });
            }
        }

        let survivors: Vec<String> = self
            .running_processes()
            .into_iter()
            .map(|process| format!("{} ({})", process.name, process.pid))
            .collect();
        tracing::error!(?survivors, "could not stop all {APP_NAME} processes");
        Err(ProcessError::Unkillable { attempts: retries, survivors })
    }

    fn stop_once(&self, options: &StopOptions, forced: &mut bool) -> bool {
        request_graceful_quit();

        let targets = self.running_processes();
        if targets.is_empty() {
            tracing::info!("all {APP_NAME} processes exited");
            return true;
        }

        tracing::info!(count = targets.len(), "sending terminate signal");
        for process in &targets {
            terminate_process(process);
        }

        let deadline = Instant::now() + options.timeout;
        let mut survivors: Vec<&ProcessInfo> = targets.iter().collect();
        while Instant::now() < deadline {
            survivors.retain(|process| scan::pid_alive(process.pid));
            if survivors.is_empty() {
                tracing::info!("all {APP_NAME} processes exited");
                return true;
            }
            thread::sleep(POLL_INTERVAL);
        }

        survivors.retain(|process| scan::pid_alive(process.pid));
        if survivors.is_empty() {
            return true;
        }
        if !options.force_kill {
            tracing::error!(count = survivors.len(), "processes did not exit and forced kill is disabled");
            return false;
        }

        tracing::warn!(count = survivors.len(), "escalating to forced kill");
        *forced = true;
        for process in &survivors {
            kill_process(process);
        }
        thread::sleep(KILL_GRACE);
        survivors.retain(|process| scan::pid_alive(process.pid));
        if survivors.is_empty() {
            true
        } else {
            for process in &survivors {
                tracing::error!(name = %process.name, pid = process.pid, "process survived forced kill");
            }
            false
        }
    }

    /// Launch the application, preferring URI activation with one fallback
    /// to the executable path.
    ///
    /// # Errors
    /// Returns the launch failure of the executable path once both methods
    /// have failed.
    pub fn start(&self, options: &StartOptions) -> Result<(), ProcessError> {
        if options.use_uri {
            match launch_uri() {
                Ok(()) => {
                    tracing::info!("{APP_NAME} launch requested via URI activation");
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(error = %err, "URI activation failed, falling back to direct launch");
                }
            }
        }
        launch_executable()?;
        tracing::info!("{APP_NAME} launch requested");
        Ok(())
    }
}

/// Stage 1 of the stop sequence: ask the application to quit politely.
/// macOS gets a native quit event, Windows a non-forced `taskkill`; on
/// other platforms the terminate signal in stage 2 already is the polite
/// request. Failures here only narrow the sequence to the later stages.
#[cfg(target_os = "macos")]
fn request_graceful_quit() {
    let script = format!("tell application \"{APP_NAME}\" to quit");
    match Command::new("osascript").args(["-e", &script]).output() {
        Ok(output) if output.status.success() => {
            tracing::info!("graceful quit requested, waiting for the application to respond");
            thread::sleep(Duration::from_secs(2));
        }
        Ok(output) => {
            tracing::warn!(status = %output.status, "graceful quit request was rejected");
        }
        Err(err) => tracing::warn!(error = %err, "failed to send graceful quit request"),
    }
}

#[cfg(windows)]
fn request_graceful_quit() {
    match Command::new("taskkill").args(["/IM", WINDOWS_IMAGE, "/T"]).output() {
        Ok(output) if output.status.success() => {
            tracing::info!("graceful quit requested, waiting for the application to respond");
            thread::sleep(Duration::from_secs(2));
        }
        Ok(output) => {
            tracing::debug!(status = %output.status, "graceful taskkill found nothing to signal");
        }
        Err(err) => tracing::warn!(error = %err, "failed to send graceful quit request"),
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
fn request_graceful_quit() {}

#[cfg(not(any(unix, windows)))]
fn request_graceful_quit() {}

#[cfg(unix)]
fn signal_process(process: &ProcessInfo, signal: nix::sys::signal::Signal) {
    let Ok(pid) = i32::try_from(process.pid) else {
        return;
    };
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal) {
        Ok(()) => tracing::debug!(pid = process.pid, %signal, "signal sent"),
        Err(err) => {
            // Already gone or not ours to signal; either way it is no
            // longer our problem at this stage.
            tracing::debug!(pid = process.pid, %signal, error = %err, "signal not delivered");
        }
    }
}

#[cfg(unix)]
fn terminate_process(process: &ProcessInfo) {
    signal_process(process, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn kill_process(process: &ProcessInfo) {
    signal_process(process, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(windows)]
fn taskkill(process: &ProcessInfo, force: bool) {
    let pid = process.pid.to_string();
    let mut args = vec!["/PID", pid.as_str(), "/T"];
    if force {
        args.insert(0, "/F");
    }
    match Command::new("taskkill").args(&args).output() {
        Ok(output) if output.status.success() => {
            tracing::debug!(pid = process.pid, force, "taskkill sent");
        }
        Ok(output) => {
            tracing::debug!(pid = process.pid, status = %output.status, "taskkill not delivered");
        }
        Err(err) => tracing::debug!(pid = process.pid, error = %err, "taskkill failed to run"),
    }
}

#[cfg(windows)]
fn terminate_process(process: &ProcessInfo) {
    taskkill(process, false);
}

#[cfg(windows)]
fn kill_process(process: &ProcessInfo) {
    taskkill(process, true);
}

#[cfg(not(any(unix, windows)))]
fn terminate_process(_process: &ProcessInfo) {}

#[cfg(not(any(unix, windows)))]
fn kill_process(_process: &ProcessInfo) {}

fn run_checked(command: &mut Command, label: &str) -> Result<(), ProcessError> {
    let status = command
        .status()
        .map_err(|source| ProcessError::Spawn { command: label.to_string(), source })?;
    if status.success() {
        Ok(())
    } else {
        Err(ProcessError::CommandFailed { command: label.to_string(), status })
    }
}

#[cfg(target_os = "macos")]
fn launch_uri() -> Result<(), ProcessError> {
    run_checked(Command::new("open").arg(ACTIVATION_URI), "open")
}

#[cfg(all(unix, not(target_os = "macos")))]
fn launch_uri() -> Result<(), ProcessError> {
    run_checked(Command::new("xdg-open").arg(ACTIVATION_URI), "xdg-open")
}

#[cfg(windows)]
fn launch_uri() -> Result<(), ProcessError> {
    run_checked(Command::new("cmd").args(["/C", "start", "", ACTIVATION_URI]), "cmd start")
}

#[cfg(not(any(unix, windows)))]
fn launch_uri() -> Result<(), ProcessError> {
    Err(ProcessError::ExecutableNotFound)
}

#[cfg(target_os = "macos")]
fn launch_executable() -> Result<(), ProcessError> {
    run_checked(Command::new("open").args(["-a", APP_NAME]), "open -a")
}

#[cfg(all(unix, not(target_os = "macos")))]
fn launch_executable() -> Result<(), ProcessError> {
    let child = Command::new(LINUX_BINARY)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|source| ProcessError::Spawn { command: LINUX_BINARY.to_string(), source })?;
    // Detached: the application owns its own lifetime from here.
    drop(child);
    Ok(())
}

#[cfg(windows)]
fn launch_executable() -> Result<(), ProcessError> {
    let path = windows_executable_path().ok_or(ProcessError::ExecutableNotFound)?;
    let child = Command::new(&path)
        .spawn()
        .map_err(|source| ProcessError::Spawn { command: path.display().to_string(), source })?;
    drop(child);
    Ok(())
}

#[cfg(windows)]
fn windows_executable_path() -> Option<std::path::PathBuf> {
    let local = std::env::var_os("LOCALAPPDATA")?;
    let path =
        std::path::PathBuf::from(local).join("Programs").join(APP_NAME).join("Aether.exe");
    path.exists().then_some(path)
}

#[cfg(not(any(unix, windows)))]
fn launch_executable() -> Result<(), ProcessError> {
    Err(ProcessError::ExecutableNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NameMatcher(String);

    impl ProcessMatcher for NameMatcher {
        fn matches(&self, process: &ProcessInfo) -> bool {
            process.name == self.0
        }
    }

    struct AnyMatcher;

    impl ProcessMatcher for AnyMatcher {
        fn matches(&self, _process: &ProcessInfo) -> bool {
            true
        }
    }

    #[test]
    fn detection_excludes_own_process() {
        let controller = LifecycleController::with_matcher(Box::new(AnyMatcher));
        let own_pid = std::process::id();
        assert!(!controller.running_processes().iter().any(|process| process.pid == own_pid));
    }

    #[test]
    fn stop_is_a_no_op_when_nothing_matches() {
        let controller =
            LifecycleController::with_matcher(Box::new(NameMatcher("aeswtest-none".to_string())));
        let outcome = match controller.stop(&StopOptions::default()) {
            Ok(outcome) => outcome,
            Err(err) => panic!("stop failed: {err}"),
        };
        assert_eq!(outcome.attempts, 0);
        assert!(!outcome.forced);
    }

    #[cfg(unix)]
    mod staged_stop {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;
        use std::process::Stdio;
        use std::time::{Duration, Instant};

        use super::{LifecycleController, NameMatcher, StopOptions};

        fn spawn_script(dir: &Path, name: &str, body: &str) -> u32 {
            let path = dir.join(name);
            if let Err(err) = fs::write(&path, body) {
                panic!("failed to write script: {err}");
            }
            if let Err(err) = fs::set_permissions(&path, fs::Permissions::from_mode(0o755)) {
                panic!("failed to chmod script: {err}");
            }
            let child = match std::process::Command::new(&path)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
            {
                Ok(child) => child,
                Err(err) => panic!("failed to spawn script: {err}"),
            };
            let pid = child.id();
            // Reap in the background so the process does not linger as a
            // zombie once signalled.
            std::thread::spawn(move || {
                let mut child = child;
                let _ = child.wait();
            });
            pid
        }

        fn controller_for(name: &str) -> LifecycleController {
            LifecycleController::with_matcher(Box::new(NameMatcher(name.to_string())))
        }

        #[test]
        fn slow_exit_within_timeout_needs_no_force() {
            let dir = match tempfile::tempdir() {
                Ok(dir) => dir,
                Err(err) => panic!("failed to create temp dir: {err}"),
            };
            // Ignores the terminate signal, exits on its own after ~3s.
            let name = "aeswtest-slow";
            let started = Instant::now();
            spawn_script(dir.path(), name, "#!/bin/sh\ntrap '' TERM\nsleep 3\nexit 0\n");
            std::thread::sleep(Duration::from_millis(150));

            let controller = controller_for(name);
            assert!(controller.is_running());
            let options = StopOptions {
                timeout: Duration::from_secs(5),
                force_kill: false,
                max_retries: 1,
            };
            let outcome = match controller.stop(&options) {
                Ok(outcome) => outcome,
                Err(err) => panic!("stop failed: {err}"),
            };

            let elapsed = started.elapsed();
            assert!(!outcome.forced);
            assert!(elapsed >= Duration::from_secs(3), "exited too early: {elapsed:?}");
            assert!(elapsed < Duration::from_secs(5), "took too long: {elapsed:?}");
            assert!(!controller.is_running());
        }

        #[test]
        fn stubborn_process_is_force_killed() {
            let dir = match tempfile::tempdir() {
                Ok(dir) => dir,
                Err(err) => panic!("failed to create temp dir: {err}"),
            };
            // Ignores the terminate signal and never exits.
            let name = "aeswtest-stub";
            spawn_script(
                dir.path(),
                name,
                "#!/bin/sh\ntrap '' TERM\nwhile :; do sleep 1; done\n",
            );
            std::thread::sleep(Duration::from_millis(150));

            let controller = controller_for(name);
            assert!(controller.is_running());
            let options = StopOptions {
                timeout: Duration::from_secs(2),
                force_kill: true,
                max_retries: 1,
            };
            let outcome = match controller.stop(&options) {
                Ok(outcome) => outcome,
                Err(err) => panic!("stop failed: {err}"),
            };

            assert!(outcome.forced);
            assert_eq!(outcome.attempts, 1);
            assert!(!controller.is_running());
        }

        #[test]
        fn polite_process_exits_on_terminate() {
            let dir = match tempfile::tempdir() {
                Ok(dir) => dir,
                Err(err) => panic!("failed to create temp dir: {err}"),
            };
            // Two statements so the shell stays the process the signal
            // lands on, with default TERM handling.
            let name = "aeswtest-nice";
            spawn_script(dir.path(), name, "#!/bin/sh\nsleep 30\nexit 0\n");
            std::thread::sleep(Duration::from_millis(150));

            let controller = controller_for(name);
            let options = StopOptions {
                timeout: Duration::from_secs(5),
                force_kill: false,
                max_retries: 1,
            };
            let started = Instant::now();
            let outcome = match controller.stop(&options) {
                Ok(outcome) => outcome,
                Err(err) => panic!("stop failed: {err}"),
            };
            assert!(!outcome.forced);
            assert!(started.elapsed() < Duration::from_secs(3));
        }
    }
}
