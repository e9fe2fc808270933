//! Stage Script Execution
//!
//! The [`StageRunner`] owns the stage gate and is the only component that
//! starts stage scripts. Readiness is raised from anywhere in the flow through
//! [`StageGate::mark_ready`]; the runner starts `finished + 1` once it is ready
//! and nothing else runs, and chains the following stage from the exit
//! callback of the previous one.
//!
//! # Locking
//!
//! All gate mutation happens under one mutex. Store updates (stage mirrors,
//! `installation_running`, notifications, display requests) are collected as
//! [`Effect`]s while the lock is held and published after it is released, so
//! store subscribers may call back into the runner.
//!
//! # Process layer
//!
//! Spawning goes through the [`ScriptSpawner`] trait. [`ProcessSpawner`] runs
//! `sh <script>` in its own process group, registers the PID with the
//! [`ChildRegistry`], streams combined output into an [`OutputSink`] and
//! reports the exit code from a waiter thread.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};

use crate::config::{lock_or_recover, ConfigStore, Key, Value};
use crate::error::OsiError;
use crate::install_state::GateState;
use crate::output::{LogSink, OutputSink};
use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use crate::script_traits::ScriptArgs;
use crate::stage_env::StageScript;
use crate::types::{PageRequest, Stage, Step};

/// Default location of the stage scripts.
pub const DEFAULT_SCRIPTS_DIR: &str = "/etc/os-installer/scripts";

/// Notification text sent when the installation ends, successfully or not.
pub const FINISHED_NOTIFICATION: &str = "Finished Installation";

/// Receiver of stage readiness signals.
pub trait StageGate: Send + Sync {
    /// Allow `stage` (and every stage before it) to run.
    fn mark_ready(&self, stage: Stage);
}

/// Called exactly once with the exit code of a spawned script.
pub type ExitCallback = Box<dyn FnOnce(i32) + Send + 'static>;

/// Starts stage scripts.
///
/// Implementations must deliver `on_exit` asynchronously: never from within
/// `spawn` itself, since the runner holds its gate lock while spawning.
pub trait ScriptSpawner: Send + Sync {
    fn spawn(&self, script: &Path, args: &dyn ScriptArgs, on_exit: ExitCallback) -> Result<()>;
}

/// Spawns stage scripts as real child processes.
pub struct ProcessSpawner {
    sink: Arc<dyn OutputSink>,
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessSpawner {
    /// Spawner streaming into `sink`, tracked by the global registry.
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            sink,
            registry: ChildRegistry::global(),
        }
    }

    /// Track children in a specific registry instead of the global one.
    pub fn with_registry(mut self, registry: Arc<Mutex<ChildRegistry>>) -> Self {
        self.registry = registry;
        self
    }
}

impl Default for ProcessSpawner {
    fn default() -> Self {
        Self::new(Arc::new(LogSink))
    }
}

/// Copy everything from `reader` into `sink`, one line at a time.
fn forward_output<R>(reader: R, sink: Arc<dyn OutputSink>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => sink.write(&line),
                Err(e) => {
                    warn!("Reading script output failed: {}", e);
                    break;
                }
            }
        }
    })
}

impl ScriptSpawner for ProcessSpawner {
    fn spawn(&self, script: &Path, args: &dyn ScriptArgs, on_exit: ExitCallback) -> Result<()> {
        let cli_args = args.to_cli_args();
        let env_vars = args.get_env_vars();
        debug!(
            "spawn: sh {} args={:?} env={:?}",
            script.display(),
            cli_args,
            env_vars.iter().map(|(key, _)| key).collect::<Vec<_>>()
        );

        let mut cmd = Command::new("sh");
        cmd.arg(script)
            .args(&cli_args)
            .envs(env_vars)
            .current_dir("/")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn script: {}", script.display()))?;
        let pid = child.id();

        if !lock_or_recover(&self.registry, "child registry").register(pid) {
            // Teardown already started, this script must not run
            if let Err(e) = child.kill() {
                warn!("Failed to kill refused script {}: {}", pid, e);
            }
            let _ = child.wait();
            return Err(OsiError::ShuttingDown(script.display().to_string()).into());
        }

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_output(stdout, Arc::clone(&self.sink)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_output(stderr, Arc::clone(&self.sink)));
        }

        let registry = Arc::clone(&self.registry);
        let script_name = args.script_name();
        std::thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    error!("Failed waiting for {}: {}", script_name, e);
                    -1
                }
            };
            for reader in readers {
                if reader.join().is_err() {
                    warn!("Output reader of {} panicked", script_name);
                }
            }
            lock_or_recover(&registry, "child registry").unregister(pid);
            on_exit(code);
        });

        Ok(())
    }
}

/// A store update produced under the gate lock.
#[derive(Debug, Clone, PartialEq)]
enum Effect {
    Mirror(GateState),
    InstallationRunning(bool),
    Notify(&'static str),
    Page(PageRequest),
}

struct RunnerInner {
    gate: Mutex<GateState>,
    config: ConfigStore,
    scripts_dir: PathBuf,
    spawner: Arc<dyn ScriptSpawner>,
}

/// Runs the prepare, install and configure scripts in order.
#[derive(Clone)]
pub struct StageRunner {
    inner: Arc<RunnerInner>,
}

impl StageRunner {
    pub fn new(
        config: ConfigStore,
        scripts_dir: impl Into<PathBuf>,
        spawner: Arc<dyn ScriptSpawner>,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                gate: Mutex::new(GateState::new()),
                config,
                scripts_dir: scripts_dir.into(),
                spawner,
            }),
        }
    }

    /// Snapshot of the gate markers.
    pub fn state(&self) -> GateState {
        *lock_or_recover(&self.inner.gate, "stage gate")
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.inner.scripts_dir
    }

    /// Path of the script backing `stage`, if the stage has one.
    pub fn script_path(&self, stage: Stage) -> Option<PathBuf> {
        stage
            .script_name()
            .map(|name| self.inner.scripts_dir.join(name))
    }

    /// Start whatever the gate allows. Usually implied by `mark_ready` and
    /// process exits, exposed for callers that changed the scripts directory
    /// contents.
    pub fn attempt_start_next(&self) {
        let effects = {
            let mut gate = lock_or_recover(&self.inner.gate, "stage gate");
            let mut effects = Vec::new();
            self.start_next_locked(&mut gate, &mut effects);
            effects
        };
        self.publish(effects);
    }

    /// Handle the exit of the running stage script.
    pub fn on_process_exit(&self, exit_code: i32) {
        let effects = {
            let mut gate = lock_or_recover(&self.inner.gate, "stage gate");
            let mut effects = Vec::new();
            let tolerate_failure = self.inner.config.get_bool(Key::DemoMode);
            let success = exit_code == 0 || tolerate_failure;
            let finished = match gate.complete_running(success) {
                Ok(stage) => stage,
                Err(e) => {
                    error!("Unexpected script exit (code {}): {}", exit_code, e);
                    return;
                }
            };

            if !success {
                error!("Failure during stage \"{}\" (exit code {})", finished, exit_code);
                effects.push(Effect::Mirror(*gate));
                Self::fail(&mut effects);
            } else {
                if exit_code != 0 {
                    warn!(
                        "Stage \"{}\" exited with {}, ignored in demo mode",
                        finished, exit_code
                    );
                }
                info!("Finished stage \"{}\"", finished);
                if gate.is_complete() {
                    effects.push(Effect::Mirror(*gate));
                    Self::complete(&mut effects);
                } else {
                    self.start_next_locked(&mut gate, &mut effects);
                }
            }
            effects
        };
        self.publish(effects);
    }

    /// Start the next stage if allowed. Stages without a script, or whose
    /// script cannot be spawned, are skipped. Once teardown has begun the
    /// chain stops where it is.
    fn start_next_locked(&self, gate: &mut GateState, effects: &mut Vec<Effect>) {
        while let Some(next) = gate.next_startable() {
            info!("Starting stage \"{}\"", next);

            let script = StageScript::from_config(&self.inner.config, next);
            let Some(path) = self.script_path(next) else {
                break;
            };

            let outcome = if path.exists() {
                let runner = self.clone();
                self.inner
                    .spawner
                    .spawn(&path, &script, Box::new(move |code| runner.on_process_exit(code)))
                    .map(|()| true)
            } else {
                info!("No script for stage \"{}\" exists, skipping", next);
                Ok(false)
            };

            let transition = match outcome {
                Ok(true) => gate.start(next),
                Ok(false) => gate.skip(next),
                Err(e) if matches!(e.downcast_ref::<OsiError>(), Some(OsiError::ShuttingDown(_))) => {
                    info!("Not starting stage \"{}\": {}", next, e);
                    break;
                }
                Err(e) => {
                    warn!("Could not start {} script, ignoring: {:#}", next, e);
                    gate.skip(next)
                }
            };
            if next != Stage::Prepare {
                effects.push(Effect::InstallationRunning(true));
            }
            if let Err(e) = transition {
                error!("Stage gate rejected {}: {}", next, e);
                break;
            }
            if gate.is_running() {
                break;
            }
            if gate.is_complete() {
                effects.push(Effect::Mirror(*gate));
                Self::complete(effects);
                return;
            }
        }
        effects.push(Effect::Mirror(*gate));
    }

    fn fail(effects: &mut Vec<Effect>) {
        effects.push(Effect::InstallationRunning(false));
        effects.push(Effect::Page(PageRequest::Show(Step::Failed)));
        effects.push(Effect::Notify(FINISHED_NOTIFICATION));
    }

    fn complete(effects: &mut Vec<Effect>) {
        info!("Installation complete");
        effects.push(Effect::InstallationRunning(false));
        effects.push(Effect::Notify(FINISHED_NOTIFICATION));
        effects.push(Effect::Page(PageRequest::Next { from: None }));
    }

    fn publish(&self, effects: Vec<Effect>) {
        let config = &self.inner.config;
        for effect in effects {
            match effect {
                Effect::Mirror(gate) => {
                    config.set(Key::ReadyStage, Value::Stage(gate.ready()));
                    config.set(Key::RunningStage, Value::Stage(gate.running()));
                    config.set(Key::FinishedStage, Value::Stage(gate.finished()));
                }
                Effect::InstallationRunning(running) => {
                    config.set(Key::InstallationRunning, Value::Bool(running));
                }
                Effect::Notify(text) => {
                    config.set(Key::SendNotification, Value::text(text));
                }
                Effect::Page(request) => config.request_page(request),
            }
        }
    }
}

impl StageGate for StageRunner {
    fn mark_ready(&self, stage: Stage) {
        let effects = {
            let mut gate = lock_or_recover(&self.inner.gate, "stage gate");
            if !gate.raise_ready(stage) {
                debug!("Stage {} already ready ({})", stage, *gate);
                return;
            }
            debug!("Stage {} ready", stage);
            let mut effects = Vec::new();
            self.start_next_locked(&mut gate, &mut effects);
            effects
        };
        self.publish(effects);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Spawner that records calls and hands exit callbacks to the test.
    #[derive(Default)]
    struct ManualSpawner {
        spawned: Mutex<Vec<(String, Vec<(String, String)>)>>,
        pending: Mutex<Vec<ExitCallback>>,
    }

    impl ManualSpawner {
        fn finish(&self, code: i32) {
            let callback = self.pending.lock().unwrap().pop().expect("nothing running");
            callback(code);
        }

        fn spawned_names(&self) -> Vec<String> {
            self.spawned.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
        }
    }

    impl ScriptSpawner for ManualSpawner {
        fn spawn(&self, _: &Path, args: &dyn ScriptArgs, on_exit: ExitCallback) -> Result<()> {
            self.spawned
                .lock()
                .unwrap()
                .push((args.script_name().to_string(), args.get_env_vars()));
            self.pending.lock().unwrap().push(on_exit);
            Ok(())
        }
    }

    struct FailingSpawner;

    impl ScriptSpawner for FailingSpawner {
        fn spawn(&self, _: &Path, _: &dyn ScriptArgs, _: ExitCallback) -> Result<()> {
            anyhow::bail!("no shell")
        }
    }

    /// Spawner whose process registry is already torn down.
    struct ShutdownSpawner;

    impl ScriptSpawner for ShutdownSpawner {
        fn spawn(&self, script: &Path, _: &dyn ScriptArgs, _: ExitCallback) -> Result<()> {
            Err(OsiError::ShuttingDown(script.display().to_string()).into())
        }
    }

    fn scripts(names: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for name in names {
            fs::write(dir.path().join(name), "exit 0\n").unwrap();
        }
        dir
    }

    #[test]
    fn test_missing_scripts_are_skipped() {
        let dir = scripts(&[]);
        let spawner = Arc::new(ManualSpawner::default());
        let runner = StageRunner::new(ConfigStore::default(), dir.path(), spawner.clone());

        runner.mark_ready(Stage::Install);
        let state = runner.state();
        assert_eq!(state.finished(), Stage::Install);
        assert_eq!(state.running(), Stage::None);
        assert!(spawner.spawned_names().is_empty());
    }

    #[test]
    fn test_install_waits_for_prepare() {
        let dir = scripts(&["prepare.sh", "install.sh"]);
        let spawner = Arc::new(ManualSpawner::default());
        let config = ConfigStore::default();
        let runner = StageRunner::new(config.clone(), dir.path(), spawner.clone());

        runner.mark_ready(Stage::Prepare);
        runner.mark_ready(Stage::Install);
        assert_eq!(runner.state().running(), Stage::Prepare);
        assert_eq!(spawner.spawned_names(), vec!["prepare.sh"]);
        assert!(!config.get_bool(Key::InstallationRunning));

        spawner.finish(0);
        assert_eq!(runner.state().finished(), Stage::Prepare);
        assert_eq!(runner.state().running(), Stage::Install);
        assert_eq!(spawner.spawned_names(), vec!["prepare.sh", "install.sh"]);
        assert!(config.get_bool(Key::InstallationRunning));
        assert_eq!(config.get(Key::RunningStage), Some(Value::Stage(Stage::Install)));
    }

    #[test]
    fn test_failure_requests_failed_page() {
        let dir = scripts(&["prepare.sh", "install.sh", "configure.sh"]);
        let spawner = Arc::new(ManualSpawner::default());
        let config = ConfigStore::default();
        let runner = StageRunner::new(config.clone(), dir.path(), spawner.clone());

        runner.mark_ready(Stage::Configure);
        spawner.finish(1);

        assert!(runner.state().is_failed());
        assert_eq!(runner.state().running(), Stage::None);
        assert_eq!(spawner.spawned_names(), vec!["prepare.sh"]);
        assert_eq!(
            config.get(Key::DisplayedPage),
            Some(Value::Page(PageRequest::Show(Step::Failed)))
        );
        assert!(!config.get_bool(Key::InstallationRunning));
    }

    #[test]
    fn test_spawn_failure_skips_stage() {
        let dir = scripts(&["prepare.sh"]);
        let runner = StageRunner::new(ConfigStore::default(), dir.path(), Arc::new(FailingSpawner));
        runner.mark_ready(Stage::Prepare);
        assert_eq!(runner.state().finished(), Stage::Prepare);
        assert!(!runner.state().is_failed());
    }

    #[test]
    fn test_shutdown_stops_the_chain() {
        let dir = scripts(&["prepare.sh", "install.sh", "configure.sh"]);
        let config = ConfigStore::default();
        let runner = StageRunner::new(config.clone(), dir.path(), Arc::new(ShutdownSpawner));
        runner.mark_ready(Stage::Configure);

        let state = runner.state();
        assert_eq!(state.finished(), Stage::None);
        assert_eq!(state.running(), Stage::None);
        assert!(!state.is_complete());
        assert!(!config.has(Key::DisplayedPage));
        assert!(!config.has(Key::SendNotification));
        assert!(!config.get_bool(Key::InstallationRunning));
    }

    #[test]
    fn test_shutdown_spawner_refuses_scripts() {
        let dir = scripts(&["install.sh"]);
        let registry = Arc::new(Mutex::new(ChildRegistry::default()));
        registry.lock().unwrap().terminate_all(Duration::ZERO);
        let spawner = ProcessSpawner::default().with_registry(registry);

        let err = spawner
            .spawn(
                &dir.path().join("install.sh"),
                &StageScript::from_config(&ConfigStore::default(), Stage::Install),
                Box::new(|_| {}),
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OsiError>(),
            Some(OsiError::ShuttingDown(_))
        ));
    }

    #[test]
    fn test_configure_skip_completes_installation() {
        let dir = scripts(&[]);
        let config = ConfigStore::default();
        let runner = StageRunner::new(config.clone(), dir.path(), Arc::new(ManualSpawner::default()));
        runner.mark_ready(Stage::Configure);

        assert!(runner.state().is_complete());
        assert_eq!(
            config.get(Key::DisplayedPage),
            Some(Value::Page(PageRequest::Next { from: None }))
        );
        assert_eq!(config.get_text(Key::SendNotification), FINISHED_NOTIFICATION);
    }

    #[test]
    fn test_process_spawner_streams_output_and_reports_exit() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("install.sh");
        fs::write(&script, "echo \"device=$OSI_DEVICE_PATH\"\npwd\nexit 3\n").unwrap();

        let sink = Arc::new(crate::output::TerminalSink::new(10, 60));
        let registry = Arc::new(Mutex::new(ChildRegistry::default()));
        let spawner = ProcessSpawner::new(sink.clone()).with_registry(registry.clone());
        let args = StageScript {
            stage: Stage::Install,
            env: vec![("OSI_DEVICE_PATH".to_string(), "/dev/vda".to_string())],
        };

        let (tx, rx) = mpsc::channel();
        spawner
            .spawn(&script, &args, Box::new(move |code| tx.send(code).unwrap()))
            .unwrap();
        let code = rx.recv_timeout(Duration::from_secs(10)).unwrap();

        assert_eq!(code, 3);
        assert!(sink.contents().contains("device=/dev/vda"));
        assert!(sink.contents().lines().any(|line| line == "/"));
        assert_eq!(registry.lock().unwrap().count(), 0);
    }
}
