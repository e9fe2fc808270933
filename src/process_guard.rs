//! Process lifecycle management for stage scripts
//!
//! Stage scripts partition disks and copy systems; they must not outlive the
//! installer. Flow logic never cancels a running stage, but on application
//! exit (drop of the [`ProcessGuard`], SIGINT, SIGTERM, SIGHUP) every
//! registered script is torn down:
//!
//! - Scripts are spawned in their own process group
//! - Their PIDs are tracked in a registry
//! - Teardown sends SIGTERM to each group, then SIGKILL after a grace period

use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::config::lock_or_recover;

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();

/// Registry of running stage script processes
#[derive(Debug, Default)]
pub struct ChildRegistry {
    pids: HashSet<u32>,
    /// Set once teardown started, later registrations are refused
    torn_down: bool,
}

impl ChildRegistry {
    /// Get or create the process-wide registry
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    /// Track a freshly spawned script. Returns false after teardown began,
    /// in which case the caller must not let the process run.
    pub fn register(&mut self, pid: u32) -> bool {
        if self.torn_down {
            log::warn!("Refusing to track PID {} after teardown", pid);
            return false;
        }
        self.pids.insert(pid);
        log::debug!("Tracking stage script PID {}", pid);
        true
    }

    /// Stop tracking a script that exited on its own
    pub fn unregister(&mut self, pid: u32) {
        if self.pids.remove(&pid) {
            log::debug!("Stage script PID {} exited", pid);
        }
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.pids.contains(&pid)
    }

    pub fn count(&self) -> usize {
        self.pids.len()
    }

    /// Terminate every tracked process group.
    ///
    /// Sends SIGTERM, waits up to `grace_period` for the groups to exit and
    /// sends SIGKILL to whatever is left. Only the first call does anything.
    pub fn terminate_all(&mut self, grace_period: Duration) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let pids: Vec<u32> = self.pids.drain().collect();
        if pids.is_empty() {
            return;
        }
        log::info!("Terminating {} stage script(s)", pids.len());

        for &pid in &pids {
            signal_group_or_process(pid, Signal::SIGTERM);
        }

        let start = Instant::now();
        while start.elapsed() < grace_period {
            if pids.iter().all(|&pid| !is_process_alive(pid)) {
                log::info!("All stage scripts terminated");
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for &pid in pids.iter().filter(|&&pid| is_process_alive(pid)) {
            log::warn!("Stage script {} ignored SIGTERM, sending SIGKILL", pid);
            signal_group_or_process(pid, Signal::SIGKILL);
        }
    }
}

/// Signal the process group led by `pid`, falling back to the process itself
fn signal_group_or_process(pid: u32, sig: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        log::warn!("PID {} out of range", pid);
        return;
    };
    if let Err(e) = signal::kill(Pid::from_raw(-raw), sig) {
        log::debug!("Group signal {} to {} failed: {}", sig, pid, e);
        if let Err(e) = signal::kill(Pid::from_raw(raw), sig) {
            log::warn!("Failed to send {} to PID {}: {}", sig, pid, e);
        }
    }
}

/// Check if a process is still alive (zombies count as dead)
fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if signal::kill(Pid::from_raw(raw), None).is_err() {
        return false;
    }

    // Field 3 of /proc/<pid>/stat is the state
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !matches!(stat.split_whitespace().nth(2), Some("Z" | "X")),
        Err(_) => true,
    }
}

/// RAII guard tearing down all stage scripts when dropped.
///
/// Keep one alive for the lifetime of the application.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
    grace_period: Duration,
}

impl ProcessGuard {
    /// Guard over the process-wide registry
    pub fn new() -> Self {
        Self::with_registry(ChildRegistry::global())
    }

    /// Guard over a specific registry
    pub fn with_registry(registry: Arc<Mutex<ChildRegistry>>) -> Self {
        Self {
            registry,
            grace_period: Duration::from_secs(5),
        }
    }

    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn child_count(&self) -> usize {
        lock_or_recover(&self.registry, "child registry").count()
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        log::debug!("ProcessGuard dropped, tearing down stage scripts");
        lock_or_recover(&self.registry, "child registry").terminate_all(self.grace_period);
    }
}

/// Install handlers for SIGINT, SIGTERM and SIGHUP that tear down all stage
/// scripts and exit with `128 + signal`. Call once at program start.
pub fn init_signal_handlers() -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            log::info!("Received signal {}, cleaning up", sig);
            lock_or_recover(&ChildRegistry::global(), "child registry")
                .terminate_all(Duration::from_secs(3));
            std::process::exit(128 + sig);
        }
    });

    Ok(())
}

/// Extension trait for `std::process::Command` to isolate scripts
pub trait CommandProcessGroup {
    /// Run the command as leader of a new process group that dies with us
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        self.process_group(0);
        // SAFETY: only async-signal-safe calls between fork and exec
        unsafe {
            self.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}
