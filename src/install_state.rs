//! Stage gate state machine
//!
//! Tracks the three gate markers of the installation scripts:
//!
//! - `ready`: the highest stage the flow has allowed to run
//! - `running`: the stage whose script is currently executing, or `None`
//! - `finished`: the highest stage that has completed (or was skipped)
//!
//! # Stage Flow
//!
//! ```text
//! None → Prepare → Install → Configure → Done
//! ```
//!
//! Stages only start in order: `finished + 1`, and only when it is ready
//! and nothing else runs. This module holds no I/O; the script runner owns a
//! `GateState` behind its lock and drives it.

use std::fmt;
use thiserror::Error;

use crate::types::Stage;

/// Errors that can occur during gate transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateTransitionError {
    /// Another stage is still running
    #[error("Cannot start {requested} while {running} is running")]
    AlreadyRunning { running: Stage, requested: Stage },

    /// The stage is not the next one after `finished`
    #[error("Cannot start {requested}: next stage is {expected}")]
    OutOfOrder { expected: Stage, requested: Stage },

    /// The stage has not been marked ready yet
    #[error("Stage {stage} is not ready (ready up to {ready})")]
    NotReady { stage: Stage, ready: Stage },

    /// The installation failed, nothing may start anymore
    #[error("Installation failed, refusing to start {requested}")]
    Failed { requested: Stage },

    /// Nothing is running, so nothing can complete
    #[error("No stage is running")]
    NothingRunning,
}

/// Gate markers of the stage scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GateState {
    ready: Stage,
    running: Stage,
    finished: Stage,
    failed: bool,
}

impl GateState {
    /// Create a gate with nothing ready, running or finished.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn ready(&self) -> Stage {
        self.ready
    }

    #[inline]
    pub fn running(&self) -> Stage {
        self.running
    }

    #[inline]
    pub fn finished(&self) -> Stage {
        self.finished
    }

    /// Returns true once a stage script exited with an error
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Returns true while a stage script is executing
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running != Stage::None
    }

    /// Returns true once the final stage has finished
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.finished >= Stage::Configure
    }

    /// Raise `ready` to `stage`. Returns false if it already was at least
    /// that far (readiness is monotonic).
    pub fn raise_ready(&mut self, stage: Stage) -> bool {
        if self.ready >= stage {
            return false;
        }
        self.ready = stage;
        true
    }

    /// The stage that may start now, if any.
    pub fn next_startable(&self) -> Option<Stage> {
        if self.failed || self.is_running() || self.finished >= self.ready {
            return None;
        }
        self.finished.next().filter(|stage| stage.is_runnable())
    }

    /// Validate that `stage` may start right now.
    fn check_start(&self, stage: Stage) -> Result<(), GateTransitionError> {
        if self.failed {
            return Err(GateTransitionError::Failed { requested: stage });
        }
        if self.is_running() {
            return Err(GateTransitionError::AlreadyRunning {
                running: self.running,
                requested: stage,
            });
        }
        let expected = self.finished.next().unwrap_or(Stage::Done);
        if stage != expected {
            return Err(GateTransitionError::OutOfOrder {
                expected,
                requested: stage,
            });
        }
        if stage > self.ready {
            return Err(GateTransitionError::NotReady {
                stage,
                ready: self.ready,
            });
        }
        Ok(())
    }

    /// Mark `stage` as running.
    pub fn start(&mut self, stage: Stage) -> Result<(), GateTransitionError> {
        self.check_start(stage)?;
        self.running = stage;
        Ok(())
    }

    /// Mark `stage` as finished without it ever running (no script, or the
    /// script could not be started).
    pub fn skip(&mut self, stage: Stage) -> Result<(), GateTransitionError> {
        self.check_start(stage)?;
        self.finished = stage;
        Ok(())
    }

    /// The running stage exited: `finished = running`, `running = None`.
    /// A failed exit blocks all further stages.
    pub fn complete_running(&mut self, success: bool) -> Result<Stage, GateTransitionError> {
        if !self.is_running() {
            return Err(GateTransitionError::NothingRunning);
        }
        self.finished = self.running;
        self.running = Stage::None;
        if !success {
            self.failed = true;
        }
        Ok(self.finished)
    }
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ready={} running={} finished={}{}",
            self.ready,
            self.running,
            self.finished,
            if self.failed { " (failed)" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_starts_empty() {
        let gate = GateState::new();
        assert_eq!(gate.ready(), Stage::None);
        assert_eq!(gate.running(), Stage::None);
        assert_eq!(gate.finished(), Stage::None);
        assert_eq!(gate.next_startable(), None);
    }

    #[test]
    fn test_ready_is_monotonic() {
        let mut gate = GateState::new();
        assert!(gate.raise_ready(Stage::Install));
        assert!(!gate.raise_ready(Stage::Prepare));
        assert!(!gate.raise_ready(Stage::Install));
        assert_eq!(gate.ready(), Stage::Install);
    }

    #[test]
    fn test_stages_start_in_order() {
        let mut gate = GateState::new();
        gate.raise_ready(Stage::Configure);
        assert_eq!(gate.next_startable(), Some(Stage::Prepare));
        assert_eq!(
            gate.start(Stage::Install),
            Err(GateTransitionError::OutOfOrder {
                expected: Stage::Prepare,
                requested: Stage::Install
            })
        );
        gate.start(Stage::Prepare).unwrap();
        assert_eq!(gate.next_startable(), None);
    }

    #[test]
    fn test_cannot_start_while_running() {
        let mut gate = GateState::new();
        gate.raise_ready(Stage::Install);
        gate.start(Stage::Prepare).unwrap();
        assert!(matches!(
            gate.start(Stage::Install),
            Err(GateTransitionError::AlreadyRunning { .. })
        ));
    }

    #[test]
    fn test_cannot_start_unready_stage() {
        let mut gate = GateState::new();
        gate.raise_ready(Stage::Prepare);
        gate.skip(Stage::Prepare).unwrap();
        assert_eq!(gate.next_startable(), None);
        assert_eq!(
            gate.start(Stage::Install),
            Err(GateTransitionError::NotReady {
                stage: Stage::Install,
                ready: Stage::Prepare
            })
        );
    }

    #[test]
    fn test_complete_running_advances_finished() {
        let mut gate = GateState::new();
        gate.raise_ready(Stage::Install);
        gate.start(Stage::Prepare).unwrap();
        assert_eq!(gate.complete_running(true), Ok(Stage::Prepare));
        assert_eq!(gate.finished(), Stage::Prepare);
        assert!(!gate.is_running());
        assert_eq!(gate.next_startable(), Some(Stage::Install));
    }

    #[test]
    fn test_failure_blocks_everything() {
        let mut gate = GateState::new();
        gate.raise_ready(Stage::Configure);
        gate.start(Stage::Prepare).unwrap();
        gate.complete_running(false).unwrap();
        assert!(gate.is_failed());
        assert_eq!(gate.next_startable(), None);
        assert!(matches!(
            gate.start(Stage::Install),
            Err(GateTransitionError::Failed { .. })
        ));
    }

    #[test]
    fn test_complete_without_running() {
        let mut gate = GateState::new();
        assert_eq!(
            gate.complete_running(true),
            Err(GateTransitionError::NothingRunning)
        );
    }

    #[test]
    fn test_complete_after_configure() {
        let mut gate = GateState::new();
        gate.raise_ready(Stage::Configure);
        gate.skip(Stage::Prepare).unwrap();
        gate.skip(Stage::Install).unwrap();
        gate.start(Stage::Configure).unwrap();
        gate.complete_running(true).unwrap();
        assert!(gate.is_complete());
        assert_eq!(gate.next_startable(), None);
    }

    #[test]
    fn test_display() {
        let mut gate = GateState::new();
        gate.raise_ready(Stage::Prepare);
        assert_eq!(gate.to_string(), "ready=prepare running=none finished=none");
    }
}
