//! Page sequencing
//!
//! Decides what happens when the flow moves forward to a step: which stages
//! become ready to run and whether the user may still go back. Only forward
//! progress past the furthest step reached so far has side effects; revisiting
//! earlier steps replays nothing.

use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{debug, error, info};

use crate::config::lock_or_recover;
use crate::config_file::InstallerConfig;
use crate::script_runner::StageGate;
use crate::types::{Stage, Step, TransitionSignal, CANONICAL_ORDER};

/// The steps shown in this installation, in canonical order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSteps {
    steps: Vec<Step>,
}

impl ActiveSteps {
    /// Filter the canonical order by the inclusion rules of `settings`.
    ///
    /// `scripts_dir` decides whether `confirm` is shown: without an install
    /// script there is nothing to confirm.
    pub fn from_config(settings: &InstallerConfig, scripts_dir: &Path) -> Self {
        let has_install_script = Stage::Install
            .script_name()
            .is_some_and(|name| scripts_dir.join(name).exists());

        Self::from_predicate(|step| match step {
            Step::Language => settings.fixed_language.code().is_none(),
            Step::Welcome => settings.welcome_page.usage,
            Step::Internet => settings.internet_connection_required,
            Step::Encrypt => settings.disk_encryption.offered,
            Step::Desktop => !settings.desktop.is_empty(),
            Step::Confirm => has_install_script,
            Step::User => !settings.skip_user,
            Step::Locale => !settings.skip_locale,
            Step::Software => !settings.additional_software.is_empty(),
            Step::Feature => !settings.additional_features.is_empty(),
            Step::KeyboardOverview
            | Step::Disk
            | Step::Partition
            | Step::Summary
            | Step::Install
            | Step::Done
            | Step::Restart => true,
            Step::Failed => false,
        })
    }

    /// Keep the canonical steps for which `include` returns true.
    pub fn from_predicate(include: impl Fn(Step) -> bool) -> Self {
        Self {
            steps: CANONICAL_ORDER
                .iter()
                .copied()
                .filter(|&step| include(step))
                .collect(),
        }
    }

    /// Every canonical step.
    pub fn all() -> Self {
        Self::from_predicate(|_| true)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn first(&self) -> Option<Step> {
        self.steps.first().copied()
    }

    pub fn get(&self, index: usize) -> Option<Step> {
        self.steps.get(index).copied()
    }

    pub fn index_of(&self, step: Step) -> Option<usize> {
        self.steps.iter().position(|&s| s == step)
    }

    pub fn contains(&self, step: Step) -> bool {
        self.index_of(step).is_some()
    }

    /// The active step after `step`, if any.
    pub fn after(&self, step: Step) -> Option<Step> {
        self.index_of(step).and_then(|index| self.get(index + 1))
    }

    /// The active step before `step`, if any.
    pub fn before(&self, step: Step) -> Option<Step> {
        self.index_of(step)
            .and_then(|index| index.checked_sub(1))
            .and_then(|index| self.get(index))
    }
}

/// Forward transition logic over the active steps.
pub struct PageSequencer {
    active: ActiveSteps,
    /// Index into `active` of the furthest step reached
    furthest: Mutex<usize>,
    gate: Arc<dyn StageGate>,
}

impl std::fmt::Debug for PageSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSequencer")
            .field("active", &self.active)
            .field("furthest", &self.furthest_index())
            .finish_non_exhaustive()
    }
}

impl PageSequencer {
    /// Create a sequencer standing on the first active step.
    ///
    /// Without an internet step nothing has to wait for connectivity, so the
    /// prepare stage is allowed to run right away.
    pub fn new(active: ActiveSteps, gate: Arc<dyn StageGate>) -> Self {
        if !active.contains(Step::Internet) {
            gate.mark_ready(Stage::Prepare);
        }
        Self {
            active,
            furthest: Mutex::new(0),
            gate,
        }
    }

    pub fn active(&self) -> &ActiveSteps {
        &self.active
    }

    pub fn furthest_index(&self) -> usize {
        *lock_or_recover(&self.furthest, "sequencer")
    }

    /// The furthest step reached so far.
    pub fn furthest_step(&self) -> Option<Step> {
        self.active.get(self.furthest_index())
    }

    /// Decide the consequences of moving from `previous` to `target`.
    ///
    /// Stage readiness is raised for every canonical step walked over on the
    /// way from the furthest step reached to `target`, including steps that
    /// are not shown. `target` must be an active step.
    pub fn transition(&self, previous: Option<Step>, target: Step) -> TransitionSignal {
        let Some(index) = self.active.index_of(target) else {
            debug_assert!(false, "transition to inactive step {}", target);
            error!("Transition to inactive step {} ignored", target);
            return TransitionSignal::None;
        };

        let mut signal = TransitionSignal::None;
        if previous == Some(Step::Language) {
            signal = TransitionSignal::Retranslate;
        }

        let (from, walked) = {
            let mut furthest = lock_or_recover(&self.furthest, "sequencer");
            if index <= *furthest {
                debug!("Revisiting {} ({}), nothing to do", target, signal);
                return signal;
            }
            let from = self.active.get(*furthest);
            *furthest = index;
            (from, walked_steps(from, target))
        };

        let mut ready = Vec::new();
        for step in walked {
            match step {
                Step::Disk => ready.push(Stage::Prepare),
                Step::User => {
                    if previous == Some(Step::Confirm) {
                        ready.push(Stage::Install);
                        signal = signal.escalate(TransitionSignal::NoReturn);
                    }
                }
                Step::Install => {
                    ready.push(Stage::Configure);
                    signal = signal.escalate(TransitionSignal::NoReturn);
                }
                step if step.is_terminal_display() => {
                    signal = signal.escalate(TransitionSignal::NoReturn);
                }
                _ => {}
            }
        }

        info!(
            "Reached {} (from {}), signal {}",
            target,
            from.map_or_else(|| "start".to_string(), |step| step.to_string()),
            signal
        );
        for stage in ready {
            self.gate.mark_ready(stage);
        }
        signal
    }

    /// Reset the furthest step to the language step. Returns false if there
    /// is no language step.
    pub fn rewind_to_language(&self) -> bool {
        let Some(index) = self.active.index_of(Step::Language) else {
            return false;
        };
        let mut furthest = lock_or_recover(&self.furthest, "sequencer");
        info!("Rewinding furthest step to language");
        *furthest = index;
        true
    }
}

/// Canonical steps strictly after `from` up to and including `target`.
fn walked_steps(from: Option<Step>, target: Step) -> Vec<Step> {
    let start = from
        .and_then(Step::canonical_index)
        .map_or(0, |index| index + 1);
    let end = target.canonical_index().map_or(start, |index| index + 1);
    CANONICAL_ORDER
        .get(start..end)
        .map(<[Step]>::to_vec)
        .unwrap_or_default()
}
