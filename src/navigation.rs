//! Navigation controller
//!
//! Owns the stack of visited steps and applies the sequencer's decisions:
//! `no_return` clears every built page so nothing is left to go back to,
//! `retranslate` rebuilds every page but the language page.
//!
//! The controller is owned by a single thread (the front end or the headless
//! driver). Display requests published through the store from other threads
//! are queued on a channel and applied by [`Navigator::pump`].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::{ConfigStore, Key, Subscription, Value};
use crate::error::{OsiError, Result};
use crate::sequencer::PageSequencer;
use crate::types::{PageRequest, Step, TransitionSignal};

/// Builds and tears down the page of a step.
pub trait PageFactory {
    fn create(&mut self, step: Step);

    fn discard(&mut self, step: Step);

    /// Rebuild the contents of an existing page.
    fn reload(&mut self, step: Step) {
        let _ = step;
    }
}

/// Page factory that only logs, for front ends without page state.
#[derive(Debug, Default)]
pub struct LoggingPageFactory;

impl PageFactory for LoggingPageFactory {
    fn create(&mut self, step: Step) {
        debug!("Building page {}", step);
    }

    fn discard(&mut self, step: Step) {
        debug!("Discarding page {}", step);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    step: Step,
    /// Non-permanent pages (e.g. `failed`) are dropped when left
    permanent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Stack based navigation over the active steps.
pub struct Navigator<F: PageFactory> {
    config: ConfigStore,
    sequencer: Arc<PageSequencer>,
    factory: F,
    stack: Vec<Entry>,
    /// Permanent pages that exist, on the stack or not
    built: HashSet<Step>,
    requests: Receiver<PageRequest>,
    _subscription: Subscription,
}

impl<F: PageFactory> Navigator<F> {
    /// Create the navigator standing on the first active step.
    pub fn new(config: ConfigStore, sequencer: Arc<PageSequencer>, factory: F) -> Result<Self> {
        let first = sequencer
            .active()
            .first()
            .ok_or_else(|| OsiError::navigation("no active steps"))?;

        let (tx, requests) = mpsc::channel();
        let (subscription, pending) = config.subscribe_taking(Key::DisplayedPage, move |value| {
            if let Value::Page(request) = value {
                // Receiver gone means the navigator was dropped
                let _ = tx.send(*request);
            }
        });

        let mut navigator = Self {
            config,
            sequencer,
            factory,
            stack: Vec::new(),
            built: HashSet::new(),
            requests,
            _subscription: subscription,
        };
        navigator.factory.create(first);
        navigator.built.insert(first);
        navigator.stack.push(Entry {
            step: first,
            permanent: true,
        });
        navigator.sequencer.transition(None, first);

        // Stages may already have run, e.g. prepare without an internet step
        if let Some(Value::Page(request)) = pending {
            info!("Applying display request published before start: {:?}", request);
            navigator.apply(request);
        }
        Ok(navigator)
    }

    /// The step currently shown.
    pub fn current(&self) -> Option<Step> {
        self.stack.last().map(|entry| entry.step)
    }

    /// Steps on the stack, bottom first.
    pub fn stack(&self) -> Vec<Step> {
        self.stack.iter().map(|entry| entry.step).collect()
    }

    pub fn is_built(&self, step: Step) -> bool {
        self.built.contains(&step)
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn factory_mut(&mut self) -> &mut F {
        &mut self.factory
    }

    pub fn sequencer(&self) -> &PageSequencer {
        &self.sequencer
    }

    fn current_entry(&self) -> Option<Entry> {
        self.stack.last().copied()
    }

    /// Nothing below the current page.
    pub fn is_first(&self) -> bool {
        self.stack.len() <= 1
    }

    /// Nothing built after the current page.
    pub fn is_last(&self) -> bool {
        let Some(entry) = self.current_entry() else {
            return true;
        };
        if !entry.permanent {
            return true;
        }
        match self.sequencer.active().after(entry.step) {
            Some(next) => !self.built.contains(&next),
            None => true,
        }
    }

    pub fn can_go_back(&self) -> bool {
        !self.is_first()
    }

    pub fn can_go_forward(&self) -> bool {
        !self.is_last()
    }

    /// Quitting is only safe while no script is changing the system.
    pub fn can_quit(&self) -> bool {
        !self.config.get_bool(Key::InstallationRunning)
    }

    /// Move past `from` to the next active step.
    ///
    /// Requests from a page that is no longer shown are ignored. `None`
    /// advances from whatever is current.
    pub fn advance(&mut self, from: Option<Step>) -> TransitionSignal {
        let Some(current) = self.current_entry() else {
            warn!("Advance requested with empty navigation stack");
            return TransitionSignal::None;
        };
        if let Some(from) = from {
            if from != current.step {
                debug!("Ignoring stale advance from {} (showing {})", from, current.step);
                return TransitionSignal::None;
            }
        }

        if !current.permanent {
            self.stack.pop();
            self.factory.discard(current.step);
            return TransitionSignal::None;
        }

        let Some(next) = self.sequencer.active().after(current.step) else {
            debug!("No step after {}", current.step);
            return TransitionSignal::None;
        };

        let signal = self.sequencer.transition(Some(current.step), next);
        match signal {
            TransitionSignal::NoReturn => self.remove_all_pages(None),
            TransitionSignal::Retranslate => self.remove_all_pages(Some(Step::Language)),
            TransitionSignal::None => {}
        }
        self.load_page(next, Direction::Forward, true);
        signal
    }

    /// Show a step outside of the sequence, e.g. `failed`.
    pub fn show(&mut self, step: Step) {
        if self.built.contains(&step) {
            warn!("Direct display of already built page {}", step);
        }
        info!("Showing {}", step);
        self.load_page(step, Direction::Forward, false);
    }

    /// Go back one step. Returns whether anything changed.
    pub fn navigate_backward(&mut self) -> bool {
        let Some(current) = self.current_entry() else {
            return false;
        };
        if !current.permanent {
            self.stack.pop();
            self.factory.discard(current.step);
            return true;
        }
        if self.is_first() {
            return false;
        }
        match self.sequencer.active().before(current.step) {
            Some(previous) => {
                self.load_page(previous, Direction::Backward, true);
                true
            }
            None => false,
        }
    }

    /// Go forward to an already built step. Returns whether anything changed.
    pub fn navigate_forward(&mut self) -> bool {
        if self.is_last() {
            return false;
        }
        let next = self
            .current()
            .and_then(|step| self.sequencer.active().after(step));
        match next {
            Some(next) => {
                self.load_page(next, Direction::Forward, true);
                true
            }
            None => false,
        }
    }

    /// Rebuild the contents of the current page.
    pub fn reload(&mut self) {
        if let Some(step) = self.current() {
            self.factory.reload(step);
        }
    }

    /// Apply one display request.
    pub fn apply(&mut self, request: PageRequest) {
        self.config.steal(Key::DisplayedPage);
        match request {
            PageRequest::Next { from } => {
                self.advance(from);
            }
            PageRequest::Show(step) => self.show(step),
        }
    }

    /// Apply all queued display requests. Returns how many were applied.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(request) = self.requests.try_recv() {
            self.apply(request);
            applied += 1;
        }
        applied
    }

    /// Wait up to `timeout` for a display request and apply it together with
    /// any queued after it.
    pub fn pump_timeout(&mut self, timeout: Duration) -> usize {
        match self.requests.recv_timeout(timeout) {
            Ok(request) => {
                self.apply(request);
                1 + self.pump()
            }
            Err(RecvTimeoutError::Timeout) => 0,
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Display request channel closed");
                0
            }
        }
    }

    /// Discard every page except `keep`, which becomes the only stack entry.
    fn remove_all_pages(&mut self, keep: Option<Step>) {
        let mut discarded: Vec<Step> = self
            .built
            .iter()
            .copied()
            .filter(|&step| Some(step) != keep)
            .collect();
        discarded.extend(
            self.stack
                .iter()
                .filter(|entry| !entry.permanent)
                .map(|entry| entry.step),
        );
        discarded.sort();
        discarded.dedup();

        for step in discarded {
            self.built.remove(&step);
            self.factory.discard(step);
        }

        self.stack.clear();
        if let Some(step) = keep.filter(|step| self.built.contains(step)) {
            self.stack.push(Entry {
                step,
                permanent: true,
            });
        }
    }

    fn load_page(&mut self, step: Step, direction: Direction, permanent: bool) {
        if !permanent || !self.built.contains(&step) {
            self.factory.create(step);
            if permanent {
                self.built.insert(step);
            }
            if self.current() != Some(step) || !permanent {
                self.stack.push(Entry { step, permanent });
            }
            return;
        }

        match direction {
            Direction::Forward => self.stack.push(Entry {
                step,
                permanent: true,
            }),
            Direction::Backward => {
                match self.stack.iter().rposition(|entry| entry.step == step) {
                    Some(position) => self.stack.truncate(position + 1),
                    None => self.stack.push(Entry {
                        step,
                        permanent: true,
                    }),
                }
            }
        }
    }
}
