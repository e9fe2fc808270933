//! Core types of the installation flow
//!
//! Steps, stages and signals are plain enums so every decision point is an
//! exhaustive `match` checked by the compiler.

use std::fmt;

use strum::{AsRefStr, Display, EnumIter, EnumString};

/// One screen of the installation flow.
///
/// The canonical order is given by [`CANONICAL_ORDER`]. `Failed` is a display
/// step only: it is never part of the sequence and is reached through a direct
/// display request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Display, EnumString, EnumIter, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Step {
    Language,
    Welcome,
    KeyboardOverview,
    Internet,
    Disk,
    Partition,
    Encrypt,
    Desktop,
    Confirm,
    User,
    Locale,
    Software,
    Feature,
    Summary,
    Install,
    Done,
    Restart,
    Failed,
}

/// The fixed order of all sequenced steps.
pub const CANONICAL_ORDER: [Step; 17] = [
    Step::Language,
    Step::Welcome,
    // required pre-install info
    Step::KeyboardOverview,
    Step::Internet,
    Step::Disk,
    Step::Partition,
    Step::Encrypt,
    Step::Desktop,
    Step::Confirm,
    // configuration
    Step::User,
    Step::Locale,
    Step::Software,
    Step::Feature,
    // fixed block towards end
    Step::Summary,
    Step::Install,
    Step::Done,
    Step::Restart,
];

impl Step {
    /// Position in [`CANONICAL_ORDER`], `None` for display-only steps.
    pub fn canonical_index(self) -> Option<usize> {
        CANONICAL_ORDER.iter().position(|&step| step == self)
    }

    /// Returns true if the step takes part in sequencing.
    pub fn is_sequenced(self) -> bool {
        !matches!(self, Self::Failed)
    }

    /// Returns true if arriving at this step forbids going back.
    pub const fn is_terminal_display(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Restart | Self::Summary)
    }
}

/// Installation stages, each backed by an optional external script.
///
/// `None` and `Done` are sentinels; only `Prepare`, `Install` and `Configure`
/// ever run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[derive(Display, EnumString, EnumIter, AsRefStr)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Stage {
    #[default]
    None = 0,
    Prepare = 1,
    Install = 2,
    Configure = 3,
    Done = 4,
}

impl Stage {
    /// Returns the numeric order of this stage
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// Returns the stage following this one, or None after `Done`
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::None => Some(Self::Prepare),
            Self::Prepare => Some(Self::Install),
            Self::Install => Some(Self::Configure),
            Self::Configure => Some(Self::Done),
            Self::Done => None,
        }
    }

    /// File name of the script backing this stage.
    pub const fn script_name(self) -> Option<&'static str> {
        match self {
            Self::Prepare => Some("prepare.sh"),
            Self::Install => Some("install.sh"),
            Self::Configure => Some("configure.sh"),
            Self::None | Self::Done => None,
        }
    }

    /// Returns true for the stages that actually run scripts
    #[inline]
    pub const fn is_runnable(self) -> bool {
        matches!(self, Self::Prepare | Self::Install | Self::Configure)
    }
}

/// Outcome of a sequencing decision.
///
/// Ordered by priority: when several apply, the greatest wins
/// (`NoReturn` over `Retranslate` over `None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TransitionSignal {
    #[default]
    None,
    /// Language changed: every page except the language page must be rebuilt
    Retranslate,
    /// Backward navigation is forbidden from here on
    NoReturn,
}

impl TransitionSignal {
    /// Combine two signals keeping the higher priority one.
    #[inline]
    pub fn escalate(self, other: Self) -> Self {
        self.max(other)
    }
}

impl fmt::Display for TransitionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Retranslate => write!(f, "retranslate"),
            Self::NoReturn => write!(f, "no_return"),
        }
    }
}

/// A request to change the displayed page, published through the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRequest {
    /// Advance past `from`; `None` means "whatever is current"
    Next { from: Option<Step> },
    /// Show a step directly without sequencing (e.g. `failed`)
    Show(Step),
}
