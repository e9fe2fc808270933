//! os-installer flow core
//!
//! Page sequencing, stage gating and script execution for a guided operating
//! system installer. Front ends drive a [`Navigator`]; stage scripts are run
//! by the [`StageRunner`]; both communicate through the [`ConfigStore`].

pub mod choices;
pub mod cli;
pub mod config;
pub mod config_file;
pub mod connectivity;
pub mod desktop;
pub mod disk;
pub mod error;
pub mod headless;
pub mod install_state;
pub mod navigation;
pub mod output;
pub mod preload;
pub mod process_guard;
pub mod script_runner;
pub mod script_traits;
pub mod sequencer;
pub mod stage_env;
pub mod types;

// Re-export main types for convenience
pub use config::{ConfigStore, Key, Subscription, SubscriptionId, Value};
pub use config_file::InstallerConfig;
pub use error::{OsiError, Result};
pub use headless::{Answers, FlowOutcome, HeadlessDriver};
pub use install_state::{GateState, GateTransitionError};
pub use navigation::{LoggingPageFactory, Navigator, PageFactory};
pub use output::{LogSink, OutputSink, StdoutSink, TerminalSink};
pub use preload::Preload;
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use script_runner::{ProcessSpawner, ScriptSpawner, StageGate, StageRunner};
pub use script_traits::ScriptArgs;
pub use sequencer::{ActiveSteps, PageSequencer};
pub use types::{PageRequest, Stage, Step, TransitionSignal, CANONICAL_ORDER};
