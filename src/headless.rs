//! Unattended installation driver
//!
//! Walks the whole flow without a front end: every step takes its value from
//! an [`Answers`] file (or keeps the default) and advances. The internet step
//! waits for connectivity and the install step waits for the stage scripts,
//! exactly as the interactive flow would.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::choices::{Choice, ChoiceKind};
use crate::config::{ConfigStore, Key, Value};
use crate::connectivity;
use crate::desktop::Desktop;
use crate::disk::{self, Disk, DiskSource, FirmwareMode, PartitionAvailability};
use crate::error::OsiError;
use crate::navigation::{LoggingPageFactory, Navigator};
use crate::preload::{self, ChoiceSets, Preload};
use crate::script_runner::StageRunner;
use crate::sequencer::{ActiveSteps, PageSequencer};
use crate::types::Step;

/// Preset answers for an unattended run. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Answers {
    pub language: Option<String>,
    pub keyboard_layout: Option<String>,
    /// Device path of the target disk, defaults to the first that fits
    pub disk: Option<String>,
    /// Device path of a partition of the target disk
    pub partition: Option<String>,
    pub use_encryption: Option<bool>,
    pub encryption_pin: Option<String>,
    /// Keyword of the desktop
    pub desktop: Option<String>,
    pub user_name: Option<String>,
    pub user_username: Option<String>,
    pub user_password: Option<String>,
    pub user_autologin: Option<bool>,
    pub locale: Option<String>,
    pub formats: Option<String>,
    pub timezone: Option<String>,
    /// Keywords to select, `None` keeps the suggested selection
    pub software: Option<Vec<String>>,
    pub features: Option<Vec<String>>,
}

impl Answers {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read answers from {:?}", path.as_ref()))?;
        serde_json::from_str(&content).context("Failed to parse answers JSON")
    }
}

/// How an unattended run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOutcome {
    Completed,
    Failed,
    /// Waited too long on the given step
    Stalled(Step),
}

/// Apply a keyword selection to parsed choices.
///
/// Toggle choices are selected exactly when their keyword is listed; option
/// choices switch to the first listed option and keep their selection
/// otherwise.
pub fn apply_selection(choices: &[Choice], keywords: &[String]) -> Vec<Choice> {
    let listed = |keyword: &str| keywords.iter().any(|k| k == keyword);
    choices
        .iter()
        .cloned()
        .map(|mut choice| {
            match &choice.kind {
                ChoiceKind::Toggle { keyword, .. } => {
                    let selected = listed(keyword);
                    choice.set_selected(selected);
                }
                ChoiceKind::Options { options, .. } => {
                    let index = options.iter().position(|option| listed(&option.keyword));
                    if let Some(index) = index {
                        choice.select_option(index);
                    }
                }
            }
            choice
        })
        .collect()
}

/// Drives the flow from the first step to `done` or `failed`.
pub struct HeadlessDriver {
    config: ConfigStore,
    navigator: Navigator<LoggingPageFactory>,
    answers: Answers,
    disk_source: Arc<dyn DiskSource>,
    disks: Preload<Vec<Disk>>,
    desktops: Preload<Vec<Desktop>>,
    choices: Preload<ChoiceSets>,
    step_timeout: Duration,
}

impl HeadlessDriver {
    /// Set up sequencing and navigation on top of `runner` and start the
    /// preloads.
    pub fn new(
        config: ConfigStore,
        runner: &StageRunner,
        disk_source: Arc<dyn DiskSource>,
        answers: Answers,
    ) -> Result<Self> {
        let active = ActiveSteps::from_config(config.settings(), runner.scripts_dir());
        log::info!(
            "Active steps: {}",
            active
                .steps()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        let choices = preload::preload_choices(&config);
        let desktops = preload::preload_desktops(&config);
        let disks = preload::preload_disks(Arc::clone(&disk_source));

        let sequencer = Arc::new(PageSequencer::new(active, Arc::new(runner.clone())));
        let navigator = Navigator::new(config.clone(), sequencer, LoggingPageFactory)?;

        Ok(Self {
            config,
            navigator,
            answers,
            disk_source,
            disks,
            desktops,
            choices,
            step_timeout: Duration::from_secs(3600),
        })
    }

    /// Longest wait on a single step (connectivity, stage scripts).
    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn navigator(&self) -> &Navigator<LoggingPageFactory> {
        &self.navigator
    }

    /// Run until the flow ends.
    pub fn run(&mut self) -> Result<FlowOutcome> {
        if self.navigator.sequencer().active().contains(Step::Internet) {
            if self.config.get_bool(Key::DemoMode) {
                self.config.set(Key::InternetConnection, Value::Bool(true));
            } else {
                connectivity::spawn_checker(&self.config);
            }
        }

        loop {
            self.navigator.pump();
            let Some(step) = self.navigator.current() else {
                anyhow::bail!("Navigation stack is empty");
            };
            log::info!("Step: {}", step);

            match step {
                Step::Done | Step::Restart => return Ok(FlowOutcome::Completed),
                Step::Failed => {
                    let version = self.config.get_text(Key::Version);
                    log::error!(
                        "Installation failed, help: {}",
                        self.config.settings().failure_help_url(&version)
                    );
                    return Ok(FlowOutcome::Failed);
                }
                Step::Internet => {
                    if !self.wait_for(step, |config| config.get_bool(Key::InternetConnection)) {
                        return Ok(FlowOutcome::Stalled(step));
                    }
                }
                Step::Install => {
                    if !self.wait_for_departure(step) {
                        return Ok(FlowOutcome::Stalled(step));
                    }
                    continue;
                }
                _ => self.answer(step)?,
            }

            // Display requests may have moved us, e.g. to the failure page
            self.navigator.pump();
            if self.navigator.current() == Some(step) {
                self.navigator.advance(Some(step));
            }
        }
    }

    /// Store the answer for `step`.
    fn answer(&self, step: Step) -> Result<()> {
        let config = &self.config;
        let answers = &self.answers;
        match step {
            Step::Language => {
                if let Some(language) = &answers.language {
                    config.set(Key::Language, Value::pair(language.clone(), language.clone()));
                }
            }
            Step::KeyboardOverview => {
                if let Some(layout) = &answers.keyboard_layout {
                    config.set(Key::KeyboardLayout, Value::pair(layout.clone(), layout.clone()));
                }
            }
            Step::Disk => {
                let disk = self.chosen_disk()?;
                disk::select_disk(config, &disk);
            }
            Step::Partition => {
                if let Some(path) = &answers.partition {
                    let disk = self.chosen_disk()?;
                    let exists = self.disk_source.disk_exists(&disk.info);
                    match disk::partition_availability(&disk, exists, FirmwareMode::detect()) {
                        PartitionAvailability::Available => {}
                        unavailable => anyhow::bail!(
                            "Partitions of {} cannot be used: {:?}",
                            disk.info.device_path,
                            unavailable
                        ),
                    }
                    let partition = disk
                        .partitions
                        .iter()
                        .find(|partition| &partition.device_path == path)
                        .with_context(|| format!("Partition {} not found on {}", path, disk.info.device_path))?;
                    disk::select_partition(config, &disk, partition);
                }
            }
            Step::Encrypt => {
                if let Some(use_encryption) = answers.use_encryption {
                    let forced = config.settings().disk_encryption.forced;
                    config.set(Key::UseEncryption, Value::Bool(use_encryption || forced));
                }
                if let Some(pin) = &answers.encryption_pin {
                    config.set(Key::EncryptionPin, Value::text(pin.clone()));
                }
            }
            Step::Desktop => {
                let desktops = self.desktops.wait();
                if let Some(keyword) = &answers.desktop {
                    if desktops.iter().any(|desktop| &desktop.keyword == keyword) {
                        config.set(Key::DesktopChosen, Value::text(keyword.clone()));
                    } else {
                        log::warn!("Desktop \"{}\" not offered, keeping default", keyword);
                    }
                }
            }
            Step::User => {
                let text_fields = [
                    (Key::UserName, &answers.user_name),
                    (Key::UserUsername, &answers.user_username),
                    (Key::UserPassword, &answers.user_password),
                ];
                for (key, value) in text_fields {
                    if let Some(value) = value {
                        config.set(key, Value::text(value.clone()));
                    }
                }
                if let Some(autologin) = answers.user_autologin {
                    config.set(Key::UserAutologin, Value::Bool(autologin));
                }
            }
            Step::Locale => {
                if let Some(locale) = &answers.locale {
                    config.set(Key::Locale, Value::text(locale.clone()));
                }
                if let Some(formats) = &answers.formats {
                    config.set(Key::Formats, Value::pair(formats.clone(), formats.clone()));
                }
                if let Some(timezone) = &answers.timezone {
                    config.set(Key::Timezone, Value::text(timezone.clone()));
                }
            }
            Step::Software | Step::Feature => {
                let sets = self.choices.wait();
                let (key, parsed, selection) = if step == Step::Software {
                    (Key::SoftwareChoices, &sets.software, &answers.software)
                } else {
                    (Key::FeatureChoices, &sets.features, &answers.features)
                };
                if let Some(keywords) = selection {
                    config.set(key, Value::Choices(apply_selection(parsed, keywords)));
                }
            }
            Step::Welcome | Step::Internet | Step::Confirm | Step::Summary => {}
            Step::Install | Step::Done | Step::Restart | Step::Failed => {}
        }
        Ok(())
    }

    fn chosen_disk(&self) -> Result<Disk> {
        let disks = self.disks.wait();
        let minimum = self.config.settings().minimum_disk_size_bytes();
        let disk = match &self.answers.disk {
            Some(path) => disks
                .iter()
                .find(|disk| &disk.info.device_path == path)
                .with_context(|| format!("Disk {} not found", path))?,
            None => disks
                .iter()
                .find(|disk| disk.info.fits(minimum))
                .context("No disk large enough for the installation")?,
        };
        if !disk.info.fits(minimum) {
            return Err(OsiError::validation(format!(
                "Disk {} is too small ({}, need {})",
                disk.info.device_path,
                disk.info.size_text,
                disk::size_to_text(minimum)
            ))
            .into());
        }
        Ok(disk.clone())
    }

    /// Wait until `ready` holds, applying display requests meanwhile.
    /// Returns false on timeout or when navigation moved elsewhere.
    fn wait_for(&mut self, step: Step, ready: impl Fn(&ConfigStore) -> bool) -> bool {
        let start = Instant::now();
        while !ready(&self.config) {
            if start.elapsed() > self.step_timeout {
                log::error!("Timed out waiting on {}", step);
                return false;
            }
            self.navigator.pump_timeout(Duration::from_millis(100));
            if self.navigator.current() != Some(step) {
                return true;
            }
        }
        true
    }

    /// Wait until navigation leaves `step`.
    fn wait_for_departure(&mut self, step: Step) -> bool {
        let start = Instant::now();
        while self.navigator.current() == Some(step) {
            if start.elapsed() > self.step_timeout {
                log::error!("Timed out waiting on {}", step);
                return false;
            }
            self.navigator.pump_timeout(Duration::from_millis(100));
        }
        true
    }
}
