//! End-to-end tests of the unattended installation flow
//!
//! Runs the headless driver over demo disks and real stage scripts in a
//! temporary directory.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use os_installer::config::{ConfigStore, Key};
use os_installer::config_file::InstallerConfig;
use os_installer::disk::DemoDiskSource;
use os_installer::headless::{Answers, FlowOutcome, HeadlessDriver};
use os_installer::output::LogSink;
use os_installer::process_guard::ChildRegistry;
use os_installer::script_runner::{FINISHED_NOTIFICATION, ProcessSpawner, StageRunner};
use os_installer::types::{Stage, Step};

struct Flow {
    config: ConfigStore,
    runner: StageRunner,
    driver: HeadlessDriver,
}

fn flow(settings: InstallerConfig, scripts_dir: &Path, answers: Answers) -> Flow {
    let config = ConfigStore::new(settings);
    let registry = Arc::new(Mutex::new(ChildRegistry::default()));
    let spawner = ProcessSpawner::new(Arc::new(LogSink)).with_registry(registry);
    let runner = StageRunner::new(config.clone(), scripts_dir, Arc::new(spawner));
    let driver = HeadlessDriver::new(config.clone(), &runner, Arc::new(DemoDiskSource), answers)
        .unwrap()
        .step_timeout(Duration::from_secs(30));
    Flow {
        config,
        runner,
        driver,
    }
}

fn offline_settings() -> InstallerConfig {
    InstallerConfig {
        internet_connection_required: false,
        ..InstallerConfig::default()
    }
}

/// Write the three stage scripts, each appending its name and one variable
/// to `stages.log`. `install_exit` is the exit code of the install script.
fn write_scripts(dir: &Path, install_exit: i32) -> std::path::PathBuf {
    let log = dir.join("stages.log");
    let scripts = [
        ("prepare.sh", "prepare".to_string(), 0),
        ("install.sh", "install $OSI_DEVICE_PATH".to_string(), install_exit),
        ("configure.sh", "configure $OSI_USER_USERNAME".to_string(), 0),
    ];
    for (name, line, code) in scripts {
        let body = format!("echo \"{}\" >> \"{}\"\nexit {}\n", line, log.display(), code);
        fs::write(dir.join(name), body).unwrap();
    }
    log
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn test_unattended_install_completes() {
    let dir = TempDir::new().unwrap();
    let log = write_scripts(dir.path(), 0);
    let answers = Answers {
        disk: Some("/dev/sda".to_string()),
        user_name: Some("Jane Doe".to_string()),
        locale: Some("de_DE.UTF-8".to_string()),
        ..Answers::default()
    };

    let mut flow = flow(offline_settings(), dir.path(), answers);
    assert_eq!(flow.driver.run().unwrap(), FlowOutcome::Completed);

    assert_eq!(
        read_lines(&log),
        vec!["prepare", "install /dev/sda", "configure janedoe"]
    );
    assert_eq!(flow.driver.navigator().current(), Some(Step::Done));
    assert!(!flow.driver.navigator().can_go_back());
    assert!(flow.runner.state().is_complete());
    assert!(!flow.config.get_bool(Key::InstallationRunning));
    assert_eq!(flow.config.get_text(Key::SendNotification), FINISHED_NOTIFICATION);
    assert_eq!(flow.config.get_text(Key::Locale), "de_DE.UTF-8");
    assert_eq!(flow.config.get_text(Key::DiskEfiPartition), "/dev/sda_efi");
}

#[test]
fn test_failing_install_ends_on_failed_page() {
    let dir = TempDir::new().unwrap();
    let log = write_scripts(dir.path(), 1);

    let mut flow = flow(offline_settings(), dir.path(), Answers::default());
    assert_eq!(flow.driver.run().unwrap(), FlowOutcome::Failed);

    assert_eq!(flow.driver.navigator().current(), Some(Step::Failed));
    let state = flow.runner.state();
    assert!(state.is_failed());
    assert_eq!(state.finished(), Stage::Install);
    assert!(!read_lines(&log).iter().any(|line| line.starts_with("configure")));
    assert!(flow.driver.navigator().can_quit());
}

#[test]
fn test_demo_mode_skips_connectivity_and_tolerates_failure() {
    let dir = TempDir::new().unwrap();
    let log = write_scripts(dir.path(), 1);
    let settings = InstallerConfig {
        demo_mode: true,
        ..InstallerConfig::default()
    };

    let mut flow = flow(settings, dir.path(), Answers::default());
    assert!(flow.driver.navigator().sequencer().active().contains(Step::Internet));
    assert_eq!(flow.driver.run().unwrap(), FlowOutcome::Completed);

    assert!(flow.config.get_bool(Key::InternetConnection));
    assert_eq!(read_lines(&log).len(), 3);
}

#[test]
fn test_flow_without_scripts() {
    let dir = TempDir::new().unwrap();
    let mut flow = flow(offline_settings(), dir.path(), Answers::default());
    assert!(!flow.driver.navigator().sequencer().active().contains(Step::Confirm));

    assert_eq!(flow.driver.run().unwrap(), FlowOutcome::Completed);
    assert_eq!(flow.runner.state().finished(), Stage::Configure);
    // First disk large enough is picked
    assert_eq!(flow.config.get_text(Key::Disk), "/dev/sda");
}

#[test]
fn test_unknown_disk_answer_is_an_error() {
    let dir = TempDir::new().unwrap();
    let answers = Answers {
        disk: Some("/dev/does-not-exist".to_string()),
        ..Answers::default()
    };
    let mut flow = flow(offline_settings(), dir.path(), answers);
    assert!(flow.driver.run().is_err());
}

#[test]
fn test_too_small_disk_answer_is_an_error() {
    let dir = TempDir::new().unwrap();
    let answers = Answers {
        disk: Some("/dev/null".to_string()),
        ..Answers::default()
    };
    let mut flow = flow(offline_settings(), dir.path(), answers);
    let err = flow.driver.run().unwrap_err();
    assert!(format!("{:#}", err).contains("too small"));
}

#[test]
fn test_answers_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("answers.json");
    fs::write(
        &path,
        r#"{"disk": "/dev/sda", "partition": "/dev/sda_yes", "software": ["gimp"]}"#,
    )
    .unwrap();

    let answers = Answers::load_from_file(&path).unwrap();
    assert_eq!(answers.partition.as_deref(), Some("/dev/sda_yes"));
    assert_eq!(answers.software, Some(vec!["gimp".to_string()]));
    assert_eq!(answers.features, None);

    fs::write(&path, r#"{"disk": 3}"#).unwrap();
    assert!(Answers::load_from_file(&path).is_err());
}
