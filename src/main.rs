//! os-installer - Main entry point
//!
//! Runs the installation flow unattended and offers a few inspection
//! commands for distribution maintainers.

use std::path::Path;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};

use os_installer::cli::{Cli, Commands};
use os_installer::config::{ConfigStore, Key};
use os_installer::config_file::InstallerConfig;
use os_installer::disk::{DemoDiskSource, DiskSource, LsblkDiskSource};
use os_installer::headless::{Answers, FlowOutcome, HeadlessDriver};
use os_installer::output::StdoutSink;
use os_installer::process_guard::{self, ProcessGuard};
use os_installer::script_runner::{ProcessSpawner, StageRunner};
use os_installer::sequencer::ActiveSteps;
use os_installer::stage_env::create_envs;
use os_installer::types::Stage;

/// Initialize logging. `log` records from the library are bridged into the
/// tracing subscriber.
fn init_logger(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
    {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

/// Load the configuration and apply the command line mode flags.
fn load_settings(cli: &Cli, path: &Path) -> InstallerConfig {
    let mut settings = InstallerConfig::load_or_default(path);
    cli.apply_modes(&mut settings);
    settings
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_logger(cli.verbose);
    debug!("CLI arguments parsed: {:?}", cli);

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    match &cli.command {
        Some(Commands::Validate { config }) => {
            let path = config.as_deref().unwrap_or(cli.config.as_path());
            validate(path)
        }
        Some(Commands::Steps) => {
            let settings = load_settings(cli, &cli.config);
            for step in ActiveSteps::from_config(&settings, &cli.scripts_dir).steps() {
                println!("{}", step);
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Env { stage }) => {
            let stage = Stage::from_str(stage)
                .ok()
                .filter(|stage| stage.is_runnable())
                .with_context(|| format!("Unknown stage \"{}\"", stage))?;
            let config = ConfigStore::new(load_settings(cli, &cli.config));
            for (name, value) in create_envs(&config, stage) {
                println!("{}={}", name, value);
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Run { answers, step_timeout }) => {
            run_flow(cli, answers.as_deref(), Duration::from_secs(*step_timeout))
        }
        None => run_flow(cli, None, Duration::from_secs(3600)),
    }
}

fn validate(path: &Path) -> Result<ExitCode> {
    info!("Validating configuration file: {:?}", path);
    let config = InstallerConfig::load_from_file(path)?;
    match config.validate() {
        Ok(()) => {
            println!("✓ Configuration file is valid: {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run_flow(cli: &Cli, answers: Option<&Path>, step_timeout: Duration) -> Result<ExitCode> {
    // Scripts must not outlive us, whatever way we exit
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    let _guard = ProcessGuard::new();

    let answers = match answers {
        Some(path) => Answers::load_from_file(path)?,
        None => Answers::default(),
    };

    let settings = load_settings(cli, &cli.config);
    let _span = tracing::info_span!("flow", distribution = %settings.distribution_name).entered();
    info!(
        "Installing {} (demo mode: {}, test mode: {})",
        settings.distribution_name, settings.demo_mode, settings.test_mode
    );
    let disk_source: Arc<dyn DiskSource> = if settings.demo_mode || settings.test_mode {
        Arc::new(DemoDiskSource)
    } else {
        Arc::new(LsblkDiskSource)
    };

    let config = ConfigStore::new(settings);
    let _notifications = config.subscribe_delayed(Key::SendNotification, |text| {
        info!("Notification: {}", text);
    });

    let spawner = Arc::new(ProcessSpawner::new(Arc::new(StdoutSink)));
    let runner = StageRunner::new(config.clone(), &cli.scripts_dir, spawner);
    let mut driver =
        HeadlessDriver::new(config, &runner, disk_source, answers)?.step_timeout(step_timeout);

    let outcome = driver.run()?;
    info!("Flow ended: {:?} ({})", outcome, runner.state());
    Ok(match outcome {
        FlowOutcome::Completed => {
            println!("✓ Installation finished");
            ExitCode::SUCCESS
        }
        FlowOutcome::Failed => {
            eprintln!("✗ Installation failed");
            ExitCode::from(1)
        }
        FlowOutcome::Stalled(step) => {
            eprintln!("✗ Installation stalled at step {}", step);
            ExitCode::from(2)
        }
    })
}
