use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config_file::{InstallerConfig, DEFAULT_CONFIG_PATH};
use crate::script_runner::DEFAULT_SCRIPTS_DIR;

/// os-installer - guided operating system installation
#[derive(Parser, Debug)]
#[command(name = "os-installer")]
#[command(about = "Installation flow controller running distribution provided install scripts")]
#[command(version)]
pub struct Cli {
    /// Demo mode: script failures are ignored and fake disks are offered.
    ///
    /// Takes precedence over test mode.
    #[arg(long, global = true)]
    pub demo_mode: bool,

    /// Test mode: missing values fall back to dummy values silently.
    #[arg(long, global = true)]
    pub test_mode: bool,

    /// Installer configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Directory holding prepare.sh, install.sh and configure.sh
    #[arg(long, global = true, default_value = DEFAULT_SCRIPTS_DIR)]
    pub scripts_dir: PathBuf,

    /// Log debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the installation flow unattended
    Run {
        /// JSON file with preset answers for every step
        #[arg(short, long)]
        answers: Option<PathBuf>,

        /// Maximum seconds to wait on a single step
        #[arg(long, default_value_t = 3600)]
        step_timeout: u64,
    },
    /// List the steps this configuration shows
    Steps,
    /// Validate a configuration file
    Validate {
        /// Configuration file, defaults to --config
        config: Option<PathBuf>,
    },
    /// Print the environment a stage script would receive
    Env {
        /// Stage name: prepare, install or configure
        stage: String,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }

    /// Apply the mode flags on top of a loaded configuration. Demo mode
    /// wins when both are given.
    pub fn apply_modes(&self, settings: &mut InstallerConfig) {
        if self.demo_mode {
            settings.demo_mode = true;
        } else if self.test_mode {
            settings.test_mode = true;
        }
        if settings.demo_mode && settings.test_mode {
            log::info!("Both demo and test mode set, using demo mode");
            settings.test_mode = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_no_args() {
        let cli = Cli::try_parse_from(["os-installer"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(cli.scripts_dir, PathBuf::from(DEFAULT_SCRIPTS_DIR));
    }

    #[test]
    fn test_cli_run_with_answers() {
        let cli = Cli::try_parse_from([
            "os-installer",
            "run",
            "--answers",
            "/tmp/answers.json",
            "--scripts-dir",
            "/tmp/scripts",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Run { answers, step_timeout }) => {
                assert_eq!(answers, Some(PathBuf::from("/tmp/answers.json")));
                assert_eq!(step_timeout, 3600);
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(cli.scripts_dir, PathBuf::from("/tmp/scripts"));
    }

    #[test]
    fn test_cli_validate_command() {
        let cli = Cli::try_parse_from(["os-installer", "validate", "/path/to/config.yaml"]).unwrap();
        match cli.command {
            Some(Commands::Validate { config }) => {
                assert_eq!(config, Some(PathBuf::from("/path/to/config.yaml")));
            }
            _ => panic!("Expected Validate command"),
        }
    }

    #[test]
    fn test_cli_env_command() {
        let cli = Cli::try_parse_from(["os-installer", "--test-mode", "env", "install"]).unwrap();
        assert!(cli.test_mode);
        assert!(matches!(cli.command, Some(Commands::Env { stage }) if stage == "install"));
    }

    #[test]
    fn test_demo_mode_wins() {
        let cli = Cli::try_parse_from(["os-installer", "--demo-mode", "--test-mode", "steps"]).unwrap();
        let mut settings = InstallerConfig::default();
        cli.apply_modes(&mut settings);
        assert!(settings.demo_mode);
        assert!(!settings.test_mode);

        let mut settings = InstallerConfig {
            demo_mode: true,
            test_mode: true,
            ..InstallerConfig::default()
        };
        Cli::try_parse_from(["os-installer"]).unwrap().apply_modes(&mut settings);
        assert!(!settings.test_mode);
    }
}
