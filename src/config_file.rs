//! Installer configuration file handling.
//!
//! The distribution ships a YAML file describing which steps to offer and how.
//! Loading is lenient: unknown keys are ignored, nested tables merge over the
//! defaults, and a broken file falls back to the default configuration so
//! the flow always stays usable.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;

use crate::error::OsiError;

/// Default location of the installer configuration
pub const DEFAULT_CONFIG_PATH: &str = "/etc/os-installer/config.yaml";

const GIGABYTE_FACTOR: u64 = 1000 * 1000 * 1000;

/// Either `false` (language selection offered) or a fixed language code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FixedLanguage {
    Flag(bool),
    Code(String),
}

impl Default for FixedLanguage {
    fn default() -> Self {
        Self::Flag(false)
    }
}

impl FixedLanguage {
    /// The fixed language code, if one is configured.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Code(code) if !code.trim().is_empty() => Some(code.trim()),
            Self::Code(_) | Self::Flag(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WelcomePage {
    pub usage: bool,
    pub logo: Option<String>,
    pub text: Option<String>,
}

impl Default for WelcomePage {
    fn default() -> Self {
        Self {
            usage: true,
            logo: None,
            text: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskEncryption {
    pub offered: bool,
    pub forced: bool,
    pub min_length: u32,
    pub confirmation: bool,
}

impl Default for DiskEncryption {
    fn default() -> Self {
        Self {
            offered: true,
            forced: false,
            min_length: 1,
            confirmation: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    pub min_password_length: u32,
    pub request_username: bool,
    pub provide_autologin: bool,
    pub password_confirmation: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            min_password_length: 1,
            request_username: false,
            provide_autologin: false,
            password_confirmation: false,
        }
    }
}

/// Installer configuration as written by the distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    // General
    pub distribution_name: String,
    pub demo_mode: bool,
    pub test_mode: bool,

    // Internet
    pub internet_connection_required: bool,
    pub internet_checker_url: String,

    // Language
    pub suggested_languages: Vec<String>,
    pub fixed_language: FixedLanguage,

    pub welcome_page: WelcomePage,

    // Disk, size in GB
    pub minimum_disk_size: u64,
    pub disk_encryption: DiskEncryption,

    // Raw entries, parsed by the desktop and choices providers
    pub desktop: Vec<Value>,

    pub user: UserSettings,

    // Optional steps
    pub skip_user: bool,
    pub skip_locale: bool,

    pub additional_software: Vec<Value>,
    pub additional_features: Vec<Value>,

    // Failure help, `{}` is replaced by the installer version
    pub failure_help_url: String,

    // External commands
    pub browser_cmd: String,
    pub disks_cmd: String,
    pub wifi_cmd: String,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            distribution_name: "Untitled".to_string(),
            demo_mode: false,
            test_mode: false,
            internet_connection_required: true,
            internet_checker_url: "http://nmcheck.gnome.org/check_network_status.txt".to_string(),
            suggested_languages: ["en", "ar", "de", "es", "fr", "ja", "ru", "zh"]
                .iter()
                .map(|lang| lang.to_string())
                .collect(),
            fixed_language: FixedLanguage::default(),
            welcome_page: WelcomePage::default(),
            minimum_disk_size: 5,
            disk_encryption: DiskEncryption::default(),
            desktop: Vec::new(),
            user: UserSettings::default(),
            skip_user: false,
            skip_locale: false,
            additional_software: Vec::new(),
            additional_features: Vec::new(),
            failure_help_url:
                "https://duckduckgo.com/?q=\"os-installer {}\"+\"failed installation\"".to_string(),
            browser_cmd: "epiphany".to_string(),
            disks_cmd: "gnome-disks".to_string(),
            wifi_cmd: "gnome-control-center wifi".to_string(),
        }
    }
}

impl InstallerConfig {
    /// Load configuration from a YAML file.
    ///
    /// Unknown keys are dropped with a warning and deprecated keys are
    /// translated before deserialization.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML text.
    ///
    /// The document is read into a generic tree first, so unknown keys can
    /// be dropped before the typed pass.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let raw: Value =
            serde_yaml::from_str(content).context("Failed to parse configuration YAML")?;
        let Value::Object(entries) = raw else {
            anyhow::bail!("Configuration must be a YAML mapping");
        };

        let known = serde_json::to_value(Self::default())?;
        let known = known.as_object().cloned().unwrap_or_default();

        let mut accepted = serde_json::Map::new();
        for (key, value) in entries {
            if key == "offer_disk_encryption" {
                log::warn!(
                    "Developer hint: \"offer_disk_encryption\" is deprecated, use \"disk_encryption\" instead"
                );
                let offered = value.as_bool().unwrap_or(false);
                let encryption = DiskEncryption {
                    offered,
                    ..DiskEncryption::default()
                };
                accepted.insert("disk_encryption".to_string(), serde_json::to_value(encryption)?);
            } else if known.contains_key(&key) {
                accepted.insert(key, value);
            } else {
                log::warn!("Ignoring unknown config for \"{}\"", key);
            }
        }

        serde_json::from_value(Value::Object(accepted))
            .context("Configuration contains values of unexpected type")
    }

    /// Load and validate, falling back to defaults on any problem.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let config = match Self::load_from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                log::error!(
                    "Error loading config: {:#}. Check if the config contains syntax errors.",
                    e
                );
                return Self::default();
            }
        };

        match config.validate() {
            Ok(()) => config,
            Err(e) => {
                log::error!("Config errors, loading default config: {}", e);
                Self::default()
            }
        }
    }

    /// Validate semantic constraints serde cannot express.
    pub fn validate(&self) -> std::result::Result<(), OsiError> {
        if self.fixed_language == FixedLanguage::Flag(true) {
            return Err(OsiError::config(
                "Need to specify or disable fixed language",
            ));
        }
        if self.internet_connection_required && self.internet_checker_url.trim().is_empty() {
            return Err(OsiError::config(
                "internet_checker_url is required when a connection is required",
            ));
        }
        if self.distribution_name.trim().is_empty() {
            return Err(OsiError::config("distribution_name must not be empty"));
        }
        Ok(())
    }

    /// Minimum disk size in bytes.
    pub fn minimum_disk_size_bytes(&self) -> u64 {
        self.minimum_disk_size.saturating_mul(GIGABYTE_FACTOR)
    }

    /// Search URL offered on the failure page.
    pub fn failure_help_url(&self, version: &str) -> String {
        self.failure_help_url.replacen("{}", version, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_nested_table_merges_over_defaults() {
        let config = InstallerConfig::from_yaml_str(
            "distribution_name: Demo OS\nuser:\n  request_username: true\n",
        )
        .unwrap();
        assert_eq!(config.distribution_name, "Demo OS");
        assert!(config.user.request_username);
        assert_eq!(config.user.min_password_length, 1);
        assert!(config.internet_connection_required);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let config = InstallerConfig::from_yaml_str("no_such_key: 3\nskip_user: true\n").unwrap();
        assert!(config.skip_user);
    }

    #[test]
    fn test_legacy_encryption_flag() {
        let config = InstallerConfig::from_yaml_str("offer_disk_encryption: false\n").unwrap();
        assert!(!config.disk_encryption.offered);
        assert_eq!(config.disk_encryption.min_length, 1);
    }

    #[test]
    fn test_fixed_language_variants() {
        let config = InstallerConfig::from_yaml_str("fixed_language: de\n").unwrap();
        assert_eq!(config.fixed_language.code(), Some("de"));
        assert!(config.validate().is_ok());

        let config = InstallerConfig::from_yaml_str("fixed_language: true\n").unwrap();
        assert!(config.validate().is_err());
        assert_eq!(config.fixed_language.code(), None);
    }

    #[test]
    fn test_choice_lists_stay_raw() {
        let config = InstallerConfig::from_yaml_str(
            "additional_software:\n  - name: Firefox\n    keyword: firefox\n    suggested: true\n",
        )
        .unwrap();
        assert_eq!(config.additional_software.len(), 1);
        assert_eq!(config.additional_software[0]["keyword"], "firefox");
        assert_eq!(config.additional_software[0]["suggested"], true);
    }

    #[test]
    fn test_wrong_type_is_an_error() {
        assert!(InstallerConfig::from_yaml_str("skip_user: [1]\n").is_err());
        assert!(InstallerConfig::from_yaml_str("- 1\n- 2\n").is_err());
    }

    #[test]
    fn test_load_or_default_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not: [yaml").unwrap();
        assert_eq!(
            InstallerConfig::load_or_default(file.path()),
            InstallerConfig::default()
        );

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "fixed_language: true\nskip_locale: true\n").unwrap();
        assert_eq!(
            InstallerConfig::load_or_default(file.path()),
            InstallerConfig::default()
        );

        let missing = InstallerConfig::load_or_default("/nonexistent/os-installer.yaml");
        assert_eq!(missing, InstallerConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "distribution_name: Demo OS\nminimum_disk_size: 20\n").unwrap();
        let config = InstallerConfig::load_or_default(file.path());
        assert_eq!(config.distribution_name, "Demo OS");
        assert_eq!(config.minimum_disk_size_bytes(), 20_000_000_000);
    }

    #[test]
    fn test_derived_values() {
        let config = InstallerConfig::default();
        assert_eq!(config.minimum_disk_size_bytes(), 5_000_000_000);
        assert!(config.failure_help_url("0.4").contains("os-installer 0.4"));
    }
}
