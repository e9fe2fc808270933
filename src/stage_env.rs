//! Environment contract of the stage scripts.
//!
//! | Stage | Variables |
//! |---|---|
//! | install, configure | `OSI_DESKTOP`, `OSI_LOCALE`, `OSI_KEYBOARD_LAYOUT`, `OSI_DEVICE_PATH`, `OSI_DEVICE_IS_PARTITION`, `OSI_DEVICE_EFI_PARTITION`, `OSI_USE_ENCRYPTION`, `OSI_ENCRYPTION_PIN` |
//! | configure only | `OSI_USER_NAME`, `OSI_USER_USERNAME`, `OSI_USER_AUTOLOGIN`, `OSI_USER_PASSWORD`, `OSI_FORMATS`, `OSI_TIMEZONE`, `OSI_ADDITIONAL_SOFTWARE`, `OSI_ADDITIONAL_FEATURES` |
//!
//! `prepare` gets no `OSI_*` variables.

use crate::config::{ConfigStore, Key};
use crate::script_traits::ScriptArgs;
use crate::types::Stage;

const INSTALL_VARS: [(&str, Key); 8] = [
    ("OSI_DESKTOP", Key::DesktopChosen),
    ("OSI_LOCALE", Key::Locale),
    ("OSI_KEYBOARD_LAYOUT", Key::KeyboardLayout),
    ("OSI_DEVICE_PATH", Key::Disk),
    ("OSI_DEVICE_IS_PARTITION", Key::DiskIsPartition),
    ("OSI_DEVICE_EFI_PARTITION", Key::DiskEfiPartition),
    ("OSI_USE_ENCRYPTION", Key::UseEncryption),
    ("OSI_ENCRYPTION_PIN", Key::EncryptionPin),
];

const CONFIGURE_VARS: [(&str, Key); 8] = [
    ("OSI_USER_NAME", Key::UserName),
    ("OSI_USER_USERNAME", Key::UserUsername),
    ("OSI_USER_AUTOLOGIN", Key::UserAutologin),
    ("OSI_USER_PASSWORD", Key::UserPassword),
    ("OSI_FORMATS", Key::Formats),
    ("OSI_TIMEZONE", Key::Timezone),
    ("OSI_ADDITIONAL_SOFTWARE", Key::SoftwareChoices),
    ("OSI_ADDITIONAL_FEATURES", Key::FeatureChoices),
];

/// Arguments of one stage script invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageScript {
    pub stage: Stage,
    pub env: Vec<(String, String)>,
}

impl StageScript {
    /// Build the invocation for `stage` from the current store contents.
    pub fn from_config(config: &ConfigStore, stage: Stage) -> Self {
        Self {
            stage,
            env: create_envs(config, stage),
        }
    }
}

impl ScriptArgs for StageScript {
    fn to_cli_args(&self) -> Vec<String> {
        Vec::new()
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        self.env.clone()
    }

    fn script_name(&self) -> &'static str {
        self.stage.script_name().unwrap_or_default()
    }
}

/// Value of a required variable. Missing values are a configuration
/// defect: logged and replaced by an empty string, except in test mode
/// where fallback values are used silently.
fn required(config: &ConfigStore, key: Key) -> String {
    if !config.has(key) && !config.get_bool(Key::TestMode) {
        log::warn!(
            "Required variable {} not set, using empty string fallback. Please report this error.",
            key
        );
        return String::new();
    }
    config.get_text(key)
}

/// Derive a login name from a full name.
///
/// Sticks to common Linux username rules: starts with a lowercase letter and
/// only contains lowercase letters, digits, `_` and `-`. Falls back to
/// `user` if nothing usable is left.
pub fn derive_username(full_name: &str) -> String {
    let filtered: String = full_name
        .chars()
        .filter(char::is_ascii)
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_')
        .collect();

    match filtered.find(|c: char| c.is_ascii_lowercase()) {
        Some(start) => filtered[start..].to_string(),
        None => "user".to_string(),
    }
}

fn username(config: &ConfigStore) -> String {
    let username = required(config, Key::UserUsername);
    if !username.is_empty() {
        return username;
    }
    let full_name = config.get_text(Key::UserName);
    if full_name.trim().is_empty() {
        return username;
    }
    let derived = derive_username(&full_name);
    log::info!("No username chosen, derived \"{}\" from full name", derived);
    derived
}

/// Environment variables for a stage script.
pub fn create_envs(config: &ConfigStore, stage: Stage) -> Vec<(String, String)> {
    let with_configure = stage == Stage::Configure;
    let with_install = stage == Stage::Install || with_configure;

    let mut envs = Vec::new();
    if with_install {
        envs.extend(
            INSTALL_VARS
                .iter()
                .map(|(name, key)| (name.to_string(), required(config, *key))),
        );
    }
    if with_configure {
        envs.extend(CONFIGURE_VARS.iter().map(|(name, key)| {
            let value = match key {
                Key::UserUsername => username(config),
                _ => required(config, *key),
            };
            (name.to_string(), value)
        }));
    }
    envs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::choices::parse_choices;
    use crate::config::Value;
    use crate::config_file::InstallerConfig;
    use serde_json::json;

    fn lookup<'a>(envs: &'a [(String, String)], name: &str) -> Option<&'a str> {
        envs.iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    #[test]
    fn test_prepare_has_no_variables() {
        let config = ConfigStore::default();
        assert!(create_envs(&config, Stage::Prepare).is_empty());
    }

    #[test]
    fn test_install_and_configure_variable_sets() {
        let config = ConfigStore::default();
        let install = create_envs(&config, Stage::Install);
        let configure = create_envs(&config, Stage::Configure);
        assert_eq!(install.len(), 8);
        assert_eq!(configure.len(), 16);
        assert!(lookup(&install, "OSI_USER_NAME").is_none());
        assert!(lookup(&configure, "OSI_ADDITIONAL_FEATURES").is_some());
    }

    #[test]
    fn test_values_are_serialized_for_scripts() {
        let config = ConfigStore::default();
        config.set(Key::Disk, Value::pair("/dev/sda", "Samsung SSD"));
        config.set(Key::DiskIsPartition, Value::Bool(false));
        config.set(Key::UseEncryption, Value::Bool(true));
        config.set(Key::Locale, Value::text("de_DE.UTF-8"));
        config.set(
            Key::SoftwareChoices,
            Value::Choices(parse_choices(&[
                json!({"name": "Firefox", "keyword": "firefox", "suggested": true}),
                json!({"name": "GIMP", "keyword": "gimp"}),
                json!({"name": "Shell", "options": [{"option": "zsh"}]}),
            ])),
        );

        let envs = create_envs(&config, Stage::Configure);
        assert_eq!(lookup(&envs, "OSI_DEVICE_PATH"), Some("/dev/sda"));
        assert_eq!(lookup(&envs, "OSI_DEVICE_IS_PARTITION"), Some("0"));
        assert_eq!(lookup(&envs, "OSI_USE_ENCRYPTION"), Some("1"));
        assert_eq!(lookup(&envs, "OSI_LOCALE"), Some("de_DE.UTF-8"));
        assert_eq!(lookup(&envs, "OSI_FORMATS"), Some("en_US.UTF-8"));
        assert_eq!(lookup(&envs, "OSI_ADDITIONAL_SOFTWARE"), Some("firefox zsh"));
    }

    #[test]
    fn test_missing_values_become_empty_outside_test_mode() {
        let config = ConfigStore::default();
        let envs = create_envs(&config, Stage::Install);
        assert_eq!(lookup(&envs, "OSI_DEVICE_PATH"), Some(""));

        let settings = InstallerConfig {
            test_mode: true,
            ..InstallerConfig::default()
        };
        let config = ConfigStore::new(settings);
        let envs = create_envs(&config, Stage::Install);
        assert_eq!(lookup(&envs, "OSI_DEVICE_PATH"), Some("/dev/null"));
        assert_eq!(lookup(&envs, "OSI_KEYBOARD_LAYOUT"), Some("us"));
    }

    #[test]
    fn test_username_derivation() {
        assert_eq!(derive_username("Ada Lovelace"), "adalovelace");
        assert_eq!(derive_username("  42 Jean-Luc_P"), "jean-luc_p");
        assert_eq!(derive_username("Zoë"), "zo");
        assert_eq!(derive_username("1234"), "user");
        assert_eq!(derive_username("李小龍"), "user");
    }

    #[test]
    fn test_username_falls_back_to_full_name() {
        let config = ConfigStore::default();
        config.set(Key::UserName, Value::text("Grace Hopper"));
        let envs = create_envs(&config, Stage::Configure);
        assert_eq!(lookup(&envs, "OSI_USER_USERNAME"), Some("gracehopper"));

        config.set(Key::UserUsername, Value::text("grace"));
        let envs = create_envs(&config, Stage::Configure);
        assert_eq!(lookup(&envs, "OSI_USER_USERNAME"), Some("grace"));
    }

    #[test]
    fn test_stage_script_args() {
        let config = ConfigStore::default();
        let script = StageScript::from_config(&config, Stage::Install);
        assert_eq!(script.script_name(), "install.sh");
        assert!(script.to_cli_args().is_empty());
        assert_eq!(script.get_env_vars().len(), 8);
    }
}
