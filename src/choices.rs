//! Additional software and feature choices.
//!
//! Config entries come in two shapes:
//!
//! ```yaml
//! - name: Firefox
//!   keyword: firefox
//!   suggested: true
//! - name: Office
//!   options:
//!     - option: libreoffice
//!       name: LibreOffice
//! ```
//!
//! Toggle choices contribute their keyword when selected; option choices
//! always contribute the keyword of the selected option.

use serde::Deserialize;
use serde_json::{Map, Value};

/// One selectable option of a multi-option choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoiceOption {
    pub display: String,
    pub keyword: String,
}

/// Selection state of a choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChoiceKind {
    Toggle { keyword: String, selected: bool },
    Options { options: Vec<ChoiceOption>, selected: usize },
}

/// A parsed software or feature choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub name: String,
    pub description: String,
    pub icon_path: String,
    pub kind: ChoiceKind,
}

impl Choice {
    /// Keyword this choice contributes to the install scripts, if any.
    pub fn selected_keyword(&self) -> Option<&str> {
        match &self.kind {
            ChoiceKind::Toggle { keyword, selected } => selected.then_some(keyword.as_str()),
            ChoiceKind::Options { options, selected } => {
                options.get(*selected).map(|option| option.keyword.as_str())
            }
        }
    }

    /// Set the state of a toggle choice. Ignored for option choices.
    pub fn set_selected(&mut self, value: bool) {
        if let ChoiceKind::Toggle { selected, .. } = &mut self.kind {
            *selected = value;
        }
    }

    /// Select an option by index. Out of range indices are ignored.
    pub fn select_option(&mut self, index: usize) {
        if let ChoiceKind::Options { options, selected } = &mut self.kind {
            if index < options.len() {
                *selected = index;
            } else {
                log::warn!("Option {} does not exist for {}", index, self.name);
            }
        }
    }
}

/// Space-joined keywords of all contributing choices.
pub fn keywords(choices: &[Choice]) -> String {
    choices
        .iter()
        .filter_map(Choice::selected_keyword)
        .collect::<Vec<_>>()
        .join(" ")
}

/// One option entry as written in the config.
#[derive(Debug, Deserialize)]
struct RawOption {
    option: String,
    #[serde(default)]
    name: Option<String>,
}

/// Entry shape, told apart by its keys.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawKind {
    Options {
        options: Vec<Value>,
    },
    Toggle {
        keyword: String,
        #[serde(default)]
        suggested: bool,
    },
}

/// A choice entry as written in the config.
#[derive(Debug, Deserialize)]
struct RawChoice {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    icon_path: String,
    #[serde(flatten)]
    kind: RawKind,
}

/// Rename the keys older configs used for `keyword`.
fn handle_legacy(entry: &mut Map<String, Value>) {
    for legacy in ["package", "feature"] {
        if let Some(value) = entry.remove(legacy) {
            log::warn!("Syntax changed! Use 'keyword' instead of '{}'", legacy);
            entry.insert("keyword".to_string(), value);
        }
    }
}

/// Parse the option list, dropping entries without an `option` keyword.
fn parse_options(name: &str, raw: Vec<Value>) -> Vec<ChoiceOption> {
    raw.into_iter()
        .filter_map(|value| match serde_json::from_value::<RawOption>(value.clone()) {
            Ok(option) => Some(ChoiceOption {
                display: option.name.unwrap_or_else(|| option.option.clone()),
                keyword: option.option,
            }),
            Err(e) => {
                log::warn!("Option for {} not correctly configured: {} ({})", name, value, e);
                None
            }
        })
        .collect()
}

fn parse_choice(raw: &Value) -> Option<Choice> {
    let Some(entry) = raw.as_object() else {
        log::warn!("Choice not correctly configured: {}", raw);
        return None;
    };
    let mut entry = entry.clone();
    handle_legacy(&mut entry);
    if entry.contains_key("options")
        && (entry.contains_key("keyword") || entry.contains_key("suggested"))
    {
        log::warn!(
            "Config of {}: Can't combine 'options' with 'keyword'/'suggested'",
            entry.get("name").unwrap_or(&Value::Null)
        );
        return None;
    }

    let choice: RawChoice = match serde_json::from_value(Value::Object(entry)) {
        Ok(choice) => choice,
        Err(e) => {
            log::warn!("Choice not correctly configured: {} ({})", raw, e);
            return None;
        }
    };

    let kind = match choice.kind {
        RawKind::Options { options } => {
            let options = parse_options(&choice.name, options);
            if options.is_empty() {
                log::warn!("No valid options found for {}", choice.name);
                return None;
            }
            ChoiceKind::Options {
                options,
                selected: 0,
            }
        }
        RawKind::Toggle { keyword, suggested } => ChoiceKind::Toggle {
            keyword,
            selected: suggested,
        },
    };

    Some(Choice {
        name: choice.name,
        description: choice.description,
        icon_path: choice.icon_path,
        kind,
    })
}

/// Parse raw config entries into choices, skipping malformed ones.
pub fn parse_choices(entries: &[Value]) -> Vec<Choice> {
    entries.iter().filter_map(parse_choice).collect()
}
